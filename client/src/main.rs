mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::{fs, io::Read};
use tracker::{wire, Task, TaskRecord};

use crate::cli::{Cli, Commands};

// "-" lee de stdin
fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("leyendo stdin")?;
        Ok(buf)
    } else {
        fs::read_to_string(source).with_context(|| format!("leyendo {source}"))
    }
}

fn print_task(task: &Task) {
    let summary = task.summary();
    println!("Tarea:");
    println!("  id: {}", task.id());
    println!("  job: {}", task.job_id());
    if let Some(desc) = task.description() {
        println!("  descripción: {desc}");
    }
    println!("  fragmentos: {}", summary.total);
    println!(
        "  pending={} working={} failure={} retrying={}",
        summary.pending, summary.working, summary.failure, summary.retrying
    );
    println!(
        "  success={} fatal={} ignored={}",
        summary.success, summary.fatal, summary.ignored
    );
    println!("  progreso: {:.1}%", summary.progress_pct());
    println!("  terminada: {}", task.is_done());
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Fragment { input, format } => {
            let text = if input == "-" { read_input("-")? } else { input };
            let wire_format = format.resolve(&text);
            let fragment = wire::parse_fragment(wire_format, &text)
                .with_context(|| format!("fragmento inválido ({wire_format})"))?;
            println!("{}", wire::to_json(&fragment)?);
        }
        Commands::Task { file } => {
            let text = read_input(&file)?;
            let record = TaskRecord::parse(&text).context("documento de tarea inválido")?;
            let extra = record.extra.clone();
            let task = record.into_task();

            print_task(&task);
            for (key, value) in extra {
                println!("  {key}: {value}");
            }
        }
        Commands::New {
            job,
            count,
            desc,
            extra,
        } => {
            let mut task = Task::new(job, count);
            if let Some(desc) = desc {
                task = task.with_description(desc);
            }

            let mut record = TaskRecord::from_task(&task).with_fragments(&task.fragments());
            for (key, value) in extra {
                record = record.with_extra(key, value);
            }
            println!("{}", record.to_json_pretty()?);
        }
    }

    Ok(())
}
