mod config;
mod metrics;
mod pool;
mod supervisor;

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, Notify};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracker::{Container, Fragment, NewTask};

use crate::config::Config;
use crate::pool::{Handler, Pool};
use crate::supervisor::Supervisor;

/// Trabajo simulado: duerme `work` y falla con probabilidad `fail_rate`.
fn simulated_handler(config: &Config) -> Handler {
    let work = config.work;
    let fail_rate = config.fail_rate;
    Arc::new(move |fragment: &Fragment| -> Result<()> {
        std::thread::sleep(work);
        if rand::thread_rng().gen_bool(fail_rate) {
            anyhow::bail!("fallo simulado en el fragmento {}", fragment.index());
        }
        Ok(())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=info,tracker=info")),
        )
        .init();

    let config = Config::from_env();

    // Nombre de host (solo para el tag de los fragmentos)
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let worker_id = format!("{}-{}", hostname, std::process::id());

    info!(?config, worker_id = %worker_id, "worker iniciando");

    let container = Container::new();

    let mut events = container.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(?event, "evento del contenedor"),
                Err(RecvError::Lagged(n)) => warn!(perdidos = n, "eventos del contenedor perdidos"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for n in 0..config.jobs {
        container.create_with(
            &config.group,
            NewTask::new(format!("job-{n}"), config.fragments)
                .description(format!("job simulado {n}")),
        );
    }

    let pool = Pool::new(container.clone(), &config, worker_id, simulated_handler(&config));
    let supervisor = Supervisor::new(container.clone(), &config, pool.metrics());

    let shutdown = Arc::new(Notify::new());
    let supervisor_handle = tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move { supervisor.run(shutdown).await }
    });

    let snapshot = pool.run_until_drained().await?;

    shutdown.notify_one();
    supervisor_handle.await?;

    info!(
        metrics = %serde_json::to_string(&snapshot)?,
        "worker terminado"
    );
    Ok(())
}
