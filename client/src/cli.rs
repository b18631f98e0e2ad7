use clap::{Parser, Subcommand, ValueEnum};
use tracker::WireFormat;

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI para leer y generar fragmentos y tareas")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Normaliza un fragmento (JSON, query string o XML) y lo imprime como JSON
    Fragment {
        /// Texto del fragmento, o "-" para leerlo de stdin
        #[arg(value_name = "INPUT")]
        input: String,

        #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
        format: FormatArg,
    },

    /// Lee un documento JSON de tarea y muestra su resumen
    Task {
        /// Archivo, o "-" para stdin
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Genera una tarea nueva y la imprime como documento JSON
    New {
        #[arg(long)]
        job: String,

        #[arg(long)]
        count: usize,

        #[arg(long)]
        desc: Option<String>,

        /// Pares clave=valor extra que viajan en el documento
        #[arg(long = "extra", value_name = "CLAVE=VALOR", value_parser = parse_key_val)]
        extra: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// Deduce el formato por el primer carácter
    Auto,
    Json,
    Query,
    Xml,
}

impl FormatArg {
    pub fn resolve(self, input: &str) -> WireFormat {
        match self {
            FormatArg::Auto => sniff(input),
            FormatArg::Json => WireFormat::Json,
            FormatArg::Query => WireFormat::Query,
            FormatArg::Xml => WireFormat::Xml,
        }
    }
}

/// `<` es XML, `{` es JSON y cualquier otra cosa se trata como query string.
pub fn sniff(input: &str) -> WireFormat {
    match input.trim_start().chars().next() {
        Some('<') => WireFormat::Xml,
        Some('{') => WireFormat::Json,
        _ => WireFormat::Query,
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("se esperaba CLAVE=VALOR: {s}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("clave vacía en {s}"));
    }
    if tracker::wire::is_reserved_key(key) {
        return Err(format!("la clave {key} es un campo del documento, no un extra"));
    }
    Ok((key.to_string(), value.to_string()))
}
