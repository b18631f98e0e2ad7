use thiserror::Error;

/// Errores de la librería.
///
/// Un pick sin candidatos o una transición ilegal no son errores:
/// esas operaciones devuelven `None` / `false`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("fragmento no encontrado: {0}")]
    FragmentNotFound(String),

    #[error("tarea no encontrada: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Errores al leer o escribir los formatos de intercambio.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    #[error("se esperaba un objeto JSON")]
    NotAnObject,

    #[error("XML inválido: {0}")]
    Xml(String),

    #[error("estado desconocido: {0}")]
    UnknownState(String),
}

pub type Result<T> = std::result::Result<T, Error>;
