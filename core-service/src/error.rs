use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Export error: {0}")]
    Export(#[from] core_export::ExportError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
