#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("core: {0}")]
    Core(#[from] mesh_core::CoreError),
    #[error("store: {0}")]
    Store(#[from] mesh_store::SqliteStoreError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("script '{command}' failed: {reason}")]
    Script { command: String, reason: String },
    #[error("script '{command}' timed out after {timeout_secs}s")]
    ScriptTimeout { command: String, timeout_secs: u64 },
}

pub type GatewayResult<T> = Result<T, GatewayError>;
