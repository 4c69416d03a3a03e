#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("transport: {0}")]
    Transport(#[from] mesh_transport::TransportError),
    #[error("codec: {0}")]
    Codec(#[from] mesh_proto::CodecError),
    #[error("store: {0}")]
    Store(String),
    #[error("script: {0}")]
    Script(String),
    #[error("session key for node {0} unavailable or expired")]
    NoSessionKey(crate::model::NodeNum),
    #[error("request to node {0} timed out")]
    RequestTimeout(crate::model::NodeNum),
    #[error("firmware {actual} does not support this command (needs >= {required})")]
    UnsupportedFirmware { actual: String, required: String },
    #[error("channel {0} not found")]
    UnknownChannel(u32),
}

pub type CoreResult<T> = Result<T, CoreError>;
