#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("frame missing expected payload variant")]
    EmptyVariant,
}
