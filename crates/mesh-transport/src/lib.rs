//! Owns the physical connection to the radio: byte framing and the
//! reconnecting TCP link. Knows nothing about protobuf or mesh
//! semantics — see `mesh_proto` for that.

mod error;
mod framing;
mod transport;

pub use error::TransportError;
pub use framing::{frame_payload, FrameDecoder, MAX_FRAME_LEN};
pub use transport::{
    spawn_link, ConnectionStatus, DisconnectReason, InboundFrame, RadioLink, RadioLinkHandles,
    TransportConfig,
};
