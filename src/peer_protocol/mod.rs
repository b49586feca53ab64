pub mod codec;
pub mod message;

pub use codec::{upgrade_stream, Decoded, PeerFrames, PeerStream, ProtocolError, MAX_FRAME_LEN};
pub use message::{DecodeError, PeerMessage};
