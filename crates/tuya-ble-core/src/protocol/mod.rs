//! Protocol module: message codes, the frame codec, fragmentation and the
//! payload formats carried inside frames.

pub mod advertisement;
pub mod codec;
pub mod dp_payload;
pub mod fragment;
pub mod messages;
pub mod sequence;
pub mod time_sync;

pub use codec::{decode_frame, encode_frame, open, seal, Frame, ProtocolError};
pub use fragment::{split_packets, Reassembler};
pub use messages::*;
pub use sequence::SequenceCounter;
