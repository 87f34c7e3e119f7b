pub mod frame;
pub mod tagged;
pub mod varint;

pub use frame::{FrameReader, PacketHeader};
pub use tagged::TaggedValue;
pub use varint::VarUint;
