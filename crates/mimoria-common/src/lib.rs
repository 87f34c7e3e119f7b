//! Shared wire framing, tagged-value codec, operation codes, and value
//! shapes for the Mimoria cache protocol, used by both the client-facing
//! and cluster-facing sides of `mimoria-server`.

pub mod error;
pub mod ops;
pub mod pool;
pub mod value;
pub mod wire;

pub use error::WireError;
pub use ops::{ClientOp, ClusterOp, Status};
pub use pool::{BufferPool, PooledBuf};
pub use value::ValueShape;
pub use wire::{FrameReader, PacketHeader, TaggedValue, VarUint};
