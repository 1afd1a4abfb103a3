//! Server-to-client timeline synchronization
//!
//! - `descriptor`: the per-screen snapshot and its geometry
//! - `protocol`: the framed binary broadcast (versions 1 and 2)
//! - `timeline`: anchor position maths and the server clock estimate

pub mod descriptor;
pub mod protocol;
pub mod timeline;

pub use descriptor::{BlockPos, PlaneAxis, ScreenDescriptor, ViewerPos};
pub use protocol::{decode_frame, encode_frame, SyncMessage};
pub use timeline::{is_jump, position_ms, ServerClock, JUMP_THRESHOLD_MS};
