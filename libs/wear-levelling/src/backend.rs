mod crc32;
pub(crate) use crc32::*;
mod types;
pub use types::{WlConfig, WlState};
pub(crate) use types::*;
mod geometry;
pub(crate) use geometry::*;
mod mapper;
pub(crate) use mapper::*;
mod engine;
pub use engine::WlFlash;

// hosted-mode emulation of a NOR flash, also used by the host tools
mod hosted;
pub use hosted::MemFlash;
