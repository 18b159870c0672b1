//! # Wear levelling for NOR flash partitions
//!
//! This crate sits between a sector-oriented client (typically a FAT-style
//! filesystem) and a NOR flash partition whose sectors endure a bounded
//! number of erase cycles. It presents a logical, sector-addressable space
//! while rotating a hidden "dummy" page through the partition so that erase
//! load spreads over every physical sector, not just the hot ones.
//!
//! ## Glossary:
//! * Sector - smallest unit the flash erases atomically.
//! * Page - the unit of wear-levelling movement; at least one sector.
//! * Dummy - the one physical page, at `pos * page_size`, that holds no
//!   logical data. Rotation copies the next page into it and advances `pos`.
//! * Position-update record - a `wr_size` entry appended to the state
//!   region once per rotation; the run of valid records encodes the
//!   committed `pos` so it survives power loss without a state rewrite.
//! * Base mode - plain rotation; logical and physical addresses differ only
//!   by the rotation offset.
//! * Advanced mode - adds a 3-round Feistel permutation over sector indices
//!   (so access patterns cannot camp on one physical region) and a
//!   per-sector erase-count ledger persisted in two reserved flash regions.
//!
//! ## Code organization:
//!
//! ### `api.rs`
//! The error taxonomy, the `WlMode` tag, and the `FlashAccess` capability
//! trait through which all flash I/O flows. Reads take `&self`, so holders
//! of a shared borrow (the monitor) are read-only by construction.
//!
//! ### `backend.rs`
//! The flash-facing implementation: on-flash record layouts, geometry
//! resolution, the Feistel permutation and rotation mapping, the engine
//! (`WlFlash`) with its scheduler and ledger, and the in-memory flash
//! emulation used by tests and host tools.
//!
//! ### `monitor.rs`
//! Read-only reconstruction of a partition's wear-levelling status from an
//! image, including mode detection, and the serializable status document.
//!
//! ### `sim.rs`
//! A deterministic simulator that drives the mapper and scheduler with
//! synthetic workloads and reports wear statistics.

pub mod api;
pub use api::*;

mod backend;
pub use backend::{MemFlash, WlConfig, WlFlash, WlState};

pub mod monitor;
pub use monitor::{find_wl_partition, read_config, WlMonitor, WlStatus};

pub mod sim;
pub use sim::{AddrDist, BlockDist, SimConfig, SimReport, Simulator};

#[cfg(test)]
mod tests;
