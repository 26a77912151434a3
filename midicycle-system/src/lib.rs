//! Native transports for `midicycle-core` and the per-architecture system
//! registry.

pub mod backends;
pub mod manager;

pub use manager::MidiSystemManager;
