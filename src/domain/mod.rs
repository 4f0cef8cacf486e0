//! Domain types: fleet nodes and per-run upgrade status.

pub mod node;
pub mod status;
