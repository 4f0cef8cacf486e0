//! Rolling upgrades for a fleet of agent nodes on a remote execution platform.
//!
//! The binary is a thin clap front end over [`commands`]; everything it
//! drives is usable as a library, with [`remote::RemoteClient`] as the seam
//! between orchestration logic and the platform.

pub mod commands;
pub mod config;
pub mod deploy;
pub mod domain;
pub mod drain;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod prober;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod snapshot;
pub mod survey;
pub mod topup;
pub mod verify;
