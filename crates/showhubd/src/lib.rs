//! showhubd - production control hub for live-event booths
//!
//! Ties together the protocol, fade, driver, macro, and cue engine crates
//! into one process: a UDP message socket, a 50 Hz fade ticker, a table of
//! device drivers, and the macro/cue engines that sit in front of them.

pub mod emulators;
pub mod http;
pub mod hub;
pub mod manager;
pub mod persistence;
pub mod telemetry;

pub use hub::{Hub, HubError};
