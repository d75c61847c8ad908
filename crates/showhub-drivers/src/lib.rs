//! Device-specific protocol translators (spec §4.11).
//!
//! Each module owns one family's wire protocol and implements
//! [`showhub_driver::Driver`]. The hub holds these as trait objects; nothing
//! outside this crate needs to know VISCA from NRPN.

pub mod lighting;
pub mod mixer;
pub mod ptz;
pub mod streaming;
pub mod visual;

pub use lighting::{LightingDriver, Playback};
pub use mixer::MixerDriver;
pub use ptz::PtzDriver;
pub use streaming::StreamingDriver;
pub use visual::VisualDriver;
