//! The four closed-form easing curves the fade engine supports.

use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Easing {
    Linear,
    EaseIn,
    EaseOut,
    SCurve,
}

impl Easing {
    /// Parse a case-insensitive easing name, defaulting to `Linear` when
    /// unrecognized. Drivers that want the "unknown falls back to scurve"
    /// behavior from the audio-mixer driver spec should not use this —
    /// see `showhub_drivers::mixer::parse_easing_or_scurve`.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "easein" => Easing::EaseIn,
            "easeout" => Easing::EaseOut,
            "scurve" => Easing::SCurve,
            _ => Easing::Linear,
        }
    }

    /// Apply the curve to progress `t` in `[0, 1]`.
    pub fn apply(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => t * (2.0 - t),
            Easing::SCurve => (1.0 - (PI * t).cos()) / 2.0,
        }
    }
}
