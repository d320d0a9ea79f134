//! Heat source state detection from total power steps
//!
//! A single heat source switching on or off shows up as a large step in the
//! meter's total power. Only the last two samples of the window are looked
//! at, so an unrelated load changing at the same time can cause a false
//! transition.

use crate::meter::RollingPowerWindow;
use crate::registry::HeatState;
use serde::Serialize;

/// Detected change of the heat source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    TurnedOn,
    TurnedOff,
}

impl Transition {
    /// State the heat source is in after the transition
    pub fn state(self) -> HeatState {
        match self {
            Self::TurnedOn => HeatState::On,
            Self::TurnedOff => HeatState::Off,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeatSourceDetector {
    threshold_w: f64,
}

impl HeatSourceDetector {
    pub fn new(threshold_w: f64) -> Self {
        Self { threshold_w }
    }

    pub fn threshold_w(&self) -> f64 {
        self.threshold_w
    }

    /// Classify the step between the two newest samples
    pub fn detect(&self, window: &RollingPowerWindow) -> Option<Transition> {
        let latest = window.latest()?;
        let previous = window.previous()?;
        let delta = latest - previous;
        if delta >= self.threshold_w {
            Some(Transition::TurnedOn)
        } else if delta <= -self.threshold_w {
            Some(Transition::TurnedOff)
        } else {
            None
        }
    }
}

impl Default for HeatSourceDetector {
    fn default() -> Self {
        Self::new(2000.0)
    }
}
