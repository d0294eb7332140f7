//! Sensor gateway: one read per input per tick, with a fixed fallback for
//! every channel so a flaky read never stalls the control loop.

use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::board::{Board, Channel};
use crate::config::Thresholds;
use crate::interlock::HazardKind;

/// Fire sensors read low near flame, so "no reading" means 1.0.
pub(crate) const FIRE_DEFAULT: f32 = 1.0;
pub(crate) const LPG_DEFAULT: f32 = 0.0;
/// Absent reads count as "someone is there" so the gate never auto-opens
/// on a failed read.
pub(crate) const OCCUPANCY_DEFAULT: bool = true;
/// Pull-up wiring: released reads high.
pub(crate) const BUTTON_DEFAULT: bool = true;

/// Round to two decimal places.
pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// All sensor values captured at one tick. Never mutated after capture.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub fire: f32,
    pub lpg: f32,
    /// `None` until the light sensor has produced a first reading.
    pub light: Option<f32>,
    /// `None` when this tick's rain read failed.
    pub rain: Option<f32>,
    pub occupied: bool,
    pub button: bool,
    #[serde(skip)]
    pub taken_at: Instant,
}

impl SensorSnapshot {
    /// Brightness as 0-100 (the light sensor reads high in the dark).
    pub fn light_percentage(&self) -> Option<f64> {
        self.light.map(|l| round2(100.0 - f64::from(l) * 100.0))
    }

    pub fn fire_hazard(&self, t: &Thresholds) -> bool {
        self.fire < t.fire
    }

    pub fn lpg_hazard(&self, t: &Thresholds) -> bool {
        self.lpg > t.lpg
    }

    pub fn hazard(&self, t: &Thresholds) -> Option<HazardKind> {
        match (self.fire_hazard(t), self.lpg_hazard(t)) {
            (true, true) => Some(HazardKind::FireAndLpg),
            (true, false) => Some(HazardKind::Fire),
            (false, true) => Some(HazardKind::Lpg),
            (false, false) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub(crate) struct SensorGateway {
    board: Arc<dyn Board>,
    last_light: Option<f32>,
}

impl SensorGateway {
    pub(crate) fn new(board: Arc<dyn Board>) -> Self {
        Self {
            board,
            last_light: None,
        }
    }

    /// Read an analog channel. `None` on any failure, absent value or
    /// non-finite reading; in-range values are clamped to 0.0-1.0.
    fn read(&self, channel: Channel) -> Option<f32> {
        match self.board.read(channel) {
            Ok(Some(v)) if v.is_finite() => Some(v.clamp(0.0, 1.0)),
            Ok(Some(v)) => {
                debug!(%channel, value = v, "non-finite sensor value, using default");
                None
            }
            Ok(None) => None,
            Err(e) => {
                debug!(%channel, "sensor read failed, using default: {e}");
                None
            }
        }
    }

    fn read_or(&self, channel: Channel, default: f32) -> f32 {
        self.read(channel).unwrap_or(default)
    }

    fn read_flag(&self, channel: Channel, default: bool) -> bool {
        self.read(channel).map_or(default, |v| v >= 0.5)
    }

    /// Read every input once and build the tick's snapshot.
    pub(crate) fn sample(&mut self, now: Instant) -> SensorSnapshot {
        if let Some(light) = self.read(Channel::Light) {
            self.last_light = Some(light);
        }
        SensorSnapshot {
            fire: self.read_or(Channel::Fire, FIRE_DEFAULT),
            lpg: self.read_or(Channel::Lpg, LPG_DEFAULT),
            light: self.last_light,
            rain: self.read(Channel::Rain),
            occupied: self.read_flag(Channel::Occupancy, OCCUPANCY_DEFAULT),
            button: self.read_flag(Channel::Button, BUTTON_DEFAULT),
            taken_at: now,
        }
    }
}

#[cfg(test)]
impl SensorSnapshot {
    /// Daylight, dry, someone home, no hazard.
    pub(crate) fn calm() -> Self {
        Self {
            fire: 1.0,
            lpg: 0.0,
            light: Some(0.2),
            rain: Some(0.9),
            occupied: true,
            button: true,
            taken_at: Instant::now(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
