//! Safety interlock. Level-triggered: every tick's snapshot is evaluated on
//! its own, nothing is latched.
//!
//! ```text
//! Normal ──[fire < fire_th || lpg > lpg_th]──▶ Hazard
//!   ▲                                            │ (re-asserted every tick:
//!   └──────────[both predicates clear]───────────┘  valve CLOSED + alarm)
//! ```
//!
//! While in Hazard the actuator bundle is marked engaged, which refuses any
//! valve OPEN from the dispatcher until a clear tick lifts the mark.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::actuators::{Actuators, Position, SharedActuators};
use crate::config::Thresholds;
use crate::sensors::SensorSnapshot;

const ALARM_PULSES: u32 = 3;
const ALARM_ON: Duration = Duration::from_millis(250);
const ALARM_OFF: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardKind {
    Fire,
    Lpg,
    FireAndLpg,
}

impl fmt::Display for HazardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fire => write!(f, "fire"),
            Self::Lpg => write!(f, "lpg"),
            Self::FireAndLpg => write!(f, "fire+lpg"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterlockState {
    Normal,
    Hazard(HazardKind),
}

pub(crate) struct Interlock {
    thresholds: Thresholds,
    state: InterlockState,
}

impl Interlock {
    pub(crate) fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            state: InterlockState::Normal,
        }
    }

    pub(crate) fn state(&self) -> InterlockState {
        self.state
    }

    pub(crate) fn evaluate(&self, snapshot: &SensorSnapshot) -> InterlockState {
        match snapshot.hazard(&self.thresholds) {
            Some(kind) => InterlockState::Hazard(kind),
            None => InterlockState::Normal,
        }
    }

    /// Evaluate `snapshot` and act on it. Returns `true` when a hazard was
    /// handled this tick; the call then blocks for the alarm pattern.
    pub(crate) async fn run(
        &mut self,
        snapshot: &SensorSnapshot,
        actuators: &SharedActuators,
    ) -> bool {
        let next = self.evaluate(snapshot);
        let prev = std::mem::replace(&mut self.state, next);

        match next {
            InterlockState::Normal => {
                if let InterlockState::Hazard(kind) = prev {
                    info!(%kind, "hazard cleared");
                    actuators.lock().await.set_engaged(false);
                }
                false
            }
            InterlockState::Hazard(kind) => {
                if prev == InterlockState::Normal {
                    warn!(
                        %kind,
                        fire = snapshot.fire,
                        lpg = snapshot.lpg,
                        "hazard detected: closing LPG valve"
                    );
                }
                // Held for the whole pattern so no remote command interleaves.
                let mut act = actuators.lock().await;
                act.set_engaged(true);
                act.set_valve(Position::Closed);
                sound_alarm(&mut act).await;
                true
            }
        }
    }
}

async fn sound_alarm(act: &mut Actuators) {
    for _ in 0..ALARM_PULSES {
        act.set_buzzer(true);
        tokio::time::sleep(ALARM_ON).await;
        act.set_buzzer(false);
        tokio::time::sleep(ALARM_OFF).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
