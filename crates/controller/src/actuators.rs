//! Actuator state and the single write path to the board. The bundle lives
//! behind one async mutex shared by the control loop and the dispatcher, so
//! every actuator change is serialized.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::board::{Board, Channel};

pub(crate) type SharedActuators = Arc<Mutex<Actuators>>;

// Servo angles, in degrees. 180 is the servo rest position.
pub(crate) const GATE_OPEN_DEG: f32 = 90.0;
pub(crate) const GATE_CLOSED_DEG: f32 = 180.0;
pub(crate) const COVER_OPEN_DEG: f32 = 180.0;
pub(crate) const COVER_CLOSED_DEG: f32 = 0.0;
pub(crate) const VALVE_OPEN_DEG: f32 = 100.0;
pub(crate) const VALVE_CLOSED_DEG: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RgbChannel {
    Red,
    Green,
    Blue,
}

impl RgbChannel {
    fn channel(self) -> Channel {
        match self {
            Self::Red => Channel::Red,
            Self::Green => Channel::Green,
            Self::Blue => Channel::Blue,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rgb {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl Rgb {
    pub(crate) fn get(&self, ch: RgbChannel) -> f64 {
        match ch {
            RgbChannel::Red => self.red,
            RgbChannel::Green => self.green,
            RgbChannel::Blue => self.blue,
        }
    }

    fn slot(&mut self, ch: RgbChannel) -> &mut f64 {
        match ch {
            RgbChannel::Red => &mut self.red,
            RgbChannel::Green => &mut self.green,
            RgbChannel::Blue => &mut self.blue,
        }
    }
}

/// What a setter did with the requested value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    Written,
    /// Already at the requested value; nothing was written.
    Unchanged,
    /// Blocked by the safety interlock.
    Refused,
    /// The board rejected the write.
    Failed,
}

impl Change {
    /// The actuator now holds the requested value.
    pub(crate) fn holds(self) -> bool {
        matches!(self, Self::Written | Self::Unchanged)
    }
}

/// Last successfully written value of every actuator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub light: bool,
    pub gate: Position,
    pub cover: Position,
    pub valve: Position,
    pub buzzer: bool,
    pub rgb: Rgb,
}

impl ActuatorState {
    pub fn gate_angle(&self) -> f32 {
        match self.gate {
            Position::Open => GATE_OPEN_DEG,
            Position::Closed => GATE_CLOSED_DEG,
        }
    }

    pub fn valve_angle(&self) -> f32 {
        match self.valve {
            Position::Open => VALVE_OPEN_DEG,
            Position::Closed => VALVE_CLOSED_DEG,
        }
    }

    pub fn cover_angle(&self) -> f32 {
        match self.cover {
            Position::Open => COVER_OPEN_DEG,
            Position::Closed => COVER_CLOSED_DEG,
        }
    }
}

impl Default for ActuatorState {
    /// Startup stance: both rest-position servos at 180 (gate closed, cover
    /// open), valve closed, everything else off.
    fn default() -> Self {
        Self {
            light: false,
            gate: Position::Closed,
            cover: Position::Open,
            valve: Position::Closed,
            buzzer: false,
            rgb: Rgb::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator bundle
// ---------------------------------------------------------------------------

pub(crate) struct Actuators {
    board: Arc<dyn Board>,
    state: ActuatorState,
    /// Set by the interlock while a hazard persists. Blocks valve OPEN.
    engaged: bool,
}

impl Actuators {
    pub(crate) fn new(board: Arc<dyn Board>) -> Self {
        Self {
            board,
            state: ActuatorState::default(),
            engaged: false,
        }
    }

    pub(crate) fn shared(self) -> SharedActuators {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn state(&self) -> &ActuatorState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn engaged(&self) -> bool {
        self.engaged
    }

    pub(crate) fn set_engaged(&mut self, engaged: bool) {
        self.engaged = engaged;
    }

    /// Drive every actuator to the startup stance, unconditionally.
    pub(crate) fn initialise(&mut self) {
        let s = ActuatorState::default();
        let writes = [
            (Channel::LightRelay, 0.0),
            (Channel::Buzzer, 0.0),
            (Channel::Gate, s.gate_angle()),
            (Channel::Cover, s.cover_angle()),
            (Channel::Valve, s.valve_angle()),
            (Channel::Red, 0.0),
            (Channel::Green, 0.0),
            (Channel::Blue, 0.0),
        ];
        for (channel, value) in writes {
            self.write(channel, value);
        }
        self.state = s;
        info!("actuators initialised");
    }

    /// Write one value. A failed write is logged and reported as
    /// [`Change::Failed`]; the caller keeps the previous state.
    fn write(&self, channel: Channel, value: f32) -> Change {
        match self.board.write(channel, value) {
            Ok(()) => Change::Written,
            Err(e) => {
                warn!(%channel, value, "actuator write failed: {e}");
                Change::Failed
            }
        }
    }

    /// Repeating the current value performs no board write.
    pub(crate) fn set_light(&mut self, on: bool) -> Change {
        if self.state.light == on {
            return Change::Unchanged;
        }
        let change = self.write(Channel::LightRelay, if on { 1.0 } else { 0.0 });
        if change == Change::Written {
            self.state.light = on;
        }
        change
    }

    pub(crate) fn set_buzzer(&mut self, on: bool) -> Change {
        if self.state.buzzer == on {
            return Change::Unchanged;
        }
        let change = self.write(Channel::Buzzer, if on { 1.0 } else { 0.0 });
        if change == Change::Written {
            self.state.buzzer = on;
        }
        change
    }

    pub(crate) fn set_gate(&mut self, pos: Position) -> Change {
        if self.state.gate == pos {
            return Change::Unchanged;
        }
        let angle = match pos {
            Position::Open => GATE_OPEN_DEG,
            Position::Closed => GATE_CLOSED_DEG,
        };
        let change = self.write(Channel::Gate, angle);
        if change == Change::Written {
            self.state.gate = pos;
        }
        change
    }

    pub(crate) fn set_cover(&mut self, pos: Position) -> Change {
        if self.state.cover == pos {
            return Change::Unchanged;
        }
        let angle = match pos {
            Position::Open => COVER_OPEN_DEG,
            Position::Closed => COVER_CLOSED_DEG,
        };
        let change = self.write(Channel::Cover, angle);
        if change == Change::Written {
            self.state.cover = pos;
        }
        change
    }

    /// OPEN is refused while the interlock is engaged.
    pub(crate) fn set_valve(&mut self, pos: Position) -> Change {
        if pos == Position::Open && self.engaged {
            warn!("valve OPEN refused: safety interlock engaged");
            return Change::Refused;
        }
        if self.state.valve == pos {
            return Change::Unchanged;
        }
        let angle = match pos {
            Position::Open => VALVE_OPEN_DEG,
            Position::Closed => VALVE_CLOSED_DEG,
        };
        let change = self.write(Channel::Valve, angle);
        if change == Change::Written {
            self.state.valve = pos;
        }
        change
    }

    /// `level` must already be in 0.0-1.0.
    pub(crate) fn set_rgb(&mut self, ch: RgbChannel, level: f64) -> Change {
        if self.state.rgb.get(ch) == level {
            return Change::Unchanged;
        }
        let change = self.write(ch.channel(), level as f32);
        if change == Change::Written {
            *self.state.rgb.slot(ch) = level;
        }
        change
    }

    /// Valve closed, buzzer and lights off, gate closed. The cover stays put.
    pub(crate) fn safe_stance(&mut self) {
        self.set_valve(Position::Closed);
        self.set_buzzer(false);
        self.set_gate(Position::Closed);
        self.set_light(false);
        for ch in [RgbChannel::Red, RgbChannel::Green, RgbChannel::Blue] {
            self.set_rgb(ch, 0.0);
        }
        info!(state = ?self.state, "actuators in safe stance");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
