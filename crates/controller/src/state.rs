use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::actuators::ActuatorState;
use crate::interlock::HazardKind;
use crate::sensors::SensorSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub hazard: Option<HazardKind>,
    pub snapshot: Option<Arc<SensorSnapshot>>,
    pub actuators: ActuatorState,
    pub counters: Counters,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub ticks: u64,
    pub commands: u64,
    pub malformed: u64,
    pub ignored: u64,
    /// Refused by the interlock or failed at the board.
    pub rejected: u64,
    pub telemetry_dropped: u64,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Hazard,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub hazard: Option<HazardKind>,
    pub snapshot: Option<SensorSnapshot>,
    pub light_percentage: Option<f64>,
    pub actuators: ActuatorState,
    pub counters: Counters,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            hazard: None,
            snapshot: None,
            actuators: ActuatorState::default(),
            counters: Counters::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record the outcome of one control-loop tick.
    pub fn record_tick(
        &mut self,
        snapshot: Arc<SensorSnapshot>,
        actuators: ActuatorState,
        telemetry_dropped: usize,
    ) {
        self.counters.ticks += 1;
        self.counters.telemetry_dropped += telemetry_dropped as u64;
        self.snapshot = Some(snapshot);
        self.actuators = actuators;
    }

    /// Record a hazard transition. Only changes are logged as events.
    pub fn record_hazard(&mut self, hazard: Option<HazardKind>) {
        if self.hazard == hazard {
            return;
        }
        let detail = match hazard {
            Some(kind) => format!("{kind} hazard detected, valve closed"),
            None => "hazard cleared".to_string(),
        };
        self.hazard = hazard;
        self.push_event(EventKind::Hazard, detail);
    }

    /// Record an applied remote command.
    pub fn record_command(&mut self, detail: String, actuators: ActuatorState) {
        self.counters.commands += 1;
        self.actuators = actuators;
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_ignored(&mut self) {
        self.counters.ignored += 1;
    }

    /// Record a command that was understood but left its actuator unchanged.
    pub fn record_rejected(&mut self, detail: String) {
        self.counters.rejected += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// Record a command that could not be parsed.
    pub fn record_malformed(&mut self, detail: String) {
        self.counters.malformed += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            hazard: self.hazard,
            snapshot: self.snapshot.as_deref().cloned(),
            light_percentage: self
                .snapshot
                .as_deref()
                .and_then(SensorSnapshot::light_percentage),
            actuators: self.actuators.clone(),
            counters: self.counters,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
