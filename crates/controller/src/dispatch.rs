//! Remote command dispatch. Inbound publishes are queued by the MQTT pump
//! and consumed here one at a time; each command is judged against the
//! latest published sensor snapshot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actuators::{Change, Position, RgbChannel, SharedActuators};
use crate::config::Thresholds;
use crate::error::DispatchError;
use crate::mqtt::Topics;
use crate::sensors::{round2, SensorSnapshot};
use crate::state::SharedState;
use crate::telemetry::Publish;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandTopic {
    Light,
    Clothesline,
    Gate,
    LpgValve,
    Rgb(RgbChannel),
}

impl CommandTopic {
    pub(crate) const ALL: [CommandTopic; 7] = [
        Self::Light,
        Self::Clothesline,
        Self::Gate,
        Self::LpgValve,
        Self::Rgb(RgbChannel::Red),
        Self::Rgb(RgbChannel::Green),
        Self::Rgb(RgbChannel::Blue),
    ];

    /// Topic name under the configured prefix.
    pub(crate) fn suffix(self) -> &'static str {
        match self {
            Self::Light => "Light",
            Self::Clothesline => "CLOTHES",
            Self::Gate => "Gate",
            Self::LpgValve => "LPGR",
            Self::Rgb(RgbChannel::Red) => "R",
            Self::Rgb(RgbChannel::Green) => "G",
            Self::Rgb(RgbChannel::Blue) => "B",
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Clothesline => "clothesline",
            Self::Gate => "gate",
            Self::LpgValve => "lpg_valve",
            Self::Rgb(RgbChannel::Red) => "red",
            Self::Rgb(RgbChannel::Green) => "green",
            Self::Rgb(RgbChannel::Blue) => "blue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verb {
    On,
    Off,
    Open,
    Close,
}

/// Parse a verb payload (case-insensitive, trims whitespace).
pub(crate) fn parse_verb(payload: &[u8]) -> Option<Verb> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Some(Verb::On),
        "OFF" => Some(Verb::Off),
        "OPEN" => Some(Verb::Open),
        "CLOSE" => Some(Verb::Close),
        _ => None,
    }
}

/// Parse a 0-255 channel value into a 0.0-1.0 level rounded to two places.
pub(crate) fn parse_level(topic: CommandTopic, payload: &[u8]) -> Result<f64, DispatchError> {
    let text = String::from_utf8_lossy(payload);
    let malformed = |reason: String| DispatchError::Malformed {
        topic: topic.name(),
        payload: text.to_string(),
        reason,
    };
    let raw: f64 = text
        .trim()
        .parse()
        .map_err(|e: std::num::ParseFloatError| malformed(e.to_string()))?;
    if !raw.is_finite() {
        return Err(malformed("not a finite number".into()));
    }
    Ok(round2((raw / 255.0).clamp(0.0, 1.0)))
}

/// Published on the rain topic after an automatic clothesline decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RainNotice {
    Detected,
    NotDetected,
}

impl RainNotice {
    pub(crate) fn payload(self) -> &'static str {
        match self {
            Self::Detected => "DETECTED",
            Self::NotDetected => "NOT DETECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Not part of the vocabulary, or the snapshot lacks what the verb needs.
    Ignored,
    Applied,
    Notice(RainNotice),
    /// Blocked by the safety interlock.
    Refused,
    /// The board rejected the actuator write.
    Failed,
}

impl From<Change> for Outcome {
    fn from(change: Change) -> Self {
        match change {
            Change::Written | Change::Unchanged => Self::Applied,
            Change::Refused => Self::Refused,
            Change::Failed => Self::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub(crate) struct Dispatcher {
    thresholds: Thresholds,
    gate_hold: Duration,
}

impl Dispatcher {
    pub(crate) fn new(thresholds: Thresholds, gate_hold: Duration) -> Self {
        Self {
            thresholds,
            gate_hold,
        }
    }

    pub(crate) async fn dispatch(
        &self,
        topic: CommandTopic,
        payload: &[u8],
        snapshot: &SensorSnapshot,
        actuators: &SharedActuators,
    ) -> Result<Outcome, DispatchError> {
        if let CommandTopic::Rgb(ch) = topic {
            let level = parse_level(topic, payload)?;
            return Ok(actuators.lock().await.set_rgb(ch, level).into());
        }

        let Some(verb) = parse_verb(payload) else {
            debug!(topic = topic.name(), "ignoring unknown payload");
            return Ok(Outcome::Ignored);
        };

        // The timed and snapshot-driven verbs take the lock themselves.
        match (topic, verb) {
            (CommandTopic::Clothesline, Verb::On) => {
                return Ok(self.auto_clothesline(snapshot, actuators).await)
            }
            (CommandTopic::Gate, Verb::On) => return Ok(self.pulse_gate(snapshot, actuators).await),
            _ => {}
        }

        let mut act = actuators.lock().await;
        let change = match (topic, verb) {
            (CommandTopic::Light, Verb::On | Verb::Off) => act.set_light(verb == Verb::On),
            (CommandTopic::Light, Verb::Open) => match snapshot.light_percentage() {
                Some(pct) => act.set_light(pct < self.thresholds.light),
                None => {
                    debug!("light level unknown, ignoring automatic light");
                    return Ok(Outcome::Ignored);
                }
            },
            (CommandTopic::Clothesline, Verb::Open) => act.set_cover(Position::Open),
            (CommandTopic::Clothesline, Verb::Close) => act.set_cover(Position::Closed),
            (CommandTopic::Gate, Verb::Open) => act.set_gate(Position::Open),
            (CommandTopic::Gate, Verb::Close) => act.set_gate(Position::Closed),
            (CommandTopic::LpgValve, Verb::Open) => act.set_valve(Position::Open),
            (CommandTopic::LpgValve, Verb::Close) => act.set_valve(Position::Closed),
            (CommandTopic::LpgValve, Verb::On) => {
                if snapshot.hazard(&self.thresholds).is_some() {
                    act.set_valve(Position::Closed)
                } else {
                    act.set_valve(Position::Open)
                }
            }
            _ => {
                debug!(topic = topic.name(), ?verb, "ignoring verb");
                return Ok(Outcome::Ignored);
            }
        };
        Ok(change.into())
    }

    /// Close the cover when it is dark or raining, open it otherwise.
    async fn auto_clothesline(
        &self,
        snapshot: &SensorSnapshot,
        actuators: &SharedActuators,
    ) -> Outcome {
        let (Some(pct), Some(rain)) = (snapshot.light_percentage(), snapshot.rain) else {
            debug!("light or rain level unknown, ignoring automatic clothesline");
            return Outcome::Ignored;
        };

        let mut act = actuators.lock().await;
        if pct < self.thresholds.light {
            return act.set_cover(Position::Closed).into();
        }
        let (change, notice) = if rain < self.thresholds.rain {
            (act.set_cover(Position::Closed), RainNotice::Detected)
        } else {
            (act.set_cover(Position::Open), RainNotice::NotDetected)
        };
        // No notice unless the cover actually holds the matching position.
        if change.holds() {
            Outcome::Notice(notice)
        } else {
            change.into()
        }
    }

    /// Open the gate for a fixed hold when nobody is detected at it, then
    /// close it. The actuator lock is released during the hold. No hold
    /// follows a failed open.
    async fn pulse_gate(&self, snapshot: &SensorSnapshot, actuators: &SharedActuators) -> Outcome {
        if snapshot.occupied {
            debug!("occupancy present, gate pulse skipped");
            return Outcome::Ignored;
        }
        info!(hold_secs = self.gate_hold.as_secs(), "gate pulse: opening");
        let opened = actuators.lock().await.set_gate(Position::Open);
        if !opened.holds() {
            return opened.into();
        }
        tokio::time::sleep(self.gate_hold).await;
        let closed = actuators.lock().await.set_gate(Position::Closed);
        info!("gate pulse: closed");
        closed.into()
    }
}

// ---------------------------------------------------------------------------
// Delivery task
// ---------------------------------------------------------------------------

/// An inbound publish waiting for dispatch.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
}

pub(crate) struct DispatchTask {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) topics: Arc<Topics>,
    pub(crate) commands: mpsc::Receiver<PendingCommand>,
    pub(crate) snapshots: watch::Receiver<Arc<SensorSnapshot>>,
    pub(crate) actuators: SharedActuators,
    pub(crate) publisher: Arc<dyn Publish>,
    pub(crate) shared: SharedState,
}

impl DispatchTask {
    /// Consume commands until shutdown or until the queue closes. A command
    /// already in progress (e.g. a gate hold) always runs to completion.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        info!("dispatcher started");
        loop {
            let cmd = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            self.handle(cmd).await;
        }
        info!("dispatcher stopped");
    }

    async fn handle(&self, cmd: PendingCommand) {
        let Some(topic) = self.topics.command(&cmd.topic) else {
            debug!(topic = %cmd.topic, "ignoring unknown topic");
            self.shared.write().await.record_ignored();
            return;
        };
        let payload = String::from_utf8_lossy(&cmd.payload).into_owned();

        // One Arc clone: the whole command sees a single snapshot.
        let snapshot = self.snapshots.borrow().clone();

        match self
            .dispatcher
            .dispatch(topic, &cmd.payload, &snapshot, &self.actuators)
            .await
        {
            Ok(Outcome::Ignored) => {
                self.shared.write().await.record_ignored();
            }
            Ok(outcome @ (Outcome::Refused | Outcome::Failed)) => {
                let why = if outcome == Outcome::Refused {
                    "refused by interlock"
                } else {
                    "actuator write failed"
                };
                warn!(topic = topic.name(), %payload, "command not applied: {why}");
                self.shared
                    .write()
                    .await
                    .record_rejected(format!("{} {payload}: {why}", topic.name()));
            }
            Ok(outcome) => {
                if let Outcome::Notice(notice) = outcome {
                    let rain_topic = self.topics.rain();
                    if let Err(e) = self.publisher.publish(&rain_topic, notice.payload().into()) {
                        error!(topic = %rain_topic, "failed to publish rain notice: {e}");
                    }
                }
                let state = self.actuators.lock().await.state().clone();
                info!(topic = topic.name(), %payload, "command applied");
                self.shared
                    .write()
                    .await
                    .record_command(format!("{} {payload}", topic.name()), state);
            }
            Err(e) => {
                warn!("{e}");
                self.shared.write().await.record_malformed(e.to_string());
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::{Actuators, ActuatorState, VALVE_OPEN_DEG};
    use crate::board::{Channel, SimBoard};
    use crate::state::SystemState;
    use crate::telemetry::RecordingPublisher;
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    const HOLD: Duration = Duration::from_secs(5);

    fn setup() -> (Arc<SimBoard>, SharedActuators, Dispatcher) {
        let board = Arc::new(SimBoard::new());
        let mut act = Actuators::new(board.clone());
        act.initialise();
        (
            board,
            act.shared(),
            Dispatcher::new(Thresholds::default(), HOLD),
        )
    }

    /// Snapshot with a given light percentage and rain level.
    fn sky(light_pct: f32, rain: f32) -> SensorSnapshot {
        SensorSnapshot {
            light: Some((100.0 - light_pct) / 100.0),
            rain: Some(rain),
            ..SensorSnapshot::calm()
        }
    }

    async fn state(act: &SharedActuators) -> ActuatorState {
        act.lock().await.state().clone()
    }

    // -- Parsing --------------------------------------------------------------

    #[test]
    fn parse_verb_is_forgiving() {
        assert_eq!(parse_verb(b"ON"), Some(Verb::On));
        assert_eq!(parse_verb(b" off\n"), Some(Verb::Off));
        assert_eq!(parse_verb(b"Open"), Some(Verb::Open));
        assert_eq!(parse_verb(b"CLOSE"), Some(Verb::Close));
        assert_eq!(parse_verb(b"TOGGLE"), None);
        assert_eq!(parse_verb(b""), None);
    }

    #[test]
    fn parse_level_scales_and_rounds() {
        let t = CommandTopic::Rgb(RgbChannel::Red);
        assert_eq!(parse_level(t, b"255"), Ok(1.0));
        assert_eq!(parse_level(t, b"0"), Ok(0.0));
        assert_eq!(parse_level(t, b"128"), Ok(0.5));
        assert_eq!(parse_level(t, b"100"), Ok(0.39));
        assert_eq!(parse_level(t, b" 51 "), Ok(0.2));
    }

    #[test]
    fn parse_level_clamps() {
        let t = CommandTopic::Rgb(RgbChannel::Blue);
        assert_eq!(parse_level(t, b"300"), Ok(1.0));
        assert_eq!(parse_level(t, b"-20"), Ok(0.0));
    }

    #[test]
    fn parse_level_rejects_garbage() {
        let t = CommandTopic::Rgb(RgbChannel::Green);
        assert!(matches!(
            parse_level(t, b"abc"),
            Err(DispatchError::Malformed { topic: "green", .. })
        ));
        assert!(parse_level(t, b"NaN").is_err());
        assert!(parse_level(t, b"inf").is_err());
        assert!(parse_level(t, b"").is_err());
    }

    // -- RGB ------------------------------------------------------------------

    #[tokio::test]
    async fn rgb_full_and_off() {
        let (board, act, d) = setup();
        let red = CommandTopic::Rgb(RgbChannel::Red);
        let snap = SensorSnapshot::calm();

        d.dispatch(red, b"255", &snap, &act).await.unwrap();
        assert_eq!(state(&act).await.rgb.red, 1.0);
        assert_eq!(board.output(Channel::Red), Some(1.0));

        d.dispatch(red, b"0", &snap, &act).await.unwrap();
        assert_eq!(state(&act).await.rgb.red, 0.0);
    }

    #[tokio::test]
    async fn rgb_malformed_leaves_channel_unchanged() {
        let (_board, act, d) = setup();
        let red = CommandTopic::Rgb(RgbChannel::Red);
        let snap = SensorSnapshot::calm();

        d.dispatch(red, b"128", &snap, &act).await.unwrap();
        let err = d.dispatch(red, b"abc", &snap, &act).await.unwrap_err();
        assert!(matches!(err, DispatchError::Malformed { .. }));
        assert_eq!(state(&act).await.rgb.red, 0.5);
    }

    // -- Light ----------------------------------------------------------------

    #[tokio::test]
    async fn light_on_off_direct() {
        let (_board, act, d) = setup();
        let snap = SensorSnapshot::calm();
        d.dispatch(CommandTopic::Light, b"ON", &snap, &act).await.unwrap();
        assert!(state(&act).await.light);
        d.dispatch(CommandTopic::Light, b"OFF", &snap, &act).await.unwrap();
        assert!(!state(&act).await.light);
    }

    #[tokio::test]
    async fn light_open_follows_darkness() {
        let (_board, act, d) = setup();
        d.dispatch(CommandTopic::Light, b"OPEN", &sky(30.0, 0.9), &act)
            .await
            .unwrap();
        assert!(state(&act).await.light);

        d.dispatch(CommandTopic::Light, b"OPEN", &sky(80.0, 0.9), &act)
            .await
            .unwrap();
        assert!(!state(&act).await.light);
    }

    #[tokio::test]
    async fn light_open_ignored_without_light_reading() {
        let (_board, act, d) = setup();
        let snap = SensorSnapshot {
            light: None,
            ..SensorSnapshot::calm()
        };
        let out = d.dispatch(CommandTopic::Light, b"OPEN", &snap, &act).await;
        assert_eq!(out, Ok(Outcome::Ignored));
    }

    #[tokio::test]
    async fn repeated_light_off_is_idempotent() {
        let (board, act, d) = setup();
        let snap = SensorSnapshot::calm();
        d.dispatch(CommandTopic::Light, b"ON", &snap, &act).await.unwrap();
        d.dispatch(CommandTopic::Light, b"OFF", &snap, &act).await.unwrap();
        let writes = board.writes_to(Channel::LightRelay).len();

        d.dispatch(CommandTopic::Light, b"OFF", &snap, &act).await.unwrap();
        assert_eq!(board.writes_to(Channel::LightRelay).len(), writes);
        assert!(!state(&act).await.light);
    }

    // -- Clothesline ----------------------------------------------------------

    #[tokio::test]
    async fn clothesline_bright_and_wet_closes_with_rain_notice() {
        let (_board, act, d) = setup();
        let out = d
            .dispatch(CommandTopic::Clothesline, b"ON", &sky(80.0, 0.3), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Notice(RainNotice::Detected)));
        assert_eq!(state(&act).await.cover, Position::Closed);
    }

    #[tokio::test]
    async fn clothesline_bright_and_dry_opens() {
        let (_board, act, d) = setup();
        act.lock().await.set_cover(Position::Closed);
        let out = d
            .dispatch(CommandTopic::Clothesline, b"ON", &sky(80.0, 0.9), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Notice(RainNotice::NotDetected)));
        assert_eq!(state(&act).await.cover, Position::Open);
    }

    #[tokio::test]
    async fn clothesline_dark_closes_without_notice() {
        let (_board, act, d) = setup();
        let out = d
            .dispatch(CommandTopic::Clothesline, b"ON", &sky(20.0, 0.9), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Applied));
        assert_eq!(state(&act).await.cover, Position::Closed);
    }

    #[tokio::test]
    async fn clothesline_failed_write_sends_no_notice() {
        let (board, act, d) = setup();
        board.set_failing(Channel::Cover, true);
        let out = d
            .dispatch(CommandTopic::Clothesline, b"ON", &sky(80.0, 0.3), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Failed));
        assert_eq!(state(&act).await.cover, Position::Open);
    }

    #[tokio::test]
    async fn clothesline_needs_rain_reading() {
        let (_board, act, d) = setup();
        let snap = SensorSnapshot {
            rain: None,
            ..sky(80.0, 0.0)
        };
        let out = d.dispatch(CommandTopic::Clothesline, b"ON", &snap, &act).await;
        assert_eq!(out, Ok(Outcome::Ignored));
        assert_eq!(state(&act).await.cover, Position::Open);
    }

    #[tokio::test]
    async fn clothesline_direct_commands() {
        let (_board, act, d) = setup();
        let snap = SensorSnapshot::calm();
        d.dispatch(CommandTopic::Clothesline, b"CLOSE", &snap, &act)
            .await
            .unwrap();
        assert_eq!(state(&act).await.cover, Position::Closed);
        d.dispatch(CommandTopic::Clothesline, b"OPEN", &snap, &act)
            .await
            .unwrap();
        assert_eq!(state(&act).await.cover, Position::Open);
    }

    // -- Gate -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn gate_pulse_when_nobody_present() {
        let (board, act, d) = setup();
        let snap = SensorSnapshot {
            occupied: false,
            ..SensorSnapshot::calm()
        };

        let start = Instant::now();
        d.dispatch(CommandTopic::Gate, b"ON", &snap, &act).await.unwrap();

        assert_eq!(start.elapsed(), HOLD);
        assert_eq!(board.writes_to(Channel::Gate), vec![180.0, 90.0, 180.0]);
        assert_eq!(state(&act).await.gate, Position::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_pulse_ignores_occupancy_flip_during_hold() {
        let (board, act, d) = setup();
        let snap = SensorSnapshot {
            occupied: false,
            ..SensorSnapshot::calm()
        };

        let pulse = {
            let act = act.clone();
            tokio::spawn(async move {
                d.dispatch(CommandTopic::Gate, b"ON", &snap, &act).await
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        board.set_input(Channel::Occupancy, Some(1.0));
        assert_eq!(state(&act).await.gate, Position::Open);

        pulse.await.unwrap().unwrap();
        assert_eq!(board.writes_to(Channel::Gate), vec![180.0, 90.0, 180.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_pulse_skipped_when_occupied() {
        let (board, act, d) = setup();
        let start = Instant::now();
        let out = d
            .dispatch(CommandTopic::Gate, b"ON", &SensorSnapshot::calm(), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Ignored));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(board.writes_to(Channel::Gate), vec![180.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_pulse_without_hold_when_open_fails() {
        let (board, act, d) = setup();
        board.set_failing(Channel::Gate, true);
        let snap = SensorSnapshot {
            occupied: false,
            ..SensorSnapshot::calm()
        };

        let start = Instant::now();
        let out = d.dispatch(CommandTopic::Gate, b"ON", &snap, &act).await;

        assert_eq!(out, Ok(Outcome::Failed));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(state(&act).await.gate, Position::Closed);
    }

    #[tokio::test]
    async fn failed_write_is_not_applied() {
        let (board, act, d) = setup();
        board.set_failing(Channel::LightRelay, true);
        let out = d
            .dispatch(CommandTopic::Light, b"ON", &SensorSnapshot::calm(), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Failed));
        assert!(!state(&act).await.light);
    }

    #[tokio::test]
    async fn gate_direct_commands() {
        let (board, act, d) = setup();
        let snap = SensorSnapshot::calm();
        d.dispatch(CommandTopic::Gate, b"OPEN", &snap, &act).await.unwrap();
        assert_eq!(board.output(Channel::Gate), Some(90.0));
        d.dispatch(CommandTopic::Gate, b"CLOSE", &snap, &act).await.unwrap();
        assert_eq!(board.output(Channel::Gate), Some(180.0));
    }

    // -- LPG valve ------------------------------------------------------------

    #[tokio::test]
    async fn valve_on_opens_when_safe() {
        let (board, act, d) = setup();
        d.dispatch(CommandTopic::LpgValve, b"ON", &SensorSnapshot::calm(), &act)
            .await
            .unwrap();
        assert_eq!(board.output(Channel::Valve), Some(VALVE_OPEN_DEG));
    }

    #[tokio::test]
    async fn valve_on_closes_during_hazard() {
        let (_board, act, d) = setup();
        act.lock().await.set_valve(Position::Open);
        let snap = SensorSnapshot {
            lpg: 0.8,
            ..SensorSnapshot::calm()
        };
        d.dispatch(CommandTopic::LpgValve, b"ON", &snap, &act).await.unwrap();
        assert_eq!(state(&act).await.valve, Position::Closed);
    }

    #[tokio::test]
    async fn valve_open_refused_while_engaged() {
        let (_board, act, d) = setup();
        act.lock().await.set_engaged(true);
        let out = d
            .dispatch(CommandTopic::LpgValve, b"OPEN", &SensorSnapshot::calm(), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Refused));
        assert_eq!(state(&act).await.valve, Position::Closed);
    }

    #[tokio::test]
    async fn valve_on_refused_while_engaged() {
        let (board, act, d) = setup();
        act.lock().await.set_engaged(true);
        let out = d
            .dispatch(CommandTopic::LpgValve, b"ON", &SensorSnapshot::calm(), &act)
            .await;
        assert_eq!(out, Ok(Outcome::Refused));
        assert_eq!(board.writes_to(Channel::Valve), vec![0.0]);
    }

    // -- Unknown vocabulary -----------------------------------------------------

    #[tokio::test]
    async fn unknown_verbs_are_ignored() {
        let (_board, act, d) = setup();
        let before = state(&act).await;
        let snap = SensorSnapshot::calm();
        for (topic, payload) in [
            (CommandTopic::Light, &b"CLOSE"[..]),
            (CommandTopic::Gate, &b"OFF"[..]),
            (CommandTopic::LpgValve, &b"maybe"[..]),
        ] {
            let out = d.dispatch(topic, payload, &snap, &act).await;
            assert_eq!(out, Ok(Outcome::Ignored));
        }
        assert_eq!(state(&act).await, before);
    }

    // -- Delivery task ----------------------------------------------------------

    struct Harness {
        commands: mpsc::Sender<PendingCommand>,
        snapshots: watch::Sender<Arc<SensorSnapshot>>,
        actuators: SharedActuators,
        publisher: Arc<RecordingPublisher>,
        shared: SharedState,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_task() -> Harness {
        let (_board, actuators, dispatcher) = setup();
        let (tx, rx) = mpsc::channel(8);
        let (snap_tx, snap_rx) = watch::channel(Arc::new(SensorSnapshot::calm()));
        let publisher = Arc::new(RecordingPublisher::default());
        let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
        let shutdown = CancellationToken::new();
        let task = DispatchTask {
            dispatcher,
            topics: Arc::new(Topics::new("LK/")),
            commands: rx,
            snapshots: snap_rx,
            actuators: actuators.clone(),
            publisher: publisher.clone(),
            shared: shared.clone(),
        };
        let handle = tokio::spawn(task.run(shutdown.clone()));
        Harness {
            commands: tx,
            snapshots: snap_tx,
            actuators,
            publisher,
            shared,
            shutdown,
            task: handle,
        }
    }

    fn cmd(topic: &str, payload: &str) -> PendingCommand {
        PendingCommand {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn task_uses_latest_snapshot_and_publishes_notice() {
        let h = spawn_task();
        h.snapshots.send_replace(Arc::new(sky(80.0, 0.3)));

        h.commands.send(cmd("LK/CLOTHES", "ON")).await.unwrap();
        h.commands.send(cmd("LK/R", "abc")).await.unwrap();
        h.commands.send(cmd("LK/Unknown", "ON")).await.unwrap();
        drop(h.commands);
        h.task.await.unwrap();

        assert_eq!(
            h.publisher.messages(),
            vec![("LK/RAIN".to_string(), "DETECTED".to_string())]
        );
        assert_eq!(state(&h.actuators).await.cover, Position::Closed);

        let st = h.shared.read().await;
        assert_eq!(st.counters.commands, 1);
        assert_eq!(st.counters.malformed, 1);
        assert_eq!(st.counters.ignored, 1);
    }

    #[tokio::test]
    async fn task_counts_refused_commands_as_rejected() {
        let h = spawn_task();
        h.actuators.lock().await.set_engaged(true);

        h.commands.send(cmd("LK/LPGR", "ON")).await.unwrap();
        h.commands.send(cmd("LK/Gate", "ON")).await.unwrap();
        drop(h.commands);
        h.task.await.unwrap();

        let st = h.shared.read().await;
        assert_eq!(st.counters.rejected, 1);
        assert_eq!(st.counters.ignored, 1);
        assert_eq!(st.counters.commands, 0);
        assert!(st.events.back().unwrap().detail.contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn task_finishes_gate_hold_before_stopping() {
        let h = spawn_task();
        h.snapshots.send_replace(Arc::new(SensorSnapshot {
            occupied: false,
            ..SensorSnapshot::calm()
        }));
        h.commands.send(cmd("LK/Gate", "ON")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state(&h.actuators).await.gate, Position::Open);

        h.shutdown.cancel();
        h.task.await.unwrap();
        assert_eq!(state(&h.actuators).await.gate, Position::Closed);
    }
}
