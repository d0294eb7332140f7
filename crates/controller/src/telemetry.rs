//! Per-tick telemetry and the outbound publish seam.

use rumqttc::{AsyncClient, QoS};
use tracing::warn;

use crate::actuators::ActuatorState;
use crate::config::Thresholds;
use crate::mqtt::{TelemetryField, Topics};
use crate::sensors::SensorSnapshot;

/// Fire-and-forget publish. Implementations must not block: a message that
/// cannot be queued right away is reported as an error and dropped.
pub(crate) trait Publish: Send + Sync {
    fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;
}

impl Publish for AsyncClient {
    fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}

/// Dashboard spelling of a boolean.
fn flag(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

/// One tick's worth of outbound status.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Telemetry {
    pub(crate) fire_clear: bool,
    pub(crate) lpg_clear: bool,
    pub(crate) light_percentage: Option<f64>,
    pub(crate) light_on: bool,
    pub(crate) gate_angle: f32,
    pub(crate) occupied: bool,
    pub(crate) valve_angle: f32,
}

impl Telemetry {
    pub(crate) fn capture(
        snapshot: &SensorSnapshot,
        actuators: &ActuatorState,
        thresholds: &Thresholds,
    ) -> Self {
        Self {
            fire_clear: !snapshot.fire_hazard(thresholds),
            lpg_clear: !snapshot.lpg_hazard(thresholds),
            light_percentage: snapshot.light_percentage(),
            light_on: actuators.light,
            gate_angle: actuators.gate_angle(),
            occupied: snapshot.occupied,
            valve_angle: actuators.valve_angle(),
        }
    }

    /// Topic/payload pairs. The light percentage is left out while unknown.
    pub(crate) fn messages(&self, topics: &Topics) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(7);
        let mut push = |field, payload: String| out.push((topics.telemetry(field), payload));

        push(TelemetryField::Fire, flag(self.fire_clear).into());
        push(TelemetryField::Lpg, flag(self.lpg_clear).into());
        if let Some(pct) = self.light_percentage {
            push(TelemetryField::LightLevel, format!("{pct:.2}"));
        }
        push(
            TelemetryField::LightReadback,
            if self.light_on { "1" } else { "0" }.into(),
        );
        push(TelemetryField::GateAngle, self.gate_angle.to_string());
        push(TelemetryField::Occupancy, flag(self.occupied).into());
        push(TelemetryField::ValveAngle, self.valve_angle.to_string());
        out
    }
}

/// Publish every message; returns how many were dropped.
pub(crate) fn publish(telemetry: &Telemetry, topics: &Topics, publisher: &dyn Publish) -> usize {
    let mut dropped = 0;
    for (topic, payload) in telemetry.messages(topics) {
        if let Err(e) = publisher.publish(&topic, payload) {
            warn!(%topic, "telemetry dropped: {e}");
            dropped += 1;
        }
    }
    dropped
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    sent: std::sync::Mutex<Vec<(String, String)>>,
    /// When set, every publish fails as if the outbound queue were full.
    pub(crate) full: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingPublisher {
    pub(crate) fn messages(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn payload_for(&self, topic: &str) -> Option<String> {
        self.messages()
            .into_iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, p)| p)
    }
}

#[cfg(test)]
impl Publish for RecordingPublisher {
    fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        if self.full.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("outbound queue full");
        }
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((topic.to_string(), payload));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
