use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MqttConfig;
use crate::dispatch::{CommandTopic, PendingCommand};
use crate::error::ControllerError;
use crate::state::SharedState;

/// Outbound request queue depth of the client handle.
const CLIENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TelemetryField {
    Fire,
    Lpg,
    LightLevel,
    LightReadback,
    GateAngle,
    Occupancy,
    ValveAngle,
}

impl TelemetryField {
    fn suffix(self) -> &'static str {
        match self {
            Self::Fire => "Fire",
            Self::Lpg => "Lpg",
            Self::LightLevel => "Ld",
            Self::LightReadback => "LightR",
            Self::GateAngle => "GateR",
            Self::Occupancy => "Theif",
            Self::ValveAngle => "LPGv",
        }
    }
}

/// Every topic lives under one configurable prefix (e.g. "LK/").
#[derive(Debug, Clone)]
pub(crate) struct Topics {
    prefix: String,
}

impl Topics {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Map an inbound topic back to its command. `None` for anything else.
    pub(crate) fn command(&self, topic: &str) -> Option<CommandTopic> {
        let suffix = topic.strip_prefix(self.prefix.as_str())?;
        CommandTopic::ALL.into_iter().find(|c| c.suffix() == suffix)
    }

    pub(crate) fn inbound(&self) -> Vec<String> {
        CommandTopic::ALL
            .iter()
            .map(|c| format!("{}{}", self.prefix, c.suffix()))
            .collect()
    }

    pub(crate) fn telemetry(&self, field: TelemetryField) -> String {
        format!("{}{}", self.prefix, field.suffix())
    }

    pub(crate) fn rain(&self) -> String {
        format!("{}RAIN", self.prefix)
    }
}

// ---------------------------------------------------------------------------
// Client setup
// ---------------------------------------------------------------------------

pub(crate) fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    AsyncClient::new(opts, CLIENT_CAPACITY)
}

/// Queue a subscription to every inbound topic without waiting on the
/// event loop (the caller is the event loop).
fn subscribe_all(client: &AsyncClient, topics: &Topics) -> Result<(), ControllerError> {
    for topic in topics.inbound() {
        client
            .try_subscribe(&topic, QoS::AtLeastOnce)
            .map_err(|e| ControllerError::TransportDisconnected(format!("subscribe {topic}: {e}")))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Event-loop pump
// ---------------------------------------------------------------------------

pub(crate) struct Pump {
    pub(crate) eventloop: EventLoop,
    pub(crate) client: AsyncClient,
    pub(crate) topics: Arc<Topics>,
    pub(crate) commands: mpsc::Sender<PendingCommand>,
    pub(crate) shared: SharedState,
}

impl Pump {
    /// Poll the broker connection and forward inbound publishes to the
    /// dispatcher. Any connection error ends the pump and cancels the
    /// rest of the controller.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let result = self.pump(&shutdown).await;
        self.shared.write().await.mqtt_connected = false;
        if let Err(e) = &result {
            error!("{e}");
            self.shared.write().await.record_error(e.to_string());
            shutdown.cancel();
        }
        result
    }

    async fn pump(&mut self, shutdown: &CancellationToken) -> Result<(), ControllerError> {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = self.eventloop.poll() => event,
            };
            if self.handle(event).await? == Flow::Stop {
                return Ok(());
            }
        }
    }

    /// React to one event-loop result.
    async fn handle(
        &mut self,
        event: Result<Event, ConnectionError>,
    ) -> Result<Flow, ControllerError> {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(ControllerError::TransportDisconnected(format!(
                        "connection refused: {:?}",
                        ack.code
                    )));
                }
                subscribe_all(&self.client, &self.topics)?;
                info!("MQTT connected, subscribed to command topics");
                let mut st = self.shared.write().await;
                st.mqtt_connected = true;
                st.record_system("MQTT connected".into());
                Ok(Flow::Continue)
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                debug!(topic = %p.topic, "inbound publish");
                let cmd = PendingCommand {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                };
                // A closed queue means the dispatcher has stopped.
                if self.commands.send(cmd).await.is_err() {
                    return Ok(Flow::Stop);
                }
                Ok(Flow::Continue)
            }
            Ok(Event::Incoming(Packet::Disconnect)) => Err(ControllerError::TransportDisconnected(
                "broker sent disconnect".into(),
            )),
            Ok(_) => Ok(Flow::Continue),
            Err(e) => Err(ControllerError::TransportDisconnected(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

// ===========================================================================
// Tests
// ===========================================================================
