//! Fixed-period control loop. One tick:
//!
//! ```text
//! link check ─▶ sample ─▶ publish snapshot ─▶ button toggle ─▶ interlock ─▶ telemetry
//! ```
//!
//! The interlock may hold the tick for the alarm pattern; missed ticks are
//! delayed rather than bursted. Boards whose reads block are sampled inside
//! `block_in_place`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actuators::SharedActuators;
use crate::board::Board;
use crate::config::Thresholds;
use crate::debounce::DebouncedToggle;
use crate::error::ControllerError;
use crate::interlock::{Interlock, InterlockState};
use crate::mqtt::Topics;
use crate::sensors::{SensorGateway, SensorSnapshot};
use crate::state::SharedState;
use crate::telemetry::{self, Publish, Telemetry};

pub(crate) struct ControlLoop {
    board: Arc<dyn Board>,
    gateway: SensorGateway,
    toggle: DebouncedToggle,
    interlock: Interlock,
    actuators: SharedActuators,
    snapshots: watch::Sender<Arc<SensorSnapshot>>,
    publisher: Arc<dyn Publish>,
    topics: Arc<Topics>,
    shared: SharedState,
    thresholds: Thresholds,
    period: Duration,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        board: Arc<dyn Board>,
        gateway: SensorGateway,
        actuators: SharedActuators,
        snapshots: watch::Sender<Arc<SensorSnapshot>>,
        publisher: Arc<dyn Publish>,
        topics: Arc<Topics>,
        shared: SharedState,
        thresholds: Thresholds,
        period: Duration,
    ) -> Self {
        Self {
            board,
            gateway,
            toggle: DebouncedToggle::new(thresholds.debounce_delay()),
            interlock: Interlock::new(thresholds),
            actuators,
            snapshots,
            publisher,
            topics,
            shared,
            thresholds,
            period,
        }
    }

    /// Tick until shutdown (observed only between ticks) or a fatal error.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period_ms = self.period.as_millis() as u64,
            fire = self.thresholds.fire,
            lpg = self.thresholds.lpg,
            "control loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("control loop stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                shutdown.cancel();
                return Err(e);
            }
        }
    }

    pub(crate) async fn tick(&mut self) -> Result<(), ControllerError> {
        self.board.check_link()?;

        let now = Instant::now();
        let snapshot = if self.board.blocking_reads() {
            let gateway = &mut self.gateway;
            Arc::new(tokio::task::block_in_place(|| gateway.sample(now)))
        } else {
            Arc::new(self.gateway.sample(now))
        };

        {
            // The engaged mark changes in the same critical section as the
            // snapshot, so a command judged against this snapshot meets the
            // matching mark.
            let mut act = self.actuators.lock().await;
            act.set_engaged(snapshot.hazard(&self.thresholds).is_some());
            self.snapshots.send_replace(Arc::clone(&snapshot));

            self.toggle.sync_output(act.state().light);
            if let Some(ev) = self.toggle.update(snapshot.button, snapshot.taken_at) {
                info!(on = ev.on, "button toggled light");
                act.set_light(ev.on);
            }
        }

        self.interlock.run(&snapshot, &self.actuators).await;
        let hazard = match self.interlock.state() {
            InterlockState::Hazard(kind) => Some(kind),
            InterlockState::Normal => None,
        };

        let actuators = self.actuators.lock().await.state().clone();
        let connected = self.shared.read().await.mqtt_connected;
        let dropped = if connected {
            let t = Telemetry::capture(&snapshot, &actuators, &self.thresholds);
            telemetry::publish(&t, &self.topics, self.publisher.as_ref())
        } else {
            debug!("broker not connected, telemetry skipped");
            0
        };

        let mut st = self.shared.write().await;
        st.record_hazard(hazard);
        st.record_tick(snapshot, actuators, dropped);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
