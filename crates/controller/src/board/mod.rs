//! Sensor/actuator board boundary. The controller only sees logical
//! channels; the `gpio` feature adds the Raspberry Pi backend, and the
//! simulated board is always available for development and tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::config::{Backend, BoardConfig};
use crate::error::BoardError;

#[cfg(feature = "gpio")]
pub(crate) mod gpio;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoMode {
    DigitalIn,
    DigitalOut,
    AnalogIn,
    PwmOut,
    ServoOut,
}

/// Every physical input and output the controller addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Channel {
    Fire,
    Lpg,
    Light,
    Rain,
    Occupancy,
    Button,
    LightRelay,
    Gate,
    Cover,
    Valve,
    Buzzer,
    Red,
    Green,
    Blue,
}

impl Channel {
    #[cfg(test)]
    pub(crate) const ALL: [Channel; 14] = [
        Self::Fire,
        Self::Lpg,
        Self::Light,
        Self::Rain,
        Self::Occupancy,
        Self::Button,
        Self::LightRelay,
        Self::Gate,
        Self::Cover,
        Self::Valve,
        Self::Buzzer,
        Self::Red,
        Self::Green,
        Self::Blue,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Fire => "fire",
            Self::Lpg => "lpg",
            Self::Light => "light",
            Self::Rain => "rain",
            Self::Occupancy => "occupancy",
            Self::Button => "button",
            Self::LightRelay => "light_relay",
            Self::Gate => "gate",
            Self::Cover => "cover",
            Self::Valve => "valve",
            Self::Buzzer => "buzzer",
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
        }
    }

    pub(crate) fn mode(self) -> IoMode {
        match self {
            Self::Fire | Self::Lpg | Self::Light | Self::Rain => IoMode::AnalogIn,
            Self::Occupancy | Self::Button => IoMode::DigitalIn,
            Self::LightRelay | Self::Buzzer => IoMode::DigitalOut,
            Self::Gate | Self::Cover | Self::Valve => IoMode::ServoOut,
            Self::Red | Self::Green | Self::Blue => IoMode::PwmOut,
        }
    }

    pub(crate) fn is_input(self) -> bool {
        matches!(self.mode(), IoMode::AnalogIn | IoMode::DigitalIn)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Board capability
// ---------------------------------------------------------------------------

/// Opaque sensor/actuator transport.
///
/// Values are normalised: analog inputs read 0.0-1.0, digital channels read
/// and write 0.0 / 1.0, PWM channels take a 0.0-1.0 duty and servo channels
/// take an angle in degrees.
pub(crate) trait Board: Send + Sync {
    /// `Ok(None)` means the channel has not produced a value yet.
    fn read(&self, channel: Channel) -> Result<Option<f32>, BoardError>;

    fn write(&self, channel: Channel, value: f32) -> Result<(), BoardError>;

    /// Fails with [`BoardError::Disconnected`] once the link is gone.
    fn check_link(&self) -> Result<(), BoardError>;

    /// Release pins and buses. Called once, on the way out.
    fn release(&self);

    /// Reads park the calling thread (e.g. waiting on an ADC conversion).
    fn blocking_reads(&self) -> bool {
        false
    }
}

/// Build the backend named in the config.
pub(crate) fn open(cfg: &BoardConfig) -> anyhow::Result<Arc<dyn Board>> {
    match cfg.backend {
        Backend::Sim => Ok(Arc::new(SimBoard::new())),
        #[cfg(feature = "gpio")]
        Backend::Gpio => Ok(Arc::new(gpio::GpioBoard::new(cfg)?)),
        #[cfg(not(feature = "gpio"))]
        Backend::Gpio => anyhow::bail!("backend \"gpio\" requires the `gpio` feature"),
    }
}

// ---------------------------------------------------------------------------
// Simulated board (development + tests, no hardware)
// ---------------------------------------------------------------------------

/// In-memory board. Inputs start at their idle, hazard-free values and can
/// be changed at runtime; every successful write is recorded.
pub(crate) struct SimBoard {
    inputs: Mutex<HashMap<Channel, Option<f32>>>,
    outputs: Mutex<HashMap<Channel, f32>>,
    /// Most recent successful writes, oldest first.
    #[cfg_attr(not(test), allow(dead_code))]
    writes: Mutex<VecDeque<(Channel, f32)>>,
    failing: Mutex<HashSet<Channel>>,
    linked: AtomicBool,
    #[cfg_attr(not(test), allow(dead_code))]
    released: AtomicBool,
}

/// Write history retained by [`SimBoard`].
const MAX_RECORDED_WRITES: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBoard {
    pub(crate) fn new() -> Self {
        let inputs = HashMap::from([
            (Channel::Fire, Some(1.0)),
            (Channel::Lpg, Some(0.0)),
            (Channel::Light, Some(0.5)),
            (Channel::Rain, Some(0.9)),
            (Channel::Occupancy, Some(1.0)),
            (Channel::Button, Some(1.0)),
        ]);
        info!("[sim-board] initialised (no hardware)");
        Self {
            inputs: Mutex::new(inputs),
            outputs: Mutex::new(HashMap::new()),
            writes: Mutex::new(VecDeque::with_capacity(MAX_RECORDED_WRITES)),
            failing: Mutex::new(HashSet::new()),
            linked: AtomicBool::new(true),
            released: AtomicBool::new(false),
        }
    }

    fn fails(&self, channel: Channel) -> bool {
        lock(&self.failing).contains(&channel)
    }
}

#[cfg(test)]
impl SimBoard {
    pub(crate) fn set_input(&self, channel: Channel, value: Option<f32>) {
        lock(&self.inputs).insert(channel, value);
    }

    /// Make every read and write on `channel` fail until cleared.
    pub(crate) fn set_failing(&self, channel: Channel, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(channel);
        } else {
            set.remove(&channel);
        }
    }

    pub(crate) fn disconnect(&self) {
        self.linked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn output(&self, channel: Channel) -> Option<f32> {
        lock(&self.outputs).get(&channel).copied()
    }

    /// Successful writes to `channel`, oldest first.
    pub(crate) fn writes_to(&self, channel: Channel) -> Vec<f32> {
        lock(&self.writes)
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl Board for SimBoard {
    fn read(&self, channel: Channel) -> Result<Option<f32>, BoardError> {
        self.check_link()?;
        if self.fails(channel) {
            return Err(BoardError::Io {
                channel,
                detail: "simulated read failure".into(),
            });
        }
        if !channel.is_input() {
            return Ok(lock(&self.outputs).get(&channel).copied());
        }
        Ok(lock(&self.inputs).get(&channel).copied().flatten())
    }

    fn write(&self, channel: Channel, value: f32) -> Result<(), BoardError> {
        self.check_link()?;
        if channel.is_input() {
            return Err(BoardError::Unwired(channel));
        }
        if self.fails(channel) {
            return Err(BoardError::Io {
                channel,
                detail: "simulated write failure".into(),
            });
        }
        lock(&self.outputs).insert(channel, value);
        let mut writes = lock(&self.writes);
        if writes.len() >= MAX_RECORDED_WRITES {
            writes.pop_front();
        }
        writes.push_back((channel, value));
        drop(writes);
        debug!(%channel, value, "[sim-board] write");
        Ok(())
    }

    fn check_link(&self) -> Result<(), BoardError> {
        if self.linked.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BoardError::Disconnected("simulated link down".into()))
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        info!("[sim-board] released");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_modes_cover_every_channel() {
        let inputs = Channel::ALL.iter().filter(|c| c.is_input()).count();
        assert_eq!(inputs, 6);
        assert_eq!(Channel::Gate.mode(), IoMode::ServoOut);
        assert_eq!(Channel::Red.mode(), IoMode::PwmOut);
        assert_eq!(Channel::Buzzer.mode(), IoMode::DigitalOut);
    }

    #[test]
    fn sim_board_starts_hazard_free() {
        let board = SimBoard::new();
        assert_eq!(board.read(Channel::Fire).unwrap(), Some(1.0));
        assert_eq!(board.read(Channel::Lpg).unwrap(), Some(0.0));
        assert_eq!(board.read(Channel::Button).unwrap(), Some(1.0));
    }

    #[test]
    fn sim_board_records_writes() {
        let board = SimBoard::new();
        board.write(Channel::Gate, 90.0).unwrap();
        board.write(Channel::Gate, 180.0).unwrap();
        assert_eq!(board.writes_to(Channel::Gate), vec![90.0, 180.0]);
        assert_eq!(board.output(Channel::Gate), Some(180.0));
        assert_eq!(board.read(Channel::Gate).unwrap(), Some(180.0));
    }

    #[test]
    fn sim_board_rejects_writes_to_inputs() {
        let board = SimBoard::new();
        assert!(matches!(
            board.write(Channel::Fire, 1.0),
            Err(BoardError::Unwired(Channel::Fire))
        ));
    }

    #[test]
    fn sim_board_failing_channel() {
        let board = SimBoard::new();
        board.set_failing(Channel::Rain, true);
        assert!(board.read(Channel::Rain).is_err());
        board.set_failing(Channel::Rain, false);
        assert_eq!(board.read(Channel::Rain).unwrap(), Some(0.9));
    }

    #[test]
    fn sim_board_disconnect_is_sticky() {
        let board = SimBoard::new();
        board.disconnect();
        assert!(matches!(
            board.check_link(),
            Err(BoardError::Disconnected(_))
        ));
        assert!(board.read(Channel::Fire).is_err());
        assert!(board.write(Channel::Buzzer, 1.0).is_err());
    }

    #[test]
    fn open_builds_sim_backend() {
        let board = open(&BoardConfig::default()).unwrap();
        assert!(board.check_link().is_ok());
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn open_gpio_without_feature_fails() {
        let cfg = BoardConfig {
            backend: Backend::Gpio,
            ..BoardConfig::default()
        };
        let err = open(&cfg).err().unwrap();
        assert!(err.to_string().contains("gpio"));
    }

    #[test]
    fn sim_board_write_history_is_bounded() {
        let board = SimBoard::new();
        for i in 0..100_000u32 {
            board.write(Channel::Red, (i % 2) as f32).unwrap();
        }
        let red = board.writes_to(Channel::Red);
        assert_eq!(red.len(), MAX_RECORDED_WRITES);
        assert_eq!(red.last(), Some(&1.0));
        assert_eq!(board.output(Channel::Red), Some(1.0));
    }
}
