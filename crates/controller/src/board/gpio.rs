//! Raspberry Pi backend: rppal GPIO for digital, PWM and servo channels and
//! an ADS1115 on I2C bus 1 for the four analog sensors.

use rppal::gpio::{Gpio, InputPin, Level, OutputPin};
use rppal::i2c::I2c;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::{thread, time::Duration};

use super::{Board, Channel, IoMode};
use crate::config::BoardConfig;
use crate::error::BoardError;

// ── ADS1115 ─────────────────────────────────────────────────────────────────

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100 (128 SPS),
/// comparator off. MUX is OR-ed in per channel.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
const CONVERSION_WAIT: Duration = Duration::from_millis(9);
const ADC_FULL_SCALE: f32 = 32767.0;

/// Consecutive failed bus transactions before the link counts as lost.
const MAX_BUS_FAILURES: u32 = 10;

// ── Servo timing (standard hobby servo) ─────────────────────────────────────

const SERVO_PERIOD: Duration = Duration::from_millis(20);
const SERVO_MIN_PULSE_US: f32 = 500.0;
const SERVO_MAX_PULSE_US: f32 = 2500.0;

const PWM_FREQUENCY_HZ: f64 = 500.0;

fn config_for_channel(adc_channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[adc_channel as usize] << MUX_SHIFT)
}

fn servo_pulse(angle: f32) -> Duration {
    let a = angle.clamp(0.0, 180.0);
    let us = SERVO_MIN_PULSE_US + a / 180.0 * (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US);
    Duration::from_micros(us.round() as u64)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Board ───────────────────────────────────────────────────────────────────

pub(crate) struct GpioBoard {
    outputs: Mutex<HashMap<Channel, OutputPin>>,
    inputs: Mutex<HashMap<Channel, InputPin>>,
    written: Mutex<HashMap<Channel, f32>>,
    i2c: Mutex<I2c>,
    adc_channels: HashMap<Channel, u8>,
    relay_active_low: bool,
    bus_failures: AtomicU32,
}

impl GpioBoard {
    pub(crate) fn new(cfg: &BoardConfig) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let p = &cfg.pins;

        let mut outputs = HashMap::new();
        for (channel, pin) in [
            (Channel::LightRelay, p.light_relay),
            (Channel::Buzzer, p.buzzer),
            (Channel::Gate, p.gate),
            (Channel::Cover, p.cover),
            (Channel::Valve, p.valve),
            (Channel::Red, p.red),
            (Channel::Green, p.green),
            (Channel::Blue, p.blue),
        ] {
            let mut out = gpio.get(pin as u8)?.into_output();
            if channel.mode() == IoMode::DigitalOut {
                // Fail-safe: relay and buzzer start OFF.
                out.write(Self::level(false, cfg.relay_active_low && channel == Channel::LightRelay));
            }
            outputs.insert(channel, out);
        }

        let mut inputs = HashMap::new();
        for (channel, pin) in [(Channel::Occupancy, p.occupancy), (Channel::Button, p.button)] {
            inputs.insert(channel, gpio.get(pin as u8)?.into_input_pullup());
        }

        let mut i2c = I2c::new()?;
        i2c.set_slave_address(cfg.adc.address)?;

        let a = &cfg.adc;
        let adc_channels = HashMap::from([
            (Channel::Fire, a.fire as u8),
            (Channel::Lpg, a.lpg as u8),
            (Channel::Light, a.light as u8),
            (Channel::Rain, a.rain as u8),
        ]);

        tracing::info!(
            addr = format_args!("0x{:02x}", cfg.adc.address),
            relay_active_low = cfg.relay_active_low,
            "gpio board initialised"
        );

        Ok(Self {
            outputs: Mutex::new(outputs),
            inputs: Mutex::new(inputs),
            written: Mutex::new(HashMap::new()),
            i2c: Mutex::new(i2c),
            adc_channels,
            relay_active_low: cfg.relay_active_low,
            bus_failures: AtomicU32::new(0),
        })
    }

    fn level(on: bool, active_low: bool) -> Level {
        match (on, active_low) {
            (true, false) | (false, true) => Level::High,
            (true, true) | (false, false) => Level::Low,
        }
    }

    fn read_adc(&self, channel: Channel, adc_channel: u8) -> Result<f32, BoardError> {
        let io = |e: rppal::i2c::Error| BoardError::Io {
            channel,
            detail: e.to_string(),
        };
        let mut i2c = lock(&self.i2c);
        i2c.block_write(REG_CONFIG, &config_for_channel(adc_channel).to_be_bytes())
            .map_err(io)?;
        thread::sleep(CONVERSION_WAIT);
        let mut buf = [0u8; 2];
        i2c.block_read(REG_CONVERSION, &mut buf).map_err(io)?;
        let raw = i16::from_be_bytes(buf).max(0);
        Ok((raw as f32 / ADC_FULL_SCALE).clamp(0.0, 1.0))
    }

    fn track_bus<T>(&self, result: Result<T, BoardError>) -> Result<T, BoardError> {
        match &result {
            Ok(_) => self.bus_failures.store(0, Ordering::Relaxed),
            Err(_) => {
                self.bus_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

impl Board for GpioBoard {
    fn read(&self, channel: Channel) -> Result<Option<f32>, BoardError> {
        match channel.mode() {
            IoMode::AnalogIn => {
                let adc_channel = *self
                    .adc_channels
                    .get(&channel)
                    .ok_or(BoardError::Unwired(channel))?;
                self.track_bus(self.read_adc(channel, adc_channel)).map(Some)
            }
            IoMode::DigitalIn => {
                let inputs = lock(&self.inputs);
                let pin = inputs.get(&channel).ok_or(BoardError::Unwired(channel))?;
                Ok(Some(if pin.is_high() { 1.0 } else { 0.0 }))
            }
            _ => Ok(lock(&self.written).get(&channel).copied()),
        }
    }

    fn write(&self, channel: Channel, value: f32) -> Result<(), BoardError> {
        let mut outputs = lock(&self.outputs);
        let pin = outputs
            .get_mut(&channel)
            .ok_or(BoardError::Unwired(channel))?;
        let pwm_err = |e: rppal::gpio::Error| BoardError::Io {
            channel,
            detail: e.to_string(),
        };
        match channel.mode() {
            IoMode::DigitalOut => {
                let active_low = self.relay_active_low && channel == Channel::LightRelay;
                pin.write(Self::level(value >= 0.5, active_low));
            }
            IoMode::PwmOut => pin
                .set_pwm_frequency(PWM_FREQUENCY_HZ, f64::from(value.clamp(0.0, 1.0)))
                .map_err(pwm_err)?,
            IoMode::ServoOut => pin
                .set_pwm(SERVO_PERIOD, servo_pulse(value))
                .map_err(pwm_err)?,
            IoMode::AnalogIn | IoMode::DigitalIn => return Err(BoardError::Unwired(channel)),
        }
        lock(&self.written).insert(channel, value);
        Ok(())
    }

    fn check_link(&self) -> Result<(), BoardError> {
        let failures = self.bus_failures.load(Ordering::Relaxed);
        if failures >= MAX_BUS_FAILURES {
            Err(BoardError::Disconnected(format!(
                "{failures} consecutive i2c failures"
            )))
        } else {
            Ok(())
        }
    }

    fn blocking_reads(&self) -> bool {
        true
    }

    fn release(&self) {
        let mut outputs = lock(&self.outputs);
        for (channel, pin) in outputs.iter_mut() {
            if matches!(channel.mode(), IoMode::PwmOut | IoMode::ServoOut) {
                let _ = pin.clear_pwm();
            }
        }
        // Dropping the pins resets them to inputs.
        outputs.clear();
        lock(&self.inputs).clear();
        tracing::info!("gpio board released");
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
