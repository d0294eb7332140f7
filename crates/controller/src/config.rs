//! TOML config file loading and validation. Every section has defaults, so
//! an absent file or an empty one yields a working simulated setup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub thresholds: Thresholds,
    pub control: ControlConfig,
    pub board: BoardConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Prepended to every inbound and outbound topic name.
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "home-controller".into(),
            keep_alive_secs: 60,
            topic_prefix: "LK/".into(),
        }
    }
}

/// Hazard and automation thresholds. Fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Fire sensor reads *below* this when flame is present.
    pub fire: f32,
    /// LPG sensor reads *above* this when gas is present.
    pub lpg: f32,
    /// Rain sensor reads below this when wet.
    pub rain: f32,
    /// Light percentage below which it counts as dark.
    pub light: f64,
    pub debounce_ms: u64,
}

impl Thresholds {
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fire: 0.5,
            lpg: 0.5,
            rain: 0.7,
            light: 45.0,
            debounce_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_ms: u64,
    pub gate_hold_secs: u64,
    pub command_queue: usize,
}

impl ControlConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn gate_hold(&self) -> Duration {
        Duration::from_secs(self.gate_hold_secs)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            gate_hold_secs: 5,
            command_queue: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sim,
    Gpio,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub backend: Backend,
    /// Many relay boards switch on a LOW output.
    pub relay_active_low: bool,
    pub pins: PinMap,
    pub adc: AdcConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sim,
            relay_active_low: false,
            pins: PinMap::default(),
            adc: AdcConfig::default(),
        }
    }
}

/// BCM GPIO numbers for every digital, PWM and servo channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinMap {
    pub light_relay: i64,
    pub buzzer: i64,
    pub gate: i64,
    pub cover: i64,
    pub valve: i64,
    pub red: i64,
    pub green: i64,
    pub blue: i64,
    pub occupancy: i64,
    pub button: i64,
}

impl PinMap {
    pub fn entries(&self) -> [(&'static str, i64); 10] {
        [
            ("light_relay", self.light_relay),
            ("buzzer", self.buzzer),
            ("gate", self.gate),
            ("cover", self.cover),
            ("valve", self.valve),
            ("red", self.red),
            ("green", self.green),
            ("blue", self.blue),
            ("occupancy", self.occupancy),
            ("button", self.button),
        ]
    }
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            light_relay: 17,
            buzzer: 27,
            gate: 12,
            cover: 13,
            valve: 19,
            red: 5,
            green: 6,
            blue: 26,
            occupancy: 23,
            button: 24,
        }
    }
}

/// ADS1115 wiring for the four analog sensors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub address: u16,
    pub fire: i64,
    pub lpg: i64,
    pub light: i64,
    pub rain: i64,
}

impl AdcConfig {
    pub fn entries(&self) -> [(&'static str, i64); 4] {
        [
            ("fire", self.fire),
            ("lpg", self.lpg),
            ("light", self.light),
            ("rain", self.rain),
        ]
    }
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            address: 0x48,
            fire: 3,
            lpg: 2,
            light: 0,
            rain: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM pins exposed on the 40-pin header, minus GPIO 2/3 which carry the
/// I2C bus the ADC sits on.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 4..=27;

const MAX_ADC_CHANNEL: i64 = 3;

const TICK_MS_RANGE: std::ops::RangeInclusive<u64> = 100..=200;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error listing every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_control(&mut errors);
        self.validate_board(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        if m.keep_alive_secs == 0 {
            errors.push("mqtt: keep_alive_secs must be positive".into());
        }
        if m.topic_prefix.contains(['+', '#']) {
            errors.push(format!(
                "mqtt: topic_prefix {:?} must not contain wildcards",
                m.topic_prefix
            ));
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        for (name, v) in [("fire", t.fire), ("lpg", t.lpg), ("rain", t.rain)] {
            if !(0.0..=1.0).contains(&v) {
                errors.push(format!(
                    "thresholds: {name} {v} out of range [0.0, 1.0]"
                ));
            }
        }
        if !(0.0..=100.0).contains(&t.light) {
            errors.push(format!(
                "thresholds: light {} out of range [0, 100]",
                t.light
            ));
        }
        if t.debounce_ms == 0 {
            errors.push("thresholds: debounce_ms must be positive".into());
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        if !TICK_MS_RANGE.contains(&c.tick_ms) {
            errors.push(format!(
                "control: tick_ms {} out of range [{}, {}]",
                c.tick_ms,
                TICK_MS_RANGE.start(),
                TICK_MS_RANGE.end()
            ));
        }
        if c.gate_hold_secs == 0 {
            errors.push("control: gate_hold_secs must be positive".into());
        }
        if c.command_queue == 0 {
            errors.push("control: command_queue must be positive".into());
        }
    }

    fn validate_board(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();
        for (name, pin) in self.board.pins.entries() {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "board.pins: {name} pin {pin} is not a usable BCM GPIO pin (allowed: 4-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "board.pins: {name} pin {pin} is already used by another channel"
                ));
            }
        }

        let mut seen_channels: HashSet<i64> = HashSet::new();
        for (name, ch) in self.board.adc.entries() {
            if !(0..=MAX_ADC_CHANNEL).contains(&ch) {
                errors.push(format!(
                    "board.adc: {name} channel {ch} out of range (0-{MAX_ADC_CHANNEL})"
                ));
            } else if !seen_channels.insert(ch) {
                errors.push(format!(
                    "board.adc: {name} channel {ch} is already used by another sensor"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    apply_env(&mut config, |k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Apply `MQTT_HOST`, `MQTT_PORT` and `WEB_PORT` overrides. Unparseable
/// ports are ignored.
fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|s| s.parse().ok()) {
        config.mqtt.port = port;
    }
    if let Some(port) = var("WEB_PORT").and_then(|s| s.parse().ok()) {
        config.web.port = port;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "LK/");
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.control.tick_ms, 100);
        assert_eq!(config.board.backend, Backend::Sim);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
[mqtt]
host = "192.168.248.70"

[thresholds]
rain = 0.6
light = 50

[control]
gate_hold_secs = 8

[board]
backend = "gpio"
relay_active_low = true

[board.pins]
gate = 16

[board.adc]
address = 0x49
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mqtt.host, "192.168.248.70");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.thresholds.rain, 0.6);
        assert_eq!(config.thresholds.light, 50.0);
        assert_eq!(config.thresholds.fire, 0.5);
        assert_eq!(config.control.gate_hold(), Duration::from_secs(8));
        assert_eq!(config.board.backend, Backend::Gpio);
        assert!(config.board.relay_active_low);
        assert_eq!(config.board.pins.gate, 16);
        assert_eq!(config.board.pins.cover, 13);
        assert_eq!(config.board.adc.address, 0x49);
        config.validate().unwrap();
    }

    #[test]
    fn parse_unknown_backend_fails() {
        let toml_str = "[board]\nbackend = \"firmata\"\n";
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn durations_derive_from_millis() {
        let cfg = Config::default();
        assert_eq!(cfg.thresholds.debounce_delay(), Duration::from_millis(100));
        assert_eq!(cfg.control.tick_period(), Duration::from_millis(100));
    }

    // -- Thresholds -------------------------------------------------------

    #[test]
    fn threshold_fire_out_of_range() {
        let mut cfg = Config::default();
        cfg.thresholds.fire = 1.5;
        assert_validation_err(&cfg, "fire 1.5 out of range");
    }

    #[test]
    fn threshold_rain_negative() {
        let mut cfg = Config::default();
        cfg.thresholds.rain = -0.1;
        assert_validation_err(&cfg, "rain -0.1 out of range");
    }

    #[test]
    fn threshold_light_is_percentage() {
        let mut cfg = Config::default();
        cfg.thresholds.light = 101.0;
        assert_validation_err(&cfg, "light 101 out of range [0, 100]");
    }

    #[test]
    fn threshold_debounce_zero() {
        let mut cfg = Config::default();
        cfg.thresholds.debounce_ms = 0;
        assert_validation_err(&cfg, "debounce_ms must be positive");
    }

    // -- Control / MQTT ---------------------------------------------------

    #[test]
    fn tick_too_fast_rejected() {
        let mut cfg = Config::default();
        cfg.control.tick_ms = 50;
        assert_validation_err(&cfg, "tick_ms 50 out of range [100, 200]");
    }

    #[test]
    fn tick_too_slow_rejected() {
        let mut cfg = Config::default();
        for ms in [201, 500, 1000] {
            cfg.control.tick_ms = ms;
            assert_validation_err(&cfg, &format!("tick_ms {ms} out of range [100, 200]"));
        }
    }

    #[test]
    fn tick_boundaries_accepted() {
        let mut cfg = Config::default();
        cfg.control.tick_ms = 100;
        cfg.validate().unwrap();
        cfg.control.tick_ms = 200;
        cfg.validate().unwrap();
    }

    #[test]
    fn gate_hold_zero_rejected() {
        let mut cfg = Config::default();
        cfg.control.gate_hold_secs = 0;
        assert_validation_err(&cfg, "gate_hold_secs must be positive");
    }

    #[test]
    fn wildcard_prefix_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topic_prefix = "home/+/".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn empty_host_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.host = " ".into();
        assert_validation_err(&cfg, "host is empty");
    }

    // -- Board ------------------------------------------------------------

    #[test]
    fn i2c_pins_rejected() {
        let mut cfg = Config::default();
        cfg.board.pins.buzzer = 2;
        assert_validation_err(&cfg, "buzzer pin 2 is not a usable BCM GPIO pin");
    }

    #[test]
    fn pin_28_rejected() {
        let mut cfg = Config::default();
        cfg.board.pins.red = 28;
        assert_validation_err(&cfg, "red pin 28");
    }

    #[test]
    fn duplicate_pin_rejected() {
        let mut cfg = Config::default();
        cfg.board.pins.green = cfg.board.pins.red;
        assert_validation_err(&cfg, "green pin 5 is already used");
    }

    #[test]
    fn adc_channel_out_of_range() {
        let mut cfg = Config::default();
        cfg.board.adc.rain = 4;
        assert_validation_err(&cfg, "rain channel 4 out of range");
    }

    #[test]
    fn adc_duplicate_channel() {
        let mut cfg = Config::default();
        cfg.board.adc.lpg = cfg.board.adc.fire;
        assert_validation_err(&cfg, "lpg channel 3 is already used");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.thresholds.lpg = 2.0;
        cfg.control.tick_ms = 0;
        cfg.board.pins.gate = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("lpg 2 out of range"), "got: {msg}");
        assert!(msg.contains("tick_ms 0"), "got: {msg}");
        assert!(msg.contains("gate pin 0"), "got: {msg}");
    }

    // -- Env overrides ----------------------------------------------------

    #[test]
    fn env_overrides_applied() {
        let vars = HashMap::from([
            ("MQTT_HOST", "broker.lan"),
            ("MQTT_PORT", "8883"),
            ("WEB_PORT", "not-a-port"),
        ]);
        let mut cfg = Config::default();
        apply_env(&mut cfg, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.web.port, 8080);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = load("/nonexistent/controller.toml").unwrap();
        assert_eq!(cfg.thresholds, Thresholds::default());
    }
}
