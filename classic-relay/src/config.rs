use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::auto::AutoControlConfig;

/// Tunables for polling, backoff and the liveness checks.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Timing {
    /// Last-resort bound on a single outstanding read.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// How long the transport waits for a response before reporting a timeout error.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_watchdog")]
    pub watchdog: Duration,

    /// Failed reads tolerated within one gather cycle.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_gather_interval")]
    pub gather_interval: Duration,

    /// Ceiling for the backed-off gather interval.
    #[serde(with = "humantime_serde", default = "default_max_gather_interval")]
    pub max_gather_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Period of the control loop.
    #[serde(with = "humantime_serde", default = "default_tick")]
    pub tick: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            request_timeout: default_request_timeout(),
            watchdog: default_watchdog(),
            max_attempts: default_max_attempts(),
            gather_interval: default_gather_interval(),
            max_gather_interval: default_max_gather_interval(),
            initial_delay: default_initial_delay(),
            tick: default_tick(),
        }
    }
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_watchdog() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_gather_interval() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_max_gather_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(15)
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_relay_count() -> usize {
    4
}

/// Everything read from the settings file.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub timing: Timing,

    /// Number of relay slots the actuator exposes.
    #[serde(default = "default_relay_count")]
    pub relays: usize,

    #[serde(default, alias = "relayControl")]
    pub auto_control: AutoControlConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            relays: default_relay_count(),
            auto_control: AutoControlConfig::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        let settings: Settings = serde_json::from_slice(&bytes)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> crate::Result<()> {
        match self.auto_control.slots().find(|&slot| slot >= self.relays) {
            Some(slot) => Err(crate::Error::UnknownRelay(slot)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn empty_document_uses_defaults() {
    let settings: Settings = serde_json::from_str("{}").unwrap();

    assert_eq!(settings.timing, Timing::default());
    assert_eq!(settings.timing.gather_interval, Duration::from_secs(120));
    assert_eq!(settings.timing.max_attempts, 3);
    assert_eq!(settings.relays, 4);
    assert!(settings.auto_control.is_empty());
}

#[test]
fn parse_humantime_durations() {
    use serde_json::json;
    let timing = serde_json::from_value::<Timing>(json!({
        "read_timeout": "90s",
        "gather_interval": "1m 30s",
        "tick": "250ms",
        "max_attempts": 5,
    }))
    .unwrap();

    assert_eq!(timing.read_timeout, Duration::from_secs(90));
    assert_eq!(timing.gather_interval, Duration::from_secs(90));
    assert_eq!(timing.tick, Duration::from_millis(250));
    assert_eq!(timing.max_attempts, 5);
    assert_eq!(timing.max_gather_interval, Duration::from_secs(3600));
}

#[test]
fn parse_full_settings() {
    use serde_json::json;
    let settings = serde_json::from_value::<Settings>(json!({
        "timing": { "watchdog": "5m" },
        "relays": 2,
        "auto_control": {
            "0": { "enabled": true, "measure": "BATVOLT", "value": 24.5, "restoreValue": 26 },
            "1": { "enabled": false }
        }
    }))
    .unwrap();

    assert_eq!(settings.timing.watchdog, Duration::from_secs(300));
    assert_eq!(settings.auto_control.slots().collect::<Vec<_>>(), vec![0, 1]);
    assert!(settings.validate().is_ok());
}

#[test]
fn rejects_entries_for_missing_relays() {
    use serde_json::json;
    let settings = serde_json::from_value::<Settings>(json!({
        "relays": 1,
        "auto_control": { "3": { "enabled": true } }
    }))
    .unwrap();

    assert!(matches!(
        settings.validate(),
        Err(crate::Error::UnknownRelay(3))
    ));
}
