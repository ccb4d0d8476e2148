//! Switching relays from charger telemetry.
//!
//! Each relay has an "on" and a "restore" threshold. While the relay is on it is compared against
//! the on threshold, while off against the restore threshold, which gives a dead band between the
//! two. When the restore threshold is the lower of the two the sense is inverted: the relay turns
//! on when the measurement *drops*, e.g. a generator start on low state of charge.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::relay::Actuator;
use crate::telemetry::PublishedChargerData;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum MeasureKind {
    #[default]
    #[serde(rename = "SOC")]
    Soc,
    #[serde(rename = "BATVOLT")]
    BatteryVoltage,
    #[serde(rename = "BATCURRENT")]
    BatteryCurrent,
    #[serde(rename = "PVVOLT")]
    PvVoltage,
    #[serde(rename = "PVCURRENT")]
    PvCurrent,
    #[serde(rename = "IGNORE", other)]
    Ignore,
}

impl MeasureKind {
    /// The measured value, or `None` for [`MeasureKind::Ignore`].
    pub fn value(self, data: &PublishedChargerData) -> Option<f64> {
        match self {
            MeasureKind::Soc => Some(f64::from(data.soc)),
            MeasureKind::BatteryVoltage => Some(data.battery_voltage),
            MeasureKind::BatteryCurrent => Some(data.battery_current),
            MeasureKind::PvVoltage => Some(data.pv_voltage),
            MeasureKind::PvCurrent => Some(data.pv_current),
            MeasureKind::Ignore => None,
        }
    }
}

fn default_on_threshold() -> f64 {
    75.0
}

fn default_restore_threshold() -> f64 {
    85.0
}

/// Rounds to two decimals on the way out only.
fn round2<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let rounded = Decimal::from_f64(*value)
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|d| d.to_f64())
        .ok_or_else(|| serde::ser::Error::custom(format!("threshold {value} is not representable")))?;
    serializer.serialize_f64(rounded)
}

/// Auto-control settings for one relay.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct AutoControlEntry {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, alias = "me")]
    pub measure: MeasureKind,

    #[serde(
        rename = "value",
        alias = "vl",
        default = "default_on_threshold",
        serialize_with = "round2"
    )]
    pub on_threshold: f64,

    #[serde(
        rename = "restoreValue",
        alias = "rv",
        default = "default_restore_threshold",
        serialize_with = "round2"
    )]
    pub restore_threshold: f64,
}

impl Default for AutoControlEntry {
    fn default() -> Self {
        Self {
            enabled: false,
            measure: MeasureKind::default(),
            on_threshold: default_on_threshold(),
            restore_threshold: default_restore_threshold(),
        }
    }
}

impl AutoControlEntry {
    /// The relay turns on below the thresholds rather than above them.
    pub fn is_opposite(&self) -> bool {
        self.restore_threshold < self.on_threshold
    }

    pub fn desired_state(&self, value: f64, currently_on: bool) -> bool {
        let threshold = if currently_on {
            self.on_threshold
        } else {
            self.restore_threshold
        };
        let reached = value >= threshold;
        if self.is_opposite() {
            !reached
        } else {
            reached
        }
    }
}

/// Auto-control entries keyed by relay slot.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AutoControlConfig(BTreeMap<usize, AutoControlEntry>);

impl AutoControlConfig {
    pub fn get(&self, slot: usize) -> Option<&AutoControlEntry> {
        self.0.get(&slot)
    }

    /// Replace the entry for `slot` as a whole.
    pub fn set(&mut self, slot: usize, entry: AutoControlEntry) {
        self.0.insert(slot, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &AutoControlEntry)> {
        self.0.iter().map(|(slot, entry)| (*slot, entry))
    }

    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One evaluated relay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub slot: usize,
    pub measure: MeasureKind,
    pub value: f64,
    pub was_on: bool,
    pub on: bool,
}

impl Decision {
    pub fn changed(&self) -> bool {
        self.was_on != self.on
    }
}

/// Applies every enabled entry to `actuator`. Data older than `max_age` leaves all relays as they are.
pub fn evaluate<A>(
    config: &AutoControlConfig,
    data: &PublishedChargerData,
    now: Instant,
    max_age: Duration,
    actuator: &mut A,
) -> Vec<Decision>
where
    A: Actuator + ?Sized,
{
    let age = data.age(now);
    if age > max_age {
        debug!(?age, ?max_age, "Charger data too old, relays left unchanged");
        return vec![];
    }

    let mut decisions = vec![];
    for (slot, entry) in config.iter() {
        if !entry.enabled {
            continue;
        }
        let Some(value) = entry.measure.value(data) else {
            continue;
        };
        if slot >= actuator.relay_count() {
            warn!(slot, "Auto-control entry for a relay that does not exist");
            continue;
        }

        let was_on = actuator.relay_state(slot);
        let on = entry.desired_state(value, was_on);
        if on != was_on {
            info!(slot, measure = ?entry.measure, value, on, "Auto-control switching relay");
            actuator.set_relay_state(slot, on);
        }
        decisions.push(Decision {
            slot,
            measure: entry.measure,
            value,
            was_on,
            on,
        });
    }
    decisions
}

#[cfg(test)]
use crate::relay::MemoryRelays;
#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn entry(measure: MeasureKind, on_threshold: f64, restore_threshold: f64) -> AutoControlEntry {
    AutoControlEntry {
        enabled: true,
        measure,
        on_threshold,
        restore_threshold,
    }
}

#[cfg(test)]
fn snapshot(soc: u16, battery_voltage: f64, at: Instant) -> PublishedChargerData {
    PublishedChargerData {
        soc,
        battery_voltage,
        battery_current: -2.0,
        pv_voltage: 80.0,
        pv_current: 3.0,
        gathered_at: at,
    }
}

#[test]
fn normal_sense_uses_dead_band() {
    let soc = entry(MeasureKind::Soc, 75.0, 85.0);
    assert!(!soc.is_opposite());

    // off: needs the restore threshold to turn on
    assert!(soc.desired_state(90.0, false));
    assert!(!soc.desired_state(80.0, false));
    // on: stays on until below the on threshold
    assert!(soc.desired_state(80.0, true));
    assert!(!soc.desired_state(70.0, true));
}

#[test]
fn opposite_sense_turns_on_low() {
    let soc = entry(MeasureKind::Soc, 70.0, 65.0);
    assert!(soc.is_opposite());

    assert!(!soc.desired_state(72.0, true));
    assert!(soc.desired_state(68.0, true));
    // off: compared against the restore threshold, inverted
    assert!(soc.desired_state(64.0, false));
    assert!(!soc.desired_state(66.0, false));
}

#[test]
fn worked_hysteresis_cases() {
    let normal = entry(MeasureKind::Soc, 75.0, 85.0);
    assert!(!normal.desired_state(80.0, false));
    assert!(normal.desired_state(86.0, false));
    assert!(normal.desired_state(76.0, true));
    assert!(!normal.desired_state(74.0, true));

    let inverted = entry(MeasureKind::Soc, 75.0, 65.0);
    assert!(!inverted.desired_state(76.0, true));
    assert!(inverted.desired_state(64.0, false));
    // below the restore threshold, so an off relay turns on
    assert!(inverted.desired_state(60.0, false));
}

#[test]
fn equal_thresholds_are_plain_comparison() {
    let volts = entry(MeasureKind::BatteryVoltage, 26.0, 26.0);
    assert!(!volts.is_opposite());
    assert!(volts.desired_state(26.0, false));
    assert!(volts.desired_state(26.0, true));
    assert!(!volts.desired_state(25.9, true));
}

#[test]
fn evaluate_switches_only_on_change() {
    let now = Instant::now();
    let mut config = AutoControlConfig::default();
    config.set(0, entry(MeasureKind::Soc, 75.0, 85.0));
    config.set(1, entry(MeasureKind::BatteryVoltage, 24.0, 23.0));
    let mut relays = MemoryRelays::new(2);

    let decisions = evaluate(&config, &snapshot(90, 25.0, now), now, Duration::from_secs(120), &mut relays);
    assert_eq!(
        decisions,
        vec![
            Decision { slot: 0, measure: MeasureKind::Soc, value: 90.0, was_on: false, on: true },
            Decision { slot: 1, measure: MeasureKind::BatteryVoltage, value: 25.0, was_on: false, on: false },
        ]
    );
    assert!(relays.relay_state(0));
    assert_eq!(relays.switches(), 1);

    let decisions = evaluate(&config, &snapshot(80, 22.5, now), now, Duration::from_secs(120), &mut relays);
    assert!(decisions[0].on && !decisions[0].changed());
    assert!(decisions[1].on && decisions[1].changed());
    assert_eq!(relays.switches(), 2);
}

#[test]
fn stale_data_freezes_relays() {
    let gathered = Instant::now();
    let mut config = AutoControlConfig::default();
    config.set(0, entry(MeasureKind::Soc, 75.0, 85.0));
    let mut relays = MemoryRelays::new(1);

    let later = gathered + Duration::from_secs(121);
    let decisions = evaluate(&config, &snapshot(99, 27.0, gathered), later, Duration::from_secs(120), &mut relays);

    assert!(decisions.is_empty());
    assert!(!relays.relay_state(0));
}

#[test]
fn disabled_ignored_and_missing_relays_are_skipped() {
    let now = Instant::now();
    let mut config = AutoControlConfig::default();
    config.set(0, AutoControlEntry { enabled: false, ..entry(MeasureKind::Soc, 0.0, 0.0) });
    config.set(1, entry(MeasureKind::Ignore, 0.0, 0.0));
    config.set(5, entry(MeasureKind::Soc, 0.0, 0.0));
    let mut relays = MemoryRelays::new(2);

    let decisions = evaluate(&config, &snapshot(50, 25.0, now), now, Duration::from_secs(120), &mut relays);

    assert!(decisions.is_empty());
    assert_eq!(relays.switches(), 0);
}

#[test]
fn parse_config_document() {
    use serde_json::json;
    let config = serde_json::from_value::<AutoControlConfig>(json!({
        "0": { "enabled": true, "measure": "PVVOLT", "value": 120, "restoreValue": 100.5 },
        "2": { "enabled": true, "me": "BATCURRENT", "vl": -5, "rv": 5 },
        "3": { "measure": "FREQUENCY" },
        "4": {}
    }))
    .unwrap();

    assert_eq!(config.get(0), Some(&entry(MeasureKind::PvVoltage, 120.0, 100.5)));
    assert_eq!(config.get(2), Some(&entry(MeasureKind::BatteryCurrent, -5.0, 5.0)));
    assert_eq!(config.get(3).unwrap().measure, MeasureKind::Ignore);
    assert_eq!(config.get(4), Some(&AutoControlEntry::default()));
    assert_eq!(config.get(1), None);
}

#[test]
fn serialising_rounds_to_two_decimals() {
    use serde_json::json;
    let mut config = AutoControlConfig::default();
    config.set(1, entry(MeasureKind::BatteryVoltage, 25.126, 26.004));

    let value: serde_json::Value = serde_json::from_slice(&config.to_json().unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "1": { "enabled": true, "measure": "BATVOLT", "value": 25.13, "restoreValue": 26.0 }
        })
    );
}

#[test]
fn json_round_trip_is_stable() {
    let mut config = AutoControlConfig::default();
    config.set(0, entry(MeasureKind::Soc, 40.0, 60.0));
    config.set(3, entry(MeasureKind::PvCurrent, 2.5, 1.25));

    let decoded = AutoControlConfig::from_json(&config.to_json().unwrap()).unwrap();
    assert_eq!(decoded, config);
}
