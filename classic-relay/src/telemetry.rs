use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Everything decoded from the controller. Filled in bank by bank while a gather cycle runs; only
/// the fields of banks marked `received` are current.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChargeControllerInfo {
    // Bank A, refreshed every cycle
    pub battery_voltage: f64,
    pub pv_voltage: f64,
    pub battery_current: f64,
    pub energy_today: f64,
    pub power: f64,
    pub charge_state: u8,
    pub pv_current: f64,
    pub total_energy: f64,
    pub info_flags: u32,
    pub battery_temperature: f64,
    pub fet_temperature: f64,
    pub pcb_temperature: f64,
    pub float_time_today_seconds: u16,
    pub absorb_time: u16,
    pub equalize_time: u16,
    pub aux1: bool,
    pub aux2: bool,

    // Bank A, identity
    pub model: String,
    pub build_date: String,
    pub last_voc: f64,
    pub unit_id: u32,
    pub mac_address: String,

    // Bank B, whizbang shunt
    pub positive_amp_hours: u32,
    pub negative_amp_hours: u32,
    pub net_amp_hours: i32,
    pub shunt_temperature: f64,
    pub whizbang_battery_current: f64,
    pub soc: u16,
    pub remaining_amp_hours: u16,
    pub total_amp_hours: u16,

    // Bank C
    pub mppt_mode: u16,
    pub has_whizbang: bool,

    // Bank D
    pub regulation_setpoint: f64,
    pub nominal_battery_voltage: u16,
    pub ending_amps: f64,
    pub reason_for_resting: u16,

    // Bank E
    pub app_version: String,
    pub net_version: String,
}

/// The subset of telemetry consumed outside the gatherer. Always replaced as a whole.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PublishedChargerData {
    pub soc: u16,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub pv_voltage: f64,
    pub pv_current: f64,
    pub gathered_at: Instant,
}

impl PublishedChargerData {
    pub(crate) fn capture(info: &ChargeControllerInfo, gathered_at: Instant) -> Self {
        Self {
            soc: info.soc,
            battery_voltage: info.battery_voltage,
            // The shunt reading is the one that sees loads, not just the charge current.
            battery_current: info.whizbang_battery_current,
            pv_voltage: info.pv_voltage,
            pv_current: info.pv_current,
            gathered_at,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.gathered_at)
    }

    /// Serialisable form with the gather time expressed as a unix timestamp.
    pub fn report(&self, now: Instant) -> ChargerReport {
        let gathered_at = SystemTime::now()
            .checked_sub(self.age(now))
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();

        ChargerReport {
            soc: self.soc,
            battery_voltage: self.battery_voltage,
            battery_current: self.battery_current,
            pv_voltage: self.pv_voltage,
            pv_current: self.pv_current,
            gathered_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChargerReport {
    pub soc: u16,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub pv_voltage: f64,
    pub pv_current: f64,
    pub gathered_at: u64,
}

/// Charge stage as reported in the high byte of register 4120.
pub fn charge_state_name(code: u8) -> &'static str {
    match code {
        0 => "resting",
        3 => "absorb",
        4 => "bulk mppt",
        5 => "float",
        6 => "float mppt",
        7 => "equalize",
        10 => "hyper voc",
        18 => "equalize mppt",
        _ => "unknown",
    }
}

/// Why the controller last went to rest (register 4275).
pub fn reason_for_resting_name(code: u16) -> &'static str {
    match code {
        1 => "anti-click, not enough power available",
        2 => "insane Ibatt measurement",
        3 => "negative current",
        4 => "PV input voltage lower than battery voltage",
        5 => "too low of power out and Vbatt below set point",
        6 => "FET temperature too high",
        7 => "ground fault detected",
        8 => "arc fault detected",
        9 => "too much negative current while operating",
        10 => "battery is less than 8.0 volts",
        11 => "PV input is available but V is rising too slowly",
        12 => "Voc has gone down from last Voc or low light",
        13 => "Voc has gone up from last Voc enough to be suspicious",
        14 | 15 => "PV input is available but V is rising too slowly",
        16 => "mode changed",
        17 => "input voltage too high",
        18 => "external FET fault",
        19 => "battery voltage too high",
        20 => "EEPROM write failure",
        _ => "unknown",
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn capture_takes_battery_current_from_shunt() {
    let info = ChargeControllerInfo {
        soc: 91,
        battery_voltage: 27.4,
        battery_current: 12.0,
        whizbang_battery_current: -3.5,
        pv_voltage: 88.1,
        pv_current: 4.2,
        ..Default::default()
    };
    let at = Instant::now();
    let published = PublishedChargerData::capture(&info, at);

    assert_eq!(
        published,
        PublishedChargerData {
            soc: 91,
            battery_voltage: 27.4,
            battery_current: -3.5,
            pv_voltage: 88.1,
            pv_current: 4.2,
            gathered_at: at,
        }
    );
}

#[test]
fn report_serialises_measurements() {
    let at = Instant::now();
    let published = PublishedChargerData {
        soc: 80,
        battery_voltage: 26.5,
        battery_current: 1.5,
        pv_voltage: 70.0,
        pv_current: 2.0,
        gathered_at: at,
    };
    let json = serde_json::to_value(published.report(at)).unwrap();

    assert_eq!(json["soc"], 80);
    assert_eq!(json["battery_voltage"], 26.5);
    assert!(json["gathered_at"].as_u64().unwrap() > 0);
}

#[test]
fn status_codes_have_readable_names() {
    assert_eq!(charge_state_name(0), "resting");
    assert_eq!(charge_state_name(4), "bulk mppt");
    assert_eq!(charge_state_name(99), "unknown");
    assert_eq!(
        reason_for_resting_name(4),
        "PV input voltage lower than battery voltage"
    );
    assert_eq!(reason_for_resting_name(15), reason_for_resting_name(11));
    assert_eq!(reason_for_resting_name(0), "unknown");
}
