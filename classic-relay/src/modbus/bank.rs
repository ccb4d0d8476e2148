use super::decode::Registers;
use crate::telemetry::ChargeControllerInfo;

/// The five holding-register ranges read from the Classic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BankId {
    /// 4101.. live charger readings plus identity
    Status,
    /// 4361.. whizbang shunt readings
    Whizbang,
    /// 4164.. MPPT mode and aux function
    Aux,
    /// 4244.. regulation setpoints
    Setpoints,
    /// 16387.. firmware versions
    Firmware,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refresh {
    /// Re-read at the start of every gather cycle.
    EveryCycle,
    /// Read once per device session and cached.
    Once,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BankSpec {
    pub id: BankId,
    pub address: u16,
    pub count: u16,
    pub refresh: Refresh,
    /// Whether a gather cycle can only succeed once this bank has been received.
    pub required: bool,
}

pub const BANKS: [BankSpec; 5] = [
    BankSpec {
        id: BankId::Status,
        address: 4100,
        count: 44,
        refresh: Refresh::EveryCycle,
        required: true,
    },
    BankSpec {
        id: BankId::Whizbang,
        address: 4360,
        count: 22,
        refresh: Refresh::EveryCycle,
        required: true,
    },
    BankSpec {
        id: BankId::Aux,
        address: 4163,
        count: 2,
        refresh: Refresh::Once,
        required: true,
    },
    BankSpec {
        id: BankId::Setpoints,
        address: 4243,
        count: 32,
        refresh: Refresh::Once,
        required: false,
    },
    BankSpec {
        id: BankId::Firmware,
        address: 16386,
        count: 4,
        refresh: Refresh::Once,
        required: false,
    },
];

impl BankId {
    pub const ALL: [BankId; 5] = [
        BankId::Status,
        BankId::Whizbang,
        BankId::Aux,
        BankId::Setpoints,
        BankId::Firmware,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn spec(self) -> &'static BankSpec {
        &BANKS[self.index()]
    }

    /// Responses carry no address, so the register count is what identifies the bank.
    pub fn by_count(count: usize) -> Option<BankId> {
        BANKS
            .iter()
            .find(|spec| usize::from(spec.count) == count)
            .map(|spec| spec.id)
    }

    /// Write the bank's fields into `info`. `regs` must hold exactly `spec().count` registers.
    pub fn decode(self, regs: Registers<'_>, info: &mut ChargeControllerInfo, once: &mut OneShotState) {
        debug_assert_eq!(regs.len(), usize::from(self.spec().count));
        match self {
            BankId::Status => decode_status(regs, info, once),
            BankId::Whizbang => decode_whizbang(regs, info),
            BankId::Aux => {
                if once.capture() {
                    decode_aux(regs, info)
                }
            }
            BankId::Setpoints => {
                if once.capture() {
                    decode_setpoints(regs, info)
                }
            }
            BankId::Firmware => {
                if once.capture() {
                    decode_firmware(regs, info)
                }
            }
        }
    }
}

/// Whether the session-invariant part of a bank has been decoded yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OneShotState {
    #[default]
    Pending,
    Captured,
}

impl OneShotState {
    /// Returns `true` exactly once, moving from `Pending` to `Captured`.
    fn capture(&mut self) -> bool {
        let pending = *self == OneShotState::Pending;
        *self = OneShotState::Captured;
        pending
    }
}

/// Runtime view of one bank within the poll rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterBank {
    pub id: BankId,
    pub received: bool,
    pub one_shot: OneShotState,
}

impl RegisterBank {
    pub fn all() -> [RegisterBank; 5] {
        BankId::ALL.map(|id| RegisterBank {
            id,
            received: false,
            one_shot: OneShotState::Pending,
        })
    }

    pub fn spec(&self) -> &'static BankSpec {
        self.id.spec()
    }
}

fn decode_status(regs: Registers<'_>, info: &mut ChargeControllerInfo, once: &mut OneShotState) {
    info.battery_voltage = regs.scaled(14, 10.0);
    info.pv_voltage = regs.scaled(15, 10.0);
    info.battery_current = regs.scaled(16, 10.0);
    info.energy_today = regs.scaled(17, 10.0);
    info.power = regs.scaled(18, 1.0);
    info.charge_state = regs.msb(19);
    info.pv_current = regs.scaled(20, 10.0);
    info.total_energy = f64::from(regs.u32(25)) / 10.0;
    info.info_flags = regs.u32(29);
    info.battery_temperature = regs.scaled(31, 10.0);
    info.fet_temperature = regs.scaled(32, 10.0);
    info.pcb_temperature = regs.scaled(33, 10.0);
    info.float_time_today_seconds = regs.u16(37);
    info.absorb_time = regs.u16(38);
    info.equalize_time = regs.u16(42);
    info.aux1 = regs.flag(29, 0x4000);
    info.aux2 = regs.flag(29, 0x8000);

    if once.capture() {
        let unit_type = regs.u16(0);
        info.model = format!("Classic {} (rev {})", unit_type & 0x00ff, unit_type >> 8);

        let year = regs.u16(1);
        let month_day = regs.u16(2);
        info.build_date = format!("{}{:02}{:02}", year, month_day >> 8, month_day & 0x00ff);

        info.last_voc = regs.scaled(21, 10.0);
        info.unit_id = regs.u32(10);

        let [a, b] = regs.u16(7).to_be_bytes();
        let [c, d] = regs.u16(6).to_be_bytes();
        let [e, f] = regs.u16(5).to_be_bytes();
        info.mac_address = format!("{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{f:02x}");
    }
}

fn decode_whizbang(regs: Registers<'_>, info: &mut ChargeControllerInfo) {
    info.positive_amp_hours = regs.u32(4);
    info.negative_amp_hours = regs.i32(6).unsigned_abs();
    // Always 0: the companion monitoring clients fail to parse a negative value here.
    info.net_amp_hours = 0;
    info.shunt_temperature = f64::from(regs.u16(11) & 0x00ff) - 50.0;
    info.whizbang_battery_current = regs.scaled(10, 10.0);
    info.soc = regs.u16(12);
    info.remaining_amp_hours = regs.u16(16);
    info.total_amp_hours = regs.u16(20);
}

/// Aux 1/2 function code that means a whizbang junior shunt is fitted.
const AUX_FUNCTION_WHIZBANG: u16 = 18;

fn decode_aux(regs: Registers<'_>, info: &mut ChargeControllerInfo) {
    info.mppt_mode = regs.u16(0);
    let aux_function = (regs.u16(1) & 0x3f00) >> 8;
    info.has_whizbang = aux_function == AUX_FUNCTION_WHIZBANG;
}

fn decode_setpoints(regs: Registers<'_>, info: &mut ChargeControllerInfo) {
    info.regulation_setpoint = regs.scaled(0, 10.0);
    info.nominal_battery_voltage = regs.u16(1);
    info.ending_amps = regs.scaled(2, 10.0);
    info.reason_for_resting = regs.u16(31);
}

fn decode_firmware(regs: Registers<'_>, info: &mut ChargeControllerInfo) {
    info.app_version = regs.u32(0).to_string();
    info.net_version = regs.u32(2).to_string();
}

#[cfg(test)]
pub(crate) fn response(bank: BankId, words: &[(usize, u16)]) -> Vec<u8> {
    let mut bytes = vec![0; usize::from(bank.spec().count) * 2];
    for &(index, word) in words {
        bytes[index * 2..index * 2 + 2].copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn bank_counts_are_unique() {
    for spec in BANKS.iter() {
        assert_eq!(BankId::by_count(usize::from(spec.count)), Some(spec.id));
        assert_eq!(spec.id.spec(), spec);
    }
    assert_eq!(BankId::by_count(7), None);
}

#[test]
fn decoding_is_total_for_every_bank() {
    for id in BankId::ALL {
        for fill in [0x00, 0x7f, 0x80, 0xff] {
            let bytes = vec![fill; usize::from(id.spec().count) * 2];
            let mut info = ChargeControllerInfo::default();
            let mut once = OneShotState::Pending;
            id.decode(Registers::new(&bytes), &mut info, &mut once);
            if id != BankId::Whizbang {
                assert_eq!(once, OneShotState::Captured);
            }
        }
    }
}

#[test]
fn decode_status_bank() {
    let bytes = response(
        BankId::Status,
        &[
            (0, 0x0296),             // rev 2, Classic 150
            (1, 2023),               // build year
            (2, 0x0b07),             // November 7th
            (5, 0x5566),             // mac, lowest
            (6, 0x3344),
            (7, 0x0011),             // mac, highest
            (10, 0x5678),            // unit id, low word
            (11, 0x1234),            // unit id, high word
            (14, 276),               // 27.6 V battery
            (15, 912),               // 91.2 V PV
            (16, 125),               // 12.5 A battery
            (17, 43),                // 4.3 kWh today
            (18, 345),               // 345 W
            (19, 0x0500),            // float
            (20, 38),                // 3.8 A PV
            (21, 1234),              // last VOC 123.4
            (25, 12345),             // total energy low word
            (26, 0),                 // total energy high word
            (29, 0x4000),            // aux 1 on, aux 2 off
            (31, (-52_i16) as u16),  // -5.2 C battery
            (32, 301),
            (33, 289),
            (37, 600),
            (38, 7200),
            (42, 30),
        ],
    );

    let mut info = ChargeControllerInfo::default();
    let mut once = OneShotState::Pending;
    BankId::Status.decode(Registers::new(&bytes), &mut info, &mut once);

    assert_eq!(info.battery_voltage, 27.6);
    assert_eq!(info.pv_voltage, 91.2);
    assert_eq!(info.battery_current, 12.5);
    assert_eq!(info.energy_today, 4.3);
    assert_eq!(info.power, 345.0);
    assert_eq!(info.charge_state, 5);
    assert_eq!(info.pv_current, 3.8);
    assert_eq!(info.total_energy, 1234.5);
    assert_eq!(info.info_flags, 0x4000);
    assert!(info.aux1);
    assert!(!info.aux2);
    assert_eq!(info.battery_temperature, -5.2);
    assert_eq!(info.fet_temperature, 30.1);
    assert_eq!(info.pcb_temperature, 28.9);
    assert_eq!(info.float_time_today_seconds, 600);
    assert_eq!(info.absorb_time, 7200);
    assert_eq!(info.equalize_time, 30);

    assert_eq!(info.model, "Classic 150 (rev 2)");
    assert_eq!(info.build_date, "20231107");
    assert_eq!(info.last_voc, 123.4);
    assert_eq!(info.unit_id, 0x1234_5678);
    assert_eq!(info.mac_address, "00:11:33:44:55:66");
}

#[test]
fn status_identity_is_never_overwritten() {
    let first = response(BankId::Status, &[(0, 0x0196), (14, 250)]);
    let second = response(BankId::Status, &[(0, 0x03fa), (14, 260)]);

    let mut info = ChargeControllerInfo::default();
    let mut once = OneShotState::Pending;
    BankId::Status.decode(Registers::new(&first), &mut info, &mut once);
    BankId::Status.decode(Registers::new(&second), &mut info, &mut once);

    assert_eq!(info.model, "Classic 150 (rev 1)");
    assert_eq!(info.battery_voltage, 26.0);
}

#[test]
fn decode_whizbang_bank() {
    let negative = (-4321_i32) as u32;
    let bytes = response(
        BankId::Whizbang,
        &[
            (4, 1500),
            (5, 1),
            (6, negative as u16),
            (7, (negative >> 16) as u16),
            (8, 0x1111),
            (9, 0x2222),
            (10, (-35_i16) as u16),
            (11, 0xab48), // high byte is noise, 72 - 50 = 22 C
            (12, 87),
            (16, 410),
            (20, 470),
        ],
    );

    let mut info = ChargeControllerInfo::default();
    BankId::Whizbang.decode(Registers::new(&bytes), &mut info, &mut OneShotState::Pending);

    assert_eq!(info.positive_amp_hours, 0x1_0000 + 1500);
    assert_eq!(info.negative_amp_hours, 4321);
    assert_eq!(info.net_amp_hours, 0);
    assert_eq!(info.whizbang_battery_current, -3.5);
    assert_eq!(info.shunt_temperature, 22.0);
    assert_eq!(info.soc, 87);
    assert_eq!(info.remaining_amp_hours, 410);
    assert_eq!(info.total_amp_hours, 470);
}

#[test]
fn decode_aux_detects_whizbang() {
    let mut info = ChargeControllerInfo::default();
    let bytes = response(BankId::Aux, &[(0, 0x0001), (1, 0xd2ff)]);
    BankId::Aux.decode(Registers::new(&bytes), &mut info, &mut OneShotState::Pending);

    assert_eq!(info.mppt_mode, 1);
    assert!(info.has_whizbang);

    let mut info = ChargeControllerInfo::default();
    let bytes = response(BankId::Aux, &[(1, 0x1100)]);
    BankId::Aux.decode(Registers::new(&bytes), &mut info, &mut OneShotState::Pending);
    assert!(!info.has_whizbang);
}

#[test]
fn decode_setpoints_once() {
    let mut info = ChargeControllerInfo::default();
    let mut once = OneShotState::Pending;

    let bytes = response(BankId::Setpoints, &[(0, 288), (1, 24), (2, 40), (31, 4)]);
    BankId::Setpoints.decode(Registers::new(&bytes), &mut info, &mut once);
    let bytes = response(BankId::Setpoints, &[(0, 300), (1, 48), (2, 10), (31, 9)]);
    BankId::Setpoints.decode(Registers::new(&bytes), &mut info, &mut once);

    assert_eq!(info.regulation_setpoint, 28.8);
    assert_eq!(info.nominal_battery_voltage, 24);
    assert_eq!(info.ending_amps, 4.0);
    assert_eq!(info.reason_for_resting, 4);
}

#[test]
fn decode_firmware_versions() {
    let mut info = ChargeControllerInfo::default();
    let bytes = response(BankId::Firmware, &[(0, 2079), (1, 0), (2, 0x86a0), (3, 0x0001)]);
    BankId::Firmware.decode(Registers::new(&bytes), &mut info, &mut OneShotState::Pending);

    assert_eq!(info.app_version, "2079");
    assert_eq!(info.net_version, "100000");
}
