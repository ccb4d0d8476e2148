//! Typed reads out of a raw holding-register response.
//!
//! Registers are addressed by their index within the response, two bytes each, big-endian within a
//! word. 32-bit values on the Classic are stored low word first, so the most significant half lives
//! in the *following* register.

/// A borrowed view over the bytes of a single read response.
#[derive(Clone, Copy, Debug)]
pub struct Registers<'a> {
    bytes: &'a [u8],
}

impl<'a> Registers<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Number of whole registers in the view.
    pub fn len(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn u16(&self, index: usize) -> u16 {
        let offset = index * 2;
        u16::from_be_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    pub fn i16(&self, index: usize) -> i16 {
        self.u16(index) as i16
    }

    pub fn u32(&self, index: usize) -> u32 {
        u32::from(self.u16(index + 1)) << 16 | u32::from(self.u16(index))
    }

    pub fn i32(&self, index: usize) -> i32 {
        self.u32(index) as i32
    }

    /// Signed register divided by `divisor`, e.g. tenths of a volt with `10.0`.
    pub fn scaled(&self, index: usize, divisor: f64) -> f64 {
        f64::from(self.i16(index)) / divisor
    }

    /// High byte of the register.
    pub fn msb(&self, index: usize) -> u8 {
        self.bytes[index * 2]
    }

    pub fn flag(&self, index: usize, mask: u16) -> bool {
        self.u16(index) & mask != 0
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn encode_u32(value: u32) -> [u8; 4] {
    let [hi_hi, hi_lo, lo_hi, lo_lo] = value.to_be_bytes();
    [lo_hi, lo_lo, hi_hi, hi_lo]
}

#[test]
fn reads_big_endian_words() {
    let bytes = [0x12, 0x34, 0xff, 0xfe];
    let regs = Registers::new(&bytes);

    assert_eq!(regs.len(), 2);
    assert_eq!(regs.u16(0), 0x1234);
    assert_eq!(regs.u16(1), 0xfffe);
    assert_eq!(regs.i16(1), -2);
    assert_eq!(regs.msb(0), 0x12);
}

#[test]
fn u32_takes_high_word_from_next_register() {
    // register 0 = 0x5678 (low word), register 1 = 0x1234 (high word)
    let bytes = [0x56, 0x78, 0x12, 0x34];
    let regs = Registers::new(&bytes);

    assert_eq!(regs.u32(0), 0x1234_5678);
    assert_eq!(regs.i32(0), 0x1234_5678);
}

#[test]
fn u32_round_trips_across_the_range() {
    let samples = (0..=u32::MAX)
        .step_by(65_521)
        .chain([0, 1, 0xffff, 0x1_0000, i32::MAX as u32, 0x8000_0000, u32::MAX]);

    for value in samples {
        let bytes = encode_u32(value);
        let regs = Registers::new(&bytes);
        assert_eq!(regs.u32(0), value);
        assert_eq!(regs.i32(0), value as i32);
    }
}

#[test]
fn i32_is_negative_when_high_word_has_sign_bit() {
    let bytes = encode_u32((-1234_i32) as u32);
    assert_eq!(Registers::new(&bytes).i32(0), -1234);
}

#[test]
fn scaled_uses_signed_source() {
    let bytes = [0x02, 0x0d, 0xff, 0x9c];
    let regs = Registers::new(&bytes);

    assert_eq!(regs.scaled(0, 10.0), 52.5);
    assert_eq!(regs.scaled(1, 10.0), -10.0);
    assert_eq!(regs.scaled(1, 1.0), -100.0);
}

#[test]
fn flag_masks_the_word() {
    let bytes = [0x40, 0x01];
    let regs = Registers::new(&bytes);

    assert!(regs.flag(0, 0x4000));
    assert!(!regs.flag(0, 0x8000));
    assert!(regs.flag(0, 0x0001));
}
