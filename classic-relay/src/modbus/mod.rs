use bytes::Bytes;
use std::fmt;
use std::num::NonZeroU16;

pub mod bank;
pub mod connection;
pub mod decode;

pub type UnitId = tokio_modbus::prelude::SlaveId;

/// Identifies one issued read. Zero is reserved to mean "nothing outstanding".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(NonZeroU16);

impl RequestId {
    pub fn new(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(Self)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }

    /// The id after this one, skipping zero on wrap.
    pub fn next(self) -> Self {
        Self::new(self.get().wrapping_add(1)).unwrap_or(Self(NonZeroU16::MIN))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self(NonZeroU16::MIN)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Diagnostic attached to a failed read. Only ever logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    Timeout,
    InvalidSlave,
    InvalidFunction,
    CrcError,
    CommError,
}

impl ErrorCode {
    /// Maps an exception / client error byte as used on the wire by Modbus gateways.
    pub fn from_code(code: u8) -> Self {
        use ErrorCode::*;
        match code {
            0x00 => Success,
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x07 => NegativeAcknowledge,
            0x08 => MemoryParityError,
            0xE0 => Timeout,
            0xE1 => InvalidSlave,
            0xE2 => InvalidFunction,
            0xE3 => CrcError,
            _ => CommError,
        }
    }

    pub fn code(self) -> u8 {
        use ErrorCode::*;
        match self {
            Success => 0x00,
            IllegalFunction => 0x01,
            IllegalDataAddress => 0x02,
            IllegalDataValue => 0x03,
            ServerDeviceFailure => 0x04,
            Acknowledge => 0x05,
            ServerDeviceBusy => 0x06,
            NegativeAcknowledge => 0x07,
            MemoryParityError => 0x08,
            Timeout => 0xE0,
            InvalidSlave => 0xE1,
            InvalidFunction => 0xE2,
            CrcError => 0xE3,
            CommError => 0xE4,
        }
    }

    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut => ErrorCode::Timeout,
            ErrorKind::InvalidData => ErrorCode::InvalidFunction,
            ErrorKind::InvalidInput => ErrorCode::IllegalDataValue,
            _ => ErrorCode::CommError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, self.code())
    }
}

/// Completion messages delivered from the transport into the control loop.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A TCP session to the controller has been (re)established.
    Connected,
    Data {
        request: RequestId,
        slave: UnitId,
        function: u8,
        bytes: Bytes,
    },
    Error {
        request: RequestId,
        code: ErrorCode,
    },
}

/// Issues reads without waiting for them. Results come back later as [`TransportEvent`]s.
pub trait Transport {
    /// Queue a "read holding registers" request. `None` when the request could not be issued.
    fn read_holding_registers(&mut self, address: u16, count: u16) -> Option<RequestId>;
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn request_ids_skip_zero() {
    let last = RequestId::new(u16::MAX).unwrap();
    assert_eq!(last.next().get(), 1);
    assert_eq!(RequestId::default().next().get(), 2);
    assert!(RequestId::new(0).is_none());
}

#[test]
fn error_codes_map_both_ways() {
    for code in [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xE0, 0xE1, 0xE2, 0xE3, 0xE4] {
        assert_eq!(ErrorCode::from_code(code).code(), code);
    }
    assert_eq!(ErrorCode::from_code(0x42), ErrorCode::CommError);
}

#[test]
fn io_errors_map_to_codes() {
    use std::io::{Error, ErrorKind};
    assert_eq!(
        ErrorCode::from_io(&Error::new(ErrorKind::TimedOut, "slow")),
        ErrorCode::Timeout
    );
    assert_eq!(
        ErrorCode::from_io(&Error::new(ErrorKind::BrokenPipe, "gone")),
        ErrorCode::CommError
    );
}

#[test]
fn error_code_display_includes_wire_value() {
    assert_eq!(ErrorCode::CrcError.to_string(), "CrcError (0xe3)");
}
