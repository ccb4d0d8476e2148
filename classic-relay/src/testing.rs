//! Hand-driven stand-ins for the transport, read timer and watchdog.

use bytes::Bytes;
use std::cell::Cell;
use std::sync::Arc;

use crate::modbus::{RequestId, Transport, TransportEvent};
use crate::poll::{OutstandingRequest, PollScheduler, ReadTimer, Watchdog};

/// Records every read instead of sending it.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub issued: Vec<(RequestId, u16, u16)>,
    /// Number of upcoming reads to refuse.
    pub refuse: usize,
    next: RequestId,
}

impl Transport for MockTransport {
    fn read_holding_registers(&mut self, address: u16, count: u16) -> Option<RequestId> {
        if self.refuse > 0 {
            self.refuse -= 1;
            return None;
        }
        let request = self.next;
        self.next = request.next();
        self.issued.push((request, address, count));
        Some(request)
    }
}

/// A read timer that only fires when told to.
#[derive(Debug, Default)]
pub struct ManualTimer {
    armed: Option<(Arc<OutstandingRequest>, RequestId)>,
}

impl ManualTimer {
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Expire the armed read. Returns whether it cleared the outstanding request.
    pub fn fire(&mut self) -> bool {
        match self.armed.take() {
            Some((outstanding, request)) => outstanding.clear_if(request),
            None => false,
        }
    }
}

impl ReadTimer for ManualTimer {
    fn arm(&mut self, outstanding: Arc<OutstandingRequest>, request: RequestId) {
        self.armed = Some((outstanding, request));
    }

    fn disarm(&mut self) {
        self.armed = None;
    }
}

#[derive(Debug, Default)]
pub struct CountingWatchdog(Cell<usize>);

impl CountingWatchdog {
    pub fn fed(&self) -> usize {
        self.0.get()
    }
}

impl Watchdog for CountingWatchdog {
    fn feed(&self) {
        self.0.set(self.0.get() + 1);
    }
}

pub type TestScheduler = PollScheduler<MockTransport, ManualTimer, CountingWatchdog>;

pub fn scheduler() -> TestScheduler {
    PollScheduler::new(
        MockTransport::default(),
        ManualTimer::default(),
        CountingWatchdog::default(),
    )
}

/// A successful response to the most recently issued read.
pub fn data_for(poller: &TestScheduler, bytes: Vec<u8>) -> TransportEvent {
    let (request, ..) = *poller
        .transport()
        .issued
        .last()
        .expect("no read has been issued");
    TransportEvent::Data {
        request,
        slave: 10,
        function: 0x03,
        bytes: Bytes::from(bytes),
    }
}
