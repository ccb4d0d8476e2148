use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::modbus::bank::{BankId, RegisterBank, Refresh};
use crate::modbus::decode::Registers;
use crate::modbus::{ErrorCode, RequestId, Transport, TransportEvent, UnitId};
use crate::telemetry::ChargeControllerInfo;

/// The id of the single in-flight read, shared with the read timer which may clear it from another
/// task at any time. Zero means nothing is outstanding.
#[derive(Debug, Default)]
pub struct OutstandingRequest(AtomicU16);

impl OutstandingRequest {
    pub fn get(&self) -> Option<RequestId> {
        RequestId::new(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, request: RequestId) {
        self.0.store(request.get(), Ordering::Release);
    }

    /// Clears the cell if it still holds `request`. Returns whether it did.
    pub fn clear_if(&self, request: RequestId) -> bool {
        self.0
            .compare_exchange(request.get(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Bounds how long a read may stay outstanding. When it fires it must clear `outstanding` (if it
/// still holds the request it was armed for) and nothing else.
pub trait ReadTimer {
    fn arm(&mut self, outstanding: Arc<OutstandingRequest>, request: RequestId);
    fn disarm(&mut self);
}

/// Last-resort liveness check; restarts the process when it goes hungry.
pub trait Watchdog {
    fn feed(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Awaiting { bank: BankId, request: RequestId },
}

/// Result of a single [`PollScheduler::poll`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    Requested(BankId),
    /// The transport refused the request. Counts against the cycle.
    IssueFailed(BankId),
    NothingToDo,
    /// A request is still in flight.
    Waiting,
}

/// What a transport event did to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Decoded(BankId),
    /// The device or transport reported an error for the outstanding read. Counts against the cycle.
    Failed(ErrorCode),
    /// The event was for a request that is no longer outstanding.
    Stale,
    /// The response length matched none of the banks.
    Unmatched,
    Reconnected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub requests: u64,
    pub issue_failures: u64,
    pub responses: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub stale: u64,
}

/// Walks the banks in a fixed order with at most one read outstanding.
pub struct PollScheduler<T, R, W> {
    transport: T,
    timer: R,
    watchdog: W,
    banks: [RegisterBank; 5],
    cursor: usize,
    state: PollState,
    outstanding: Arc<OutstandingRequest>,
    stats: PollStats,
}

impl<T, R, W> PollScheduler<T, R, W>
where
    T: Transport,
    R: ReadTimer,
    W: Watchdog,
{
    pub fn new(transport: T, timer: R, watchdog: W) -> Self {
        Self {
            transport,
            timer,
            watchdog,
            banks: RegisterBank::all(),
            cursor: 0,
            state: PollState::Idle,
            outstanding: Arc::default(),
            stats: PollStats::default(),
        }
    }

    /// Issue the next read if nothing is in flight.
    pub fn poll(&mut self) -> PollStatus {
        if self.outstanding.get().is_some() {
            return PollStatus::Waiting;
        }

        if let PollState::Awaiting { bank, request } = self.state {
            // Only the read timer clears the cell behind our back.
            warn!(?bank, %request, "Modbus read timed out, request abandoned");
            self.stats.timeouts += 1;
            self.state = PollState::Idle;
        }

        let len = self.banks.len();
        let Some(index) = (self.cursor..len)
            .chain(0..self.cursor)
            .find(|&i| !self.banks[i].received)
        else {
            self.cursor = 0;
            return PollStatus::NothingToDo;
        };
        self.cursor = index + 1;

        let spec = self.banks[index].spec();
        match self.transport.read_holding_registers(spec.address, spec.count) {
            Some(request) => {
                debug!(
                    bank = ?spec.id,
                    address = spec.address,
                    count = spec.count,
                    %request,
                    "Requested registers"
                );
                self.outstanding.set(request);
                self.timer.arm(Arc::clone(&self.outstanding), request);
                self.state = PollState::Awaiting {
                    bank: spec.id,
                    request,
                };
                self.stats.requests += 1;
                PollStatus::Requested(spec.id)
            }
            None => {
                error!(bank = ?spec.id, address = spec.address, "Could not issue register read");
                self.stats.issue_failures += 1;
                PollStatus::IssueFailed(spec.id)
            }
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent, info: &mut ChargeControllerInfo) -> Completion {
        match event {
            TransportEvent::Connected => {
                self.forget_identity();
                Completion::Reconnected
            }
            TransportEvent::Data {
                request,
                slave,
                function,
                bytes,
            } => self.on_data(request, slave, function, &bytes, info),
            TransportEvent::Error { request, code } => self.on_error(request, code),
        }
    }

    fn on_data(
        &mut self,
        request: RequestId,
        slave: UnitId,
        function: u8,
        bytes: &[u8],
        info: &mut ChargeControllerInfo,
    ) -> Completion {
        let awaited = self.awaited_bank();
        if !self.complete(request) {
            return Completion::Stale;
        }
        self.stats.responses += 1;

        let count = bytes.len() / 2;
        debug!(%request, slave, function, count, "Received registers");

        let Some(bank) = BankId::by_count(count).filter(|_| bytes.len() % 2 == 0) else {
            warn!(%request, bytes = bytes.len(), "Response matches no register bank");
            return Completion::Unmatched;
        };
        if awaited != Some(bank) {
            warn!(?awaited, ?bank, "Response length belongs to a different bank");
        }

        let state = &mut self.banks[bank.index()];
        bank.decode(Registers::new(bytes), info, &mut state.one_shot);
        state.received = true;
        self.watchdog.feed();
        Completion::Decoded(bank)
    }

    fn on_error(&mut self, request: RequestId, code: ErrorCode) -> Completion {
        let awaited = self.awaited_bank();
        if !self.complete(request) {
            return Completion::Stale;
        }
        self.stats.errors += 1;
        error!(%request, bank = ?awaited, error = %code, "Modbus read failed");
        Completion::Failed(code)
    }

    /// Retire `request` if it is the outstanding one.
    fn complete(&mut self, request: RequestId) -> bool {
        if self.outstanding.clear_if(request) {
            self.timer.disarm();
            self.state = PollState::Idle;
            true
        } else {
            debug!(%request, outstanding = ?self.outstanding.get(), "Discarding stale Modbus event");
            self.stats.stale += 1;
            false
        }
    }

    fn awaited_bank(&self) -> Option<BankId> {
        match self.state {
            PollState::Awaiting { bank, .. } => Some(bank),
            PollState::Idle => None,
        }
    }

    /// Mark every per-cycle bank as needing a fresh read.
    pub fn begin_cycle(&mut self) {
        for bank in self.banks.iter_mut() {
            if bank.spec().refresh == Refresh::EveryCycle {
                bank.received = false;
            }
        }
    }

    /// The device may have restarted; session-invariant fields have to be read again.
    pub fn forget_identity(&mut self) {
        for bank in self.banks.iter_mut() {
            bank.one_shot = Default::default();
            if bank.spec().refresh == Refresh::Once {
                bank.received = false;
            }
        }
    }

    pub fn required_received(&self) -> bool {
        self.banks
            .iter()
            .filter(|bank| bank.spec().required)
            .all(|bank| bank.received)
    }

    pub fn banks(&self) -> &[RegisterBank; 5] {
        &self.banks
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    pub fn outstanding(&self) -> Arc<OutstandingRequest> {
        Arc::clone(&self.outstanding)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timer_mut(&mut self) -> &mut R {
        &mut self.timer
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }
}

#[cfg(test)]
use crate::modbus::bank::{response, OneShotState};
#[cfg(test)]
use crate::testing::{scheduler, data_for};
#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn walks_banks_in_order_one_at_a_time() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();

    for bank in BankId::ALL {
        assert_eq!(poller.poll(), PollStatus::Requested(bank));
        assert_eq!(poller.poll(), PollStatus::Waiting);
        let reply = data_for(&poller, response(bank, &[]));
        assert_eq!(poller.handle_event(reply, &mut info), Completion::Decoded(bank));
    }

    assert_eq!(poller.poll(), PollStatus::NothingToDo);
    assert_eq!(poller.transport().issued.len(), 5);
    assert_eq!(
        poller.transport().issued.iter().map(|r| (r.1, r.2)).collect::<Vec<_>>(),
        vec![(4100, 44), (4360, 22), (4163, 2), (4243, 32), (16386, 4)]
    );
}

#[test]
fn decode_marks_received_feeds_watchdog_and_disarms() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();

    poller.poll();
    assert!(poller.timer_mut().is_armed());

    let reply = data_for(&poller, response(BankId::Status, &[(14, 265)]));
    poller.handle_event(reply, &mut info);

    assert!(poller.banks()[0].received);
    assert_eq!(info.battery_voltage, 26.5);
    assert_eq!(poller.watchdog().fed(), 1);
    assert!(!poller.timer_mut().is_armed());
    assert_eq!(poller.outstanding().get(), None);
    assert_eq!(poller.state(), PollState::Idle);
}

#[test]
fn protocol_error_clears_without_receiving() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();

    poller.poll();
    let request = poller.outstanding().get().unwrap();
    let completion = poller.handle_event(
        TransportEvent::Error {
            request,
            code: ErrorCode::ServerDeviceBusy,
        },
        &mut info,
    );

    assert_eq!(completion, Completion::Failed(ErrorCode::ServerDeviceBusy));
    assert!(!poller.banks()[0].received);
    assert_eq!(poller.outstanding().get(), None);
    assert_eq!(poller.watchdog().fed(), 0);
    assert_eq!(poller.poll(), PollStatus::Requested(BankId::Whizbang));
}

#[test]
fn timeout_unblocks_without_counting_as_error() {
    let mut poller = scheduler();

    assert_eq!(poller.poll(), PollStatus::Requested(BankId::Status));
    assert_eq!(poller.poll(), PollStatus::Waiting);

    assert!(poller.timer_mut().fire());

    assert_eq!(poller.poll(), PollStatus::Requested(BankId::Whizbang));
    let stats = poller.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.errors, 0);
}

#[test]
fn late_response_after_timeout_is_discarded() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();

    poller.poll();
    let late = data_for(&poller, response(BankId::Status, &[(14, 999)]));
    poller.timer_mut().fire();

    // the next request is already in flight when the old response shows up
    assert_eq!(poller.poll(), PollStatus::Requested(BankId::Whizbang));
    assert_eq!(poller.handle_event(late, &mut info), Completion::Stale);

    assert!(!poller.banks()[0].received);
    assert_eq!(info.battery_voltage, 0.0);
    assert!(poller.outstanding().get().is_some());

    let reply = data_for(&poller, response(BankId::Whizbang, &[(12, 55)]));
    assert_eq!(
        poller.handle_event(reply, &mut info),
        Completion::Decoded(BankId::Whizbang)
    );
    assert_eq!(poller.stats().stale, 1);
}

#[test]
fn issue_failure_leaves_nothing_outstanding() {
    let mut poller = scheduler();
    poller.transport_mut().refuse = 1;

    assert_eq!(poller.poll(), PollStatus::IssueFailed(BankId::Status));
    assert_eq!(poller.outstanding().get(), None);
    assert!(!poller.timer_mut().is_armed());
    assert_eq!(poller.poll(), PollStatus::Requested(BankId::Whizbang));
}

#[test]
fn wraps_to_skipped_banks() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();

    // fail the status bank, answer the rest
    poller.transport_mut().refuse = 1;
    poller.poll();
    for bank in &BankId::ALL[1..] {
        assert_eq!(poller.poll(), PollStatus::Requested(*bank));
        let reply = data_for(&poller, response(*bank, &[]));
        poller.handle_event(reply, &mut info);
    }

    assert_eq!(poller.poll(), PollStatus::Requested(BankId::Status));
    let reply = data_for(&poller, response(BankId::Status, &[]));
    poller.handle_event(reply, &mut info);
    assert_eq!(poller.poll(), PollStatus::NothingToDo);
}

#[test]
fn unknown_length_is_unmatched() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();

    poller.poll();
    let reply = data_for(&poller, vec![0; 6]);
    assert_eq!(poller.handle_event(reply, &mut info), Completion::Unmatched);
    assert!(poller.banks().iter().all(|bank| !bank.received));
    assert_eq!(poller.outstanding().get(), None);
}

#[test]
fn begin_cycle_only_resets_changing_banks() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();
    for bank in BankId::ALL {
        poller.poll();
        let reply = data_for(&poller, response(bank, &[]));
        poller.handle_event(reply, &mut info);
    }

    poller.begin_cycle();

    let received: Vec<bool> = poller.banks().iter().map(|b| b.received).collect();
    assert_eq!(received, vec![false, false, true, true, true]);
    assert!(!poller.required_received());
}

#[test]
fn reconnect_recaptures_identity() {
    let mut poller = scheduler();
    let mut info = ChargeControllerInfo::default();

    for bank in BankId::ALL {
        poller.poll();
        let reply = data_for(&poller, response(bank, &[(0, 0x0196)]));
        poller.handle_event(reply, &mut info);
    }
    assert_eq!(info.model, "Classic 150 (rev 1)");

    assert_eq!(
        poller.handle_event(TransportEvent::Connected, &mut info),
        Completion::Reconnected
    );
    assert!(poller
        .banks()
        .iter()
        .all(|bank| bank.one_shot == OneShotState::Pending));
    let received: Vec<bool> = poller.banks().iter().map(|b| b.received).collect();
    assert_eq!(received, vec![true, true, false, false, false]);

    poller.begin_cycle();
    assert_eq!(poller.poll(), PollStatus::Requested(BankId::Status));
    let reply = data_for(&poller, response(BankId::Status, &[(0, 0x02fa)]));
    poller.handle_event(reply, &mut info);
    assert_eq!(info.model, "Classic 250 (rev 2)");
}
