use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::modbus::{Transport, TransportEvent};
use crate::poll::{Completion, PollScheduler, PollStatus, ReadTimer, Watchdog};
use crate::telemetry::{
    charge_state_name, reason_for_resting_name, ChargeControllerInfo, PublishedChargerData,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
    WaitingForNextTrigger,
    Gathering,
}

/// What happened during one [`GatherCycle::tick`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CycleOutcome {
    Idle,
    Polled(PollStatus),
    Published(PublishedChargerData),
    /// Too many failures; the next cycle starts after `interval`.
    Aborted { interval: Duration },
}

/// Periodically drives the poll scheduler through a full set of banks and publishes the result.
pub struct GatherCycle<T, R, W> {
    scheduler: PollScheduler<T, R, W>,
    info: ChargeControllerInfo,
    published: Option<PublishedChargerData>,
    state: CycleState,
    next_trigger: Instant,
    interval: Duration,
    default_interval: Duration,
    max_interval: Duration,
    max_attempts: u32,
    failures: u32,
    total_failures: u64,
}

impl<T, R, W> GatherCycle<T, R, W>
where
    T: Transport,
    R: ReadTimer,
    W: Watchdog,
{
    pub fn new(scheduler: PollScheduler<T, R, W>, timing: &Timing, now: Instant) -> Self {
        Self {
            scheduler,
            info: ChargeControllerInfo::default(),
            published: None,
            state: CycleState::WaitingForNextTrigger,
            next_trigger: now + timing.initial_delay,
            interval: timing.gather_interval,
            default_interval: timing.gather_interval,
            max_interval: timing.max_gather_interval.max(timing.gather_interval),
            max_attempts: timing.max_attempts.max(1),
            failures: 0,
            total_failures: 0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> CycleOutcome {
        if self.state == CycleState::WaitingForNextTrigger {
            if now < self.next_trigger {
                return CycleOutcome::Idle;
            }
            debug!(interval = ?self.interval, "Starting gather cycle");
            self.scheduler.begin_cycle();
            self.failures = 0;
            self.next_trigger = now + self.interval;
            self.state = CycleState::Gathering;
        }

        let status = self.scheduler.poll();
        if let PollStatus::IssueFailed(_) = status {
            self.record_failure();
        }

        if self.failures >= self.max_attempts {
            self.abort(now)
        } else if self.scheduler.required_received() {
            CycleOutcome::Published(self.publish(now))
        } else {
            CycleOutcome::Polled(status)
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> Completion {
        let completion = self.scheduler.handle_event(event, &mut self.info);
        match completion {
            Completion::Failed(_) => self.record_failure(),
            Completion::Reconnected => {
                info!("Connected to charge controller, identity will be read again")
            }
            _ => {}
        }
        completion
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.total_failures += 1;
    }

    fn abort(&mut self, now: Instant) -> CycleOutcome {
        self.scheduler.begin_cycle();
        self.interval = self.interval.saturating_mul(2).min(self.max_interval);
        self.next_trigger = now + self.interval;
        self.state = CycleState::WaitingForNextTrigger;
        warn!(
            failures = self.failures,
            total_failures = self.total_failures,
            next_attempt_in = ?self.interval,
            "Gather cycle aborted"
        );
        CycleOutcome::Aborted {
            interval: self.interval,
        }
    }

    fn publish(&mut self, now: Instant) -> PublishedChargerData {
        let gathered_at = match self.published {
            Some(previous) => previous.gathered_at.max(now),
            None => now,
        };
        let data = PublishedChargerData::capture(&self.info, gathered_at);
        self.published = Some(data);
        self.interval = self.default_interval;
        self.state = CycleState::WaitingForNextTrigger;

        info!(
            soc = data.soc,
            battery_voltage = data.battery_voltage,
            battery_current = data.battery_current,
            pv_voltage = data.pv_voltage,
            pv_current = data.pv_current,
            charge_state = charge_state_name(self.info.charge_state),
            resting_reason = reason_for_resting_name(self.info.reason_for_resting),
            "Gathered charger data"
        );
        data
    }

    pub fn published(&self) -> Option<PublishedChargerData> {
        self.published
    }

    pub fn info(&self) -> &ChargeControllerInfo {
        &self.info
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Current spacing between cycle starts, including any backoff.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_trigger(&self) -> Instant {
        self.next_trigger
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn scheduler(&self) -> &PollScheduler<T, R, W> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut PollScheduler<T, R, W> {
        &mut self.scheduler
    }
}

#[cfg(test)]
use crate::modbus::bank::{response, BankId};
#[cfg(test)]
use crate::modbus::ErrorCode;
#[cfg(test)]
use crate::poll::PollState;
#[cfg(test)]
use crate::testing::{data_for, scheduler, CountingWatchdog, ManualTimer, MockTransport};
#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn cycle(now: Instant) -> TestCycle {
    let timing = Timing {
        initial_delay: Duration::ZERO,
        gather_interval: Duration::from_secs(120),
        max_gather_interval: Duration::from_secs(600),
        max_attempts: 3,
        ..Timing::default()
    };
    GatherCycle::new(scheduler(), &timing, now)
}

#[cfg(test)]
fn answer(gather: &mut TestCycle, bank: BankId, words: &[(usize, u16)]) {
    let reply = data_for(gather.scheduler(), response(bank, words));
    assert_eq!(gather.handle_event(reply), Completion::Decoded(bank));
}

#[cfg(test)]
fn fail(gather: &mut TestCycle) {
    let request = gather.scheduler().outstanding().get().unwrap();
    gather.handle_event(TransportEvent::Error {
        request,
        code: ErrorCode::Timeout,
    });
}

#[cfg(test)]
type TestCycle = GatherCycle<MockTransport, ManualTimer, CountingWatchdog>;

/// Ticks until the cycle publishes, answering whatever read is outstanding.
#[cfg(test)]
fn gather_once(gather: &mut TestCycle, now: Instant, soc: u16) -> PublishedChargerData {
    for _ in 0..20 {
        match gather.tick(now) {
            CycleOutcome::Published(data) => return data,
            CycleOutcome::Polled(_) => {
                if let PollState::Awaiting { bank, .. } = gather.scheduler().state() {
                    let words: &[(usize, u16)] = match bank {
                        BankId::Whizbang => &[(12, soc)],
                        _ => &[],
                    };
                    answer(gather, bank, words);
                }
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    panic!("cycle never published")
}

#[test]
fn first_cycle_waits_for_initial_delay() {
    let start = Instant::now();
    let timing = Timing {
        initial_delay: Duration::from_secs(15),
        ..Timing::default()
    };
    let mut gather = GatherCycle::new(scheduler(), &timing, start);

    assert_eq!(gather.tick(start + Duration::from_secs(14)), CycleOutcome::Idle);
    assert!(gather.scheduler().transport().issued.is_empty());
    assert_eq!(
        gather.tick(start + Duration::from_secs(15)),
        CycleOutcome::Polled(PollStatus::Requested(BankId::Status))
    );
}

#[test]
fn publishes_once_required_banks_arrive() {
    let now = Instant::now();
    let mut gather = cycle(now);

    assert_eq!(gather.tick(now), CycleOutcome::Polled(PollStatus::Requested(BankId::Status)));
    answer(&mut gather, BankId::Status, &[(14, 265)]);
    assert_eq!(gather.tick(now), CycleOutcome::Polled(PollStatus::Requested(BankId::Whizbang)));
    answer(&mut gather, BankId::Whizbang, &[(12, 80), (10, 15)]);
    assert_eq!(gather.tick(now), CycleOutcome::Polled(PollStatus::Requested(BankId::Aux)));
    answer(&mut gather, BankId::Aux, &[]);

    // Setpoints and firmware are not needed for publishing.
    match gather.tick(now) {
        CycleOutcome::Published(data) => {
            assert_eq!(data.soc, 80);
            assert_eq!(data.battery_voltage, 26.5);
            assert_eq!(data.battery_current, 1.5);
            assert_eq!(data.gathered_at, now);
        }
        other => panic!("expected publish, got {other:?}"),
    }
    assert_eq!(gather.state(), CycleState::WaitingForNextTrigger);
    assert_eq!(gather.next_trigger(), now + Duration::from_secs(120));
}

#[test]
fn failure_mid_cycle_never_publishes_partial_data() {
    let now = Instant::now();
    let mut gather = cycle(now);
    gather_once(&mut gather, now, 50);

    // Answer the status bank, fail every other read.
    let later = now + Duration::from_secs(120);
    let mut aborted = false;
    for _ in 0..20 {
        match gather.tick(later) {
            CycleOutcome::Aborted { .. } => {
                aborted = true;
                break;
            }
            CycleOutcome::Polled(_) => match gather.scheduler().state() {
                PollState::Awaiting {
                    bank: BankId::Status,
                    ..
                } => answer(&mut gather, BankId::Status, &[(14, 300)]),
                PollState::Awaiting { .. } => fail(&mut gather),
                PollState::Idle => {}
            },
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert!(aborted);
    assert_eq!(gather.info().battery_voltage, 30.0);
    let published = gather.published().unwrap();
    assert_eq!(published.soc, 50);
    assert_eq!(published.battery_voltage, 0.0);
    assert_eq!(published.gathered_at, now);
    assert!(!gather.scheduler().banks()[0].received);
}

#[test]
fn exhaustion_doubles_interval_once_and_success_resets_it() {
    let now = Instant::now();
    let mut gather = cycle(now);

    gather.tick(now);
    fail(&mut gather);
    gather.tick(now);
    fail(&mut gather);
    gather.tick(now);
    fail(&mut gather);
    assert_eq!(
        gather.tick(now),
        CycleOutcome::Aborted {
            interval: Duration::from_secs(240)
        }
    );
    assert_eq!(gather.interval(), Duration::from_secs(240));
    assert_eq!(gather.total_failures(), 3);

    // Nothing happens until the backed-off trigger.
    assert_eq!(gather.tick(now + Duration::from_secs(239)), CycleOutcome::Idle);

    let later = now + Duration::from_secs(240);
    gather_once(&mut gather, later, 70);
    assert_eq!(gather.interval(), Duration::from_secs(120));
}

#[test]
fn issue_failures_count_towards_exhaustion() {
    let now = Instant::now();
    let mut gather = cycle(now);
    gather.scheduler_mut().transport_mut().refuse = 3;

    assert_eq!(
        gather.tick(now),
        CycleOutcome::Polled(PollStatus::IssueFailed(BankId::Status))
    );
    assert_eq!(
        gather.tick(now),
        CycleOutcome::Polled(PollStatus::IssueFailed(BankId::Whizbang))
    );
    assert_eq!(
        gather.tick(now),
        CycleOutcome::Aborted {
            interval: Duration::from_secs(240)
        }
    );
}

#[test]
fn backoff_is_capped() {
    let now = Instant::now();
    let mut gather = cycle(now);
    gather.scheduler_mut().transport_mut().refuse = usize::MAX;

    let mut at = now;
    let mut intervals = vec![];
    for _ in 0..4 {
        let outcome = loop {
            match gather.tick(at) {
                CycleOutcome::Aborted { interval } => break interval,
                CycleOutcome::Polled(_) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        };
        intervals.push(outcome.as_secs());
        at += outcome;
    }

    assert_eq!(intervals, vec![240, 480, 600, 600]);
}

#[test]
fn timeout_is_not_a_failure() {
    let now = Instant::now();
    let mut gather = cycle(now);

    gather.tick(now);
    assert!(gather.scheduler_mut().timer_mut().fire());
    assert_eq!(
        gather.tick(now),
        CycleOutcome::Polled(PollStatus::Requested(BankId::Whizbang))
    );
    assert_eq!(gather.failures(), 0);
}

#[test]
fn stale_response_does_not_complete_a_cycle() {
    let now = Instant::now();
    let mut gather = cycle(now);

    gather.tick(now);
    let late = data_for(gather.scheduler(), response(BankId::Status, &[(14, 999)]));
    gather.scheduler_mut().timer_mut().fire();
    gather.tick(now);

    assert_eq!(gather.handle_event(late), Completion::Stale);
    assert_eq!(gather.info().battery_voltage, 0.0);
    assert!(!gather.scheduler().banks()[0].received);
}

#[test]
fn gathered_at_never_goes_backwards() {
    let now = Instant::now();
    let mut gather = cycle(now);
    let first = gather_once(&mut gather, now + Duration::from_secs(500), 10);
    assert_eq!(first.gathered_at, now + Duration::from_secs(500));

    // Start the next cycle, then finish it with a clock sampled before the last publish.
    gather.tick(now + Duration::from_secs(620));
    let second = gather_once(&mut gather, now + Duration::from_secs(400), 11);
    assert_eq!(second.gathered_at, first.gathered_at);
    assert_eq!(second.soc, 11);
}
