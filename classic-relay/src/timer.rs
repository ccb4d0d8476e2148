use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;

use crate::modbus::RequestId;
use crate::poll::{OutstandingRequest, ReadTimer, Watchdog};

/// Read timer backed by a spawned sleep. Must be used from within a tokio runtime.
#[derive(Debug)]
pub struct SleepTimer {
    timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl SleepTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            task: None,
        }
    }
}

impl ReadTimer for SleepTimer {
    fn arm(&mut self, outstanding: Arc<OutstandingRequest>, request: RequestId) {
        self.disarm();
        let timeout = self.timeout;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if outstanding.clear_if(request) {
                error!(%request, ?timeout, "Modbus read took too long, clearing it");
            }
        }));
    }

    fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SleepTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Feeding side of the watchdog. Cheap to clone.
#[derive(Clone, Debug)]
pub struct WatchdogFeeder(Arc<Notify>);

impl Watchdog for WatchdogFeeder {
    fn feed(&self) {
        self.0.notify_one();
    }
}

/// Resolves once the watchdog has gone `window` without being fed.
#[derive(Debug)]
pub struct Starvation {
    notify: Arc<Notify>,
    window: Duration,
}

impl Starvation {
    pub async fn starved(self) -> Duration {
        while tokio::time::timeout(self.window, self.notify.notified())
            .await
            .is_ok()
        {}
        self.window
    }
}

pub fn watchdog(window: Duration) -> (WatchdogFeeder, Starvation) {
    let notify = Arc::new(Notify::new());
    (
        WatchdogFeeder(Arc::clone(&notify)),
        Starvation { notify, window },
    )
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[tokio::test(start_paused = true)]
async fn expired_read_is_cleared() {
    let outstanding = Arc::new(OutstandingRequest::default());
    let request = RequestId::default();
    outstanding.set(request);

    let mut timer = SleepTimer::new(Duration::from_secs(300));
    timer.arm(Arc::clone(&outstanding), request);

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(outstanding.get(), Some(request));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(outstanding.get(), None);
}

#[tokio::test(start_paused = true)]
async fn disarmed_timer_leaves_request_alone() {
    let outstanding = Arc::new(OutstandingRequest::default());
    let request = RequestId::default();
    outstanding.set(request);

    let mut timer = SleepTimer::new(Duration::from_secs(300));
    timer.arm(Arc::clone(&outstanding), request);
    timer.disarm();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(outstanding.get(), Some(request));
}

#[tokio::test(start_paused = true)]
async fn timer_never_clears_a_newer_request() {
    let outstanding = Arc::new(OutstandingRequest::default());
    let old = RequestId::default();
    outstanding.set(old);

    let mut timer = SleepTimer::new(Duration::from_secs(10));
    timer.arm(Arc::clone(&outstanding), old);
    // answered and replaced without disarming
    let new = old.next();
    outstanding.set(new);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(outstanding.get(), Some(new));
}

#[tokio::test(start_paused = true)]
async fn watchdog_starves_without_food() {
    let (feeder, starvation) = watchdog(Duration::from_secs(10));
    let starved = tokio::spawn(starvation.starved());

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(6)).await;
        feeder.feed();
    }
    assert!(!starved.is_finished());

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(starved.await.unwrap(), Duration::from_secs(10));
}
