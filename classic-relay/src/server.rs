use rumqttc::{AsyncClient, MqttOptions};
use std::future::Future;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auto::{self, AutoControlConfig, AutoControlEntry};
use crate::config::{Settings, Timing};
use crate::gather::{CycleOutcome, GatherCycle};
use crate::modbus::connection;
use crate::modbus::{Transport, TransportEvent};
use crate::mqtt::{self, Inbound, MqttRelays, Topics};
use crate::poll::{PollScheduler, ReadTimer, Watchdog};
use crate::relay::{Actuator, MemoryRelays};
use crate::telemetry::PublishedChargerData;
use crate::timer::{self, SleepTimer, Starvation};
use crate::Error;

/// Where relay commands and telemetry go.
pub struct MqttSettings {
    pub options: MqttOptions,
    pub prefix: String,
}

pub struct Server<T, R, W> {
    gather: GatherCycle<T, R, W>,
    events: mpsc::Receiver<TransportEvent>,
    inbound: Option<mpsc::Receiver<Inbound>>,
    actuator: Box<dyn Actuator + Send>,
    auto_control: AutoControlConfig,
    published: watch::Sender<Option<PublishedChargerData>>,
    timing: Timing,
}

/// Run until `shutdown` resolves or the watchdog starves.
pub async fn run(
    settings: Settings,
    modbus: connection::Config,
    mqtt: Option<MqttSettings>,
    shutdown: impl Future,
) -> crate::Result<()> {
    settings.validate()?;
    let (notify_shutdown, _) = broadcast::channel(1);
    let Settings {
        timing,
        relays,
        auto_control,
    } = settings;

    info!(host = %modbus.host, port = modbus.port, unit = modbus.unit, "Starting up");
    let (transport, events) =
        connection::spawn(modbus, timing.request_timeout, notify_shutdown.subscribe().into());
    let (watchdog, starvation) = timer::watchdog(timing.watchdog);
    let scheduler = PollScheduler::new(
        transport,
        SleepTimer::new(timing.read_timeout),
        watchdog,
    );
    let gather = GatherCycle::new(scheduler, &timing, Instant::now());
    let (published, _) = watch::channel(None);

    let (actuator, inbound) = match mqtt {
        Some(MqttSettings { options, prefix }) => {
            let topics = Topics::new(prefix)?;
            let (connection, client, inbound) =
                mqtt::new(options, topics.clone(), notify_shutdown.subscribe().into());
            tokio::spawn(async move {
                if let Err(error) = connection.run().await {
                    error!(%error, "MQTT connection failed");
                }
            });
            spawn_reporter(client.clone(), topics.clone(), published.subscribe());
            let relays = MqttRelays::new(client, topics, relays);
            (Box::new(relays) as Box<dyn Actuator + Send>, Some(inbound))
        }
        None => {
            info!("No MQTT broker configured, relays are only simulated");
            let relays = MemoryRelays::new(relays);
            (Box::new(relays) as Box<dyn Actuator + Send>, None)
        }
    };

    let mut server = Server {
        gather,
        events,
        inbound,
        actuator,
        auto_control,
        published,
        timing,
    };

    let mut ret = Ok(());

    tokio::select! {
        res = server.run(starvation) => {
            if let Err(err) = res {
                error!(cause = %err, "server error");
                ret = Err(err)
            } else {
                info!("server finished running")
            }
        }

        _ = shutdown => {
            info!("shutting down");
        }
    }

    drop(server);
    drop(notify_shutdown);

    ret
}

fn spawn_reporter(
    client: AsyncClient,
    topics: Topics,
    published: watch::Receiver<Option<PublishedChargerData>>,
) {
    tokio::spawn(async move {
        if let Err(error) = mqtt::report(client, topics, published).await {
            warn!(%error, "Stopped publishing charger data");
        }
    });
}

/// Waits forever once the inbound side is gone, so `select!` can keep polling it.
async fn next_inbound(inbound: &mut Option<mpsc::Receiver<Inbound>>) -> Option<Inbound> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<T, R, W> Server<T, R, W>
where
    T: Transport,
    R: ReadTimer,
    W: Watchdog,
{
    async fn run(&mut self, starvation: Starvation) -> crate::Result<()> {
        for (slot, entry) in self.auto_control.iter() {
            info!(slot, ?entry, "Auto-control");
        }

        let mut tick = tokio::time::interval(self.timing.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let starved = starvation.starved();
        tokio::pin!(starved);

        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick(Instant::now()),
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            self.gather.handle_event(event);
                        }
                        None => return Err(Error::TransportClosed),
                    }
                }
                message = next_inbound(&mut self.inbound) => {
                    match message {
                        Some(message) => self.on_inbound(message, Instant::now()),
                        None => {
                            warn!("MQTT inbound channel closed");
                            self.inbound = None;
                        }
                    }
                }
                window = &mut starved => {
                    error!(?window, "Watchdog starved");
                    return Err(Error::WatchdogStarved(window));
                }
            }
        }
    }

    /// The watchdog is not fed here, only by decoded responses.
    fn on_tick(&mut self, now: Instant) {
        match self.gather.tick(now) {
            CycleOutcome::Published(data) => {
                debug!(info = ?self.gather.info(), stats = ?self.gather.scheduler().stats(), "Cycle complete");
                self.published.send_replace(Some(data));
                self.apply_auto_control(now);
            }
            CycleOutcome::Aborted { .. } | CycleOutcome::Polled(_) | CycleOutcome::Idle => {}
        }
    }

    fn on_inbound(&mut self, message: Inbound, now: Instant) {
        match message {
            Inbound::RelayState { slot, on } => {
                debug!(slot, on, "Relay reported state");
                self.actuator.observe(slot, on);
            }
            Inbound::AutoControl { slot, payload } => {
                if slot >= self.actuator.relay_count() {
                    warn!(slot, "Auto-control update for a relay that does not exist");
                    return;
                }
                match serde_json::from_slice::<AutoControlEntry>(&payload) {
                    Ok(entry) => {
                        info!(slot, ?entry, "Auto-control updated");
                        self.auto_control.set(slot, entry);
                        self.apply_auto_control(now);
                    }
                    Err(error) => warn!(slot, %error, "Invalid auto-control entry"),
                }
            }
        }
    }

    fn apply_auto_control(&mut self, now: Instant) {
        let latest = *self.published.borrow();
        let Some(data) = latest else {
            return;
        };
        let decisions = auto::evaluate(
            &self.auto_control,
            &data,
            now,
            self.gather.interval(),
            self.actuator.as_mut(),
        );
        for decision in decisions.iter().filter(|d| !d.changed()) {
            debug!(slot = decision.slot, value = decision.value, on = decision.on, "Relay unchanged");
        }
    }
}

#[cfg(test)]
use crate::auto::MeasureKind;
#[cfg(test)]
use crate::gather::CycleState;
#[cfg(test)]
use crate::modbus::bank::{response, BankId};
#[cfg(test)]
use crate::poll::PollState;
#[cfg(test)]
use crate::testing::{data_for, scheduler, CountingWatchdog, ManualTimer, MockTransport};
#[cfg(test)]
use bytes::Bytes;
#[cfg(test)]
use pretty_assertions::assert_eq;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
type TestServer = Server<MockTransport, ManualTimer, CountingWatchdog>;

#[cfg(test)]
fn test_server<T, R, W>(
    scheduler: PollScheduler<T, R, W>,
    auto_control: AutoControlConfig,
    now: Instant,
) -> (Server<T, R, W>, mpsc::Sender<TransportEvent>)
where
    T: Transport,
    R: ReadTimer,
    W: Watchdog,
{
    let timing = Timing {
        initial_delay: Duration::ZERO,
        ..Timing::default()
    };
    let (events_tx, events) = mpsc::channel(8);
    let (published, _) = watch::channel(None);
    let server = Server {
        gather: GatherCycle::new(scheduler, &timing, now),
        events,
        inbound: None,
        actuator: Box::new(MemoryRelays::new(2)),
        auto_control,
        published,
        timing,
    };
    (server, events_tx)
}

#[cfg(test)]
fn soc_entry(on_threshold: f64, restore_threshold: f64) -> AutoControlEntry {
    AutoControlEntry {
        enabled: true,
        measure: MeasureKind::Soc,
        on_threshold,
        restore_threshold,
    }
}

/// Ticks until a cycle publishes, answering each read with `soc` as the state of charge.
#[cfg(test)]
fn gather(server: &mut TestServer, now: Instant, soc: u16) {
    for _ in 0..20 {
        server.on_tick(now);
        if server.gather.state() == CycleState::WaitingForNextTrigger {
            return;
        }
        if let PollState::Awaiting { bank, .. } = server.gather.scheduler().state() {
            let words: &[(usize, u16)] = match bank {
                BankId::Whizbang => &[(12, soc)],
                _ => &[],
            };
            let reply = data_for(server.gather.scheduler(), response(bank, words));
            server.gather.handle_event(reply);
        }
    }
    panic!("cycle never published")
}

#[cfg(test)]
fn auto_update(slot: usize, json: &'static str) -> Inbound {
    Inbound::AutoControl {
        slot,
        payload: Bytes::from_static(json.as_bytes()),
    }
}

#[test]
fn published_data_drives_auto_control() {
    let now = Instant::now();
    let mut config = AutoControlConfig::default();
    config.set(0, soc_entry(75.0, 85.0));
    let (mut server, _events) = test_server(scheduler(), config, now);

    gather(&mut server, now, 90);
    assert_eq!(server.published.borrow().as_ref().map(|data| data.soc), Some(90));
    assert!(server.actuator.relay_state(0));
    assert!(!server.actuator.relay_state(1));

    let later = now + Duration::from_secs(120);
    gather(&mut server, later, 70);
    assert_eq!(server.published.borrow().as_ref().map(|data| data.soc), Some(70));
    assert!(!server.actuator.relay_state(0));
}

#[test]
fn auto_control_update_replaces_entry_and_reevaluates() {
    let now = Instant::now();
    let (mut server, _events) = test_server(scheduler(), AutoControlConfig::default(), now);
    gather(&mut server, now, 80);
    assert!(!server.actuator.relay_state(1));

    server.on_inbound(
        auto_update(1, r#"{"enabled":true,"measure":"SOC","value":50,"restoreValue":60}"#),
        now,
    );
    assert_eq!(server.auto_control.get(1), Some(&soc_entry(50.0, 60.0)));
    assert!(server.actuator.relay_state(1));

    // replaced as a whole, missing fields fall back to defaults
    server.on_inbound(auto_update(1, r#"{"enabled":false}"#), now);
    assert_eq!(
        server.auto_control.get(1),
        Some(&AutoControlEntry::default())
    );
    assert!(server.actuator.relay_state(1));
}

#[test]
fn auto_control_update_is_rejected_for_missing_relay_or_bad_json() {
    let now = Instant::now();
    let (mut server, _events) = test_server(scheduler(), AutoControlConfig::default(), now);

    server.on_inbound(auto_update(2, r#"{"enabled":true}"#), now);
    server.on_inbound(auto_update(0, "not json"), now);

    assert!(server.auto_control.is_empty());
}

#[test]
fn reported_relay_state_feeds_hysteresis() {
    let now = Instant::now();
    let mut config = AutoControlConfig::default();
    config.set(0, soc_entry(75.0, 85.0));
    let (mut server, _events) = test_server(scheduler(), config, now);

    server.on_inbound(Inbound::RelayState { slot: 0, on: true }, now);
    assert!(server.actuator.relay_state(0));

    // inside the dead band, so a relay reported on stays on
    gather(&mut server, now, 80);
    assert!(server.actuator.relay_state(0));
}

#[test]
fn ticks_alone_do_not_feed_the_watchdog() {
    let now = Instant::now();
    let (mut server, _events) = test_server(scheduler(), AutoControlConfig::default(), now);

    for _ in 0..10 {
        server.on_tick(now);
    }
    assert_eq!(server.gather.scheduler().transport().issued.len(), 1);
    assert_eq!(server.gather.scheduler().watchdog().fed(), 0);

    let reply = data_for(server.gather.scheduler(), response(BankId::Status, &[]));
    server.gather.handle_event(reply);
    server.on_tick(now);
    assert_eq!(server.gather.scheduler().watchdog().fed(), 1);
}

#[tokio::test(start_paused = true)]
async fn starves_when_nothing_is_decoded() {
    let (feeder, starvation) = timer::watchdog(Duration::from_secs(1));
    let scheduler = PollScheduler::new(MockTransport::default(), ManualTimer::default(), feeder);
    let (mut server, _events) = test_server(scheduler, AutoControlConfig::default(), Instant::now());

    let result = server.run(starvation).await;

    assert!(matches!(
        result,
        Err(Error::WatchdogStarved(window)) if window == Duration::from_secs(1)
    ));
    assert_eq!(server.gather.scheduler().transport().issued.len(), 1);
}
