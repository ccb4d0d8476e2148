use bytes::Bytes;
use rumqttc::{
    mqttbytes::valid_topic, AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions,
    Outgoing, Publish, QoS,
};
use std::time::{Duration, Instant};
use tokio::{
    select,
    sync::{
        mpsc::{channel, Receiver, Sender},
        watch,
    },
};
use tracing::{debug, info, warn};

use crate::relay::Actuator;
use crate::shutdown::Shutdown;
use crate::telemetry::PublishedChargerData;

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Messages from the broker that the control loop acts on.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// The relay board reported the actual state of a relay.
    RelayState { slot: usize, on: bool },
    /// A replacement auto-control entry, still as raw JSON.
    AutoControl { slot: usize, payload: Bytes },
}

/// Topic layout below the configured prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new<S: Into<String>>(prefix: S) -> crate::Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || !valid_topic(&prefix) || prefix.contains(['+', '#']) {
            return Err("Prefix is not a valid topic".into());
        }
        Ok(Self { prefix })
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn charger(&self) -> String {
        format!("{}/charger", self.prefix)
    }

    pub fn relay_set(&self, slot: usize) -> String {
        format!("{}/relay/{}/set", self.prefix, slot)
    }

    fn filters(&self) -> [String; 2] {
        [
            format!("{}/relay/+/state", self.prefix),
            format!("{}/auto/+", self.prefix),
        ]
    }

    pub fn parse(&self, topic: &str, payload: Bytes) -> Option<Inbound> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts[..] {
            ["relay", slot, "state"] => Some(Inbound::RelayState {
                slot: slot.parse().ok()?,
                on: parse_switch(&payload)?,
            }),
            ["auto", slot] => Some(Inbound::AutoControl {
                slot: slot.parse().ok()?,
                payload,
            }),
            _ => None,
        }
    }
}

fn parse_switch(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if ["on", "1", "true"].iter().any(|v| text.eq_ignore_ascii_case(v)) {
        Some(true)
    } else if ["off", "0", "false"].iter().any(|v| text.eq_ignore_ascii_case(v)) {
        Some(false)
    } else {
        None
    }
}

fn switch_payload(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Build the broker connection. The returned client is for publishing from elsewhere; inbound
/// messages arrive on the receiver once [`Connection::run`] is being polled.
pub fn new(
    mut options: MqttOptions,
    topics: Topics,
    shutdown: Shutdown,
) -> (Connection, AsyncClient, Receiver<Inbound>) {
    options.set_last_will(LastWill::new(topics.status(), OFFLINE, QoS::AtLeastOnce, true));
    let (client, event_loop) = AsyncClient::new(options, 32);
    let (tx, rx) = channel(32);

    let connection = Connection {
        client: client.clone(),
        event_loop,
        topics,
        tx,
        shutdown,
    };
    (connection, client, rx)
}

pub struct Connection {
    client: AsyncClient,
    event_loop: EventLoop,
    topics: Topics,
    tx: Sender<Inbound>,
    shutdown: Shutdown,
}

impl Connection {
    pub async fn run(mut self) -> crate::Result<()> {
        loop {
            select! {
                event = self.event_loop.poll() => {
                    match event {
                        Ok(event) => {
                            if !self.handle_event(event).await? {
                                return Ok(());
                            }
                        }
                        Err(error) => {
                            warn!(%error, "MQTT connection error, retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    self.disconnect().await;
                    return Ok(());
                }
            }
        }
    }

    /// Returns `false` once nobody is listening for inbound messages any more.
    async fn handle_event(&mut self, event: Event) -> crate::Result<bool> {
        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                info!("Connected to MQTT broker");
                for filter in self.topics.filters() {
                    self.client.try_subscribe(filter, QoS::AtLeastOnce)?;
                }
                self.client
                    .try_publish(self.topics.status(), QoS::AtLeastOnce, true, ONLINE)?;
            }
            Event::Incoming(Incoming::Publish(Publish { topic, payload, .. })) => {
                debug!(%topic, ?payload, "publish");
                match self.topics.parse(&topic, payload) {
                    Some(message) => {
                        if self.tx.send(message).await.is_err() {
                            return Ok(false);
                        }
                    }
                    None => debug!(%topic, "Ignoring message"),
                }
            }
            _ => {}
        }
        Ok(true)
    }

    async fn disconnect(&mut self) {
        let _ = self
            .client
            .try_publish(self.topics.status(), QoS::AtLeastOnce, true, OFFLINE);
        let _ = self.client.try_disconnect();

        // Give the event loop a moment to flush; the last will covers us otherwise.
        let flush = async {
            while let Ok(event) = self.event_loop.poll().await {
                if let Event::Outgoing(Outgoing::Disconnect) = event {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), flush).await;
    }
}

/// Relays switched by publishing commands for a separate relay board.
pub struct MqttRelays {
    client: AsyncClient,
    topics: Topics,
    states: Vec<bool>,
}

impl MqttRelays {
    pub fn new(client: AsyncClient, topics: Topics, count: usize) -> Self {
        Self {
            client,
            topics,
            states: vec![false; count],
        }
    }
}

impl Actuator for MqttRelays {
    fn relay_count(&self) -> usize {
        self.states.len()
    }

    fn relay_state(&self, slot: usize) -> bool {
        self.states.get(slot).copied().unwrap_or(false)
    }

    fn set_relay_state(&mut self, slot: usize, on: bool) {
        let Some(state) = self.states.get_mut(slot) else {
            warn!(slot, "No such relay");
            return;
        };
        if *state == on {
            return;
        }
        match self.client.try_publish(
            self.topics.relay_set(slot),
            QoS::AtLeastOnce,
            true,
            switch_payload(on),
        ) {
            Ok(()) => {
                *state = on;
                info!(slot, on, "Relay switched");
            }
            Err(error) => warn!(slot, %error, "Could not publish relay command"),
        }
    }

    fn observe(&mut self, slot: usize, on: bool) {
        if let Some(state) = self.states.get_mut(slot) {
            *state = on;
        }
    }
}

/// Publish every new snapshot, retained, until the sending side goes away.
pub async fn report(
    client: AsyncClient,
    topics: Topics,
    mut published: watch::Receiver<Option<PublishedChargerData>>,
) -> crate::Result<()> {
    while published.changed().await.is_ok() {
        let data = *published.borrow();
        if let Some(data) = data {
            let payload = serde_json::to_vec(&data.report(Instant::now()))?;
            client
                .publish(topics.charger(), QoS::AtLeastOnce, true, payload)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn topics_below_prefix() {
    let topics = Topics::new("home/classic").unwrap();

    assert_eq!(topics.status(), "home/classic/status");
    assert_eq!(topics.charger(), "home/classic/charger");
    assert_eq!(topics.relay_set(2), "home/classic/relay/2/set");
    assert_eq!(
        topics.filters(),
        ["home/classic/relay/+/state".to_owned(), "home/classic/auto/+".to_owned()]
    );
}

#[test]
fn rejects_wildcard_prefix() {
    assert!(Topics::new("home/+").is_err());
    assert!(Topics::new("#").is_err());
    assert!(Topics::new("").is_err());
}

#[test]
fn parse_inbound_topics() {
    let topics = Topics::new("classic-relay").unwrap();

    assert_eq!(
        topics.parse("classic-relay/relay/1/state", Bytes::from_static(b"ON")),
        Some(Inbound::RelayState { slot: 1, on: true })
    );
    assert_eq!(
        topics.parse("classic-relay/relay/3/state", Bytes::from_static(b" off\n")),
        Some(Inbound::RelayState { slot: 3, on: false })
    );
    assert_eq!(
        topics.parse("classic-relay/auto/0", Bytes::from_static(b"{\"enabled\":true}")),
        Some(Inbound::AutoControl {
            slot: 0,
            payload: Bytes::from_static(b"{\"enabled\":true}")
        })
    );
}

#[test]
fn ignores_unrelated_topics() {
    let topics = Topics::new("classic-relay").unwrap();

    for topic in [
        "classic-relay/relay/x/state",
        "classic-relay/relay/1/set",
        "classic-relay/auto/1/extra",
        "classic-relay-other/auto/1",
        "other/relay/1/state",
    ] {
        assert_eq!(topics.parse(topic, Bytes::from_static(b"ON")), None, "{topic}");
    }
    assert_eq!(
        topics.parse("classic-relay/relay/1/state", Bytes::from_static(b"maybe")),
        None
    );
}
