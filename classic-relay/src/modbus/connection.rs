use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::{select, sync::mpsc};
use tokio_modbus::client::{tcp, Context as ModbusClient};
use tokio_modbus::prelude::{Reader, Slave};
use tracing::{debug, error, info, warn};

use super::{ErrorCode, RequestId, Transport, TransportEvent, UnitId};
use crate::shutdown::Shutdown;

/// Function code for "read holding registers", the only one we issue.
const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Start the connection task. The TCP session is opened lazily on the first request and re-opened
/// after any failure that leaves it in an unknown state.
pub fn spawn(
    config: Config,
    request_timeout: Duration,
    shutdown: Shutdown,
) -> (Handle, mpsc::Receiver<TransportEvent>) {
    let (tx, rx) = mpsc::channel(32);
    let (events_tx, events_rx) = mpsc::channel(32);

    let conn = Connection {
        config,
        request_timeout,
        client: None,
        shutdown,
        rx,
        events: events_tx,
    };
    tokio::spawn(conn.run());

    (
        Handle {
            tx,
            next: RequestId::default(),
        },
        events_rx,
    )
}

#[derive(Debug)]
struct Request {
    id: RequestId,
    address: u16,
    count: u16,
}

/// Queues reads onto the connection task without waiting for them.
#[derive(Debug)]
pub struct Handle {
    tx: mpsc::Sender<Request>,
    next: RequestId,
}

impl Transport for Handle {
    fn read_holding_registers(&mut self, address: u16, count: u16) -> Option<RequestId> {
        let id = self.next;
        match self.tx.try_send(Request { id, address, count }) {
            Ok(()) => {
                self.next = id.next();
                Some(id)
            }
            Err(error) => {
                warn!(%error, address, count, "Could not queue Modbus request");
                None
            }
        }
    }
}

struct Connection {
    config: Config,
    request_timeout: Duration,
    client: Option<ModbusClient>,
    shutdown: Shutdown,
    rx: mpsc::Receiver<Request>,
    events: mpsc::Sender<TransportEvent>,
}

impl Connection {
    #[tracing::instrument(level = "debug", skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn run(mut self) {
        loop {
            select! {
                request = self.rx.recv() => {
                    let Some(request) = request else { return };
                    if self.handle(request).await.is_err() {
                        debug!("Event receiver dropped, stopping");
                        return;
                    }
                },
                _ = self.shutdown.recv() => {
                    return;
                }
            }
        }
    }

    async fn handle(&mut self, request: Request) -> Result<(), mpsc::error::SendError<TransportEvent>> {
        let client = match self.client.take() {
            Some(client) => client,
            None => match self.config.connect().await {
                Ok(client) => {
                    info!("Connected to charge controller");
                    self.events.send(TransportEvent::Connected).await?;
                    client
                }
                Err(error) => {
                    error!(%error, "Could not connect to charge controller");
                    let code = ErrorCode::from_io(&error);
                    return self
                        .events
                        .send(TransportEvent::Error {
                            request: request.id,
                            code,
                        })
                        .await;
                }
            },
        };

        let (client, event) = self.read(client, &request).await;
        self.client = client;
        self.events.send(event).await
    }

    /// Execute one read. Hands the client back only if the session is still usable.
    async fn read(&mut self, mut client: ModbusClient, request: &Request) -> (Option<ModbusClient>, TransportEvent) {
        let result = tokio::time::timeout(
            self.request_timeout,
            client.read_holding_registers(request.address, request.count),
        )
        .await;

        match result {
            Ok(Ok(words)) => {
                debug!(request = %request.id, address = request.address, count = words.len(), "Read registers");
                let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
                let event = TransportEvent::Data {
                    request: request.id,
                    slave: self.config.unit,
                    function: READ_HOLDING_REGISTERS,
                    bytes: Bytes::from(bytes),
                };
                (Some(client), event)
            }
            Ok(Err(error)) => {
                warn!(request = %request.id, %error, "Modbus read failed");
                let code = ErrorCode::from_io(&error);
                let client = (!breaks_session(&error)).then_some(client);
                (client, TransportEvent::Error { request: request.id, code })
            }
            Err(_) => {
                // A late reply would be taken as the answer to the next request.
                warn!(request = %request.id, timeout = ?self.request_timeout, "Modbus read timed out, reconnecting");
                let event = TransportEvent::Error {
                    request: request.id,
                    code: ErrorCode::Timeout,
                };
                (None, event)
            }
        }
    }
}

fn breaks_session(error: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        error.kind(),
        BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof | TimedOut
    )
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub host: String,

    #[serde(default = "default_modbus_port")]
    pub port: u16,

    #[serde(alias = "slave", default = "default_unit")]
    pub unit: UnitId,
}

impl Config {
    async fn connect(&self) -> io::Result<ModbusClient> {
        let socket_addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} did not resolve to an address", self.host),
                )
            })?;
        debug!(%socket_addr, unit = self.unit, "Connecting");
        tcp::connect_slave(socket_addr, Slave(self.unit)).await
    }
}

pub fn default_modbus_port() -> u16 {
    502
}

/// The Classic answers on unit 10 unless reconfigured.
pub fn default_unit() -> UnitId {
    10
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_minimal_connect_config() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "host": "192.168.1.20"
    }))
    .unwrap();

    assert_eq!(
        config,
        Config {
            host: "192.168.1.20".to_owned(),
            port: 502,
            unit: 10,
        }
    );
}

#[test]
fn parse_full_connect_config() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "host": "classic.local",
        "port": 5020,
        "slave": 1
    }))
    .unwrap();

    assert_eq!(config.port, 5020);
    assert_eq!(config.unit, 1);
}

#[test]
fn transport_errors_that_need_a_new_session() {
    assert!(breaks_session(&io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
    assert!(!breaks_session(&io::Error::new(io::ErrorKind::InvalidData, "exception")));
}

#[test]
fn handle_refuses_once_task_is_gone() {
    let (tx, rx) = mpsc::channel(1);
    let mut handle = Handle {
        tx,
        next: RequestId::default(),
    };

    assert_eq!(handle.read_holding_registers(4100, 44).map(RequestId::get), Some(1));
    // channel full
    assert_eq!(handle.read_holding_registers(4360, 22), None);

    drop(rx);
    assert_eq!(handle.read_holding_registers(4360, 22), None);
}
