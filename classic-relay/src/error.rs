use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    MQTTOptionError(#[from] rumqttc::OptionError),

    #[error(transparent)]
    MQTTClientError(#[from] rumqttc::ClientError),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error("Relay slot {0} is out of range")]
    UnknownRelay(usize),

    #[error("Watchdog was not fed within {0:?}")]
    WatchdogStarved(std::time::Duration),

    #[error("Modbus transport stopped")]
    TransportClosed,

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}
