mod shutdown;

pub mod auto;
pub mod config;
pub mod gather;
pub mod modbus;
pub mod mqtt;
pub mod poll;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod timer;

#[cfg(test)]
mod testing;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
