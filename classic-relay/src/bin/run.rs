use clap::Parser;
use classic_relay::{config::Settings, modbus::connection, server, Result};
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[clap(
    name = "classic-relay",
    version,
    author,
    about = "Switches relays from MidNite Classic charge controller telemetry"
)]
struct Cli {
    /// Host name or address of the charge controller
    #[clap(env = "CLASSIC_HOST")]
    host: String,

    #[clap(short, long, env = "CLASSIC_PORT", default_value_t = connection::default_modbus_port())]
    port: u16,

    /// Modbus unit id of the charge controller
    #[clap(short, long, env = "CLASSIC_UNIT", default_value_t = connection::default_unit())]
    unit: u8,

    /// Broker for relay commands and telemetry, e.g. mqtt://localhost:1883/classic-relay
    #[clap(long, env = "MQTT_URL", value_hint = clap::ValueHint::Url)]
    mqtt: Option<Url>,

    /// JSON file with timing and auto-control settings
    #[clap(short, long, env = "CLASSIC_RELAY_CONFIG", value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let settings = match args.config {
        Some(ref path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let modbus = connection::Config {
        host: args.host,
        port: args.port,
        unit: args.unit,
    };

    let mqtt = match args.mqtt {
        Some(mut url) => {
            let prefix = url
                .path()
                .trim_start_matches('/')
                .split('/')
                .next()
                .filter(|prefix| !prefix.is_empty())
                .unwrap_or(env!("CARGO_PKG_NAME"))
                .to_owned();

            if !url.query_pairs().any(|(key, _)| key == "client_id") {
                url.query_pairs_mut()
                    .append_pair("client_id", env!("CARGO_PKG_NAME"))
                    .finish();
            }

            Some(server::MqttSettings {
                options: url.try_into()?,
                prefix,
            })
        }
        None => None,
    };

    server::run(settings, modbus, mqtt, tokio::signal::ctrl_c()).await?;

    Ok(())
}
