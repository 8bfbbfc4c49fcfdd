pub mod models {
    pub mod ecobee;
}

pub mod auth;
pub mod client;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod envfile;
pub mod records;
pub mod retry;
pub mod schema;
pub mod sinks;
pub mod units;
pub mod watermark;
pub mod services {
    pub mod listing;
    pub mod sync;
}

use crate::auth::CredentialStore;
use crate::client::EcobeeClient;
use crate::config::{Config, EcobeeSettings};
use crate::records::RecordOptions;
use crate::services::{listing, sync::Engine};
use crate::sinks::mqtt::MqttSink;
use crate::sinks::timescale::TimescaleSink;
use crate::sinks::{MessageBus, Publisher, TimeSeries};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

/// Polls an ecobee thermostat and republishes new telemetry to TimescaleDB and MQTT.
#[derive(Debug, Parser)]
#[command(name = "ecobee-timescale", version, about)]
struct Cli {
    /// Load environment variables from this file instead of ./.env
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// List the thermostats registered to the account, then exit.
    #[arg(long, conflicts_with = "authorize")]
    list_thermostats: bool,

    /// Pair with ecobee using a PIN and store the credential cache, then exit.
    #[arg(long)]
    authorize: bool,
}

fn ecobee_client(settings: &EcobeeSettings) -> EcobeeClient {
    let store = CredentialStore::load(settings.api_key.clone(), settings.credential_cache.clone());
    EcobeeClient::new(store, settings.fetch_timeout)
}

fn build_publisher(cfg: &Config) -> Result<Publisher, String> {
    let mut publisher = Publisher::new(cfg.sink_policy);

    if let Some(ts) = &cfg.timescale {
        let sink = TimescaleSink::connect(&ts.database_url, &cfg.thermostat_id)?;
        publisher = publisher.with_sink(Box::new(TimeSeries::new(sink)), cfg.publish_retry(ts.timeout));
    }

    if let Some(mqtt) = &cfg.mqtt {
        let sink = MqttSink::connect(mqtt)?;
        publisher = publisher.with_sink(
            Box::new(MessageBus::new(sink, mqtt.topic_root.clone(), cfg.thermostat_id.clone())),
            cfg.publish_retry(mqtt.timeout),
        );
    }

    if publisher.is_empty() {
        return Err("No sink enabled".to_string());
    }
    Ok(publisher)
}

fn run(cli: &Cli) -> Result<(), String> {
    // 1) Modes that only need the ecobee API
    if cli.authorize {
        let client = ecobee_client(&EcobeeSettings::from_env()?);
        return client.authorize().map_err(|e| format!("authorization failed: {}", e));
    }
    if cli.list_thermostats {
        let client = ecobee_client(&EcobeeSettings::from_env()?);
        return listing::print_thermostats(&client);
    }

    // 2) Load config
    let cfg = Config::from_env()?;
    info!("Config loaded ({})", cfg.summary());

    // 3) Credentials
    let client = ecobee_client(&cfg.ecobee);
    client
        .ensure_token()
        .map_err(|e| format!("no usable ecobee credentials: {}", e))?;

    // 4) Sinks (connect + migrate)
    let publisher = build_publisher(&cfg)?;
    info!(
        "Publishing to {} (sink policy: {})",
        publisher.sink_names().join(", "),
        publisher.policy()
    );

    // 5) Sync loop (steady cadence)
    let options = RecordOptions {
        equipment: cfg.equipment,
        unit: cfg.temperature_unit,
        always_current_weather: cfg.always_write_weather_as_current,
    };
    let engine = Engine::new(&client, &publisher, cfg.thermostat_id.clone(), options, cfg.cycle_retry);
    info!(
        "Starting sync loop: thermostat={}, interval={}s",
        cfg.thermostat_id,
        cfg.poll_interval.as_secs()
    );
    engine.run_loop(cfg.poll_interval)
}

fn main() {
    let cli = Cli::parse();

    let loaded_env = match envfile::load(cli.env_file.as_deref()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "ecobee-timescale {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
