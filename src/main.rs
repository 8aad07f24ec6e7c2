use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use netatmo_influx::authorize::CallbackAuthorizer;
use netatmo_influx::config::{AgentConfig, LogFormat};
use netatmo_influx::device::HttpDeviceApi;
use netatmo_influx::ingest::IngestionLoop;
use netatmo_influx::lock::InstanceLock;
use netatmo_influx::oauth::HttpTokenEndpoint;
use netatmo_influx::shutdown::Shutdown;
use netatmo_influx::sink::InfluxSink;
use netatmo_influx::token::TokenManager;

fn main() {
    let config = match AgentConfig::load() {
        Ok(config) => config,
        Err(e) => e.exit(),
    };

    init_tracing(config.log_format);

    if let Err(e) = run(config) {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => fmt::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => fmt::fmt().with_env_filter(filter).init(),
    }
}

fn run(config: AgentConfig) -> anyhow::Result<()> {
    let shutdown = Shutdown::new();
    shutdown
        .install_signal_handler()
        .context("failed to install signal handler")?;

    let store = config.store().context("failed to locate state file")?;
    let _lock = InstanceLock::acquire(store.path())?;
    info!(path = %store.path().display(), "using state file");

    let timeout = config.http_timeout();
    let endpoint = HttpTokenEndpoint::new(config.oauth_config(), timeout)?;
    let device = HttpDeviceApi::new(config.device_url.clone(), timeout)?;
    let sink = InfluxSink::new(&config.influx_config(), timeout)?;
    let authorizer =
        CallbackAuthorizer::new(config.oauth_config(), config.callback_addr(), config.auth_timeout())
            .open_browser(config.open_browser);

    let tokens = TokenManager::new(Arc::new(store), endpoint);
    let mut ingest = IngestionLoop::new(
        tokens,
        Box::new(device),
        Box::new(sink),
        Box::new(authorizer),
        shutdown,
    )
    .with_cadence(config.cadence());

    ingest.bootstrap().context("authorization failed")?;
    ingest.run();
    Ok(())
}
