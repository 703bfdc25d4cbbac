/*!
Unipi Control daemon entry point.

Startup ordering is explicit: parse the CLI, load and validate the
configuration, build the logging sink, identify the hardware from its
EEPROM, load the definition files, open the bus clients and probe
boards/extensions, materialize features and covers, then hand everything to
the MQTT runtime. Nothing reaches for ambient state; every component gets
its collaborators injected here.

Exit codes: 0 on clean shutdown (SIGINT/SIGTERM), 1 on configuration or
hardware errors and on fatal runtime errors such as MQTT retry exhaustion.
*/

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};

use unipi_control::config::{Config, DEFAULT_CONFIG_DIR};
use unipi_control::covers::CoverMap;
use unipi_control::error::Error;
use unipi_control::features::FeatureMap;
use unipi_control::hardware::{HardwareInfo, HardwareMap};
use unipi_control::logging::{self, LogSink, prefix};
use unipi_control::modbus::{self, DEFAULT_RTU_TIMEOUT, DEFAULT_TCP_TIMEOUT, Scanner};
use unipi_control::mqtt::MqttRuntime;
use unipi_control::registers::{Bus, shared_cache};

#[derive(Parser)]
#[command(name = "unipi-control", version, about = "Control Unipi I/O with MQTT commands")]
struct Cli {
    /// Path to the configuration directory
    #[arg(short, long, default_value = DEFAULT_CONFIG_DIR)]
    config: PathBuf,

    /// Log sink: stdout or systemd (sd-daemon priority prefixes)
    #[arg(long, default_value = "stdout")]
    log: LogSink,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The configuration is read before the subscriber exists so that
    // `logging.level` can set the default level; config errors therefore go
    // to stderr directly.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let level = if cli.verbose > 0 {
        logging::verbosity_level(cli.verbose)
    } else {
        logging::config_level(&config.logging.level).unwrap_or(tracing::Level::INFO)
    };
    logging::init(cli.log, level);

    match run(config).await {
        Ok(()) => {
            info!("Successfully shutdown the Unipi Control service.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let config = Arc::new(config);

    let info = HardwareInfo::read(Path::new(HardwareInfo::SYS_BUS))?;
    info!(
        "{} Hardware: {} {} (firmware: {}, serial: {})",
        prefix::CONFIG, info.name, info.model, info.version, info.serial
    );
    let hardware = Arc::new(HardwareMap::load(&config, info)?);

    let mut tcp_ctx = modbus::connect_tcp(&config.modbus_tcp).await?;
    let boards = modbus::probe_boards(&mut tcp_ctx, DEFAULT_TCP_TIMEOUT).await;

    let cache = shared_cache();
    let (tcp_writes, tcp_write_queue) = modbus::write_channel();
    let (rtu_writes, rtu_write_queue) = modbus::write_channel();

    // The serial bus is only opened when extensions are declared.
    let (rtu_scanner, probed_extensions) = if hardware.extensions.is_empty() {
        (None, Vec::new())
    } else {
        let mut rtu_ctx = modbus::connect_rtu(&config.modbus_serial)?;
        let probed = modbus::probe_extensions(&mut rtu_ctx, &hardware, DEFAULT_RTU_TIMEOUT).await;
        let blocks = modbus::rtu_blocks(&hardware)?;
        let scanner = Scanner::new(
            Bus::Rtu,
            rtu_ctx,
            blocks,
            cache.clone(),
            DEFAULT_RTU_TIMEOUT,
            rtu_write_queue,
        );
        (Some(Arc::new(Mutex::new(scanner))), probed)
    };

    let mut features = FeatureMap::build(
        &config,
        &hardware,
        &boards,
        &probed_extensions,
        &cache,
        &tcp_writes,
        &rtu_writes,
    )?;
    info!("{} {} features initialized.", prefix::CONFIG, features.len());

    let covers = CoverMap::build(&config, &mut features)?;
    let features = Arc::new(features);

    let tcp_blocks = modbus::tcp_blocks(&hardware, &boards)?;
    let tcp_scanner = Scanner::new(
        Bus::Tcp,
        tcp_ctx,
        tcp_blocks,
        cache.clone(),
        DEFAULT_TCP_TIMEOUT,
        tcp_write_queue,
    );

    let runtime = MqttRuntime::new(
        config.clone(),
        hardware.clone(),
        features,
        covers,
        Some(Arc::new(Mutex::new(tcp_scanner))),
        rtu_scanner,
    );

    // The runtime is awaited directly rather than raced against the signal:
    // it observes the shutdown flag itself and joins its child tasks before
    // returning, so nothing is still running when the relays are released.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received exit, exiting");
        let _ = shutdown_tx.send(true);
    });

    let result = runtime.run(shutdown_rx).await;
    runtime.shutdown().await;
    result
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
