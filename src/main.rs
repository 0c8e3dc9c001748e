use std::path::Path;
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxlink::{ControlServer, RoomManager, WorkerConfig, CONTROL_PORT};

fn main() -> ExitCode {
    // The config path is the sole argument.
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "voxlink".to_string());
    let Some(config_path) = args.next() else {
        eprintln!("Usage: {program} <config_file>");
        return ExitCode::FAILURE;
    };
    if args.next().is_some() {
        eprintln!("Usage: {program} <config_file>");
        return ExitCode::FAILURE;
    }

    let config = match WorkerConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config file: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: WorkerConfig) -> anyhow::Result<()> {
    // Log to the configured file at the configured level; the guard must
    // outlive the runtime so buffered lines are flushed on exit.
    let log_path = Path::new(&config.log.file);
    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let log_name = log_path
        .file_name()
        .ok_or_else(|| anyhow!("log.file {:?} has no file name", config.log.file))?;
    let appender = tracing_appender::rolling::never(log_dir, log_name);
    let (writer, _guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log.level.as_filter()))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    // TLS connections need a process-wide crypto provider before the first
    // handshake.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    info!("config loaded:\n{}", config.summary());

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async {
        let engine = voxlink::tts::engine_from_config(&config.tts_config)
            .context("room manager initialization failed")?;

        let control = ControlServer::new();
        control
            .spawn(&format!("0.0.0.0:{CONTROL_PORT}"))
            .await
            .context("failed to start control server")?;

        let manager = RoomManager::new(&config, engine);
        manager
            .run(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        info!("worker stopped");
        Ok(())
    })
}
