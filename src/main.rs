use std::process;
use std::sync::Arc;
use std::time::Duration;

use dronewire::channel::TransportContext;
use dronewire::config::AppConfig;
use dronewire::logging::{LogLevel, Logger, LoggerConfig};
use dronewire::roles;
use dronewire::shutdown::{ShutdownHooks, ShutdownSignal};
use serde_json::json;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::from_app_config(&app_config.logging).unwrap_or_else(|error| {
        eprintln!("{error}");
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let shutdown = ShutdownSignal::new();
    let _shutdown_hooks = ShutdownHooks::install(&shutdown).unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let ctx = TransportContext::from_app_config(&app_config, shutdown.clone(), Arc::clone(&logger));
    logger.log(
        LogLevel::Info,
        Some("main::wire"),
        "Transport initialized",
        Some(json!({
            "max_frame_size_bytes": ctx.codec().max_frame_size_bytes(),
            "poll_interval_ms": app_config.transport.poll_interval_ms,
            "reply_timeout_ms": app_config.transport.reply_timeout_ms
        })),
    );

    let runtime = roles::build(&app_config, ctx).unwrap_or_else(|error| {
        eprintln!("role setup error: {error}");
        process::exit(2);
    });
    let coordinator = runtime.coordinator();
    if let Err(error) = coordinator.start_all() {
        eprintln!("startup error: {error}");
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::coordinator"),
        &format!(
            "{} v{} started as {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            runtime.role().as_str()
        ),
        Some(coordinator.status()),
    );

    while !shutdown.wait_timeout(Duration::from_secs(1), SHUTDOWN_POLL) {}

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, stopping workers",
    );
    let report = coordinator.stop_all();
    let clean = report.failures.is_empty();
    logger.log(
        if clean { LogLevel::Info } else { LogLevel::Warn },
        Some("main::shutdown"),
        "Workers stopped and shutdown completed",
        serde_json::to_value(&report).ok(),
    );
    if !clean {
        process::exit(1);
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: dronewire is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const APP_DESCRIPTION: &str =
        "Request/reply and notification routing between a drone relay and its ground station.";

    println!("{BANNER_COLOR}dronewire{RESET}");
    println!(
        "{} v{} | build {} | rev {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("DRONEWIRE_BUILD_DATE_UTC"),
        env!("DRONEWIRE_REVISION")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}MIT License: provided \"AS IS\", without warranty or liability.{RESET}");
    println!();
}
