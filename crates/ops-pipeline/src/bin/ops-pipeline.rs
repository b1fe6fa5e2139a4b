//! AI-Ops pipeline main executable.

use clap::{Arg, Command};
use ops_common::config::Config;
use ops_pipeline::app::{default_device, default_executor, default_llm, default_notifier, App};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let matches = Command::new("ops-pipeline")
        .version(env!("CARGO_PKG_VERSION"))
        .about("AI-Ops event pipeline for network-device fleets")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .required(false),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Syslog UDP bind address (overrides config)")
                .required(false),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let mut config = load_config(matches.get_one::<String>("config"))?;
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.syslog.bind_address = bind.clone();
    }

    info!("starting ops-pipeline v{}", env!("CARGO_PKG_VERSION"));
    info!(data_dir = %config.data_dir.display(), bind = %config.syslog.bind_address, "configuration loaded");

    let app = match App::bootstrap(&config, default_device(), default_llm(), default_notifier(), default_executor()).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "failed to bootstrap pipeline");
            std::process::exit(1);
        }
    };

    let handles = match app.start(&config).await {
        Ok(handles) => handles,
        Err(e) => {
            error!(error = %e, "failed to start pipeline");
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!("received shutdown signal, shutting down");
    app.shutdown().await;
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ops_pipeline=info,ops_rules=info,ops_analysis=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&String>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!(path, "loading configuration from file");
            Ok(Config::from_file(path)?)
        }
        None => {
            info!("using default configuration");
            Ok(Config::default())
        }
    }
}
