//! Worker module host: runs the startup handshake against a controller and
//! then services control messages until told to quit.
//!
//! ```text
//! basalt-module [config.toml] [--host H] [--port P] [--id N] [--name NAME] [--numeric-hosts]
//! ```

use anyhow::Context;
use basalt_appproc::ApplicationProcess;
use basalt_config::ModuleConfig;
use basalt_msg::MessageType;
use basalt_net::HostResolver;
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "basalt-module")]
#[command(about = "Worker module: handshake with the controller, then serve control messages")]
struct Args {
    /// TOML module config. Without one, --port is required.
    config: Option<PathBuf>,

    /// Controller host name or dotted-quad address
    #[arg(long)]
    host: Option<String>,

    /// Controller port
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    id: Option<u32>,

    #[arg(long)]
    name: Option<String>,

    /// Log addresses as dotted quads instead of reverse-resolving them
    #[arg(long)]
    numeric_hosts: bool,
}

impl Args {
    /// The config file (or the built-in defaults) with the flags laid on top.
    fn into_config(self) -> anyhow::Result<ModuleConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let path = path.display().to_string();
                ModuleConfig::load(path.as_str())
                    .with_context(|| format!("loading module config from {path}"))?
            }
            // port has to come from the command line then
            None => ModuleConfig::with_controller("127.0.0.1", 0),
        };

        if let Some(host) = self.host {
            config.controller_host = host;
        }
        if let Some(port) = self.port {
            config.controller_port = port;
        }
        if let Some(id) = self.id {
            config.module_id = id;
        }
        if let Some(name) = self.name {
            config.module_name = name;
        }
        config.validate().context("applying command line overrides")?;
        Ok(config)
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn serve(process: &mut ApplicationProcess) -> anyhow::Result<()> {
    loop {
        let msg = match process.wait_for_control_message() {
            Ok(msg) => msg,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "control message dropped");
                continue;
            }
        };

        match msg.kind {
            MessageType::Quit => {
                info!("quit requested");
                return Ok(());
            }
            MessageType::Error => error!(payload = msg.payload.len(), "error reported"),
            MessageType::Warning => warn!(payload = msg.payload.len(), "warning reported"),
            MessageType::Unknown(tag) => warn!(tag, "ignoring unknown message type"),
            kind => debug!(%kind, origin = ?msg.origin, len = msg.payload.len(), "control message"),
        }
    }
}

fn main() {
    let args = Args::parse();
    if args.numeric_hosts {
        HostResolver::global().set_numeric_only(true);
    }
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("basalt-module: {e:#}");
            std::process::exit(2);
        }
    };
    init_tracing(&config.log_level);
    info!(
        module = %config.module_name,
        id = config.module_id,
        controller = %HostResolver::global().numeric_to_symbolic(&config.controller_host),
        port = config.controller_port,
        "starting module"
    );

    // the handshake logs its own failure stage
    let mut process = match ApplicationProcess::start(config) {
        Ok(process) => process,
        Err(_) => std::process::exit(1),
    };

    if let Err(e) = serve(&mut process) {
        error!(error = %e, "coordinator failed");
        drop(process);
        std::process::exit(1);
    }
    process.shutdown();
}
