
mod api;
mod artnet;
mod messages;
mod push_bus;
mod service;
mod stage;
mod store;

use rustop::opts;
use service::ServiceConfig;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let (args, _) = opts! {
        synopsis "Art-Net stage lighting controller";
        opt listen:String=String::from("0.0.0.0:8000"), desc: "HTTP listen address";
        opt data_dir:String=String::from("data"), desc: "Directory holding the JSON state files";
    }
    .parse_or_exit();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{}", get_version());

    let http_addr = match args.listen.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid listen address '{}': {}", args.listen, e);
            std::process::exit(2);
        }
    };

    let config = ServiceConfig {
        http_addr,
        data_dir: args.data_dir.into(),
    };

    let service = service::Service::new(config);
    let service = match service.start().await {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to start service: {:?}", e);
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    let _ = service.stop().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

pub fn get_version() -> String {
    format!(
        "artnet_stage: {} (built at {})",
        built_info::PKG_VERSION,
        built_info::BUILT_TIME_UTC
    )
}

// Include the generated-file as a separate module
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
