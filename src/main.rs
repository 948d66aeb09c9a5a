use std::{error::Error, path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wdebugger::{
    certs::CertCenter,
    config::{log_directive, CertServerConfig, ProxyConfig},
    Debugger,
};

#[derive(Parser, Debug)]
#[command(version, about = "Intercepting SOCKS5 proxy and certificate center")]
struct Cli {
    /// Configuration file
    #[arg(short = 'f', long = "file", default_value = "./wdebugger.json")]
    file: PathBuf,

    /// Run the certificate center instead of the proxy
    #[arg(short = 's', long = "server")]
    server: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    if cli.server {
        run_cert_center(cli.file).await
    } else {
        run_proxy(cli.file).await
    }
}

fn init_tracing(level: i32) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_directive(level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_proxy(file: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = ProxyConfig::from_file(&file)?;
    init_tracing(config.log);
    info!("Starting proxy from {}", file.display());
    if !config.proxy.http.is_empty() {
        warn!(
            "proxy.http is set to {} but the HTTP helper is not started by wdebugger",
            config.proxy.http
        );
    }

    let debugger = Arc::new(Debugger::bind(config.routing(), config.proxy.socks5.as_str()).await?);
    tokio::spawn({
        let debugger = Arc::clone(&debugger);
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, closing");
                    debugger.close();
                }
                Err(err) => warn!("Listening for Ctrl-C failed: {}", err),
            }
        }
    });

    debugger.run().await?;
    Ok(())
}

async fn run_cert_center(file: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = CertServerConfig::from_file(&file)?;
    init_tracing(config.log);
    info!("Starting certificate center from {}", file.display());

    let listener = TcpListener::bind(config.listen.as_str()).await?;
    let center = Arc::new(CertCenter::new(config.certs));
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, closing");
                    shutdown.cancel();
                }
                Err(err) => warn!("Listening for Ctrl-C failed: {}", err),
            }
        }
    });

    center.serve(listener, shutdown).await?;
    Ok(())
}
