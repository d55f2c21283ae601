// citeproxy: run the CORS bridge, or ask a running one to stop.

use anyhow::Context;
use citeproxy::{config, logging, ProxyConfig, ProxyServer};
use citeproxy_core::ProxyError;
use clap::{Parser, Subcommand};

/// Local CORS bridge for the Zotero connector
#[derive(Parser, Debug)]
#[command(name = "citeproxy", version, about)]
struct Args {
    /// Acknowledge stop commands without exiting (used by autostart)
    #[arg(long)]
    persistent: bool,

    /// Enable debug logging, also to stdout
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the running proxy to stop (best effort, always succeeds)
    Kill,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load();
    let _guard = logging::init(&args.log_level, args.debug, cfg.log_max_bytes);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    if let Some(Command::Kill) = args.command {
        rt.block_on(citeproxy_core::send_stop(cfg.listen_addr()));
        return Ok(());
    }

    rt.block_on(serve(cfg.proxy_config(args.persistent)))
}

async fn serve(proxy_config: ProxyConfig) -> anyhow::Result<()> {
    let server = match ProxyServer::bind(proxy_config).await {
        Ok(server) => server,
        Err(ProxyError::AddrInUse(addr)) => {
            tracing::warn!(%addr, "port is already bound, exiting");
            return Ok(());
        }
        Err(e) => return Err(e).context("failed to start proxy"),
    };
    tracing::info!("proxy started");
    server.run(shutdown_signal()).await?;
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
