mod config;
mod policy;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use icap_filter::error::{Error, IcapResult};
use icap_filter::{ConnectionInfo, Request, Server, TracingObserver};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, load_config};
use crate::policy::HostBlocklist;

#[derive(Parser, Debug)]
#[command(
    name = "icap-filter-server",
    about = "ICAP adaptation server with a host blocklist",
    long_about = "Serves ICAP OPTIONS/REQMOD/RESPMOD. REQMOD requests for blocked hosts \
                  are answered with an embedded 403 page; everything else is left unmodified."
)]
struct Args {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Listen address as host:port (overrides the config file)
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// ISTag value (overrides the config file)
    #[arg(long)]
    istag: Option<String>,

    /// Debug level 1-5 (ERROR..TRACE); RUST_LOG is used when absent
    #[arg(short = 'd', long)]
    debug_level: Option<u8>,
}

fn init_logging(debug_level: Option<u8>) {
    match debug_level {
        Some(level) if level > 0 => {
            tracing_subscriber::fmt()
                .with_max_level(match level {
                    1 => tracing::Level::ERROR,
                    2 => tracing::Level::WARN,
                    3 => tracing::Level::INFO,
                    4 => tracing::Level::DEBUG,
                    _ => tracing::Level::TRACE,
                })
                .init();
        }
        _ => {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn resolve_config(args: &Args) -> IcapResult<Config> {
    let mut cfg = match &args.config {
        Some(path) => load_config(path).map_err(|e| Error::configuration(e.to_string()))?,
        None => Config::default(),
    };
    cfg.apply_overrides(args.bind.as_deref(), args.istag.as_deref())
        .map_err(|e| Error::configuration(e.to_string()))?;
    cfg.validate()
        .map_err(|e| Error::configuration(e.to_string()))?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> IcapResult<()> {
    let args = Args::parse();
    init_logging(args.debug_level);
    debug!("Arguments: {:?}", args);

    let cfg = resolve_config(&args).inspect_err(|e| error!(error = %e, "bad configuration"))?;
    let options = cfg
        .service_options()
        .map_err(|e| Error::configuration(e.to_string()))?;

    let blocklist = Arc::new(HostBlocklist::new(&cfg.policy.blocked_hosts));
    info!(
        bind = %cfg.bind_addr(),
        service = %options.service,
        blocked_hosts = blocklist.len(),
        "Starting icap-filter-server"
    );
    if blocklist.is_empty() {
        warn!("no blocked hosts configured, every request passes unmodified");
    }

    let mut builder = Server::builder()
        .bind(&cfg.bind_addr())
        .with_backlog(cfg.server.backlog)
        .with_read_timeout(cfg.read_timeout())
        .with_chunk_size(cfg.server.chunk_size)
        .with_max_frame_bytes(cfg.server.max_frame_bytes)
        .with_frame_mode(cfg.frame_mode())
        .with_options(options)
        .with_observer(TracingObserver)
        .with_handler(move |conn: ConnectionInfo, req: Arc<Request>| {
            Arc::clone(&blocklist).handle(conn, req)
        });
    if let Some(n) = cfg.server.max_connections {
        builder = builder.with_max_connections(n);
    }

    let server = builder.build().await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            return;
        }
        info!("interrupt received, shutting down");
        shutdown.shutdown();
    });

    server
        .run()
        .await
        .inspect_err(|e| error!(error = %e, "server stopped"))
}
