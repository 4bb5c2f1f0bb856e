//! racedns: racing DNS forwarder
//!
//! Startup order: parse flags, handle the template/version short
//! circuits, initialize logging, optionally change the working
//! directory, build the runtime, then load config and serve until a
//! signal arrives or a listener dies.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use racedns::cli::Args;
use racedns::config::{BindProtocol, Config};
use racedns::dispatcher::Dispatcher;
use racedns::matchset::MatchSets;
use racedns::server::{TcpServer, UdpServer};
use racedns::upstream::{TlsSettings, Upstream};

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.generate {
        Config::generate(path)?;
        println!("configuration template written to {}", path.display());
        return Ok(());
    }

    init_logging(&args);
    change_working_dir(&args)?;

    info!(version = racedns::VERSION, "racedns starting");

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(cpu) = args.cpu {
        builder.worker_threads(cpu.max(1));
    }
    let runtime = builder.build().context("failed to build runtime")?;

    runtime.block_on(run(&args.config))
}

fn init_logging(args: &Args) {
    let default_filter = if args.quiet {
        "error"
    } else if args.debug {
        "racedns=debug,info"
    } else {
        "racedns=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn change_working_dir(args: &Args) -> Result<()> {
    let target = if args.dir_follow_executable {
        let exe = std::env::current_exe().context("cannot locate executable")?;
        exe.parent().map(Path::to_path_buf)
    } else {
        args.dir.clone()
    };

    if let Some(dir) = target {
        std::env::set_current_dir(&dir)
            .with_context(|| format!("cannot change working directory to {}", dir.display()))?;
        info!(dir = %dir.display(), "working directory changed");
    }
    Ok(())
}

async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    let sets = MatchSets::load(
        config
            .sets
            .domain
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path())),
        config
            .sets
            .ip
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path())),
    )?;
    let tls = TlsSettings::load(&config.ca.path)?;

    let mut upstreams = Vec::with_capacity(config.upstream.len());
    for (tag, options) in &config.upstream {
        let upstream = Upstream::from_options(tag, options, &sets, &tls)?;
        info!(tag, protocol = ?options.protocol, "upstream ready");
        upstreams.push(Arc::new(upstream));
    }

    let dispatcher = Arc::new(
        Dispatcher::new(
            upstreams,
            config.dispatcher.cache.size,
            config.dispatcher.min_ttl,
        )
        .with_timeout(Duration::from_secs(config.dispatcher.timeout.max(1))),
    );

    let mut servers: JoinSet<racedns::error::DnsResult<()>> = JoinSet::new();
    let mut shutdowns: Vec<oneshot::Sender<()>> = Vec::new();

    for bind in config.dispatcher.bind_addrs()? {
        let (tx, rx) = oneshot::channel();
        shutdowns.push(tx);
        match bind.protocol {
            BindProtocol::Udp => {
                let server = UdpServer::bind(
                    bind.addr,
                    Arc::clone(&dispatcher),
                    config.dispatcher.max_udp_size,
                )
                .await?;
                servers.spawn(async move { server.run_until_shutdown(rx).await });
            }
            BindProtocol::Tcp => {
                let server = TcpServer::bind(bind.addr, Arc::clone(&dispatcher)).await?;
                servers.spawn(async move { server.run_until_shutdown(rx).await });
            }
        }
    }

    tokio::select! {
        () = shutdown_signal() => {
            info!("signal received, shutting down");
            for tx in shutdowns {
                let _ = tx.send(());
            }
            while servers.join_next().await.is_some() {}
            Ok(())
        }
        exited = servers.join_next() => {
            match exited {
                Some(Ok(Ok(()))) => bail!("listener exited unexpectedly"),
                Some(Ok(Err(e))) => Err(e).context("listener failed"),
                Some(Err(e)) => Err(e).context("listener panicked"),
                None => bail!("no listeners configured"),
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
