use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    sync::Arc,
};

use clap::Parser;
use http::Uri;
use n0_error::{Result, StdResultExt};
use proxyfs::Proxy;
use tracing::info;

/// Intercepting HTTP proxy controlled through a FUSE filesystem.
#[derive(Parser)]
#[command(name = "proxyfs")]
struct Cli {
    /// Where to mount the control filesystem.
    mountpoint: Option<PathBuf>,
    /// Address to listen on.
    #[clap(short, long, default_value = "127.0.0.1")]
    listen: IpAddr,
    /// Port to listen on.
    #[clap(short, long, default_value_t = 8080)]
    port: u16,
    /// Regex limiting which URLs are intercepted.
    #[clap(short, long, default_value = ".")]
    scope: String,
    /// Upstream proxy to chain through.
    #[clap(short, long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let Some(mountpoint) = cli.mountpoint else {
        eprintln!("proxyfs: missing MOUNTPOINT");
        return ExitCode::from(1);
    };
    match run(cli.listen, cli.port, &cli.scope, cli.upstream, mountpoint).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("proxyfs: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(
    listen: IpAddr,
    port: u16,
    scope: &str,
    upstream: Option<String>,
    mountpoint: PathBuf,
) -> Result<()> {
    let mut proxy = Proxy::new(scope)?;
    if let Some(upstream) = upstream {
        let upstream = Uri::from_str(&upstream).std_context("invalid upstream URL")?;
        proxy = proxy.with_upstream(upstream);
    }
    let proxy = Arc::new(proxy);

    let mount_proxy = proxy.clone();
    let mount_task = tokio::task::spawn_blocking(move || mount_proxy.mount(&mountpoint));

    let addr = SocketAddr::new(listen, port);
    // The filesystem auto-unmounts when the process exits.
    tokio::select! {
        res = proxy.listen_and_serve(addr) => res?,
        res = mount_task => {
            res.std_context("mount task panicked")?
                .std_context("failed to serve control filesystem")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}
