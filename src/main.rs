use std::{net::IpAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use couloir::{
    Relay, RelayOpts,
    cert::{CertService, acme::AcmeOrderer},
    expose::{self, ExposeOpts},
};
use n0_error::{Result, StdResultExt, ensure_any};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "couloir", version, about = "HTTP reverse tunnels over a shared relay")]
enum Cli {
    /// Run the public relay that fronts all couloirs.
    ///
    /// The wildcard record `*.<domain>` must resolve to this host.
    Relay(RelayArgs),
    /// Expose a local HTTP server through a relay.
    Expose(ExposeArgs),
}

#[derive(clap::Args)]
struct RelayArgs {
    /// Domain whose wildcard DNS record points at this host.
    domain: String,
    /// Listener port [default: 443, or 80 with --http].
    #[arg(long)]
    port: Option<u16>,
    /// Serve plain HTTP instead of TLS with on-demand certificates.
    #[arg(long)]
    http: bool,
    /// Shared password required to open couloirs.
    #[arg(long)]
    password: Option<String>,
    /// Contact email for the ACME account.
    #[arg(long)]
    email: Option<String>,
    /// Certificate cache directory [default: ~/.couloir.certs].
    #[arg(long)]
    certs_dir: Option<PathBuf>,
}

#[derive(clap::Args)]
struct ExposeArgs {
    /// Local port to expose.
    local_port: u16,
    /// Relay domain to open the couloir on.
    #[arg(long = "on", value_name = "RELAY_HOST")]
    relay_host: String,
    /// Requested couloir name (subdomain label).
    #[arg(long = "as", value_name = "NAME")]
    name: Option<String>,
    /// Relay port [default: 443, or 80 with --http].
    #[arg(long)]
    relay_port: Option<u16>,
    /// Dial this address instead of resolving the relay host.
    #[arg(long)]
    relay_ip: Option<IpAddr>,
    /// Host of the local server to forward to.
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,
    /// Rewrite the Host header of forwarded requests.
    #[arg(long)]
    override_host: Option<String>,
    /// Talk to the relay over plain HTTP.
    #[arg(long)]
    http: bool,
    /// Shared relay password.
    #[arg(long)]
    password: Option<String>,
    /// Number of idle tunnel sockets kept toward the relay.
    #[arg(long, default_value_t = couloir::DEFAULT_POOL_SIZE)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();
    match Cli::parse() {
        Cli::Relay(args) => run_relay(args).await,
        Cli::Expose(args) => run_expose(args).await,
    }
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    // A password sent over plain HTTP is readable by anyone on the path.
    ensure_any!(
        !(args.http && args.password.is_some()),
        "--password is not enforceable over --http; run the relay in TLS mode"
    );

    let port = args.port.unwrap_or(if args.http { 80 } else { 443 });
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .std_context("failed to bind relay listener")?;

    let opts = RelayOpts::new(args.domain.clone()).password(args.password);
    let relay = if args.http {
        Relay::new(opts)
    } else {
        let certs_dir = args.certs_dir.unwrap_or_else(default_certs_dir);
        let orderer = AcmeOrderer::bootstrap(&certs_dir, args.email.as_deref()).await?;
        let cert = CertService::new(certs_dir, Box::new(orderer));

        let challenge_listener = TcpListener::bind(("0.0.0.0", 80))
            .await
            .std_context("failed to bind the ACME challenge listener on port 80")?;
        tokio::spawn({
            let cert = cert.clone();
            async move {
                if let Err(err) = cert.serve_http01(challenge_listener).await {
                    tracing::error!("ACME challenge listener failed: {err:#}");
                }
            }
        });

        // Warm the apex and the first default couloir name so the first TLS
        // handshakes do not hit a cold SNI miss.
        cert.spawn_ensure(args.domain.clone());
        cert.spawn_ensure(format!("couloir.{}", args.domain));

        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(cert.server_config()));
        Relay::with_tls(opts, acceptor, cert)
    };

    info!("relay for *.{} listening on port {port}", args.domain);
    tokio::select! {
        res = relay.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            relay.shutdown().await;
        }
    }
    Ok(())
}

async fn run_expose(args: ExposeArgs) -> Result<()> {
    let mut opts = ExposeOpts::new(args.local_port, args.relay_host);
    opts.relay_port = args.relay_port.unwrap_or(if args.http { 80 } else { 443 });
    opts.relay_ip = args.relay_ip;
    opts.name = args.name;
    opts.local_host = args.local_host;
    opts.override_host = args.override_host;
    opts.http = args.http;
    opts.password = args.password;
    opts.concurrency = args.concurrency;

    tokio::select! {
        res = expose::run(opts) => {
            if let Err(err) = res {
                return Err(err.into());
            }
        }
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

fn default_certs_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".couloir.certs"))
        .unwrap_or_else(|| PathBuf::from(".couloir.certs"))
}
