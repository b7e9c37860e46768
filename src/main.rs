//! Command line frontend.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use domino::config::{Config, EnrollmentIdentity, TunnelParams};
use domino::dns::TunnelResolver;
use domino::netstack::VirtualStack;
use domino::socks::SocksServer;
use domino::supervisor::maintain_tunnel;
use domino::tls;

#[derive(Parser, Debug)]
#[command(name = "domino", about = "MASQUE VPN client that needs no elevated privileges")]
struct Cli {
    /// Path to the enrollment configuration
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expose the tunnel as a SOCKS5 proxy
    Socks(SocksArgs),
}

#[derive(Args, Debug)]
struct SocksArgs {
    /// Address to bind the SOCKS proxy to
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on for SOCKS
    #[arg(short, long)]
    port: Option<String>,

    /// Username for proxy authentication (set both username and password)
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Password for proxy authentication
    #[arg(short = 'w', long)]
    password: Option<String>,

    /// UDP port of the provider endpoint
    #[arg(short = 'P', long)]
    connect_port: Option<u16>,

    /// DNS servers to use, overriding the configured list
    #[arg(short, long)]
    dns: Vec<IpAddr>,

    /// Timeout for DNS queries
    #[arg(short = 't', long)]
    dns_timeout: Option<humantime::Duration>,

    /// Connect to the endpoint via IPv6
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Disable IPv4 inside the tunnel
    #[arg(short = 'F', long)]
    no_tunnel_ipv4: bool,

    /// Disable IPv6 inside the tunnel
    #[arg(short = 'S', long)]
    no_tunnel_ipv6: bool,

    /// SNI to present to the endpoint
    #[arg(short, long)]
    sni_address: Option<String>,

    /// QUIC keepalive period
    #[arg(short = 'k', long)]
    keepalive_period: Option<humantime::Duration>,

    /// Tunnel MTU (values other than 1280 are unsupported)
    #[arg(short, long)]
    mtu: Option<usize>,

    /// Initial QUIC packet size
    #[arg(short = 'i', long)]
    initial_packet_size: Option<u16>,

    /// Pause between reconnect attempts
    #[arg(short = 'r', long)]
    reconnect_delay: Option<humantime::Duration>,

    /// Resolve names via the host resolver instead of through the tunnel
    #[arg(short = 'l', long)]
    local_dns: bool,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .context("no usable configuration; enroll a device first")?;

    match cli.command {
        Command::Socks(args) => run_socks(config, args).await,
    }
}

async fn run_socks(config: Config, args: SocksArgs) -> Result<()> {
    let identity = EnrollmentIdentity::from_config(&config)?;

    // Invoking the subcommand is the explicit enable; the config switch
    // only survives for compatibility with enrolled files.
    if !config.socks.enabled {
        warn!("config marks the SOCKS frontend disabled; running anyway because it was requested explicitly");
    }

    // Precedence is resolved exactly once: flag, then config, then default.
    let bind = args
        .bind
        .or_else(|| non_empty(config.socks.bind_address.clone()))
        .unwrap_or_else(|| "0.0.0.0".into());
    let port = args
        .port
        .or_else(|| non_empty(config.socks.port.clone()))
        .unwrap_or_else(|| "1080".into());
    let username = args
        .username
        .or_else(|| non_empty(config.socks.username.clone()));
    let password = args
        .password
        .or_else(|| non_empty(config.socks.password.clone()));
    let auth = match (username, password) {
        (Some(user), Some(pass)) => Some((user, pass)),
        _ => None,
    };

    let tunnel = &config.tunnel;
    let connect_port = args.connect_port.unwrap_or(tunnel.connect_port);
    // use_ipv6 = false picks the v4 endpoint; that inversion is the
    // long-standing default and kept as observable behaviour.
    let use_ipv6 = args.ipv6 || tunnel.use_ipv6;
    let no_tunnel_ipv4 = args.no_tunnel_ipv4 || tunnel.no_tunnel_ipv4;
    let no_tunnel_ipv6 = args.no_tunnel_ipv6 || tunnel.no_tunnel_ipv6;
    let dns_servers: Vec<IpAddr> = if args.dns.is_empty() {
        tunnel.dns.clone()
    } else {
        args.dns.clone()
    };
    let dns_timeout: Duration = args
        .dns_timeout
        .map(Into::into)
        .unwrap_or_else(|| tunnel.dns_timeout.get());
    let mtu = args.mtu.unwrap_or(tunnel.mtu);
    if mtu != 1280 {
        warn!(mtu, "MTU other than 1280 is unsupported; expect packet loss");
    }
    let sni = args
        .sni_address
        .clone()
        .or_else(|| non_empty(tunnel.sni_address.clone()))
        .context("no SNI address configured")?;

    let params = TunnelParams {
        endpoint: identity.endpoint(use_ipv6, connect_port)?,
        sni,
        keepalive_period: args
            .keepalive_period
            .map(Into::into)
            .unwrap_or_else(|| tunnel.keepalive_period.get()),
        initial_packet_size: args
            .initial_packet_size
            .unwrap_or(tunnel.initial_packet_size),
        mtu,
        reconnect_delay: args
            .reconnect_delay
            .map(Into::into)
            .unwrap_or_else(|| tunnel.reconnect_delay.get()),
        connect_timeout: tunnel.connection_timeout.get(),
        idle_timeout: tunnel.idle_timeout.get(),
    };

    let local_addrs = identity.tunnel_addresses(no_tunnel_ipv4, no_tunnel_ipv6);
    let (packet_face, socket_face) = VirtualStack::new(&local_addrs, dns_servers.clone(), mtu)?;
    let (tls_config, pin_mismatch) = tls::build_client_config(&identity, &params)?;

    let cancel = CancellationToken::new();
    let mut supervisor = tokio::spawn(maintain_tunnel(
        params,
        tls_config,
        pin_mismatch,
        packet_face,
        cancel.clone(),
    ));

    let resolver = Arc::new(if args.local_dns {
        TunnelResolver::local(dns_timeout)
    } else {
        TunnelResolver::tunnelled(socket_face.clone(), dns_servers, dns_timeout)
    });

    let listener = TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("binding SOCKS listener on {bind}:{port}"))?;
    info!(%bind, %port, "SOCKS proxy listening");

    let server = Arc::new(SocksServer::new(socket_face, resolver, auth));
    tokio::spawn(server.serve(listener, cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        result = &mut supervisor => {
            cancel.cancel();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), supervisor).await;
    Ok(())
}
