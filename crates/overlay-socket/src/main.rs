//! overlay-socket -- exercise virtual-circuit sockets over the in-memory
//! substrate.
//!
//! Usage:
//!   overlay-socket                          # echo round-trip with default config
//!   overlay-socket echo --messages 100 --loss 0.2
//!   overlay-socket --config path.toml config

use clap::{Parser, Subcommand};
use overlay_protocol::{ChannelType, EndpointDescriptor, NodeId, NodeIdentity, SocketAddress};
use std::sync::Arc;
use std::time::Duration;

use overlay_socket::{
    expand_tilde, Acceptor, Connection, MemoryNetwork, SharedSecretCredentials, SocketConfig,
    SocketContext, SocketError, SocketSettings,
};

#[derive(Parser)]
#[command(name = "overlay-socket", about = "Virtual-circuit sockets over an overlay substrate")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.overlay-socket/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Round-trip payloads through an in-process echo listener (default)
    Echo {
        /// Number of payloads to send
        #[arg(short, long, default_value_t = 10)]
        messages: usize,
        /// Use the non-reliable stream discipline
        #[arg(long)]
        unreliable: bool,
        /// Override the substrate loss probability
        #[arg(long)]
        loss: Option<f64>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Default)]
struct EchoReport {
    verified: usize,
    lost: usize,
    mismatched: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overlay_socket=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = SocketConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Config) => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Some(Commands::Echo {
            messages,
            unreliable,
            loss,
        }) => run_echo(cfg, messages, unreliable, loss).await?,
        None => run_echo(cfg, 10, false, None).await?,
    }

    Ok(())
}

fn context(
    network: &MemoryNetwork,
    identity: NodeIdentity,
    cfg: &SocketConfig,
    settings: SocketSettings,
) -> SocketContext {
    let node_id = identity.node_id;
    let ctx = SocketContext::new(
        Arc::new(network.node(identity.clone())),
        identity,
        cfg.node.namespace.clone(),
    )
    .with_settings(settings);
    if cfg.node.secret.is_empty() {
        ctx
    } else {
        ctx.with_credentials(Arc::new(SharedSecretCredentials::new(
            cfg.node.secret.clone(),
            node_id,
        )))
    }
}

async fn run_echo(
    mut cfg: SocketConfig,
    messages: usize,
    unreliable: bool,
    loss: Option<f64>,
) -> anyhow::Result<()> {
    if let Some(loss) = loss {
        cfg.substrate.loss = loss;
    }
    let mut settings = cfg.validate()?;
    if unreliable {
        settings.reliable = false;
    }
    let network = MemoryNetwork::new(cfg.memory_config()?);

    let server_identity = NodeIdentity::new(NodeId::random()).with_hint("echo-server");
    let client_identity = NodeIdentity::new(NodeId::random()).with_hint("echo-client");
    let channel_type = if cfg.node.secret.is_empty() {
        ChannelType::Unicast
    } else {
        ChannelType::SecureUnicast
    };
    let descriptor =
        EndpointDescriptor::new(cfg.node.namespace.clone(), "echo", channel_type).with_name("echo");

    tracing::info!(
        namespace = %cfg.node.namespace,
        reliable = settings.reliable,
        loss = cfg.substrate.loss,
        messages,
        "starting echo"
    );

    let acceptor = Acceptor::bind(
        context(&network, server_identity.clone(), &cfg, settings.clone()),
        descriptor.clone(),
    )?;
    let server = tokio::spawn(async move {
        let result = serve_echo(&acceptor).await;
        acceptor.close().await;
        result
    });

    let conn = Connection::dial(
        context(&network, client_identity, &cfg, settings.clone()),
        &SocketAddress::pinned(descriptor, server_identity),
        settings.connect_timeout,
    )
    .await?;

    let reply_timeout = if settings.read_timeout.is_zero() {
        Duration::from_secs(2)
    } else {
        settings.read_timeout
    };
    let report = exchange(&conn, messages, reply_timeout).await?;
    let reliable = conn.is_reliable();
    if let Err(e) = conn.close().await {
        tracing::warn!(error = %e, "client close incomplete");
    }

    let grace = settings.close_timeout + Duration::from_secs(1);
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(echoed))) => tracing::info!(echoed, "echo server finished"),
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "echo server failed"),
        Ok(Err(e)) => tracing::warn!(error = %e, "echo server panicked"),
        Err(_) => tracing::warn!("echo server did not observe close"),
    }

    let stats = network.stats();
    println!("reliable:    {reliable}");
    println!("sent:        {messages}");
    println!("verified:    {}", report.verified);
    println!("lost:        {}", report.lost);
    println!("mismatched:  {}", report.mismatched);
    println!(
        "substrate:   {} frames, {} dropped, {} duplicated",
        stats.sent, stats.dropped, stats.duplicated
    );
    Ok(())
}

/// Accept one connection and echo everything until end-of-stream.
async fn serve_echo(acceptor: &Acceptor) -> Result<usize, SocketError> {
    let conn = acceptor.accept(Duration::ZERO).await?;
    let mut buf = vec![0u8; 4096];
    let mut echoed = 0;
    loop {
        let n = conn.read(&mut buf, Duration::ZERO).await?;
        if n == 0 {
            break;
        }
        conn.send(&buf[..n])?;
        conn.flush()?;
        echoed += 1;
    }
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "server close incomplete");
    }
    Ok(echoed)
}

async fn exchange(
    conn: &Connection,
    messages: usize,
    reply_timeout: Duration,
) -> anyhow::Result<EchoReport> {
    let mut report = EchoReport::default();
    let mut buf = vec![0u8; 4096];
    for i in 0..messages {
        let payload = format!("echo #{i}");
        conn.send(payload.as_bytes())?;
        conn.flush()?;
        match conn.read(&mut buf, reply_timeout).await {
            Ok(0) => {
                tracing::warn!(sent = i, "server closed early");
                break;
            }
            Ok(n) if &buf[..n] == payload.as_bytes() => report.verified += 1,
            Ok(n) => {
                tracing::debug!(expected = %payload, got = n, "unexpected reply");
                report.mismatched += 1;
            }
            Err(e) if e.is_timeout() => report.lost += 1,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(report)
}
