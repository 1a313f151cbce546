//! peerlink command line client
//!
//! - Opens local TCP tunnels to services behind a peer device and watches
//!   them until Ctrl-C or until every tunnel has closed
//! - Invokes RPC URLs, optionally only after checking the peer's interface
//! - Lists devices discovered on the local network
//! - Creates and lists certificates held by the gateway

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use peerlink::{
    client::{self, SessionOptions},
    config::{generate_example_config, Config, GatewayBackend},
    crypto::{Psk, PskId},
    gateway::{DirectGateway, MemoryGateway, SessionGateway},
    rpc::{Negotiator, RpcError},
    tunnel::{parse_tunnel_spec, OpenFailurePolicy, TunnelRegistry, TunnelSpec},
    CancellationSignal,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// peerlink - tunnels and RPC over authenticated peer sessions
#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(about = "Tunnels and interface-checked RPC over authenticated peer sessions")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "peerlink.toml")]
    config: String,

    /// Gateway backend: direct or memory (overrides config)
    #[arg(short = 'g', long)]
    gateway: Option<GatewayBackend>,

    /// Gateway home directory holding certificates and the simulation file
    /// (overrides config)
    #[arg(long)]
    home_dir: Option<String>,

    /// Credential name (overrides config)
    #[arg(short = 'n', long)]
    cert_name: Option<String>,

    /// Passphrase for the credential's private key (overrides config)
    #[arg(short = 'a', long, env = "PEERLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// JSON document passed to the basestation for authentication
    #[arg(long)]
    basestation_auth_json: Option<String>,

    /// Pre-shared key id for local connections (32 hex chars or colon form)
    #[arg(long, requires = "psk")]
    psk_id: Option<String>,

    /// Pre-shared key for local connections (32 hex chars or colon form)
    #[arg(long, requires = "psk_id")]
    psk: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open tunnels and watch them until interrupted or closed
    Tunnel {
        /// Device id the tunnels go through
        #[arg(short = 'd', long)]
        device: String,

        /// Compact tunnel spec <local port>:<remote host>:<remote port>, repeatable
        #[arg(short = 't', long = "tunnel")]
        specs: Vec<String>,

        /// Local port for a single tunnel (0 lets the gateway choose)
        #[arg(short = 'l', long, conflicts_with = "specs")]
        local_port: Option<u16>,

        /// Remote port for a single tunnel
        #[arg(short = 'r', long, conflicts_with = "specs")]
        remote_port: Option<u16>,

        /// Remote host for a single tunnel (defaults to config)
        #[arg(long, conflicts_with = "specs")]
        remote_host: Option<String>,

        /// Keep opened tunnels when a later one fails to open
        #[arg(long)]
        keep_on_failure: bool,
    },

    /// Invoke an RPC URL
    Rpc {
        /// URL to invoke, e.g. nabto://device.example.net/wind_speed.json?
        #[arg(short = 'q', long)]
        url: String,

        /// Interface definition file to install before invoking
        #[arg(short = 'i', long)]
        interface_definition: Option<String>,

        /// Interface id the peer must implement
        #[arg(long, requires = "interface_version")]
        interface_id: Option<String>,

        /// Interface version the peer must support (<major>.<minor>)
        #[arg(long, requires = "interface_id")]
        interface_version: Option<String>,
    },

    /// Show device ids discovered on the local network
    Discover,

    /// Manage certificates
    Cert {
        #[command(subcommand)]
        action: CertCommand,
    },

    /// Show version information
    Version,

    /// Write an example configuration file
    InitConfig,
}

#[derive(Subcommand, Debug)]
enum CertCommand {
    /// Create a self-signed certificate named by --cert-name, protected by --password
    Create,

    /// List stored certificates
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::InitConfig = args.command {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        println!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    let mut config =
        Config::load_or_default(&args.config).context("Failed to load configuration")?;
    if let Some(backend) = args.gateway {
        config.gateway.backend = backend;
    }
    if let Some(home_dir) = &args.home_dir {
        config.gateway.home_dir = Some(home_dir.clone());
    }
    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    match config.gateway.backend {
        GatewayBackend::Direct => {
            let gateway = DirectGateway::with_bind_host(&config.gateway.bind_host);
            run(Arc::new(gateway), &args, &config).await
        }
        GatewayBackend::Memory => {
            let path = config.gateway.simulation_file();
            let gateway = MemoryGateway::load(&path)
                .with_context(|| format!("Failed to load simulation {}", path.display()))?;
            run(Arc::new(gateway), &args, &config).await
        }
    }
}

/// Initialize the tracing subscriber
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}

/// Run the selected command against `gateway`
async fn run<G: SessionGateway>(gateway: Arc<G>, args: &Args, config: &Config) -> Result<()> {
    info!("Using {}", gateway.version());

    match &args.command {
        Command::Tunnel {
            device,
            specs,
            local_port,
            remote_port,
            remote_host,
            keep_on_failure,
        } => {
            // Parse everything before opening anything
            let specs = if !specs.is_empty() {
                specs
                    .iter()
                    .map(|s| parse_tunnel_spec(s))
                    .collect::<Result<Vec<_>, _>>()?
            } else if let Some(remote_port) = remote_port {
                vec![TunnelSpec {
                    local_port: local_port.unwrap_or(0),
                    remote_host: remote_host
                        .clone()
                        .unwrap_or_else(|| config.tunnel.default_remote_host.clone()),
                    remote_port: *remote_port,
                }]
            } else {
                bail!("Either --tunnel or --remote-port is required");
            };
            let policy = if *keep_on_failure {
                OpenFailurePolicy::Keep
            } else {
                config.tunnel.on_open_failure
            };

            let options = session_options(args, config)?;
            let session = client::open_session(gateway.as_ref(), &options).await?;

            let cancel = CancellationSignal::new();
            let mut registry = TunnelRegistry::new(Arc::clone(&gateway), session, cancel.clone())
                .with_poll_interval(config.tunnel.poll_interval());

            // Interrupts only flip the flag; teardown happens in run_tunnels
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down...");
                    cancel.request_stop();
                }
            });

            let result = client::run_tunnels(&mut registry, device, &specs, policy).await;
            client::close_session(gateway.as_ref(), session).await;
            result?;
            Ok(())
        }
        Command::Rpc {
            url,
            interface_definition,
            interface_id,
            interface_version,
        } => {
            let definition = interface_definition
                .clone()
                .or_else(|| config.rpc.interface_definition.clone());
            let declared = match (interface_id, interface_version) {
                (Some(id), Some(version)) => Some((id.clone(), version.clone())),
                _ => match (&config.rpc.interface_id, &config.rpc.interface_version) {
                    (Some(id), Some(version)) => Some((id.clone(), version.clone())),
                    _ => None,
                },
            };

            let options = session_options(args, config)?;
            let session = client::open_session(gateway.as_ref(), &options).await?;
            let negotiator = Negotiator::new(Arc::clone(&gateway), session);
            let result = client::run_rpc(
                &negotiator,
                url,
                definition.as_deref().map(Path::new),
                declared.as_ref().map(|(id, v)| (id.as_str(), v.as_str())),
            )
            .await;
            client::close_session(gateway.as_ref(), session).await;

            match result {
                Ok(document) => {
                    println!("{}", document);
                    Ok(())
                }
                Err(RpcError::StructuredFailure(document)) => {
                    println!("{}", document);
                    Err(anyhow!("RPC invoke failed"))
                }
                Err(e) => Err(e).context("RPC invoke failed"),
            }
        }
        Command::Discover => {
            for device in gateway.list_local_devices().await? {
                println!("{}", device);
            }
            Ok(())
        }
        Command::Cert { action } => match action {
            CertCommand::Create => {
                let cert_name = cert_name(args, config)?;
                let password = password(args, config);
                let fingerprint =
                    client::create_certificate(gateway.as_ref(), &cert_name, &password)
                        .await
                        .with_context(|| {
                            format!("Failed to create self signed certificate {}", cert_name)
                        })?;
                println!("Created self signed cert with fingerprint [{}]", fingerprint);
                Ok(())
            }
            CertCommand::List => {
                for name in gateway
                    .list_certificates()
                    .await
                    .context("Failed to list certificates")?
                {
                    println!("{}", name);
                }
                Ok(())
            }
        },
        Command::Version => {
            println!("peerlink {}", peerlink::VERSION);
            println!("{}", gateway.version());
            Ok(())
        }
        Command::InitConfig => Ok(()),
    }
}

fn cert_name(args: &Args, config: &Config) -> Result<String> {
    args.cert_name
        .clone()
        .or_else(|| config.session.cert_name.clone())
        .ok_or_else(|| anyhow!("Missing cert-name parameter"))
}

fn password(args: &Args, config: &Config) -> String {
    args.password
        .clone()
        .unwrap_or_else(|| config.session.password.clone())
}

/// Collect session options from flags and config
fn session_options(args: &Args, config: &Config) -> Result<SessionOptions> {
    let psk_id = args.psk_id.clone().or_else(|| config.session.psk_id.clone());
    let psk = args.psk.clone().or_else(|| config.session.psk.clone());
    let psk = match (psk_id, psk) {
        (Some(id), Some(key)) => Some((
            PskId::from_hex(&id).context("Invalid PSK id")?,
            Psk::from_hex(&key).context("Invalid PSK")?,
        )),
        (None, None) => None,
        _ => bail!("PSK id and PSK must be given together"),
    };

    Ok(SessionOptions {
        cert_name: cert_name(args, config)?,
        password: password(args, config),
        basestation_auth_json: args
            .basestation_auth_json
            .clone()
            .or_else(|| config.session.basestation_auth_json.clone()),
        psk,
    })
}
