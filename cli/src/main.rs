use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use futures_util::StreamExt;
use igdmap::AddMappingOptions;
use igdmap::DeleteMappingOptions;
use igdmap::Gateway;
use igdmap::GatewayDiscovery;
use igdmap::GatewayDiscoveryOptions;
use igdmap::Protocol;
use igdmap::ReqwestHttpClient;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Discover => discover(cli.timeout).await?,
        Command::List => list(&first_gateway(cli.timeout).await?).await?,
        Command::ExternalIp => {
            let ip = first_gateway(cli.timeout).await?.get_external_ip().await?;
            println!("{}", ip);
        }
        Command::Add {
            internal_port,
            external_port,
            mapping,
            no_port_scan,
        } => {
            let options = AddMappingOptions {
                protocol: mapping.protocol,
                description: mapping.description,
                ttl: mapping.ttl,
                port_scan: !no_port_scan,
                ..Default::default()
            };
            first_gateway(cli.timeout)
                .await?
                .add_mapping(internal_port, external_port, options)
                .await
                .context("Failed to add the port mapping")?;
        }
        Command::Delete {
            internal_port,
            external_port,
            protocol,
        } => {
            let options = DeleteMappingOptions {
                protocol,
                ..Default::default()
            };
            first_gateway(cli.timeout)
                .await?
                .delete_mapping(internal_port, external_port, options)
                .await
                .context("Failed to delete the port mapping")?;
        }
        Command::Demo { port, mapping } => {
            demo(&first_gateway(cli.timeout).await?, port, mapping).await?
        }
    };
    Ok(())
}

#[derive(Parser)]
struct Cli {
    /// Seconds to wait for gateways to answer.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists every gateway answering within the timeout.
    Discover,

    /// Prints the port mapping table of the first gateway.
    List,

    ExternalIp,

    Add {
        internal_port: u16,
        external_port: u16,

        #[command(flatten)]
        mapping: MappingArgs,

        /// Skips checking that the internal port accepts connections.
        #[arg(long)]
        no_port_scan: bool,
    },

    Delete {
        internal_port: u16,
        external_port: u16,

        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
    },

    /// Maps `port` to itself, printing the table before and after, then removes the mapping.
    Demo {
        port: u16,

        #[command(flatten)]
        mapping: MappingArgs,
    },
}

#[derive(Args)]
struct MappingArgs {
    #[arg(long, default_value = "tcp")]
    protocol: Protocol,

    #[arg(long, default_value = igdmap::mapping::DEFAULT_MAPPING_DESCRIPTION)]
    description: String,

    /// Lease duration in seconds.
    #[arg(long, default_value_t = igdmap::mapping::DEFAULT_MAPPING_TTL)]
    ttl: u32,
}

fn discovery_options(timeout: u64) -> GatewayDiscoveryOptions {
    GatewayDiscoveryOptions {
        timeout: Some(Duration::from_secs(timeout)),
        ..Default::default()
    }
}

async fn start_discovery(timeout: u64) -> anyhow::Result<GatewayDiscovery> {
    GatewayDiscovery::start(
        discovery_options(timeout),
        Arc::new(ReqwestHttpClient::default()),
    )
    .await
    .context("Failed to start gateway discovery")
}

async fn first_gateway(timeout: u64) -> anyhow::Result<Gateway> {
    let mut session = start_discovery(timeout).await?;
    let gateway = session
        .next_gateway()
        .await
        .ok_or_else(|| anyhow::anyhow!("No gateway found within {} seconds", timeout))?;
    session.close();
    log::info!("Using gateway {}", gateway.url());
    Ok(gateway)
}

async fn discover(timeout: u64) -> anyhow::Result<()> {
    let gateways = start_discovery(timeout).await?.gateways();
    let mut gateways = std::pin::pin!(gateways);
    while let Some(gateway) = gateways.next().await {
        let external_ip = match gateway.get_external_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                log::warn!("Failed to get the external IP of {}: {}", gateway.url(), e);
                "unknown".into()
            }
        };
        println!(
            "{} via {} ({}) external IP {}",
            gateway.url(),
            gateway.interface().name,
            gateway.service_type(),
            external_ip
        );
    }
    Ok(())
}

async fn list(gateway: &Gateway) -> anyhow::Result<()> {
    let mappings = gateway.get_mappings().await;
    println!("{}", serde_json::to_string_pretty(&mappings)?);
    Ok(())
}

async fn demo(gateway: &Gateway, port: u16, mapping: MappingArgs) -> anyhow::Result<()> {
    // Something has to listen on the port for the reachability check to pass.
    let _listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to listen on port {}", port))?;
    println!("External IP: {}", gateway.get_external_ip().await?);
    list(gateway).await?;

    let protocol = mapping.protocol;
    let options = AddMappingOptions {
        protocol,
        description: mapping.description,
        ttl: mapping.ttl,
        ..Default::default()
    };
    gateway
        .add_mapping(port, port, options)
        .await
        .context("Failed to add the port mapping")?;
    list(gateway).await?;

    let options = DeleteMappingOptions {
        protocol,
        ..Default::default()
    };
    gateway
        .delete_mapping(port, port, options)
        .await
        .context("Failed to delete the port mapping")?;
    list(gateway).await
}
