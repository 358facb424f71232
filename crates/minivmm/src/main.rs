//! `minivmm` — VM lifecycle CLI + daemon for QEMU/KVM guests.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tracing::info;

use minivmm::dhcp::DhcpServer;
use minivmm::exec::Exec;
use minivmm::forward::Proto;
use minivmm::vm::CreateParams;
use minivmm::{dhcp, network, Config, VmManager};

#[derive(Parser)]
#[command(
    name = "minivmm",
    about = "Lightweight multi-tenant VM manager for QEMU/KVM guests",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: guest network, DHCP responder, forwarder dataplane
    Serve,
    /// Create the network namespace, bridge, and veth pair
    InitNetwork,
    /// Tear the namespace and interfaces back down
    ResetNetwork,
    /// Create and start a new VM
    Create {
        name: String,
        #[arg(long, default_value = "")]
        owner: String,
        /// Base image name from the image library ("" = blank root disk)
        #[arg(long, default_value = "")]
        image: String,
        #[arg(long, default_value = "1")]
        cpu: String,
        #[arg(long, default_value = "1Gi")]
        memory: String,
        #[arg(long, default_value = "10Gi")]
        disk: String,
        /// Path to a cloud-init user-data file
        #[arg(long)]
        user_data_file: Option<String>,
        #[arg(long, default_value = "")]
        tag: String,
    },
    /// Start a stopped VM
    Start { name: String },
    /// Shut a VM down (powerdown, escalating to quit)
    Stop { name: String },
    /// Update CPU / memory / disk metadata; applied at next start
    Resize {
        name: String,
        #[arg(long)]
        cpu: Option<String>,
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        disk: Option<String>,
    },
    /// Protect a VM against destructive operations
    Lock { name: String },
    /// Lift the protection again
    Unlock { name: String },
    /// Manage extra volumes
    Volume {
        #[command(subcommand)]
        action: VolumeCommands,
    },
    /// Manage port forwarding rules
    Forward {
        #[command(subcommand)]
        action: ForwardCommands,
    },
    /// List all VMs with live status
    List,
    /// Show one VM as JSON
    Get { name: String },
    /// Stop and delete a VM, its tap, and its forwarding rules
    Remove { name: String },
    /// List the base image library
    Images,
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// Attach a new qcow2 volume
    Add { name: String, size: String },
    /// Detach and delete a volume
    Remove { name: String, volume: String },
}

#[derive(Subcommand)]
enum ForwardCommands {
    /// Expose a guest port on a host endpoint
    Add {
        vm: String,
        #[arg(long, default_value = "tcp")]
        proto: String,
        #[arg(long, default_value = "0.0.0.0")]
        listen_host: String,
        #[arg(long)]
        listen_port: u16,
        #[arg(long)]
        guest_port: u16,
    },
    /// Remove a rule by id
    Remove { id: String },
    /// List rules, optionally for one VM
    List {
        #[arg(long)]
        vm: Option<String>,
    },
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "OWNER")]
    owner: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "DISK")]
    disk: String,
    #[tabled(rename = "VNC")]
    vnc_port: String,
    #[tabled(rename = "TAG")]
    tag: String,
}

#[derive(Tabled)]
struct ForwardRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "PROTO")]
    proto: String,
    #[tabled(rename = "LISTEN")]
    listen: String,
    #[tabled(rename = "GUEST")]
    guest: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Arc::new(Config::from_env());
    let mgr = VmManager::new(cfg.clone(), Exec::host());

    match cli.command {
        Commands::Serve => serve(cfg, mgr).await?,
        Commands::InitNetwork => {
            mgr.network().init_netns().await?;
            mgr.network().start_network().await?;
        }
        Commands::ResetNetwork => mgr.network().reset_netns().await,
        Commands::Create {
            name,
            owner,
            image,
            cpu,
            memory,
            disk,
            user_data_file,
            tag,
        } => {
            let user_data = match user_data_file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("read user-data file {path}"))?,
                None => String::new(),
            };
            let meta = mgr
                .create(CreateParams {
                    name,
                    owner,
                    image,
                    cpu,
                    memory,
                    disk,
                    user_data,
                    tag,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Commands::Start { name } => {
            let meta = mgr.start(&name).await?;
            println!("VM '{}' started (VNC port {})", meta.name, meta.vnc_port);
        }
        Commands::Stop { name } => {
            mgr.stop(&name).await?;
            println!("VM '{name}' stopped");
        }
        Commands::Resize {
            name,
            cpu,
            memory,
            disk,
        } => {
            let meta = mgr
                .resize(&name, cpu.as_deref(), memory.as_deref(), disk.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Commands::Lock { name } => {
            mgr.lock(&name).await?;
            println!("VM '{name}' locked");
        }
        Commands::Unlock { name } => {
            mgr.unlock(&name).await?;
            println!("VM '{name}' unlocked");
        }
        Commands::Volume { action } => match action {
            VolumeCommands::Add { name, size } => {
                let meta = mgr.add_volume(&name, &size).await?;
                println!("{}", serde_json::to_string_pretty(&meta)?);
            }
            VolumeCommands::Remove { name, volume } => {
                mgr.remove_volume(&name, &volume).await?;
                println!("volume '{volume}' removed from VM '{name}'");
            }
        },
        Commands::Forward { action } => match action {
            ForwardCommands::Add {
                vm,
                proto,
                listen_host,
                listen_port,
                guest_port,
            } => {
                let proto: Proto = proto.parse()?;
                let rule = mgr
                    .forwarder()
                    .add(&vm, proto, &listen_host, listen_port, guest_port)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&rule)?);
            }
            ForwardCommands::Remove { id } => {
                mgr.forwarder().remove(&id).await?;
                println!("forward rule '{id}' removed");
            }
            ForwardCommands::List { vm } => {
                let rules = mgr.forwarder().list(vm.as_deref())?;
                let rows: Vec<ForwardRow> = rules
                    .into_iter()
                    .map(|r| ForwardRow {
                        id: r.id,
                        vm: r.vm_name,
                        proto: r.proto.to_string(),
                        listen: format!("{}:{}", r.listen_host, r.listen_port),
                        guest: format!("{}:{}", r.guest_ip, r.guest_port),
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
        },
        Commands::List => {
            let rows: Vec<VmRow> = mgr
                .list()
                .await?
                .into_iter()
                .map(|m| VmRow {
                    name: m.name,
                    status: m.status.to_string(),
                    owner: m.owner,
                    ip: m.ip_address,
                    cpu: m.cpu,
                    memory: m.memory,
                    disk: m.disk,
                    vnc_port: m.vnc_port,
                    tag: m.tag,
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        Commands::Get { name } => {
            let meta = mgr.get(&name).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Commands::Remove { name } => {
            mgr.remove(&name).await?;
            println!("VM '{name}' removed");
        }
        Commands::Images => {
            for image in mgr.images().list_base_images()? {
                println!("{image}");
            }
        }
    }

    Ok(())
}

/// Daemon mode: condition the host network, reconcile the forwarder, and
/// run the DHCP responder with its IP-update worker until interrupted.
async fn serve(cfg: Arc<Config>, mgr: Arc<VmManager>) -> Result<()> {
    mgr.network().init_netns().await?;
    mgr.network().start_network().await?;
    mgr.network().write_if_scripts()?;
    mgr.forwarder().reconcile().await?;

    let subnet = cfg
        .subnet
        .context("VMM_SUBNET_CIDR must be set to serve the guest network")?;

    let (updates_tx, updates_rx) = dhcp::update_channel();
    let responder = DhcpServer::bind(
        network::VETH_HOST,
        subnet,
        cfg.name_servers.clone(),
        cfg.lease_ttl,
        updates_tx,
    )
    .await?;
    tokio::spawn(responder.run());
    tokio::spawn(mgr.clone().ip_address_update_worker(updates_rx));

    if !cfg.agents.is_empty() {
        info!(agents = ?cfg.agents, "federation peers configured; proxied by the API layer");
    }
    info!(dir = %cfg.dir.display(), subnet = %subnet, "minivmm serving");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
