//! smc command - SMC socket subsystem diagnostics.

use clap::{Parser, Subcommand};
use smcdiag::netlink::DiagConnection;
use smcdiag::netlink::genl::GenlConnection;
use smcdiag::smc::dev::{DevicePort, fetch_devices};
use smcdiag::smc::diag::{DiagFilter, fetch_link_groups};
use smcdiag::smc::stats::{CounterSnapshot, Technology, fetch_counters};
use smcdiag::smc::{fetch_sys_info, resolve_family};
use smcdiag::stats::{CounterStore, StatsMode};

#[derive(Parser)]
#[command(name = "smc", version, about = "SMC diagnostics tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show statistics counters.
    #[command(visible_alias = "s")]
    Stats {
        /// Query the SMC-D technology instead of SMC-R.
        #[arg(long)]
        smcd: bool,

        /// Reset the baseline after displaying the current deltas.
        #[arg(long, conflicts_with = "absolute")]
        reset: bool,

        /// Show raw kernel counters, bypassing the baseline cache.
        #[arg(long)]
        absolute: bool,
    },

    /// Show kernel SMC implementation properties.
    #[command(visible_alias = "i")]
    Info,

    /// Show SMC-capable devices.
    #[command(visible_alias = "d")]
    Device {
        /// Query the SMC-D technology instead of SMC-R.
        #[arg(long)]
        smcd: bool,
    },

    /// Show link groups.
    #[command(visible_alias = "lg")]
    Linkgroup {
        /// Query the SMC-D technology instead of SMC-R.
        #[arg(long)]
        smcd: bool,

        /// Restrict to one link group id (hex).
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Stats {
            smcd,
            reset,
            absolute,
        } => {
            let tech = if smcd { Technology::SmcD } else { Technology::SmcR };
            let mode = if absolute {
                StatsMode::Absolute
            } else {
                StatsMode::Delta { reset }
            };

            let conn = GenlConnection::new()?;
            let family = resolve_family(&conn).await?;
            let sample = fetch_counters(&conn, &family, tech).await?;

            let store = CounterStore::for_user(tech);
            let result = store.reconcile_or_absolute(&sample, mode);
            print_counters(&result.delta);
        }
        Command::Info => {
            let conn = GenlConnection::new()?;
            let family = resolve_family(&conn).await?;
            let info = fetch_sys_info(&conn, &family).await?;

            println!("{:<18}{}.{}", "Kernel release", info.version, info.release);
            println!("{:<18}{}", "SMC-D v2", if info.ism_v2 { "yes" } else { "no" });
            println!("{:<18}{}", "SMC-R v2", if info.smcr_v2 { "yes" } else { "no" });
            println!("{:<18}{}", "Hostname", info.local_host);
            println!("{:<18}{}", "SEID", info.seid);
        }
        Command::Device { smcd } => {
            let tech = if smcd { Technology::SmcD } else { Technology::SmcR };
            let conn = GenlConnection::new()?;
            let family = resolve_family(&conn).await?;
            let devices = fetch_devices(&conn, &family, tech).await?;

            match tech {
                Technology::SmcD => {
                    println!(
                        "{:<5} {:<14} {:<6} {:<5} {:>5} {:<16}",
                        "FID", "PCI-ID", "PCHID", "Crit", "#LGs", "PNET-ID"
                    );
                    for d in devices {
                        println!(
                            "{:04x}  {:<14} {:04x}   {:<5} {:>5} {:<16}",
                            d.pci_fid,
                            d.pci_id,
                            d.pci_chid,
                            yes_no(d.critical),
                            d.use_count,
                            d.ports.first().map(pnet_label).unwrap_or_default()
                        );
                    }
                }
                Technology::SmcR => {
                    println!(
                        "{:<15} {:<8} {:>4} {:<8} {:<5} {:>6} {:<16}",
                        "Net-Dev", "IB-Dev", "IB-P", "IB-State", "Crit", "#Links", "PNET-ID"
                    );
                    for d in devices {
                        for (idx, p) in d.ports.iter().enumerate() {
                            if !p.valid {
                                continue;
                            }
                            println!(
                                "{:<15} {:<8} {:>4} {:<8} {:<5} {:>6} {:<16}",
                                p.netdev,
                                d.ib_name,
                                idx + 1,
                                port_state(p.state),
                                yes_no(d.critical),
                                p.link_count,
                                pnet_label(p)
                            );
                        }
                    }
                }
            }
        }
        Command::Linkgroup { smcd, id } => {
            let tech = if smcd { Technology::SmcD } else { Technology::SmcR };
            let filter = match id {
                Some(raw) => DiagFilter::LinkGroupId(u32::from_str_radix(&raw, 16)?),
                None => DiagFilter::None,
            };

            let conn = DiagConnection::new()?;
            let groups = fetch_link_groups(&conn, tech, filter).await?;

            println!(
                "{:<10} {:>5} {:>5} {:>6} {:<16}",
                "LG-ID", "Role", "VLAN", "#Conns", "PNET-ID"
            );
            for g in groups {
                println!(
                    "{:08x}   {:>5} {:>5} {:>6} {:<16}",
                    g.id,
                    if g.role == 0 { "CLNT" } else { "SERV" },
                    g.vlan_id,
                    g.conns,
                    g.pnet_id
                );
            }
        }
    }

    Ok(())
}

fn yes_no(v: bool) -> &'static str {
    if v { "Yes" } else { "No" }
}

fn port_state(state: u8) -> String {
    match state {
        0 => "INACTIVE".into(),
        1 => "ACTIVE".into(),
        other => format!("{:#x}?", other),
    }
}

/// A user-assigned PNET id is marked with a leading asterisk.
fn pnet_label(port: &DevicePort) -> String {
    if port.pnet_id_by_user {
        format!("*{}", port.pnet_id)
    } else {
        port.pnet_id.clone()
    }
}

fn print_counters(snap: &CounterSnapshot) {
    println!("{} counters", snap.tech);
    for (key, value) in &snap.scalars {
        println!("  {:<24} {}", key, value);
    }
    if !snap.fallback.is_empty() {
        println!("fallback reasons");
        for entry in &snap.fallback {
            println!(
                "  {:<6} {:#010x} {:>8}",
                if entry.server { "server" } else { "client" },
                entry.reason,
                entry.count
            );
        }
    }
}
