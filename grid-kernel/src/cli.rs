//! `grid` command line: argument parsing, foreground progress, terminal rendering.
//!
//! Long collections run on a background task that reports completion over a
//! `oneshot` channel. The foreground only draws a spinner and waits on that
//! channel or on ctrl-c. Interrupting drops the task (children are
//! `kill_on_drop`) and the cache connection is closed within [`CLOSE_GRACE`].

use crate::config::{config_path, load_config, write_default_config, GridConfig};
use crate::dns::ProviderRegistry;
use crate::http::{self, AppState};
use crate::models::{HostRecord, WorkloadRecord};
use crate::resolver::preferred_address;
use crate::sync::{FleetContext, FleetReport, HostListing, SyncMode};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Homelab inventory: Proxmox VMs, Docker containers and DNS records
#[derive(Parser, Debug)]
#[command(name = "grid", version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to $GRID_CONFIG, then ./grid.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List the Proxmox virtual machines
    Vms {
        /// Render a table with every VM, stopped ones included
        #[arg(short, long)]
        table: bool,
        /// Bypass the cache and refresh it from Proxmox
        #[arg(short, long)]
        sync: bool,
    },
    /// List Docker containers (local daemon by default)
    #[command(visible_alias = "cs")]
    Containers {
        /// Host name, IP or ssh:// / tcp:// address to inspect
        #[arg(short, long, conflicts_with = "all")]
        ssh: Option<String>,
        /// Every running VM of the fleet, cache first
        #[arg(short, long)]
        all: bool,
    },
    /// Serve the REST API
    Api {
        /// Listening port (overrides api.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the version
    Version,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigAction {
    /// Write a configuration file filled with defaults
    Init {
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Version => {
            println!("grid {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Config { action: ConfigAction::Init { force } } => {
            let path = config_path(cli.config.as_deref());
            write_default_config(&path, *force).await?;
            println!("config written to {}", path.display());
            return Ok(());
        }
        _ => {}
    }

    let cfg = load_config(cli.config.as_deref()).await.context("loading configuration")?;

    match cli.command {
        Command::Vms { table, sync } => vms(&cfg, table, sync).await,
        Command::Containers { ssh, all } => containers(&cfg, ssh, all).await,
        Command::Api { port } => api(&cfg, port).await,
        Command::Config { .. } | Command::Version => Ok(()),
    }
}

async fn vms(cfg: &GridConfig, table: bool, sync: bool) -> anyhow::Result<()> {
    let ctx = FleetContext::from_config(cfg).await.context("connecting fleet backends")?;
    let mode = if sync { SyncMode::Forced } else { SyncMode::OnDemand };

    let work = {
        let ctx = ctx.clone();
        async move { ctx.hosts(mode).await }
    };
    let listing = with_progress("Loading VMs", work, &ctx).await;
    close_store(&ctx).await;
    let listing = listing?;

    if sync {
        info!("{} VMs synced", listing.hosts.len());
    }
    let prefix = cfg.network.private_prefix.as_str();
    if table {
        print!("{}", vm_table(&listing, prefix, &cfg.proxmox.url));
    } else {
        print!("{}", vm_list(&listing.hosts, prefix));
    }
    Ok(())
}

async fn containers(cfg: &GridConfig, ssh: Option<String>, all: bool) -> anyhow::Result<()> {
    let ctx = FleetContext::from_config(cfg).await.context("connecting fleet backends")?;
    let now = OffsetDateTime::now_utc();

    let rendered = if all {
        let work = {
            let ctx = ctx.clone();
            async move { ctx.fleet(SyncMode::OnDemand).await }
        };
        with_progress("Loading containers", work, &ctx).await.map(|report| fleet_tables(&report, now))
    } else {
        let target = ssh.unwrap_or_default();
        let work = {
            let ctx = ctx.clone();
            async move { ctx.containers(&target).await }
        };
        with_progress("Loading containers", work, &ctx)
            .await
            .map(|(address, workloads)| format!("{address}\n{}", container_table(&workloads, now)))
    };
    close_store(&ctx).await;

    print!("{}", rendered?);
    Ok(())
}

async fn api(cfg: &GridConfig, port: Option<u16>) -> anyhow::Result<()> {
    let fleet = FleetContext::from_config(cfg).await.context("connecting fleet backends")?;
    let dns = ProviderRegistry::from_config(cfg).context("building dns providers")?;

    let host = cfg.api.host.parse().with_context(|| format!("invalid api.host {}", cfg.api.host))?;
    let addr = SocketAddr::new(host, port.unwrap_or(cfg.api.port));

    let served = http::serve(AppState::new(fleet.clone(), dns), addr, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
        }
    })
    .await;
    close_store(&fleet).await;
    served.with_context(|| format!("serving on {addr}"))
}

/// Runs `work` on a background task and draws a spinner until it reports back.
/// Ctrl-c aborts the task and returns an error.
pub async fn with_progress<T, F>(label: &str, work: F, ctx: &FleetContext) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: Future<Output = crate::error::GridResult<T>> + Send + 'static,
{
    let (done_tx, mut done_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let _ = done_tx.send(work.await);
    });

    let draw = std::io::stderr().is_terminal();
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut frame = 0usize;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let outcome = loop {
        tokio::select! {
            res = &mut done_rx => break res.context("collection task ended without a result"),
            _ = &mut interrupt => {
                task.abort();
                warn!("interrupted, closing {} cache", ctx.store().backend_name());
                break Err(anyhow::anyhow!("interrupted"));
            }
            _ = tick.tick() => {
                if draw {
                    eprint!("\r{} {label}... (ctrl-c to quit)", SPINNER[frame % SPINNER.len()]);
                    let _ = std::io::stderr().flush();
                    frame += 1;
                }
            }
        }
    };
    if draw {
        eprint!("\r\x1b[2K");
    }

    Ok(outcome??)
}

async fn close_store(ctx: &FleetContext) {
    if tokio::time::timeout(CLOSE_GRACE, ctx.close()).await.is_err() {
        warn!("cache close did not finish within {}s", CLOSE_GRACE.as_secs());
    }
}

/// Aligns columns on the widest cell; first row is the header
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let mut out = table_line(headers.iter().copied(), &widths);
    out.push_str(&table_line(rule.iter().map(String::as_str), &widths));
    for row in rows {
        out.push_str(&table_line(row.iter().map(String::as_str), &widths));
    }
    out
}

fn table_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .zip(widths)
        .map(|(c, w)| format!("{c}{}", " ".repeat(w.saturating_sub(c.chars().count()))))
        .collect();
    format!("{}\n", padded.join("  ").trim_end())
}

fn vm_row(host: &HostRecord, prefix: &str) -> Vec<String> {
    vec![
        host.name.clone(),
        preferred_address(&host.ip, prefix).unwrap_or("").to_string(),
        host.uptime.short(),
        if host.running { "running" } else { "stopped" }.to_string(),
    ]
}

/// Running VMs only, one per line
pub fn vm_list(hosts: &[HostRecord], prefix: &str) -> String {
    hosts
        .iter()
        .filter(|h| h.running)
        .map(|h| {
            let row = vm_row(h, prefix);
            format!("{}  {}  {}\n", row[0], row[1], row[2])
        })
        .collect()
}

pub fn vm_table(listing: &HostListing, prefix: &str, proxmox_url: &str) -> String {
    let rows: Vec<Vec<String>> = listing.hosts.iter().map(|h| vm_row(h, prefix)).collect();
    let running = listing.hosts.iter().filter(|h| h.running).count();
    let mut out = render_table(&["NAME", "IP", "UPTIME", "STATE"], &rows);
    out.push_str(&format!(
        "Proxmox {proxmox_url} | Total VMs: {} | Running VMs: {running} | source: {:?}{}\n",
        listing.hosts.len(),
        listing.source,
        if listing.degraded { " (cache unavailable)" } else { "" }
    ));
    out
}

pub fn container_table(workloads: &[WorkloadRecord], now: OffsetDateTime) -> String {
    let rows: Vec<Vec<String>> = workloads
        .iter()
        .map(|w| {
            vec![
                w.short_id().to_string(),
                w.display_name().to_string(),
                w.image.clone(),
                w.ports_label(),
                format!("{} days", w.age_days(now)),
            ]
        })
        .collect();
    render_table(&["ID", "NAME", "IMAGE", "PORTS", "AGE"], &rows)
}

fn fleet_tables(report: &FleetReport, now: OffsetDateTime) -> String {
    let mut out = String::new();
    for (key, workloads) in &report.entries {
        out.push_str(&format!("\n{} ({})\n", key.name, key.address));
        out.push_str(&container_table(workloads, now));
    }
    for (host, reason) in &report.failures {
        out.push_str(&format!("\n{host}: FAILED {reason}\n"));
    }
    out.push_str(&format!(
        "\n{} hosts, {} running, {} containers\n",
        report.totals.hosts, report.totals.running, report.totals.workloads
    ));
    out
}
