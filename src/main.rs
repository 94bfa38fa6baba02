use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{Config, LocalConfig};
use crate::interface::{Interface, Mode, FRAME_MAX};
use crate::state::Tunnel;

mod config;
mod dispatch;
mod filter;
mod interface;
mod link;
mod protocol;
mod routes;
mod state;
mod watcher;

/// multivpn: tunnels IP traffic over multiple parallel UDP uplinks,
/// spreading packets across them by per-link weight.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(default_value = "/etc/multivpn.cfg")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    run_daemon(&cli.config).await
}

async fn run_daemon(path: &Path) -> anyhow::Result<()> {
    // 1. Load config
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    info!(
        "starting with {} links, {} routes",
        config.links.len(),
        config.routes.len()
    );

    // 2. Bring up the tunnel interface
    let mode = Mode::select(&config.local.ip, config.local.tap);
    let iface = Interface::new(mode, config.local.mtu).context("creating tun/tap interface")?;
    let ifname = iface.name().context("reading interface name")?;
    info!("interface {} up ({:?} mode, mtu {})", ifname, mode, config.local.mtu);
    configure_interface(&ifname, &config.local, mode);

    // 3. Shared state
    let (mut tap_reader, tap_writer) = iface.split();
    let tap_writer = Arc::new(Mutex::new(tap_writer));
    let tunnel = Arc::new(Mutex::new(Tunnel::new(&config)));

    for link in &config.links {
        info!(
            "link {}: src {} port {} dst {:?} factor {}",
            link.name,
            link.src,
            link.srcport,
            link.configured_dst(),
            link.factor
        );
    }

    // 4. Timers and signals
    let mut second = tokio::time::interval(Duration::from_secs(1));
    let mut window = tokio::time::interval(Duration::from_secs(5));
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // 5. The event loop: tap frames out, ticks, shutdown
    let mut buf = BytesMut::with_capacity(FRAME_MAX);
    loop {
        tokio::select! {
            res = tap_reader.read_frame(&mut buf) => {
                match res {
                    Ok(0) => continue,
                    Ok(_) => {
                        let frame = buf.split().freeze();
                        let mut t = tunnel.lock().await;
                        t.dispatch_frame(&frame).await;
                        buf.reserve(FRAME_MAX);
                    }
                    Err(e) => {
                        error!("tun/tap read failed: {}", e);
                        break;
                    }
                }
            }
            _ = second.tick() => {
                watcher::tick(&tunnel, &tap_writer).await;
            }
            _ = window.tick() => {
                let transition = tunnel.lock().await.roll_window();
                if let Some(up) = transition {
                    if up {
                        info!("peer reachable, installing routes");
                    } else {
                        info!("peer unreachable, withdrawing routes");
                    }
                    for cmd in routes::transition_commands(&config.routes, up) {
                        run_shell_command(&cmd);
                    }
                }
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Withdraw routes if we leave with the tunnel up
    if tunnel.lock().await.up {
        for cmd in routes::transition_commands(&config.routes, false) {
            run_shell_command(&cmd);
        }
    }

    Ok(())
}

/// Address, point-to-point peer, bridge membership, MTU, and the MSS clamp
/// are all delegated to the host tools.
fn configure_interface(ifname: &str, local: &LocalConfig, mode: Mode) {
    match mode {
        Mode::Tun => match &local.dstip {
            Some(peer) => run_shell_command(&format!(
                "ip addr add {}/{} peer {} dev {}",
                local.ip, local.mask, peer, ifname
            )),
            None => run_shell_command(&format!(
                "ip addr add {}/{} dev {}",
                local.ip, local.mask, ifname
            )),
        },
        Mode::Tap => {
            if local.ip.parse::<Ipv4Addr>().is_ok() {
                run_shell_command(&format!(
                    "ip addr add {}/{} dev {}",
                    local.ip, local.mask, ifname
                ));
            } else {
                // a non-address ip field names the bridge to join
                run_shell_command(&format!("ip link set dev {} master {}", ifname, local.ip));
            }
        }
    }
    run_shell_command(&format!("ip link set dev {} up mtu {}", ifname, local.mtu));

    // keep forwarded TCP below the tunnel MTU
    let mss = local.mtu.saturating_sub(40);
    run_shell_command(&format!(
        "iptables -A FORWARD -o {} -p tcp --tcp-flags SYN,RST SYN \
         -m tcpmss --mss {}:65495 -j TCPMSS --clamp-mss-to-pmtu",
        ifname, mss
    ));
}

fn run_shell_command(cmd: &str) {
    debug!("sh: {}", cmd);
    match std::process::Command::new("sh").arg("-c").arg(cmd).status() {
        Ok(status) if !status.success() => warn!("command failed ({}): {}", status, cmd),
        Ok(_) => {}
        Err(e) => warn!("command could not start: {}: {}", cmd, e),
    }
}
