use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::interface::InterfaceWriter;
use crate::link::LinkEndpoint;
use crate::state::Tunnel;

/// A literal address stands for itself; anything else is an interface name
/// resolved to its current primary IPv4 address.
pub fn resolve_source(src: &str) -> Option<IpAddr> {
    if let Ok(ip) = src.parse::<IpAddr>() {
        return Some(ip);
    }
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifa in addrs {
        if ifa.interface_name != src {
            continue;
        }
        let Some(storage) = ifa.address else { continue };
        if let Some(sin) = storage.as_sockaddr_in() {
            return Some(IpAddr::V4(sin.ip()));
        }
    }
    None
}

/// The 1 Hz tick: re-resolve every link's source, rebuild endpoints whose
/// address moved (or whose bring-up failed last time), and announce on the
/// stable ones. Announcements ride the same tick so a link is either being
/// rebuilt or talking, never both.
pub async fn tick(tunnel: &Arc<Mutex<Tunnel>>, writer: &Arc<Mutex<InterfaceWriter>>) {
    let mut t = tunnel.lock().await;
    for idx in 0..t.links.len() {
        let src = t.links[idx].cfg.src.clone();
        let Some(ip) = resolve_source(&src) else {
            debug!("link {}: no address for {}", t.links[idx].cfg.name, src);
            continue;
        };

        if t.links[idx].curip != Some(ip) {
            if let Some(old) = t.links[idx].curip {
                info!("link {}: source {} -> {}", t.links[idx].cfg.name, old, ip);
            }
            // the old socket must be fully closed before the successor
            // binds the same pair
            if let Some(endpoint) = t.links[idx].endpoint.take() {
                endpoint.terminate().await;
            }
            t.links[idx].curip = Some(ip);
            rebuild(&mut t, idx, ip, tunnel, writer).await;
        } else if t.links[idx].endpoint.is_none() {
            rebuild(&mut t, idx, ip, tunnel, writer).await;
        } else if t.links[idx].lastdst.is_some() {
            t.announce_on(idx).await;
        }
    }
}

async fn rebuild(
    t: &mut Tunnel,
    idx: usize,
    ip: IpAddr,
    tunnel: &Arc<Mutex<Tunnel>>,
    writer: &Arc<Mutex<InterfaceWriter>>,
) {
    let cfg = &t.links[idx].cfg;
    let connect_to = if cfg.bind { cfg.configured_dst() } else { None };
    match LinkEndpoint::start(
        idx,
        &cfg.name,
        ip,
        cfg.srcport,
        connect_to,
        cfg.reuse,
        tunnel.clone(),
        writer.clone(),
    )
    .await
    {
        Ok(endpoint) => {
            info!("link {} up on {}:{}", cfg.name, ip, cfg.srcport);
            t.links[idx].endpoint = Some(endpoint);
        }
        Err(e) => {
            // left absent; the next tick tries again
            warn!("link {}: bind {}:{} failed: {}", cfg.name, ip, cfg.srcport, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_source_resolves_to_itself() {
        assert_eq!(
            resolve_source("10.0.0.2"),
            Some("10.0.0.2".parse().unwrap())
        );
    }

    #[test]
    fn test_unknown_interface_resolves_to_nothing() {
        assert_eq!(resolve_source("definitely-not-a-nic0"), None);
    }
}
