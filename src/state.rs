use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::config::{Config, LinkConfig};
use crate::dispatch::{self, Candidate};
use crate::filter::FilterChain;
use crate::link::LinkEndpoint;
use crate::protocol::Announcement;

/// Mutable per-link state. The config part never changes after load; the
/// endpoint slot is owned by the address watcher.
pub struct LinkState {
    pub cfg: LinkConfig,
    /// Last resolved source address.
    pub curip: Option<IpAddr>,
    /// Peer address last observed on this link's socket; seeded from the
    /// configured destination, overwritten by every received datagram.
    pub lastdst: Option<SocketAddr>,
    /// True while the peer's latest announcement named this link.
    pub active: bool,
    /// Dispatch accumulator; grows by 1/factor, never shrinks except for
    /// the rescale fold.
    pub tried: f64,
    pub endpoint: Option<LinkEndpoint>,
}

impl LinkState {
    pub fn new(cfg: LinkConfig) -> Self {
        let lastdst = cfg.configured_dst();
        Self {
            cfg,
            curip: None,
            lastdst,
            active: false,
            tried: 0.0,
            endpoint: None,
        }
    }

    pub fn eligible(&self, dead_peer_detection: bool) -> bool {
        self.endpoint.is_some()
            && (self.active || !dead_peer_detection)
            && self.lastdst.is_some()
    }
}

/// Everything the event loop mutates: the link table, the liveness window,
/// and the route-installation flag.
pub struct Tunnel {
    pub links: Vec<LinkState>,
    /// Per-link count of peer-announced links received in the current
    /// 5 s window, keyed by our link name.
    pub seen: HashMap<String, u64>,
    /// Snapshot of `seen` from the previous window.
    pub lastseen: HashMap<String, u64>,
    /// Whether tunnel routes are currently installed.
    pub up: bool,
    pub dead_peer_detection: bool,
    pub strict_announce: bool,
    pub filters: FilterChain,
}

impl Tunnel {
    pub fn new(config: &Config) -> Self {
        Self {
            links: config.links.iter().cloned().map(LinkState::new).collect(),
            seen: HashMap::new(),
            lastseen: HashMap::new(),
            up: false,
            dead_peer_detection: config.local.dead_peer_detection,
            strict_announce: config.local.strict_announce,
            filters: FilterChain::new(&config.local.filters),
        }
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.links.iter().any(|l| l.cfg.name == name)
    }

    /// Peer announcement received on some link: learn the reply address,
    /// refresh every link's active flag, account the sighting.
    pub fn apply_announcement(&mut self, ann: &Announcement, from: SocketAddr) {
        let Some(link) = self.links.iter_mut().find(|l| l.cfg.name == ann.link) else {
            debug!("announcement for unknown link '{}'", ann.link);
            return;
        };
        link.lastdst = Some(from);

        for l in &mut self.links {
            l.active = ann.peers.iter().any(|p| p == &l.cfg.name);
        }

        // entry exists even for an empty list, so the link shows up in the
        // next window's announcements with a zero count
        *self.seen.entry(ann.link.clone()).or_insert(0) += ann.peers.len() as u64;
    }

    /// Key set of the last window, the payload of our own announcements.
    pub fn lastseen_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lastseen.keys().cloned().collect();
        names.sort();
        names
    }

    /// 5 s window roll. Returns `Some(new_up)` only when reachability
    /// flipped, so route transitions stay edge-triggered.
    pub fn roll_window(&mut self) -> Option<bool> {
        self.lastseen = std::mem::take(&mut self.seen);
        let reachable = self.lastseen.values().any(|&n| n > 0);
        if reachable != self.up {
            self.up = reachable;
            Some(reachable)
        } else {
            None
        }
    }

    /// Weighted pick for one outbound frame. `None` means the frame is
    /// dropped silently.
    pub fn select_link(&mut self) -> Option<usize> {
        let min = self
            .links
            .iter()
            .map(|l| l.tried)
            .fold(f64::INFINITY, f64::min);
        if min.is_finite() && min > dispatch::RESCALE_THRESHOLD {
            for l in &mut self.links {
                l.tried -= min;
            }
        }

        let dpd = self.dead_peer_detection;
        let mut cands: Vec<Candidate> = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.endpoint.is_some())
            .map(|(idx, l)| Candidate {
                idx,
                tried: l.tried,
                factor: l.cfg.factor,
                eligible: l.eligible(dpd),
            })
            .collect();
        let picked = dispatch::select(&mut cands);
        for c in &cands {
            self.links[c.idx].tried = c.tried;
        }
        picked
    }

    /// One frame from the kernel to the peer.
    pub async fn dispatch_frame(&mut self, frame: &[u8]) {
        if let Some(idx) = self.select_link() {
            self.send_on(idx, frame).await;
        }
    }

    /// Outbound path shared by data and announcements: filter, resolve the
    /// destination, send once. A failed send costs one marker character and
    /// the packet.
    pub async fn send_on(&self, idx: usize, payload: &[u8]) {
        let link = &self.links[idx];
        let (Some(endpoint), Some(dst)) = (&link.endpoint, link.lastdst) else {
            return;
        };
        let wire = self.filters.outbound(payload);
        if let Err(e) = endpoint.send(&wire, dst).await {
            eprint!("X");
            debug!("send on {} failed: {}", link.cfg.name, e);
        }
    }

    /// Session announcement for one link, through the same send path as
    /// data.
    pub async fn announce_on(&self, idx: usize) {
        let ann = Announcement {
            link: self.links[idx].cfg.name.clone(),
            peers: self.lastseen_names(),
        };
        self.send_on(idx, &ann.encode()).await;
    }
}
