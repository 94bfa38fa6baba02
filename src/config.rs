use std::net::Ipv4Addr;
use std::path::Path;

/// One `link` record: a named UDP path with a fixed local source and weight.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub name: String,
    /// Interface name or literal local address.
    pub src: String,
    pub srcport: u16,
    pub dstip: Option<Ipv4Addr>,
    pub dstport: Option<u16>,
    /// Positive dispatch weight.
    pub factor: f64,
    pub bind: bool,
    pub reuse: bool,
}

impl LinkConfig {
    /// Both halves configured, or nothing (reply-only link).
    pub fn configured_dst(&self) -> Option<std::net::SocketAddr> {
        match (self.dstip, self.dstport) {
            (Some(ip), Some(port)) => Some(std::net::SocketAddr::from((ip, port))),
            _ => None,
        }
    }
}

/// The `local` record: tunnel interface parameters and global toggles.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Dotted-quad address for TUN mode, or a bridge name for TAP mode.
    pub ip: String,
    pub mask: u8,
    pub mtu: u16,
    /// Point-to-point peer address.
    pub dstip: Option<Ipv4Addr>,
    /// Force layer-2 mode even when `ip` parses as an address.
    pub tap: bool,
    /// Links are dispatch-eligible only while announced by the peer.
    pub dead_peer_detection: bool,
    /// Pre-validate announcements before trusting the SES: prefix.
    pub strict_announce: bool,
    pub filters: FilterConfig,
}

/// One `route` record installed through the tunnel while it is up.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub to: String,
    pub mask: String,
    pub gw: String,
    pub table: Option<String>,
    pub metric: Option<String>,
}

/// Obfuscation stages. All off unless requested on the `local` line.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub prefix: Option<Vec<u8>>,
    pub rotate: bool,
    pub base64: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub links: Vec<LinkConfig>,
    pub local: LocalConfig,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("no local record")]
    MissingLocal,
}

fn syntax(line: usize, msg: impl Into<String>) -> ConfigError {
    ConfigError::Syntax {
        line,
        msg: msg.into(),
    }
}

/// Empty tab field means "absent".
fn field(fields: &[&str], idx: usize) -> Option<String> {
    fields
        .get(idx)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn tokens(bag: &str) -> impl Iterator<Item = &str> {
    bag.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut links: Vec<LinkConfig> = Vec::new();
        let mut local = None;
        let mut routes = Vec::new();

        for (no, raw) in content.lines().enumerate() {
            let no = no + 1;
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            match fields[0].trim().to_ascii_lowercase().as_str() {
                "link" => {
                    let link = parse_link(no, &fields[1..])?;
                    if links.iter().any(|l| l.name == link.name) {
                        return Err(syntax(no, format!("duplicate link name '{}'", link.name)));
                    }
                    links.push(link);
                }
                "local" => {
                    if local.is_some() {
                        return Err(syntax(no, "duplicate local record"));
                    }
                    local = Some(parse_local(no, &fields[1..])?);
                }
                "route" => routes.push(parse_route(no, &fields[1..])?),
                other => return Err(syntax(no, format!("unknown record kind '{}'", other))),
            }
        }

        Ok(Config {
            links,
            local: local.ok_or(ConfigError::MissingLocal)?,
            routes,
        })
    }
}

fn parse_link(no: usize, f: &[&str]) -> Result<LinkConfig, ConfigError> {
    let name = field(f, 0).ok_or_else(|| syntax(no, "link: missing name"))?;
    let src = field(f, 1).ok_or_else(|| syntax(no, "link: missing src"))?;
    let srcport = field(f, 2)
        .ok_or_else(|| syntax(no, "link: missing srcport"))?
        .parse::<u16>()
        .map_err(|_| syntax(no, "link: bad srcport"))?;
    let dstip = match field(f, 3) {
        Some(s) => Some(
            s.parse::<Ipv4Addr>()
                .map_err(|_| syntax(no, "link: bad dstip"))?,
        ),
        None => None,
    };
    let dstport = match field(f, 4) {
        Some(s) => Some(
            s.parse::<u16>()
                .map_err(|_| syntax(no, "link: bad dstport"))?,
        ),
        None => None,
    };
    let factor = field(f, 5)
        .ok_or_else(|| syntax(no, "link: missing factor"))?
        .parse::<f64>()
        .map_err(|_| syntax(no, "link: bad factor"))?;
    if !factor.is_finite() || factor <= 0.0 {
        return Err(syntax(no, "link: factor must be positive"));
    }

    let mut bind = false;
    let mut reuse = false;
    if let Some(bag) = field(f, 6) {
        for t in tokens(&bag) {
            match t.to_ascii_lowercase().as_str() {
                "bind" => bind = true,
                "reuse" => reuse = true,
                _ => {}
            }
        }
    }

    Ok(LinkConfig {
        name,
        src,
        srcport,
        dstip,
        dstport,
        factor,
        bind,
        reuse,
    })
}

fn parse_local(no: usize, f: &[&str]) -> Result<LocalConfig, ConfigError> {
    let ip = field(f, 0).ok_or_else(|| syntax(no, "local: missing ip"))?;
    let mask = match field(f, 1) {
        Some(s) => s.parse::<u8>().map_err(|_| syntax(no, "local: bad mask"))?,
        None => 24,
    };
    let mtu = match field(f, 2) {
        Some(s) => s.parse::<u16>().map_err(|_| syntax(no, "local: bad mtu"))?,
        None => 1300,
    };
    let dstip = match field(f, 3) {
        Some(s) => Some(
            s.parse::<Ipv4Addr>()
                .map_err(|_| syntax(no, "local: bad dstip"))?,
        ),
        None => None,
    };

    let mut tap = false;
    let mut dead_peer_detection = true;
    let mut strict_announce = false;
    let mut filters = FilterConfig::default();
    if let Some(bag) = field(f, 4) {
        for t in tokens(&bag) {
            match t.to_ascii_lowercase().as_str() {
                "tap" => tap = true,
                "nodpd" => dead_peer_detection = false,
                "strict" => strict_announce = true,
                "base64" => filters.base64 = true,
                "rotate" => filters.rotate = true,
                lower => {
                    // prefix=<bytes> keeps the value verbatim
                    if lower.starts_with("prefix=") {
                        filters.prefix = Some(t["prefix=".len()..].as_bytes().to_vec());
                    }
                }
            }
        }
    }

    Ok(LocalConfig {
        ip,
        mask,
        mtu,
        dstip,
        tap,
        dead_peer_detection,
        strict_announce,
        filters,
    })
}

fn parse_route(no: usize, f: &[&str]) -> Result<RouteConfig, ConfigError> {
    Ok(RouteConfig {
        to: field(f, 0).ok_or_else(|| syntax(no, "route: missing to"))?,
        mask: field(f, 1).ok_or_else(|| syntax(no, "route: missing mask"))?,
        gw: field(f, 2).ok_or_else(|| syntax(no, "route: missing gw"))?,
        table: field(f, 3),
        metric: field(f, 4),
    })
}
