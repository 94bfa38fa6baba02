use thiserror::Error;

/// Session announcements share the UDP path with tunneled frames and are
/// told apart by this prefix, inspected after the inbound filter chain.
///
/// Wire form (ASCII, one datagram, no length prefix):
///
/// ```text
/// SES:<sender-link>:<link1>,<link2>,...,<linkN>
/// ```
///
/// `<sender-link>` is the sender's own name for the path the datagram went
/// out on. The list names the sender's links that saw traffic from us in
/// its current window; it may be empty.
pub const TAG: &[u8] = b"SES:";

/// Upper bound accepted by the strict pre-validator.
const MAX_ANNOUNCE: usize = 512;

#[derive(Error, Debug)]
pub enum AnnounceError {
    #[error("not an announcement")]
    MissingTag,
    #[error("malformed announcement")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Sender's label for the link this was received on.
    pub link: String,
    /// Names of our links the sender currently hears from.
    pub peers: Vec<String>,
}

impl Announcement {
    pub fn encode(&self) -> Vec<u8> {
        format!("SES:{}:{}", self.link, self.peers.join(",")).into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, AnnounceError> {
        let rest = raw.strip_prefix(TAG).ok_or(AnnounceError::MissingTag)?;
        let rest = std::str::from_utf8(rest).map_err(|_| AnnounceError::Malformed)?;
        let (link, list) = rest.split_once(':').ok_or(AnnounceError::Malformed)?;
        if link.is_empty() {
            return Err(AnnounceError::Malformed);
        }
        let peers = list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        Ok(Self {
            link: link.to_string(),
            peers,
        })
    }
}

pub fn is_announcement(raw: &[u8]) -> bool {
    raw.starts_with(TAG)
}

/// Guard against a data frame whose first post-filter bytes happen to spell
/// `SES:`. Off by default for compatibility with the unconditioned prefix
/// match; the caller additionally checks the named link is configured.
pub fn prevalidate(raw: &[u8]) -> bool {
    raw.len() <= MAX_ANNOUNCE && raw.iter().all(|b| b.is_ascii() && !b.is_ascii_control())
}
