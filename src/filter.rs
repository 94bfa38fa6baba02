use base64::prelude::*;

use crate::config::FilterConfig;

/// Obfuscation stages applied to every datagram, control and data alike.
/// Outbound order is base64 -> rotate -> prepend; inbound is the exact
/// reverse, so the `SES:` classification happens only after the prefix has
/// been stripped. These stages hide nothing from an observer who knows the
/// scheme; they are not encryption.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    prefix: Option<Vec<u8>>,
    rotate: bool,
    base64: bool,
}

/// Rotation touches at most this many leading bytes.
const ROTATE_SPAN: usize = 200;
const ROTATE_OUT: u8 = 127;
const ROTATE_IN: u8 = 129; // 127 + 129 == 256

impl FilterChain {
    pub fn new(cfg: &FilterConfig) -> Self {
        Self {
            prefix: cfg.prefix.clone(),
            rotate: cfg.rotate,
            base64: cfg.base64,
        }
    }

    pub fn outbound(&self, data: &[u8]) -> Vec<u8> {
        let mut out = if self.base64 {
            BASE64_STANDARD.encode(data).into_bytes()
        } else {
            data.to_vec()
        };
        if self.rotate {
            rotate(&mut out, ROTATE_OUT);
        }
        if let Some(pfx) = &self.prefix {
            let mut framed = Vec::with_capacity(pfx.len() + out.len());
            framed.extend_from_slice(pfx);
            framed.extend_from_slice(&out);
            out = framed;
        }
        out
    }

    /// Undoes `outbound`. Returns `None` when base64 decoding fails, in
    /// which case the datagram is dropped.
    pub fn inbound(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut data = match &self.prefix {
            // the prefix is stripped blind, never verified
            Some(pfx) => data.get(pfx.len()..).unwrap_or(&[]).to_vec(),
            None => data.to_vec(),
        };
        if self.rotate {
            rotate(&mut data, ROTATE_IN);
        }
        if self.base64 {
            BASE64_STANDARD.decode(&data).ok()
        } else {
            Some(data)
        }
    }
}

fn rotate(data: &mut [u8], delta: u8) {
    let span = data.len().min(ROTATE_SPAN);
    for b in &mut data[..span] {
        *b = b.wrapping_add(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(prefix: Option<&[u8]>, rotate: bool, base64: bool) -> FilterChain {
        FilterChain::new(&FilterConfig {
            prefix: prefix.map(|p| p.to_vec()),
            rotate,
            base64,
        })
    }

    #[test]
    fn test_rotate_inverts_for_every_byte() {
        for b in 0u8..=255 {
            assert_eq!(b.wrapping_add(ROTATE_OUT).wrapping_add(ROTATE_IN), b);
        }
    }

    #[test]
    fn test_round_trip_all_stage_subsets() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1337).collect();
        for pfx in [None, Some(b"GET ".as_ref())] {
            for rot in [false, true] {
                for b64 in [false, true] {
                    let f = chain(pfx, rot, b64);
                    let wire = f.outbound(&payload);
                    assert_eq!(f.inbound(&wire).unwrap(), payload);
                }
            }
        }
    }

    #[test]
    fn test_default_chain_is_identity() {
        let f = FilterChain::default();
        let payload = b"\x45\x00\x00\x64raw ip packet";
        assert_eq!(f.outbound(payload), payload);
        assert_eq!(f.inbound(payload).unwrap(), payload);
    }

    #[test]
    fn test_rotate_touches_only_first_200_bytes() {
        let f = chain(None, true, false);
        let payload = vec![0u8; 300];
        let wire = f.outbound(&payload);
        assert!(wire[..200].iter().all(|&b| b == ROTATE_OUT));
        assert!(wire[200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_datagram_rotates_whole_payload() {
        let f = chain(None, true, false);
        let wire = f.outbound(&[1, 2, 3]);
        assert_eq!(wire, vec![128, 129, 130]);
        assert_eq!(f.inbound(&wire).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_prefix_is_stripped_blind() {
        let f = chain(Some(b"XX"), false, false);
        // inbound never checks that the prefix actually matches
        assert_eq!(f.inbound(b"ZZhello").unwrap(), b"hello");
        // shorter than the prefix: nothing left
        assert_eq!(f.inbound(b"Z").unwrap(), b"");
    }

    #[test]
    fn test_bad_base64_drops_datagram() {
        let f = chain(None, false, true);
        assert!(f.inbound(b"!!! not base64 !!!").is_none());
    }

    #[test]
    fn test_outbound_order_prefix_is_outermost() {
        let f = chain(Some(b"P"), true, true);
        let wire = f.outbound(b"x");
        assert_eq!(wire[0], b'P');
        // the byte after the prefix is rotated base64, not raw base64
        let encoded = BASE64_STANDARD.encode(b"x").into_bytes();
        assert_eq!(wire[1], encoded[0].wrapping_add(ROTATE_OUT));
    }
}
