use std::cmp::Ordering;

/// Once every counter has grown past this, the minimum is folded back out.
/// Only differences between counters matter to selection.
pub const RESCALE_THRESHOLD: f64 = (1u64 << 40) as f64;

/// One link as the selector sees it. `idx` points back into the link table.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub idx: usize,
    pub tried: f64,
    pub factor: f64,
    pub eligible: bool,
}

/// Weighted per-packet selection over the endpoint table.
///
/// Candidates are scanned in ascending `tried` order. The first one with a
/// positive factor is charged `1/factor` before eligibility is consulted,
/// so a skipped head-of-line link still pays for the scan. The frame goes
/// to the first eligible candidate, or nowhere.
pub fn select(cands: &mut [Candidate]) -> Option<usize> {
    if cands.is_empty() {
        return None;
    }
    cands.sort_by(|a, b| a.tried.partial_cmp(&b.tried).unwrap_or(Ordering::Equal));

    if let Some(head) = cands.iter_mut().find(|c| c.factor > 0.0) {
        head.tried += 1.0 / head.factor;
    }

    cands.iter().find(|c| c.eligible).map(|c| c.idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(idx: usize, tried: f64, factor: f64, eligible: bool) -> Candidate {
        Candidate {
            idx,
            tried,
            factor,
            eligible,
        }
    }

    /// Runs `rounds` selections over persistent counters, the way the
    /// dispatcher drives it: fresh candidate views each frame, counters
    /// carried over.
    fn run(factors: &[f64], eligible: &[bool], rounds: usize) -> (Vec<usize>, Vec<f64>) {
        let mut tried = vec![0.0; factors.len()];
        let mut counts = vec![0usize; factors.len()];
        for _ in 0..rounds {
            let mut cands: Vec<Candidate> = factors
                .iter()
                .enumerate()
                .map(|(i, &f)| cand(i, tried[i], f, eligible[i]))
                .collect();
            let picked = select(&mut cands);
            for c in &cands {
                tried[c.idx] = c.tried;
            }
            if let Some(i) = picked {
                counts[i] += 1;
            }
        }
        (counts, tried)
    }

    #[test]
    fn test_weighted_split_three_to_one() {
        let (counts, _) = run(&[1.0, 3.0], &[true, true], 4000);
        let ratio = counts[1] as f64 / counts[0] as f64;
        assert!((ratio - 3.0).abs() < 0.15, "ratio {}", ratio);
        assert_eq!(counts[0] + counts[1], 4000);
    }

    #[test]
    fn test_equal_factors_split_evenly() {
        let (counts, _) = run(&[2.0, 2.0, 2.0], &[true, true, true], 3000);
        for &c in &counts {
            assert!((c as i64 - 1000).abs() <= 1, "counts {:?}", counts);
        }
    }

    #[test]
    fn test_nothing_eligible_drops_frame() {
        let (counts, tried) = run(&[1.0, 1.0], &[false, false], 10);
        assert_eq!(counts, vec![0, 0]);
        // the scan head was still charged every round
        assert_eq!(tried.iter().sum::<f64>(), 10.0);
    }

    #[test]
    fn test_skipped_head_is_still_charged() {
        let mut cands = vec![cand(0, 0.0, 2.0, false), cand(1, 5.0, 1.0, true)];
        assert_eq!(select(&mut cands), Some(1));
        let head = cands.iter().find(|c| c.idx == 0).unwrap();
        assert_eq!(head.tried, 0.5);
        let sent = cands.iter().find(|c| c.idx == 1).unwrap();
        assert_eq!(sent.tried, 5.0);
    }

    #[test]
    fn test_ties_keep_table_order() {
        let mut cands = vec![cand(0, 1.0, 1.0, true), cand(1, 1.0, 1.0, true)];
        assert_eq!(select(&mut cands), Some(0));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(select(&mut []), None);
    }

    #[test]
    fn test_single_link_takes_everything() {
        let (counts, tried) = run(&[4.0], &[true], 100);
        assert_eq!(counts[0], 100);
        assert!((tried[0] - 25.0).abs() < 1e-9);
    }
}
