//! Per-episode time axes used for nearest-timestamp lookups.

use std::collections::HashMap;

/// Sorted `(timestamp, row)` pairs of every episode.
#[derive(Debug, Clone, Default)]
pub struct EpisodeTimelines {
    by_episode: HashMap<i64, Vec<(i64, usize)>>,
}

impl EpisodeTimelines {
    /// Build from `(row, episode_index, timestamp)` triples. Rows without a
    /// timestamp are skipped.
    pub fn build(rows: impl IntoIterator<Item = (usize, i64, Option<i64>)>) -> Self {
        let mut by_episode: HashMap<i64, Vec<(i64, usize)>> = HashMap::new();
        for (row, episode, timestamp) in rows {
            if let Some(ts) = timestamp {
                by_episode.entry(episode).or_default().push((ts, row));
            }
        }
        for points in by_episode.values_mut() {
            points.sort_unstable();
        }
        Self { by_episode }
    }

    /// Number of episodes with at least one timestamped row.
    pub fn episode_count(&self) -> usize {
        self.by_episode.len()
    }

    /// Row of `episode` whose timestamp is closest to `target`, if it is at
    /// most `tolerance` nanoseconds away. Ties go to the lower row.
    pub fn nearest(&self, episode: i64, target: i64, tolerance: i64) -> Option<usize> {
        let points = self.by_episode.get(&episode)?;
        let split = points.partition_point(|&(ts, _)| ts < target);

        let mut best: Option<(u64, usize)> = None;
        let mut consider = |ts: i64, row: usize| {
            let distance = ts.abs_diff(target);
            let better = match best {
                None => true,
                Some((d, r)) => distance < d || (distance == d && row < r),
            };
            if better {
                best = Some((distance, row));
            }
        };

        // Closest below the target: the last point before `split`, plus any
        // earlier points sharing its timestamp (possible lower rows).
        if split > 0 {
            let ts = points[split - 1].0;
            for &(t, row) in points[..split].iter().rev().take_while(|(t, _)| *t == ts) {
                consider(t, row);
            }
        }
        // Closest at or above the target, all rows sharing that timestamp.
        if let Some(&(ts, _)) = points.get(split) {
            for &(t, row) in points[split..].iter().take_while(|(t, _)| *t == ts) {
                consider(t, row);
            }
        }

        let (distance, row) = best?;
        (distance <= tolerance.max(0) as u64).then_some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timelines() -> EpisodeTimelines {
        EpisodeTimelines::build([
            (0, 0, Some(0)),
            (1, 0, Some(100)),
            (2, 0, Some(200)),
            (3, 0, None),
            (4, 1, Some(150)),
            (5, 1, Some(150)),
        ])
    }

    #[test]
    fn picks_closest_within_tolerance() {
        let t = timelines();
        assert_eq!(t.nearest(0, 95, 10), Some(1));
        assert_eq!(t.nearest(0, 160, 50), Some(2));
        assert_eq!(t.nearest(0, 150, 10), None);
        assert_eq!(t.nearest(7, 0, 1_000), None);
        assert_eq!(t.episode_count(), 2);
    }

    #[test]
    fn equal_distance_prefers_lower_row() {
        let t = timelines();
        assert_eq!(t.nearest(0, 150, 50), Some(1));
        assert_eq!(t.nearest(1, 150, 0), Some(4));
    }

    #[test]
    fn never_leaves_the_episode() {
        let t = timelines();
        // Episode 1 has rows at 150; episode 0 does not, even though they
        // are closer in global row order.
        assert_eq!(t.nearest(0, 150, 20), None);
        assert_eq!(t.nearest(1, 100, 60), Some(4));
    }
}
