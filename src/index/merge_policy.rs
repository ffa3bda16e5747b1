//! Merge policies decide which segments should be merged together.
//!
//! A policy is a pure function of the segment list it is given: it never
//! touches storage and returns the same answer for the same input, so the
//! writer can consult it speculatively. Segments already claimed by a running
//! merge are flagged and never proposed again.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What caused the writer to look for merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeTrigger {
    /// A segment was flushed because the RAM buffer filled.
    SegmentFlush,
    /// A commit, NRT reader or explicit flush published segments.
    FullFlush,
    /// `maybe_merge` or a forced merge was called.
    Explicit,
    /// A merge finished and may enable another.
    MergeFinished,
    /// The writer is closing.
    Closing,
}

/// Why a merge was proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeReason {
    /// Too many segments for the tier structure.
    Tiered,
    /// Too many deleted documents index-wide.
    ReclaimDeletes,
    /// `force_merge`.
    Forced,
    /// `force_merge_deletes`.
    ForcedDeletes,
}

/// What a policy knows about one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSizeInfo {
    /// Segment name.
    pub name: String,

    /// Documents in the segment, including deleted ones.
    pub max_doc: u32,

    /// Deleted documents.
    pub del_count: u32,

    /// Size of the segment files in bytes.
    pub size_bytes: u64,

    /// True when a running merge already owns this segment.
    pub merging: bool,
}

impl SegmentSizeInfo {
    /// Fraction of deleted documents.
    pub fn deletion_ratio(&self) -> f64 {
        if self.max_doc == 0 {
            0.0
        } else {
            self.del_count as f64 / self.max_doc as f64
        }
    }

    /// Size in bytes once deleted documents are dropped.
    pub fn live_bytes(&self) -> u64 {
        (self.size_bytes as f64 * (1.0 - self.deletion_ratio())) as u64
    }
}

/// A group of segments to merge into one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    /// Segments to merge.
    pub segments: Vec<String>,

    /// Priority score (higher = more urgent).
    pub priority: f64,

    /// Expected size after merge.
    pub estimated_size: u64,

    /// Why the merge was proposed.
    pub reason: MergeReason,
}

/// Every merge a policy proposes in one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSpecification {
    pub merges: Vec<MergeCandidate>,
}

impl MergeSpecification {
    fn from_merges(merges: Vec<MergeCandidate>) -> Option<Self> {
        (!merges.is_empty()).then_some(MergeSpecification { merges })
    }
}

/// Trait for defining merge policies.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Merges worth running now, if any.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        segments: &[SegmentSizeInfo],
    ) -> Option<MergeSpecification>;

    /// Merges that bring the index down to at most `max_segment_count`
    /// segments, honouring the size cap.
    fn find_forced_merges(
        &self,
        segments: &[SegmentSizeInfo],
        max_segment_count: usize,
    ) -> Option<MergeSpecification>;

    /// Merges that expunge deleted documents.
    fn find_forced_deletes_merges(&self, segments: &[SegmentSizeInfo])
    -> Option<MergeSpecification>;

    /// Get policy configuration as key-value pairs for debugging.
    fn get_config(&self) -> HashMap<String, String>;
}

/// Never merges.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _: MergeTrigger, _: &[SegmentSizeInfo]) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_merges(&self, _: &[SegmentSizeInfo], _: usize) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_deletes_merges(&self, _: &[SegmentSizeInfo]) -> Option<MergeSpecification> {
        None
    }

    fn get_config(&self) -> HashMap<String, String> {
        HashMap::from([("policy".to_string(), "none".to_string())])
    }
}

/// Tiered merge policy.
///
/// Segments are grouped into tiers that grow geometrically by
/// `max_merge_at_once`; each tier may hold `segments_per_tier` segments.
/// While the index holds more segments than the tiers allow, the policy
/// merges the window of similarly sized segments with the best score,
/// favouring balanced merges that reclaim many deletions. Merged segments
/// never exceed `max_merged_segment_bytes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredMergePolicy {
    /// Maximum number of segments merged at once by natural merging.
    pub max_merge_at_once: usize,

    /// Maximum number of segments merged at once by forced merges.
    pub max_merge_at_once_explicit: usize,

    /// Allowed segments per tier.
    pub segments_per_tier: usize,

    /// Maximum size for a merged segment (in bytes).
    pub max_merged_segment_bytes: u64,

    /// Segments smaller than this are treated as this size.
    pub floor_segment_bytes: u64,

    /// Index-wide deleted percentage tolerated before reclaiming.
    pub deletes_pct_allowed: f64,

    /// Per-segment deleted percentage `force_merge_deletes` tolerates.
    pub forced_merge_deletes_pct_allowed: f64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            segments_per_tier: 10,
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            floor_segment_bytes: 2 * 1024 * 1024,
            deletes_pct_allowed: 20.0,
            forced_merge_deletes_pct_allowed: 10.0,
        }
    }
}

impl TieredMergePolicy {
    /// Create a new tiered merge policy with custom configuration.
    pub fn new(
        max_merge_at_once: usize,
        segments_per_tier: usize,
        max_merged_segment_bytes: u64,
    ) -> Self {
        TieredMergePolicy {
            max_merge_at_once: max_merge_at_once.max(2),
            segments_per_tier: segments_per_tier.max(2),
            max_merged_segment_bytes,
            ..Default::default()
        }
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max(self.floor_segment_bytes)
    }

    /// Non-merging segments, largest live size first, ties by name.
    fn eligible<'a>(&self, segments: &'a [SegmentSizeInfo]) -> Vec<&'a SegmentSizeInfo> {
        let mut eligible: Vec<&SegmentSizeInfo> = segments.iter().filter(|s| !s.merging).collect();
        eligible.sort_by(|a, b| {
            b.live_bytes()
                .cmp(&a.live_bytes())
                .then_with(|| a.name.cmp(&b.name))
        });
        eligible
    }

    /// How many segments the tier structure allows for `total_bytes`.
    fn allowed_segment_count(&self, total_bytes: u64, smallest_bytes: u64) -> usize {
        let mut level_size = self.floor_size(smallest_bytes) as f64;
        let mut bytes_left = total_bytes as f64;
        let per_tier = self.segments_per_tier as f64;
        let mut allowed = 0.0;
        loop {
            let count_at_level = bytes_left / level_size;
            if count_at_level < per_tier || level_size >= self.max_merged_segment_bytes as f64 {
                allowed += count_at_level.ceil();
                break;
            }
            allowed += per_tier;
            bytes_left -= per_tier * level_size;
            level_size = (level_size * self.max_merge_at_once as f64)
                .min(self.max_merged_segment_bytes as f64);
        }
        (allowed as usize).max(self.segments_per_tier)
    }

    /// Lower is better: balanced, small-ish merges reclaiming many deletes.
    fn score(&self, window: &[&SegmentSizeInfo], hit_too_large: bool) -> f64 {
        let total_before: u64 = window.iter().map(|s| s.size_bytes).sum();
        let total_after: u64 = window.iter().map(|s| s.live_bytes()).sum();
        let total_floored: u64 = window.iter().map(|s| self.floor_size(s.live_bytes())).sum();
        let skew = if hit_too_large {
            1.0 / self.max_merge_at_once as f64
        } else {
            let largest = window
                .first()
                .map_or(0, |s| self.floor_size(s.live_bytes()));
            largest as f64 / total_floored.max(1) as f64
        };
        let nondel_ratio = if total_before == 0 {
            1.0
        } else {
            total_after as f64 / total_before as f64
        };
        skew * (total_after.max(1) as f64).powf(0.05) * nondel_ratio * nondel_ratio
    }

    /// Greedily fill a window from `start`, skipping segments that would
    /// push the merge over the size cap.
    fn fill_window<'a>(
        &self,
        candidates: &[&'a SegmentSizeInfo],
        start: usize,
        max_len: usize,
    ) -> (Vec<&'a SegmentSizeInfo>, bool) {
        let mut window = Vec::with_capacity(max_len);
        let mut bytes = 0u64;
        let mut hit_too_large = false;
        for segment in &candidates[start..] {
            if window.len() >= max_len {
                break;
            }
            let size = segment.live_bytes();
            if bytes + size > self.max_merged_segment_bytes {
                hit_too_large = true;
                continue;
            }
            bytes += size;
            window.push(*segment);
        }
        (window, hit_too_large)
    }

    fn candidate(
        &self,
        window: &[&SegmentSizeInfo],
        priority: f64,
        reason: MergeReason,
    ) -> MergeCandidate {
        MergeCandidate {
            segments: window.iter().map(|s| s.name.clone()).collect(),
            priority,
            estimated_size: window.iter().map(|s| s.live_bytes()).sum(),
            reason,
        }
    }

    fn is_too_large(&self, segment: &SegmentSizeInfo) -> bool {
        segment.live_bytes() > self.max_merged_segment_bytes / 2
            && segment.deletion_ratio() * 100.0 <= self.deletes_pct_allowed
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        segments: &[SegmentSizeInfo],
    ) -> Option<MergeSpecification> {
        let mut candidates: Vec<&SegmentSizeInfo> = self
            .eligible(segments)
            .into_iter()
            .filter(|s| !self.is_too_large(s))
            .collect();
        let mut merges = Vec::new();

        loop {
            let total: u64 = candidates.iter().map(|s| s.live_bytes()).sum();
            let smallest = candidates.last().map_or(0, |s| s.live_bytes());
            let allowed = self.allowed_segment_count(total, smallest);
            if candidates.len() <= allowed || candidates.len() < 2 {
                break;
            }
            let mut best: Option<(f64, Vec<&SegmentSizeInfo>)> = None;
            for start in 0..=candidates.len() - 2 {
                let (window, hit_too_large) =
                    self.fill_window(&candidates, start, self.max_merge_at_once);
                if window.len() < 2 {
                    continue;
                }
                let score = self.score(&window, hit_too_large);
                if best.as_ref().is_none_or(|(s, _)| score < *s) {
                    best = Some((score, window));
                }
            }
            let Some((score, window)) = best else {
                break;
            };
            let names: Vec<&str> = window.iter().map(|s| s.name.as_str()).collect();
            merges.push(self.candidate(&window, 1.0 / score.max(f64::EPSILON), MergeReason::Tiered));
            candidates.retain(|s| !names.contains(&s.name.as_str()));
        }

        if merges.is_empty() {
            let total_docs: u64 = segments.iter().map(|s| s.max_doc as u64).sum();
            let total_dels: u64 = segments.iter().map(|s| s.del_count as u64).sum();
            let pct = if total_docs == 0 {
                0.0
            } else {
                total_dels as f64 * 100.0 / total_docs as f64
            };
            if pct > self.deletes_pct_allowed {
                let mut deleted: Vec<&SegmentSizeInfo> = self
                    .eligible(segments)
                    .into_iter()
                    .filter(|s| s.del_count > 0)
                    .collect();
                deleted.sort_by(|a, b| {
                    b.deletion_ratio()
                        .total_cmp(&a.deletion_ratio())
                        .then_with(|| a.name.cmp(&b.name))
                });
                let (window, _) = self.fill_window(&deleted, 0, self.max_merge_at_once);
                if !window.is_empty() {
                    let priority = window.iter().map(|s| s.deletion_ratio()).sum::<f64>();
                    merges.push(self.candidate(&window, priority, MergeReason::ReclaimDeletes));
                }
            }
        }

        MergeSpecification::from_merges(merges)
    }

    fn find_forced_merges(
        &self,
        segments: &[SegmentSizeInfo],
        max_segment_count: usize,
    ) -> Option<MergeSpecification> {
        let max_segment_count = max_segment_count.max(1);
        let mut pool: Vec<&SegmentSizeInfo> = self
            .eligible(segments)
            .into_iter()
            .filter(|s| s.live_bytes() <= self.max_merged_segment_bytes)
            .collect();
        let mut remaining = segments.len();
        let mut merges = Vec::new();

        while remaining > max_segment_count && pool.len() >= 2 {
            let need = remaining - max_segment_count + 1;
            let take = need.min(self.max_merge_at_once_explicit);
            // Smallest segments first, as long as they fit under the cap.
            let mut window = Vec::with_capacity(take);
            let mut bytes = 0u64;
            for segment in pool.iter().rev() {
                if window.len() >= take {
                    break;
                }
                if bytes + segment.live_bytes() > self.max_merged_segment_bytes {
                    break;
                }
                bytes += segment.live_bytes();
                window.push(*segment);
            }
            if window.len() < 2 {
                break;
            }
            window.reverse();
            remaining -= window.len() - 1;
            let names: Vec<&str> = window.iter().map(|s| s.name.as_str()).collect();
            merges.push(self.candidate(&window, window.len() as f64, MergeReason::Forced));
            pool.retain(|s| !names.contains(&s.name.as_str()));
        }

        if remaining <= max_segment_count {
            // Rewrite segments that still carry deletions.
            for segment in pool.iter().filter(|s| s.del_count > 0) {
                merges.push(self.candidate(&[*segment], 1.0, MergeReason::Forced));
            }
        }

        MergeSpecification::from_merges(merges)
    }

    fn find_forced_deletes_merges(
        &self,
        segments: &[SegmentSizeInfo],
    ) -> Option<MergeSpecification> {
        let candidates: Vec<&SegmentSizeInfo> = self
            .eligible(segments)
            .into_iter()
            .filter(|s| s.deletion_ratio() * 100.0 > self.forced_merge_deletes_pct_allowed)
            .collect();
        let mut merges = Vec::new();
        let mut start = 0;
        while start < candidates.len() {
            let (window, _) = self.fill_window(&candidates[start..], 0, self.max_merge_at_once_explicit);
            if window.is_empty() {
                start += 1;
                continue;
            }
            let names: Vec<&str> = window.iter().map(|s| s.name.as_str()).collect();
            merges.push(self.candidate(&window, window.len() as f64, MergeReason::ForcedDeletes));
            let consumed = candidates[start..]
                .iter()
                .take_while(|s| names.contains(&s.name.as_str()))
                .count()
                .max(1);
            start += consumed;
            // Segments skipped by the size cap are retried on their own.
            if consumed < window.len() {
                let rest: Vec<&SegmentSizeInfo> = candidates[start..]
                    .iter()
                    .filter(|s| !names.contains(&s.name.as_str()))
                    .copied()
                    .collect();
                return MergeSpecification::from_merges(
                    merges
                        .into_iter()
                        .chain(rest.iter().filter_map(|s| {
                            (s.live_bytes() <= self.max_merged_segment_bytes).then(|| {
                                self.candidate(&[*s], 1.0, MergeReason::ForcedDeletes)
                            })
                        }))
                        .collect(),
                );
            }
        }
        MergeSpecification::from_merges(merges)
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("policy".to_string(), "tiered".to_string());
        config.insert("max_merge_at_once".to_string(), self.max_merge_at_once.to_string());
        config.insert(
            "max_merge_at_once_explicit".to_string(),
            self.max_merge_at_once_explicit.to_string(),
        );
        config.insert("segments_per_tier".to_string(), self.segments_per_tier.to_string());
        config.insert(
            "max_merged_segment_bytes".to_string(),
            self.max_merged_segment_bytes.to_string(),
        );
        config.insert("floor_segment_bytes".to_string(), self.floor_segment_bytes.to_string());
        config.insert("deletes_pct_allowed".to_string(), self.deletes_pct_allowed.to_string());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn segment(name: &str, size: u64, del_count: u32) -> SegmentSizeInfo {
        SegmentSizeInfo {
            name: name.to_string(),
            max_doc: 100,
            del_count,
            size_bytes: size,
            merging: false,
        }
    }

    fn small_segments(count: usize) -> Vec<SegmentSizeInfo> {
        (0..count).map(|i| segment(&format!("_{i}"), MB, 0)).collect()
    }

    #[test]
    fn test_no_merge_below_allowed_count() {
        let policy = TieredMergePolicy::default();
        let segments = small_segments(9);
        assert!(policy.find_merges(MergeTrigger::Explicit, &segments).is_none());
    }

    #[test]
    fn test_tiered_merge_and_idempotence() {
        let policy = TieredMergePolicy::default();
        let mut segments = small_segments(25);
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &segments)
            .unwrap();
        for merge in &spec.merges {
            assert!(merge.segments.len() >= 2);
            assert!(merge.segments.len() <= policy.max_merge_at_once);
            assert_eq!(merge.reason, MergeReason::Tiered);
        }
        // Deterministic for the same input.
        assert_eq!(
            policy.find_merges(MergeTrigger::SegmentFlush, &segments),
            Some(spec.clone())
        );

        // Once claimed, the same segments are never proposed again.
        for merge in &spec.merges {
            for s in segments.iter_mut() {
                if merge.segments.contains(&s.name) {
                    s.merging = true;
                }
            }
        }
        if let Some(again) = policy.find_merges(MergeTrigger::SegmentFlush, &segments) {
            for merge in again.merges {
                for name in merge.segments {
                    assert!(!spec.merges.iter().any(|m| m.segments.contains(&name)));
                }
            }
        }
    }

    #[test]
    fn test_size_cap_respected() {
        let policy = TieredMergePolicy {
            max_merged_segment_bytes: 10 * MB,
            floor_segment_bytes: MB,
            ..Default::default()
        };
        let segments: Vec<_> = (0..40).map(|i| segment(&format!("_{i}"), 3 * MB, 0)).collect();
        let spec = policy.find_merges(MergeTrigger::Explicit, &segments).unwrap();
        for merge in &spec.merges {
            assert!(merge.estimated_size <= 10 * MB);
        }
        let forced = policy.find_forced_merges(&segments, 1).unwrap();
        for merge in &forced.merges {
            assert!(merge.estimated_size <= 10 * MB);
        }
    }

    #[test]
    fn test_reclaims_deletes() {
        let policy = TieredMergePolicy::default();
        let segments = vec![segment("_0", MB, 50), segment("_1", MB, 40), segment("_2", MB, 0)];
        let spec = policy.find_merges(MergeTrigger::Explicit, &segments).unwrap();
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].reason, MergeReason::ReclaimDeletes);
        assert_eq!(spec.merges[0].segments, vec!["_0".to_string(), "_1".to_string()]);
    }

    #[test]
    fn test_forced_merge_to_one() {
        let policy = TieredMergePolicy::default();
        let segments = small_segments(5);
        let spec = policy.find_forced_merges(&segments, 1).unwrap();
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].segments.len(), 5);

        let single = vec![segment("_0", MB, 0)];
        assert!(policy.find_forced_merges(&single, 1).is_none());
        let single_with_deletes = vec![segment("_0", MB, 3)];
        assert_eq!(
            policy
                .find_forced_merges(&single_with_deletes, 1)
                .unwrap()
                .merges[0]
                .segments,
            vec!["_0".to_string()]
        );
    }

    #[test]
    fn test_forced_merge_explicit_window() {
        let policy = TieredMergePolicy {
            max_merge_at_once_explicit: 4,
            ..Default::default()
        };
        let segments = small_segments(10);
        let spec = policy.find_forced_merges(&segments, 1).unwrap();
        assert!(spec.merges.iter().all(|m| m.segments.len() <= 4));
        let merged: usize = spec.merges.iter().map(|m| m.segments.len() - 1).sum();
        assert!(merged > 0);
    }

    #[test]
    fn test_forced_deletes() {
        let policy = TieredMergePolicy::default();
        let segments = vec![segment("_0", MB, 50), segment("_1", MB, 5), segment("_2", MB, 20)];
        let spec = policy.find_forced_deletes_merges(&segments).unwrap();
        assert_eq!(spec.merges.len(), 1);
        let mut names = spec.merges[0].segments.clone();
        names.sort();
        assert_eq!(names, vec!["_0".to_string(), "_2".to_string()]);
    }

    #[test]
    fn test_no_merge_policy() {
        let segments = small_segments(50);
        assert!(NoMergePolicy
            .find_merges(MergeTrigger::Explicit, &segments)
            .is_none());
    }

    #[test]
    fn test_config_serde() {
        let policy = TieredMergePolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: TieredMergePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
        let partial: TieredMergePolicy = serde_json::from_str(r#"{"segments_per_tier": 4}"#).unwrap();
        assert_eq!(partial.segments_per_tier, 4);
        assert_eq!(partial.max_merge_at_once, 10);
    }
}
