//! Temporal smoothing of per-frame observations.
//!
//! Faces are keyed by a coarse spatial bucket rather than tracked: a face
//! that stays roughly in place keeps its entry, and its best identification
//! survives frames where the matcher misses.

use crate::types::{BoundingBox, Observation, TrackedFace};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_BUCKET_PX: f32 = 40.0;
const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Centre and size of a region, bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionKey {
    pub cx: i32,
    pub cy: i32,
    pub width: i32,
    pub height: i32,
}

impl PositionKey {
    pub fn quantize(bbox: &BoundingBox, bucket_px: f32) -> Self {
        let bucket = if bucket_px > 0.0 { bucket_px } else { 1.0 };
        let (cx, cy) = bbox.center();
        let q = |v: f32| (v / bucket).floor() as i32;
        Self { cx: q(cx), cy: q(cy), width: q(bbox.width), height: q(bbox.height) }
    }
}

#[derive(Debug, Clone)]
pub struct StabilizerParams {
    pub bucket_px: f32,
    /// Entries unseen for longer than this are evicted.
    pub inactivity_timeout: Duration,
}

impl Default for StabilizerParams {
    fn default() -> Self {
        Self { bucket_px: DEFAULT_BUCKET_PX, inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT }
    }
}

#[derive(Debug, Default)]
pub struct Stabilizer {
    params: StabilizerParams,
    faces: HashMap<PositionKey, TrackedFace>,
}

impl Stabilizer {
    pub fn new(params: StabilizerParams) -> Self {
        Self { params, faces: HashMap::new() }
    }

    /// Fold one cycle's observations in and return the resulting view.
    pub fn update(&mut self, observations: Vec<Observation>, now: Instant) -> Vec<TrackedFace> {
        for obs in observations {
            let key = PositionKey::quantize(&obs.region.bbox, self.params.bucket_px);
            let similarity = obs.similarity();

            match self.faces.get_mut(&key) {
                Some(face) => {
                    face.last_seen = now;
                    face.hits = face.hits.saturating_add(1);
                    face.region = obs.region;
                    if obs.identity.is_some() && similarity > face.best_similarity {
                        face.identity = obs.identity;
                        face.best_similarity = similarity;
                    }
                }
                None => {
                    tracing::debug!(?key, identity = ?obs.identity.as_ref().map(|i| &i.id), "new tracked face");
                    self.faces.insert(
                        key,
                        TrackedFace {
                            key,
                            region: obs.region,
                            identity: obs.identity,
                            best_similarity: similarity,
                            hits: 1,
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                }
            }
        }
        self.snapshot()
    }

    /// Drop entries idle for longer than the timeout. Returns how many went.
    pub fn evict(&mut self, now: Instant) -> usize {
        let timeout = self.params.inactivity_timeout;
        let before = self.faces.len();
        self.faces
            .retain(|_, face| now.saturating_duration_since(face.last_seen) <= timeout);
        let evicted = before - self.faces.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.faces.len(), "tracked faces expired");
        }
        evicted
    }

    /// Drop entries whose best identification is `identity_id`.
    pub fn forget(&mut self, identity_id: &str) -> usize {
        let before = self.faces.len();
        self.faces.retain(|_, face| face.identity_id() != Some(identity_id));
        before - self.faces.len()
    }

    /// Owned copy, oldest first.
    pub fn snapshot(&self) -> Vec<TrackedFace> {
        let mut faces: Vec<TrackedFace> = self.faces.values().cloned().collect();
        faces.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.key.cmp(&b.key)));
        faces
    }

    pub fn clear(&mut self) {
        self.faces.clear();
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceRegion, Identification};

    fn obs(x: f32, y: f32, who: Option<(&str, f32)>, at: Instant) -> Observation {
        Observation {
            region: FaceRegion {
                bbox: BoundingBox::new(x, y, 100.0, 100.0),
                detector: "test",
                confidence: None,
            },
            identity: who.map(|(id, similarity)| Identification {
                id: id.into(),
                name: id.to_uppercase(),
                similarity,
            }),
            timestamp: at,
        }
    }

    #[test]
    fn test_quantize_buckets() {
        let a = PositionKey::quantize(&BoundingBox::new(100.0, 100.0, 100.0, 100.0), 40.0);
        let b = PositionKey::quantize(&BoundingBox::new(105.0, 102.0, 100.0, 100.0), 40.0);
        let c = PositionKey::quantize(&BoundingBox::new(200.0, 100.0, 100.0, 100.0), 40.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_jitter_keeps_one_entry() {
        let mut stab = Stabilizer::default();
        let t0 = Instant::now();
        stab.update(vec![obs(100.0, 100.0, Some(("s1", 0.6)), t0)], t0);
        let t1 = t0 + Duration::from_millis(200);
        let view = stab.update(vec![obs(105.0, 102.0, None, t1)], t1);

        assert_eq!(view.len(), 1);
        assert_eq!(view[0].hits, 2);
        assert_eq!(view[0].last_seen, t1);
        assert_eq!(view[0].region.bbox.x, 105.0);
        // A miss does not erase the identification
        assert_eq!(view[0].identity_id(), Some("s1"));
    }

    #[test]
    fn test_identity_only_upgraded_by_higher_similarity() {
        let mut stab = Stabilizer::default();
        let t0 = Instant::now();
        stab.update(vec![obs(100.0, 100.0, Some(("s1", 0.6)), t0)], t0);
        stab.update(vec![obs(100.0, 100.0, Some(("s2", 0.5)), t0)], t0);
        assert_eq!(stab.snapshot()[0].identity_id(), Some("s1"));

        stab.update(vec![obs(100.0, 100.0, Some(("s2", 0.6)), t0)], t0);
        assert_eq!(stab.snapshot()[0].identity_id(), Some("s1"), "ties keep the incumbent");

        stab.update(vec![obs(100.0, 100.0, Some(("s2", 0.9)), t0)], t0);
        let face = &stab.snapshot()[0];
        assert_eq!(face.identity_id(), Some("s2"));
        assert_eq!(face.best_similarity, 0.9);
        assert_eq!(face.label(), "S2");
    }

    #[test]
    fn test_eviction_after_timeout() {
        let mut stab = Stabilizer::default();
        let t0 = Instant::now();
        stab.update(vec![obs(100.0, 100.0, None, t0), obs(400.0, 100.0, None, t0)], t0);
        let t1 = t0 + Duration::from_secs(3);
        stab.update(vec![obs(400.0, 100.0, None, t1)], t1);

        assert_eq!(stab.evict(t0 + Duration::from_secs(5)), 0);
        assert_eq!(stab.evict(t0 + Duration::from_millis(5_100)), 1);
        assert_eq!(stab.len(), 1);
        assert_eq!(stab.snapshot()[0].label(), "Unknown");
    }

    #[test]
    fn test_snapshot_ordered_by_first_seen() {
        let mut stab = Stabilizer::default();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(200);
        stab.update(vec![obs(400.0, 100.0, None, t0)], t0);
        stab.update(vec![obs(100.0, 100.0, None, t1), obs(400.0, 100.0, None, t1)], t1);

        let view = stab.snapshot();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].first_seen, t0);
        assert_eq!(view[1].first_seen, t1);
    }

    #[test]
    fn test_forget_and_clear() {
        let mut stab = Stabilizer::default();
        let t0 = Instant::now();
        stab.update(
            vec![obs(100.0, 100.0, Some(("s1", 0.8)), t0), obs(400.0, 100.0, Some(("s2", 0.8)), t0)],
            t0,
        );
        assert_eq!(stab.forget("s1"), 1);
        assert_eq!(stab.forget("s1"), 0);
        assert_eq!(stab.snapshot()[0].identity_id(), Some("s2"));

        stab.clear();
        assert!(stab.is_empty());
    }
}
