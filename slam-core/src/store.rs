//! Graph store: frames, feature points and landmarks in id-keyed arenas.
//!
//! Entities refer to each other by stable identifiers, never by pointers. A
//! frame owns its feature points; landmarks are owned by the store and hold
//! the keys of their feature points, while each feature point carries at most
//! one landmark backlink. Floating landmarks produced during matching are
//! ordinary [Landmark] records kept in a caller-owned [LandmarkTable] and are
//! never inserted into the store.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;

use slam_geom::{PinholeModel, Pose};
use slam_types::{Descriptor, IndexNode, SlamConfig, INFINITE_DISTANCE};

use crate::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LandmarkId(pub u64);

/// Address of one feature point: owning frame plus index within the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FpKey {
    pub frame: FrameId,
    pub index: u32,
}

/// Scratch table for floating landmarks.
pub type LandmarkTable = BTreeMap<LandmarkId, Landmark>;

#[derive(Debug, Clone)]
pub struct FeaturePoint {
    /// Raw pixel coordinates, immutable after creation.
    pub px: f32,
    pub py: f32,
    /// Centered coordinates `(px - cx, py - cy)`.
    pub x: f64,
    pub y: f64,
    pub desc: Descriptor,
    pub landmark: Option<LandmarkId>,
    pub match_distance: f64,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: i64,
    pub pose: Pose,
    /// Orientation prior as supplied by the caller, radians.
    pub orientation: [f64; 3],
    /// Keyframe hierarchy level; `None` until assigned.
    pub level: Option<u32>,
    pub valid: bool,
    pub is_keyframe: bool,
    /// Median distance from this frame to its observed valid landmarks.
    pub landmark_dist_threshold: f64,
    pub fps: Vec<FeaturePoint>,
    /// Descriptor forest over `fps`, node indices into `fps`.
    pub forest: Vec<Vec<IndexNode>>,
}

impl Frame {
    pub fn fp_keys(&self) -> impl Iterator<Item = FpKey> + '_ {
        let id = self.id;
        (0..self.fps.len() as u32).map(move |index| FpKey { frame: id, index })
    }
}

#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: LandmarkId,
    pub trans: Vector3<f64>,
    pub valid: bool,
    pub fps: BTreeSet<FpKey>,
}

impl Landmark {
    fn new(id: LandmarkId) -> Self {
        Landmark {
            id,
            trans: Vector3::zeros(),
            valid: false,
            fps: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct GraphStore {
    frames: BTreeMap<FrameId, Frame>,
    landmarks: BTreeMap<LandmarkId, Landmark>,
    next_landmark_id: u64,
}

impl GraphStore {
    pub fn new() -> Self {
        GraphStore::default()
    }

    fn next_id(&mut self) -> LandmarkId {
        let id = LandmarkId(self.next_landmark_id);
        self.next_landmark_id += 1;
        id
    }

    pub fn insert_frame(&mut self, frame: Frame) {
        self.frames.insert(frame.id, frame);
    }

    pub fn remove_frame(&mut self, id: FrameId) -> Option<Frame> {
        self.frames.remove(&id)
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(&id)
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }

    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut Frame> {
        self.frames.values_mut()
    }

    pub fn fp(&self, key: FpKey) -> Option<&FeaturePoint> {
        self.frames
            .get(&key.frame)
            .and_then(|f| f.fps.get(key.index as usize))
    }

    pub fn fp_mut(&mut self, key: FpKey) -> Option<&mut FeaturePoint> {
        self.frames
            .get_mut(&key.frame)
            .and_then(|f| f.fps.get_mut(key.index as usize))
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn landmarks_mut(&mut self) -> impl Iterator<Item = &mut Landmark> {
        self.landmarks.values_mut()
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    /// Unprojection of a feature point at the configured maximum depth. This
    /// keeps new landmark estimates away from the degenerate origin.
    fn initial_estimate(&self, fp: FpKey, cfg: &SlamConfig) -> Result<Vector3<f64>> {
        let point = self.fp(fp).ok_or(CoreError::UnknownFeaturePoint(fp))?;
        let frame = self.frame(fp.frame).ok_or(CoreError::UnknownFrame(fp.frame))?;
        let cam = PinholeModel::centered(cfg.fx);
        Ok(cam.unproject(&frame.pose, point.x, point.y, cfg.max_depth))
    }

    /// Allocate a persistent landmark seeded from one feature point.
    pub fn create_landmark(
        &mut self,
        fp: FpKey,
        distance: f64,
        cfg: &SlamConfig,
    ) -> Result<LandmarkId> {
        let trans = self.initial_estimate(fp, cfg)?;
        let id = self.next_id();
        let mut landmark = Landmark::new(id);
        landmark.trans = trans;
        landmark.fps.insert(fp);
        self.landmarks.insert(id, landmark);
        let point = self.fp_mut(fp).ok_or(CoreError::UnknownFeaturePoint(fp))?;
        point.landmark = Some(id);
        point.match_distance = distance;
        Ok(id)
    }

    /// Allocate a floating landmark spanning two feature points. The record
    /// is returned to the caller's scratch table; neither feature point gets
    /// a backlink. The position is seeded from the feature points' valid
    /// landmarks when available, else by unprojection of the first point.
    pub fn create_floating_landmark(
        &mut self,
        fp1: FpKey,
        fp2: FpKey,
        cfg: &SlamConfig,
    ) -> Result<Landmark> {
        debug_assert_ne!(fp1, fp2);
        let l1 = self
            .fp(fp1)
            .ok_or(CoreError::UnknownFeaturePoint(fp1))?
            .landmark
            .and_then(|id| self.landmark(id));
        let l2 = self
            .fp(fp2)
            .ok_or(CoreError::UnknownFeaturePoint(fp2))?
            .landmark
            .and_then(|id| self.landmark(id));
        let trans = match (l1, l2) {
            (Some(a), Some(b)) if a.valid && b.valid => (a.trans + b.trans) / 2.0,
            (Some(a), _) if a.valid => a.trans,
            (_, Some(b)) if b.valid => b.trans,
            _ => self.initial_estimate(fp1, cfg)?,
        };
        let id = self.next_id();
        let mut landmark = Landmark::new(id);
        landmark.trans = trans;
        landmark.fps.insert(fp1);
        landmark.fps.insert(fp2);
        Ok(landmark)
    }

    /// Attach a feature point to a persistent landmark and deduplicate.
    pub fn link(&mut self, id: LandmarkId, fp: FpKey, distance: f64) -> Result<()> {
        {
            let landmark = self
                .landmarks
                .get_mut(&id)
                .ok_or(CoreError::UnknownLandmark(id))?;
            landmark.fps.insert(fp);
        }
        let point = self.fp_mut(fp).ok_or(CoreError::UnknownFeaturePoint(fp))?;
        point.landmark = Some(id);
        point.match_distance = distance;
        self.dedupe(id)
    }

    /// Detach a feature point. Returns `true` when the landmark itself was
    /// deleted because fewer than two points remained.
    pub fn unlink(&mut self, id: LandmarkId, fp: FpKey) -> bool {
        let remaining = match self.landmarks.get_mut(&id) {
            Some(landmark) => {
                landmark.fps.remove(&fp);
                landmark.fps.len()
            }
            None => return false,
        };
        // The feature point may meanwhile belong to a different landmark;
        // only clear a backlink that refers to the landmark being modified.
        if let Some(point) = self.fp_mut(fp) {
            if point.landmark == Some(id) {
                point.landmark = None;
                point.match_distance = INFINITE_DISTANCE;
            }
        }
        if remaining < 2 {
            self.remove_landmark(id);
            true
        } else {
            false
        }
    }

    /// Delete a landmark, clearing backlinks that still refer to it.
    pub fn remove_landmark(&mut self, id: LandmarkId) {
        if let Some(landmark) = self.landmarks.remove(&id) {
            for fp in landmark.fps {
                if let Some(point) = self.fp_mut(fp) {
                    if point.landmark == Some(id) {
                        point.landmark = None;
                        point.match_distance = INFINITE_DISTANCE;
                    }
                }
            }
        }
    }

    /// Move every feature point of `mergee` into `reference`, transfer the
    /// position estimate if only the mergee had a valid one, deduplicate and
    /// delete the mergee.
    pub fn merge(&mut self, reference: LandmarkId, mergee: LandmarkId) -> Result<()> {
        if reference == mergee {
            return Ok(());
        }
        let merge_rec = self
            .landmarks
            .remove(&mergee)
            .ok_or(CoreError::UnknownLandmark(mergee))?;
        {
            let reference_rec = self
                .landmarks
                .get_mut(&reference)
                .ok_or(CoreError::UnknownLandmark(reference))?;
            for fp in &merge_rec.fps {
                reference_rec.fps.insert(*fp);
            }
            if merge_rec.valid && !reference_rec.valid {
                reference_rec.trans = merge_rec.trans;
                reference_rec.valid = true;
            }
        }
        for fp in &merge_rec.fps {
            if let Some(point) = self.fp_mut(*fp) {
                point.landmark = Some(reference);
            }
        }
        self.dedupe(reference)
    }

    /// For every frame contributing more than one feature point, keep the
    /// point whose descriptor has the minimum summed Hamming distance to the
    /// other members and detach the rest.
    pub fn dedupe(&mut self, id: LandmarkId) -> Result<()> {
        let mut record = match self.landmarks.remove(&id) {
            Some(rec) => rec,
            None => return Err(CoreError::UnknownLandmark(id)),
        };
        let dropped = self.dedupe_record(&mut record);
        for fp in dropped {
            if let Some(point) = self.fp_mut(fp) {
                if point.landmark == Some(id) {
                    point.landmark = None;
                    point.match_distance = INFINITE_DISTANCE;
                }
            }
        }
        let mut seen = BTreeSet::new();
        for fp in &record.fps {
            if !seen.insert(fp.frame) {
                return Err(CoreError::InvariantViolation(format!(
                    "landmark {:?} still holds duplicate frame {:?} after dedupe",
                    id, fp.frame
                )));
            }
        }
        self.landmarks.insert(id, record);
        Ok(())
    }

    /// Deduplicate a landmark record without touching backlinks. Returns the
    /// detached feature points.
    pub fn dedupe_record(&self, landmark: &mut Landmark) -> Vec<FpKey> {
        let mut by_frame: BTreeMap<FrameId, Vec<FpKey>> = BTreeMap::new();
        for fp in &landmark.fps {
            by_frame.entry(fp.frame).or_default().push(*fp);
        }
        let mut dropped = Vec::new();
        for (_, duplicates) in by_frame {
            if duplicates.len() < 2 {
                continue;
            }
            let mut selected = duplicates[0];
            let mut min_distance = f64::MAX;
            for dup in &duplicates {
                let dup_desc = match self.fp(*dup) {
                    Some(p) => p.desc,
                    None => continue,
                };
                let mut distance = 0.0;
                for other in &landmark.fps {
                    if other == dup {
                        continue;
                    }
                    if let Some(other_fp) = self.fp(*other) {
                        distance += f64::from(dup_desc.hamming(&other_fp.desc));
                    }
                }
                if distance < min_distance {
                    min_distance = distance;
                    selected = *dup;
                }
            }
            for dup in duplicates {
                if dup != selected {
                    landmark.fps.remove(&dup);
                    dropped.push(dup);
                }
            }
        }
        dropped
    }

    /// Subtract the origin translation from every landmark.
    pub fn shift_landmarks(&mut self, origin_trans: &Vector3<f64>) {
        for landmark in self.landmarks.values_mut() {
            landmark.trans -= origin_trans;
        }
    }

    /// Frame-distance-aware descriptor of a landmark: the descriptor of the
    /// member feature point whose owning frame is closest to `query_frame`,
    /// restricted to `descriptor_frames`.
    pub(crate) fn nearest_member_desc(
        &self,
        landmark: &Landmark,
        query_frame: FrameId,
        descriptor_frames: &BTreeSet<FrameId>,
    ) -> Option<Descriptor> {
        let query_trans = self.frame(query_frame)?.pose.trans;
        let mut best: Option<(f64, Descriptor)> = None;
        for fp in &landmark.fps {
            if !descriptor_frames.contains(&fp.frame) {
                continue;
            }
            let frame = match self.frame(fp.frame) {
                Some(f) => f,
                None => continue,
            };
            let point = match self.fp(*fp) {
                Some(p) => p,
                None => continue,
            };
            let frame_dist = (frame.pose.trans - query_trans).norm();
            if best.is_none() || frame_dist < best.as_ref().expect("set").0 {
                best = Some((frame_dist, point.desc));
            }
        }
        best.map(|(_, desc)| desc)
    }

    /// Check the persistent-store invariants; used after commits and by
    /// tests.
    pub fn check_invariants(&self) -> Result<()> {
        for landmark in self.landmarks.values() {
            if landmark.fps.len() < 2 {
                return Err(CoreError::InvariantViolation(format!(
                    "landmark {:?} has {} feature points",
                    landmark.id,
                    landmark.fps.len()
                )));
            }
            let mut frames = BTreeSet::new();
            for fp in &landmark.fps {
                if !frames.insert(fp.frame) {
                    return Err(CoreError::InvariantViolation(format!(
                        "landmark {:?} holds two feature points of frame {:?}",
                        landmark.id, fp.frame
                    )));
                }
            }
        }
        for frame in self.frames.values() {
            for key in frame.fp_keys() {
                let point = self.fp(key).expect("own key");
                if let Some(id) = point.landmark {
                    let landmark = self
                        .landmark(id)
                        .ok_or_else(|| {
                            CoreError::InvariantViolation(format!(
                                "feature point {key:?} links to missing landmark {id:?}"
                            ))
                        })?;
                    if !landmark.fps.contains(&key) {
                        return Err(CoreError::InvariantViolation(format!(
                            "landmark {id:?} does not contain its backlinked point {key:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Look up landmark records in a scratch table first, then in the store.
#[derive(Clone, Copy)]
pub(crate) struct LandmarkView<'a> {
    pub store: &'a GraphStore,
    pub scratch: Option<&'a LandmarkTable>,
}

impl<'a> LandmarkView<'a> {
    pub fn new(store: &'a GraphStore, scratch: Option<&'a LandmarkTable>) -> Self {
        LandmarkView { store, scratch }
    }

    pub fn get(&self, id: LandmarkId) -> Option<&'a Landmark> {
        self.scratch
            .and_then(|t| t.get(&id))
            .or_else(|| self.store.landmark(id))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn test_frame(id: i64, n_fps: usize) -> Frame {
        let fps = (0..n_fps)
            .map(|i| {
                let mut desc = [0u8; 32];
                desc[0] = i as u8;
                FeaturePoint {
                    px: i as f32,
                    py: 0.0,
                    x: i as f64,
                    y: 0.0,
                    desc: Descriptor(desc),
                    landmark: None,
                    match_distance: INFINITE_DISTANCE,
                }
            })
            .collect();
        Frame {
            id: FrameId(id),
            timestamp: id * 1000,
            pose: Pose::identity(),
            orientation: [0.0; 3],
            level: None,
            valid: true,
            is_keyframe: false,
            landmark_dist_threshold: 0.0,
            fps,
            forest: Vec::new(),
        }
    }

    fn key(frame: i64, index: u32) -> FpKey {
        FpKey {
            frame: FrameId(frame),
            index,
        }
    }

    #[test]
    fn test_create_landmark_nondegenerate() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 3));
        let cfg = SlamConfig::default();
        let id = store.create_landmark(key(0, 1), 5.0, &cfg).unwrap();
        let landmark = store.landmark(id).unwrap();
        assert!(landmark.trans.norm() > 0.0);
        assert_eq!(store.fp(key(0, 1)).unwrap().landmark, Some(id));
        assert_eq!(store.fp(key(0, 1)).unwrap().match_distance, 5.0);
    }

    #[test]
    fn test_link_unlink_removes_small_landmark() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 2));
        store.insert_frame(test_frame(1, 2));
        let cfg = SlamConfig::default();
        let id = store.create_landmark(key(0, 0), 0.0, &cfg).unwrap();
        store.link(id, key(1, 0), 3.0).unwrap();
        assert_eq!(store.landmark(id).unwrap().fps.len(), 2);

        // Dropping below two points deletes the landmark and clears links.
        assert!(store.unlink(id, key(1, 0)));
        assert!(store.landmark(id).is_none());
        assert_eq!(store.fp(key(0, 0)).unwrap().landmark, None);
    }

    #[test]
    fn test_dedupe_keeps_min_summed_distance() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 3));
        store.insert_frame(test_frame(1, 3));
        let cfg = SlamConfig::default();
        let id = store.create_landmark(key(1, 0), 0.0, &cfg).unwrap();
        store.link(id, key(0, 0), 0.0).unwrap();
        // Second point of frame 0. Its summed descriptor distance to the
        // other members is larger, so it is the one detached.
        store.link(id, key(0, 2), 0.0).unwrap();
        let landmark = store.landmark(id).unwrap();
        assert_eq!(landmark.fps.len(), 2);
        assert!(landmark.fps.contains(&key(0, 0)));
        assert!(!landmark.fps.contains(&key(0, 2)));
        assert_eq!(store.fp(key(0, 2)).unwrap().landmark, None);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_dedupe_idempotent() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 3));
        store.insert_frame(test_frame(1, 1));
        let cfg = SlamConfig::default();
        let id = store.create_landmark(key(1, 0), 0.0, &cfg).unwrap();
        store.link(id, key(0, 0), 0.0).unwrap();
        store.link(id, key(0, 1), 0.0).unwrap();
        let after_once: Vec<FpKey> = store.landmark(id).unwrap().fps.iter().copied().collect();
        store.dedupe(id).unwrap();
        let after_twice: Vec<FpKey> = store.landmark(id).unwrap().fps.iter().copied().collect();
        assert_eq!(after_once, after_twice);
    }

    #[test]
    fn test_merge_transfers_estimate() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 2));
        store.insert_frame(test_frame(1, 2));
        store.insert_frame(test_frame(2, 2));
        let cfg = SlamConfig::default();
        let a = store.create_landmark(key(0, 0), 0.0, &cfg).unwrap();
        store.link(a, key(1, 0), 0.0).unwrap();
        let b = store.create_landmark(key(2, 0), 0.0, &cfg).unwrap();
        store.link(b, key(1, 1), 0.0).unwrap();
        store
            .landmark_mut(b)
            .map(|l| {
                l.valid = true;
                l.trans = Vector3::new(1.0, 2.0, 3.0);
            })
            .unwrap();

        store.merge(a, b).unwrap();
        assert!(store.landmark(b).is_none());
        let merged = store.landmark(a).unwrap();
        assert!(merged.valid);
        assert_eq!(merged.trans, Vector3::new(1.0, 2.0, 3.0));
        for fp in merged.fps.clone() {
            assert_eq!(store.fp(fp).unwrap().landmark, Some(a));
        }
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_floating_landmark_seeding() {
        let mut store = GraphStore::new();
        store.insert_frame(test_frame(0, 2));
        store.insert_frame(test_frame(1, 2));
        let cfg = SlamConfig::default();

        // No landmarks anywhere: seeded by unprojection.
        let floating = store
            .create_floating_landmark(key(0, 0), key(1, 0), &cfg)
            .unwrap();
        assert_eq!(floating.fps.len(), 2);
        assert!(floating.trans.norm() > 0.0);

        // A valid landmark on the first point seeds the position.
        let id = store.create_landmark(key(0, 1), 0.0, &cfg).unwrap();
        store.link(id, key(1, 1), 0.0).unwrap();
        store
            .landmark_mut(id)
            .map(|l| {
                l.valid = true;
                l.trans = Vector3::new(4.0, 5.0, 6.0);
            })
            .unwrap();
        let floating = store
            .create_floating_landmark(key(0, 1), key(1, 0), &cfg)
            .unwrap();
        assert_eq!(floating.trans, Vector3::new(4.0, 5.0, 6.0));
        // Floating landmarks never appear in the store.
        assert!(store.landmark(floating.id).is_none());
    }
}
