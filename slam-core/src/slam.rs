//! Entry point: one [Slam] instance owns the configuration, the graph store
//! and the per-frame pipeline state.

use std::collections::BTreeSet;

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use slam_geom::quat_to_euler_deg;
use slam_types::{ExportData, Keypoint, ProcessStatus, SlamConfig, MAX_KPS, MAX_TREES};

use crate::match_tree::build_forest;
use crate::store::{FrameId, GraphStore};
use crate::Result;

pub struct Slam {
    pub(crate) cfg: SlamConfig,
    pub(crate) store: GraphStore,
    /// Sliding window of frames in arrival order.
    pub(crate) frame_order: Vec<FrameId>,
    pub(crate) keyframes: BTreeSet<FrameId>,
    pub(crate) origin: Option<FrameId>,
    /// Conjugate of the origin frame's orientation prior; frames are created
    /// relative to it.
    pub(crate) origin_rot_inverse: UnitQuaternion<f64>,
    pub(crate) img_width: f32,
    pub(crate) img_height: f32,
    pub(crate) trans_smooth: Vector3<f64>,
    pub(crate) vel_smooth: Vector3<f64>,
    pub(crate) initialized: bool,
    pub(crate) rng: SmallRng,
}

impl Slam {
    pub fn new(cfg: SlamConfig) -> Slam {
        let rng = SmallRng::seed_from_u64(cfg.seed);
        Slam {
            cfg,
            store: GraphStore::new(),
            frame_order: Vec::new(),
            keyframes: BTreeSet::new(),
            origin: None,
            origin_rot_inverse: UnitQuaternion::identity(),
            img_width: 0.0,
            img_height: 0.0,
            trans_smooth: Vector3::zeros(),
            vel_smooth: Vector3::zeros(),
            initialized: false,
            rng,
        }
    }

    pub fn config(&self) -> &SlamConfig {
        &self.cfg
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Package oracle-supplied keypoints and descriptors for [Slam::process],
    /// building and flattening the descriptor forest.
    pub fn extract_keypoints(
        &mut self,
        img_width: f32,
        img_height: f32,
        keypoints: Vec<Keypoint>,
    ) -> Result<ExportData> {
        let mut keypoints = keypoints;
        keypoints.truncate(MAX_KPS);
        let descs: Vec<_> = keypoints.iter().map(|kp| kp.desc).collect();
        let mut cfg = self.cfg.clone();
        cfg.tree_size = cfg.tree_size.min(MAX_TREES);
        let forest = build_forest(&descs, &cfg, &mut self.rng);
        Ok(ExportData::new(img_width, img_height, keypoints, &forest)?)
    }

    /// Ingest one frame: decode the exchange data, create the frame, evict
    /// beyond the window size, and run the pose pipeline.
    pub fn process(
        &mut self,
        orientation: [f64; 3],
        id: i64,
        timestamp: i64,
        data: &ExportData,
    ) -> Result<ProcessStatus> {
        let frame_id = if id == -1 {
            self.frame_order.last().map(|f| f.0 + 1).unwrap_or(1)
        } else {
            id
        };
        let forest = data.expand_forest()?;
        let curr = self.create_frame(
            FrameId(frame_id),
            data.img_width,
            data.img_height,
            orientation,
            timestamp,
            &data.keypoints,
            forest,
        );
        if self.frame_order.len() > self.cfg.max_frames {
            self.evict_oldest();
        }
        self.add_frame_pipeline(curr)
    }

    pub fn smoothed_translation(&self) -> Vector3<f64> {
        self.trans_smooth
    }

    pub fn smoothed_velocity(&self) -> Vector3<f64> {
        self.vel_smooth
    }

    pub fn current_translation(&self) -> Option<Vector3<f64>> {
        let id = self.frame_order.last()?;
        self.store.frame(*id).map(|f| f.pose.trans)
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    /// Translation of the `index`-th keyframe in id order.
    pub fn keyframe_translation(&self, index: usize) -> Option<Vector3<f64>> {
        let id = self.keyframes.iter().nth(index)?;
        self.store.frame(*id).map(|f| f.pose.trans)
    }

    /// Orientation of the `index`-th keyframe in id order, as Euler angles
    /// `[about_x, about_y, about_z]` in degrees.
    pub fn keyframe_rotation(&self, index: usize) -> Option<[f64; 3]> {
        let id = self.keyframes.iter().nth(index)?;
        self.store
            .frame(*id)
            .map(|f| quat_to_euler_deg(&f.pose.rot))
    }

    /// Rotation taking estimated poses back into the caller's world frame.
    pub fn origin_rotation_inverse(&self) -> UnitQuaternion<f64> {
        self.origin_rot_inverse
    }

    pub fn frame_count(&self) -> usize {
        self.frame_order.len()
    }

    /// Image dimensions captured from the first frame.
    pub fn image_size(&self) -> (f32, f32) {
        (self.img_width, self.img_height)
    }
}
