//! Sparse Levenberg-Marquardt bundle adjustment.
//!
//! The graph has two vertex kinds: poses (3-DOF translation-only or 6-DOF
//! SE(3) with tangent-space rotation updates) and 3-DOF world points. Every
//! edge is a reprojection measurement with a per-edge information weight and
//! a Huber robust kernel. Point vertices are marginalized by Schur
//! complement, so each iteration factors only the reduced pose system.
//!
//! Setup order: [BundleAdjustment::add_pose], [BundleAdjustment::add_point],
//! [BundleAdjustment::add_edge], then [BundleAdjustment::optimize]. Any
//! subset of vertices may be fixed; when every pose is fixed the solver
//! injects a synthetic free pose and point so the problem stays well posed
//! (the injected vertices never appear in extracted estimates).

#![deny(rust_2018_idioms)]

use std::collections::BTreeMap;

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};
use thiserror::Error;

use slam_geom::{PinholeModel, Pose};

mod solver;

#[derive(Error, Debug)]
pub enum Error {
    #[error("point {0} initialized at the origin")]
    DegenerateInitialization(u64),
    #[error("unknown pose vertex {0}")]
    UnknownPose(i64),
    #[error("unknown point vertex {0}")]
    UnknownPoint(u64),
    #[error("duplicate vertex id {0}")]
    DuplicateVertex(i64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Huber kernel threshold, in measurement units.
const HUBER_DELTA: f64 = 1.0;

/// Id gap between real pose vertices and the injected synthetic pose.
const INJECTED_ID_GAP: i64 = 1000;

/// Pose vertex parameterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseDof {
    /// Translation only; rotation stays at the supplied prior.
    Three,
    /// Translation plus rotation (right-multiplied scaled-axis updates).
    Six,
}

impl PoseDof {
    fn dim(&self) -> usize {
        match self {
            PoseDof::Three => 3,
            PoseDof::Six => 6,
        }
    }
}

#[derive(Debug, Clone)]
struct PoseVertex {
    pose: Pose,
    fixed: bool,
    injected: bool,
}

#[derive(Debug, Clone)]
struct PointVertex {
    trans: Vector3<f64>,
    fixed: bool,
    injected: bool,
}

#[derive(Debug, Clone)]
struct Edge {
    point: u64,
    pose: i64,
    meas: Vector2<f64>,
    weight: f64,
}

pub struct BundleAdjustment {
    camera: PinholeModel,
    max_depth: f64,
    dof: PoseDof,
    max_iterations: usize,
    poses: BTreeMap<i64, PoseVertex>,
    points: BTreeMap<u64, PointVertex>,
    edges: Vec<Edge>,
    injected: bool,
}

impl BundleAdjustment {
    /// `focal` is the working focal length (unity when measurements are in
    /// normalized coordinates); the principal point is zero because
    /// measurements are centered.
    pub fn new(focal: f64, max_iterations: usize, max_depth: f64, dof: PoseDof) -> Self {
        BundleAdjustment {
            camera: PinholeModel::centered(focal),
            max_depth,
            dof,
            max_iterations,
            poses: BTreeMap::new(),
            points: BTreeMap::new(),
            edges: Vec::new(),
            injected: false,
        }
    }

    pub fn camera(&self) -> &PinholeModel {
        &self.camera
    }

    pub fn dof(&self) -> PoseDof {
        self.dof
    }

    /// Add a pose vertex with its initial estimate.
    pub fn add_pose(&mut self, id: i64, pose: &Pose, fixed: bool) -> Result<()> {
        if self.poses.contains_key(&id) {
            return Err(Error::DuplicateVertex(id));
        }
        self.poses.insert(
            id,
            PoseVertex {
                pose: pose.clone(),
                fixed,
                injected: false,
            },
        );
        Ok(())
    }

    /// Add a point vertex with its initial estimate. The all-zero estimate is
    /// rejected: the optimizer cannot recover a point that starts exactly on
    /// the projection center.
    pub fn add_point(&mut self, id: u64, trans: Vector3<f64>, fixed: bool) -> Result<()> {
        if trans.x == 0.0 && trans.y == 0.0 && trans.z == 0.0 {
            return Err(Error::DegenerateInitialization(id));
        }
        self.points.insert(
            id,
            PointVertex {
                trans,
                fixed,
                injected: false,
            },
        );
        Ok(())
    }

    /// Connect a point and a pose through a 2D measurement with information
    /// `weight * I`.
    pub fn add_edge(&mut self, point: u64, pose: i64, u: f64, v: f64, weight: f64) -> Result<()> {
        if !self.points.contains_key(&point) {
            return Err(Error::UnknownPoint(point));
        }
        if !self.poses.contains_key(&pose) {
            return Err(Error::UnknownPose(pose));
        }
        self.edges.push(Edge {
            point,
            pose,
            meas: Vector2::new(u, v),
            weight,
        });
        Ok(())
    }

    pub fn set_pose_fixed(&mut self, id: i64, fixed: bool) -> Result<()> {
        self.poses
            .get_mut(&id)
            .map(|v| v.fixed = fixed)
            .ok_or(Error::UnknownPose(id))
    }

    pub fn set_point_fixed(&mut self, id: u64, fixed: bool) -> Result<()> {
        self.points
            .get_mut(&id)
            .map(|v| v.fixed = fixed)
            .ok_or(Error::UnknownPoint(id))
    }

    /// Pose estimate for a caller-added vertex (deep copy).
    pub fn pose_estimate(&self, id: i64) -> Option<Pose> {
        self.poses
            .get(&id)
            .filter(|v| !v.injected)
            .map(|v| v.pose.clone())
    }

    /// Point estimate for a caller-added vertex (deep copy).
    pub fn point_estimate(&self, id: u64) -> Option<Vector3<f64>> {
        self.points
            .get(&id)
            .filter(|v| !v.injected)
            .map(|v| v.trans)
    }

    /// All caller-added estimates.
    pub fn estimates(&self) -> (BTreeMap<i64, Pose>, BTreeMap<u64, Vector3<f64>>) {
        let poses = self
            .poses
            .iter()
            .filter(|(_, v)| !v.injected)
            .map(|(id, v)| (*id, v.pose.clone()))
            .collect();
        let points = self
            .points
            .iter()
            .filter(|(_, v)| !v.injected)
            .map(|(id, v)| (*id, v.trans))
            .collect();
        (poses, points)
    }

    /// Reprojection of a world point under a pose, with this instance's
    /// intrinsics (no behind-camera guard, matching the residual definition).
    pub fn projection(&self, pose: &Pose, point: &Vector3<f64>) -> (f64, f64) {
        let px = self.camera.project_unchecked(pose, point);
        (px.x, px.y)
    }

    /// Run up to `max_iterations` Levenberg-Marquardt iterations (the
    /// construction-time cap when `None`). Returns the number of iterations
    /// actually executed.
    pub fn optimize(&mut self, max_iterations: Option<usize>) -> usize {
        let iters = max_iterations.unwrap_or(self.max_iterations);
        if !self.injected && !self.poses.values().any(|v| !v.fixed) {
            self.inject_synthetic_pose();
            self.injected = true;
        }
        self.run_lm(iters)
    }

    /// Point-only refinement: every pose is treated as fixed and each free
    /// point is polished independently against its own edges.
    pub fn optimize_structure_only(&mut self, iterations: usize) {
        self.run_structure_only(iterations)
    }

    /// With no free pose the normal equations have no pose block to factor.
    /// A synthetic free pose at the identity plus a point straight ahead at
    /// `max_depth`, observed at the image center, gives the solver a
    /// zero-residual subproblem to optimize instead.
    fn inject_synthetic_pose(&mut self) {
        let max_id = self.poses.keys().max().copied().unwrap_or(0);
        let pose_id = max_id + INJECTED_ID_GAP + 1;
        let point_id = self
            .points
            .keys()
            .max()
            .copied()
            .unwrap_or(0)
            .wrapping_add(INJECTED_ID_GAP as u64 + 2);
        self.poses.insert(
            pose_id,
            PoseVertex {
                pose: Pose::identity(),
                fixed: false,
                injected: true,
            },
        );
        self.points.insert(
            point_id,
            PointVertex {
                trans: Vector3::new(0.0, 0.0, self.max_depth),
                fixed: false,
                injected: true,
            },
        );
        self.edges.push(Edge {
            point: point_id,
            pose: pose_id,
            meas: Vector2::zeros(),
            weight: 1.0,
        });
        tracing::debug!("all poses fixed; injected synthetic pose {pose_id}");
    }
}

/// Skew-symmetric cross-product matrix of `v`.
fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Apply a tangent-space increment to a pose.
fn apply_increment(pose: &mut Pose, dof: PoseDof, dx: &[f64]) {
    pose.trans.x += dx[0];
    pose.trans.y += dx[1];
    pose.trans.z += dx[2];
    if dof == PoseDof::Six {
        let delta = Vector3::new(dx[3], dx[4], dx[5]);
        pose.rot = pose.rot * UnitQuaternion::from_scaled_axis(delta);
    }
}
