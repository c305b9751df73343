//! Levenberg-Marquardt iteration with Schur-complement point marginalization.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Vector2, Vector3};

use slam_geom::Pose;

use crate::{skew, apply_increment, BundleAdjustment, PoseDof, HUBER_DELTA};

/// Relative chi2 improvement below which iteration stops.
const REL_IMPROVEMENT_EPS: f64 = 1e-10;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;
const MAX_STEP_ATTEMPTS: usize = 10;

/// One linearized reprojection edge. Jacobians are dynamically sized so the
/// 3-DOF and 6-DOF pose variants share one assembly path.
struct EdgeLin {
    /// Predicted measurement.
    h: Vector2<f64>,
    /// Jacobian with respect to the pose parameters (2 x pose_dim).
    j_pose: DMatrix<f64>,
    /// Jacobian with respect to the point (2 x 3).
    j_point: DMatrix<f64>,
}

fn linearize(
    focal: f64,
    cx: f64,
    cy: f64,
    pose: &Pose,
    point: &Vector3<f64>,
    dof: PoseDof,
) -> Option<EdgeLin> {
    let r = pose.rot.to_rotation_matrix();
    let r_t = r.matrix().transpose();
    let xc = r_t * (point - pose.trans);
    let z = xc.z;
    if z.abs() < 1e-12 {
        return None;
    }
    let zinv = 1.0 / z;
    let h = Vector2::new(focal * xc.x * zinv + cx, focal * xc.y * zinv + cy);
    let pmat = Matrix2x3::new(
        focal * zinv,
        0.0,
        -focal * xc.x * zinv * zinv,
        0.0,
        focal * zinv,
        -focal * xc.y * zinv * zinv,
    );
    let j_point_s = pmat * r_t;
    let pd = dof.dim();
    let mut j_pose = DMatrix::zeros(2, pd);
    j_pose.view_mut((0, 0), (2, 3)).copy_from(&(-j_point_s));
    if dof == PoseDof::Six {
        j_pose.view_mut((0, 3), (2, 3)).copy_from(&(pmat * skew(&xc)));
    }
    let j_point = DMatrix::from_iterator(2, 3, j_point_s.iter().cloned());
    Some(EdgeLin { h, j_pose, j_point })
}

/// Huber cost of a squared, information-weighted error.
fn robust_cost(s: f64) -> f64 {
    let d2 = HUBER_DELTA * HUBER_DELTA;
    if s <= d2 {
        s
    } else {
        2.0 * HUBER_DELTA * s.sqrt() - d2
    }
}

/// IRLS weight of the Huber kernel at squared error `s`.
fn robust_weight(s: f64) -> f64 {
    let d2 = HUBER_DELTA * HUBER_DELTA;
    if s <= d2 {
        1.0
    } else {
        HUBER_DELTA / s.sqrt()
    }
}

struct NormalEquations {
    /// Diagonal pose blocks, keyed by free-pose index.
    a: BTreeMap<usize, DMatrix<f64>>,
    /// Pose-point coupling blocks grouped by free-point index.
    b: BTreeMap<usize, Vec<(usize, DMatrix<f64>)>>,
    /// Point blocks.
    c: Vec<Matrix3<f64>>,
    b_pose: DVector<f64>,
    b_point: Vec<Vector3<f64>>,
}

impl BundleAdjustment {
    fn total_chi2(&self) -> f64 {
        let mut chi2 = 0.0;
        for edge in &self.edges {
            let pose = &self.poses[&edge.pose].pose;
            let point = &self.points[&edge.point].trans;
            let (u, v) = self.projection(pose, point);
            let r = edge.meas - Vector2::new(u, v);
            let s = edge.weight * r.norm_squared();
            if !s.is_finite() {
                return f64::INFINITY;
            }
            chi2 += robust_cost(s);
        }
        chi2
    }

    fn assemble(
        &self,
        free_poses: &BTreeMap<i64, usize>,
        free_points: &BTreeMap<u64, usize>,
    ) -> NormalEquations {
        let pd = self.dof.dim();
        let mut eqs = NormalEquations {
            a: BTreeMap::new(),
            b: BTreeMap::new(),
            c: vec![Matrix3::zeros(); free_points.len()],
            b_pose: DVector::zeros(free_poses.len() * pd),
            b_point: vec![Vector3::zeros(); free_points.len()],
        };
        for edge in &self.edges {
            let pose_idx = free_poses.get(&edge.pose);
            let point_idx = free_points.get(&edge.point);
            if pose_idx.is_none() && point_idx.is_none() {
                continue;
            }
            let pose = &self.poses[&edge.pose].pose;
            let point = &self.points[&edge.point].trans;
            let lin = match linearize(
                self.camera.focal,
                self.camera.cx,
                self.camera.cy,
                pose,
                point,
                self.dof,
            ) {
                Some(lin) => lin,
                None => continue,
            };
            let r = edge.meas - lin.h;
            let s = edge.weight * r.norm_squared();
            let omega = edge.weight * robust_weight(s);

            if let Some(&pi) = pose_idx {
                let a = eqs
                    .a
                    .entry(pi)
                    .or_insert_with(|| DMatrix::zeros(pd, pd));
                *a += lin.j_pose.transpose() * &lin.j_pose * omega;
                let g = lin.j_pose.transpose() * r * omega;
                let mut seg = eqs.b_pose.rows_mut(pi * pd, pd);
                seg += g;
            }
            if let Some(&li) = point_idx {
                eqs.c[li] += lin.j_point.transpose() * &lin.j_point * omega;
                eqs.b_point[li] += lin.j_point.transpose() * r * omega;
            }
            if let (Some(&pi), Some(&li)) = (pose_idx, point_idx) {
                let coupling = lin.j_pose.transpose() * &lin.j_point * omega;
                eqs.b.entry(li).or_default().push((pi, coupling));
            }
        }
        // Duplicate (pose, point) pairs can arise from repeated edges; sum
        // them so the Schur pass sees one block per pair.
        for obs in eqs.b.values_mut() {
            obs.sort_by_key(|(pi, _)| *pi);
            let mut merged: Vec<(usize, DMatrix<f64>)> = Vec::with_capacity(obs.len());
            for (pi, block) in obs.drain(..) {
                match merged.last_mut() {
                    Some((last_pi, last)) if *last_pi == pi => *last += block,
                    _ => merged.push((pi, block)),
                }
            }
            *obs = merged;
        }
        eqs
    }

    /// Solve the damped normal equations by marginalizing the point blocks.
    /// Returns pose and point increments, or `None` when the reduced system
    /// cannot be factored at this damping.
    fn solve_schur(
        &self,
        eqs: &NormalEquations,
        free_poses: &BTreeMap<i64, usize>,
        free_points: &BTreeMap<u64, usize>,
        lambda: f64,
    ) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
        let pd = self.dof.dim();
        let n = free_poses.len() * pd;
        let mut s = DMatrix::zeros(n, n);
        for (pi, a) in &eqs.a {
            s.view_mut((pi * pd, pi * pd), (pd, pd)).copy_from(a);
        }
        for i in 0..n {
            s[(i, i)] += lambda;
        }
        let mut rhs = eqs.b_pose.clone();

        let mut c_inv = vec![Matrix3::zeros(); free_points.len()];
        for li in 0..free_points.len() {
            let c_aug = eqs.c[li] + Matrix3::identity() * lambda;
            c_inv[li] = c_aug.try_inverse()?;
        }
        for (li, obs) in &eqs.b {
            let cinv = &c_inv[*li];
            for (pi, bi) in obs {
                let contrib = bi * cinv * eqs.b_point[*li];
                let mut seg = rhs.rows_mut(pi * pd, pd);
                seg -= contrib;
                for (pj, bj) in obs {
                    let block = bi * cinv * bj.transpose();
                    let mut view = s.view_mut((pi * pd, pj * pd), (pd, pd));
                    view -= block;
                }
            }
        }

        let dx_pose = if n > 0 {
            nalgebra::Cholesky::new(s)?.solve(&rhs)
        } else {
            DVector::zeros(0)
        };

        let mut dx_point = vec![Vector3::zeros(); free_points.len()];
        for li in 0..free_points.len() {
            let mut rhs_l = eqs.b_point[li];
            if let Some(obs) = eqs.b.get(&li) {
                for (pi, bi) in obs {
                    let dxp = dx_pose.rows(pi * pd, pd);
                    rhs_l -= bi.transpose() * dxp;
                }
            }
            dx_point[li] = c_inv[li] * rhs_l;
        }
        Some((dx_pose, dx_point))
    }

    pub(crate) fn run_lm(&mut self, max_iterations: usize) -> usize {
        let pd = self.dof.dim();
        let free_poses: BTreeMap<i64, usize> = self
            .poses
            .iter()
            .filter(|(_, v)| !v.fixed)
            .enumerate()
            .map(|(idx, (id, _))| (*id, idx))
            .collect();
        let free_points: BTreeMap<u64, usize> = self
            .points
            .iter()
            .filter(|(_, v)| !v.fixed)
            .enumerate()
            .map(|(idx, (id, _))| (*id, idx))
            .collect();
        if free_poses.is_empty() && free_points.is_empty() {
            return 0;
        }

        let mut chi2 = self.total_chi2();
        let mut lambda = 0.0;
        let mut iters = 0;

        for _ in 0..max_iterations {
            let eqs = self.assemble(&free_poses, &free_points);
            if lambda == 0.0 {
                let mut max_diag: f64 = 0.0;
                for a in eqs.a.values() {
                    for i in 0..pd {
                        max_diag = max_diag.max(a[(i, i)]);
                    }
                }
                for c in &eqs.c {
                    for i in 0..3 {
                        max_diag = max_diag.max(c[(i, i)]);
                    }
                }
                lambda = (1e-5 * max_diag).max(LAMBDA_MIN);
            }

            let backup_poses: Vec<(i64, Pose)> = free_poses
                .keys()
                .map(|id| (*id, self.poses[id].pose.clone()))
                .collect();
            let backup_points: Vec<(u64, Vector3<f64>)> = free_points
                .keys()
                .map(|id| (*id, self.points[id].trans))
                .collect();

            let mut accepted = false;
            for _ in 0..MAX_STEP_ATTEMPTS {
                let (dx_pose, dx_point) =
                    match self.solve_schur(&eqs, &free_poses, &free_points, lambda) {
                        Some(sol) => sol,
                        None => {
                            lambda = (lambda * 10.0).min(LAMBDA_MAX);
                            continue;
                        }
                    };
                for (id, pi) in &free_poses {
                    let seg: Vec<f64> = dx_pose.rows(pi * pd, pd).iter().copied().collect();
                    let vertex = self.poses.get_mut(id).expect("free pose present");
                    apply_increment(&mut vertex.pose, self.dof, &seg);
                }
                for (id, li) in &free_points {
                    let vertex = self.points.get_mut(id).expect("free point present");
                    vertex.trans += dx_point[*li];
                }
                let new_chi2 = self.total_chi2();
                if new_chi2.is_finite() && new_chi2 <= chi2 {
                    let improvement = chi2 - new_chi2;
                    chi2 = new_chi2;
                    lambda = (lambda / 3.0).max(LAMBDA_MIN);
                    accepted = true;
                    iters += 1;
                    if improvement < REL_IMPROVEMENT_EPS * (chi2 + REL_IMPROVEMENT_EPS) {
                        return iters;
                    }
                    break;
                }
                // Revert and retry with stronger damping.
                for (id, pose) in &backup_poses {
                    self.poses.get_mut(id).expect("pose present").pose = pose.clone();
                }
                for (id, trans) in &backup_points {
                    self.points.get_mut(id).expect("point present").trans = *trans;
                }
                lambda = (lambda * 10.0).min(LAMBDA_MAX);
                if lambda >= LAMBDA_MAX {
                    break;
                }
            }
            if !accepted {
                tracing::trace!(chi2, lambda, "no acceptable step, stopping");
                break;
            }
        }
        iters
    }

    pub(crate) fn run_structure_only(&mut self, iterations: usize) {
        let free_points: Vec<u64> = self
            .points
            .iter()
            .filter(|(_, v)| !v.fixed)
            .map(|(id, _)| *id)
            .collect();
        for point_id in free_points {
            let edges: Vec<usize> = self
                .edges
                .iter()
                .enumerate()
                .filter(|(_, e)| e.point == point_id)
                .map(|(i, _)| i)
                .collect();
            if edges.is_empty() {
                continue;
            }
            let mut lambda = 1e-9;
            for _ in 0..iterations {
                let trans = self.points[&point_id].trans;
                let mut h = Matrix3::zeros();
                let mut g = Vector3::zeros();
                let mut chi2 = 0.0;
                for &ei in &edges {
                    let edge = &self.edges[ei];
                    let pose = &self.poses[&edge.pose].pose;
                    let lin = match linearize(
                        self.camera.focal,
                        self.camera.cx,
                        self.camera.cy,
                        pose,
                        &trans,
                        self.dof,
                    ) {
                        Some(lin) => lin,
                        None => continue,
                    };
                    let r = edge.meas - lin.h;
                    let s = edge.weight * r.norm_squared();
                    let omega = edge.weight * robust_weight(s);
                    h += lin.j_point.transpose() * &lin.j_point * omega;
                    g += lin.j_point.transpose() * r * omega;
                    chi2 += robust_cost(s);
                }
                let h_aug = h + Matrix3::identity() * lambda;
                let dx = match h_aug.try_inverse() {
                    Some(inv) => inv * g,
                    None => {
                        lambda *= 10.0;
                        continue;
                    }
                };
                let candidate = trans + dx;
                let new_chi2: f64 = edges
                    .iter()
                    .map(|&ei| {
                        let edge = &self.edges[ei];
                        let pose = &self.poses[&edge.pose].pose;
                        let (u, v) = self.projection(pose, &candidate);
                        let r = edge.meas - Vector2::new(u, v);
                        robust_cost(edge.weight * r.norm_squared())
                    })
                    .sum();
                if new_chi2.is_finite() && new_chi2 <= chi2 {
                    self.points.get_mut(&point_id).expect("point present").trans = candidate;
                    lambda = (lambda / 3.0).max(LAMBDA_MIN);
                } else {
                    lambda = (lambda * 10.0).min(LAMBDA_MAX);
                }
            }
        }
    }
}
