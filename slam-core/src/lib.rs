//! Pose-and-landmark estimation core for monocular SLAM.
//!
//! For every incoming frame the pipeline selects reference frames from the
//! keyframe set, associates feature points against them through a descriptor
//! forest with a rotation-compensated geometric gate, triangulates candidate
//! correspondences into floating landmarks, runs repeated partial bundle
//! adjustments over random subsets, validates each result, and commits the
//! winner's inlier correspondences into the persistent map.
//!
//! Everything is single-threaded; one [Slam] instance owns the whole graph.

#![deny(rust_2018_idioms)]

use thiserror::Error;

mod ba_runner;
mod distance;
mod frames;
mod match_tree;
mod matcher;
mod pose;
mod slam;
mod store;
mod validator;

pub use ba_runner::{BaRunOutput, BaRunner};
pub use match_tree::build_forest;
pub use slam::Slam;
pub use store::{
    FeaturePoint, FpKey, Frame, FrameId, GraphStore, Landmark, LandmarkId, LandmarkTable,
};
pub use validator::{
    FpLandmarkResult, FpValidResult, ResultTable, ValidateResult, ValidatorOutput,
};

pub use slam_types::{ExportData, ProcessStatus, SlamConfig};

#[derive(Error, Debug)]
pub enum CoreError {
    /// A graph-store invariant broke and could not be repaired; indicates an
    /// upstream bug and is not recoverable.
    #[error("graph invariant violated: {0}")]
    InvariantViolation(String),
    #[error("unknown frame {0:?}")]
    UnknownFrame(FrameId),
    #[error("unknown landmark {0:?}")]
    UnknownLandmark(LandmarkId),
    #[error("unknown feature point {0:?}")]
    UnknownFeaturePoint(FpKey),
    #[error("bundle adjustment error: {0}")]
    Ba(#[from] slam_ba::Error),
    #[error("export data error: {0}")]
    Export(#[from] slam_types::TypesError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
