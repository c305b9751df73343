//! Shared plain types for the monocular SLAM core: the typed configuration
//! surface, per-frame processing status codes, and the keypoint exchange
//! format handed over by the feature-extraction stage.

#![deny(rust_2018_idioms)]

use std::collections::BTreeMap;

use thiserror::Error;

mod config;
mod export;

pub use config::{BaOption, ConfigError, SlamConfig};
pub use export::{
    expand_tree, flatten_tree, ExportData, IndexNode, Keypoint, MAX_KPS, MAX_TREES,
};

/// Descriptor distances at or beyond this value are treated as "no match".
pub const INFINITE_DISTANCE: f64 = 99999.0;

/// Binary feature descriptor, 32 bytes (256 bits).
#[derive(Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Hamming distance between two descriptors.
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Outcome of processing one frame.
///
/// Negative codes are recoverable: the caller may keep feeding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum ProcessStatus {
    NotEnoughLandmarksForValid = -7,
    MatchInvalid = -6,
    NotEnoughMatchFrames = -5,
    DidNotMatchAllFrames = -4,
    NotEnoughLandmarks = -3,
    AlreadyInitialized = -2,
    NotInitialized = -1,
    Default = 0,
    ValidMatch = 1,
}

impl ProcessStatus {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ProcessStatus::ValidMatch)
    }
}

impl From<ProcessStatus> for i32 {
    fn from(orig: ProcessStatus) -> i32 {
        orig.code()
    }
}

#[derive(Error, Debug)]
pub enum TypesError {
    #[error("keypoint budget exceeded: {0} > {MAX_KPS}")]
    TooManyKeypoints(usize),
    #[error("tree budget exceeded: {0} > {MAX_TREES}")]
    TooManyTrees(usize),
    #[error("malformed tree encoding: {0}")]
    MalformedTree(&'static str),
}

pub type Result<T> = std::result::Result<T, TypesError>;

/// Convenience used by tests and embedders to build the string-keyed
/// configuration mapping of the external interface.
pub fn entries_from_pairs<'a, I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hamming() {
        let a = Descriptor([0u8; 32]);
        let mut b = Descriptor([0u8; 32]);
        assert_eq!(a.hamming(&b), 0);
        b.0[0] = 0b1010_1010;
        b.0[31] = 0xff;
        assert_eq!(a.hamming(&b), 12);
        assert_eq!(b.hamming(&a), 12);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ProcessStatus::ValidMatch.code(), 1);
        assert_eq!(ProcessStatus::Default.code(), 0);
        assert_eq!(ProcessStatus::NotEnoughMatchFrames.code(), -5);
        assert_eq!(ProcessStatus::MatchInvalid.code(), -6);
        assert_eq!(ProcessStatus::NotEnoughLandmarksForValid.code(), -7);
        assert!(ProcessStatus::ValidMatch.is_valid());
        assert!(!ProcessStatus::MatchInvalid.is_valid());
    }
}
