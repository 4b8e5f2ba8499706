use crate::nodes::{NodeError, NodeSet};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    ops::RangeInclusive,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Kernel size {0} is outside of {min}..={max}", min = KernelSize::RANGE.start(), max = KernelSize::RANGE.end())]
pub struct KernelSizeError(pub u32);

/// Blur kernel edge length passed through to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct KernelSize(u32);

impl KernelSize {
    pub const RANGE: RangeInclusive<u32> = 1..=255;
    pub const DEFAULT: KernelSize = KernelSize(55);

    pub fn new(size: u32) -> Result<Self, KernelSizeError> {
        if Self::RANGE.contains(&size) {
            Ok(Self(size))
        } else {
            Err(KernelSizeError(size))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for KernelSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for KernelSize {
    type Error = KernelSizeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KernelSize> for u32 {
    fn from(value: KernelSize) -> Self {
        value.get()
    }
}

impl fmt::Display for KernelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable description of a single run
///
/// The node set is a snapshot taken when the run is requested, later edits to the
/// orchestrator's node table do not reach a job that is already in flight.
#[derive(Debug, Clone)]
pub struct JobSpec {
    input_directory: PathBuf,
    kernel_size: KernelSize,
    machine_file_path: PathBuf,
    nodes: NodeSet,
    total_slots: u32,
}

impl JobSpec {
    pub fn new(
        input_directory: impl Into<PathBuf>,
        kernel_size: KernelSize,
        machine_file_path: impl Into<PathBuf>,
        nodes: NodeSet,
    ) -> Result<Self, NodeError> {
        let total_slots = nodes.validate()?;

        Ok(Self {
            input_directory: input_directory.into(),
            kernel_size,
            machine_file_path: machine_file_path.into(),
            nodes,
            total_slots,
        })
    }

    pub fn input_directory(&self) -> &Path {
        &self.input_directory
    }

    pub fn kernel_size(&self) -> KernelSize {
        self.kernel_size
    }

    pub fn machine_file_path(&self) -> &Path {
        &self.machine_file_path
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    pub fn total_slots(&self) -> u32 {
        self.total_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_size_bounds() {
        assert_eq!(KernelSize::new(1).unwrap().get(), 1);
        assert_eq!(KernelSize::new(255).unwrap().get(), 255);
        assert_eq!(KernelSize::new(0), Err(KernelSizeError(0)));
        assert_eq!(KernelSize::new(256), Err(KernelSizeError(256)));
        assert_eq!(KernelSize::default().get(), 55);
    }

    #[test]
    fn kernel_size_from_yaml() {
        let size: KernelSize = serde_yaml::from_str("31").unwrap();
        assert_eq!(size.get(), 31);
        assert!(serde_yaml::from_str::<KernelSize>("1000").is_err());
    }

    #[test]
    fn spec_requires_slots() {
        assert_eq!(
            JobSpec::new("in", KernelSize::DEFAULT, "machinefile", NodeSet::new()).unwrap_err(),
            NodeError::Empty
        );

        let mut nodes = NodeSet::new();
        nodes.add("node1", 4).unwrap();
        nodes.add("node2", 2).unwrap();
        let spec = JobSpec::new("in", KernelSize::DEFAULT, "machinefile", nodes).unwrap();

        assert_eq!(spec.total_slots(), 6);
        assert_eq!(spec.input_directory(), Path::new("in"));
    }
}
