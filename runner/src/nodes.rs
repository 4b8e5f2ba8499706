use itertools::Itertools;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Host name must not be empty")]
    EmptyHost,
    #[error("Host {0} needs at least one slot")]
    NoSlots(String),
    #[error("No node at index {0}")]
    OutOfRange(usize),
    #[error("Node set contains no nodes")]
    Empty,
}

/// A single compute node with the number of worker slots it contributes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEntry {
    host: String,
    slots: u32,
}

impl NodeEntry {
    /// create a validated entry, the host is trimmed before it is checked
    pub fn new(host: &str, slots: u32) -> Result<Self, NodeError> {
        let host = host.trim();

        if host.is_empty() {
            Err(NodeError::EmptyHost)
        } else if slots == 0 {
            Err(NodeError::NoSlots(host.to_owned()))
        } else {
            Ok(Self {
                host: host.to_owned(),
                slots,
            })
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }
}

impl fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.slots)
    }
}

/// Ordered cluster topology as handed to the launcher
///
/// Entries can only be created through `NodeEntry::new`, so every entry in a set
/// already has a non-empty host and at least one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    entries: Vec<NodeEntry>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: NodeEntry) {
        self.entries.push(entry);
    }

    /// add a row from raw user input
    pub fn add(&mut self, host: &str, slots: u32) -> Result<(), NodeError> {
        self.push(NodeEntry::new(host, slots)?);

        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<NodeEntry, NodeError> {
        if index < self.entries.len() {
            Ok(self.entries.remove(index))
        } else {
            Err(NodeError::OutOfRange(index))
        }
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_slots(&self) -> u32 {
        self.entries.iter().map(NodeEntry::slots).sum()
    }

    /// a set is launchable once it has at least one entry and one slot
    pub fn validate(&self) -> Result<u32, NodeError> {
        match self.total_slots() {
            0 => Err(NodeError::Empty),
            total => Ok(total),
        }
    }

    pub fn hosts(&self) -> String {
        self.entries.iter().map(NodeEntry::host).join(",")
    }
}
