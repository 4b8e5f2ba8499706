use crate::nodes::{NodeEntry, NodeError, NodeSet};
use std::{
    ffi::OsString,
    fs,
    io::{self, ErrorKind},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
mod machinefile_test;

/// separator between host and slot count in a machine-file line
pub const SEPARATOR: char = ':';

#[derive(Error, Debug)]
pub enum MachineFileError {
    #[error("Failed to access machine-file: {0}")]
    Io(#[from] io::Error),
    #[error("Line {line}: expected `host:slots`, found {content:?}")]
    MissingSeparator { line: usize, content: String },
    #[error("Line {line}: slot count {slots:?} is not an integer >= 1")]
    InvalidSlots { line: usize, slots: String },
    #[error("Line {line}: {source}")]
    InvalidNode { line: usize, source: NodeError },
}

/// How to treat lines that have no separator at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// skip them, used when loading the configured machine-file on startup
    Lenient,
    /// report them, used when the user explicitly loads a file
    Strict,
}

/// Serialize a node set into the `host:slots` format of the launcher
pub fn encode(nodes: &NodeSet) -> String {
    nodes
        .entries()
        .iter()
        .fold(String::new(), |mut buffer, entry| {
            buffer.push_str(&entry.to_string());
            buffer.push('\n');
            buffer
        })
}

/// Parse machine-file content, blank lines and `#` comments are always skipped
pub fn decode(content: &str, mode: DecodeMode) -> Result<NodeSet, MachineFileError> {
    let mut nodes = NodeSet::new();

    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((host, rest)) = trimmed.split_once(SEPARATOR) else {
            match mode {
                DecodeMode::Lenient => {
                    debug!(line, content = trimmed, "Skipping machine-file line without separator");
                    continue;
                }
                DecodeMode::Strict => {
                    return Err(MachineFileError::MissingSeparator {
                        line,
                        content: trimmed.to_owned(),
                    })
                }
            }
        };

        // anything after the slot count (extra columns, trailing comments) is not ours
        let slots = rest
            .split(|c: char| c == SEPARATOR || c.is_whitespace())
            .next()
            .unwrap_or_default();

        let slots = match slots.parse::<u32>() {
            Ok(slots) if slots >= 1 => slots,
            _ => {
                return Err(MachineFileError::InvalidSlots {
                    line,
                    slots: slots.to_owned(),
                })
            }
        };

        nodes.push(
            NodeEntry::new(host, slots)
                .map_err(|source| MachineFileError::InvalidNode { line, source })?,
        );
    }

    Ok(nodes)
}

/// Load a machine-file from disk, a missing file is only tolerated in lenient mode
pub fn load(path: &Path, mode: DecodeMode) -> Result<NodeSet, MachineFileError> {
    match fs::read_to_string(path) {
        Ok(content) => decode(&content, mode),
        Err(error) if error.kind() == ErrorKind::NotFound && mode == DecodeMode::Lenient => {
            debug!(path = ?path, "No machine-file to load, starting with an empty node set");

            Ok(NodeSet::new())
        }
        Err(error) => Err(error.into()),
    }
}

/// Write the node set to `path`
///
/// The content is first written next to the target and then renamed over it, so a
/// launcher never observes a half written file.
pub fn save(path: &Path, nodes: &NodeSet) -> Result<(), MachineFileError> {
    let mut tmp_name = OsString::from(".");
    tmp_name.push(path.file_name().unwrap_or_default());
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, encode(nodes))?;

    if let Err(error) = fs::rename(&tmp_path, path) {
        warn!(path = ?path, error = ?error, "Failed to move machine-file into place");
        let _ = fs::remove_file(&tmp_path);

        return Err(error.into());
    }

    debug!(path = ?path, nodes = nodes.len(), "Wrote machine-file");

    Ok(())
}
