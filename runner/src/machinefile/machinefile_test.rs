use super::{decode, encode, load, save, DecodeMode, MachineFileError};
use crate::nodes::{NodeError, NodeSet};
use assert_matches::assert_matches;

fn cluster() -> NodeSet {
    let mut nodes = NodeSet::new();
    nodes.add("node1", 4).unwrap();
    nodes.add("node2", 2).unwrap();
    nodes
}

#[test]
pub fn encode_two_nodes() {
    assert_eq!(encode(&cluster()), "node1:4\nnode2:2\n");
}

#[test]
pub fn encode_empty_set() {
    assert_eq!(encode(&NodeSet::new()), "");
}

#[test]
pub fn decode_roundtrip_keeps_order() {
    let mut nodes = cluster();
    nodes.add("10.0.0.7", 16).unwrap();
    nodes.add("node0", 1).unwrap();

    for mode in [DecodeMode::Strict, DecodeMode::Lenient] {
        assert_eq!(decode(&encode(&nodes), mode).unwrap(), nodes);
    }
}

#[test]
pub fn decode_skips_blank_lines_and_extra_columns() {
    let content = "\n  node1:4  \n\n# spare nodes\nnode2:2:ib0\n\n";
    let nodes = decode(content, DecodeMode::Strict).unwrap();

    assert_eq!(nodes, cluster());
    assert_eq!(encode(&nodes), "node1:4\nnode2:2\n");
}

#[test]
pub fn decode_empty_content() {
    assert!(decode("", DecodeMode::Strict).unwrap().is_empty());
    assert!(decode("\n\n   \n", DecodeMode::Lenient).unwrap().is_empty());
}

#[test]
pub fn missing_separator_depends_on_mode() {
    let content = "node1:4\nlocalhost\nnode2:2\n";

    assert_eq!(decode(content, DecodeMode::Lenient).unwrap(), cluster());
    assert_matches!(
        decode(content, DecodeMode::Strict),
        Err(MachineFileError::MissingSeparator { line: 2, ref content }) if content == "localhost"
    );
}

#[test]
pub fn invalid_slots_are_rejected_in_both_modes() {
    for mode in [DecodeMode::Strict, DecodeMode::Lenient] {
        assert_matches!(
            decode("node1:0\n", mode),
            Err(MachineFileError::InvalidSlots { line: 1, .. })
        );
        assert_matches!(
            decode("node1:4\nnode2:two\n", mode),
            Err(MachineFileError::InvalidSlots { line: 2, ref slots }) if slots == "two"
        );
        assert_matches!(
            decode("node1:\n", mode),
            Err(MachineFileError::InvalidSlots { line: 1, .. })
        );
    }
}

#[test]
pub fn empty_host_is_rejected() {
    assert_matches!(
        decode("  :4\n", DecodeMode::Lenient),
        Err(MachineFileError::InvalidNode {
            line: 1,
            source: NodeError::EmptyHost
        })
    );
}

#[test]
pub fn load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machinefile");

    assert!(load(&path, DecodeMode::Lenient).unwrap().is_empty());
    assert_matches!(load(&path, DecodeMode::Strict), Err(MachineFileError::Io(_)));
}

#[test]
pub fn save_replaces_previous_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machinefile");
    std::fs::write(&path, "stale:9\nold:1\n").unwrap();

    save(&path, &cluster()).unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "node1:4\nnode2:2\n");
    assert_eq!(load(&path, DecodeMode::Strict).unwrap(), cluster());
    // only the machine-file itself is left behind
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}
