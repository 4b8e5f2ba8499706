use crate::executors::ExecutorError;
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// image formats the worker accepts
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

static SUPPORTED_GLOB: Lazy<GlobMatcher> = Lazy::new(|| {
    GlobBuilder::new(&format!("*.{{{}}}", SUPPORTED_EXTENSIONS.join(",")))
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .expect("extension glob is a constant and always valid")
        .compile_matcher()
});

/// Work items found in the top level of an input directory
#[derive(Debug, Clone)]
pub struct WorkItems {
    pub paths: Vec<PathBuf>,
}

impl WorkItems {
    /// Scan `directory` (not recursively) for images the worker can process
    ///
    /// Hidden and ignored files are not filtered, the worker sees the whole directory.
    pub fn collect(directory: &Path) -> Result<Self, ExecutorError> {
        if !directory.is_dir() {
            return Err(ExecutorError::InvalidInput(directory.to_path_buf()));
        }

        let paths = WalkBuilder::new(directory)
            .standard_filters(false)
            .max_depth(Some(1))
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!(error = ?error, "Failed to inspect entry of input directory");
                    None
                }
            })
            .filter(|entry| entry.depth() == 1 && entry.file_type().map_or(false, |t| t.is_file()))
            .filter(|entry| is_supported(entry.path()))
            .map(DirEntry::into_path)
            .sorted()
            .collect_vec();

        debug!(directory = ?directory, items = paths.len(), "Collected work items");

        if paths.is_empty() {
            Err(ExecutorError::NoWorkItems(directory.to_path_buf()))
        } else {
            Ok(Self { paths })
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// check the file name against the supported extensions, ignoring case
pub fn is_supported(path: &Path) -> bool {
    path.file_name()
        .map_or(false, |name| SUPPORTED_GLOB.is_match(Path::new(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs;

    #[test]
    fn supported_extensions_ignore_case() {
        assert!(is_supported(Path::new("000001.bmp")));
        assert!(is_supported(Path::new("dir/photo.JPG")));
        assert!(is_supported(Path::new("scan.Jpeg")));
        assert!(is_supported(Path::new("a.png")));
        assert!(!is_supported(Path::new("notes.txt")));
        assert!(!is_supported(Path::new("archive.png.gz")));
        assert!(!is_supported(Path::new("bmp")));
    }

    #[test]
    fn collect_counts_top_level_images() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.bmp", "b.PNG", ".hidden.jpg", "readme.md"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.png")).unwrap();
        fs::write(dir.path().join("nested.png").join("c.bmp"), b"x").unwrap();

        let items = WorkItems::collect(dir.path()).unwrap();

        assert_eq!(items.len(), 3);
    }

    #[test]
    fn collect_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        assert_matches!(WorkItems::collect(&missing), Err(ExecutorError::InvalidInput(path)) if path == missing);
    }

    #[test]
    fn collect_rejects_file_as_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bmp");
        fs::write(&file, b"x").unwrap();

        assert_matches!(WorkItems::collect(&file), Err(ExecutorError::InvalidInput(_)));
    }

    #[test]
    fn collect_without_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.md"), b"x").unwrap();

        assert_matches!(WorkItems::collect(dir.path()), Err(ExecutorError::NoWorkItems(_)));
    }
}
