use serde::Serialize;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, trace};

/// Best effort telemetry reported by the worker, values are kept as formatted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub reads: Option<String>,
    pub writes: Option<String>,
    pub pixels_per_second: Option<String>,
    pub estimated_mips: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricField {
    Reads,
    Writes,
    PixelsPerSecond,
    EstimatedMips,
}

/// line prefixes of the worker's report, these have to match the worker byte for byte
const LABELS: [(&str, MetricField); 4] = [
    ("Total de localidades leídas", MetricField::Reads),
    ("Total de localidades escritas", MetricField::Writes),
    ("Pixeles procesados por segundo", MetricField::PixelsPerSecond),
    ("Rendimiento estimado", MetricField::EstimatedMips),
];

impl MetricsSnapshot {
    fn field_mut(&mut self, field: MetricField) -> &mut Option<String> {
        match field {
            MetricField::Reads => &mut self.reads,
            MetricField::Writes => &mut self.writes,
            MetricField::PixelsPerSecond => &mut self.pixels_per_second,
            MetricField::EstimatedMips => &mut self.estimated_mips,
        }
    }

    /// Overwrite every field reported in `content`, other fields keep their value
    ///
    /// The value is the text after the first `:` of a line starting with a known
    /// label. Lines with an empty value are treated as not reported yet, which covers
    /// a line the worker is still in the middle of writing.
    pub fn update(&mut self, content: &str) -> usize {
        let mut updated = 0;

        for line in content.lines().map(str::trim) {
            let Some((_, field)) = LABELS.iter().find(|(label, _)| line.starts_with(label)) else {
                continue;
            };

            match line.split_once(':').map(|(_, value)| value.trim()) {
                Some(value) if !value.is_empty() => {
                    *self.field_mut(*field) = Some(value.to_owned());
                    updated += 1;
                }
                _ => trace!(line, "Skipping metric line without value"),
            }
        }

        updated
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Polls the report file the worker writes next to its output
#[derive(Debug, Clone)]
pub struct MetricsReader {
    path: PathBuf,
    snapshot: MetricsSnapshot,
}

impl MetricsReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: MetricsSnapshot::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &MetricsSnapshot {
        &self.snapshot
    }

    /// Re-read the report, safe to call at any time and as often as needed
    ///
    /// A missing or unreadable file (the worker may be writing it right now) is not an
    /// error, the previous snapshot is returned unchanged.
    pub fn read(&mut self) -> &MetricsSnapshot {
        match fs::read(&self.path) {
            Ok(content) => {
                // a write in progress may end in the middle of a character
                let updated = self.snapshot.update(&String::from_utf8_lossy(&content));
                trace!(path = ?self.path, updated, "Read metrics");
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                trace!(path = ?self.path, "No metrics reported yet");
            }
            Err(error) => {
                debug!(path = ?self.path, error = %error, "Metrics not readable, keeping previous snapshot");
            }
        }

        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const FULL_REPORT: &str = "\
Imagen 000001: Lecturas=1200, Escrituras=7200, Bytes/s=1234.00
Total de localidades leídas: 1200
Total de localidades escritas: 7200
Pixeles procesados por segundo: 5400.25
Rendimiento estimado (MIPS): 12.3456
";

    #[test]
    fn missing_file_gives_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = MetricsReader::new(dir.path().join("estadisticas.txt"));

        assert!(reader.read().is_empty());
    }

    #[test]
    fn all_four_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estadisticas.txt");
        fs::write(&path, FULL_REPORT).unwrap();

        let mut reader = MetricsReader::new(&path);

        assert_eq!(
            reader.read(),
            &MetricsSnapshot {
                reads: Some("1200".into()),
                writes: Some("7200".into()),
                pixels_per_second: Some("5400.25".into()),
                // the label text after the prefix is free form, the value follows the colon
                estimated_mips: Some("12.3456".into()),
            }
        );
    }

    #[test]
    fn only_present_fields_are_populated() {
        let mut snapshot = MetricsSnapshot::default();

        assert_eq!(snapshot.update(""), 0);
        assert!(snapshot.is_empty());

        assert_eq!(snapshot.update("Total de localidades escritas: 99\n"), 1);
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                writes: Some("99".into()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn absent_lines_keep_previous_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estadisticas.txt");
        let mut reader = MetricsReader::new(&path);

        fs::write(&path, FULL_REPORT).unwrap();
        let before = reader.read().clone();

        fs::write(&path, "Pixeles procesados por segundo: 6000.00\n").unwrap();
        let after = reader.read().clone();

        assert_eq!(after.pixels_per_second.as_deref(), Some("6000.00"));
        assert_eq!(after.reads, before.reads);
        assert_eq!(after.writes, before.writes);
        assert_eq!(after.estimated_mips, before.estimated_mips);

        // the file vanishing does not reset anything either
        fs::remove_file(&path).unwrap();
        assert_eq!(reader.read(), &after);
    }

    #[test]
    fn partial_and_unknown_lines_are_ignored() {
        let mut snapshot = MetricsSnapshot::default();
        let updated = snapshot.update(
            "Tiempo total: 3.20 s, MIPS: 10.0000\nTotal de localidades leídas:\nTotal de localidades leí",
        );

        assert_eq!(updated, 0);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn unreadable_file_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estadisticas.txt");
        fs::write(&path, "Total de localidades leídas: 5\n").unwrap();

        let mut reader = MetricsReader::new(&path);
        let first = reader.read().clone();

        // a directory in place of the report makes the read fail with an I/O error
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert_eq!(reader.read(), &first);
        assert_eq!(first.reads.as_deref(), Some("5"));
    }
}
