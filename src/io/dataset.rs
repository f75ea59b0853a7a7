//! Snapshot dataset recording
//!
//! Appends every published snapshot to a CSV file so recorded sessions can
//! be used to fit a crowdiness model offline. The header is written when
//! the file is created or empty.

use crate::domain::types::{iso_timestamp, OccupancySnapshot};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DATASET_HEADER: &str = "timestamp,doorway,motion_rate,avg_sound,avg_co2,crowdiness_index";

/// One CSV row
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub timestamp_ms: u64,
    pub doorway_id: String,
    pub motion_rate: f64,
    pub avg_sound: f64,
    pub avg_co2: f64,
    pub crowdiness_index: f64,
}

impl DatasetRow {
    pub fn from_snapshot(doorway_id: &str, snapshot: &OccupancySnapshot) -> Self {
        Self {
            timestamp_ms: snapshot.timestamp_ms,
            doorway_id: doorway_id.to_string(),
            motion_rate: snapshot.motion_rate,
            avg_sound: snapshot.avg_sound,
            avg_co2: snapshot.avg_co2,
            crowdiness_index: snapshot.crowdiness_index,
        }
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{:.4},{:.2},{:.2},{:.4}",
            iso_timestamp(self.timestamp_ms),
            self.doorway_id,
            self.motion_rate,
            self.avg_sound,
            self.avg_co2,
            self.crowdiness_index
        )
    }
}

/// Append-only CSV writer
pub struct DatasetWriter {
    path: PathBuf,
}

impl DatasetWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file = %path.display(), "dataset_initialized");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &DatasetRow) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{DATASET_HEADER}")?;
        }

        let line = row.to_csv();
        writeln!(file, "{line}")?;
        debug!(file = %self.path.display(), doorway = %row.doorway_id, "dataset_row_written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(doorway: &str, crowdiness: f64) -> DatasetRow {
        DatasetRow {
            timestamp_ms: 1_700_000_000_000,
            doorway_id: doorway.to_string(),
            motion_rate: 0.5,
            avg_sound: 55.25,
            avg_co2: 812.0,
            crowdiness_index: crowdiness,
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dataset.csv");
        let writer = DatasetWriter::new(&path);

        writer.append(&row("west", 0.4)).unwrap();
        writer.append(&row("east", 0.6)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], DATASET_HEADER);
        assert_eq!(lines[1], "2023-11-14T22:13:20.000Z,west,0.5000,55.25,812.00,0.4000");
        assert!(lines[2].contains(",east,"));
    }

    #[test]
    fn test_existing_file_is_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dataset.csv");
        fs::write(&path, format!("{DATASET_HEADER}\nold,row,0,0,0,0\n")).unwrap();

        DatasetWriter::new(&path).append(&row("west", 0.1)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.matches(DATASET_HEADER).count(), 1);
    }
}
