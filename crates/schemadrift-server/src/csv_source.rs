//! CSV files as a sample source.
//!
//! Each provider maps to one delimited file with a header row. `.tsv` files
//! are read tab-delimited, everything else comma-delimited.

use schemadrift_core::{RowSample, SampleSource, SourceError};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const COMMA: u8 = b',';
const TAB: u8 = b'\t';

/// Pick the delimiter from the file extension.
pub fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => TAB,
        _ => COMMA,
    }
}

/// Sample source reading CSV files from disk.
#[derive(Debug, Clone, Default)]
pub struct CsvSampleSource {
    files: BTreeMap<String, PathBuf>,
}

impl CsvSampleSource {
    /// Create a source over `(provider_id, path)` pairs.
    pub fn new(files: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        Self {
            files: files.into_iter().collect(),
        }
    }

    /// Register a provider file.
    pub fn with_file(mut self, provider_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(provider_id.into(), path.into());
        self
    }

    /// Path backing a provider.
    pub fn path(&self, provider_id: &str) -> Option<&Path> {
        self.files.get(provider_id).map(PathBuf::as_path)
    }

    fn resolve(&self, provider_id: &str) -> Result<&Path, SourceError> {
        self.path(provider_id)
            .ok_or_else(|| SourceError::NotFound(provider_id.to_string()))
    }
}

fn unreadable(provider_id: &str, err: impl ToString) -> SourceError {
    SourceError::Unreadable {
        provider: provider_id.to_string(),
        reason: err.to_string(),
    }
}

impl SampleSource for CsvSampleSource {
    fn provider_ids(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn sample(&self, provider_id: &str, limit: usize) -> Result<RowSample, SourceError> {
        let path = self.resolve(provider_id)?;
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter_for(path))
            .flexible(true)
            .from_reader(BufReader::new(file));

        let headers = reader
            .headers()
            .map_err(|e| unreadable(provider_id, e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        let mut sample = RowSample::new(headers);

        let mut record = csv::StringRecord::new();
        while sample.row_count() < limit {
            let more = reader
                .read_record(&mut record)
                .map_err(|e| unreadable(provider_id, e))?;
            if !more {
                break;
            }
            sample.push_row(record.iter());
        }

        debug!(
            provider = provider_id,
            path = %path.display(),
            rows = sample.row_count(),
            "sampled csv"
        );
        Ok(sample)
    }

    fn snapshot(&self, provider_id: &str, max_bytes: u64) -> Result<Option<Vec<u8>>, SourceError> {
        let path = self.resolve(provider_id)?;
        let len = std::fs::metadata(path)?.len();
        if len > max_bytes {
            debug!(provider = provider_id, bytes = len, max_bytes, "snapshot skipped, file too large");
            return Ok(None);
        }
        let mut data = Vec::with_capacity(len as usize);
        File::open(path)?.read_to_end(&mut data)?;
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_sample_reads_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "finops.csv",
            "app_id, cost ,region\nApp1,10.5,eu\nApp2,,us\nApp3,7\n",
        );
        let source = CsvSampleSource::default().with_file("finops", path);

        let sample = source.sample("finops", 10).unwrap();
        assert_eq!(sample.columns, vec!["app_id", "cost", "region"]);
        assert_eq!(sample.row_count(), 3);
        assert_eq!(sample.rows[1][1], None);
        assert_eq!(sample.rows[0][2].as_deref(), Some("eu"));
    }

    #[test]
    fn test_sample_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "p.csv", "a\n1\n2\n3\n4\n");
        let source = CsvSampleSource::new([("p".to_string(), path)]);
        assert_eq!(source.sample("p", 2).unwrap().row_count(), 2);
    }

    #[test]
    fn test_tsv_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "p.tsv", "a\tb\n1\t2\n");
        let source = CsvSampleSource::default().with_file("p", path);
        let sample = source.sample("p", 10).unwrap();
        assert_eq!(sample.columns, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_and_missing_providers() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvSampleSource::default().with_file("gone", dir.path().join("gone.csv"));

        assert!(matches!(
            source.sample("other", 10),
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(source.sample("gone", 10), Err(SourceError::Io(_))));
    }

    #[test]
    fn test_snapshot_limit() {
        let dir = tempfile::tempdir().unwrap();
        let contents = "app_id\nApp1\nApp2\n";
        let path = write_file(dir.path(), "p.csv", contents);
        let source = CsvSampleSource::default().with_file("p", path);

        let snapshot = source.snapshot("p", 1024).unwrap().unwrap();
        assert_eq!(snapshot, contents.as_bytes());
        assert!(source.snapshot("p", 4).unwrap().is_none());
    }
}
