//! Aggregation Sink: many per-sample records into one sorted batch file.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tempfile::NamedTempFile;

use crate::config::defs::PipelineError;
use crate::utils::streams::{SampleKey, TupleReceiver};


#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub name: String,
    /// Artifact on each incoming tuple holding that sample's record.
    pub artifact: String,
    pub path: PathBuf,
    pub has_header: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    pub name: String,
    /// `None` when nothing was contributed and no file was created.
    pub path: Option<PathBuf>,
    pub keys: Vec<SampleKey>,
    pub unreadable: Vec<SampleKey>,
}


/// What became of a record offered to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collected {
    Added,
    /// The key already contributed; the first record is kept.
    Repeat,
    /// Nothing but a header (or nothing at all); no row to write.
    Empty,
}


/// Buffers records per key and writes them once, sorted by key, with a
/// single header. Owned by one task, so writes are never interleaved.
pub struct AggregateSink {
    name: String,
    path: PathBuf,
    has_header: bool,
    header: Option<(SampleKey, String)>,
    records: BTreeMap<SampleKey, String>,
}

impl AggregateSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, has_header: bool) -> Self {
        AggregateSink {
            name: name.into(),
            path: path.into(),
            has_header,
            header: None,
            records: BTreeMap::new(),
        }
    }

    /// Adds one sample's record. With a header, the first line is split off;
    /// the kept header is the one from the smallest key so output does not
    /// depend on arrival order.
    ///
    /// # Returns
    /// Collected::Added, or why the record was not kept.
    pub fn collect(&mut self, key: SampleKey, record: &str) -> Collected {
        if self.records.contains_key(&key) {
            warn!("Aggregate {} already has a record for {}; ignoring repeat", self.name, key);
            return Collected::Repeat;
        }

        let body = if self.has_header {
            let (header, body) = record.split_once('\n').unwrap_or((record, ""));
            if body.trim().is_empty() {
                return Collected::Empty;
            }
            let header = header.trim_end_matches('\r');
            match &self.header {
                Some((_, kept)) if kept != header => {
                    warn!("Aggregate {}: header from {} differs from the others", self.name, key);
                }
                _ => {}
            }
            let replace = match &self.header {
                Some((kept_key, _)) => key < *kept_key,
                None => true,
            };
            if replace {
                self.header = Some((key.clone(), header.to_string()));
            }
            body
        } else if record.trim().is_empty() {
            return Collected::Empty;
        } else {
            record
        };

        let mut body = body.to_string();
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        self.records.insert(key, body);
        Collected::Added
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Writes the file through a temp file in the same directory, then renames
    /// it into place, so a failed write never leaves a truncated aggregate.
    ///
    /// # Returns
    /// Path written, or `None` if there were no records.
    pub fn finish(self) -> Result<Option<PathBuf>, PipelineError> {
        if self.records.is_empty() {
            info!("Aggregate {} received no records; no file written", self.name);
            return Ok(None);
        }
        let write_error = |error: String| PipelineError::AggregateWrite {
            name: self.name.clone(),
            path: self.path.clone(),
            error,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = NamedTempFile::new_in(&dir).map_err(|e| write_error(e.to_string()))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            if let Some((_, header)) = &self.header {
                writeln!(writer, "{}", header).map_err(|e| write_error(e.to_string()))?;
            }
            for body in self.records.values() {
                writer
                    .write_all(body.as_bytes())
                    .map_err(|e| write_error(e.to_string()))?;
            }
            writer.flush().map_err(|e| write_error(e.to_string()))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| write_error(e.error.to_string()))?;

        info!("Wrote {} record(s) to {}", self.records.len(), self.path.display());
        Ok(Some(self.path))
    }
}


/// Drains `input`, reading each tuple's record artifact into the sink, then
/// writes the aggregate once the input has closed.
///
/// # Arguments
///
/// * `spec` - Aggregate descriptor.
/// * `input` - Stream of tuples carrying `spec.artifact`.
///
/// # Returns
/// AggregateReport, or AggregateWrite if the final file could not be written.
pub async fn run_aggregate(spec: AggregateSpec, mut input: TupleReceiver) -> Result<AggregateReport, PipelineError> {
    let mut sink = AggregateSink::new(spec.name.clone(), spec.path.clone(), spec.has_header);
    let mut unreadable = Vec::new();

    while let Some(tuple) = input.recv().await {
        let record = match tuple.artifacts.get(&spec.artifact) {
            Some(path) => read_record(path).await,
            None => Err(format!("no '{}' artifact", spec.artifact)),
        };
        match record {
            Ok(record) => {
                if sink.collect(tuple.key.clone(), &record) == Collected::Empty {
                    warn!("Aggregate {} skipping {}: record has no rows", spec.name, tuple.key);
                    unreadable.push(tuple.key);
                } else {
                    debug!("Aggregate {} collected {}", spec.name, tuple.key);
                }
            }
            Err(e) => {
                warn!("Aggregate {} skipping {}: {}", spec.name, tuple.key, e);
                unreadable.push(tuple.key);
            }
        }
    }

    let keys = sink.records.keys().cloned().collect();
    let path = tokio::task::spawn_blocking(move || sink.finish())
        .await
        .map_err(|e| PipelineError::AggregateWrite {
            name: spec.name.clone(),
            path: spec.path.clone(),
            error: e.to_string(),
        })??;

    Ok(AggregateReport {
        name: spec.name,
        path,
        keys,
        unreadable,
    })
}

async fn read_record(path: &Path) -> Result<String, String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::tempdir;
    use crate::utils::streams::{Artifacts, Channel, Tuple};

    fn rows(n: usize) -> Vec<(SampleKey, String)> {
        (0..n)
            .map(|i| {
                let key = SampleKey::new(format!("S{:03}", i));
                let record = format!("sample\tcluster\n{}\tL{}\n", key, i % 4);
                (key, record)
            })
            .collect()
    }

    fn write_shuffled(dir: &Path, name: &str, seed: u64, n: usize) -> Vec<u8> {
        let mut records = rows(n);
        records.shuffle(&mut StdRng::seed_from_u64(seed));
        let path = dir.join(name);
        let mut sink = AggregateSink::new("clusters", &path, true);
        for (key, record) in records {
            sink.collect(key, &record);
        }
        sink.finish().unwrap();
        fs::read(path).unwrap()
    }

    #[test]
    fn test_output_is_sorted_single_header_and_order_independent() {
        let dir = tempdir().unwrap();
        let first = write_shuffled(dir.path(), "a.tsv", 7, 25);
        let second = write_shuffled(dir.path(), "b.tsv", 99, 25);
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 26);
        assert_eq!(lines.iter().filter(|l| **l == "sample\tcluster").count(), 1);
        assert_eq!(lines[0], "sample\tcluster");
        let keys: Vec<&str> = lines[1..].iter().map(|l| l.split('\t').next().unwrap()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_headerless_multiline_records_stay_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aln.fasta");
        let mut sink = AggregateSink::new("alignment", &path, false);
        sink.collect(SampleKey::from("C"), ">C\nACGT\nAC");
        sink.collect(SampleKey::from("A"), ">A\nTTTT\nGG\n");
        sink.finish().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), ">A\nTTTT\nGG\n>C\nACGT\nAC\n");
    }

    #[test]
    fn test_repeat_key_keeps_first_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tsv");
        let mut sink = AggregateSink::new("t", &path, true);
        assert_eq!(sink.collect(SampleKey::from("A"), "h\nfirst\n"), Collected::Added);
        assert_eq!(sink.collect(SampleKey::from("A"), "h\nsecond\n"), Collected::Repeat);
        assert_eq!(sink.len(), 1);
        sink.finish().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "h\nfirst\n");
    }

    #[test]
    fn test_header_only_record_is_not_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tsv");
        let mut sink = AggregateSink::new("t", &path, true);
        assert_eq!(sink.collect(SampleKey::from("A"), "sample\tcluster\n"), Collected::Empty);
        assert_eq!(sink.collect(SampleKey::from("B"), "sample\tcluster"), Collected::Empty);
        assert_eq!(sink.collect(SampleKey::from("C"), "sample\tcluster\nC\tL2\n"), Collected::Added);
        assert_eq!(sink.len(), 1);
        sink.finish().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "sample\tcluster\nC\tL2\n");
    }

    #[test]
    fn test_empty_sink_creates_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("none.tsv");
        let sink = AggregateSink::new("none", &path, true);
        assert!(sink.is_empty());
        assert_eq!(sink.finish().unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_unwritable_destination_is_aggregate_write_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing_dir").join("t.tsv");
        let mut sink = AggregateSink::new("t", &path, true);
        sink.collect(SampleKey::from("A"), "h\nrow\n");
        match sink.finish() {
            Err(PipelineError::AggregateWrite { name, .. }) => assert_eq!(name, "t"),
            other => panic!("expected AggregateWrite, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_aggregate_reads_record_artifacts() {
        let dir = tempdir().unwrap();
        let channel = Channel::new("clustered", 4);
        let rx = channel.subscribe();
        let spec = AggregateSpec {
            name: "clusters".to_string(),
            artifact: "row".to_string(),
            path: dir.path().join("clusters.tsv"),
            has_header: true,
        };
        let task = tokio::spawn(run_aggregate(spec, rx));

        for key in ["B", "A"] {
            let record = dir.path().join(format!("{}.tsv", key));
            fs::write(&record, format!("sample\tcluster\n{}\tL1\n", key)).unwrap();
            let artifacts: Artifacts = [("row", record)].into_iter().collect();
            channel.send(Tuple::new(SampleKey::from(key), artifacts)).await;
        }
        let missing: Artifacts = [("row", dir.path().join("gone.tsv"))].into_iter().collect();
        channel.send(Tuple::new(SampleKey::from("C"), missing)).await;
        let header_only = dir.path().join("D.tsv");
        fs::write(&header_only, "sample\tcluster\n").unwrap();
        let artifacts: Artifacts = [("row", header_only)].into_iter().collect();
        channel.send(Tuple::new(SampleKey::from("D"), artifacts)).await;
        channel.close();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.keys, vec![SampleKey::from("A"), SampleKey::from("B")]);
        assert_eq!(report.unreadable, vec![SampleKey::from("C"), SampleKey::from("D")]);
        let text = fs::read_to_string(report.path.unwrap()).unwrap();
        assert_eq!(text, "sample\tcluster\nA\tL1\nB\tL1\n");
    }
}
