use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use glob::glob;
use lazy_static::lazy_static;
use log::{debug, info, warn};

use crate::config::defs::{PipelineError, READ_1, READ_2};
use crate::utils::streams::{Artifacts, SampleKey, Tuple};

const READ_EXTS: &[&str] = &["gz", "bz2", "xz", "fastq", "fq"];

lazy_static! {
    static ref R1_R2_TAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("R1", "R2");
        m.insert("r1", "r2");
        m.insert("1", "2");
        m.insert("F", "R");
        m.insert("f", "r");
        m.insert("FWD", "REV");
        m.insert("fwd", "rev");
        m.insert("PE1", "PE2");
        m.insert("pe1", "pe2");
        m.insert("READ1", "READ2");
        m.insert("read1", "read2");
        m
    };
}


/// Splits read-file extensions off a file name: `A_R1.fastq.gz` -> (`A_R1`, `.fastq.gz`).
///
/// # Arguments
///
/// * `file_name` - Bare file name.
///
/// # Returns
/// (stem, extension suffix including the leading dot).
pub fn extension_remover(file_name: &str) -> (&str, &str) {
    let mut stem = file_name;
    while let Some((head, ext)) = stem.rsplit_once('.') {
        if head.is_empty() || !READ_EXTS.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            break;
        }
        stem = head;
    }
    (stem, &file_name[stem.len()..])
}


#[derive(Debug, PartialEq)]
pub struct R1R2Result {
    pub key: String,
    pub mate_file_name: String,
}

/// Finds the R1 tag in a read file name and derives the sample key and the R2 mate's file name.
/// The right-most tag wins, so `S_1_R1.fq` keys as `S_1`.
///
/// # Arguments
///
/// * `file_name` - Bare file name of a candidate R1 file.
///
/// # Returns
/// Some(R1R2Result), or None when the name carries no R1 tag.
pub fn r1r2_base(file_name: &str) -> Option<R1R2Result> {
    let (stem, exts) = extension_remover(file_name);
    let delimiters = ['_', '.', '-'];

    let mut best: Option<(usize, char, usize)> = None;
    for &delimiter in delimiters.iter() {
        let parts: Vec<&str> = stem.split(delimiter).collect();
        if parts.len() < 2 {
            continue;
        }
        for index in (1..parts.len()).rev() {
            if R1_R2_TAGS.contains_key(parts[index]) {
                let offset: usize = parts[..index].iter().map(|p| p.len() + 1).sum();
                if best.is_none_or(|(o, _, _)| offset > o) {
                    best = Some((offset, delimiter, index));
                }
                break;
            }
        }
    }

    let (_, delimiter, index) = best?;
    let mut parts: Vec<&str> = stem.split(delimiter).collect();
    let key = parts[..index].join(&delimiter.to_string());
    let mate_tag = R1_R2_TAGS.get(parts[index])?;
    parts[index] = mate_tag;
    let mate_file_name = format!("{}{}", parts.join(&delimiter.to_string()), exts);
    Some(R1R2Result { key, mate_file_name })
}


/// Sample discovery: globs `pattern`, pairs each R1 file with its R2 mate in
/// the same directory, and returns one seed tuple per sample, sorted by key.
///
/// # Arguments
///
/// * `pattern` - Glob over read files, e.g. `reads/*.fastq.gz`.
///
/// # Returns
/// Seed tuples carrying READ_1 and READ_2, or NoSamplesFound.
pub fn discover_samples(pattern: &str) -> Result<Vec<Tuple>, PipelineError> {
    let entries = glob(pattern)
        .map_err(|e| PipelineError::InvalidConfig(format!("Bad reads pattern '{}': {}", pattern, e)))?;

    let mut samples: BTreeMap<SampleKey, (PathBuf, PathBuf)> = BTreeMap::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping unreadable path: {}", e);
                continue;
            }
        };
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(tagged) = r1r2_base(file_name) else {
            debug!("{} has no R1 tag; skipped", path.display());
            continue;
        };
        let key = SampleKey::new(tagged.key);
        if !key.is_path_safe() {
            warn!("{} yields unusable sample key '{}'; skipped", path.display(), key);
            continue;
        }
        let mate = path.with_file_name(&tagged.mate_file_name);
        if !mate.is_file() {
            warn!("No mate {} for {}; sample skipped", mate.display(), path.display());
            continue;
        }

        if let Some((existing, _)) = samples.get(&key) {
            warn!("Sample {} found twice ({} and {}); keeping the first", key, existing.display(), path.display());
            continue;
        }
        samples.insert(key, (path, mate));
    }

    if samples.is_empty() {
        return Err(PipelineError::NoSamplesFound(pattern.to_string()));
    }
    info!("Discovered {} sample(s) from {}", samples.len(), pattern);

    Ok(samples
        .into_iter()
        .map(|(key, (r1, r2))| {
            let mut artifacts = Artifacts::new();
            artifacts.insert(READ_1, absolutize(&r1));
            artifacts.insert(READ_2, absolutize(&r2));
            Tuple::new(key, artifacts)
        })
        .collect())
}

fn absolutize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}


/// Resolves a possibly relative path against `cwd`.
pub fn resolve_path(path: &str, cwd: &Path) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() { path } else { cwd.join(path) }
}
