//! Request Corpus Reader
//!
//! Streams labeled request records from the on-disk datasets as a
//! deterministic, restartable sequence. Each corpus is a directory of JSON
//! files, each file an array of recorded requests:
//!
//! ```json
//! [{ "method": "GET", "url": "/?p=...", "headers": { ... }, "data": "" }]
//! ```
//!
//! Record identity must survive restarts: the id combines the file stem, the
//! record's position within the file and a short content digest, so a resumed
//! run skips exactly the records it already attempted and re-dispatches any
//! whose content changed underneath it.

use crate::classify::GroundTruth;
use crate::config::{FAST_MODE_SAMPLE_PERCENTAGE, FAST_MODE_SEED};
use crate::error::{EngineError, EngineResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Which labeled dataset a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusKind {
    Legitimate,
    Malicious,
}

impl CorpusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legitimate => "legitimate",
            Self::Malicious => "malicious",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "legitimate" => Some(Self::Legitimate),
            "malicious" => Some(Self::Malicious),
            _ => None,
        }
    }

    /// Directory name under the datasets root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Legitimate => "Legitimate",
            Self::Malicious => "Malicious",
        }
    }

    pub fn ground_truth(&self) -> GroundTruth {
        match self {
            Self::Legitimate => GroundTruth::Benign,
            Self::Malicious => GroundTruth::Malicious,
        }
    }
}

/// One recorded request, replayed verbatim against each target.
#[derive(Debug, Clone)]
pub struct CorpusRecord {
    /// Stable identifier: `<file-stem>:<index>:<content digest>`.
    pub record_id: String,
    pub corpus: CorpusKind,
    /// Source file stem, kept so results can be broken down per test set.
    pub test_name: String,
    pub method: String,
    pub path: String,
    /// Header order is preserved from the dataset file.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CorpusRecord {
    pub fn ground_truth(&self) -> GroundTruth {
        self.corpus.ground_truth()
    }
}

/// On-disk record shape. `headers` keeps file order via serde_json's
/// preserve_order feature.
#[derive(Debug, Deserialize)]
struct RawRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    data: String,
}

/// Load one corpus. Deterministic: files sorted by name, records in file
/// order. Any malformed file fails the whole corpus, since a partially
/// loaded corpus would silently bias the metrics.
pub fn load_corpus(kind: CorpusKind, datasets_dir: &Path) -> EngineResult<Vec<CorpusRecord>> {
    let dir = datasets_dir.join(kind.dir_name());

    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|e| EngineError::CorpusLoad {
            path: dir.clone(),
            reason: format!("cannot read corpus directory: {e}"),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(EngineError::CorpusLoad {
            path: dir,
            reason: "no .json corpus files found".to_string(),
        });
    }

    let mut records = Vec::new();
    for file in &files {
        records.extend(load_corpus_file(kind, file)?);
    }

    tracing::debug!(
        corpus = kind.as_str(),
        files = files.len(),
        records = records.len(),
        "corpus loaded"
    );
    Ok(records)
}

fn load_corpus_file(kind: CorpusKind, path: &Path) -> EngineResult<Vec<CorpusRecord>> {
    let corpus_err = |reason: String| EngineError::CorpusLoad { path: path.to_path_buf(), reason };

    let content = std::fs::read_to_string(path)
        .map_err(|e| corpus_err(format!("cannot read file: {e}")))?;
    let raw: Vec<RawRequest> =
        serde_json::from_str(&content).map_err(|e| corpus_err(format!("invalid JSON: {e}")))?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut records = Vec::with_capacity(raw.len());
    for (index, req) in raw.into_iter().enumerate() {
        records.push(build_record(kind, &stem, index, req).map_err(corpus_err)?);
    }
    Ok(records)
}

/// Validate one raw request and assign its stable id. Validation happens at
/// load time, not per dispatch: a record the client could never send is a
/// dataset defect, not a WAF verdict.
fn build_record(
    kind: CorpusKind,
    stem: &str,
    index: usize,
    req: RawRequest,
) -> Result<CorpusRecord, String> {
    reqwest::Method::from_bytes(req.method.as_bytes())
        .map_err(|_| format!("record {index}: invalid HTTP method {:?}", req.method))?;

    let mut headers = Vec::with_capacity(req.headers.len());
    for (name, value) in req.headers {
        // The client derives Host from the target URL; a recorded Host
        // header would point at the original capture host.
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("record {index}: invalid header name {name:?}"))?;
        reqwest::header::HeaderValue::from_str(&value)
            .map_err(|_| format!("record {index}: invalid value for header {name:?}"))?;
        headers.push((name, value));
    }

    Ok(CorpusRecord {
        record_id: record_id(kind, stem, index, &req.method, &req.url, &req.data),
        corpus: kind,
        test_name: stem.to_string(),
        method: req.method,
        path: req.url,
        headers,
        body: req.data,
    })
}

/// Derive the stable record id from corpus, position and content. The corpus
/// kind is part of the digest: the two corpora may contain files with the
/// same stem and identical record content, and observations for them must
/// never contend for the same (target, record_id) row.
fn record_id(
    kind: CorpusKind,
    stem: &str,
    index: usize,
    method: &str,
    url: &str,
    data: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(data.as_bytes());
    let digest = hex::encode(&hasher.finalize()[..4]);
    format!("{stem}:{index:05}:{digest}")
}

/// Fast-mode sampling: shuffle a copy with a constant seed and keep ~15%,
/// rounded to whole records (at least one). Repeated invocations always
/// select the identical subset.
pub fn sample_fast_mode(records: &[CorpusRecord]) -> Vec<CorpusRecord> {
    let sample_size =
        ((records.len() as f64 * FAST_MODE_SAMPLE_PERCENTAGE).round() as usize).max(1);

    let mut shuffled = records.to_vec();
    let mut rng = ChaCha8Rng::seed_from_u64(FAST_MODE_SEED);
    shuffled.shuffle(&mut rng);
    shuffled.truncate(sample_size);
    shuffled
}
