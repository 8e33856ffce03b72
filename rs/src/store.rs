//! Chapter placement and manifest management.
//!
//! Each chapter is written to `stream.raw` while it is being generated, then
//! finalized as `chapter.json` once validated. The manifest records every
//! chapter's status and file locations so front-ends and debugging tools can
//! follow a run without touching the pipeline.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Characters allowed in a chapter folder name. Everything else is collapsed
/// into dashes. CJK ideographs stay as-is since chapter titles are often
/// Chinese.
static SLUG_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9A-Za-z\u{4e00}-\u{9fff}_-]+").expect("slug pattern"));
static SLUG_DASH_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("dash pattern"));

/// Errors raised by the chapter store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest for {0} is not valid JSON: {1}")]
    ManifestCorrupt(PathBuf, #[source] serde_json::Error),

    #[error("no session started for {0}")]
    UnknownRun(PathBuf),
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Lifecycle status of a chapter inside a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    /// Raw stream is being captured
    Streaming,
    /// chapter.json persisted and validation passed
    Ready,
    /// chapter.json persisted but validation reported errors
    Invalid,
}

/// Chapter metadata recorded in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    pub chapter_id: String,
    pub slug: String,
    pub title: String,
    pub order: i64,
    pub status: ChapterStatus,
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub updated_at: String,
}

/// The JSON index of a report run directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub report_id: String,
    pub created_at: String,
    pub metadata: Value,
    pub chapters: Vec<ChapterRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Meta needed to place one chapter on disk
#[derive(Debug, Clone)]
pub struct ChapterMeta {
    pub chapter_id: String,
    pub slug: String,
    pub title: String,
    pub order: i64,
}

impl ChapterMeta {
    fn effective_slug(&self) -> String {
        if self.slug.trim().is_empty() {
            if self.chapter_id.trim().is_empty() {
                "section".to_string()
            } else {
                self.chapter_id.clone()
            }
        } else {
            self.slug.clone()
        }
    }
}

/// Chapter JSON writer with manifest bookkeeping.
///
/// Responsibilities:
///   - create an independent run directory and manifest per report;
///   - capture `stream.raw` while a chapter streams;
///   - persist `chapter.json` and upsert the manifest record afterwards.
///
/// All manifest mutations for one run are serialized through a per-run mutex;
/// manifest writes go through a temp file + rename so readers never observe a
/// half-written index.
pub struct ChapterStore {
    base_dir: PathBuf,
    runs: Mutex<HashMap<PathBuf, Arc<Mutex<Manifest>>>>,
}

impl ChapterStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| StoreError::io(&base_dir, e))?;
        Ok(Self {
            base_dir,
            runs: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create the run directory and the initial manifest for a report.
    pub fn start_session(&self, report_id: &str, metadata: Value) -> Result<PathBuf, StoreError> {
        debug!(%report_id, "start_session: called");
        let run_dir = self.base_dir.join(report_id);
        fs::create_dir_all(&run_dir).map_err(|e| StoreError::io(&run_dir, e))?;

        let manifest = Manifest {
            report_id: report_id.to_string(),
            created_at: now_iso(),
            metadata,
            chapters: Vec::new(),
            updated_at: None,
        };
        write_manifest(&run_dir, &manifest)?;
        self.runs
            .lock()
            .expect("runs lock")
            .insert(run_dir.clone(), Arc::new(Mutex::new(manifest)));
        Ok(run_dir)
    }

    /// Create the chapter subdirectory and mark the chapter as streaming.
    pub fn begin_chapter(&self, run_dir: &Path, meta: &ChapterMeta) -> Result<PathBuf, StoreError> {
        debug!(chapter_id = %meta.chapter_id, order = meta.order, "begin_chapter: called");
        let chapter_dir = self.chapter_dir(run_dir, meta)?;
        let raw_rel = rel_path(run_dir, &raw_stream_path(&chapter_dir));
        let record = ChapterRecord {
            chapter_id: meta.chapter_id.clone(),
            slug: meta.effective_slug(),
            title: meta.title.clone(),
            order: meta.order,
            status: ChapterStatus::Streaming,
            files: HashMap::from([("raw".to_string(), raw_rel)]),
            errors: Vec::new(),
            updated_at: now_iso(),
        };
        self.upsert_record(run_dir, record)?;
        Ok(chapter_dir)
    }

    /// Open the raw stream file for a chapter. The returned capture flushes
    /// and closes on drop, whatever path the generation takes.
    pub fn capture_stream(&self, chapter_dir: &Path) -> Result<StreamCapture, StoreError> {
        let raw_path = raw_stream_path(chapter_dir);
        if let Some(parent) = raw_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = File::create(&raw_path).map_err(|e| StoreError::io(&raw_path, e))?;
        Ok(StreamCapture {
            path: raw_path,
            writer: BufWriter::new(file),
        })
    }

    /// Write the final chapter JSON and update the manifest record.
    ///
    /// A non-empty `errors` list marks the record invalid; the payload is
    /// still written so the raw material stays available for inspection.
    pub fn persist_chapter(
        &self,
        run_dir: &Path,
        meta: &ChapterMeta,
        payload: &Value,
        errors: &[String],
    ) -> Result<PathBuf, StoreError> {
        debug!(chapter_id = %meta.chapter_id, error_count = errors.len(), "persist_chapter: called");
        let chapter_dir = self.chapter_dir(run_dir, meta)?;
        let final_path = chapter_dir.join("chapter.json");
        let body = serde_json::to_string_pretty(payload).expect("chapter payload serializes");
        fs::write(&final_path, body).map_err(|e| StoreError::io(&final_path, e))?;

        let record = ChapterRecord {
            chapter_id: meta.chapter_id.clone(),
            slug: meta.effective_slug(),
            title: meta.title.clone(),
            order: meta.order,
            status: if errors.is_empty() {
                ChapterStatus::Ready
            } else {
                ChapterStatus::Invalid
            },
            files: HashMap::from([
                ("raw".to_string(), rel_path(run_dir, &raw_stream_path(&chapter_dir))),
                ("json".to_string(), rel_path(run_dir, &final_path)),
            ]),
            errors: errors.to_vec(),
            updated_at: now_iso(),
        };
        self.upsert_record(run_dir, record)?;
        Ok(final_path)
    }

    /// Read every persisted chapter.json from a run, sorted by `order`.
    pub fn load_chapters(&self, run_dir: &Path) -> Result<Vec<Value>, StoreError> {
        let mut payloads: Vec<Value> = Vec::new();
        let entries = fs::read_dir(run_dir).map_err(|e| StoreError::io(run_dir, e))?;
        for entry in entries.flatten() {
            let child = entry.path();
            if !child.is_dir() {
                continue;
            }
            let chapter_path = child.join("chapter.json");
            if !chapter_path.exists() {
                continue;
            }
            match fs::read_to_string(&chapter_path) {
                Ok(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(payload) => payloads.push(payload),
                    Err(e) => {
                        warn!(path = %chapter_path.display(), error = %e, "skipping unparseable chapter.json");
                    }
                },
                Err(e) => {
                    warn!(path = %chapter_path.display(), error = %e, "skipping unreadable chapter.json");
                }
            }
        }
        payloads.sort_by_key(|p| p.get("order").and_then(Value::as_i64).unwrap_or(0));
        Ok(payloads)
    }

    /// Read the manifest for a run, preferring the in-memory copy.
    pub fn manifest(&self, run_dir: &Path) -> Result<Manifest, StoreError> {
        if let Some(handle) = self.runs.lock().expect("runs lock").get(run_dir) {
            return Ok(handle.lock().expect("manifest lock").clone());
        }
        read_manifest(run_dir)
    }

    // ======== internal ========

    fn chapter_dir(&self, run_dir: &Path, meta: &ChapterMeta) -> Result<PathBuf, StoreError> {
        let folder = format!("{:03}-{}", meta.order, safe_slug(&meta.effective_slug()));
        let path = run_dir.join(folder);
        fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    /// Update or append the record, keeping the manifest the order-sorted
    /// union of cache and disk, then rewrite the file atomically.
    fn upsert_record(&self, run_dir: &Path, record: ChapterRecord) -> Result<(), StoreError> {
        let handle = {
            let mut runs = self.runs.lock().expect("runs lock");
            runs.entry(run_dir.to_path_buf())
                .or_insert_with(|| {
                    let manifest = read_manifest(run_dir).unwrap_or_else(|_| Manifest {
                        report_id: run_dir
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        created_at: now_iso(),
                        metadata: Value::Null,
                        chapters: Vec::new(),
                        updated_at: None,
                    });
                    Arc::new(Mutex::new(manifest))
                })
                .clone()
        };

        let mut manifest = handle.lock().expect("manifest lock");
        manifest.chapters.retain(|c| c.chapter_id != record.chapter_id);
        manifest.chapters.push(record);
        manifest.chapters.sort_by_key(|c| c.order);
        manifest.updated_at = Some(now_iso());
        write_manifest(run_dir, &manifest)
    }
}

/// RAII writer for a chapter's `stream.raw`
pub struct StreamCapture {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl StreamCapture {
    /// Append a streamed delta to the raw file.
    pub fn write_delta(&mut self, delta: &str) -> Result<(), StoreError> {
        self.writer
            .write_all(delta.as_bytes())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush stream.raw");
        }
    }
}

/// Strip characters that would produce an illegal or surprising folder name.
pub fn safe_slug(slug: &str) -> String {
    let replaced = SLUG_DISALLOWED.replace_all(slug, "-");
    let collapsed = SLUG_DASH_RUNS.replace_all(&replaced, "-");
    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        "section".to_string()
    } else {
        trimmed.to_string()
    }
}

fn raw_stream_path(chapter_dir: &Path) -> PathBuf {
    chapter_dir.join("stream.raw")
}

fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join("manifest.json")
}

fn rel_path(run_dir: &Path, path: &Path) -> String {
    path.strip_prefix(run_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn read_manifest(run_dir: &Path) -> Result<Manifest, StoreError> {
    let path = manifest_path(run_dir);
    let text = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
    serde_json::from_str(&text).map_err(|e| StoreError::ManifestCorrupt(path, e))
}

/// Write the manifest snapshot via temp file + rename so a crash mid-write
/// never leaves a truncated manifest behind.
fn write_manifest(run_dir: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    let path = manifest_path(run_dir);
    let tmp = run_dir.join(".manifest.json.tmp");
    let body = serde_json::to_string_pretty(manifest).expect("manifest serializes");
    fs::write(&tmp, body).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
    Ok(())
}
