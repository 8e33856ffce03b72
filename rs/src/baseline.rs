//! Persisted per-engine artifact counts.
//!
//! Before a report run starts, the supervisor snapshots how many markdown
//! artifacts each engine directory holds. Readiness later means every engine
//! has produced at least one file beyond that snapshot. Readiness checks
//! never mutate the snapshot; only an explicit initialize rewrites it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::StoreError;

/// The three upstream analysis engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Insight,
    Media,
    Query,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Insight, Engine::Media, Engine::Query];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Insight => "insight",
            Engine::Media => "media",
            Engine::Query => "query",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insight" => Ok(Engine::Insight),
            "media" => Ok(Engine::Media),
            "query" => Ok(Engine::Query),
            other => Err(format!("unknown engine: {other}")),
        }
    }
}

/// Result of a readiness check against the stored baseline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub ready: bool,
    pub baseline: BTreeMap<Engine, u64>,
    pub current: BTreeMap<Engine, u64>,
    pub delta: BTreeMap<Engine, i64>,
    pub missing: Vec<Engine>,
}

/// Persisted file-count snapshot with a read-write locked in-memory copy.
pub struct BaselineStore {
    path: PathBuf,
    counts: RwLock<BTreeMap<Engine, u64>>,
}

impl BaselineStore {
    /// Open the store backed by `path`. A missing file means an empty
    /// baseline (first run).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let counts = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<BTreeMap<Engine, u64>>(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "baseline file unreadable, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        debug!(path = %path.display(), engines = counts.len(), "BaselineStore::open");
        Self {
            path,
            counts: RwLock::new(counts),
        }
    }

    /// Count artifacts in each directory, store the counts, persist the
    /// snapshot. Idempotent while the directories do not change.
    pub fn initialize(
        &self,
        dirs: &BTreeMap<Engine, PathBuf>,
    ) -> Result<BTreeMap<Engine, u64>, StoreError> {
        let mut fresh = BTreeMap::new();
        for (engine, dir) in dirs {
            fresh.insert(*engine, count_markdown_files(dir));
        }
        info!(?fresh, "baseline initialized");

        let mut counts = self.counts.write().expect("baseline lock");
        *counts = fresh.clone();
        self.persist(&counts)?;
        Ok(fresh)
    }

    /// Compare current directory counts against the stored baseline.
    /// Side-effect free: repeated calls without a disk write return equal
    /// results.
    pub fn check_new_files(&self, dirs: &BTreeMap<Engine, PathBuf>) -> Readiness {
        let baseline = self.counts.read().expect("baseline lock").clone();

        let mut current = BTreeMap::new();
        let mut delta = BTreeMap::new();
        let mut missing = Vec::new();
        for (engine, dir) in dirs {
            let count = count_markdown_files(dir);
            let base = baseline.get(engine).copied().unwrap_or(0);
            current.insert(*engine, count);
            delta.insert(*engine, count as i64 - base as i64);
            if count <= base {
                missing.push(*engine);
            }
        }
        let ready = missing.is_empty() && !dirs.is_empty();
        debug!(ready, ?missing, "check_new_files");
        Readiness {
            ready,
            baseline,
            current,
            delta,
            missing,
        }
    }

    /// The most recently modified artifact per engine, if any.
    pub fn latest_files(&self, dirs: &BTreeMap<Engine, PathBuf>) -> BTreeMap<Engine, PathBuf> {
        let mut latest = BTreeMap::new();
        for (engine, dir) in dirs {
            if let Some(path) = latest_markdown_file(dir) {
                latest.insert(*engine, path);
            }
        }
        latest
    }

    /// Snapshot currently held in memory.
    pub fn snapshot(&self) -> BTreeMap<Engine, u64> {
        self.counts.read().expect("baseline lock").clone()
    }

    fn persist(&self, counts: &BTreeMap<Engine, u64>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let body = serde_json::to_string_pretty(counts).expect("baseline serializes");
        fs::write(&self.path, body).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "md")
}

fn count_markdown_files(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| e.path().is_file() && is_markdown(&e.path()))
        .count() as u64
}

fn latest_markdown_file(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_markdown(p))
        .max_by_key(|p| {
            p.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
}
