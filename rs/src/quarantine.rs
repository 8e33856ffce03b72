//! Quarantine directory for unparseable LLM output.
//!
//! When the repair cascade gives up on a payload, the full raw text is
//! written here so the failure can be inspected after the fact.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Write `raw` under the quarantine directory as `<task>_<slug>.raw.txt`.
///
/// Failures are logged and swallowed: quarantining is a forensic aid and
/// must never take down the caller.
pub fn write_quarantine(dir: &Path, task_id: &str, slug: &str, raw: &str) -> Option<PathBuf> {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "could not create quarantine directory");
        return None;
    }
    let safe = crate::store::safe_slug(slug);
    let path = dir.join(format!("{task_id}_{safe}.raw.txt"));
    match fs::write(&path, raw) {
        Ok(()) => {
            info!(path = %path.display(), "raw payload quarantined");
            Some(path)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not write quarantine file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_quarantine_creates_file() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("json_repair_failures");

        let path = write_quarantine(&dir, "task-1", "section-1-0", "{broken").unwrap();
        assert!(path.ends_with("task-1_section-1-0.raw.txt"));
        assert_eq!(fs::read_to_string(path).unwrap(), "{broken");
    }

    #[test]
    fn test_write_quarantine_sanitizes_slug() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("q");

        let path = write_quarantine(&dir, "t", "a/b c", "x").unwrap();
        assert!(path.ends_with("t_a-b-c.raw.txt"));
    }
}
