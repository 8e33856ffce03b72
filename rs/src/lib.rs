//! ReportStore - durable artifact management for report runs
//!
//! Every report run owns a directory under the store base. Chapters are
//! written there as they stream in (`stream.raw`), then finalized as
//! `chapter.json` once validated, with a `manifest.json` index that is
//! rewritten atomically after every transition. The baseline module keeps
//! the persisted per-engine artifact counts used to decide whether the
//! upstream engines have produced anything new since the last report.

pub mod baseline;
pub mod cli;
pub mod quarantine;
pub mod store;

pub use baseline::{BaselineStore, Engine, Readiness};
pub use quarantine::write_quarantine;
pub use store::{
    ChapterMeta, ChapterRecord, ChapterStatus, ChapterStore, Manifest, StoreError, StreamCapture,
    safe_slug,
};
