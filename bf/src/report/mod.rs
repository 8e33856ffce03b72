//! Report pipeline
//!
//! Converts a query plus the three engine reports and the forum log into a
//! validated Document IR through a staged LLM pipeline: template selection,
//! slicing, layout, word budget, per-chapter streaming generation with a
//! recovery ladder, stitching and rendering.

pub mod composer;
pub mod ir;
pub mod pipeline;
pub mod prompts;
pub mod renderer;
pub mod template;
pub mod validator;

pub use composer::DocumentComposer;
pub use pipeline::{ChapterErrorKind, PipelineError, ReportPipeline, ReportRequest, ReportResult};
pub use template::{TemplateSection, parse_template_sections};
pub use validator::IrValidator;
