use std::path::PathBuf;
use thiserror::Error;

/// Failures a single alignment's pipeline can produce.
///
/// The coordinator matches on these: a `Group` error drops the alignment
/// with a warning, anything else fails that alignment's job.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(r#"Alignment "{alignment}" has no taxa from group "{group}""#)]
    Group { group: String, alignment: String },

    #[error("{program} failed: {stderr}")]
    Subprocess { program: String, stderr: String },

    #[error("Failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error(
        r#"Constraint "{constraint}" keeps {kept} taxa for "{alignment}", need at least 3"#
    )]
    Constraint {
        constraint: String,
        alignment: String,
        kept: usize,
    },

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
