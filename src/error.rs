use crate::pipeline::Stage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("expected input not found: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("nifti failure on {}: {source}", path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::error::NiftiError,
    },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status} without producing {}", missing.display())]
    Tool {
        program: String,
        status: String,
        missing: PathBuf,
        stderr: String,
    },

    #[error("cannot identify converter output in {}: {reason}", dir.display())]
    ConverterOutput { dir: PathBuf, reason: String },

    #[error("no file ending in {suffix} under {}", root.display())]
    AtlasNotFound { root: PathBuf, suffix: String },

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("invalid gradient table {}: {reason}", path.display())]
    GradientTable { path: PathBuf, reason: String },

    #[error("grid mismatch: {} has dims {fa:?} but {} has dims {evecs:?}", fa_path.display(), evecs_path.display())]
    DimensionMismatch {
        fa_path: PathBuf,
        fa: Vec<usize>,
        evecs_path: PathBuf,
        evecs: Vec<usize>,
    },

    #[error("unexpected volume shape {shape:?} in {}: {reason}", path.display())]
    VolumeShape {
        path: PathBuf,
        shape: Vec<usize>,
        reason: String,
    },

    #[error("malformed track file {}: {reason}", path.display())]
    MalformedTracks { path: PathBuf, reason: String },

    #[error("failed to encode {}: {reason}", path.display())]
    Encode { path: PathBuf, reason: String },

    #[error("invalid parameters: {0}")]
    Params(String),

    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn nifti(path: impl Into<PathBuf>, source: nifti::error::NiftiError) -> Self {
        Self::Nifti { path: path.into(), source }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedTracks { path: path.into(), reason: reason.into() }
    }
}

/// A failure tagged with the stage and subject it happened in.
#[derive(Debug, Error)]
#[error("FAIL: {stage} - subject {subject}: {source}")]
pub struct StageError {
    pub stage: Stage,
    pub subject: String,
    #[source]
    pub source: PipelineError,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
