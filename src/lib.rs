pub mod error;
pub mod params;
pub mod layout;
pub mod volume_io;
pub mod gradients;
mod array_utils;
pub mod diffusion_models;
pub mod sphere;
pub mod tracking;
pub mod trackvis;
pub mod dpy;
pub mod dissimilarity;
pub mod resample;
pub mod tools;
pub mod preprocessing;
pub mod pipeline;

pub use error::{PipelineError, Result, StageError};
pub use layout::{Modality, SubjectPaths};
pub use params::PipelineParams;
pub use pipeline::{run_batch, run_subject, Stage};
pub use tools::{SystemRunner, ToolRunner};
