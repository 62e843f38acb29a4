use crate::diffusion_models::compute_reconstruction;
use crate::dissimilarity::compute_dissimilarity;
use crate::error::{Result, StageError};
use crate::layout::{Modality, SubjectPaths};
use crate::params::PipelineParams;
use crate::preprocessing::{atlas_registration, brain_extraction, dicom_to_nifti, eddy_current_correction, flirt_registration};
use crate::resample::compute_isotropic;
use crate::tools::ToolRunner;
use crate::tracking::compute_tracking;
use clap::ValueEnum;
use std::fmt;
use std::time::Instant;
use tracing::{error, info};

/// Processing steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Stage {
    Convert,
    BrainExtraction,
    EddyCorrection,
    Resample,
    Registration,
    AtlasRegistration,
    Reconstruction,
    Tracking,
    Dissimilarity,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Convert,
        Stage::BrainExtraction,
        Stage::EddyCorrection,
        Stage::Resample,
        Stage::Registration,
        Stage::AtlasRegistration,
        Stage::Reconstruction,
        Stage::Tracking,
        Stage::Dissimilarity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Convert => "convert",
            Stage::BrainExtraction => "brain-extraction",
            Stage::EddyCorrection => "eddy-correction",
            Stage::Resample => "resample",
            Stage::Registration => "registration",
            Stage::AtlasRegistration => "atlas-registration",
            Stage::Reconstruction => "reconstruction",
            Stage::Tracking => "tracking",
            Stage::Dissimilarity => "dissimilarity",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// the requested stages in execution order, duplicates removed
pub fn ordered_stages(requested: &[Stage]) -> Vec<Stage> {
    let mut stages = requested.to_vec();
    stages.sort();
    stages.dedup();
    stages
}

fn run_stage(stage: Stage, paths: &SubjectPaths, params: &PipelineParams, runner: &dyn ToolRunner) -> Result<()> {
    let tools = &params.tools;
    match stage {
        Stage::Convert => {
            dicom_to_nifti(paths, Modality::Mri, tools, runner)?;
            dicom_to_nifti(paths, Modality::Dmri, tools, runner)?;
        }
        Stage::BrainExtraction => {
            brain_extraction(paths, Modality::Mri, tools, runner)?;
            brain_extraction(paths, Modality::Dmri, tools, runner)?;
        }
        Stage::EddyCorrection => eddy_current_correction(paths, tools, runner)?,
        Stage::Resample => compute_isotropic(paths, tools.iso_voxel_size)?,
        Stage::Registration => flirt_registration(paths, tools, runner)?,
        Stage::AtlasRegistration => atlas_registration(paths, tools, runner)?,
        Stage::Reconstruction => compute_reconstruction(paths, &params.reconstruction)?,
        Stage::Tracking => {
            compute_tracking(paths, &params.tracking)?;
        }
        Stage::Dissimilarity => {
            compute_dissimilarity(paths, params.tracking.seed_count, &params.dissimilarity)?;
        }
    }
    Ok(())
}

/// Runs the stages for one subject, stopping at the first failure
pub fn run_subject(paths: &SubjectPaths, params: &PipelineParams, runner: &dyn ToolRunner, stages: &[Stage]) -> std::result::Result<(), StageError> {
    for stage in ordered_stages(stages) {
        let now = Instant::now();
        run_stage(stage, paths, params, runner).map_err(|source| StageError {
            stage,
            subject: paths.name().to_string(),
            source,
        })?;
        info!(subject = paths.name(), %stage, elapsed_ms = now.elapsed().as_millis() as u64, "stage finished");
    }
    Ok(())
}

/// Runs every subject in turn and returns the failures. Unless `continue_on_error` is set the
/// batch stops at the first failing subject.
pub fn run_batch(subjects: &[SubjectPaths], params: &PipelineParams, runner: &dyn ToolRunner, stages: &[Stage]) -> Vec<StageError> {
    let mut failures = vec![];
    for (i, paths) in subjects.iter().enumerate() {
        info!(subject = paths.name(), "processing subject {} of {}", i + 1, subjects.len());
        if let Err(e) = run_subject(paths, params, runner, stages) {
            error!("{}", e);
            failures.push(e);
            if !params.continue_on_error {
                break;
            }
        }
    }
    failures
}
