use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Every option the pipeline recognizes. Scalars come before the tables so the struct
/// serializes to valid toml.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineParams {
    /// size of the rayon pool used for per-voxel and per-row work. 0 lets rayon decide.
    pub num_threads: usize,
    /// keep processing the remaining subjects when one of them fails
    pub continue_on_error: bool,
    pub layout: LayoutParams,
    pub tools: ToolParams,
    pub reconstruction: ReconParams,
    pub tracking: TrackingParams,
    pub dissimilarity: DissimilarityParams,
}

/// File and directory naming inside a subject directory. Suffixes are appended to the subject name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayoutParams {
    pub mri_dicom_dir: String,
    pub dmri_dicom_dir: String,
    pub dicom_pattern: String,
    pub bet_suffix: String,
    pub ecc_suffix: String,
    pub iso_suffix: String,
    pub flirt_suffix: String,
    pub flirt_mat_suffix: String,
    pub atlas_suffix: String,
    pub atlas_mat_suffix: String,
    pub recon_input_suffix: String,
    pub evecs_suffix: String,
    pub fa_suffix: String,
    pub cfa_suffix: String,
    pub trk_suffix: String,
    pub dpy_suffix: String,
    pub sidecar_suffix: String,
    pub spa_suffix: String,
    pub temp_dir: String,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            mri_dicom_dir: "MRI".to_string(),
            dmri_dicom_dir: "DMRI".to_string(),
            dicom_pattern: "*.dcm".to_string(),
            bet_suffix: "_bet.nii".to_string(),
            ecc_suffix: "_ecc.nii".to_string(),
            iso_suffix: "_iso.nii".to_string(),
            flirt_suffix: "_flirt.nii".to_string(),
            flirt_mat_suffix: "_flirt.mat".to_string(),
            atlas_suffix: "_atlas.nii".to_string(),
            atlas_mat_suffix: "_atlas.mat".to_string(),
            recon_input_suffix: "_iso.nii".to_string(),
            evecs_suffix: "_evecs.nii".to_string(),
            fa_suffix: "_fa.nii".to_string(),
            cfa_suffix: "_cfa.nii".to_string(),
            trk_suffix: ".trk".to_string(),
            dpy_suffix: ".dpy".to_string(),
            sidecar_suffix: ".json".to_string(),
            spa_suffix: ".spa".to_string(),
            temp_dir: ".temp".to_string(),
        }
    }
}

/// External programs and the arguments handed to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolParams {
    pub dcm2nii_program: String,
    pub dcm2nii_options: Vec<String>,
    pub bet_program: String,
    pub bet_options: Vec<String>,
    pub eddy_program: String,
    /// index of the reference volume for eddy current correction
    pub eddy_reference: usize,
    pub flirt_program: String,
    pub flirt_dof: u32,
    /// environment variable naming the directory searched for the atlas
    pub atlas_env_var: String,
    pub atlas_file: String,
    pub atlas_dof: u32,
    pub atlas_options: Vec<String>,
    /// target voxel size (mm) of the isotropic resampling
    pub iso_voxel_size: [f64; 3],
}

impl Default for ToolParams {
    fn default() -> Self {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            dcm2nii_program: "dcm2nii".to_string(),
            dcm2nii_options: args(&["-d", "n", "-g", "n", "-i", "n", "-o"]),
            bet_program: "bet".to_string(),
            bet_options: args(&["-F", "-f", ".2", "-g", "0"]),
            eddy_program: "eddy_correct".to_string(),
            eddy_reference: 0,
            flirt_program: "flirt".to_string(),
            flirt_dof: 6,
            atlas_env_var: "FSLDIR".to_string(),
            atlas_file: "MNI152_T1_1mm_brain.nii.gz".to_string(),
            atlas_dof: 12,
            atlas_options: args(&[
                "-bins", "256", "-cost", "corratio",
                "-searchrx", "-90", "90",
                "-searchry", "-90", "90",
                "-searchrz", "-90", "90",
                "-interp", "trilinear",
            ]),
            iso_voxel_size: [2.0, 2.0, 2.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconParams {
    /// acquisitions with a b-value at or below this are treated as b0
    pub b0_threshold: f64,
}

impl Default for ReconParams {
    fn default() -> Self {
        Self { b0_threshold: 50.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackingParams {
    /// total number of seed points placed over the volume
    pub seed_count: usize,
    /// propagation stops where FA falls below this
    pub fa_threshold: f64,
    /// step length in voxels
    pub step_size: f64,
    /// maximum turn between consecutive steps (degrees)
    pub angle_threshold: f64,
    /// minimum accumulated interpolation weight needed to keep going
    pub total_weight: f64,
    /// hard cap on points per propagation direction
    pub max_points: usize,
    /// streamlines must be strictly longer than this (mm)
    pub min_length: f64,
    /// streamlines must be strictly shorter than this (mm)
    pub max_length: f64,
    pub voxel_order: String,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            seed_count: 1_000_000,
            fa_threshold: 0.2,
            step_size: 0.5,
            angle_threshold: 60.0,
            total_weight: 0.5,
            max_points: 1000,
            min_length: 10.0,
            max_length: 250.0,
            voxel_order: "LAS".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrototypePolicy {
    Random,
    Fft,
    Sff,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MamVariant {
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DissimilarityParams {
    pub prototype_policy: PrototypePolicy,
    pub prototype_num: usize,
    pub prototype_distance: MamVariant,
    /// seed for the prototype sampler
    pub prototype_seed: u64,
}

impl Default for DissimilarityParams {
    fn default() -> Self {
        Self {
            prototype_policy: PrototypePolicy::Sff,
            prototype_num: 40,
            prototype_distance: MamVariant::Avg,
            prototype_seed: 0,
        }
    }
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            num_threads: 1,
            continue_on_error: false,
            layout: LayoutParams::default(),
            tools: ToolParams::default(),
            reconstruction: ReconParams::default(),
            tracking: TrackingParams::default(),
            dissimilarity: DissimilarityParams::default(),
        }
    }
}

impl PipelineParams {
    /// reads parameters from a toml file. The `.toml` extension is added if missing.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().with_extension("toml");
        let mut toml_str = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut toml_str))
            .map_err(|e| PipelineError::io(&path, e))?;
        let params = toml::from_str::<PipelineParams>(&toml_str)
            .map_err(|e| PipelineError::Params(format!("{}: {}", path.display(), e)))?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().with_extension("toml");
        let mut toml_string = toml::to_string(self).map_err(|e| PipelineError::Params(e.to_string()))?;
        toml_string.push('\n');
        let mut f = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        f.write_all(toml_string.as_bytes()).map_err(|e| PipelineError::io(&path, e))
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.tracking;
        if !(t.min_length < t.max_length) {
            return Err(PipelineError::Params(format!(
                "min_length ({}) must be less than max_length ({})",
                t.min_length, t.max_length
            )));
        }
        if t.step_size <= 0. {
            return Err(PipelineError::Params("step_size must be positive".to_string()));
        }
        if !(0. ..=180.).contains(&t.angle_threshold) {
            return Err(PipelineError::Params("angle_threshold must be within [0, 180] degrees".to_string()));
        }
        if self.tools.iso_voxel_size.iter().any(|&v| v <= 0.) {
            return Err(PipelineError::Params("iso_voxel_size entries must be positive".to_string()));
        }
        if self.dissimilarity.prototype_num == 0 {
            return Err(PipelineError::Params("prototype_num must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_a_toml_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params");
        let params = PipelineParams::default();
        params.to_file(&path).unwrap();
        assert!(dir.path().join("params.toml").exists());
        let read = PipelineParams::from_file(&path).unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let toml_str = "num_threads = 4\n[tracking]\nseed_count = 8\n[dissimilarity]\nprototype_policy = \"fft\"\n";
        let params: PipelineParams = toml::from_str(toml_str).unwrap();
        assert_eq!(params.num_threads, 4);
        assert_eq!(params.tracking.seed_count, 8);
        assert_eq!(params.tracking.step_size, 0.5);
        assert_eq!(params.dissimilarity.prototype_policy, PrototypePolicy::Fft);
        assert_eq!(params.layout.fa_suffix, "_fa.nii");
    }

    #[test]
    fn inverted_length_bounds_are_rejected() {
        let mut params = PipelineParams::default();
        params.tracking.min_length = 100.;
        params.tracking.max_length = 1.;
        assert!(matches!(params.validate(), Err(PipelineError::Params(_))));
    }
}
