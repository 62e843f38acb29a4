use crate::error::{PipelineError, Result};
use crate::layout::{Modality, SubjectPaths};
use crate::params::ToolParams;
use crate::tools::{ToolInvocation, ToolRunner};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

fn require(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(PipelineError::MissingInput { path: path.to_path_buf() })
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    if path.exists() {
        debug!(path = %path.display(), "removing stale output");
        fs::remove_file(path).map_err(|e| PipelineError::io(path, e))?;
    }
    Ok(())
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| PipelineError::io(from, e))
}

/// paths matching `pattern` inside `dir`
fn list_matching(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", glob::Pattern::escape(&dir.display().to_string()), pattern);
    let paths = glob::glob(&full).map_err(|e| PipelineError::Params(format!("bad pattern {}: {}", full, e)))?;
    let mut found = paths.filter_map(|p| p.ok()).collect::<Vec<_>>();
    found.sort();
    Ok(found)
}

fn nifti_names(dir: &Path) -> Result<BTreeSet<String>> {
    Ok(list_matching(dir, "*.nii")?
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .collect())
}

/// The stem of the base volume among newly created `.nii` files. dcm2nii may also write
/// `o<base>.nii` (reoriented) and `co<base>.nii` (cropped), which are not candidates.
pub fn converter_base(new_files: &BTreeSet<String>) -> std::result::Result<String, String> {
    let stems = new_files.iter().filter_map(|f| f.strip_suffix(".nii")).collect::<BTreeSet<_>>();
    let is_variant = |s: &str| {
        ["co", "o"].iter().any(|prefix| s.strip_prefix(prefix).is_some_and(|base| stems.contains(base)))
    };
    let candidates = stems.iter().filter(|s| !is_variant(**s)).collect::<Vec<_>>();
    match candidates.as_slice() {
        [base] => Ok(base.to_string()),
        [] => Err("converter produced no new volume".to_string()),
        many => Err(format!("ambiguous converter output: {:?}", many)),
    }
}

/// Converts the DICOM series of one modality into `<subj>_<tag>.nii` (plus `.bval`/`.bvec`
/// for diffusion data) inside the subject directory.
pub fn dicom_to_nifti(paths: &SubjectPaths, modality: Modality, tools: &ToolParams, runner: &dyn ToolRunner) -> Result<PathBuf> {
    let out_dir = paths.dir();
    let src_dir = paths.dicom_dir(modality);
    let output = paths.converted(modality);

    remove_stale(&output)?;
    remove_stale(&paths.bval())?;
    remove_stale(&paths.bvec())?;

    if list_matching(&src_dir, paths.dicom_pattern())?.is_empty() {
        return Err(PipelineError::MissingInput { path: src_dir.join(paths.dicom_pattern()) });
    }

    let before = nifti_names(out_dir)?;
    let invocation = ToolInvocation::new(&tools.dcm2nii_program)
        .args(&tools.dcm2nii_options)
        .arg(out_dir)
        .arg(&src_dir);
    runner.run(&invocation)?;
    let after = nifti_names(out_dir)?;
    let new_files = after.difference(&before).cloned().collect::<BTreeSet<_>>();
    let base = converter_base(&new_files).map_err(|reason| PipelineError::ConverterOutput {
        dir: out_dir.to_path_buf(),
        reason,
    })?;
    debug!(subject = paths.name(), base = %base, "converter output identified");

    let in_dir = |name: String| out_dir.join(name);
    match modality {
        Modality::Mri => {
            let cropped = in_dir(format!("co{}.nii", base));
            if !cropped.exists() {
                return Err(PipelineError::ConverterOutput {
                    dir: out_dir.to_path_buf(),
                    reason: format!("no cropped volume co{}.nii", base),
                });
            }
            rename(&cropped, &output)?;
            remove_stale(&in_dir(format!("o{}.nii", base)))?;
            remove_stale(&in_dir(format!("{}.nii", base)))?;
        }
        Modality::Dmri => {
            rename(&in_dir(format!("{}.nii", base)), &output)?;
            for (ext, dest) in [("bval", paths.bval()), ("bvec", paths.bvec())] {
                let src = in_dir(format!("{}.{}", base, ext));
                require(&src)?;
                rename(&src, &dest)?;
            }
        }
    }
    info!(subject = paths.name(), %modality, output = %output.display(), "dicom conversion done");
    Ok(output)
}

pub fn brain_extraction(paths: &SubjectPaths, modality: Modality, tools: &ToolParams, runner: &dyn ToolRunner) -> Result<()> {
    let input = paths.converted(modality);
    let output = paths.brain(modality);
    require(&input)?;
    let invocation = ToolInvocation::fsl(&tools.bet_program)
        .arg(&input)
        .arg(&output)
        .args(&tools.bet_options)
        .expects(&output);
    runner.run(&invocation)?;
    info!(subject = paths.name(), %modality, output = %output.display(), "brain extraction done");
    Ok(())
}

pub fn eddy_current_correction(paths: &SubjectPaths, tools: &ToolParams, runner: &dyn ToolRunner) -> Result<()> {
    let input = paths.brain(Modality::Dmri);
    let output = paths.eddy_corrected();
    require(&input)?;
    let invocation = ToolInvocation::fsl(&tools.eddy_program)
        .arg(&input)
        .arg(&output)
        .arg(tools.eddy_reference.to_string())
        .expects(&output);
    runner.run(&invocation)?;
    info!(subject = paths.name(), output = %output.display(), "eddy current correction done");
    Ok(())
}

/// registers the structural brain onto the isotropic diffusion volume
pub fn flirt_registration(paths: &SubjectPaths, tools: &ToolParams, runner: &dyn ToolRunner) -> Result<()> {
    let input = paths.brain(Modality::Mri);
    let reference = paths.isotropic();
    require(&input)?;
    require(&reference)?;
    let output = paths.registered();
    let matrix = paths.registration_matrix();
    let invocation = ToolInvocation::fsl(&tools.flirt_program)
        .arg("-in").arg(&input)
        .arg("-ref").arg(&reference)
        .arg("-out").arg(&output)
        .arg("-omat").arg(&matrix)
        .arg("-dof").arg(tools.flirt_dof.to_string())
        .expects(&output)
        .expects(&matrix);
    runner.run(&invocation)?;
    info!(subject = paths.name(), output = %output.display(), "registration done");
    Ok(())
}

/// first file under `root` (symlinks followed, entries visited in name order) whose name ends in `suffix`
pub fn find_atlas(root: &Path, suffix: &str) -> Result<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy().ends_with(suffix))
        .map(|e| e.into_path())
        .ok_or_else(|| PipelineError::AtlasNotFound {
            root: root.to_path_buf(),
            suffix: suffix.to_string(),
        })
}

/// registers the standard atlas onto the isotropic diffusion volume. The atlas is searched
/// under the directory named by `tools.atlas_env_var`.
pub fn atlas_registration(paths: &SubjectPaths, tools: &ToolParams, runner: &dyn ToolRunner) -> Result<()> {
    let root = std::env::var_os(&tools.atlas_env_var).ok_or_else(|| PipelineError::MissingEnv(tools.atlas_env_var.clone()))?;
    atlas_registration_from(Path::new(&root), paths, tools, runner)
}

pub fn atlas_registration_from(atlas_root: &Path, paths: &SubjectPaths, tools: &ToolParams, runner: &dyn ToolRunner) -> Result<()> {
    let atlas = find_atlas(atlas_root, &tools.atlas_file)?;
    let reference = paths.isotropic();
    require(&reference)?;
    let output = paths.atlas_registered();
    let matrix = paths.atlas_matrix();
    let invocation = ToolInvocation::fsl(&tools.flirt_program)
        .arg("-in").arg(&atlas)
        .arg("-ref").arg(&reference)
        .arg("-out").arg(&output)
        .arg("-omat").arg(&matrix)
        .arg("-dof").arg(tools.atlas_dof.to_string())
        .args(&tools.atlas_options)
        .expects(&output)
        .expects(&matrix);
    runner.run(&invocation)?;
    info!(subject = paths.name(), atlas = %atlas.display(), output = %output.display(), "atlas registration done");
    Ok(())
}
