use crate::params::LayoutParams;
use std::fmt;
use std::path::{Path, PathBuf};

/// The two acquisition series handled per subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Mri,
    Dmri,
}

impl Modality {
    pub fn tag(&self) -> &'static str {
        match self {
            Modality::Mri => "mri",
            Modality::Dmri => "dmri",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Compact seed count used in track file names: 1000000 -> "1M", 250000 -> "250K", 8 -> "8"
pub fn seed_label(seed_count: usize) -> String {
    if seed_count >= 1_000_000 {
        format!("{}M", seed_count / 1_000_000)
    } else if seed_count >= 1000 {
        format!("{}K", seed_count / 1000)
    } else {
        seed_count.to_string()
    }
}

/// Resolves every file a subject's run reads or writes. All outputs live in the subject directory.
#[derive(Debug, Clone)]
pub struct SubjectPaths {
    name: String,
    dir: PathBuf,
    layout: LayoutParams,
}

impl SubjectPaths {
    pub fn new(name: impl Into<String>, dir: impl AsRef<Path>, layout: &LayoutParams) -> Self {
        Self {
            name: name.into(),
            dir: dir.as_ref().to_path_buf(),
            layout: layout.clone(),
        }
    }

    /// the subject name is taken from the last component of its directory
    pub fn from_dir(dir: impl AsRef<Path>, layout: &LayoutParams) -> Option<Self> {
        let dir = dir.as_ref();
        let name = dir.file_name()?.to_str()?.to_string();
        Some(Self::new(name, dir, layout))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.name, suffix))
    }

    pub fn dicom_dir(&self, modality: Modality) -> PathBuf {
        match modality {
            Modality::Mri => self.dir.join(&self.layout.mri_dicom_dir),
            Modality::Dmri => self.dir.join(&self.layout.dmri_dicom_dir),
        }
    }

    pub fn dicom_pattern(&self) -> &str {
        &self.layout.dicom_pattern
    }

    /// converted volume, e.g. `<subj>_dmri.nii`
    pub fn converted(&self, modality: Modality) -> PathBuf {
        self.with_suffix(&format!("_{}.nii", modality.tag()))
    }

    pub fn bval(&self) -> PathBuf {
        self.with_suffix(".bval")
    }

    pub fn bvec(&self) -> PathBuf {
        self.with_suffix(".bvec")
    }

    pub fn brain(&self, modality: Modality) -> PathBuf {
        self.with_suffix(&format!("_{}{}", modality.tag(), self.layout.bet_suffix))
    }

    pub fn eddy_corrected(&self) -> PathBuf {
        self.with_suffix(&self.layout.ecc_suffix)
    }

    pub fn isotropic(&self) -> PathBuf {
        self.with_suffix(&self.layout.iso_suffix)
    }

    pub fn registered(&self) -> PathBuf {
        self.with_suffix(&self.layout.flirt_suffix)
    }

    pub fn registration_matrix(&self) -> PathBuf {
        self.with_suffix(&self.layout.flirt_mat_suffix)
    }

    pub fn atlas_registered(&self) -> PathBuf {
        self.with_suffix(&self.layout.atlas_suffix)
    }

    pub fn atlas_matrix(&self) -> PathBuf {
        self.with_suffix(&self.layout.atlas_mat_suffix)
    }

    pub fn recon_input(&self) -> PathBuf {
        self.with_suffix(&self.layout.recon_input_suffix)
    }

    pub fn evecs(&self) -> PathBuf {
        self.with_suffix(&self.layout.evecs_suffix)
    }

    pub fn fa(&self) -> PathBuf {
        self.with_suffix(&self.layout.fa_suffix)
    }

    pub fn color_fa(&self) -> PathBuf {
        self.with_suffix(&self.layout.cfa_suffix)
    }

    /// `<subj>_<label>` shared by the track outputs
    pub fn track_basename(&self, seed_count: usize) -> String {
        format!("{}_{}", self.name, seed_label(seed_count))
    }

    pub fn trk(&self, seed_count: usize) -> PathBuf {
        self.dir.join(format!("{}{}", self.track_basename(seed_count), self.layout.trk_suffix))
    }

    pub fn dpy(&self, seed_count: usize) -> PathBuf {
        self.dir.join(format!("{}{}", self.track_basename(seed_count), self.layout.dpy_suffix))
    }

    /// sidecar descriptor written next to the trk file, e.g. `<subj>_1M.trk.json`
    pub fn track_sidecar(&self, seed_count: usize) -> PathBuf {
        let trk = self.trk(seed_count);
        let mut name = trk.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(&self.layout.sidecar_suffix);
        trk.with_file_name(name)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.join(&self.layout.temp_dir)
    }

    pub fn spa(&self, seed_count: usize) -> PathBuf {
        self.temp_dir().join(format!("{}{}", self.track_basename(seed_count), self.layout.spa_suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_labels() {
        assert_eq!(seed_label(1_000_000), "1M");
        assert_eq!(seed_label(3_500_000), "3M");
        assert_eq!(seed_label(250_000), "250K");
        assert_eq!(seed_label(1000), "1K");
        assert_eq!(seed_label(8), "8");
    }

    #[test]
    fn subject_file_names() {
        let paths = SubjectPaths::from_dir("/data/s01", &LayoutParams::default()).unwrap();
        assert_eq!(paths.name(), "s01");
        assert_eq!(paths.converted(Modality::Dmri), Path::new("/data/s01/s01_dmri.nii"));
        assert_eq!(paths.brain(Modality::Mri), Path::new("/data/s01/s01_mri_bet.nii"));
        assert_eq!(paths.bvec(), Path::new("/data/s01/s01.bvec"));
        assert_eq!(paths.fa(), Path::new("/data/s01/s01_fa.nii"));
        assert_eq!(paths.trk(1_000_000), Path::new("/data/s01/s01_1M.trk"));
        assert_eq!(paths.dpy(250_000), Path::new("/data/s01/s01_250K.dpy"));
        assert_eq!(paths.track_sidecar(1_000_000), Path::new("/data/s01/s01_1M.trk.json"));
        assert_eq!(paths.spa(1_000_000), Path::new("/data/s01/.temp/s01_1M.spa"));
    }
}
