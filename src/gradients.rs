use crate::error::{PipelineError, Result};
use ndarray::{Array2, Axis, ShapeBuilder};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// b-values paired with unit gradient directions, aligned with the 4th volume axis
#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
}

impl GradientTable {
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>) -> std::result::Result<Self, String> {
        if bvals.len() != bvecs.len() {
            return Err(format!("{} b-values but {} b-vectors", bvals.len(), bvecs.len()));
        }
        Ok(Self { bvals, bvecs })
    }

    /// reads an FSL-style pair of text files
    pub fn from_files(bval_file: impl AsRef<Path>, bvec_file: impl AsRef<Path>) -> Result<Self> {
        let bvec_path = bvec_file.as_ref();
        let bvals = read_bvals(bval_file)?;
        let bvecs = read_bvecs(bvec_path)?;
        Self::new(bvals, bvecs).map_err(|reason| PipelineError::GradientTable {
            path: bvec_path.to_path_buf(),
            reason,
        })
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    /// true for acquisitions with b-value at or below the threshold, or with a null direction
    pub fn b0_mask(&self, b0_threshold: f64) -> Vec<bool> {
        self.bvals.iter().zip(&self.bvecs).map(|(&b, g)| {
            let norm_sq = g[0].powi(2) + g[1].powi(2) + g[2].powi(2);
            b <= b0_threshold || norm_sq == 0.
        }).collect()
    }
}

fn read_text(txt_file: &Path) -> Result<String> {
    if !txt_file.is_file() {
        return Err(PipelineError::MissingInput { path: txt_file.to_path_buf() });
    }
    let mut s = String::new();
    File::open(txt_file)
        .and_then(|mut f| f.read_to_string(&mut s))
        .map_err(|e| PipelineError::io(txt_file, e))?;
    Ok(s)
}

fn parse_values(txt_file: &Path, s: &str) -> Result<Vec<f64>> {
    s.split_ascii_whitespace().map(|v| {
        v.parse::<f64>().map_err(|_| PipelineError::GradientTable {
            path: txt_file.to_path_buf(),
            reason: format!("cannot parse '{}' as a number", v),
        })
    }).collect()
}

/// read b-values from a text file with whitespace delimiter
pub fn read_bvals(txt_file: impl AsRef<Path>) -> Result<Vec<f64>> {
    let txt_file = txt_file.as_ref();
    let s = read_text(txt_file)?;
    parse_values(txt_file, &s)
}

/// read vectors from a text file with whitespace delimiter. The file holds three rows
/// (x, y and z components), one column per acquisition.
pub fn read_bvecs(txt_file: impl AsRef<Path>) -> Result<Vec<[f64; 3]>> {
    let txt_file = txt_file.as_ref();
    let s = read_text(txt_file)?;
    let values = parse_values(txt_file, &s)?;
    if values.len() % 3 != 0 {
        return Err(PipelineError::GradientTable {
            path: txt_file.to_path_buf(),
            reason: format!("{} values is not a multiple of 3", values.len()),
        });
    }
    let n_bvecs = values.len() / 3;
    let a = Array2::<f64>::from_shape_vec((n_bvecs, 3).f(), values).map_err(|e| PipelineError::GradientTable {
        path: txt_file.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(a.axis_iter(Axis(0)).map(|bvec| [bvec[0], bvec[1], bvec[2]]).collect())
}
