use crate::array_utils::index_to_subscript_col_maj3;
use crate::error::{PipelineError, Result};
use crate::gradients::GradientTable;
use crate::layout::SubjectPaths;
use crate::params::ReconParams;
use crate::volume_io::{read_volume4, write_f32, write_u8};
use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen};
use ndarray::{s, Array3, Array4, Array5, ArrayView4};
use rayon::prelude::*;
use tracing::{debug, info};

/// eigen-decomposition of one voxel's tensor. Eigenvalues are sorted descending and
/// clipped at zero, `evecs[j]` belongs to `evals[j]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorFit {
    pub evals: [f64; 3],
    pub evecs: [[f64; 3]; 3],
}

impl TensorFit {
    fn degenerate() -> Self {
        Self {
            evals: [0.; 3],
            evecs: [[1., 0., 0.], [0., 1., 0.], [0., 0., 1.]],
        }
    }

    /// fractional anisotropy with NaN replaced by 0
    pub fn fa(&self) -> f64 {
        sanitize_fa(fractional_anisotropy(&self.evals))
    }
}

/// Log-linear tensor model. The design matrix pseudo-inverse is computed once and shared by every voxel.
pub struct TensorModel {
    b0_mask: Vec<bool>,
    pinv: DMatrix<f64>,
}

impl TensorModel {
    pub fn new(gradients: &GradientTable, b0_threshold: f64) -> std::result::Result<Self, String> {
        let b0_mask = gradients.b0_mask(b0_threshold);
        let n_b0 = b0_mask.iter().filter(|&&m| m).count();
        let n_dwi = b0_mask.len() - n_b0;
        if n_b0 == 0 {
            return Err("expected at least one b0 volume".to_string());
        }
        if n_dwi == 0 {
            return Err("expected at least one diffusion weighted volume".to_string());
        }

        let (b, g): (Vec<f64>, Vec<[f64; 3]>) = gradients.bvals().iter().zip(gradients.bvecs()).zip(&b0_mask)
            .filter(|(_, &m)| !m)
            .map(|((&b, g), _)| (b, unit(g)))
            .unzip();

        let mut a = vec![0.; 6 * n_dwi];
        build_design_matrix(&b, &g, &mut a);
        let design = DMatrix::from_column_slice(n_dwi, 6, &a);
        let pinv = design.pseudo_inverse(1e-12)?;

        debug!(n_b0, n_dwi, "built tensor design matrix");
        Ok(Self { b0_mask, pinv })
    }

    pub fn n_volumes(&self) -> usize {
        self.b0_mask.len()
    }

    /// fits a single voxel's signal (one sample per acquisition)
    pub fn fit_voxel(&self, signal: &[f64]) -> TensorFit {
        let mut rhs = vec![0.; self.pinv.ncols()];
        if !build_rhs(signal, &self.b0_mask, &mut rhs) {
            return TensorFit::degenerate();
        }
        let d = &self.pinv * DVector::from_vec(rhs);
        solve_eigensystem(&[d[0], d[1], d[2], d[3], d[4], d[5]])
    }
}

fn unit(g: &[f64; 3]) -> [f64; 3] {
    let n = (g[0].powi(2) + g[1].powi(2) + g[2].powi(2)).sqrt();
    if n > 0. { [g[0] / n, g[1] / n, g[2] / n] } else { *g }
}

/// writes to a design matrix A based on b-values and b-vectors. A is in col-maj memory layout
/// where columns correspond to each of the 6 unique tensor entries {Dxx Dyy Dzz Dxy Dxz Dyz}
/// and the rows correspond to each diffusion weighted b-value / b-vector pair
fn build_design_matrix(b: &[f64], g: &[[f64; 3]], a: &mut [f64]) {
    assert_eq!(b.len(), g.len(), "b and g must have the same number of entries");
    assert_eq!(6 * g.len(), a.len(), "a must have exactly 6 x the number of entries as g");

    let m = b.len();

    a.iter_mut().enumerate().for_each(|(i, a)| {
        let col_index = i / m;
        let row_idx = i % m;
        let [gx, gy, gz] = g[row_idx];
        *a = match col_index {
            // -b g_x^2, -b g_y^2, -b g_z^2
            0..=2 => -b[row_idx] * g[row_idx][col_index].powi(2),
            3 => -2.0 * b[row_idx] * gx * gy,
            4 => -2.0 * b[row_idx] * gx * gz,
            _ => -2.0 * b[row_idx] * gy * gz,
        };
    });
}

/// writes the log signal attenuation of the diffusion weighted samples into rhs. S0 is the mean
/// of the b0 samples. Returns false when S0 is not positive, leaving the voxel without a model.
fn build_rhs(signal: &[f64], b0_mask: &[bool], rhs: &mut [f64]) -> bool {
    assert_eq!(signal.len(), b0_mask.len(), "signal vector and b0 mask must have the same length");
    let (sum, count) = signal.iter().zip(b0_mask)
        .filter(|(_, &m)| m)
        .fold((0., 0usize), |(s, c), (&v, _)| (s + v, c + 1));
    let s0 = sum / count as f64;
    if !(s0 > 0.) || !s0.is_finite() {
        return false;
    }

    assert_eq!(rhs.len(), signal.len() - count, "unexpected rhs length");

    signal.iter().zip(b0_mask)
        .filter(|(_, &m)| !m)
        .map(|(&s, _)| (s / s0).clamp(f64::MIN_POSITIVE, 1.0).ln())
        .zip(rhs.iter_mut())
        .for_each(|(s, l)| *l = s);
    true
}

/// eigen-decomposition of the tensor {Dxx Dyy Dzz Dxy Dxz Dyz}
fn solve_eigensystem(t: &[f64; 6]) -> TensorFit {
    let [dxx, dyy, dzz, dxy, dxz, dyz] = *t;
    if t.iter().any(|v| !v.is_finite()) {
        return TensorFit::degenerate();
    }
    let m = Matrix3::new(
        dxx, dxy, dxz,
        dxy, dyy, dyz,
        dxz, dyz, dzz,
    );
    let eig = SymmetricEigen::new(m);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&i, &j| eig.eigenvalues[j].total_cmp(&eig.eigenvalues[i]));

    let mut fit = TensorFit::degenerate();
    for (k, &i) in order.iter().enumerate() {
        fit.evals[k] = eig.eigenvalues[i].max(0.);
        let v = eig.eigenvectors.column(i);
        fit.evecs[k] = [v[0], v[1], v[2]];
    }
    fit
}

/// closed-form FA from eigenvalues. NaN where all eigenvalues are zero.
pub fn fractional_anisotropy(evals: &[f64; 3]) -> f64 {
    let [l1, l2, l3] = *evals;
    let num = ((l1 - l2).powi(2) + (l2 - l3).powi(2) + (l3 - l1).powi(2)).sqrt();
    let denom = (l1.powi(2) + l2.powi(2) + l3.powi(2)).sqrt();
    (0.5f64).sqrt() * num / denom
}

pub fn sanitize_fa(fa: f64) -> f64 {
    if fa.is_nan() { 0. } else { fa }
}

/// principal direction color coded by FA, rescaled to 8 bits
pub fn color_fa(fa: f64, principal: &[f64; 3]) -> [u8; 3] {
    let fa = fa.clamp(0., 1.);
    let mut rgb = [0u8; 3];
    rgb.iter_mut().zip(principal).for_each(|(c, &v)| {
        *c = (255. * v.abs() * fa).clamp(0., 255.) as u8;
    });
    rgb
}

/// per-voxel reconstruction products
pub struct Reconstruction {
    /// (x, y, z, component, eigenvector)
    pub evecs: Array5<f32>,
    pub fa: Array3<f32>,
    /// (x, y, z, rgb)
    pub color_fa: Array4<u8>,
}

/// fits the tensor model to every voxel of a 4-D diffusion series
pub fn reconstruct(data: &ArrayView4<f64>, model: &TensorModel) -> Reconstruction {
    let (nx, ny, nz, nq) = data.dim();
    assert_eq!(nq, model.n_volumes(), "volume count must match the gradient table");
    let size = [nx, ny, nz];
    let n_vox = nx * ny * nz;

    let fits = (0..n_vox).into_par_iter().map(|i| {
        let [x, y, z] = index_to_subscript_col_maj3(i, &size);
        let signal = data.slice(s![x, y, z, ..]).to_vec();
        model.fit_voxel(&signal)
    }).collect::<Vec<TensorFit>>();

    let mut evecs = Array5::<f32>::zeros((nx, ny, nz, 3, 3));
    let mut fa = Array3::<f32>::zeros((nx, ny, nz));
    let mut color = Array4::<u8>::zeros((nx, ny, nz, 3));

    for (i, fit) in fits.iter().enumerate() {
        let [x, y, z] = index_to_subscript_col_maj3(i, &size);
        let voxel_fa = fit.fa();
        fa[[x, y, z]] = voxel_fa as f32;
        for (j, v) in fit.evecs.iter().enumerate() {
            for c in 0..3 {
                evecs[[x, y, z, c, j]] = v[c] as f32;
            }
        }
        for (c, &v) in color_fa(voxel_fa, &fit.evecs[0]).iter().enumerate() {
            color[[x, y, z, c]] = v;
        }
    }

    Reconstruction { evecs, fa, color_fa: color }
}

/// Fits tensors for one subject and writes the eigenvector, FA and color FA volumes next to the input.
pub fn compute_reconstruction(paths: &SubjectPaths, params: &ReconParams) -> Result<()> {
    let dmri_file = paths.recon_input();
    info!(subject = paths.name(), input = %dmri_file.display(), "fitting diffusion tensors");

    let gradients = GradientTable::from_files(paths.bval(), paths.bvec())?;
    let volume = read_volume4(&dmri_file)?;
    let n_vols = volume.data.dim().3;
    if n_vols != gradients.len() {
        return Err(PipelineError::GradientTable {
            path: paths.bvec(),
            reason: format!("{} gradients for {} volumes in {}", gradients.len(), n_vols, dmri_file.display()),
        });
    }
    let model = TensorModel::new(&gradients, params.b0_threshold)
        .map_err(|reason| PipelineError::GradientTable { path: paths.bval(), reason })?;

    let recon = reconstruct(&volume.data.view(), &model);

    let evecs_file = paths.evecs();
    write_f32(&evecs_file, &volume.header, recon.evecs.view().into_dyn())?;
    let fa_file = paths.fa();
    write_f32(&fa_file, &volume.header, recon.fa.view().into_dyn())?;
    let cfa_file = paths.color_fa();
    write_u8(&cfa_file, &volume.header, recon.color_fa.view().into_dyn())?;

    info!(
        subject = paths.name(),
        evecs = %evecs_file.display(),
        fa = %fa_file.display(),
        cfa = %cfa_file.display(),
        "reconstruction written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LayoutParams;
    use crate::volume_io::{read_volume3, scaled_header};
    use std::fs;

    const R: f64 = std::f64::consts::FRAC_1_SQRT_2;

    fn six_direction_table() -> GradientTable {
        let bvecs = vec![
            [0., 0., 0.],
            [1., 0., 0.], [0., 1., 0.], [0., 0., 1.],
            [R, R, 0.], [R, 0., R], [0., R, R],
        ];
        let mut bvals = vec![1000.; 7];
        bvals[0] = 0.;
        GradientTable::new(bvals, bvecs).unwrap()
    }

    fn synthetic_signal(gradients: &GradientTable, s0: f64, d: &[[f64; 3]; 3]) -> Vec<f64> {
        gradients.bvals().iter().zip(gradients.bvecs()).map(|(&b, g)| {
            let mut q = 0.;
            for i in 0..3 {
                for j in 0..3 {
                    q += g[i] * d[i][j] * g[j];
                }
            }
            s0 * (-b * q).exp()
        }).collect()
    }

    #[test]
    fn design_matrix_entries() {
        let b = vec![1000., 2000.];
        let g = vec![[1., 0., 0.], [R, R, 0.]];
        let mut a = vec![0.; 12];
        build_design_matrix(&b, &g, &mut a);
        // column 0 is -b gx^2
        assert_eq!(a[0], -1000.);
        assert!((a[1] + 1000.).abs() < 1e-9);
        // column 3 is -2 b gx gy
        assert_eq!(a[6], 0.);
        assert!((a[7] + 2000.).abs() < 1e-9);
    }

    #[test]
    fn prolate_tensor_is_recovered() {
        let gradients = six_direction_table();
        let model = TensorModel::new(&gradients, 50.).unwrap();
        let d = [[1.7e-3, 0., 0.], [0., 0.3e-3, 0.], [0., 0., 0.3e-3]];
        let fit = model.fit_voxel(&synthetic_signal(&gradients, 500., &d));

        assert!((fit.evals[0] - 1.7e-3).abs() < 1e-9);
        assert!((fit.evals[1] - 0.3e-3).abs() < 1e-9);
        assert!((fit.evals[2] - 0.3e-3).abs() < 1e-9);
        assert!((fit.evecs[0][0].abs() - 1.).abs() < 1e-6);

        let expected = fractional_anisotropy(&[1.7e-3, 0.3e-3, 0.3e-3]);
        assert!((fit.fa() - expected).abs() < 1e-6);
        assert!(fit.fa() > 0.7 && fit.fa() < 0.9);
    }

    #[test]
    fn degenerate_voxels_have_zero_fa() {
        let gradients = six_direction_table();
        let model = TensorModel::new(&gradients, 50.).unwrap();
        let fit = model.fit_voxel(&[0.; 7]);
        assert!(fractional_anisotropy(&fit.evals).is_nan());
        assert_eq!(fit.fa(), 0.);
        assert_eq!(color_fa(fit.fa(), &fit.evecs[0]), [0, 0, 0]);
    }

    #[test]
    fn fa_stays_in_unit_interval() {
        let gradients = six_direction_table();
        let model = TensorModel::new(&gradients, 50.).unwrap();
        for k in 0..50 {
            let t = k as f64;
            // includes signals above s0 and non positive definite fits
            let signal = (0..7).map(|i| 100. + ((t + 1.) * (i as f64 + 0.5)).sin() * 80.).collect::<Vec<_>>();
            let fa = model.fit_voxel(&signal).fa();
            assert!(!fa.is_nan());
            assert!(fa >= 0. && fa <= 1. + 1e-9, "fa {} out of range", fa);
        }
    }

    #[test]
    fn color_fa_scales_direction() {
        assert_eq!(color_fa(1., &[-1., 0., 0.]), [255, 0, 0]);
        assert_eq!(color_fa(0.5, &[0., 1., 0.]), [0, 127, 0]);
        assert_eq!(color_fa(2., &[0., 0., 1.]), [0, 0, 255]);
    }

    #[test]
    fn tables_without_b0_are_rejected() {
        let gradients = GradientTable::new(vec![1000.], vec![[1., 0., 0.]]).unwrap();
        assert!(TensorModel::new(&gradients, 50.).is_err());
    }

    #[test]
    fn reconstruction_writes_products_and_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SubjectPaths::new("s01", dir.path(), &LayoutParams::default());
        let gradients = six_direction_table();
        let d = [[1.7e-3, 0., 0.], [0., 0.3e-3, 0.], [0., 0., 0.3e-3]];
        let signal = synthetic_signal(&gradients, 500., &d);

        let mut data = Array4::<f32>::zeros((3, 3, 3, 7));
        for x in 0..3 {
            for y in 0..3 {
                for z in 1..3 {
                    for q in 0..7 {
                        data[[x, y, z, q]] = signal[q] as f32;
                    }
                }
            }
        }
        write_f32(paths.recon_input(), &scaled_header([2., 2., 2.]), data.view().into_dyn()).unwrap();
        fs::write(paths.bval(), "0 1000 1000 1000 1000 1000 1000\n").unwrap();
        let bvec = format!("0 1 0 0 {r} {r} 0\n0 0 1 0 {r} 0 {r}\n0 0 0 1 0 {r} {r}\n", r = R);
        fs::write(paths.bvec(), bvec).unwrap();

        let params = ReconParams::default();
        compute_reconstruction(&paths, &params).unwrap();
        let first = [fs::read(paths.evecs()).unwrap(), fs::read(paths.fa()).unwrap(), fs::read(paths.color_fa()).unwrap()];
        compute_reconstruction(&paths, &params).unwrap();
        let second = [fs::read(paths.evecs()).unwrap(), fs::read(paths.fa()).unwrap(), fs::read(paths.color_fa()).unwrap()];
        assert_eq!(first, second);

        let fa = read_volume3(paths.fa()).unwrap().data;
        assert_eq!(fa[[1, 1, 0]], 0.);
        assert!(fa[[1, 1, 1]] > 0.7);
        assert!(fa.iter().all(|v| !v.is_nan() && *v >= 0. && *v <= 1. + 1e-6));
    }

    #[test]
    fn volume_count_must_match_gradients() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SubjectPaths::new("s02", dir.path(), &LayoutParams::default());
        let data = Array4::<f32>::ones((2, 2, 2, 3));
        write_f32(paths.recon_input(), &scaled_header([1.; 3]), data.view().into_dyn()).unwrap();
        fs::write(paths.bval(), "0 1000\n").unwrap();
        fs::write(paths.bvec(), "0 1\n0 0\n0 0\n").unwrap();
        assert!(matches!(
            compute_reconstruction(&paths, &ReconParams::default()),
            Err(PipelineError::GradientTable { .. })
        ));
        assert!(!paths.fa().exists());
    }
}
