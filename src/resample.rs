use crate::array_utils::{inside_grid, trilinear_corners};
use crate::error::{PipelineError, Result};
use crate::layout::SubjectPaths;
use crate::volume_io::{affine_rows, read_volume, voxel_size, write_f32};
use ndarray::{Array3, Array4, ArrayView3, Axis, Ix4, Zip};
use nifti::NiftiHeader;
use tracing::info;

/// grid size after resampling, `round(shape * zooms / new_zooms)` per axis (at least 1)
pub fn resampled_shape(shape: [usize; 3], zooms: [f64; 3], new_zooms: [f64; 3]) -> [usize; 3] {
    let mut s = [1; 3];
    for i in 0..3 {
        s[i] = ((shape[i] as f64 * zooms[i] / new_zooms[i]).round() as usize).max(1);
    }
    s
}

/// trilinear sample of a 3-D grid. Points outside the span of voxel centers read as 0.
#[inline]
pub fn sample_trilinear(vol: &ArrayView3<f64>, point: &[f64; 3]) -> f64 {
    let (nx, ny, nz) = vol.dim();
    let size = [nx, ny, nz];
    if !inside_grid(point, &size) {
        return 0.;
    }
    trilinear_corners(point, &size).into_iter().map(|(idx, w)| w * vol[idx]).sum()
}

/// reslices every volume of `data` (x, y, z, t) from `zooms` to `new_zooms`
pub fn resample_volumes(data: &Array4<f64>, zooms: [f64; 3], new_zooms: [f64; 3]) -> Array4<f32> {
    let (nx, ny, nz, nt) = data.dim();
    let [ox, oy, oz] = resampled_shape([nx, ny, nz], zooms, new_zooms);
    let ratio = [new_zooms[0] / zooms[0], new_zooms[1] / zooms[1], new_zooms[2] / zooms[2]];

    let mut out = Array4::<f32>::zeros((ox, oy, oz, nt));
    for (src, mut dst) in data.axis_iter(Axis(3)).zip(out.axis_iter_mut(Axis(3))) {
        Zip::indexed(&mut dst).par_for_each(|(x, y, z), v| {
            let p = [x as f64 * ratio[0], y as f64 * ratio[1], z as f64 * ratio[2]];
            *v = sample_trilinear(&src, &p) as f32;
        });
    }
    out
}

/// header describing the resampled grid: voxel sizes replaced and affine columns scaled
pub fn resampled_header(header: &NiftiHeader, new_zooms: [f64; 3]) -> NiftiHeader {
    let zooms = voxel_size(header);
    let rows = affine_rows(header);
    let mut h = header.clone();
    let scale = |r: [f64; 4]| {
        let mut out = [0f32; 4];
        for c in 0..3 {
            out[c] = (r[c] * new_zooms[c] / zooms[c]) as f32;
        }
        out[3] = r[3] as f32;
        out
    };
    h.srow_x = scale(rows[0]);
    h.srow_y = scale(rows[1]);
    h.srow_z = scale(rows[2]);
    h.sform_code = h.sform_code.max(1);
    for c in 0..3 {
        h.pixdim[c + 1] = new_zooms[c] as f32;
    }
    h
}

/// Resamples the eddy-corrected diffusion volume to isotropic voxels
pub fn compute_isotropic(paths: &SubjectPaths, iso_voxel_size: [f64; 3]) -> Result<()> {
    let input = paths.eddy_corrected();
    let output = paths.isotropic();
    let vol = read_volume(&input)?;
    let shape = vol.data.shape().to_vec();
    let data = match shape.len() {
        3 => vol.data.insert_axis(Axis(3)),
        _ => vol.data,
    };
    let data = data.into_dimensionality::<Ix4>().map_err(|_| PipelineError::VolumeShape {
        path: input.clone(),
        shape: shape.clone(),
        reason: "expected a 3-D or 4-D volume".to_string(),
    })?;
    let zooms = voxel_size(&vol.header);
    info!(subject = paths.name(), ?zooms, new_zooms = ?iso_voxel_size, "isotropic resampling");

    let resampled = resample_volumes(&data, zooms, iso_voxel_size);
    let header = resampled_header(&vol.header, iso_voxel_size);
    if shape.len() == 3 {
        let vol3: Array3<f32> = resampled.index_axis_move(Axis(3), 0);
        write_f32(&output, &header, vol3.view().into_dyn())
    } else {
        write_f32(&output, &header, resampled.view().into_dyn())
    }
}
