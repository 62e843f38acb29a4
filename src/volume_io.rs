use crate::error::{PipelineError, Result};
use ndarray::{Array3, Array4, ArrayD, ArrayViewD, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// A volume read from disk together with the header carrying its affine
pub struct Volume<A> {
    pub header: NiftiHeader,
    pub data: A,
}

pub fn read_volume(path: impl AsRef<Path>) -> Result<Volume<ArrayD<f64>>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PipelineError::MissingInput { path: path.to_path_buf() });
    }
    let obj = ReaderOptions::new().read_file(path).map_err(|e| PipelineError::nifti(path, e))?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f64>().map_err(|e| PipelineError::nifti(path, e))?;
    Ok(Volume { header, data })
}

pub fn read_volume3(path: impl AsRef<Path>) -> Result<Volume<Array3<f64>>> {
    let path = path.as_ref();
    let Volume { header, data } = read_volume(path)?;
    let shape = data.shape().to_vec();
    // a trailing singleton dimension is tolerated
    let data = if shape.len() == 4 && shape[3] == 1 {
        data.index_axis_move(ndarray::Axis(3), 0)
    } else {
        data
    };
    let data = data.into_dimensionality::<Ix3>().map_err(|_| PipelineError::VolumeShape {
        path: path.to_path_buf(),
        shape,
        reason: "expected a 3-D volume".to_string(),
    })?;
    Ok(Volume { header, data })
}

pub fn read_volume4(path: impl AsRef<Path>) -> Result<Volume<Array4<f64>>> {
    let path = path.as_ref();
    let Volume { header, data } = read_volume(path)?;
    let shape = data.shape().to_vec();
    let data = data.into_dimensionality::<Ix4>().map_err(|_| PipelineError::VolumeShape {
        path: path.to_path_buf(),
        shape,
        reason: "expected a 4-D volume".to_string(),
    })?;
    Ok(Volume { header, data })
}

/// writes a float array reusing the reference header so the output keeps its affine
pub fn write_f32(path: impl AsRef<Path>, header: &NiftiHeader, data: ArrayViewD<f32>) -> Result<()> {
    let path = path.as_ref();
    WriterOptions::new(path)
        .reference_header(header)
        .write_nifti(&data)
        .map_err(|e| PipelineError::nifti(path, e))
}

pub fn write_u8(path: impl AsRef<Path>, header: &NiftiHeader, data: ArrayViewD<u8>) -> Result<()> {
    let path = path.as_ref();
    WriterOptions::new(path)
        .reference_header(header)
        .write_nifti(&data)
        .map_err(|e| PipelineError::nifti(path, e))
}

/// voxel size (mm) of the first three axes
pub fn voxel_size(header: &NiftiHeader) -> [f64; 3] {
    let mut v = [1.; 3];
    v.iter_mut().zip(&header.pixdim[1..4]).for_each(|(v, &p)| {
        let p = (p as f64).abs();
        *v = if p > 0. { p } else { 1. };
    });
    v
}

/// voxel-to-world affine rows. Falls back to a pure scaling when no sform is stored.
pub fn affine_rows(header: &NiftiHeader) -> [[f64; 4]; 3] {
    if header.sform_code > 0 {
        let row = |r: &[f32; 4]| [r[0] as f64, r[1] as f64, r[2] as f64, r[3] as f64];
        [row(&header.srow_x), row(&header.srow_y), row(&header.srow_z)]
    } else {
        let [dx, dy, dz] = voxel_size(header);
        [[dx, 0., 0., 0.], [0., dy, 0., 0.], [0., 0., dz, 0.]]
    }
}

/// a header for synthetic volumes with the given voxel size and a scaling sform
pub fn scaled_header(voxel_size: [f64; 3]) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    header.pixdim[1] = voxel_size[0] as f32;
    header.pixdim[2] = voxel_size[1] as f32;
    header.pixdim[3] = voxel_size[2] as f32;
    header.sform_code = 1;
    header.srow_x = [voxel_size[0] as f32, 0., 0., 0.];
    header.srow_y = [0., voxel_size[1] as f32, 0., 0.];
    header.srow_z = [0., 0., voxel_size[2] as f32, 0.];
    header
}
