use crate::array_utils::{inside_grid, nearest_voxel, trilinear_corners};
use crate::dpy::write_dpy;
use crate::error::{PipelineError, Result};
use crate::layout::{seed_label, SubjectPaths};
use crate::params::TrackingParams;
use crate::sphere::Sphere;
use crate::trackvis::{write_trk, TrkHeader};
use crate::volume_io::{read_volume, read_volume3, voxel_size};
use ndarray::{s, Array4, ArrayView3, Ix4, Ix5};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{debug, info};

/// an ordered polyline in voxel coordinates
pub type Streamline = Vec<[f64; 3]>;

/// Deterministic Euler-delta tracker over a quantized direction field. FA doubles as the
/// stopping signal: voxels below the threshold do not contribute a direction.
pub struct EuDx<'a> {
    fa: ArrayView3<'a, f64>,
    peaks: ArrayView3<'a, usize>,
    sphere: &'a Sphere,
    params: &'a TrackingParams,
    size: [usize; 3],
    cos_threshold: f64,
}

impl<'a> EuDx<'a> {
    pub fn new(fa: ArrayView3<'a, f64>, peaks: ArrayView3<'a, usize>, sphere: &'a Sphere, params: &'a TrackingParams) -> Self {
        assert_eq!(fa.dim(), peaks.dim(), "fa and peak grids must match");
        let (nx, ny, nz) = fa.dim();
        Self {
            fa,
            peaks,
            sphere,
            params,
            size: [nx, ny, nz],
            cos_threshold: params.angle_threshold.to_radians().cos(),
        }
    }

    /// traces one streamline through the seed in both directions. None if the seed sits in a
    /// voxel below the FA threshold or outside the grid.
    pub fn track(&self, seed: &[f64; 3]) -> Option<Streamline> {
        let v = nearest_voxel(seed, &self.size)?;
        if self.fa[v] < self.params.fa_threshold {
            return None;
        }
        let dir = self.sphere.vertex(self.peaks[v]);
        let forward = self.propagate(seed, dir);
        let backward = self.propagate(seed, [-dir[0], -dir[1], -dir[2]]);

        let mut streamline = Vec::with_capacity(forward.len() + backward.len() + 1);
        streamline.extend(backward.into_iter().rev());
        streamline.push(*seed);
        streamline.extend(forward);
        Some(streamline)
    }

    fn propagate(&self, seed: &[f64; 3], initial: [f64; 3]) -> Vec<[f64; 3]> {
        let mut points = Vec::new();
        let mut point = *seed;
        let mut prev = initial;
        while points.len() < self.params.max_points {
            let Some(dir) = self.direction_at(&point, &prev) else {
                break;
            };
            let next = [
                point[0] + self.params.step_size * dir[0],
                point[1] + self.params.step_size * dir[1],
                point[2] + self.params.step_size * dir[2],
            ];
            if !inside_grid(&next, &self.size) {
                break;
            }
            points.push(next);
            point = next;
            prev = dir;
        }
        points
    }

    /// trilinear blend of the neighbouring voxel directions, each flipped to agree with `prev`
    fn direction_at(&self, point: &[f64; 3], prev: &[f64; 3]) -> Option<[f64; 3]> {
        let mut acc = [0.; 3];
        let mut total_w = 0.;
        for (idx, w) in trilinear_corners(point, &self.size) {
            if w == 0. || self.fa[idx] < self.params.fa_threshold {
                continue;
            }
            let u = self.sphere.vertex(self.peaks[idx]);
            let sign = if dot(&u, prev) < 0. { -1. } else { 1. };
            for c in 0..3 {
                acc[c] += sign * w * u[c];
            }
            total_w += w;
        }
        if total_w < self.params.total_weight {
            return None;
        }
        let norm = dot(&acc, &acc).sqrt();
        if !(norm > 0.) {
            return None;
        }
        let dir = [acc[0] / norm, acc[1] / norm, acc[2] / norm];
        if dot(&dir, prev) < self.cos_threshold {
            return None;
        }
        Some(dir)
    }
}

#[inline(always)]
fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn radical_inverse(mut i: usize, base: usize) -> f64 {
    let inv = 1. / base as f64;
    let mut f = inv;
    let mut r = 0.;
    while i > 0 {
        r += f * (i % base) as f64;
        i /= base;
        f *= inv;
    }
    r
}

/// `n` quasi-uniform seed points spanning the voxel centers of the grid (Halton bases 2, 3, 5)
pub fn halton_seeds(n: usize, size: &[usize; 3]) -> Vec<[f64; 3]> {
    const BASES: [usize; 3] = [2, 3, 5];
    (1..=n).map(|i| {
        let mut p = [0.; 3];
        for c in 0..3 {
            p[c] = radical_inverse(i, BASES[c]) * (size[c].max(1) - 1) as f64;
        }
        p
    }).collect()
}

/// polyline length in physical units
pub fn arc_length(streamline: &[[f64; 3]], voxel_size: &[f64; 3]) -> f64 {
    streamline.windows(2).map(|w| {
        let mut d = 0.;
        for c in 0..3 {
            d += ((w[1][c] - w[0][c]) * voxel_size[c]).powi(2);
        }
        d.sqrt()
    }).sum()
}

/// keeps streamlines strictly longer than `min_length` and strictly shorter than `max_length`
pub fn filter_by_length(streamlines: Vec<Streamline>, voxel_size: &[f64; 3], min_length: f64, max_length: f64) -> Vec<Streamline> {
    streamlines.into_iter().filter(|s| {
        let l = arc_length(s, voxel_size);
        l > min_length && l < max_length
    }).collect()
}

/// run parameters stored next to the track files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingSidecar {
    pub seed_count: usize,
    pub seed_label: String,
    pub sphere: String,
    pub fa_threshold: f64,
    pub step_size: f64,
    pub angle_threshold: f64,
    pub total_weight: f64,
    pub min_length: f64,
    pub max_length: f64,
    pub dim: [usize; 3],
    pub voxel_size: [f64; 3],
    pub voxel_order: String,
    pub n_tracked: usize,
    pub n_streamlines: usize,
}

/// traces a full streamline set over the given fields and applies the length filter
pub fn track_volume(fa: ArrayView3<f64>, principal: &Array4<f64>, voxel_size: &[f64; 3], params: &TrackingParams) -> (usize, Vec<Streamline>) {
    let sphere = Sphere::symmetric724();
    let peaks = sphere.quantize(&principal.view());
    let (nx, ny, nz) = fa.dim();
    let tracker = EuDx::new(fa.view(), peaks.view(), &sphere, params);

    let seeds = halton_seeds(params.seed_count, &[nx, ny, nz]);
    let streamlines = seeds.par_iter().filter_map(|seed| tracker.track(seed)).collect::<Vec<_>>();
    let n_tracked = streamlines.len();
    debug!(n_seeds = seeds.len(), n_tracked, "propagation finished");

    (n_tracked, filter_by_length(streamlines, voxel_size, params.min_length, params.max_length))
}

/// Tracks one subject from its FA and eigenvector volumes and writes the trk, dpy and sidecar
/// files. Returns the number of streamlines kept.
pub fn compute_tracking(paths: &SubjectPaths, params: &TrackingParams) -> Result<usize> {
    let fa_file = paths.fa();
    let evecs_file = paths.evecs();
    info!(subject = paths.name(), fa = %fa_file.display(), evecs = %evecs_file.display(), "tracking streamlines");

    let fa = read_volume3(&fa_file)?;
    let evecs = read_volume(&evecs_file)?;

    let (nx, ny, nz) = fa.data.dim();
    let evecs_shape = evecs.data.shape().to_vec();
    if evecs_shape.len() < 3 || evecs_shape[..3] != [nx, ny, nz] {
        return Err(PipelineError::DimensionMismatch {
            fa_path: fa_file,
            fa: vec![nx, ny, nz],
            evecs_path: evecs_file,
            evecs: evecs_shape,
        });
    }
    let shape_error = |reason: &str| PipelineError::VolumeShape {
        path: evecs_file.clone(),
        shape: evecs_shape.clone(),
        reason: reason.to_string(),
    };
    // (x, y, z, 3, 3) holds every eigenvector, (x, y, z, 3) only the principal one
    let principal = match evecs_shape.len() {
        5 if evecs_shape[3] == 3 => evecs.data.into_dimensionality::<Ix5>()
            .map_err(|_| shape_error("expected (x, y, z, 3, 3)"))?
            .slice(s![.., .., .., .., 0])
            .to_owned(),
        4 if evecs_shape[3] == 3 => evecs.data.into_dimensionality::<Ix4>()
            .map_err(|_| shape_error("expected (x, y, z, 3)"))?,
        _ => return Err(shape_error("expected an eigenvector volume")),
    };

    let vox = voxel_size(&fa.header);
    let (n_tracked, streamlines) = track_volume(fa.data.view(), &principal, &vox, params);

    let trk_file = paths.trk(params.seed_count);
    let header = TrkHeader::new([nx, ny, nz], vox, &params.voxel_order);
    write_trk(&trk_file, &header, &streamlines)?;
    let dpy_file = paths.dpy(params.seed_count);
    write_dpy(&dpy_file, &streamlines)?;

    let sidecar = TrackingSidecar {
        seed_count: params.seed_count,
        seed_label: seed_label(params.seed_count),
        sphere: Sphere::symmetric724().name().to_string(),
        fa_threshold: params.fa_threshold,
        step_size: params.step_size,
        angle_threshold: params.angle_threshold,
        total_weight: params.total_weight,
        min_length: params.min_length,
        max_length: params.max_length,
        dim: [nx, ny, nz],
        voxel_size: vox,
        voxel_order: header.voxel_order(),
        n_tracked,
        n_streamlines: streamlines.len(),
    };
    let sidecar_file = paths.track_sidecar(params.seed_count);
    let json = serde_json::to_vec_pretty(&sidecar).map_err(|e| PipelineError::Encode {
        path: sidecar_file.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&sidecar_file, json).map_err(|e| PipelineError::io(&sidecar_file, e))?;

    info!(
        subject = paths.name(),
        n_tracked,
        n_kept = streamlines.len(),
        trk = %trk_file.display(),
        "tracking written"
    );
    Ok(streamlines.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LayoutParams;
    use crate::trackvis::read_trk;
    use crate::volume_io::{scaled_header, write_f32};
    use ndarray::{Array3, Array5};

    fn x_aligned_field(size: (usize, usize, usize)) -> (Array3<f64>, Array4<f64>) {
        let fa = Array3::from_elem(size, 0.8);
        let principal = Array4::from_shape_fn((size.0, size.1, size.2, 3), |(_, _, _, c)| if c == 0 { 1. } else { 0. });
        (fa, principal)
    }

    fn loose_params() -> TrackingParams {
        TrackingParams {
            seed_count: 20,
            min_length: 0.,
            max_length: 1000.,
            ..TrackingParams::default()
        }
    }

    #[test]
    fn seeds_are_deterministic_and_inside() {
        let size = [3, 4, 5];
        let a = halton_seeds(100, &size);
        assert_eq!(a, halton_seeds(100, &size));
        assert_eq!(a.len(), 100);
        assert!(a.iter().all(|p| inside_grid(p, &size)));
        for (got, want) in a[0].iter().zip([1., 1., 0.8]) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn arc_length_uses_voxel_size() {
        let s = vec![[0., 0., 0.], [1., 0., 0.], [1., 1., 0.]];
        assert_eq!(arc_length(&s, &[1., 1., 1.]), 2.);
        assert_eq!(arc_length(&s, &[2., 3., 1.]), 5.);
        assert_eq!(arc_length(&s[..1], &[1., 1., 1.]), 0.);
    }

    #[test]
    fn length_bounds_are_strict() {
        let unit = vec![[0., 0., 0.], [1., 0., 0.]];
        let mid = vec![[0., 0., 0.], [50., 0., 0.]];
        let long = vec![[0., 0., 0.], [100., 0., 0.]];
        let kept = filter_by_length(vec![unit, mid.clone(), long], &[1., 1., 1.], 1., 100.);
        assert_eq!(kept, vec![mid]);
    }

    #[test]
    fn streamlines_follow_the_field() {
        let (fa, principal) = x_aligned_field((10, 3, 3));
        let params = loose_params();
        let sphere = Sphere::symmetric724();
        let peaks = sphere.quantize(&principal.view());
        let tracker = EuDx::new(fa.view(), peaks.view(), &sphere, &params);

        let s = tracker.track(&[4.5, 1., 1.]).unwrap();
        // runs from one end of the x axis to the other without leaving the grid
        assert!(s.len() > 10);
        assert!(s.first().unwrap()[0] < 1.);
        assert!(s.last().unwrap()[0] > 8.);
        assert!(s.iter().all(|p| inside_grid(p, &[10, 3, 3])));
        assert!(s.iter().all(|p| (p[1] - 1.).abs() < 1. && (p[2] - 1.).abs() < 1.));
    }

    #[test]
    fn low_fa_stops_propagation() {
        let (mut fa, principal) = x_aligned_field((10, 3, 3));
        fa.slice_mut(s![7.., .., ..]).fill(0.);
        let params = loose_params();
        let sphere = Sphere::symmetric724();
        let peaks = sphere.quantize(&principal.view());
        let tracker = EuDx::new(fa.view(), peaks.view(), &sphere, &params);

        let s = tracker.track(&[2., 1., 1.]).unwrap();
        assert!(s.iter().all(|p| p[0] < 7.));
        assert!(tracker.track(&[8., 1., 1.]).is_none());
    }

    #[test]
    fn tracking_is_repeatable() {
        let (fa, principal) = x_aligned_field((6, 5, 4));
        let params = loose_params();
        let a = track_volume(fa.view(), &principal, &[1., 1., 1.], &params);
        let b = track_volume(fa.view(), &principal, &[1., 1., 1.], &params);
        assert_eq!(a, b);
        assert!(a.0 > 0);
    }

    fn write_fields(paths: &SubjectPaths, fa_dims: (usize, usize, usize), evecs_dims: (usize, usize, usize)) {
        let header = scaled_header([1., 1., 1.]);
        let fa = Array3::<f32>::from_elem(fa_dims, 0.8);
        write_f32(paths.fa(), &header, fa.view().into_dyn()).unwrap();
        let evecs = Array5::<f32>::from_shape_fn((evecs_dims.0, evecs_dims.1, evecs_dims.2, 3, 3), |(_, _, _, c, j)| {
            if c == j { 1. } else { 0. }
        });
        write_f32(paths.evecs(), &header, evecs.view().into_dyn()).unwrap();
    }

    #[test]
    fn mismatched_grids_fail_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SubjectPaths::new("s01", dir.path(), &LayoutParams::default());
        write_fields(&paths, (3, 3, 3), (4, 4, 4));
        let params = TrackingParams { seed_count: 8, ..TrackingParams::default() };

        let err = compute_tracking(&paths, &params).unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { .. }));
        assert!(!paths.trk(8).exists());
        assert!(!paths.dpy(8).exists());
        assert!(!paths.track_sidecar(8).exists());
    }

    #[test]
    fn outputs_are_written_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SubjectPaths::new("s01", dir.path(), &LayoutParams::default());
        write_fields(&paths, (8, 3, 3), (8, 3, 3));
        let params = TrackingParams { seed_count: 50, min_length: 2., max_length: 100., ..TrackingParams::default() };

        let kept = compute_tracking(&paths, &params).unwrap();
        let first = fs::read(paths.trk(50)).unwrap();
        assert_eq!(kept, compute_tracking(&paths, &params).unwrap());
        assert_eq!(first, fs::read(paths.trk(50)).unwrap());

        let (header, streamlines) = read_trk(paths.trk(50)).unwrap();
        assert_eq!(header.dim, [8, 3, 3]);
        assert_eq!(header.voxel_order(), "LAS");
        assert_eq!(streamlines.len(), kept);
        for s in &streamlines {
            let l = arc_length(s, &[1., 1., 1.]);
            assert!(l > 2. && l < 100.);
        }
        assert_eq!(crate::dpy::read_dpy(paths.dpy(50)).unwrap().len(), kept);

        let sidecar: TrackingSidecar = serde_json::from_slice(&fs::read(paths.track_sidecar(50)).unwrap()).unwrap();
        assert_eq!(sidecar.seed_count, 50);
        assert_eq!(sidecar.n_streamlines, kept);
        assert_eq!(sidecar.sphere, "symmetric724");
    }
}
