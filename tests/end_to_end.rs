use dmri_pipe::dissimilarity::read_spa;
use dmri_pipe::layout::SubjectPaths;
use dmri_pipe::params::{LayoutParams, PipelineParams};
use dmri_pipe::pipeline::{run_subject, Stage};
use dmri_pipe::tools::SystemRunner;
use dmri_pipe::tracking::{arc_length, TrackingSidecar};
use dmri_pipe::trackvis::read_trk;
use dmri_pipe::volume_io::{read_volume, read_volume3, scaled_header, write_f32};
use ndarray::Array4;
use std::fs;

/// One b0 and two gradients along x and y. The lowest z slice carries no signal, the rest
/// follows a tensor elongated along x.
fn write_subject(paths: &SubjectPaths) {
    let s0 = 500.;
    let signal = [s0, s0 * (-1000. * 1.7e-3f64).exp(), s0 * (-1000. * 0.3e-3f64).exp()];
    let data = Array4::<f32>::from_shape_fn((3, 3, 3, 3), |(_, _, z, q)| if z == 0 { 0. } else { signal[q] as f32 });
    write_f32(paths.recon_input(), &scaled_header([1., 1., 1.]), data.view().into_dyn()).unwrap();
    fs::write(paths.bval(), "0 1000 1000\n").unwrap();
    fs::write(paths.bvec(), "0 1 0\n0 0 1\n0 0 0\n").unwrap();
}

#[test]
fn synthetic_subject_runs_from_tensors_to_dissimilarity() {
    let dir = tempfile::tempdir().unwrap();
    let mut params = PipelineParams::default();
    params.tracking.seed_count = 8;
    params.tracking.min_length = 1.;
    params.tracking.max_length = 100.;
    params.validate().unwrap();

    let paths = SubjectPaths::new("synthetic", dir.path(), &LayoutParams::default());
    write_subject(&paths);

    let stages = [Stage::Reconstruction, Stage::Tracking, Stage::Dissimilarity];
    run_subject(&paths, &params, &SystemRunner, &stages).unwrap();

    let fa = read_volume3(paths.fa()).unwrap().data;
    for x in 0..3 {
        for y in 0..3 {
            assert_eq!(fa[[x, y, 0]], 0.);
            assert!(fa[[x, y, 2]] > 0.5);
        }
    }
    assert_eq!(read_volume(paths.evecs()).unwrap().data.shape(), &[3, 3, 3, 3, 3]);

    let (header, streamlines) = read_trk(paths.trk(8)).unwrap();
    assert_eq!(header.dim, [3, 3, 3]);
    assert!(!streamlines.is_empty());
    for s in &streamlines {
        let l = arc_length(s, &[1., 1., 1.]);
        assert!(l > 1. && l < 100., "length {} outside bounds", l);
    }

    let sidecar: TrackingSidecar = serde_json::from_slice(&fs::read(paths.track_sidecar(8)).unwrap()).unwrap();
    assert_eq!(sidecar.seed_count, 8);
    assert_eq!(sidecar.seed_label, "8");
    assert_eq!(sidecar.n_streamlines, streamlines.len());

    let record = read_spa(paths.spa(8)).unwrap();
    assert_eq!(record.nprot, streamlines.len().min(40));
    assert_eq!(record.dismatrix.dim(), (streamlines.len(), record.nprot));
    assert!(record.dismatrix.iter().all(|&d| d >= 0.));
}

#[test]
fn mismatched_grids_stop_the_subject() {
    let dir = tempfile::tempdir().unwrap();
    let paths = SubjectPaths::new("broken", dir.path(), &LayoutParams::default());
    let header = scaled_header([1., 1., 1.]);
    write_f32(paths.fa(), &header, ndarray::Array3::<f32>::zeros((3, 3, 3)).view().into_dyn()).unwrap();
    write_f32(paths.evecs(), &header, ndarray::Array5::<f32>::zeros((4, 4, 4, 3, 3)).view().into_dyn()).unwrap();

    let params = PipelineParams::default();
    let err = run_subject(&paths, &params, &SystemRunner, &[Stage::Tracking, Stage::Dissimilarity]).unwrap_err();
    assert_eq!(err.stage, Stage::Tracking);
    assert!(err.to_string().starts_with("FAIL: tracking - subject broken: grid mismatch"));
    assert!(!paths.trk(params.tracking.seed_count).exists());
    assert!(!paths.temp_dir().exists());
}
