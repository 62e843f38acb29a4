use crate::error::{PipelineError, Result};
use crate::layout::SubjectPaths;
use crate::params::{DissimilarityParams, MamVariant, PrototypePolicy};
use crate::tracking::Streamline;
use crate::trackvis::read_trk;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{debug, info};

/// Streamlines projected onto their distances to a set of prototypes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaRecord {
    /// (n_streamlines, nprot)
    pub dismatrix: Array2<f32>,
    pub nprot: usize,
    /// index of every prototype in the track file
    pub prototypes: Vec<usize>,
}

#[inline(always)]
fn dist(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

/// mean over the points of `a` of the distance to the closest point of `b`
fn mean_closest(a: &[[f64; 3]], b: &[[f64; 3]]) -> f64 {
    let total: f64 = a.iter().map(|p| {
        b.iter().map(|q| dist(p, q)).fold(f64::INFINITY, f64::min)
    }).sum();
    total / a.len() as f64
}

/// Mean of closest distances between two streamlines. Does not depend on the direction in
/// which either streamline is stored.
pub fn mam_distance(a: &[[f64; 3]], b: &[[f64; 3]], variant: MamVariant) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.;
    }
    let ab = mean_closest(a, b);
    let ba = mean_closest(b, a);
    match variant {
        MamVariant::Avg => (ab + ba) / 2.,
        MamVariant::Min => ab.min(ba),
        MamVariant::Max => ab.max(ba),
    }
}

/// Furthest-first traversal over `candidates`: starts from a random candidate, then repeatedly
/// adds the candidate furthest from everything already chosen. Ties go to the earlier candidate.
fn furthest_first(streamlines: &[Streamline], candidates: &[usize], num: usize, variant: MamVariant, rng: &mut StdRng) -> Vec<usize> {
    let num = num.min(candidates.len());
    if num == 0 {
        return vec![];
    }
    let mut chosen = Vec::with_capacity(num);
    let mut taken = vec![false; candidates.len()];
    let first = rng.random_range(0..candidates.len());
    chosen.push(candidates[first]);
    taken[first] = true;
    // distance of every candidate to its closest chosen prototype
    let mut closest = vec![f64::INFINITY; candidates.len()];
    let mut last = candidates[first];
    while chosen.len() < num {
        closest.par_iter_mut().zip(candidates.par_iter()).for_each(|(d, &c)| {
            *d = d.min(mam_distance(&streamlines[c], &streamlines[last], variant));
        });
        let mut best: Option<usize> = None;
        for (i, &d) in closest.iter().enumerate() {
            if taken[i] {
                continue;
            }
            if best.map_or(true, |b| d > closest[b]) {
                best = Some(i);
            }
        }
        let Some(best) = best else {
            break;
        };
        taken[best] = true;
        last = candidates[best];
        chosen.push(last);
    }
    chosen
}

/// picks `num` prototype indices (clamped to the number of streamlines)
pub fn select_prototypes(streamlines: &[Streamline], policy: PrototypePolicy, num: usize, variant: MamVariant, seed: u64) -> Vec<usize> {
    let n = streamlines.len();
    let num = num.min(n);
    let mut rng = StdRng::seed_from_u64(seed);
    match policy {
        PrototypePolicy::Random => index::sample(&mut rng, n, num).into_vec(),
        PrototypePolicy::Fft => {
            let all = (0..n).collect::<Vec<_>>();
            furthest_first(streamlines, &all, num, variant, &mut rng)
        }
        PrototypePolicy::Sff => {
            let subset_size = if num > 1 {
                (3. * num as f64 * (num as f64).ln()).ceil() as usize
            } else {
                num
            };
            let subset = index::sample(&mut rng, n, subset_size.clamp(num, n)).into_vec();
            furthest_first(streamlines, &subset, num, variant, &mut rng)
        }
    }
}

/// distances of every streamline to every prototype, rows in streamline order
pub fn dissimilarity_matrix(streamlines: &[Streamline], prototypes: &[usize], variant: MamVariant) -> Array2<f32> {
    let rows = streamlines.par_iter().map(|s| {
        prototypes.iter().map(|&p| mam_distance(s, &streamlines[p], variant) as f32).collect::<Vec<_>>()
    }).collect::<Vec<_>>();
    let mut matrix = Array2::zeros((streamlines.len(), prototypes.len()));
    for (mut row, values) in matrix.rows_mut().into_iter().zip(rows) {
        row.iter_mut().zip(values).for_each(|(m, v)| *m = v);
    }
    matrix
}

pub fn project(streamlines: &[Streamline], params: &DissimilarityParams) -> SpaRecord {
    let prototypes = select_prototypes(
        streamlines,
        params.prototype_policy,
        params.prototype_num,
        params.prototype_distance,
        params.prototype_seed,
    );
    debug!(?prototypes, "prototypes selected");
    let dismatrix = dissimilarity_matrix(streamlines, &prototypes, params.prototype_distance);
    SpaRecord { dismatrix, nprot: prototypes.len(), prototypes }
}

/// Projects the subject's persisted track set and writes the record to the temp directory.
/// Nothing is written unless the whole matrix was computed.
pub fn compute_dissimilarity(paths: &SubjectPaths, seed_count: usize, params: &DissimilarityParams) -> Result<SpaRecord> {
    let trk_file = paths.trk(seed_count);
    info!(subject = paths.name(), trk = %trk_file.display(), policy = ?params.prototype_policy, "computing dissimilarity");
    let (_, streamlines) = read_trk(&trk_file)?;

    let record = project(&streamlines, params);

    let spa_file = paths.spa(seed_count);
    let bytes = bincode::serialize(&record).map_err(|e| PipelineError::Encode {
        path: spa_file.clone(),
        reason: e.to_string(),
    })?;
    let temp_dir = paths.temp_dir();
    fs::create_dir_all(&temp_dir).map_err(|e| PipelineError::io(&temp_dir, e))?;
    fs::write(&spa_file, bytes).map_err(|e| PipelineError::io(&spa_file, e))?;
    info!(
        subject = paths.name(),
        n_streamlines = streamlines.len(),
        nprot = record.nprot,
        spa = %spa_file.display(),
        "dissimilarity written"
    );
    Ok(record)
}

pub fn read_spa(path: impl AsRef<std::path::Path>) -> Result<SpaRecord> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PipelineError::MissingInput { path: path.to_path_buf() });
    }
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    bincode::deserialize(&bytes).map_err(|e| PipelineError::Encode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
