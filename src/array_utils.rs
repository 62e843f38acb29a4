// Voxel grid helpers. Linear voxel indices run x fastest, matching nifti storage order.

#[inline(always)]
pub fn index_to_subscript_col_maj3(index: usize, size: &[usize; 3]) -> [usize; 3] {
    let iz = index / (size[0] * size[1]);
    let rem = index % (size[0] * size[1]);
    let iy = rem / size[0];
    let ix = rem % size[0];
    [ix, iy, iz]
}

/// nearest voxel to a continuous voxel coordinate, if it lies inside the grid
#[inline(always)]
pub fn nearest_voxel(point: &[f64; 3], size: &[usize; 3]) -> Option<[usize; 3]> {
    let mut v = [0usize; 3];
    for i in 0..3 {
        let r = point[i].round();
        if r < 0. || r >= size[i] as f64 {
            return None;
        }
        v[i] = r as usize;
    }
    Some(v)
}

/// true if the point lies within the span of voxel centers
#[inline(always)]
pub fn inside_grid(point: &[f64; 3], size: &[usize; 3]) -> bool {
    point.iter().zip(size).all(|(&p, &n)| p >= 0. && p <= (n - 1) as f64)
}

/// the 8 voxels surrounding a point with their trilinear weights. Corners outside the grid are skipped.
pub fn trilinear_corners(point: &[f64; 3], size: &[usize; 3]) -> Vec<([usize; 3], f64)> {
    let base = [point[0].floor(), point[1].floor(), point[2].floor()];
    let frac = [point[0] - base[0], point[1] - base[1], point[2] - base[2]];
    let mut corners = Vec::with_capacity(8);
    for corner in 0..8usize {
        let offset = [corner & 1, (corner >> 1) & 1, (corner >> 2) & 1];
        let mut idx = [0usize; 3];
        let mut w = 1.;
        let mut inside = true;
        for i in 0..3 {
            let c = base[i] + offset[i] as f64;
            if c < 0. || c >= size[i] as f64 {
                inside = false;
                break;
            }
            idx[i] = c as usize;
            w *= if offset[i] == 1 { frac[i] } else { 1. - frac[i] };
        }
        if inside {
            corners.push((idx, w));
        }
    }
    corners
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn col_major_subscripts() {
        let size = [3, 4, 5];
        assert_eq!(index_to_subscript_col_maj3(0, &size), [0, 0, 0]);
        assert_eq!(index_to_subscript_col_maj3(1, &size), [1, 0, 0]);
        assert_eq!(index_to_subscript_col_maj3(3, &size), [0, 1, 0]);
        assert_eq!(index_to_subscript_col_maj3(59, &size), [2, 3, 4]);
    }

    #[test]
    fn trilinear_weights_sum_to_one_inside() {
        let size = [4, 4, 4];
        let corners = trilinear_corners(&[1.25, 2.5, 0.75], &size);
        assert_eq!(corners.len(), 8);
        let total: f64 = corners.iter().map(|(_, w)| w).sum();
        assert!((total - 1.).abs() < 1e-12);
    }

    #[test]
    fn corners_outside_are_dropped() {
        let size = [2, 2, 2];
        let corners = trilinear_corners(&[1.5, 0.5, 0.5], &size);
        assert_eq!(corners.len(), 4);
        assert!(nearest_voxel(&[1.6, 0., 0.], &size).is_none());
        assert_eq!(nearest_voxel(&[1.4, 0.2, 0.9], &size), Some([1, 0, 1]));
        assert!(inside_grid(&[1., 1., 0.], &size));
        assert!(!inside_grid(&[1.01, 1., 0.], &size));
    }
}
