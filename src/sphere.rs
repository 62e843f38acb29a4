use ndarray::{Array3, ArrayView4};
use std::f64::consts::PI;

/// A fixed set of unit directions used to discretize eigenvector fields. Vertex `i + n/2`
/// is the antipode of vertex `i`.
#[derive(Debug, Clone)]
pub struct Sphere {
    name: &'static str,
    vertices: Vec<[f64; 3]>,
}

impl Sphere {
    /// 724 vertices: a golden-angle spiral over the upper hemisphere plus its antipodes
    pub fn symmetric724() -> Self {
        Self::symmetric("symmetric724", 362)
    }

    fn symmetric(name: &'static str, n_half: usize) -> Self {
        let golden_angle = PI * (3. - 5f64.sqrt());
        let mut vertices = Vec::with_capacity(2 * n_half);
        for i in 0..n_half {
            let z = 1. - (i as f64 + 0.5) / n_half as f64;
            let r = (1. - z * z).sqrt();
            let phi = golden_angle * i as f64;
            vertices.push([r * phi.cos(), r * phi.sin(), z]);
        }
        for i in 0..n_half {
            let [x, y, z] = vertices[i];
            vertices.push([-x, -y, -z]);
        }
        Self { name, vertices }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn vertices(&self) -> &[[f64; 3]] {
        &self.vertices
    }

    pub fn vertex(&self, index: usize) -> [f64; 3] {
        self.vertices[index]
    }

    /// index of the vertex with the largest dot product. Ties and non-finite input resolve to the lowest index.
    pub fn nearest(&self, v: &[f64; 3]) -> usize {
        let mut best = 0;
        let mut best_dot = f64::NEG_INFINITY;
        for (i, u) in self.vertices.iter().enumerate() {
            let d = u[0] * v[0] + u[1] * v[1] + u[2] * v[2];
            if d > best_dot {
                best_dot = d;
                best = i;
            }
        }
        best
    }

    /// maps the principal eigenvector of every voxel to a vertex index. `evecs` is (x, y, z, 3)
    pub fn quantize(&self, principal: &ArrayView4<f64>) -> Array3<usize> {
        let (nx, ny, nz, nc) = principal.dim();
        assert_eq!(nc, 3, "expected 3 vector components");
        Array3::from_shape_fn((nx, ny, nz), |(x, y, z)| {
            let v = [principal[[x, y, z, 0]], principal[[x, y, z, 1]], principal[[x, y, z, 2]]];
            self.nearest(&v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn vertices_are_unit_and_symmetric() {
        let sphere = Sphere::symmetric724();
        let v = sphere.vertices();
        assert_eq!(v.len(), 724);
        for i in 0..362 {
            let n = (v[i][0].powi(2) + v[i][1].powi(2) + v[i][2].powi(2)).sqrt();
            assert!((n - 1.).abs() < 1e-12);
            for c in 0..3 {
                assert_eq!(v[i][c], -v[i + 362][c]);
            }
        }
    }

    #[test]
    fn nearest_vertex_is_close() {
        let sphere = Sphere::symmetric724();
        for dir in [[1., 0., 0.], [0., -1., 0.], [0., 0., 1.], [0.6, 0.8, 0.]] {
            let u = sphere.vertex(sphere.nearest(&dir));
            let dot = u[0] * dir[0] + u[1] * dir[1] + u[2] * dir[2];
            // 724 vertices leave at most a few degrees between neighbours
            assert!(dot > 0.98, "dot {} for {:?}", dot, dir);
        }
    }

    #[test]
    fn quantization_is_repeatable() {
        let sphere = Sphere::symmetric724();
        let evecs = Array4::from_shape_fn((2, 3, 2, 3), |(x, y, z, c)| ((x + 2 * y + 3 * z + c) as f64).sin());
        let a = sphere.quantize(&evecs.view());
        let b = Sphere::symmetric724().quantize(&evecs.view());
        assert_eq!(a, b);
        assert_eq!(sphere.nearest(&[f64::NAN, 0., 0.]), 0);
    }
}
