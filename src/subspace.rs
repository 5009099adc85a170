//! Reduced-space building blocks shared by the micro-solver and the stability
//! analysis: an orthonormal basis paired with its Hessian images, a growable
//! symmetric matrix expressed in that basis, and thin adapters over the dense
//! symmetric eigensolver.

use crate::TrustRegionError;
use faer::diag::DiagRef;
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// Below this norm (relative to the input) a projected vector is treated as
/// lying inside the existing span.
const ZERO_NORM_TOL: f64 = 1e-14;

/// Orthonormal vectors stored as rows, each paired with its Hessian image.
///
/// Storage grows geometrically; only the first `len` rows are meaningful.
pub(crate) struct ReducedBasis {
    vectors: Array2<f64>,
    images: Array2<f64>,
    len: usize,
}

impl ReducedBasis {
    pub(crate) fn with_capacity(dim: usize, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, dim.max(1));
        Self {
            vectors: Array2::zeros((capacity, dim)),
            images: Array2::zeros((capacity, dim)),
            len: 0,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// True once the basis spans the whole parameter space.
    pub(crate) fn is_full(&self) -> bool {
        self.len >= self.dim()
    }

    pub(crate) fn vectors(&self) -> ArrayView2<'_, f64> {
        self.vectors.slice(s![..self.len, ..])
    }

    pub(crate) fn images(&self) -> ArrayView2<'_, f64> {
        self.images.slice(s![..self.len, ..])
    }

    /// Appends an (already orthonormalized) vector together with its image.
    pub(crate) fn add_column(
        &mut self,
        vector: ArrayView1<f64>,
        image: ArrayView1<f64>,
    ) -> Result<(), TrustRegionError> {
        if self.is_full() {
            return Err(TrustRegionError::DegenerateSubspace {
                reason: format!(
                    "cannot add basis vector {} in a {}-dimensional space",
                    self.len + 1,
                    self.dim()
                ),
            });
        }
        if self.len == self.vectors.nrows() {
            self.grow();
        }
        self.vectors.row_mut(self.len).assign(&vector);
        self.images.row_mut(self.len).assign(&image);
        self.len += 1;
        Ok(())
    }

    fn grow(&mut self) {
        let dim = self.dim();
        let capacity = (self.vectors.nrows() * 2).clamp(self.len + 1, dim);
        let mut vectors = Array2::zeros((capacity, dim));
        let mut images = Array2::zeros((capacity, dim));
        vectors
            .slice_mut(s![..self.len, ..])
            .assign(&self.vectors.slice(s![..self.len, ..]));
        images
            .slice_mut(s![..self.len, ..])
            .assign(&self.images.slice(s![..self.len, ..]));
        self.vectors = vectors;
        self.images = images;
    }

    /// Full-space vector for reduced coordinates.
    pub(crate) fn expand(&self, coefficients: &Array1<f64>) -> Array1<f64> {
        self.vectors().t().dot(coefficients)
    }

    /// Hessian image of the full-space vector for reduced coordinates.
    pub(crate) fn expand_image(&self, coefficients: &Array1<f64>) -> Array1<f64> {
        self.images().t().dot(coefficients)
    }

    /// Overlaps of the last image with every basis vector, i.e. the new
    /// row/column of the reduced Hessian.
    pub(crate) fn last_couplings(&self) -> Array1<f64> {
        if self.len == 0 {
            return Array1::zeros(0);
        }
        self.vectors().dot(&self.images.row(self.len - 1))
    }

    /// Orthonormalizes `vector` against the basis with two classical
    /// Gram-Schmidt passes. When an image is supplied it receives the same
    /// linear combination, so it remains the Hessian image of the result.
    ///
    /// Returns `None` when nothing of `vector` survives the projection.
    pub(crate) fn try_orthonormalize(
        &self,
        mut vector: Array1<f64>,
        mut image: Option<Array1<f64>>,
    ) -> Option<(Array1<f64>, Option<Array1<f64>>)> {
        let initial_norm = vector.dot(&vector).sqrt();
        if !initial_norm.is_finite() || initial_norm == 0.0 {
            return None;
        }
        if self.len > 0 {
            for _ in 0..2 {
                let overlaps = self.vectors().dot(&vector);
                vector -= &self.vectors().t().dot(&overlaps);
                if let Some(image) = image.as_mut() {
                    *image -= &self.images().t().dot(&overlaps);
                }
            }
        }
        let norm = vector.dot(&vector).sqrt();
        if norm < ZERO_NORM_TOL * initial_norm.max(1.0) {
            return None;
        }
        vector /= norm;
        if let Some(image) = image.as_mut() {
            *image /= norm;
        }
        Some((vector, image))
    }

    pub(crate) fn orthonormalize(&self, vector: Array1<f64>) -> Result<Array1<f64>, TrustRegionError> {
        self.try_orthonormalize(vector, None)
            .map(|(vector, _)| vector)
            .ok_or_else(|| self.degenerate())
    }

    pub(crate) fn orthonormalize_with_image(
        &self,
        vector: Array1<f64>,
        image: Array1<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), TrustRegionError> {
        match self.try_orthonormalize(vector, Some(image)) {
            Some((vector, Some(image))) => Ok((vector, image)),
            _ => Err(self.degenerate()),
        }
    }

    fn degenerate(&self) -> TrustRegionError {
        TrustRegionError::DegenerateSubspace {
            reason: format!(
                "new trial vector is numerically zero after orthogonalization against {} basis vectors",
                self.len
            ),
        }
    }
}

/// Symmetric matrix that grows by one row and column at a time.
pub(crate) struct ReducedMatrix {
    data: Array2<f64>,
    len: usize,
}

impl ReducedMatrix {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Array2::zeros((capacity, capacity)),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn view(&self) -> ArrayView2<'_, f64> {
        self.data.slice(s![..self.len, ..self.len])
    }

    pub(crate) fn set_symmetric(&mut self, i: usize, j: usize, value: f64) {
        self.data[(i, j)] = value;
        self.data[(j, i)] = value;
    }

    /// Appends a row/column. `couplings` holds the new off-diagonal entries
    /// followed by the new diagonal entry; the existing block is untouched.
    pub(crate) fn extend_symm(&mut self, couplings: ArrayView1<f64>) {
        assert_eq!(
            couplings.len(),
            self.len + 1,
            "coupling vector must cover the existing block plus the diagonal"
        );
        if self.len == self.data.nrows() {
            let capacity = self.data.nrows() * 2;
            let mut data = Array2::zeros((capacity, capacity));
            data.slice_mut(s![..self.len, ..self.len])
                .assign(&self.data.slice(s![..self.len, ..self.len]));
            self.data = data;
        }
        let k = self.len;
        for (i, &value) in couplings.iter().enumerate() {
            self.data[(k, i)] = value;
            self.data[(i, k)] = value;
        }
        self.len += 1;
    }
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Full eigendecomposition of a symmetric matrix (lower triangle is read).
pub(crate) fn symmetric_eigen(
    matrix: ArrayView2<f64>,
) -> Result<(Array1<f64>, Array2<f64>), TrustRegionError> {
    let n = matrix.nrows();
    if n == 0 {
        return Ok((Array1::zeros(0), Array2::zeros((0, 0))));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(TrustRegionError::LinearAlgebra {
            reason: "non-finite entry in reduced matrix".to_string(),
        });
    }
    let mat = Mat::from_fn(n, n, |i, j| matrix[(i, j)]);
    let eigen = mat
        .as_ref()
        .self_adjoint_eigen(Side::Lower)
        .map_err(|e| TrustRegionError::LinearAlgebra {
            reason: format!("self-adjoint eigendecomposition failed: {e:?}"),
        })?;
    Ok((diag_to_array(eigen.S()), mat_to_array(eigen.U())))
}

/// Lowest eigenvalue and its unit eigenvector.
pub(crate) fn lowest_eigenpair(
    matrix: ArrayView2<f64>,
) -> Result<(f64, Array1<f64>), TrustRegionError> {
    let (values, vectors) = symmetric_eigen(matrix)?;
    let idx = values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b <= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
        .ok_or_else(|| TrustRegionError::LinearAlgebra {
            reason: "eigenvalue requested for an empty matrix".to_string(),
        })?;
    Ok((values[idx], vectors.column(idx).to_owned()))
}

/// Relative size below which an eigenvalue is treated as numerically zero.
const SINGULAR_EIGENVALUE_TOL: f64 = 1e3 * f64::EPSILON;
/// Largest relative component of the right-hand side tolerated in the
/// numerical null space.
const NULL_SPACE_RHS_TOL: f64 = 1e-8;

/// Minimum-norm solution of `A x = b` for symmetric `A`, through its
/// eigendecomposition. Eigenvalues that are numerically zero are dropped;
/// returns `None` when `b` has a significant component along them, i.e. the
/// system has no solution.
pub(crate) fn symmetric_solve(
    matrix: ArrayView2<f64>,
    rhs: &Array1<f64>,
) -> Result<Option<Array1<f64>>, TrustRegionError> {
    let (values, vectors) = symmetric_eigen(matrix)?;
    let scale = values.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let cutoff = SINGULAR_EIGENVALUE_TOL * scale * values.len() as f64;
    let rhs_norm = norm(rhs);
    let mut projected = vectors.t().dot(rhs);
    for (p, &value) in projected.iter_mut().zip(values.iter()) {
        if scale > 0.0 && value.abs() > cutoff {
            *p /= value;
        } else if p.abs() <= NULL_SPACE_RHS_TOL * rhs_norm {
            *p = 0.0;
        } else {
            return Ok(None);
        }
    }
    Ok(Some(vectors.dot(&projected)))
}

#[inline]
pub(crate) fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use spectral::prelude::*;

    fn random_symmetric(n: usize, rng: &mut StdRng) -> Array2<f64> {
        let a = Array2::from_shape_fn((n, n), |_| rng.gen_range(-1.0..1.0));
        (&a + &a.t()) * 0.5
    }

    fn max_orthonormality_error(basis: &ReducedBasis) -> f64 {
        let gram = basis.vectors().dot(&basis.vectors().t());
        let eye = Array2::<f64>::eye(basis.len());
        (&gram - &eye).iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }

    #[test]
    fn basis_stays_orthonormal_while_growing() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 12;
        let h = random_symmetric(n, &mut rng);
        let mut basis = ReducedBasis::with_capacity(n, 1);
        for k in 0..n {
            let v = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
            let v = basis.orthonormalize(v).unwrap();
            let hv = h.dot(&v);
            basis.add_column(v.view(), hv.view()).unwrap();
            assert_eq!(basis.len(), k + 1);
            assert_that!(&max_orthonormality_error(&basis)).is_less_than(1e-10);
        }
        assert!(basis.is_full());
        let extra = Array1::ones(n);
        assert!(basis.add_column(extra.view(), extra.view()).is_err());
    }

    #[test]
    fn companion_image_tracks_the_orthonormalized_vector() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 8;
        let h = random_symmetric(n, &mut rng);
        let mut basis = ReducedBasis::with_capacity(n, 4);
        for _ in 0..3 {
            let v = basis
                .orthonormalize(Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0)))
                .unwrap();
            let hv = h.dot(&v);
            basis.add_column(v.view(), hv.view()).unwrap();
        }
        let raw = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
        let raw_image = h.dot(&raw);
        let (v, hv) = basis.orthonormalize_with_image(raw, raw_image).unwrap();
        let direct = h.dot(&v);
        for i in 0..n {
            assert_that!(&hv[i]).is_close_to(direct[i], 1e-12);
        }
    }

    #[test]
    fn vector_inside_span_is_rejected() {
        let mut basis = ReducedBasis::with_capacity(3, 2);
        let e0 = array![1.0, 0.0, 0.0];
        basis.add_column(e0.view(), e0.view()).unwrap();
        assert!(basis.orthonormalize(array![2.0, 0.0, 0.0]).is_err());
        assert!(basis.orthonormalize(Array1::zeros(3)).is_err());
    }

    #[test]
    fn add_column_preserves_existing_rows() {
        let mut basis = ReducedBasis::with_capacity(4, 1);
        let a = array![1.0, 0.0, 0.0, 0.0];
        let b = array![0.0, 1.0, 0.0, 0.0];
        basis.add_column(a.view(), (&a * 2.0).view()).unwrap();
        let before = basis.vectors().to_owned();
        basis.add_column(b.view(), (&b * 3.0).view()).unwrap();
        assert_eq!(basis.vectors().slice(s![..1, ..]), before);
        assert_eq!(basis.images().row(0), (&a * 2.0).view());
        assert_eq!(basis.last_couplings(), array![0.0, 3.0]);
    }

    #[test]
    fn extend_symm_round_trips_the_original_block() {
        let mut rng = StdRng::seed_from_u64(11);
        let original = random_symmetric(5, &mut rng);
        let mut m = ReducedMatrix::with_capacity(1);
        for k in 0..5 {
            m.extend_symm(original.slice(s![k, ..=k]));
        }
        assert_eq!(m.view(), original.view());
        let snapshot = m.view().to_owned();
        m.extend_symm(array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0].view());
        assert_eq!(m.len(), 6);
        assert_eq!(m.view().slice(s![..5, ..5]), snapshot);
        assert_eq!(m.view()[(5, 2)], m.view()[(2, 5)]);
    }

    #[test]
    fn lowest_eigenpair_matches_known_spectrum() {
        let a = array![[2.0, 1.0, 0.0], [1.0, 2.0, 0.0], [0.0, 0.0, 5.0]];
        let (value, vector) = lowest_eigenpair(a.view()).unwrap();
        assert_that!(&value).is_close_to(1.0, 1e-12);
        let residual = a.dot(&vector) - &vector * value;
        assert_that!(&norm(&residual)).is_less_than(1e-12);
    }

    #[test]
    fn symmetric_solve_handles_indefinite_and_singular_systems() {
        let a = array![[1.0, 2.0], [2.0, -3.0]];
        let x = array![0.5, -1.5];
        let b = a.dot(&x);
        let solved = symmetric_solve(a.view(), &b).unwrap().unwrap();
        assert_that!(&norm(&(&solved - &x))).is_less_than(1e-12);

        let zero = Array2::<f64>::zeros((3, 3));
        assert!(symmetric_solve(zero.view(), &Array1::ones(3)).unwrap().is_none());
        let trivial = symmetric_solve(zero.view(), &Array1::zeros(3)).unwrap().unwrap();
        assert!(trivial.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn singular_consistent_system_gets_minimum_norm_solution() {
        // Rank one: the kernel is spanned by (1, -1, 0) / sqrt(2).
        let a = array![[1.0, 1.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 2.0]];
        let b = array![2.0, 2.0, 4.0];
        let solved = symmetric_solve(a.view(), &b).unwrap().unwrap();
        assert_that!(&solved[0]).is_close_to(1.0, 1e-12);
        assert_that!(&solved[1]).is_close_to(1.0, 1e-12);
        assert_that!(&solved[2]).is_close_to(2.0, 1e-12);

        // Right-hand side with a kernel component has no solution.
        let inconsistent = array![2.0, 0.0, 4.0];
        assert!(symmetric_solve(a.view(), &inconsistent).unwrap().is_none());
    }
}
