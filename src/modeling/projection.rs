//! Linear discriminant analysis projection.
//!
//! The discriminant directions `v` maximize the Fisher criterion `vᵗ S_B v / vᵗ S_W v`. They are
//! the solutions of the symmetric-definite generalized eigenproblem `S_B v = λ S_W v`, which is
//! reduced to a standard symmetric one with the Cholesky factor `S_W = L Lᵗ`:
//! `(L⁻¹ S_B L⁻ᵗ) u = λ u` and `v = L⁻ᵗ u`.
use nalgebra::{Cholesky, DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use tracing::{debug, warn};

use crate::{
    Error,
    modeling::scatter::Scatter,
    util::{argmax_by, argsort_by, to_dmatrix},
};

/// Constant part of the ridge added to a singular within-class scatter.
const RIDGE_BASE: f64 = 1e-10;
/// Ridge factor relative to the mean of the within-class scatter diagonal.
const RIDGE_SCALE: f64 = 1e-8;
/// Smallest accepted ratio between the squared Cholesky pivots and the largest diagonal element
/// before a within-class scatter is considered numerically singular.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Dimensionality reduction computed by [`fisher_projection`].
#[derive(Debug, Clone)]
pub struct Projection {
    /// Discriminant directions, one per row, shape `(p, ns)`
    pub(crate) matrix: Array2<f64>,
    /// Fisher ratio of each direction, in descending order
    pub(crate) eigenvalues: Array1<f64>,
}

impl Projection {
    /// Return the projection matrix `W`.
    pub fn matrix(&self) -> ArrayView2<f64> {
        self.matrix.view()
    }

    /// Return the generalized eigenvalues associated with the rows of `W`.
    pub fn eigenvalues(&self) -> ArrayView1<f64> {
        self.eigenvalues.view()
    }

    /// Return the dimension of the subspace.
    pub fn dim(&self) -> usize {
        self.matrix.shape()[0]
    }
}

/// Compute the `p` most discriminant directions of the given [`Scatter`].
pub fn fisher_projection(scatter: &Scatter, p: usize) -> Result<Projection, Error> {
    solve(scatter.between(), scatter.within(), p)
}

/// Solve `S_B v = λ S_W v` and keep the eigenvectors of the `p` largest eigenvalues.
///
/// Eigenvectors are normalized so that `vᵗ S_W v = 1` and oriented so that their component of
/// largest magnitude is positive. Ties between eigenvalues keep the order of the eigen solver,
/// which only depends on its input.
pub fn solve(
    between: ArrayView2<f64>,
    within: ArrayView2<f64>,
    p: usize,
) -> Result<Projection, Error> {
    let size = within.shape()[0];
    if within.shape() != [size, size] || between.shape() != [size, size] {
        return Err(Error::Shape(format!(
            "scatter matrices must be square and of the same size, got {:?} and {:?}",
            between.shape(),
            within.shape()
        )));
    }
    if p == 0 || p > size {
        return Err(Error::Configuration(format!(
            "subspace dimension {p} must be in [1, {size}]"
        )));
    }

    let l = within_cholesky(within)?;

    // C = L⁻¹ S_B L⁻ᵗ
    let c = l
        .solve_lower_triangular(&to_dmatrix(between))
        .and_then(|x| l.solve_lower_triangular(&x.transpose()))
        .ok_or(Error::SingularScatter)?;
    let c = (&c + c.transpose()) * 0.5;

    let eigen = SymmetricEigen::new(c);
    let order = argsort_by(eigen.eigenvalues.as_slice(), |a, b| b.total_cmp(a));

    let lt = l.transpose();
    let mut matrix = Array2::zeros((p, size));
    let mut eigenvalues = Array1::zeros(p);
    for (k, &idx) in order.iter().take(p).enumerate() {
        let u = eigen.eigenvectors.column(idx).into_owned();
        let v = lt
            .solve_upper_triangular(&u)
            .ok_or(Error::SingularScatter)?;
        let mut v: Array1<f64> = v.iter().copied().collect();

        let pivot = argmax_by(v.view(), |a, b| a.abs().total_cmp(&b.abs()));
        if v[pivot] < 0.0 {
            v.mapv_inplace(|x| -x);
        }

        matrix.row_mut(k).assign(&v);
        eigenvalues[k] = eigen.eigenvalues[idx];
    }

    if matrix.iter().any(|x| !x.is_finite()) {
        return Err(Error::SingularScatter);
    }

    debug!(?eigenvalues, "fisher projection solved");

    Ok(Projection {
        matrix,
        eigenvalues,
    })
}

/// Return the lower Cholesky factor of the within-class scatter.
///
/// A numerically singular matrix is regularized once with a ridge proportional to its mean
/// diagonal element.
fn within_cholesky(within: ArrayView2<f64>) -> Result<DMatrix<f64>, Error> {
    let size = within.shape()[0];
    let sw = to_dmatrix(within);

    let trace = sw.trace();
    if sw.iter().any(|x| !x.is_finite()) || trace <= 0.0 {
        return Err(Error::SingularScatter);
    }

    let max_diag = sw.diagonal().max();
    if let Some(chol) = Cholesky::new(sw.clone()) {
        let l = chol.l();
        let min_pivot = l.diagonal().min();
        if min_pivot * min_pivot > PIVOT_TOLERANCE * max_diag {
            return Ok(l);
        }
    }

    let ridge = RIDGE_BASE + RIDGE_SCALE * trace / size as f64;
    warn!(ridge, "within-class scatter is singular, adding a ridge to its diagonal");

    let mut regularized = sw;
    for i in 0..size {
        regularized[(i, i)] += ridge;
    }

    let l = Cholesky::new(regularized)
        .ok_or(Error::SingularScatter)?
        .l();
    let min_pivot = l.diagonal().min();
    if min_pivot > 0.0 && min_pivot.is_finite() {
        Ok(l)
    } else {
        Err(Error::SingularScatter)
    }
}
