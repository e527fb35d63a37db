//! Gaussian templates with a pooled covariance in the discriminant subspace.
use nalgebra::Cholesky;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::iter::zip;
use tracing::debug;

use crate::{
    Error,
    modeling::scatter::{check_labels, symmetrize},
    util::{from_dmatrix, map_row_batches, to_dmatrix, to_f64},
};

/// Smallest accepted ratio between the squared Cholesky pivots and the largest variance of the
/// pooled covariance.
const PIVOT_TOLERANCE: f64 = 1e-12;
/// Smallest accepted squared Cholesky pivot of `(n - nc) Σ` for normalized directions.
const WHITENED_TOLERANCE: f64 = 1e-3;

/// Cholesky factorization `Σ = L Lᵗ` of a covariance matrix, and its log-determinant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceDecomposition {
    /// Lower triangular factor `L`
    pub(crate) cholesky: Array2<f64>,
    /// log |Σ| = 2 Σ_i log L_ii
    pub(crate) log_det: f64,
}

impl CovarianceDecomposition {
    /// Factorize a covariance matrix.
    ///
    /// Fails with [`Error::SingularCovariance`] if the matrix is not (numerically) positive
    /// definite.
    pub fn new(covariance: ArrayView2<f64>) -> Result<Self, Error> {
        let size = covariance.shape()[0];
        if covariance.shape() != [size, size] {
            return Err(Error::Shape(format!(
                "covariance must be square, got {:?}",
                covariance.shape()
            )));
        }
        if size == 0 || covariance.iter().any(|x| !x.is_finite()) {
            return Err(Error::SingularCovariance);
        }

        let sigma = to_dmatrix(covariance);
        let max_var = sigma.diagonal().max();
        let l = Cholesky::new(sigma)
            .ok_or(Error::SingularCovariance)?
            .l();

        let min_pivot = l.diagonal().min();
        if !(min_pivot > 0.0 && min_pivot * min_pivot > PIVOT_TOLERANCE * max_var) {
            return Err(Error::SingularCovariance);
        }

        let log_det = 2.0 * l.diagonal().iter().map(|x| x.ln()).sum::<f64>();

        Ok(Self {
            cholesky: from_dmatrix(&l),
            log_det,
        })
    }

    /// Build a decomposition from a previously computed factor, without any check.
    ///
    /// [`crate::modeling::LdaModel::from_state`] validates the factor against its covariance.
    pub fn from_parts(cholesky: Array2<f64>, log_det: f64) -> Self {
        Self { cholesky, log_det }
    }

    /// Return the lower triangular Cholesky factor.
    pub fn cholesky(&self) -> ArrayView2<f64> {
        self.cholesky.view()
    }

    /// Return the natural logarithm of the covariance determinant.
    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    /// Return the dimension of the factorized matrix.
    pub fn dim(&self) -> usize {
        self.cholesky.shape()[0]
    }

    /// Compute `L⁻¹ rhs` by forward substitution.
    pub(crate) fn solve_lower(&self, rhs: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
        let l = to_dmatrix(self.cholesky.view());
        l.solve_lower_triangular(&to_dmatrix(rhs))
            .map(|x| from_dmatrix(&x))
            .ok_or(Error::SingularCovariance)
    }
}

/// Per-class means and pooled covariance of projected traces.
#[derive(Debug, Clone)]
pub struct Templates {
    /// Mean of the projected traces of each class, shape `(nc, p)`
    pub(crate) means: Array2<f64>,
    /// Pooled covariance, shape `(p, p)`
    pub(crate) covariance: Array2<f64>,
    pub(crate) decomposition: CovarianceDecomposition,
    /// Residual degrees of freedom `n - nc`
    pub(crate) dof: usize,
}

impl Templates {
    /// Return the class means, one row per class.
    pub fn means(&self) -> ArrayView2<f64> {
        self.means.view()
    }

    /// Return the pooled covariance.
    pub fn covariance(&self) -> ArrayView2<f64> {
        self.covariance.view()
    }

    /// Return the factorization of the pooled covariance.
    pub fn decomposition(&self) -> &CovarianceDecomposition {
        &self.decomposition
    }

    /// Check the pooled covariance of directions normalized by `vᵗ S_W v = 1`.
    ///
    /// Such directions have a pooled covariance close to `I / (n - nc)`. A direction whose
    /// within-class variance comes from the ridge added to a singular `S_W` instead has a
    /// vanishing variance, and is rejected with [`Error::SingularCovariance`].
    pub fn check_normalized(&self) -> Result<(), Error> {
        let min_pivot = self
            .decomposition
            .cholesky
            .diag()
            .fold(f64::INFINITY, |acc, &x| acc.min(x));
        let whitened_var = min_pivot * min_pivot * self.dof as f64;
        if !(whitened_var >= WHITENED_TOLERANCE) {
            debug!(
                whitened_var,
                "discriminant direction has no within-class variance"
            );
            return Err(Error::SingularCovariance);
        }

        Ok(())
    }
}

/// Fit the Gaussian templates of the traces projected by `projection`.
///
/// The covariance is pooled over all classes from the residuals `W l_i - μ_x(i)` and normalized by
/// the `n - nc` residual degrees of freedom.
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn fit_templates<T>(
    traces: ArrayView2<T>,
    labels: ArrayView1<u16>,
    num_classes: usize,
    projection: ArrayView2<f64>,
    batch_size: usize,
) -> Result<Templates, Error>
where
    T: Into<i64> + Copy + Sync,
{
    let (num_traces, size) = (traces.shape()[0], traces.shape()[1]);
    let dim = projection.shape()[0];
    if num_traces != labels.len() {
        return Err(Error::Shape(format!(
            "{num_traces} traces but {} labels",
            labels.len()
        )));
    }
    if projection.shape()[1] != size {
        return Err(Error::Shape(format!(
            "traces have {size} samples, projection expects {}",
            projection.shape()[1]
        )));
    }
    check_labels(labels, num_classes)?;

    let projected = map_row_batches(traces, batch_size, dim, |batch| {
        to_f64(batch).dot(&projection.t())
    })?;

    let mut sums = Array2::<f64>::zeros((num_classes, dim));
    let mut counts = Array1::<usize>::zeros(num_classes);
    for (row, &label) in zip(projected.rows(), labels.iter()) {
        let mut sum = sums.row_mut(label as usize);
        sum += &row;
        counts[label as usize] += 1;
    }
    if let Some(class) = counts.iter().position(|&count| count == 0) {
        return Err(Error::EmptyClass(class));
    }
    let means = sums / &counts.mapv(|x| x as f64).insert_axis(Axis(1));

    let dof = num_traces.saturating_sub(num_classes);
    if dof == 0 {
        debug!(
            num_traces,
            num_classes, "not enough traces to estimate the pooled covariance"
        );
        return Err(Error::SingularCovariance);
    }

    let indices: Vec<usize> = labels.iter().map(|&x| x as usize).collect();
    let residuals = &projected - &means.select(Axis(0), &indices);
    let covariance = symmetrize(residuals.t().dot(&residuals) / dof as f64);

    let decomposition = CovarianceDecomposition::new(covariance.view())?;
    debug!(log_det = decomposition.log_det, "pooled covariance factorized");

    Ok(Templates {
        means,
        covariance,
        decomposition,
        dof,
    })
}

#[cfg(test)]
mod tests {
    use super::{CovarianceDecomposition, fit_templates};
    use crate::Error;
    use ndarray::{Array2, array};

    fn assert_close(a: f64, b: f64) {
        assert!(
            (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0),
            "{a} != {b}"
        );
    }

    #[test]
    fn test_decomposition() {
        let covariance = array![[4.0, 2.0], [2.0, 3.0]];
        let decomposition = CovarianceDecomposition::new(covariance.view()).unwrap();

        let l = decomposition.cholesky();
        assert_eq!(l[[0, 1]], 0.0);
        let product = l.dot(&l.t());
        for (a, b) in product.iter().zip(covariance.iter()) {
            assert_close(*a, *b);
        }
        // det = 4 * 3 - 2 * 2
        assert_close(decomposition.log_det(), 8f64.ln());
        assert_eq!(decomposition.dim(), 2);

        let solved = decomposition.solve_lower(l).unwrap();
        for (a, b) in solved.iter().zip(Array2::<f64>::eye(2).iter()) {
            assert_close(*a, *b);
        }
    }

    #[test]
    fn test_decomposition_not_positive_definite() {
        let covariance = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            CovarianceDecomposition::new(covariance.view()),
            Err(Error::SingularCovariance)
        ));
        let covariance = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(matches!(
            CovarianceDecomposition::new(covariance.view()),
            Err(Error::SingularCovariance)
        ));
        let covariance = array![[f64::NAN, 0.0], [0.0, 1.0]];
        assert!(matches!(
            CovarianceDecomposition::new(covariance.view()),
            Err(Error::SingularCovariance)
        ));
    }

    #[test]
    fn test_fit_templates() {
        let traces = array![[1i16, 0], [3, 0], [2, 10], [10, 0], [12, 10], [14, 20]];
        let labels = array![0u16, 0, 0, 1, 1, 1];
        // Project on the first sample only
        let projection = array![[1.0, 0.0]];
        let templates = fit_templates(traces.view(), labels.view(), 2, projection.view(), 4).unwrap();

        assert_eq!(templates.means(), array![[2.0], [12.0]]);
        // Residuals: -1, 1, 0, -2, 0, 2 over 6 - 2 degrees of freedom
        assert_close(templates.covariance()[[0, 0]], 10.0 / 4.0);
        assert_close(templates.decomposition().log_det(), 2.5f64.ln());
        assert!(templates.check_normalized().is_ok());
    }

    #[test]
    fn test_vanishing_direction_is_rejected() {
        let traces = array![[1i16, 0], [3, 0], [2, 10], [10, 0], [12, 10], [14, 20]];
        let labels = array![0u16, 0, 0, 1, 1, 1];
        // (n - nc) Σ = 1e-6 * 10
        let projection = array![[1e-3, 0.0]];
        let templates =
            fit_templates(traces.view(), labels.view(), 2, projection.view(), 4).unwrap();

        assert!(templates.covariance()[[0, 0]] > 0.0);
        assert!(matches!(
            templates.check_normalized(),
            Err(Error::SingularCovariance)
        ));
    }

    #[test]
    fn test_fit_templates_not_enough_traces() {
        let traces = array![[1i16, 0], [10, 0]];
        let labels = array![0u16, 1];
        let projection = array![[1.0, 0.0]];
        assert!(matches!(
            fit_templates(traces.view(), labels.view(), 2, projection.view(), 4),
            Err(Error::SingularCovariance)
        ));
    }

    #[test]
    fn test_fit_templates_shape_mismatch() {
        let traces = array![[1i16, 0, 0], [10, 0, 0]];
        let labels = array![0u16, 1];
        let projection = array![[1.0, 0.0]];
        assert!(matches!(
            fit_templates(traces.view(), labels.view(), 2, projection.view(), 4),
            Err(Error::Shape(_))
        ));
    }
}
