//! Template classifier over a linear discriminant subspace.
//!
//! The leakage `l` of `ns` samples is reduced to `p` dimensions by the LDA projection `W`, then
//! each class `x` is modeled by a Gaussian `N(μ_x, Σ)` sharing a single covariance `Σ`:
//!
//! `log f(l|x) = -½ [p log(2π) + log |Σ| + (Wl - μ_x)ᵗ Σ⁻¹ (Wl - μ_x)]`
//!
//! and class probabilities follow from Bayes' law with a uniform prior:
//! `pr(x|l) = f(l|x) / Σ_x* f(l|x*)`.
//!
//! See François-Xavier Standaert and Cédric Archambeau, "Using Subspace-Based Template Attacks to
//! Compare and Combine Power and Electromagnetic Information Leakages", CHES 2008.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::{fs::File, iter::zip, path::Path, sync::Arc};
use tracing::{debug, info};

use crate::{
    Error,
    modeling::{
        projection::fisher_projection,
        scatter::scatter,
        template::{CovarianceDecomposition, fit_templates},
    },
    util::{argmax_by, map_row_batches, max_per_row, to_f64},
};

/// Exclusive upper bound of the number of classes.
pub const MAX_CLASSES: usize = 1 << 16;
/// Default number of traces processed per parallel batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// log(2π)
const LN_2PI: f64 = 1.8378770664093453;
/// Relative tolerance used when checking an imported covariance against its factorization.
const STATE_TOLERANCE: f64 = 1e-8;

/// Check the classifier dimensions: `1 <= p < nc < 2^16`, `ns >= 1` and `p <= ns`.
pub fn check_dimensions(num_classes: usize, dim: usize, size: usize) -> Result<(), Error> {
    if num_classes >= MAX_CLASSES {
        return Err(Error::Configuration(format!(
            "number of classes {num_classes} must be smaller than {MAX_CLASSES}"
        )));
    }
    if dim == 0 || dim >= num_classes {
        return Err(Error::Configuration(format!(
            "subspace dimension {dim} must be in [1, {num_classes})"
        )));
    }
    if size == 0 {
        return Err(Error::Configuration(
            "traces must have at least one sample".to_string(),
        ));
    }
    if dim > size {
        return Err(Error::Configuration(format!(
            "subspace dimension {dim} exceeds the number of samples {size}"
        )));
    }

    Ok(())
}

/// Flat parameter set of a fitted [`LdaModel`].
///
/// It fully determines the model: [`LdaModel::from_state`] rebuilds an equivalent model from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Number of classes
    pub nc: usize,
    /// Dimension of the discriminant subspace
    pub p: usize,
    /// Number of samples per trace
    pub ns: usize,
    /// Projection matrix `W`, shape `(p, ns)`
    pub projection: Array2<f64>,
    /// Class means in the subspace, shape `(nc, p)`
    pub means: Array2<f64>,
    /// Pooled covariance, shape `(p, p)`
    pub covariance: Array2<f64>,
    pub covariance_decomposition: CovarianceDecomposition,
}

/// A fitted LDA template model.
///
/// The model is immutable: it can be shared between threads and used for concurrent predictions.
#[derive(Debug, Clone)]
pub struct LdaModel {
    num_classes: usize,
    dim: usize,
    size: usize,
    projection: Array2<f64>,
    means: Array2<f64>,
    covariance: Array2<f64>,
    decomposition: CovarianceDecomposition,
    /// L⁻¹ W, so that the whitened point of a trace `l` is `L⁻¹ W l`
    whitened_projection: Array2<f64>,
    /// L⁻¹ μ_x, one row per class
    whitened_means: Array2<f64>,
}

impl LdaModel {
    /// Fit a model on labeled traces.
    ///
    /// # Arguments
    ///
    /// * `num_classes` - Number of classes `nc`
    /// * `dim` - Dimension `p` of the discriminant subspace
    /// * `traces` - Training traces, shape `(n, ns)`
    /// * `labels` - Class of each trace, in `[0, nc)`
    /// * `batch_size` - Number of traces per parallel batch
    pub fn fit<T>(
        num_classes: usize,
        dim: usize,
        traces: ArrayView2<T>,
        labels: ArrayView1<u16>,
        batch_size: usize,
    ) -> Result<Self, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        let (num_traces, size) = (traces.shape()[0], traces.shape()[1]);
        check_dimensions(num_classes, dim, size)?;
        if batch_size == 0 {
            return Err(Error::Configuration(
                "batch size must be strictly positive".to_string(),
            ));
        }
        if num_traces != labels.len() {
            return Err(Error::Shape(format!(
                "{num_traces} traces but {} labels",
                labels.len()
            )));
        }

        let scatter = scatter(traces, labels, num_classes, batch_size)?;
        debug!(counts = ?scatter.counts(), "scatter matrices estimated");

        let projection = fisher_projection(&scatter, dim)?;
        let templates = fit_templates(traces, labels, num_classes, projection.matrix(), batch_size)?;
        templates.check_normalized()?;

        let model = Self::from_parts(
            projection.matrix,
            templates.means,
            templates.covariance,
            templates.decomposition,
        )?;
        info!(
            nc = num_classes,
            p = dim,
            ns = size,
            n = num_traces,
            "LDA model fitted"
        );

        Ok(model)
    }

    /// Rebuild a model from an exported [`ModelState`].
    ///
    /// The state is rejected with [`Error::StateValidation`] if its arrays do not match its
    /// dimensions, contain non-finite values, or if the decomposition does not factorize the
    /// covariance.
    pub fn from_state(state: ModelState) -> Result<Self, Error> {
        validate_state(&state)?;

        let model = Self::from_parts(
            state.projection,
            state.means,
            state.covariance,
            state.covariance_decomposition,
        )
        .map_err(|e| Error::StateValidation(e.to_string()))?;
        info!(
            nc = model.num_classes,
            p = model.dim,
            ns = model.size,
            "LDA model imported"
        );

        Ok(model)
    }

    fn from_parts(
        projection: Array2<f64>,
        means: Array2<f64>,
        covariance: Array2<f64>,
        decomposition: CovarianceDecomposition,
    ) -> Result<Self, Error> {
        let whitened_projection = decomposition.solve_lower(projection.view())?;
        let whitened_means = decomposition.solve_lower(means.t())?.reversed_axes();

        Ok(Self {
            num_classes: means.shape()[0],
            dim: projection.shape()[0],
            size: projection.shape()[1],
            projection,
            means,
            covariance,
            decomposition,
            whitened_projection,
            whitened_means,
        })
    }

    /// Export the parameters of the model.
    pub fn state(&self) -> ModelState {
        ModelState {
            nc: self.num_classes,
            p: self.dim,
            ns: self.size,
            projection: self.projection.clone(),
            means: self.means.clone(),
            covariance: self.covariance.clone(),
            covariance_decomposition: self.decomposition.clone(),
        }
    }

    /// Project traces in the discriminant subspace.
    pub fn project<T>(&self, traces: ArrayView2<T>) -> Result<Array2<f64>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.check_traces(traces)?;

        map_row_batches(traces, DEFAULT_BATCH_SIZE, self.dim, |batch| {
            to_f64(batch).dot(&self.projection.t())
        })
    }

    /// Return the log-likelihood `log f(l|x)` of each trace (row) for each class (column).
    pub fn log_likelihood<T>(&self, traces: ArrayView2<T>) -> Result<Array2<f64>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.check_traces(traces)?;

        map_row_batches(traces, DEFAULT_BATCH_SIZE, self.num_classes, |batch| {
            self.log_densities(batch)
        })
    }

    /// Return the log of the class probabilities of each trace, shape `(m, nc)`.
    pub fn predict_log_proba<T>(&self, traces: ArrayView2<T>) -> Result<Array2<f64>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.check_traces(traces)?;

        map_row_batches(traces, DEFAULT_BATCH_SIZE, self.num_classes, |batch| {
            log_normalize(self.log_densities(batch))
        })
    }

    /// Return the probability of each class for each trace, shape `(m, nc)`.
    ///
    /// Each row sums to 1.
    pub fn predict_proba<T>(&self, traces: ArrayView2<T>) -> Result<Array2<f64>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.check_traces(traces)?;

        map_row_batches(traces, DEFAULT_BATCH_SIZE, self.num_classes, |batch| {
            let mut probabilities = log_normalize(self.log_densities(batch)).mapv(f64::exp);
            for mut row in probabilities.rows_mut() {
                let sum = row.sum();
                row /= sum;
            }
            probabilities
        })
    }

    /// Return the most likely class of each trace.
    ///
    /// The lowest class is returned when several classes are equally likely.
    pub fn predict<T>(&self, traces: ArrayView2<T>) -> Result<Array1<u16>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        let log_likelihood = self.log_likelihood(traces)?;

        Ok(log_likelihood
            .rows()
            .into_iter()
            .map(|row| argmax_by(row, f64::total_cmp) as u16)
            .collect())
    }

    /// Compute the Gaussian log-densities of a batch of traces.
    fn log_densities<T>(&self, batch: ArrayView2<T>) -> Array2<f64>
    where
        T: Into<i64> + Copy,
    {
        let whitened = to_f64(batch).dot(&self.whitened_projection.t());
        let constant = self.dim as f64 * LN_2PI + self.decomposition.log_det();

        let mut log_densities = Array2::zeros((batch.shape()[0], self.num_classes));
        for (point, mut row) in zip(whitened.rows(), log_densities.rows_mut()) {
            for (class, mean) in self.whitened_means.rows().into_iter().enumerate() {
                // (Wl - μ)ᵗ Σ⁻¹ (Wl - μ) = |L⁻¹Wl - L⁻¹μ|²
                let distance: f64 = zip(point.iter(), mean.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                row[class] = -0.5 * (constant + distance);
            }
        }

        log_densities
    }

    fn check_traces<T>(&self, traces: ArrayView2<T>) -> Result<(), Error> {
        if traces.shape()[1] != self.size {
            return Err(Error::Shape(format!(
                "traces have {} samples, model expects {}",
                traces.shape()[1],
                self.size
            )));
        }

        Ok(())
    }

    /// Return the number of classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Return the dimension of the discriminant subspace.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Return the number of samples per trace.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Return the projection matrix `W`, shape `(p, ns)`.
    pub fn projection(&self) -> ArrayView2<f64> {
        self.projection.view()
    }

    /// Return the class means in the subspace, shape `(nc, p)`.
    pub fn means(&self) -> ArrayView2<f64> {
        self.means.view()
    }

    /// Return the pooled covariance, shape `(p, p)`.
    pub fn covariance(&self) -> ArrayView2<f64> {
        self.covariance.view()
    }

    pub fn decomposition(&self) -> &CovarianceDecomposition {
        &self.decomposition
    }
}

/// Turn log-likelihoods into log-probabilities, row by row (log-sum-exp).
fn log_normalize(mut log_densities: Array2<f64>) -> Array2<f64> {
    let max = max_per_row(log_densities.view());
    for (mut row, max) in zip(log_densities.rows_mut(), max) {
        row -= max;
        let log_sum = row.mapv(f64::exp).sum().ln();
        row -= log_sum;
    }

    log_densities
}

fn validate_state(state: &ModelState) -> Result<(), Error> {
    let ModelState {
        nc,
        p,
        ns,
        projection,
        means,
        covariance,
        covariance_decomposition,
    } = state;
    let (nc, p, ns) = (*nc, *p, *ns);
    let cholesky = covariance_decomposition.cholesky();
    let log_det = covariance_decomposition.log_det();

    check_dimensions(nc, p, ns).map_err(|e| Error::StateValidation(e.to_string()))?;

    for (name, shape, expected) in [
        ("projection", projection.shape(), [p, ns]),
        ("means", means.shape(), [nc, p]),
        ("covariance", covariance.shape(), [p, p]),
        ("covariance decomposition", cholesky.shape(), [p, p]),
    ] {
        if shape != expected {
            return Err(Error::StateValidation(format!(
                "{name} has shape {shape:?}, expected {expected:?}"
            )));
        }
    }

    let all_finite = projection
        .iter()
        .chain(means.iter())
        .chain(covariance.iter())
        .chain(cholesky.iter())
        .all(|x| x.is_finite());
    if !all_finite || !log_det.is_finite() {
        return Err(Error::StateValidation(
            "parameters contain non-finite values".to_string(),
        ));
    }

    let scale = covariance.iter().fold(0f64, |acc, x| acc.max(x.abs()));
    for i in 0..p {
        if cholesky[[i, i]] <= 0.0 {
            return Err(Error::StateValidation(
                "covariance decomposition has a non-positive diagonal".to_string(),
            ));
        }
        for j in (i + 1)..p {
            if cholesky[[i, j]] != 0.0 {
                return Err(Error::StateValidation(
                    "covariance decomposition is not lower triangular".to_string(),
                ));
            }
            if (covariance[[i, j]] - covariance[[j, i]]).abs() > STATE_TOLERANCE * scale {
                return Err(Error::StateValidation(
                    "covariance is not symmetric".to_string(),
                ));
            }
        }
    }

    let product = cholesky.dot(&cholesky.t());
    if zip(product.iter(), covariance.iter()).any(|(a, b)| (a - b).abs() > STATE_TOLERANCE * scale)
    {
        return Err(Error::StateValidation(
            "covariance decomposition does not factorize the covariance".to_string(),
        ));
    }

    let expected_log_det = 2.0 * cholesky.diag().mapv(f64::ln).sum();
    if (expected_log_det - log_det).abs() > STATE_TOLERANCE * expected_log_det.abs().max(1.0) {
        return Err(Error::StateValidation(format!(
            "log-determinant {log_det} does not match the decomposition ({expected_log_det})"
        )));
    }

    Ok(())
}

/// LDA template classifier.
///
/// The classifier holds its construction parameters and, once fitted or imported, an immutable
/// [`LdaModel`]. Fitting again replaces the whole model; a failed fit leaves the previous model in
/// place.
///
/// # Examples
/// ```
/// use scatemplate::modeling::LdaClassifier;
/// use ndarray::array;
///
/// let traces = array![[0i16, 1], [1, 0], [0, 0], [100, 101], [101, 100], [100, 100]];
/// let labels = array![0u16, 0, 0, 1, 1, 1];
///
/// let mut lda = LdaClassifier::new(2, 1, 2).unwrap();
/// lda.fit(traces.view(), labels.view()).unwrap();
/// let probabilities = lda.predict_proba(array![[99i16, 100]].view()).unwrap();
/// assert!(probabilities[[0, 1]] > 0.99);
/// ```
#[derive(Debug, Clone)]
pub struct LdaClassifier {
    /// Number of classes
    num_classes: usize,
    /// Dimension of the discriminant subspace
    dim: usize,
    /// Number of samples per trace
    size: usize,
    /// Number of traces per parallel batch during fit
    batch_size: usize,
    model: Option<Arc<LdaModel>>,
}

impl LdaClassifier {
    /// Create a new classifier.
    ///
    /// # Arguments
    ///
    /// * `num_classes` - Number of classes `nc` (e.g. 256 for an 8-bit target), smaller than 2^16
    /// * `dim` - Dimension `p` of the discriminant subspace, smaller than `nc`
    /// * `size` - Number of samples `ns` per trace
    pub fn new(num_classes: usize, dim: usize, size: usize) -> Result<Self, Error> {
        check_dimensions(num_classes, dim, size)?;

        Ok(Self {
            num_classes,
            dim,
            size,
            batch_size: DEFAULT_BATCH_SIZE,
            model: None,
        })
    }

    /// Create a fitted classifier from an exported [`ModelState`].
    pub fn from_state(state: ModelState) -> Result<Self, Error> {
        let model = LdaModel::from_state(state)?;

        Ok(Self {
            num_classes: model.num_classes(),
            dim: model.dim(),
            size: model.size(),
            batch_size: DEFAULT_BATCH_SIZE,
            model: Some(Arc::new(model)),
        })
    }

    /// Set the number of traces processed per parallel batch during fit.
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, Error> {
        if batch_size == 0 {
            return Err(Error::Configuration(
                "batch size must be strictly positive".to_string(),
            ));
        }
        self.batch_size = batch_size;

        Ok(self)
    }

    /// Estimate the projection, the class means and the pooled covariance.
    ///
    /// Calling this method twice replaces the previous model. On error, the previous model (if
    /// any) is kept.
    pub fn fit<T>(&mut self, traces: ArrayView2<T>, labels: ArrayView1<u16>) -> Result<(), Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        if traces.shape()[1] != self.size {
            return Err(Error::Shape(format!(
                "traces have {} samples, classifier expects {}",
                traces.shape()[1],
                self.size
            )));
        }

        let model = LdaModel::fit(self.num_classes, self.dim, traces, labels, self.batch_size)?;
        self.model = Some(Arc::new(model));

        Ok(())
    }

    /// Return the probability of each class for each trace, shape `(m, nc)`.
    pub fn predict_proba<T>(&self, traces: ArrayView2<T>) -> Result<Array2<f64>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.fitted()?.predict_proba(traces)
    }

    /// Return the log of the class probabilities of each trace, shape `(m, nc)`.
    pub fn predict_log_proba<T>(&self, traces: ArrayView2<T>) -> Result<Array2<f64>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.fitted()?.predict_log_proba(traces)
    }

    /// Return the most likely class of each trace.
    pub fn predict<T>(&self, traces: ArrayView2<T>) -> Result<Array1<u16>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.fitted()?.predict(traces)
    }

    /// Project traces in the discriminant subspace, shape `(m, p)`.
    pub fn project<T>(&self, traces: ArrayView2<T>) -> Result<Array2<f64>, Error>
    where
        T: Into<i64> + Copy + Sync,
    {
        self.fitted()?.project(traces)
    }

    /// Export the parameters of the fitted model.
    pub fn export_state(&self) -> Result<ModelState, Error> {
        Ok(self.fitted()?.state())
    }

    /// Replace the model by one rebuilt from `state`.
    ///
    /// The state must have the dimensions this classifier was created with.
    pub fn import_state(&mut self, state: ModelState) -> Result<(), Error> {
        if (state.nc, state.p, state.ns) != (self.num_classes, self.dim, self.size) {
            return Err(Error::StateValidation(format!(
                "state dimensions (nc={}, p={}, ns={}) do not match classifier (nc={}, p={}, ns={})",
                state.nc, state.p, state.ns, self.num_classes, self.dim, self.size
            )));
        }

        let model = LdaModel::from_state(state)?;
        self.model = Some(Arc::new(model));

        Ok(())
    }

    /// Return a shared handle on the current model, if any.
    ///
    /// The handle stays valid and unchanged if the classifier is fitted again.
    pub fn model(&self) -> Option<Arc<LdaModel>> {
        self.model.clone()
    }

    /// Return true once the classifier has been fitted or has imported a state.
    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    /// Return the number of classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Return the dimension of the discriminant subspace.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Return the number of samples per trace.
    pub fn size(&self) -> usize {
        self.size
    }

    fn fitted(&self) -> Result<&LdaModel, Error> {
        self.model.as_deref().ok_or(Error::UnfittedModel)
    }

    /// Save the fitted model to a file.
    ///
    /// # Warning
    /// The file format is not stable as scatemplate is in active development. Thus, the format
    /// might change between versions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let state = self.export_state()?;
        let file = File::create(path)?;
        serde_json::to_writer(file, &state)?;

        Ok(())
    }

    /// Load a fitted classifier from a file.
    ///
    /// # Warning
    /// The file format is not stable as scatemplate is in active development. Thus, the format
    /// might change between versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let state: ModelState = serde_json::from_reader(file)?;

        Self::from_state(state)
    }
}
