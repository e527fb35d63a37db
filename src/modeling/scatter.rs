//! Between-class and within-class scatter estimation.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::iter::{ParallelBridge, ParallelIterator};
use std::{iter::zip, ops::Add};

use crate::Error;

#[cfg(feature = "progress_bar")]
use crate::util::progress_bar;
#[cfg(feature = "progress_bar")]
use indicatif::ProgressIterator;

/// Compute the [`Scatter`] of labeled traces using [`ScatterProcessor`].
///
/// Labels are checked against `num_classes` before any accumulation.
///
/// # Examples
/// ```
/// use scatemplate::modeling::scatter::scatter;
/// use ndarray::array;
///
/// let traces = array![[0i16, 0], [2, 0], [4, 4], [4, 6]];
/// let labels = array![0u16, 0, 1, 1];
/// let scatter = scatter(traces.view(), labels.view(), 2, 2).unwrap();
/// assert_eq!(scatter.within(), array![[2., 0.], [0., 2.]]);
/// ```
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn scatter<T>(
    traces: ArrayView2<T>,
    labels: ArrayView1<u16>,
    num_classes: usize,
    batch_size: usize,
) -> Result<Scatter, Error>
where
    T: Into<i64> + Copy + Sync,
{
    assert!(batch_size > 0);

    if traces.shape()[0] != labels.len() {
        return Err(Error::Shape(format!(
            "{} traces but {} labels",
            traces.shape()[0],
            labels.len()
        )));
    }
    check_labels(labels, num_classes)?;

    let size = traces.shape()[1];
    let batches = zip(
        traces.axis_chunks_iter(Axis(0), batch_size),
        labels.axis_chunks_iter(Axis(0), batch_size),
    );
    #[cfg(feature = "progress_bar")]
    let batches = batches.progress_with(progress_bar(traces.shape()[0].div_ceil(batch_size)));

    // Accumulators are integers, so the merge order does not change the result.
    batches
        .par_bridge()
        .fold(
            || ScatterProcessor::new(size, num_classes),
            |mut scatter, (trace_batch, label_batch)| {
                scatter.process_batch(trace_batch, label_batch);
                scatter
            },
        )
        .reduce_with(|a, b| a + b)
        .unwrap_or_else(|| ScatterProcessor::new(size, num_classes))
        .finalize()
}

/// Return an error for the first label outside `[0, num_classes)`.
pub(crate) fn check_labels(labels: ArrayView1<u16>, num_classes: usize) -> Result<(), Error> {
    match labels
        .iter()
        .position(|&label| label as usize >= num_classes)
    {
        Some(index) => Err(Error::LabelRange {
            index,
            label: labels[index],
            num_classes,
        }),
        None => Ok(()),
    }
}

/// Class statistics of a labeled trace set.
#[derive(Debug, Clone)]
pub struct Scatter {
    /// Number of traces per class
    pub(crate) counts: Array1<usize>,
    /// Mean of all traces
    pub(crate) mean: Array1<f64>,
    /// Mean trace per class, shape `(nc, ns)`
    pub(crate) class_means: Array2<f64>,
    /// S_B = Σ_x n_x (μ_x - μ)(μ_x - μ)ᵗ
    pub(crate) between: Array2<f64>,
    /// S_W = Σ_x Σ_{i∈x} (l_i - μ_x)(l_i - μ_x)ᵗ
    pub(crate) within: Array2<f64>,
}

impl Scatter {
    /// Return the number of traces per class.
    pub fn counts(&self) -> ArrayView1<usize> {
        self.counts.view()
    }

    /// Return the global mean trace.
    pub fn mean(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    /// Return the mean trace of each class, one row per class.
    pub fn class_means(&self) -> ArrayView2<f64> {
        self.class_means.view()
    }

    /// Return the between-class scatter matrix.
    pub fn between(&self) -> ArrayView2<f64> {
        self.between.view()
    }

    /// Return the within-class scatter matrix.
    pub fn within(&self) -> ArrayView2<f64> {
        self.within.view()
    }

    /// Return the total number of traces.
    pub fn num_traces(&self) -> usize {
        self.counts.sum()
    }

    /// Return the number of samples per trace.
    pub fn size(&self) -> usize {
        self.mean.len()
    }

    /// Return the number of classes.
    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }
}

/// Processes labeled traces to compute class means and scatter matrices.
///
/// Sums are kept as `i64`: traces of `i16` samples can be accumulated up to 2^33 traces without
/// overflow.
#[derive(Debug, Clone)]
pub struct ScatterProcessor {
    /// Sum of traces per class
    classes_sum: Array2<i64>,
    /// Counts the number of traces per class
    classes_count: Array1<usize>,
    /// Sum of the outer products of traces with themselves
    sum_outer: Array2<i64>,
}

impl ScatterProcessor {
    /// Create a new scatter processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the input traces
    /// * `num_classes` - Number of classes
    pub fn new(size: usize, num_classes: usize) -> Self {
        Self {
            classes_sum: Array2::zeros((num_classes, size)),
            classes_count: Array1::zeros(num_classes),
            sum_outer: Array2::zeros((size, size)),
        }
    }

    /// Process an input trace to update internal accumulators.
    ///
    /// # Panics
    /// - Panics in debug if the length of the trace is different from the size of
    ///   [`ScatterProcessor`].
    /// - Panics if `class >= self.num_classes()`.
    pub fn process<T: Into<i64> + Copy>(&mut self, trace: ArrayView1<T>, class: usize) {
        debug_assert!(trace.len() == self.size());

        let trace: Array1<i64> = trace.mapv(|x| x.into());
        for i in 0..self.size() {
            self.classes_sum[[class, i]] += trace[i];
            for j in 0..self.size() {
                self.sum_outer[[i, j]] += trace[i] * trace[j];
            }
        }

        self.classes_count[class] += 1;
    }

    /// Process a batch of traces, one per row, with their classes.
    ///
    /// # Panics
    /// - Panics in debug if `traces.shape()[0] != classes.len()`.
    /// - Panics in debug if `traces.shape()[1] != self.size()`.
    /// - Panics if a class is greater or equal to `self.num_classes()`.
    pub fn process_batch<T: Into<i64> + Copy>(
        &mut self,
        traces: ArrayView2<T>,
        classes: ArrayView1<u16>,
    ) {
        debug_assert_eq!(traces.shape()[0], classes.len());
        debug_assert_eq!(traces.shape()[1], self.size());

        let traces: Array2<i64> = traces.mapv(|x| x.into());
        for (trace, &class) in zip(traces.rows(), classes.iter()) {
            let mut class_sum = self.classes_sum.row_mut(class as usize);
            class_sum += &trace;
            self.classes_count[class as usize] += 1;
        }

        self.sum_outer += &traces.t().dot(&traces);
    }

    /// Compute the class statistics of the traces processed so far.
    ///
    /// Fails with [`Error::EmptyClass`] if a class has not been given any trace.
    pub fn finalize(&self) -> Result<Scatter, Error> {
        if let Some(class) = self.classes_count.iter().position(|&count| count == 0) {
            return Err(Error::EmptyClass(class));
        }

        let counts = self.classes_count.mapv(|x| x as f64);
        let counts_col = counts.view().insert_axis(Axis(1));

        let class_means = self.classes_sum.mapv(|x| x as f64) / &counts_col;
        let mean = self
            .classes_sum
            .sum_axis(Axis(0))
            .mapv(|x| x as f64 / self.count() as f64);

        // S_W = Σ l lᵗ - Σ_x n_x μ_x μ_xᵗ
        let weighted_means = &class_means * &counts_col;
        let within = self.sum_outer.mapv(|x| x as f64) - class_means.t().dot(&weighted_means);

        let centered_means = &class_means - &mean.view().insert_axis(Axis(0));
        let between = centered_means
            .t()
            .dot(&(&centered_means * &counts_col));

        Ok(Scatter {
            counts: self.classes_count.clone(),
            mean,
            class_means,
            between: symmetrize(between),
            within: symmetrize(within),
        })
    }

    /// Return the trace size handled.
    pub fn size(&self) -> usize {
        self.classes_sum.shape()[1]
    }

    /// Return the number of classes handled.
    pub fn num_classes(&self) -> usize {
        self.classes_count.len()
    }

    /// Return the number of traces processed.
    pub fn count(&self) -> usize {
        self.classes_count.sum()
    }

    /// Determine if two [`ScatterProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.size() == other.size() && self.num_classes() == other.num_classes()
    }
}

impl Add for ScatterProcessor {
    type Output = Self;

    /// Merge computations of two [`ScatterProcessor`]. Processors need to be compatible to be
    /// merged together, otherwise it can panic or yield incoherent result (see
    /// [`ScatterProcessor::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            classes_sum: self.classes_sum + rhs.classes_sum,
            classes_count: self.classes_count + rhs.classes_count,
            sum_outer: self.sum_outer + rhs.sum_outer,
        }
    }
}

/// Return (A + Aᵗ) / 2.
pub(crate) fn symmetrize(a: Array2<f64>) -> Array2<f64> {
    (&a + &a.t()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::{ScatterProcessor, scatter};
    use crate::Error;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn test_scatter() {
        let mut processor = ScatterProcessor::new(2, 2);
        let traces = [array![0i16, 0], array![2, 0], array![4, 4], array![4, 6]];
        for (i, trace) in traces.iter().enumerate() {
            processor.process(trace.view(), i / 2);
        }
        let scatter = processor.finalize().unwrap();

        assert_eq!(scatter.counts(), array![2usize, 2]);
        assert_eq!(scatter.mean(), array![2.5, 2.5]);
        assert_eq!(scatter.class_means(), array![[1., 0.], [4., 5.]]);
        assert_eq!(scatter.within(), array![[2., 0.], [0., 2.]]);
        assert_eq!(scatter.between(), array![[9., 15.], [15., 25.]]);
    }

    #[test]
    fn test_scatter_helper() {
        let traces = array![
            [77i16, 137, 51, 91],
            [72, 61, 91, 83],
            [39, 49, 52, 23],
            [26, 114, 63, 45],
            [30, 8, 97, 91],
            [13, 68, 7, 45],
            [17, 181, 60, 34],
            [43, 88, 76, 78],
            [0, 36, 35, 0],
            [93, 191, 49, 26],
        ];
        let labels = array![0u16, 1, 2, 0, 1, 2, 0, 1, 2, 0];

        let mut processor = ScatterProcessor::new(4, 3);
        for (trace, &label) in traces.rows().into_iter().zip(labels.iter()) {
            processor.process(trace, label as usize);
        }
        let expected = processor.finalize().unwrap();

        for batch_size in [1, 3, 10] {
            let result = scatter(traces.view(), labels.view(), 3, batch_size).unwrap();
            assert_eq!(result.counts(), expected.counts());
            assert_eq!(result.class_means(), expected.class_means());
            assert_eq!(result.within(), expected.within());
            assert_eq!(result.between(), expected.between());
        }
    }

    #[test]
    fn test_scatter_matches_definition() {
        let traces = Array2::from_shape_fn((30, 3), |(i, j)| ((i * 7 + j * 13) % 17) as i16 - 8);
        let labels = Array1::from_shape_fn(30, |i| (i % 3) as u16);
        let result = scatter(traces.view(), labels.view(), 3, 4).unwrap();

        let mut within = Array2::<f64>::zeros((3, 3));
        for (trace, &label) in traces.rows().into_iter().zip(labels.iter()) {
            let residual = trace.mapv(|x| x as f64) - result.class_means().row(label as usize);
            for i in 0..3 {
                for j in 0..3 {
                    within[[i, j]] += residual[i] * residual[j];
                }
            }
        }

        for (a, b) in result.within().iter().zip(within.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
        // S_T = S_W + S_B
        let mut total = Array2::<f64>::zeros((3, 3));
        for trace in traces.rows() {
            let centered = trace.mapv(|x| x as f64) - result.mean();
            for i in 0..3 {
                for j in 0..3 {
                    total[[i, j]] += centered[i] * centered[j];
                }
            }
        }
        let sum = &result.within() + &result.between();
        for (a, b) in sum.iter().zip(total.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
    }

    #[test]
    fn test_empty_class() {
        let traces = array![[1i16, 2], [3, 4], [5, 6]];
        let labels = array![0u16, 2, 0];
        let result = scatter(traces.view(), labels.view(), 3, 2);
        assert!(matches!(result, Err(Error::EmptyClass(1))));
    }

    #[test]
    fn test_label_out_of_range() {
        let traces = array![[1i16, 2], [3, 4], [5, 6]];
        let labels = array![0u16, 1, 7];
        let result = scatter(traces.view(), labels.view(), 2, 2);
        assert!(matches!(
            result,
            Err(Error::LabelRange {
                index: 2,
                label: 7,
                num_classes: 2
            })
        ));
    }

    #[test]
    fn test_label_count_mismatch() {
        let traces = array![[1i16, 2], [3, 4], [5, 6]];
        let labels = array![0u16, 1];
        let result = scatter(traces.view(), labels.view(), 2, 2);
        assert!(matches!(result, Err(Error::Shape(_))));
    }
}
