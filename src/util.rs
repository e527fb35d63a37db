//! Convenient utility functions.

use std::cmp::Ordering;

use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::Error;

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64).with_style(
        ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Return an array where the i-th element contains the maximum of the i-th row of the input array.
///
/// NaN values compare greater than any other value (see [`f64::total_cmp`]). Empty rows yield
/// `f64::NEG_INFINITY`.
pub fn max_per_row(arr: ArrayView2<f64>) -> Array1<f64> {
    arr.axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .copied()
                .reduce(|a, b| if a.total_cmp(&b).is_lt() { b } else { a })
                .unwrap_or(f64::NEG_INFINITY)
        })
        .collect()
}

/// Return the indices that would sort the given array with a comparison function.
///
/// The sort is stable: equal elements keep their original relative order.
pub fn argsort_by<T, F>(data: &[T], compare: F) -> Vec<usize>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut indices: Vec<usize> = (0..data.len()).collect();

    indices.sort_by(|&a, &b| compare(&data[a], &data[b]));

    indices
}

/// Return the index of the maximum value in the given array.
///
/// The first index is returned when several elements are maximal.
pub fn argmax_by<T, F>(array: ArrayView1<T>, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut idx_max = 0;

    for i in 0..array.shape()[0] {
        if compare(&array[i], &array[idx_max]).is_gt() {
            idx_max = i;
        }
    }

    idx_max
}

/// Copy an [`ndarray`] matrix into a [`nalgebra`] one.
pub fn to_dmatrix(arr: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(arr.nrows(), arr.ncols(), |i, j| arr[[i, j]])
}

/// Copy a [`nalgebra`] matrix into an [`ndarray`] one.
pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Apply `f` to batches of `batch_size` rows in parallel and stack the results in input order.
///
/// `f` must return `out_cols` columns and as many rows as its input batch. The output does not
/// depend on `batch_size` nor on thread scheduling.
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn map_row_batches<T, F>(
    rows: ArrayView2<T>,
    batch_size: usize,
    out_cols: usize,
    f: F,
) -> Result<Array2<f64>, Error>
where
    T: Sync,
    F: Fn(ArrayView2<T>) -> Array2<f64> + Send + Sync,
{
    assert!(batch_size > 0);

    let batches: Vec<ArrayView2<T>> = rows.axis_chunks_iter(Axis(0), batch_size).collect();
    if batches.is_empty() {
        return Ok(Array2::zeros((0, out_cols)));
    }

    let results: Vec<Array2<f64>> = batches.into_par_iter().map(f).collect();
    let views: Vec<ArrayView2<f64>> = results.iter().map(|r| r.view()).collect();

    concatenate(Axis(0), &views).map_err(|e| Error::Shape(e.to_string()))
}

/// Convert integer traces to floating point.
pub fn to_f64<T: Into<i64> + Copy>(traces: ArrayView2<T>) -> Array2<f64> {
    traces.mapv(|x| Into::<i64>::into(x) as f64)
}

#[cfg(test)]
mod tests {
    use super::{argmax_by, argsort_by, from_dmatrix, map_row_batches, max_per_row, to_dmatrix};
    use ndarray::{Array2, array};

    #[test]
    fn test_argsort_descending_is_stable() {
        let data = [1.0f64, 3.0, 2.0, 3.0];
        assert_eq!(argsort_by(&data, |a, b| b.total_cmp(a)), vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_argmax_first_of_ties() {
        let data = array![-4.0f64, 4.0, 1.0, -4.0];
        assert_eq!(argmax_by(data.view(), |a, b| a.abs().total_cmp(&b.abs())), 0);
        assert_eq!(argmax_by(data.view(), f64::total_cmp), 1);
    }

    #[test]
    fn test_max_per_row() {
        let arr = array![[1.0, -2.0, 0.5], [-7.0, -3.0, -9.0]];
        assert_eq!(max_per_row(arr.view()), array![1.0, -3.0]);
    }

    #[test]
    fn test_dmatrix_conversion() {
        let arr = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let m = to_dmatrix(arr.view());
        assert_eq!(m[(1, 0)], 4.0);
        assert_eq!(m[(0, 2)], 3.0);
        assert_eq!(from_dmatrix(&m), arr);
    }

    #[test]
    fn test_map_row_batches_keeps_order() {
        let rows = Array2::from_shape_fn((11, 2), |(i, j)| (i * 2 + j) as i16);
        let expected = rows.mapv(|x| x as f64 * 2.0);
        for batch_size in [1, 3, 11, 20] {
            let result =
                map_row_batches(rows.view(), batch_size, 2, |b| b.mapv(|x| x as f64 * 2.0))
                    .unwrap();
            assert_eq!(result, expected);
        }

        let empty = Array2::<i16>::zeros((0, 2));
        let result = map_row_batches(empty.view(), 4, 5, |b| b.mapv(|x| x as f64)).unwrap();
        assert_eq!(result.shape(), &[0, 5]);
    }
}
