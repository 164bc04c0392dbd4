//! Software-side averaging of captures.
//!
//! A capture of `num_avgs` back-to-back acquisition windows is baseline-subtracted against its
//! own mean, cut into `num_avgs` equal contiguous chunks and averaged elementwise.

use ndarray::{s, Array1, Array2, Axis};
use std::fmt;
use std::str::FromStr;

use crate::error::*;

/// A validated averaging count: a positive integer.
///
/// ```
/// use x6compiler_backend::NumAvgs;
/// assert_eq!(NumAvgs::try_from(5i64).unwrap().get(), 5);
/// assert_eq!("5".parse::<NumAvgs>().unwrap().get(), 5);
/// assert!(NumAvgs::try_from(0i64).is_err());
/// assert!("abc".parse::<NumAvgs>().is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumAvgs(usize);

impl NumAvgs {
    pub fn new(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(Error::InvalidArgument(
                "num_avgs must be a positive integer, got 0".to_string(),
            ));
        }
        Ok(NumAvgs(value))
    }

    pub fn get(self) -> usize {
        self.0
    }

    /// Converts a float the way Python's `int()` does, truncating toward zero.
    ///
    /// ```
    /// use x6compiler_backend::NumAvgs;
    /// assert_eq!(NumAvgs::from_f64(4.0).unwrap().get(), 4);
    /// assert_eq!(NumAvgs::from_f64(2.7).unwrap().get(), 2);
    /// assert!(NumAvgs::from_f64(0.5).is_err());
    /// assert!(NumAvgs::from_f64(f64::NAN).is_err());
    /// ```
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() || value.trunc() > i64::MAX as f64 {
            return Err(Error::InvalidArgument(format!(
                "num_avgs must be a positive integer, got {}",
                value
            )));
        }
        NumAvgs::try_from(value.trunc() as i64)
    }
}

impl TryFrom<i64> for NumAvgs {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        if value < 1 {
            return Err(Error::InvalidArgument(format!(
                "num_avgs must be a positive integer, got {}",
                value
            )));
        }
        usize::try_from(value)
            .map(NumAvgs)
            .map_err(|_| Error::InvalidArgument(format!("num_avgs {} is too large", value)))
    }
}

impl FromStr for NumAvgs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: i64 = s.trim().parse().map_err(|_| {
            Error::InvalidArgument(format!("num_avgs must be a positive integer, got `{}`", s))
        })?;
        NumAvgs::try_from(value)
    }
}

impl TryFrom<&str> for NumAvgs {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}

/// One average.
impl Default for NumAvgs {
    fn default() -> Self {
        NumAvgs(1)
    }
}

impl fmt::Display for NumAvgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `capture` minus its mean. An empty capture stays empty.
pub fn baseline_subtract(capture: &Array1<f64>) -> Array1<f64> {
    match capture.mean() {
        Some(mean) => capture - mean,
        None => capture.clone(),
    }
}

/// Baseline-subtracts `capture`, splits it into `num_avgs` contiguous chunks and averages them.
///
/// Returns the averaged chunk and the chunks themselves, one per row. When the capture length is
/// not a multiple of `num_avgs` the trailing samples are dropped with a warning; a capture shorter
/// than `num_avgs` is an invalid argument.
///
/// ```
/// use ndarray::Array1;
/// use x6compiler_backend::*;
/// let capture = Array1::from_vec(vec![0., 2., 0., 2., 6., 8.]);
/// let (avg, chunks) = block_average(&capture, NumAvgs::new(3).unwrap()).unwrap();
/// assert_eq!(chunks.nrows(), 3);
/// assert_eq!(avg.to_vec(), vec![-1., 1.]);
/// ```
pub fn block_average(capture: &Array1<f64>, num_avgs: NumAvgs) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = num_avgs.get();
    let chunk_len = capture.len() / n;
    if chunk_len == 0 {
        return Err(Error::InvalidArgument(format!(
            "cannot split a capture of {} samples into {} chunks",
            capture.len(),
            n
        )));
    }
    let remainder = capture.len() % n;
    if remainder != 0 {
        log::warn!(
            "Capture of {} samples does not split into {} equal chunks; dropping the last {} samples.",
            capture.len(),
            n,
            remainder
        );
    }
    let subtracted = baseline_subtract(capture);
    let used = subtracted.slice(s![..n * chunk_len]).to_vec();
    let chunks = Array2::from_shape_vec((n, chunk_len), used)
        .map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let averaged = chunks
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::InvalidArgument("empty capture".to_string()))?;
    Ok((averaged, chunks))
}

/// Index of grid point `(length_idx, amp_idx)` among `amps_len` amplitudes per length.
///
/// ```
/// assert_eq!(x6compiler_backend::output_index(3, 2, 1), 7);
/// ```
pub fn output_index(amps_len: usize, length_idx: usize, amp_idx: usize) -> usize {
    amps_len * length_idx + amp_idx
}

/// File name of the averaged trace with the given index, e.g. `repetition-00007.npy`.
pub fn output_file_name(index: usize) -> String {
    format!("repetition-{:05}.npy", index)
}
