//! Python bindings: the `x6expctrl_backend` module and its `Experiment` class.
//!
//! ```python
//! from x6expctrl_backend import Experiment
//!
//! exp = Experiment("single_pulse.toml", simulate=True)
//! averaged, chunks, raw = exp.run_expt([0.5, 1.0], [100, 200], num_avgs=4)
//! ```

use numpy::PyArray;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::path::Path;

use x6compiler_backend::NumAvgs;

use crate::device::*;
use crate::error::Error;
use crate::experiment::*;

impl From<Error> for PyErr {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidArgument(_) | Error::Backend(x6compiler_backend::Error::InvalidArgument(_)) => {
                PyValueError::new_err(e.to_string())
            }
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

/// Accepts an `int`, a `float` (truncated like `int()`) or a `str` holding an integer.
fn extract_num_avgs(num_avgs: &PyAny) -> PyResult<NumAvgs> {
    let parsed = if let Ok(value) = num_avgs.extract::<i64>() {
        NumAvgs::try_from(value)
    } else if let Ok(value) = num_avgs.extract::<f64>() {
        NumAvgs::from_f64(value)
    } else if let Ok(text) = num_avgs.extract::<&str>() {
        text.parse()
    } else {
        return Err(PyValueError::new_err(format!(
            "num_avgs must be a positive integer, got {}",
            num_avgs
        )));
    };
    Ok(parsed.map_err(Error::from)?)
}

/// A board together with the run configuration of the sweeps it performs.
#[pyclass(unsendable)]
pub struct Experiment {
    config: ExptConfig,
    device: Box<dyn X6Driver>,
}

#[pymethods]
impl Experiment {
    /// Loads the TOML run configuration `config_file`, or the defaults.
    ///
    /// With `simulate`, acquisitions run on a simulated board and skip the pacing waits; the
    /// real board needs the `hardware` feature.
    #[new]
    #[pyo3(signature = (config_file=None, simulate=true))]
    pub fn new(config_file: Option<&str>, simulate: bool) -> PyResult<Self> {
        let config = match config_file {
            Some(file) => ExptConfig::from_file(Path::new(file))?,
            None => ExptConfig::default(),
        };
        let (config, device): (ExptConfig, Box<dyn X6Driver>) = if simulate {
            let config = config.without_pacing();
            let device: Box<dyn X6Driver> = Box::new(SimulatedX6::new(&config.capture_path()));
            (config, device)
        } else {
            (config, open_board()?)
        };
        Ok(Self { config, device })
    }

    /// Runs one acquisition and returns the capture of the last repetition.
    #[pyo3(signature = (n_repetitions, num_avgs, rep_time_sec))]
    pub fn run_acq(
        &mut self,
        n_repetitions: usize,
        num_avgs: &PyAny,
        rep_time_sec: f64,
        py: Python,
    ) -> PyResult<PyObject> {
        let num_avgs = extract_num_avgs(num_avgs)?;
        let acq_config = self.config.acq_config()?;
        let data = crate::acquisition::run_acq(
            self.device.as_mut(),
            &acq_config,
            n_repetitions,
            num_avgs,
            rep_time_sec,
        )?;
        Ok(PyArray::from_array(py, &data).to_object(py))
    }

    /// Runs the sweep and returns `(averaged, chunks, raw)` of the last grid point. `num_avgs`
    /// defaults to one.
    #[pyo3(signature = (
        pulse_amps,
        pulse_times,
        dead_time=500,
        rep_time_sec=1.,
        phase_shift_degree=0.,
        num_avgs=None,
        num_repetitions=1,
        do_plot=false
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn run_expt(
        &mut self,
        pulse_amps: Vec<f64>,
        pulse_times: Vec<u64>,
        dead_time: u64,
        rep_time_sec: f64,
        phase_shift_degree: f64,
        num_avgs: Option<&PyAny>,
        num_repetitions: usize,
        do_plot: bool,
        py: Python,
    ) -> PyResult<(PyObject, PyObject, PyObject)> {
        let params = SweepParams {
            dead_time,
            rep_time_sec,
            phase_shift_degree,
            num_avgs: num_avgs.map(extract_num_avgs).transpose()?.unwrap_or_default(),
            num_repetitions,
            do_plot,
            ..SweepParams::new(pulse_amps, pulse_times)
        };
        let result = crate::experiment::run_expt(self.device.as_mut(), &self.config, &params)?;
        Ok((
            PyArray::from_array(py, &result.averaged).to_object(py),
            PyArray::from_array(py, &result.chunks).to_object(py),
            PyArray::from_array(py, &result.raw).to_object(py),
        ))
    }

    /// Writes the transmitter and receiver patterns of one pulse length where the preset reads
    /// them. `dead_time` is taken as is.
    pub fn write_patterns(&self, pulse_length: u64, dead_time: u64) -> PyResult<(String, String)> {
        let (tx, rx) = self.config.write_patterns(pulse_length, dead_time)?;
        Ok((tx.display().to_string(), rx.display().to_string()))
    }

    pub fn pulse_name(&self) -> String {
        self.config.pulse_name.clone()
    }
}

#[cfg(feature = "hardware")]
fn open_board() -> PyResult<Box<dyn X6Driver>> {
    Ok(Box::new(crate::waterloo::X6Board::new(0)?))
}

#[cfg(not(feature = "hardware"))]
fn open_board() -> PyResult<Box<dyn X6Driver>> {
    Err(PyRuntimeError::new_err(
        "built without the `hardware` feature; use simulate=True",
    ))
}

#[pymodule]
fn x6expctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<Experiment>()?;
    Ok(())
}
