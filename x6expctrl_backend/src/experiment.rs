//! # Pulse-amplitude and pulse-length sweeps with the `experiment` Module
//!
//! This module drives the single-pulse experiment over a grid of pulse lengths and amplitudes.
//! Every grid point goes through the same steps:
//!
//! 1. The transmitter and receiver patterns for the current pulse length are rewritten where the
//!    preset's `tx_pattern_file` and `rx_pattern_file` point (see [`PresetFiles`]).
//! 2. The playback waveform is regenerated, or reloaded from fixed files, into the preset's
//!    `tx_play_from_file_filename`.
//! 3. [`run_acq`] runs one acquisition cycle on the board.
//! 4. The capture is baseline-subtracted and block-averaged over `num_avgs` chunks.
//! 5. The averaged trace is written to `repetition-NNNNN.npy` in the output directory, and
//!    optionally plotted next to it.
//!
//! ## Configuration
//!
//! Everything that stays fixed across sweeps lives in an [`ExptConfig`], read from a TOML file:
//!
//! ```toml
//! pulse_file = "presets/standard_configurations.pulse"
//! pulse_name = "Single Pulse"
//! output_dir = "data/2015-03-31"
//! capture_file = "Data.bin"
//! transmitter = "full"
//!
//! [waveform]
//! kind = "single_pulse"
//! ```
//!
//! Every key is optional. The per-sweep parameters are a [`SweepParams`].
//!
//! Relative file names inside the preset are taken relative to the `.pulse` file, as the board
//! does when it loads the preset, so the files a sweep writes are the files the board reads. The
//! capture file is the one exception: the board's logger writes it in the current directory.
//!
//! ## Failure semantics
//!
//! Any failure aborts the sweep. Traces already written stay on disk; the board is closed by
//! [`run_acq`] before the error reaches the caller.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use x6compiler_backend::*;

use crate::acquisition::*;
use crate::device::*;
use crate::error::{Error, Result};
use crate::plot::*;

/// Which transmitter pattern the sweep writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitterVariant {
    /// Trigger, blanking, RF pulse and receiver blanking
    #[default]
    Full,
    /// RF pulse only
    NoDigital,
}

/// Where the playback waveform of each grid point comes from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaveformSource {
    /// A 200 MHz pulse of the current length and amplitude
    #[default]
    SinglePulse,
    /// The same I/Q `.npy` or `.npz` files for every grid point
    FromFiles {
        i_file: PathBuf,
        q_file: PathBuf,
        /// Array read from `.npz` archives
        #[serde(default = "default_var_name")]
        var_name: String,
        #[serde(default)]
        volt_units: bool,
    },
    /// Leave whatever playback file is in place
    None,
}

fn default_pulse_file() -> PathBuf {
    PathBuf::from("standard_configurations.pulse")
}
fn default_var_name() -> String {
    "r".to_string()
}
fn default_pulse_name() -> String {
    "Single Pulse".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_capture_file() -> PathBuf {
    PathBuf::from("Data.bin")
}
fn default_data_stream() -> String {
    "0x100".to_string()
}
fn default_acq_time() -> u64 {
    2000
}
fn default_dead_time_correction() -> u64 {
    15
}
fn default_calibrate_sec() -> f64 {
    2.
}
fn default_settle_start_sec() -> f64 {
    2.
}
fn default_settle_stop_sec() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}

/// Settings shared by every grid point of a sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExptConfig {
    /// Board configuration file
    #[serde(default = "default_pulse_file")]
    pub pulse_file: PathBuf,
    /// Preset section of `pulse_file`
    #[serde(default = "default_pulse_name")]
    pub pulse_name: String,
    /// Directory of the averaged traces
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Capture file written by the board's logger, relative to the current directory
    #[serde(default = "default_capture_file")]
    pub capture_file: PathBuf,
    #[serde(default = "default_data_stream")]
    pub data_stream: String,
    /// Receiver window, in samples
    #[serde(default = "default_acq_time")]
    pub acq_time: u64,
    #[serde(default)]
    pub receiver_delay: u64,
    /// Added once to the sweep's dead time
    #[serde(default = "default_dead_time_correction")]
    pub dead_time_correction: u64,
    #[serde(default)]
    pub transmitter: TransmitterVariant,
    #[serde(default)]
    pub waveform: WaveformSource,
    #[serde(default = "default_calibrate_sec")]
    pub calibrate_sec: f64,
    #[serde(default = "default_settle_start_sec")]
    pub settle_start_sec: f64,
    #[serde(default = "default_settle_stop_sec")]
    pub settle_stop_sec: f64,
    /// Wait out `num_avgs * rep_time_sec` while streaming
    #[serde(default = "default_true")]
    pub pace_averages: bool,
}

impl Default for ExptConfig {
    fn default() -> Self {
        Self {
            pulse_file: default_pulse_file(),
            pulse_name: default_pulse_name(),
            output_dir: default_output_dir(),
            capture_file: default_capture_file(),
            data_stream: default_data_stream(),
            acq_time: default_acq_time(),
            receiver_delay: 0,
            dead_time_correction: default_dead_time_correction(),
            transmitter: TransmitterVariant::default(),
            waveform: WaveformSource::default(),
            calibrate_sec: default_calibrate_sec(),
            settle_start_sec: default_settle_start_sec(),
            settle_stop_sec: default_settle_stop_sec(),
            pace_averages: true,
        }
    }
}

impl ExptConfig {
    /// Parses a TOML run configuration.
    ///
    /// ```
    /// use x6expctrl_backend::*;
    /// let config = ExptConfig::parse_str("pulse_name = \"Echo\"\nacq_time = 4000").unwrap();
    /// assert_eq!(config.pulse_name, "Echo");
    /// assert_eq!(config.acq_time, 4000);
    /// assert_eq!(config.dead_time_correction, 15);
    /// assert_eq!(config.waveform, WaveformSource::SinglePulse);
    /// ```
    pub fn parse_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Drops every pacing wait, for simulated boards.
    pub fn without_pacing(mut self) -> Self {
        self.calibrate_sec = 0.;
        self.settle_start_sec = 0.;
        self.settle_stop_sec = 0.;
        self.pace_averages = false;
        self
    }

    /// Reads a TOML run configuration. Relative paths are taken relative to the file, except
    /// `capture_file`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::parse_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.pulse_file);
        resolve(&mut self.output_dir);
        if let WaveformSource::FromFiles { i_file, q_file, .. } = &mut self.waveform {
            resolve(i_file);
            resolve(q_file);
        }
    }

    pub fn timing(&self) -> Result<AcqTiming> {
        let secs = |name: &str, value: f64| {
            Duration::try_from_secs_f64(value).map_err(|_| {
                Error::InvalidArgument(format!("{} must be a non-negative number, got {}", name, value))
            })
        };
        Ok(AcqTiming {
            calibrate: secs("calibrate_sec", self.calibrate_sec)?,
            settle_start: secs("settle_start_sec", self.settle_start_sec)?,
            settle_stop: secs("settle_stop_sec", self.settle_stop_sec)?,
            pace_averages: self.pace_averages,
        })
    }

    /// The [`AcqConfig`] `run_acq` is called with.
    pub fn acq_config(&self) -> Result<AcqConfig> {
        Ok(AcqConfig {
            pulse_file: self.pulse_file.clone(),
            pulse_name: self.pulse_name.clone(),
            capture_file: self.capture_path(),
            data_stream: self.data_stream.clone(),
            timing: self.timing()?,
        })
    }

    pub fn capture_path(&self) -> PathBuf {
        self.capture_file.clone()
    }

    /// Where the preset `pulse_name` of `pulse_file` expects its pattern and playback files.
    ///
    /// Fails with `MissingSection` when the preset does not exist. Options the preset leaves out
    /// fall back on the standard file names next to `pulse_file`.
    pub fn preset_files(&self) -> Result<PresetFiles> {
        let conf = ConfigFile::read(&self.pulse_file)?;
        let base = self.pulse_file.parent().unwrap_or_else(|| Path::new(""));
        let locate = |key: &str, standard: &str| -> Result<PathBuf> {
            let name = match conf.get(&self.pulse_name, key) {
                Ok(value) => PathBuf::from(value.trim()),
                Err(x6compiler_backend::Error::MissingKey { .. }) => PathBuf::from(standard),
                Err(e) => return Err(e.into()),
            };
            Ok(if name.is_relative() { base.join(name) } else { name })
        };
        Ok(PresetFiles {
            tx_pattern: locate("tx_pattern_file", TRANSMITTER_PATTERN_FILE)?,
            rx_pattern: locate("rx_pattern_file", RECEIVER_PATTERN_FILE)?,
            velo: locate("tx_play_from_file_filename", SINGLE_PULSE_FILE)?,
        })
    }

    /// Writes the transmitter and receiver patterns of one pulse length where the preset reads
    /// them, and returns their paths.
    pub fn write_patterns(&self, pulse_length: u64, dead_time: u64) -> Result<(PathBuf, PathBuf)> {
        let files = self.preset_files()?;
        let tx = match self.transmitter {
            TransmitterVariant::Full => transmitter_pattern(pulse_length, dead_time),
            TransmitterVariant::NoDigital => {
                log::debug!("no-digital transmitter, dead_time={} unused", dead_time);
                transmitter_pattern_nodigital(pulse_length)
            }
        };
        ensure_parent_dir(&files.tx_pattern)?;
        tx.write(&files.tx_pattern)?;
        ensure_parent_dir(&files.rx_pattern)?;
        receiver_pattern(self.receiver_delay, self.acq_time).write(&files.rx_pattern)?;
        Ok((files.tx_pattern, files.rx_pattern))
    }

    /// Writes the playback waveform of one grid point where the preset reads it. Returns whether
    /// a file was written.
    pub fn write_waveform(&self, pulse_length: u64, amp: f64, phase_shift: f64, num_avgs: NumAvgs) -> Result<bool> {
        if self.waveform == WaveformSource::None {
            return Ok(false);
        }
        let velo_file = self.preset_files()?.velo;
        ensure_parent_dir(&velo_file)?;
        match &self.waveform {
            WaveformSource::SinglePulse => {
                let width = usize::try_from(pulse_length).map_err(|_| {
                    Error::InvalidArgument(format!("pulse length {} is too long", pulse_length))
                })?;
                gen_velo_single_pulse(&velo_file, width, 0., phase_shift, amp, num_avgs.get())?;
                Ok(true)
            }
            WaveformSource::FromFiles {
                i_file,
                q_file,
                var_name,
                volt_units,
            } => {
                gen_velo_from_files(&velo_file, i_file, q_file, var_name, *volt_units)?;
                Ok(true)
            }
            WaveformSource::None => Ok(false),
        }
    }
}

/// Pattern and playback files of a preset, as the board resolves them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresetFiles {
    pub tx_pattern: PathBuf,
    pub rx_pattern: PathBuf,
    pub velo: PathBuf,
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Parameters of one sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepParams {
    pub pulse_amps: Vec<f64>,
    /// In ns
    pub pulse_lengths: Vec<u64>,
    /// Guard between the end of the pulse and the receiver window, in ns
    pub dead_time: u64,
    pub rep_time_sec: f64,
    pub phase_shift_degree: f64,
    pub num_avgs: NumAvgs,
    pub num_repetitions: usize,
    pub do_plot: bool,
}

impl SweepParams {
    /// A sweep over `pulse_amps` x `pulse_lengths` with the default acquisition parameters: 500 ns
    /// dead time, 1 s repetition time, no phase shift, one average, one repetition, no plots.
    pub fn new(pulse_amps: Vec<f64>, pulse_lengths: Vec<u64>) -> Self {
        Self {
            pulse_amps,
            pulse_lengths,
            dead_time: 500,
            rep_time_sec: 1.,
            phase_shift_degree: 0.,
            num_avgs: NumAvgs::default(),
            num_repetitions: 1,
            do_plot: false,
        }
    }
}

/// Result of the last grid point, plus every file the sweep wrote.
#[derive(Clone, Debug)]
pub struct SweepResult {
    /// Block-averaged trace
    pub averaged: Array1<f64>,
    /// Baseline-subtracted chunks, one row per average
    pub chunks: Array2<f64>,
    /// Capture as returned by [`run_acq`]
    pub raw: Array1<i16>,
    /// Averaged traces in grid order
    pub files: Vec<PathBuf>,
}

/// Runs the sweep: lengths in the outer loop, amplitudes in the inner one.
///
/// The trace of grid point `(length_idx, amp_idx)` is saved as
/// `output_file_name(output_index(pulse_amps.len(), length_idx, amp_idx))` in
/// `config.output_dir`, which is created if needed. Pattern and playback files are overwritten at
/// every grid point, at the paths given by [`ExptConfig::preset_files`], so after the sweep they
/// describe the last one.
pub fn run_expt<D: X6Driver + ?Sized>(
    device: &mut D,
    config: &ExptConfig,
    params: &SweepParams,
) -> Result<SweepResult> {
    if params.pulse_amps.is_empty() || params.pulse_lengths.is_empty() {
        return Err(Error::InvalidArgument(
            "the sweep needs at least one pulse amplitude and one pulse length".to_string(),
        ));
    }
    let acq_config = config.acq_config()?;
    let files = config.preset_files()?;
    log::debug!(
        "Writing {}, {} and {}",
        files.tx_pattern.display(),
        files.rx_pattern.display(),
        files.velo.display()
    );
    fs::create_dir_all(&config.output_dir)?;

    let dead_time = params.dead_time + config.dead_time_correction;
    let mut files = Vec::with_capacity(params.pulse_amps.len() * params.pulse_lengths.len());
    let mut last = None;
    for (length_idx, &pulse_length) in params.pulse_lengths.iter().enumerate() {
        for (amp_idx, &pulse_amp) in params.pulse_amps.iter().enumerate() {
            log::info!("Pulse Amp = {}", pulse_amp);
            log::info!("Pulse Length = {}", pulse_length);

            config.write_patterns(pulse_length, dead_time)?;
            config.write_waveform(pulse_length, pulse_amp, params.phase_shift_degree, params.num_avgs)?;

            let raw = run_acq(
                device,
                &acq_config,
                params.num_repetitions,
                params.num_avgs,
                params.rep_time_sec,
            )?;
            let (averaged, chunks) = block_average(&raw.mapv(f64::from), params.num_avgs)?;

            let index = output_index(params.pulse_amps.len(), length_idx, amp_idx);
            let path = config.output_dir.join(output_file_name(index));
            ndarray_npy::write_npy(&path, &averaged)?;
            log::debug!("Saved {}", path.display());
            if params.do_plot {
                plot_trace(&path.with_extension("png"), &averaged)?;
            }
            files.push(path);
            last = Some((averaged, chunks, raw));
        }
    }

    let (averaged, chunks, raw) =
        last.ok_or_else(|| Error::InvalidArgument("empty sweep".to_string()))?;
    Ok(SweepResult {
        averaged,
        chunks,
        raw,
        files,
    })
}
