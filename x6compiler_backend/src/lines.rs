//! Rasterizes PRI patterns into per-channel timelines.
//!
//! Every channel that a receiver or transmitter pattern addresses becomes a [`Line`]: the set of
//! pulses `(delay, width)` aimed at it. Compiling a line yields one sample per clock tick, `1.`
//! where a pulse is active and `0.` elsewhere. For the analog transmitter outputs the ones are then
//! replaced by the samples of the playback waveform, in order, which is what the DAC emits while
//! its PRI gate is open.
//!
//! Delays in pattern files count from one: a pulse with delay `d` starts at sample index `d - 1`.
//! A zero delay is treated as starting on the first sample.
//!
//! The timelines feed the plotting functions of the control backend, but the rasterization itself
//! is pure and lives here.

use indexmap::IndexMap;
use ndarray::{s, Array1};
use std::fmt;

use crate::channel::*;
use crate::pattern::*;

/// A pulse on a line, in zero-based half-open sample positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PulseBook {
    pub start_pos: usize,
    pub end_pos: usize,
}

impl PulseBook {
    /// Converts a pattern `(delay, width)` pair, whose delay counts from one.
    pub fn from_pattern(delay: u64, width: u64) -> Self {
        let start_pos = delay.saturating_sub(1) as usize;
        Self {
            start_pos,
            end_pos: start_pos + width as usize,
        }
    }
}

impl fmt::Display for PulseBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PulseBook({}-{})", self.start_pos, self.end_pos)
    }
}

pub trait BaseLine {
    // Field methods
    fn name(&self) -> &str;
    fn pulse_list(&self) -> &Vec<PulseBook>;
    // Mutable field references
    fn pulse_list_(&mut self) -> &mut Vec<PulseBook>;

    fn is_edited(&self) -> bool {
        !self.pulse_list().is_empty()
    }

    fn add_pulse(&mut self, delay: u64, width: u64) {
        self.pulse_list_().push(PulseBook::from_pattern(delay, width));
    }

    /// One past the last sample any pulse touches.
    fn stop_pos(&self) -> usize {
        self.pulse_list()
            .iter()
            .map(|p| p.end_pos)
            .max()
            .unwrap_or(0)
    }

    /// Ones where any pulse is active, zeros elsewhere. Overlapping pulses are allowed.
    fn compile(&self) -> Array1<f64> {
        let mut line = Array1::<f64>::zeros(self.stop_pos());
        for pulse in self.pulse_list() {
            line.slice_mut(s![pulse.start_pos..pulse.end_pos]).fill(1.);
        }
        line
    }

    /// Like [`BaseLine::compile`], with the ones replaced by successive `waveform` samples.
    ///
    /// Samples past the end of the waveform play as zero. With `normalize`, values are divided by
    /// the full scale of the 16-bit DAC, `2^15 - 1`.
    fn compile_analog(&self, waveform: &[i16], normalize: bool) -> Array1<f64> {
        let scale = if normalize { i16::MAX as f64 } else { 1. };
        let mut samples = waveform.iter();
        let mut line = self.compile();
        for value in line.iter_mut() {
            if *value == 1. {
                *value = samples.next().map_or(0., |&v| v as f64 / scale);
            }
        }
        line
    }
}

pub struct Line {
    name: String,
    pulse_list: Vec<PulseBook>,
}

impl BaseLine for Line {
    fn name(&self) -> &str {
        &self.name
    }
    fn pulse_list(&self) -> &Vec<PulseBook> {
        &self.pulse_list
    }
    fn pulse_list_(&mut self) -> &mut Vec<PulseBook> {
        &mut self.pulse_list
    }
}

impl Line {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pulse_list: Vec::new(),
        }
    }
}

/// Rasterizes `[(start, length), ...]` pairs, with starts counted from one.
///
/// # Examples
/// ```
/// use x6compiler_backend::digital_to_line;
/// let line = digital_to_line(&[(2, 3), (7, 1)]);
/// assert_eq!(line.to_vec(), vec![0., 1., 1., 1., 0., 0., 1.]);
/// assert!(digital_to_line(&[]).is_empty());
/// ```
pub fn digital_to_line(dig_signal: &[(u64, u64)]) -> Array1<f64> {
    let mut line = Line::new("");
    for &(start, length) in dig_signal {
        line.add_pulse(start, length);
    }
    line.compile()
}

/// Collects, for every channel, the pulses the given patterns aim at it.
///
/// The receiver pattern is decoded with receiver codes and the transmitter pattern with
/// transmitter codes. Channels no pulse addresses are left out.
pub fn pri_pattern_to_pulse_lines(
    rx_pattern: Option<&PriPattern>,
    tx_pattern: Option<&PriPattern>,
) -> IndexMap<&'static str, Line> {
    let mut lines: IndexMap<&'static str, Line> =
        channels().map(|name| (name, Line::new(name))).collect();
    for (pattern, rx) in [(rx_pattern, true), (tx_pattern, false)] {
        let pattern = match pattern {
            Some(pattern) => pattern,
            None => continue,
        };
        for pulse in pattern.pulses() {
            for (name, addressed) in destcode_query(pulse.destination, rx, !rx) {
                if addressed {
                    if let Some(line) = lines.get_mut(name) {
                        line.add_pulse(pulse.delay, pulse.width);
                    }
                }
            }
        }
    }
    lines.retain(|_, line| line.is_edited());
    lines
}

/// Timelines of every channel the patterns drive.
///
/// # Arguments
/// * `active_channels` - which of `DA0..DA3` are active. Inactive analog outputs are dropped from
///   the result even if a pattern addresses their DAC.
/// * `rx_pattern`, `tx_pattern` - receiver and transmitter patterns, if enabled.
/// * `tx_waveforms` - playback samples of `DA0..DA3`; analog lines with a waveform take its
///   values while gated on.
/// * `normalize` - divide waveform values by `2^15 - 1`.
pub fn pri_pattern_to_lines(
    active_channels: &[bool; 4],
    rx_pattern: Option<&PriPattern>,
    tx_pattern: Option<&PriPattern>,
    tx_waveforms: &[Option<Vec<i16>>; 4],
    normalize: bool,
) -> IndexMap<String, Array1<f64>> {
    let mut line_dict = IndexMap::new();
    for (name, line) in pri_pattern_to_pulse_lines(rx_pattern, tx_pattern) {
        let analog_idx = TX_CHANNELS[..4].iter().position(|&tx| tx == name);
        if let Some(idx) = analog_idx {
            if !active_channels[idx] {
                continue;
            }
        }
        let samples = match analog_idx.and_then(|idx| tx_waveforms[idx].as_ref()) {
            Some(waveform) => line.compile_analog(waveform, normalize),
            None => line.compile(),
        };
        line_dict.insert(name.to_string(), samples);
    }
    line_dict
}

/// Time axis of a timeline plot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeAxis {
    pub unit: &'static str,
    /// Sample spacing, in `unit`
    pub dt: f64,
    /// Number of samples to draw: 10% past the longest line
    pub plot_len: usize,
}

/// Picks the display unit for `max_line_length` samples at `sample_rate` MHz.
///
/// ```
/// use x6compiler_backend::time_axis;
/// let axis = time_axis(1000., 20_000);
/// assert_eq!(axis.unit, "us");
/// assert!((axis.dt - 1e-3).abs() < 1e-12);
/// assert_eq!(axis.plot_len, 22_000);
/// ```
pub fn time_axis(sample_rate: f64, max_line_length: usize) -> TimeAxis {
    let dt = 1. / (1e6 * sample_rate);
    let total = dt * max_line_length as f64;
    let (unit, scale) = if total < 1e-9 {
        ("ps", 1e-12)
    } else if total < 1e-6 {
        ("ns", 1e-9)
    } else if total < 1e-3 {
        ("us", 1e-6)
    } else if total < 1. {
        ("ms", 1e-3)
    } else {
        ("s", 1.)
    };
    TimeAxis {
        unit,
        dt: dt / scale,
        plot_len: (max_line_length as f64 * 1.1) as usize,
    }
}

/// Vertical plot range of a line: 10% margin, symmetric if the line goes negative.
pub fn y_limits(line: &Array1<f64>) -> (f64, f64) {
    let min = line.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = line.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || !max.is_finite() {
        return (-0.5, 0.5);
    }
    let margin = (max - min).abs() / 10.;
    let (low, high) = if min >= 0. {
        (min - margin, max + margin)
    } else {
        let peak = line.iter().fold(0f64, |acc, v| acc.max(v.abs()));
        (-peak - margin, peak + margin)
    };
    if high > low {
        (low, high)
    } else {
        (low - 0.5, high + 0.5)
    }
}
