//! PNG rendering of averaged traces and of the channel timelines a configuration produces.
//!
//! Plots carry no text: axes ranges follow the data, one panel per channel for timelines, top to
//! bottom in the order of [`x6compiler_backend::pri_pattern_to_lines`].

use indexmap::IndexMap;
use ndarray::Array1;
use plotters::prelude::*;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use x6compiler_backend::*;

use crate::error::{Error, Result};

const TRACE_SIZE: (u32, u32) = (1200, 600);
const PANEL_WIDTH: u32 = 1600;
const PANEL_HEIGHT: u32 = 120;

fn plot_err(e: impl Display) -> Error {
    Error::Plot(e.to_string())
}

/// Draws `trace` against its sample index.
pub fn plot_trace(out: &Path, trace: &Array1<f64>) -> Result<()> {
    let root = BitMapBackend::new(out, TRACE_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let (low, high) = y_limits(trace);
    let x_max = trace.len().max(2) as f64 - 1.;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(0f64..x_max, low..high)
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(
            trace.iter().enumerate().map(|(idx, &v)| (idx as f64, v)),
            &BLUE,
        ))
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

/// Draws every line in its own panel, against time.
///
/// # Arguments
/// * `out` - PNG file to write.
/// * `lines` - timelines, one sample per board sample.
/// * `sample_rate` - board sample rate, in MHz.
pub fn plot_lines(out: &Path, lines: &IndexMap<String, Array1<f64>>, sample_rate: f64) -> Result<()> {
    if lines.is_empty() {
        return Err(Error::InvalidArgument("no channel line to plot".to_string()));
    }
    let sample_rate = if sample_rate > 0. { sample_rate } else { FULL_SAMPLE_RATE };
    let max_len = lines.values().map(|line| line.len()).max().unwrap_or(0);
    let axis = time_axis(sample_rate, max_len);
    log::debug!("Plotting {} lines, time unit {}", lines.len(), axis.unit);
    let x_max = (axis.plot_len.max(1) as f64) * axis.dt;

    let height = PANEL_HEIGHT * lines.len() as u32;
    let root = BitMapBackend::new(out, (PANEL_WIDTH, height)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let panels = root.split_evenly((lines.len(), 1));
    for ((name, line), panel) in lines.iter().zip(panels.iter()) {
        let (low, high) = y_limits(line);
        let mut chart = ChartBuilder::on(panel)
            .margin(5)
            .build_cartesian_2d(0f64..x_max, low..high)
            .map_err(plot_err)?;
        // Hold the last value until the end of the axis
        let tail = line.iter().last().copied().unwrap_or(0.);
        let points = line
            .iter()
            .copied()
            .chain(std::iter::repeat(tail).take(axis.plot_len.saturating_sub(line.len())))
            .enumerate()
            .map(|(idx, v)| (idx as f64 * axis.dt, v));
        let color = if direction(name) == Some(Direction::Rx) { &RED } else { &BLUE };
        chart.draw_series(LineSeries::new(points, color)).map_err(plot_err)?;
    }
    root.present().map_err(plot_err)?;
    Ok(())
}

/// Timelines of preset `section` of `conf_file`, and the board sample rate.
///
/// Disabled PRI patterns are left out. Analog outputs take the playback file's samples when
/// playback from file is enabled.
pub fn configuration_lines(
    conf_file: &Path,
    section: &str,
    normalize: bool,
) -> Result<(IndexMap<String, Array1<f64>>, f64)> {
    let settings = BoardSettings::load(conf_file, section)?;
    let read_pattern = |pri: &PriSettings| -> Result<Option<PriPattern>> {
        match (&pri.pattern_file, pri.enable) {
            (Some(file), true) => Ok(Some(PriPattern::read(file)?)),
            _ => Ok(None),
        }
    };
    let rx_pattern = read_pattern(&settings.rx_pri)?;
    let tx_pattern = read_pattern(&settings.tx_pri)?;

    let active = validate_active_channels(&settings.tx_active_channels())?;
    let waveforms = match (&settings.tx_misc.play_from_file_filename, settings.tx_misc.play_from_file_enable) {
        (Some(velo_file), true) => velo_to_waveform(&active, velo_file)?,
        _ => Default::default(),
    };
    let lines = pri_pattern_to_lines(
        &active,
        rx_pattern.as_ref(),
        tx_pattern.as_ref(),
        &waveforms,
        normalize,
    );
    Ok((lines, settings.common.sample_rate))
}

/// Plots the timelines of preset `section` of `conf_file` into `out`.
pub fn plot_configuration_file(conf_file: &Path, section: &str, out: &Path, normalize: bool) -> Result<()> {
    let (lines, sample_rate) = configuration_lines(conf_file, section, normalize)?;
    plot_lines(out, &lines, sample_rate)
}

/// Plots preset `section` of the first `*.pulse` file of `dir`, in name order.
///
/// Returns the configuration file used.
pub fn plot_compiled_folder(dir: &Path, section: &str, out: &Path) -> Result<PathBuf> {
    let mut pulse_files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == "pulse"))
        .collect();
    pulse_files.sort();
    let conf_file = pulse_files.into_iter().next().ok_or_else(|| {
        Error::InvalidArgument(format!("no .pulse file in `{}`", dir.display()))
    })?;
    plot_configuration_file(&conf_file, section, out, true)?;
    Ok(conf_file)
}
