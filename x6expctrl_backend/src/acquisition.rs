//! One acquisition cycle on the board: `run_acq`.
//!
//! The board is opened for the duration of the call only. Inside the session the preset is
//! loaded, the averaging count and repetition period registers are overwritten, the board is
//! preconfigured, and `n_repetitions` streaming bursts are run. After each burst the capture file
//! written by the board's logger is parsed and the configured data stream extracted.
//!
//! Pacing uses fixed waits rather than readiness signals from the board: a calibration wait after
//! preconfiguring, and around every burst a start wait covering the averaging time plus a short
//! settle wait after the stream stops. [`AcqTiming::immediate`] turns them all off for simulated
//! boards.

use ndarray::Array1;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use x6compiler_backend::*;

use crate::device::*;
use crate::error::{Error, Result};

/// Fixed waits around streaming.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AcqTiming {
    /// After preconfiguring, while the board calibrates
    pub calibrate: Duration,
    /// After starting a burst, on top of the averaging time
    pub settle_start: Duration,
    /// After stopping a burst, before the capture is read
    pub settle_stop: Duration,
    /// Also wait `num_avgs * rep_time_sec` per burst
    pub pace_averages: bool,
}

impl Default for AcqTiming {
    fn default() -> Self {
        Self {
            calibrate: Duration::from_secs(2),
            settle_start: Duration::from_secs(2),
            settle_stop: Duration::from_millis(500),
            pace_averages: true,
        }
    }
}

impl AcqTiming {
    /// No waits at all.
    pub fn immediate() -> Self {
        Self {
            calibrate: Duration::ZERO,
            settle_start: Duration::ZERO,
            settle_stop: Duration::ZERO,
            pace_averages: false,
        }
    }
}

/// Where `run_acq` finds its preset and its data.
#[derive(Clone, Debug, PartialEq)]
pub struct AcqConfig {
    pub pulse_file: PathBuf,
    pub pulse_name: String,
    /// Capture file written by the board's logger
    pub capture_file: PathBuf,
    /// Stream returned from the capture, e.g. `0x100`
    pub data_stream: String,
    pub timing: AcqTiming,
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Runs `n_repetitions` streaming bursts and returns the data stream of the last one.
///
/// Captures of earlier bursts are read and discarded. `num_avgs` sets both PRI counts and must
/// be a positive integer; `rep_time_sec` sets both PRI periods. Arguments are checked before the
/// board is touched. The board is closed on every exit path.
///
/// # Arguments
/// * `device` - a closed board.
/// * `config` - preset and capture locations, and pacing.
/// * `n_repetitions` - number of bursts, at least one.
/// * `num_avgs` - PRI repetitions per burst, as an integer, a string or a [`NumAvgs`].
/// * `rep_time_sec` - PRI period in seconds.
pub fn run_acq<D, N>(
    device: &mut D,
    config: &AcqConfig,
    n_repetitions: usize,
    num_avgs: N,
    rep_time_sec: f64,
) -> Result<Array1<i16>>
where
    D: X6Driver + ?Sized,
    N: TryInto<NumAvgs>,
    Error: From<N::Error>,
{
    let num_avgs: NumAvgs = num_avgs.try_into()?;
    let count = u32::try_from(num_avgs.get()).map_err(|_| {
        Error::InvalidArgument(format!("num_avgs {} does not fit the PRI count", num_avgs))
    })?;
    if n_repetitions == 0 {
        return Err(Error::InvalidArgument(
            "n_repetitions must be at least 1".to_string(),
        ));
    }
    if !rep_time_sec.is_finite() || rep_time_sec < 0. {
        return Err(Error::InvalidArgument(format!(
            "rep_time_sec must be a non-negative number of seconds, got {}",
            rep_time_sec
        )));
    }
    let period = (rep_time_sec * 1e9).round() as u64;
    let mut timer = TickTimer::new();

    let mut session = DeviceSession::open(device)?;
    session.load_configuration(&config.pulse_file, &config.pulse_name)?;
    log::info!("tx_active_channels = {:?}", session.tx_active_channels());

    session.set_tx_count(count);
    session.set_rx_count(count);
    session.set_tx_period(period);
    session.set_rx_period(period);
    session.preconfigure()?;
    timer.tick_log("open, load and preconfigure");

    // Let it calibrate first
    pause(config.timing.calibrate);

    let stream_time = if config.timing.pace_averages {
        Duration::from_secs_f64(num_avgs.get() as f64 * rep_time_sec)
    } else {
        Duration::ZERO
    };
    let mut raw_data: Option<Vec<i16>> = None;
    for idx in 0..n_repetitions {
        log::info!("Repetition {}...", idx);
        session.start_streaming()?;
        pause(config.timing.settle_start + stream_time);
        session.stop_streaming()?;
        pause(config.timing.settle_stop);
        log::info!("Streaming Stopped");

        let mut streams = parse_velo_stream(&config.capture_file)?;
        let data = streams
            .swap_remove(&config.data_stream)
            .ok_or_else(|| x6compiler_backend::Error::MissingStream(config.data_stream.clone()))?;
        if raw_data.replace(data).is_some() {
            log::debug!("Discarding the capture of repetition {}", idx - 1);
        }
        timer.tick_log(&format!("repetition {}", idx));
    }

    session.close()?;
    raw_data
        .map(Array1::from_vec)
        .ok_or_else(|| Error::Device("no repetition was acquired".to_string()))
}
