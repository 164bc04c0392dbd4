//! Playback waveforms for the four analog outputs.
//!
//! The board plays from a Velo file carrying two Vita streams: `0x100` feeds DAC0 (`DA0`, `DA1`)
//! and `0x101` feeds DAC1 (`DA2`, `DA3`). When both outputs of a DAC are active their samples are
//! interleaved on the stream, otherwise the stream carries the single active output as is. The
//! playback buffer must hold at least [`MINIMUM_DATA_SIZE`] samples per stream; shorter
//! waveforms are padded with zeros.

use indexmap::IndexMap;
use maplit::btreemap;
use ndarray::Array1;
use ndarray_npy::{read_npy, NpzReader};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs::File;
use std::path::Path;

use crate::channel::*;
use crate::error::*;
use crate::vita::*;

/// Samples per stream below which the board refuses to play.
pub const MINIMUM_DATA_SIZE: usize = 1_000_000;
/// Carrier frequency of [`gen_velo_single_pulse`], in Hz.
pub const SINGLE_PULSE_FREQUENCY: f64 = 200e6;
pub const SINGLE_PULSE_FILE: &str = "single_pulse.velo";

/// Stream name to the two analog outputs it feeds.
pub fn channel_stream_map() -> BTreeMap<&'static str, [usize; 2]> {
    btreemap! {
        "0x100" => [0, 1],
        "0x101" => [2, 3],
    }
}

fn interleave(first: &[i16], second: &[i16]) -> Vec<i16> {
    let len = first.len().max(second.len());
    let mut stream = Vec::with_capacity(2 * len);
    for i in 0..len {
        stream.push(first.get(i).copied().unwrap_or(0));
        stream.push(second.get(i).copied().unwrap_or(0));
    }
    stream
}

/// Scales values in `[-1, 1]` to the DAC's 16-bit range. Values outside saturate.
pub fn to_dac_samples(values: impl IntoIterator<Item = f64>) -> Vec<i16> {
    values
        .into_iter()
        .map(|v| (v * i16::MAX as f64) as i16)
        .collect()
}

/// Builds the playback streams for `waveforms`, without writing them.
///
/// Returns `None` when no waveform is given at all.
pub fn waveform_streams(
    active_channels: &[bool; 4],
    waveforms: &[Option<Vec<i16>>; 4],
) -> Option<IndexMap<String, Vec<i16>>> {
    if waveforms.iter().all(Option::is_none) {
        log::warn!("No waveforms given. Not writing a Velo file.");
        return None;
    }
    for (idx, waveform) in waveforms.iter().enumerate() {
        if waveform.is_some() && !active_channels[idx] {
            log::warn!(
                "Waveform given for inactive channel {}. It will not be played.",
                TX_CHANNELS[idx]
            );
        }
    }

    let mut streams = IndexMap::new();
    for (name, [first, second]) in channel_stream_map() {
        let take = |idx: usize| waveforms[idx].as_deref().unwrap_or(&[]);
        let mut stream = match (active_channels[first], active_channels[second]) {
            (true, true) => interleave(take(first), take(second)),
            (true, false) => take(first).to_vec(),
            (false, true) => take(second).to_vec(),
            (false, false) => continue,
        };
        if stream.len() < MINIMUM_DATA_SIZE {
            stream.resize(MINIMUM_DATA_SIZE, 0);
        }
        streams.insert(name.to_string(), stream);
    }
    Some(streams)
}

/// Writes `waveforms` (one per `DA0..DA3`) to a Velo playback file.
///
/// Returns whether a file was written; nothing is written when every waveform is `None`.
pub fn waveform_to_velo(
    active_channels: &[bool; 4],
    velo_file: &Path,
    waveforms: &[Option<Vec<i16>>; 4],
    peripheral_id: u8,
) -> Result<bool> {
    match waveform_streams(active_channels, waveforms) {
        Some(streams) => {
            rawbin_to_velo(velo_file, &streams, peripheral_id)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Reads a Velo playback file back into per-output waveforms.
///
/// Zero padding added when the file was written is kept. Inactive outputs are `None`.
pub fn velo_to_waveform(
    active_channels: &[bool; 4],
    velo_file: &Path,
) -> Result<[Option<Vec<i16>>; 4]> {
    let streams = parse_velo_stream(velo_file)?;
    let mut waveforms: [Option<Vec<i16>>; 4] = Default::default();
    for (name, [first, second]) in channel_stream_map() {
        if !active_channels[first] && !active_channels[second] {
            continue;
        }
        let stream = streams
            .get(name)
            .ok_or_else(|| Error::MissingStream(name.to_string()))?;
        if active_channels[first] && active_channels[second] {
            waveforms[first] = Some(stream.iter().step_by(2).copied().collect());
            waveforms[second] = Some(stream.iter().skip(1).step_by(2).copied().collect());
        } else if active_channels[first] {
            waveforms[first] = Some(stream.clone());
        } else {
            waveforms[second] = Some(stream.clone());
        }
    }
    Ok(waveforms)
}

/// Writes a single square-enveloped 200 MHz pulse to `velo_file`, on `DA0` (I) and `DA2` (Q).
///
/// # Arguments
/// * `width` - pulse length in ns, one sample per ns.
/// * `phase` - carrier phase, in degrees.
/// * `phase_shift` - extra phase of the Q channel, in degrees.
/// * `amp` - amplitude as a fraction of full scale.
/// * `num_avgs` - number of back-to-back copies of the pulse.
///
/// Returns the I and Q samples of one copy.
pub fn gen_velo_single_pulse(
    velo_file: &Path,
    width: usize,
    phase: f64,
    phase_shift: f64,
    amp: f64,
    num_avgs: usize,
) -> Result<(Vec<i16>, Vec<i16>)> {
    let omega = 2. * PI * SINGLE_PULSE_FREQUENCY;
    let phi = phase.to_radians();
    let shift = phase_shift.to_radians();
    let t = Array1::range(0., width as f64, 1.) * 1e-9;
    let i_wave = t.mapv(|t| amp * (omega * t + phi).sin());
    let q_wave = t.mapv(|t| amp * (omega * t + phi + shift).cos());

    let i_samples = to_dac_samples(i_wave.iter().copied());
    let q_samples = to_dac_samples(q_wave.iter().copied());
    let repeat = |samples: &[i16]| samples.repeat(num_avgs);

    let active = [true, false, true, false];
    waveform_to_velo(
        &active,
        velo_file,
        &[Some(repeat(&i_samples)), None, Some(repeat(&q_samples)), None],
        0,
    )?;
    Ok((i_samples, q_samples))
}

/// Loads a 1-D `f64` waveform from a `.npy` file, or variable `var_name` of a `.npz` archive.
///
/// MAT-files are not read; convert them first, e.g. with
/// `numpy.savez(name, r=scipy.io.loadmat(mat_file)["r"].ravel())`.
pub fn load_waveform_file(path: &Path, var_name: &str) -> Result<Array1<f64>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("npz") => {
            let mut npz = NpzReader::new(File::open(path)?)?;
            // Archive members may or may not carry the `.npy` suffix
            match npz.by_name(var_name) {
                Ok(wave) => Ok(wave),
                Err(_) => Ok(npz.by_name(&format!("{}.npy", var_name))?),
            }
        }
        Some("mat") => Err(Error::InvalidArgument(format!(
            "`{}` is a MAT-file; save `{}` to a .npz or .npy file first",
            path.display(),
            var_name
        ))),
        _ => Ok(read_npy(path)?),
    }
}

/// Writes a playback file from I and Q waveforms stored as 1-D `f64` arrays.
///
/// Each file is a `.npy` array or a `.npz` archive holding the waveform as `var_name` (see
/// [`load_waveform_file`]). Values are fractions of full scale, or volts into 50 ohm when
/// `volt_units` is set (full scale being 0.5 V).
pub fn gen_velo_from_files(
    velo_file: &Path,
    i_file: &Path,
    q_file: &Path,
    var_name: &str,
    volt_units: bool,
) -> Result<(Vec<i16>, Vec<i16>)> {
    let scale = if volt_units { 2. } else { 1. };
    let load = |path: &Path| -> Result<Vec<i16>> {
        let wave = load_waveform_file(path, var_name)?;
        Ok(to_dac_samples(wave.iter().map(|v| v * scale)))
    };
    let i_samples = load(i_file)?;
    let q_samples = load(q_file)?;

    let active = [true, false, true, false];
    waveform_to_velo(
        &active,
        velo_file,
        &[Some(i_samples.clone()), None, Some(q_samples.clone()), None],
        0,
    )?;
    Ok((i_samples, q_samples))
}
