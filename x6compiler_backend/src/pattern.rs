//! PRI (pulse repetition interval) pattern files.
//!
//! A pattern tells the board, for every pulse of one repetition, which destination lines to
//! assert ([`crate::channel`] codes), after which delay and for how many samples. On disk it is an
//! ini-style file with three sections of equal length:
//!
//! ```text
//! [Destination]
//! ArraySize=1
//! P0=1
//!
//! [Delay]
//! ArraySize=1
//! P0=0
//!
//! [Width]
//! ArraySize=1
//! P0=2000
//! ```
//!
//! [`PriPattern`] is the in-memory record. The lab writers [`gen_transmitter_pattern`],
//! [`gen_transmitter_pattern_nodigital`] and [`gen_receiver_pattern`] render the fixed patterns
//! of the single-pulse experiment into `transmitter.pattern` and `receiver.pattern`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::channel::*;
use crate::config::*;
use crate::error::*;
use crate::utils::*;

pub const TRANSMITTER_PATTERN_FILE: &str = "transmitter.pattern";
pub const RECEIVER_PATTERN_FILE: &str = "receiver.pattern";

const DESTINATION: &str = "Destination";
const DELAY: &str = "Delay";
const WIDTH: &str = "Width";
const ARRAY_SIZE: &str = "ArraySize";
const SECTIONS: [&str; 3] = [DESTINATION, DELAY, WIDTH];

/// One entry of a pattern: assert `destination` for `width` samples, `delay` samples into the
/// repetition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriPulse {
    pub destination: u32,
    pub delay: u64,
    pub width: u64,
}

impl PriPulse {
    pub fn new(destination: u32, delay: u64, width: u64) -> Self {
        Self {
            destination,
            delay,
            width,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriPattern {
    pulses: Vec<PriPulse>,
}

impl PriPattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pulses, written as `ArraySize` in every section.
    pub fn array_size(&self) -> usize {
        self.pulses.len()
    }

    pub fn pulses(&self) -> &[PriPulse] {
        &self.pulses
    }

    pub fn pulse(&self, pulse_num: usize) -> Result<PriPulse> {
        self.pulses
            .get(pulse_num)
            .copied()
            .ok_or(Error::PulseIndex {
                index: pulse_num,
                array_size: self.array_size(),
            })
    }

    pub fn append_pulse(&mut self, destination: u32, delay: u64, width: u64) {
        self.pulses.push(PriPulse::new(destination, delay, width));
    }

    /// Replaces pulse `pulse_num`, which must be below [`PriPattern::array_size`].
    pub fn set_pulse(&mut self, pulse_num: usize, destination: u32, delay: u64, width: u64) -> Result<()> {
        let array_size = self.array_size();
        let pulse = self.pulses.get_mut(pulse_num).ok_or(Error::PulseIndex {
            index: pulse_num,
            array_size,
        })?;
        *pulse = PriPulse::new(destination, delay, width);
        Ok(())
    }

    /// Parses pattern text.
    ///
    /// Missing sections count as empty, with a warning when only some of them are present. When
    /// the sections disagree on `ArraySize`, the `[Destination]` size is used after a warning.
    /// Field values may be decimal or `0x` hexadecimal.
    pub fn parse_str(text: &str) -> Result<Self> {
        Self::from_config(&ConfigFile::parse_str(text)?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::from_config(&ConfigFile::read(path)?)
    }

    fn from_config(conf: &ConfigFile) -> Result<Self> {
        let present = SECTIONS.iter().filter(|s| conf.has_section(s)).count();
        if present > 0 && present < SECTIONS.len() {
            log::warn!("Only some of the required sections were found in the pattern file. This will likely result in indexing errors.");
        }

        let mut sizes = Vec::with_capacity(SECTIONS.len());
        for section in SECTIONS {
            let size = if conf.has_option(section, ARRAY_SIZE) {
                let raw = conf.get(section, ARRAY_SIZE)?;
                usize::try_from(parse_int(raw)?).map_err(|_| Error::parse("ArraySize", raw))?
            } else {
                0
            };
            sizes.push(size);
        }
        if sizes.iter().any(|&s| s != sizes[0]) {
            log::warn!(
                "The ArraySize in the Destination, Delay, and Width sections are not equal ({:?}).",
                sizes
            );
        }

        let field = |section: &str, k: usize| -> Result<i64> {
            parse_int(conf.get(section, &format!("P{}", k))?)
        };
        let mut pattern = PriPattern::new();
        for k in 0..sizes[0] {
            let destination = field(DESTINATION, k)?;
            let delay = field(DELAY, k)?;
            let width = field(WIDTH, k)?;
            pattern.pulses.push(PriPulse::new(
                u32::try_from(destination).map_err(|_| Error::parse("destination", destination.to_string()))?,
                u64::try_from(delay).map_err(|_| Error::parse("delay", delay.to_string()))?,
                u64::try_from(width).map_err(|_| Error::parse("width", width.to_string()))?,
            ));
        }
        Ok(pattern)
    }

    /// Writes the pattern to `path`, truncating any previous content.
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())?;
        Ok(())
    }

    /// Channels addressed by pulse `pulse_num`, for a receiver (`rx`) or transmitter pattern.
    pub fn addressed_channels(&self, pulse_num: usize, rx: bool) -> Result<Vec<&'static str>> {
        let pulse = self.pulse(pulse_num)?;
        Ok(destcode_query(pulse.destination, rx, !rx)
            .into_iter()
            .filter_map(|(name, on)| on.then_some(name))
            .collect())
    }
}

impl fmt::Display for PriPattern {
    /// The on-disk layout: sections separated by a blank line, no spaces around `=`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let values: [Vec<u64>; 3] = [
            self.pulses.iter().map(|p| p.destination as u64).collect(),
            self.pulses.iter().map(|p| p.delay).collect(),
            self.pulses.iter().map(|p| p.width).collect(),
        ];
        for (i, (section, column)) in SECTIONS.iter().zip(values.iter()).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", section)?;
            writeln!(f, "{}={}", ARRAY_SIZE, column.len())?;
            for (k, value) in column.iter().enumerate() {
                writeln!(f, "P{}={}", k, value)?;
            }
        }
        Ok(())
    }
}

/// Transmitter pattern of the single-pulse experiment.
///
/// Four pulses per repetition, in order:
/// 1. a 20000-sample trigger on `DAC0`,
/// 2. pulse blanking on `DAC1_DIO0`, 1000 samples longer than the pulse,
/// 3. the RF pulse on both DACs, 400 samples in,
/// 4. receiver blanking on `DAC1_DIO3`, aligned with the pulse.
///
/// The delays and the trigger width are tuned to the cabling of the spectrometer and are not
/// derived from `dead_time`, which is only recorded in the log.
///
/// # Examples
/// ```
/// use x6compiler_backend::*;
/// let pattern = transmitter_pattern(100, 515);
/// assert_eq!(pattern.array_size(), 4);
/// assert_eq!(pattern.pulse(1).unwrap(), PriPulse::new(64, 0, 1100));
/// assert_eq!(pattern.pulse(2).unwrap().width, 100);
/// ```
pub fn transmitter_pattern(pulse_length: u64, dead_time: u64) -> PriPattern {
    log::debug!(
        "transmitter pattern: pulse_length={}, dead_time={}",
        pulse_length,
        dead_time
    );
    let mut pattern = PriPattern::new();
    pattern.append_pulse(TxDest::DAC0.bits(), 0, 20000);
    pattern.append_pulse(TxDest::DAC1_DIO0.bits(), 0, pulse_length + 1000);
    pattern.append_pulse((TxDest::DAC0 | TxDest::DAC1).bits(), 400, pulse_length);
    pattern.append_pulse(TxDest::DAC1_DIO3.bits(), 400, pulse_length);
    pattern
}

/// Transmitter pattern without digital lines: the RF pulse on both DACs only.
pub fn transmitter_pattern_nodigital(pulse_length: u64) -> PriPattern {
    let mut pattern = PriPattern::new();
    pattern.append_pulse((TxDest::DAC0 | TxDest::DAC1).bits(), 0, pulse_length);
    pattern
}

/// Receiver pattern: a single acquisition window on `ADC0`.
pub fn receiver_pattern(delay: u64, width: u64) -> PriPattern {
    let mut pattern = PriPattern::new();
    pattern.append_pulse(RxDest::ADC0.bits(), delay, width);
    pattern
}

/// Writes [`transmitter_pattern`] to `transmitter.pattern` in `dir` and returns its path.
pub fn gen_transmitter_pattern(dir: &Path, pulse_length: u64, dead_time: u64) -> Result<PathBuf> {
    let path = dir.join(TRANSMITTER_PATTERN_FILE);
    transmitter_pattern(pulse_length, dead_time).write(&path)?;
    Ok(path)
}

/// Writes [`transmitter_pattern_nodigital`] to `transmitter.pattern` in `dir`.
pub fn gen_transmitter_pattern_nodigital(dir: &Path, pulse_length: u64, dead_time: u64) -> Result<PathBuf> {
    log::debug!(
        "no-digital transmitter pattern: pulse_length={}, dead_time={}",
        pulse_length,
        dead_time
    );
    let path = dir.join(TRANSMITTER_PATTERN_FILE);
    transmitter_pattern_nodigital(pulse_length).write(&path)?;
    Ok(path)
}

/// Writes [`receiver_pattern`] to `receiver.pattern` in `dir`.
pub fn gen_receiver_pattern(dir: &Path, delay: u64, width: u64) -> Result<PathBuf> {
    let path = dir.join(RECEIVER_PATTERN_FILE);
    receiver_pattern(delay, width).write(&path)?;
    Ok(path)
}
