//! Channel naming and PRI destination codes of the X6-1000M custom logic.
//!
//! The board exposes four analog outputs (`DA0..DA3`, two per DAC), four analog inputs
//! (`AD0..AD3`, two per ADC) and four digital lines attached to each converter
//! (`DAC0_DIO0`, ..., `ADC1_DIO3`). A PRI pattern addresses these through the bitmask written in
//! its `[Destination]` section. Receiver and transmitter patterns use the same bit values, so a
//! code only has meaning together with the direction of the pattern it came from; see
//! [`destcode_query`].
//!
//! Analog channels on the same converter share a code (`DA0` and `DA1` are both [`TxDest::DAC0`]);
//! which of the two actually plays is decided by the active-channel list of the configuration.

use bitflags::bitflags;
use indexmap::IndexMap;

use crate::error::*;

bitflags! {
    /// Destination bits of a transmitter PRI pattern.
    pub struct TxDest: u32 {
        const DAC0      = 0x001;
        const DAC0_DIO0 = 0x002;
        const DAC0_DIO1 = 0x004;
        const DAC0_DIO2 = 0x008;
        const DAC0_DIO3 = 0x010;
        const DAC1      = 0x020;
        const DAC1_DIO0 = 0x040;
        const DAC1_DIO1 = 0x080;
        const DAC1_DIO2 = 0x100;
        const DAC1_DIO3 = 0x200;
    }
}

bitflags! {
    /// Destination bits of a receiver PRI pattern.
    pub struct RxDest: u32 {
        const ADC0      = 0x001;
        const ADC0_DIO0 = 0x002;
        const ADC0_DIO1 = 0x004;
        const ADC0_DIO2 = 0x008;
        const ADC0_DIO3 = 0x010;
        const ADC1      = 0x020;
        const ADC1_DIO0 = 0x040;
        const ADC1_DIO1 = 0x080;
        const ADC1_DIO2 = 0x100;
        const ADC1_DIO3 = 0x200;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

/// Maximum sample rate with one channel per DAC (samples/us).
pub const FULL_SAMPLE_RATE: f64 = 1000.;
/// Maximum sample rate with two interleaved channels per DAC (samples/us).
pub const HALF_SAMPLE_RATE: f64 = 500.;

pub const RX_CHANNELS: [&str; 12] = [
    "AD0", "AD1", "AD2", "AD3", "ADC0_DIO0", "ADC0_DIO1", "ADC0_DIO2", "ADC0_DIO3", "ADC1_DIO0",
    "ADC1_DIO1", "ADC1_DIO2", "ADC1_DIO3",
];

/// Transmitter channels. The first four are the analog outputs, in active-channel order.
pub const TX_CHANNELS: [&str; 12] = [
    "DA0", "DA1", "DA2", "DA3", "DAC0_DIO0", "DAC0_DIO1", "DAC0_DIO2", "DAC0_DIO3", "DAC1_DIO0",
    "DAC1_DIO1", "DAC1_DIO2", "DAC1_DIO3",
];

/// All channels, receiver side first.
pub fn channels() -> impl Iterator<Item = &'static str> {
    RX_CHANNELS.iter().chain(TX_CHANNELS.iter()).copied()
}

pub fn direction(channel: &str) -> Option<Direction> {
    if RX_CHANNELS.contains(&channel) {
        Some(Direction::Rx)
    } else if TX_CHANNELS.contains(&channel) {
        Some(Direction::Tx)
    } else {
        None
    }
}

/// PRI destination code addressing `channel`, if the channel exists.
///
/// ```
/// use x6compiler_backend::channel_pri_code;
/// assert_eq!(channel_pri_code("DA3"), Some(0x020));
/// assert_eq!(channel_pri_code("ADC1_DIO3"), Some(0x200));
/// assert_eq!(channel_pri_code("DA4"), None);
/// ```
pub fn channel_pri_code(channel: &str) -> Option<u32> {
    let code = match channel {
        "DA0" | "DA1" => TxDest::DAC0.bits(),
        "DA2" | "DA3" => TxDest::DAC1.bits(),
        "AD0" | "AD1" => RxDest::ADC0.bits(),
        "AD2" | "AD3" => RxDest::ADC1.bits(),
        "DAC0_DIO0" => TxDest::DAC0_DIO0.bits(),
        "DAC0_DIO1" => TxDest::DAC0_DIO1.bits(),
        "DAC0_DIO2" => TxDest::DAC0_DIO2.bits(),
        "DAC0_DIO3" => TxDest::DAC0_DIO3.bits(),
        "DAC1_DIO0" => TxDest::DAC1_DIO0.bits(),
        "DAC1_DIO1" => TxDest::DAC1_DIO1.bits(),
        "DAC1_DIO2" => TxDest::DAC1_DIO2.bits(),
        "DAC1_DIO3" => TxDest::DAC1_DIO3.bits(),
        "ADC0_DIO0" => RxDest::ADC0_DIO0.bits(),
        "ADC0_DIO1" => RxDest::ADC0_DIO1.bits(),
        "ADC0_DIO2" => RxDest::ADC0_DIO2.bits(),
        "ADC0_DIO3" => RxDest::ADC0_DIO3.bits(),
        "ADC1_DIO0" => RxDest::ADC1_DIO0.bits(),
        "ADC1_DIO1" => RxDest::ADC1_DIO1.bits(),
        "ADC1_DIO2" => RxDest::ADC1_DIO2.bits(),
        "ADC1_DIO3" => RxDest::ADC1_DIO3.bits(),
        _ => return None,
    };
    Some(code)
}

/// Decodes a destination code into the set of channels it addresses.
///
/// Since receiver and transmitter codes overlap, `rx` and `tx` select which side the code is
/// interpreted for; a channel is reported as addressed only if its side is enabled.
///
/// # Arguments
/// * `dest_code` - the value of a `P*` field in the `[Destination]` section of a pattern.
/// * `rx` - interpret the code as a receiver code.
/// * `tx` - interpret the code as a transmitter code.
///
/// # Examples
/// ```
/// use x6compiler_backend::destcode_query;
/// // 33 = DAC0 | DAC1: all four analog outputs
/// let query = destcode_query(33, false, true);
/// assert!(query["DA0"] && query["DA1"] && query["DA2"] && query["DA3"]);
/// assert!(!query["AD0"]);
/// assert!(!query["DAC0_DIO0"]);
/// ```
pub fn destcode_query(dest_code: u32, rx: bool, tx: bool) -> IndexMap<&'static str, bool> {
    channels()
        .map(|name| {
            let side_enabled = match direction(name) {
                Some(Direction::Rx) => rx,
                Some(Direction::Tx) => tx,
                None => false,
            };
            let addressed = channel_pri_code(name).map_or(false, |code| dest_code & code != 0);
            (name, addressed && side_enabled)
        })
        .collect()
}

/// Adjusts an active-channel list to one the board can run.
///
/// Three active outputs are not supported, so they are promoted to four-channel mode. Two active
/// channels on the same DAC, or no active channel at all, are accepted with a warning.
///
/// ```
/// use x6compiler_backend::validate_active_channels;
/// assert_eq!(validate_active_channels(&[true, true, false, true]).unwrap(), [true; 4]);
/// assert_eq!(
///     validate_active_channels(&[true, false, true, false]).unwrap(),
///     [true, false, true, false]
/// );
/// assert!(validate_active_channels(&[true, false]).is_err());
/// ```
pub fn validate_active_channels(active_channels: &[bool]) -> Result<[bool; 4]> {
    let active: [bool; 4] = active_channels.try_into().map_err(|_| {
        Error::InvalidArgument(format!(
            "active_channels must hold four booleans, got {}",
            active_channels.len()
        ))
    })?;
    match active.iter().filter(|&&a| a).count() {
        3 => {
            log::warn!("Three channels found active -- switching to four channel mode.");
            Ok([true; 4])
        }
        0 => {
            log::warn!("No active channel found; the board will only drive its digital lines.");
            Ok(active)
        }
        2 if active == [true, true, false, false] || active == [false, false, true, true] => {
            log::warn!(
                "Two active channels found, both on the same DAC -- consider switching to DA0 and DA2 for a higher sample rate."
            );
            Ok(active)
        }
        _ => Ok(active),
    }
}

/// True when two channels of the same DAC are active, which halves the maximum sample rate.
pub fn is_interleaved(active_channels: &[bool; 4]) -> bool {
    (active_channels[0] && active_channels[1]) || (active_channels[2] && active_channels[3])
}
