//! Hardware-free backend of the X6-1000M pulse-acquisition experiment.
//!
//! Everything here works on files and arrays only: PRI pattern files ([`pattern`]), the board's
//! ini-style configuration ([`config`]), Velo/Vita sample streams ([`vita`], [`waveform`]),
//! timeline rasterization for plots ([`lines`]) and averaging of captures ([`averaging`]).
//! Driving the board itself is the job of `x6expctrl_backend`.

pub mod averaging;
pub mod channel;
pub mod config;
pub mod error;
pub mod lines;
pub mod pattern;
pub mod utils;
pub mod vita;
pub mod waveform;

pub use averaging::*;
pub use channel::*;
pub use config::*;
pub use error::*;
pub use lines::*;
pub use pattern::*;
pub use utils::*;
pub use vita::*;
pub use waveform::*;
