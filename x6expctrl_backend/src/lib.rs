//! Experiment control for the X6-1000M pulse-acquisition setup.
//!
//! Builds on [`x6compiler_backend`] to drive the board: [`device`] defines the driver interface
//! and a simulated board, [`acquisition`] runs one acquisition cycle ([`run_acq`]) and
//! [`experiment`] sweeps pulse lengths and amplitudes ([`run_expt`]). [`plot`] renders traces and
//! channel timelines.
//!
//! The real board is available with the `hardware` feature, the Python module with `python`.

pub mod acquisition;
pub mod device;
pub mod error;
pub mod experiment;
pub mod plot;
#[cfg(feature = "python")]
mod python;
#[cfg(feature = "hardware")]
pub mod waterloo;

pub use acquisition::*;
pub use device::*;
pub use error::*;
pub use experiment::*;
pub use plot::*;
#[cfg(feature = "hardware")]
pub use waterloo::{probe_boards, X6Board};
