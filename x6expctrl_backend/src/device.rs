//! Board drivers and the scoped device session.
//!
//! ## Overview
//!
//! [`X6Driver`] is the interface the acquisition code expects from an X6-1000M driver: board
//! state transitions (open, preconfigure, start and stop streaming, close), configuration loading
//! and the handful of registers the experiment adjusts between runs. Register values live in a
//! [`BoardSettings`] owned by the driver; implementors only provide the accessors and the state
//! transitions, the register setters come as default methods.
//!
//! Two drivers are provided:
//! - [`SimulatedX6`] behaves like a board whose receiver logs to a capture file. On every stream
//!   stop it writes a synthetic decaying echo, one receiver window per PRI repetition, in the
//!   Velo/Vita format of the real logger. It also records every state transition in a shared
//!   [`EventLog`], which makes it a convenient test double.
//! - `X6Board` (feature `hardware`) drives a real board through `WaterlooAppDll`, see
//!   [`crate::waterloo`].
//!
//! ## Sessions
//!
//! [`DeviceSession`] opens a board and guarantees it is closed again when the session goes out of
//! scope, on success, on early `?` returns and on panics alike. Closing a streaming board stops
//! the stream first.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::f64::consts::PI;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use x6compiler_backend::*;

use crate::error::{Error, Result};

pub trait X6Driver {
    // Field methods
    fn settings(&self) -> &BoardSettings;
    fn is_open(&self) -> bool;
    fn is_streaming(&self) -> bool;
    // Mutable field references
    fn settings_(&mut self) -> &mut BoardSettings;

    fn open(&mut self) -> Result<()>;
    /// Closes the board, stopping the stream first if needed. Closing a closed board does nothing.
    fn close(&mut self) -> Result<()>;
    /// Sends the settings to the board and calibrates it for streaming.
    fn preconfigure(&mut self) -> Result<()>;
    fn start_streaming(&mut self) -> Result<()>;
    fn stop_streaming(&mut self) -> Result<()>;

    fn require_open(&self, action: &str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Device(format!("cannot {}: no board is open", action)))
        }
    }

    /// Loads preset `section` of `conf_file`. Nothing reaches the board before
    /// [`X6Driver::preconfigure`].
    fn load_configuration(&mut self, conf_file: &Path, section: &str) -> Result<()> {
        self.require_open("load a configuration")?;
        let conf = ConfigFile::read(conf_file)?;
        self.settings_().apply(&conf, section)?;
        Ok(())
    }

    fn set_tx_count(&mut self, count: u32) {
        self.settings_().tx_pri.count = count;
    }
    fn set_rx_count(&mut self, count: u32) {
        self.settings_().rx_pri.count = count;
    }
    /// Pattern period, in ns.
    fn set_tx_period(&mut self, period: u64) {
        self.settings_().tx_pri.period = period;
    }
    fn set_rx_period(&mut self, period: u64) {
        self.settings_().rx_pri.period = period;
    }

    fn tx_active_channels(&self) -> [bool; 4] {
        self.settings().tx_active_channels()
    }
}

/// An open board, closed when the session is dropped.
pub struct DeviceSession<'a, D: X6Driver + ?Sized> {
    device: &'a mut D,
    closed: bool,
}

impl<'a, D: X6Driver + ?Sized> DeviceSession<'a, D> {
    pub fn open(device: &'a mut D) -> Result<Self> {
        device.open()?;
        Ok(Self {
            device,
            closed: false,
        })
    }

    /// Closes the board now, reporting a failure to close.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        log::info!("Closing...");
        self.device.close()
    }
}

impl<D: X6Driver + ?Sized> Deref for DeviceSession<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: X6Driver + ?Sized> DerefMut for DeviceSession<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: X6Driver + ?Sized> Drop for DeviceSession<'_, D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        log::info!("Closing...");
        if let Err(e) = self.device.close() {
            log::error!("Failed to close the board: {}", e);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Open,
    LoadConfiguration { section: String },
    Preconfigure,
    StartStreaming,
    StopStreaming,
    Close,
}

pub type EventLog = Arc<Mutex<Vec<DeviceEvent>>>;

/// Receiver window used when no receiver pattern is configured, in samples.
pub const DEFAULT_RECEIVER_WINDOW: usize = 2000;
/// Peak of the synthetic echo, in ADC counts.
pub const SIMULATED_ECHO_AMPLITUDE: f64 = 8000.;
/// DC offset of the synthetic capture, in ADC counts.
pub const SIMULATED_BASELINE: f64 = 120.;
// Echo carrier, in cycles per sample
const SIMULATED_ECHO_FREQUENCY: f64 = 0.05;

/// Board simulator writing synthetic captures; see the module documentation.
pub struct SimulatedX6 {
    settings: BoardSettings,
    capture_file: PathBuf,
    is_open: bool,
    is_streaming: bool,
    preconfigured: bool,
    events: EventLog,
}

impl SimulatedX6 {
    /// A closed simulated board logging its captures to `capture_file`.
    pub fn new(capture_file: &Path) -> Self {
        Self {
            settings: BoardSettings::default(),
            capture_file: capture_file.to_path_buf(),
            is_open: false,
            is_streaming: false,
            preconfigured: false,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn capture_file(&self) -> &Path {
        &self.capture_file
    }

    /// Shared handle on the recorded state transitions.
    pub fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: DeviceEvent) {
        log::debug!("simulated X6: {:?}", event);
        self.events.lock().push(event);
    }

    /// Samples the receiver keeps per PRI repetition: the time `AD0` is gated on.
    fn receiver_window(&self) -> Result<usize> {
        let rx_pri = &self.settings.rx_pri;
        let pattern = match (&rx_pri.pattern_file, rx_pri.enable) {
            (Some(file), true) => PriPattern::read(file)?,
            _ => return Ok(DEFAULT_RECEIVER_WINDOW),
        };
        let lines = pri_pattern_to_pulse_lines(Some(&pattern), None);
        Ok(lines
            .get("AD0")
            .map(|line| line.compile().sum() as usize)
            .unwrap_or(0))
    }

    fn synthetic_capture(&self) -> Result<IndexMap<String, Vec<i16>>> {
        let window = self.receiver_window()?;
        let frames = self.settings.rx_pri.count.max(1) as usize;
        let tau = (window as f64 / 4.).max(1.);
        let frame: Vec<i16> = (0..window)
            .map(|k| {
                let k = k as f64;
                let echo = SIMULATED_ECHO_AMPLITUDE
                    * (-k / tau).exp()
                    * (2. * PI * SIMULATED_ECHO_FREQUENCY * k).cos();
                (SIMULATED_BASELINE + echo) as i16
            })
            .collect();
        let samples = frame.repeat(frames);

        let active = &self.settings.rx_trigger.active_channels;
        let is_active = |idx: usize| active.get(idx).copied().unwrap_or(false);
        let mut streams = IndexMap::new();
        for (name, [first, second]) in channel_stream_map() {
            let stream: Vec<i16> = match (is_active(first), is_active(second)) {
                (true, true) => samples.iter().flat_map(|&s| [s, s]).collect(),
                (true, false) | (false, true) => samples.clone(),
                (false, false) => continue,
            };
            streams.insert(name.to_string(), stream);
        }
        Ok(streams)
    }
}

impl X6Driver for SimulatedX6 {
    fn settings(&self) -> &BoardSettings {
        &self.settings
    }
    fn is_open(&self) -> bool {
        self.is_open
    }
    fn is_streaming(&self) -> bool {
        self.is_open && self.is_streaming
    }
    fn settings_(&mut self) -> &mut BoardSettings {
        &mut self.settings
    }

    fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Err(Error::Device(
                "a board has already been opened; close the X6 first".to_string(),
            ));
        }
        self.is_open = true;
        self.is_streaming = false;
        self.preconfigured = false;
        self.settings = BoardSettings::default();
        self.record(DeviceEvent::Open);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        if self.is_streaming {
            if let Err(e) = self.stop_streaming() {
                log::warn!("Exception encountered while stopping stream; trying to close anyway. {}", e);
            }
        }
        self.is_open = false;
        self.is_streaming = false;
        self.record(DeviceEvent::Close);
        Ok(())
    }

    fn load_configuration(&mut self, conf_file: &Path, section: &str) -> Result<()> {
        self.require_open("load a configuration")?;
        let conf = ConfigFile::read(conf_file)?;
        self.settings.apply(&conf, section)?;
        self.record(DeviceEvent::LoadConfiguration {
            section: section.to_string(),
        });
        Ok(())
    }

    fn preconfigure(&mut self) -> Result<()> {
        self.require_open("preconfigure")?;
        self.settings.validate()?;
        self.preconfigured = true;
        self.record(DeviceEvent::Preconfigure);
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        self.require_open("start streaming")?;
        if self.is_streaming {
            return Err(Error::Device("the board is already streaming".to_string()));
        }
        if !self.preconfigured {
            return Err(Error::Device(
                "the board must be preconfigured before streaming".to_string(),
            ));
        }
        self.is_streaming = true;
        self.record(DeviceEvent::StartStreaming);
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.require_open("stop streaming")?;
        self.is_streaming = false;
        self.record(DeviceEvent::StopStreaming);
        let streams = self.synthetic_capture()?;
        if streams.is_empty() {
            log::warn!("No receiver channel is active; the simulated logger wrote nothing.");
            return Ok(());
        }
        rawbin_to_velo(&self.capture_file, &streams, 0)?;
        Ok(())
    }
}
