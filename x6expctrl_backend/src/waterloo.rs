//! Provides a minimal rust wrapper for the `WaterlooAppDll` C library driving the X6-1000M.
//!
//! ## Overview
//!
//! The library holds a single global board handle. [`X6Board`] owns that handle for the lifetime
//! of the process: creating it calls `WaterlooApp_Init`, dropping it closes any open board and
//! calls `WaterlooApp_Cleanup`. Settings are kept on the Rust side as a [`BoardSettings`] and are
//! converted into the library's C structs when the board is preconfigured.
//!
//! ## Error Handling
//!
//! Functions returning `int` report failure with `-1`; functions returning `void` report it
//! through `WaterlooApp_LastError`. Both are turned into [`Error::Device`] by [`wa_call`] and
//! [`wa_call_void`], carrying the library's description of the failure.

use libc::{c_char, c_double, c_float, c_int, c_uint, c_ulonglong};
use std::ffi::{CStr, CString};
use std::path::PathBuf;

use x6compiler_backend::*;

use crate::device::*;
use crate::error::{Error, Result};

#[repr(C)]
struct WaCommonSettings {
    ext_clock_src_selection: c_int,
    reference_clock_source: c_int,
    reference_rate: c_float,
    sample_clock_source: c_int,
    sample_rate: c_float,
    ext_trigger_src_selection: c_int,
    alert_enable: [c_int; 7],
    auto_preconfig: c_int,
    debug_verbosity: c_int,
}

#[repr(C)]
struct WaIoTriggerSettings {
    external_trigger: c_int,
    edge_trigger: c_int,
    framed: c_int,
    frame_size: c_int,
    trigger_delay_period: c_int,
    active_channels: [c_int; 4],
    decimation_enable: bool,
    decimation_factor: c_int,
}

#[repr(C)]
struct WaIoPriSettings {
    enable: c_int,
    finite: c_int,
    rearm: c_int,
    period: c_ulonglong,
    count: c_uint,
    pattern_file: *const c_char,
    pattern_file_size: c_int,
}

#[repr(C)]
struct WaRxMiscSettings {
    packet_size: c_int,
    force_size: c_int,
    test_counter_enable: bool,
    test_gen_mode: c_int,
    logger_enable: c_int,
    plot_enable: c_int,
    merge_parse_enable: c_int,
    samples_to_log: c_uint,
    overwrite_bdd: c_int,
    auto_stop: c_int,
    merge_packet_size: c_uint,
}

#[repr(C)]
struct WaTxMiscSettings {
    test_gen_enable: c_int,
    test_gen_mode: c_int,
    test_frequency_mhz: c_double,
    packet_size: c_int,
    play_from_file_enable: c_int,
    play_from_file_filename: *const c_char,
    play_from_file_filename_size: c_int,
}

#[link(name = "WaterlooAppDll")]
extern "C" {
    fn WaterlooApp_Init() -> c_int;
    fn WaterlooApp_Cleanup() -> c_int;
    fn WaterlooApp_BoardCount() -> c_uint;
    fn WaterlooApp_Open(target: c_int, rx_bm_size: c_int, tx_bm_size: c_int) -> c_int;
    fn WaterlooApp_Close() -> c_int;
    fn WaterlooApp_LastError() -> *const c_char;

    fn WaterlooApp_Load_Common(settings: *const WaCommonSettings);
    fn WaterlooApp_Load_RxTrigger(settings: *const WaIoTriggerSettings);
    fn WaterlooApp_Load_TxTrigger(settings: *const WaIoTriggerSettings);
    fn WaterlooApp_Load_RxPRI(settings: *const WaIoPriSettings);
    fn WaterlooApp_Load_TxPRI(settings: *const WaIoPriSettings);
    fn WaterlooApp_Load_RxMisc(settings: *const WaRxMiscSettings);
    fn WaterlooApp_Load_TxMisc(settings: *const WaTxMiscSettings);

    fn WaterlooApp_StreamPreconfigure();
    fn WaterlooApp_StreamStart() -> c_int;
    fn WaterlooApp_StreamStop();
}

fn last_error() -> String {
    let what = unsafe { WaterlooApp_LastError() };
    if what.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(what) }
        .to_string_lossy()
        .into_owned()
}

/// Calls an `int`-returning library function, converting `-1` into [`Error::Device`].
pub fn wa_call<F: FnOnce() -> c_int>(name: &str, func: F) -> Result<c_int> {
    let result = func();
    if result == -1 {
        return Err(Error::Device(format!("Error inside {}: {}", name, last_error())));
    }
    Ok(result)
}

/// Calls a `void` library function, then checks `WaterlooApp_LastError`.
pub fn wa_call_void<F: FnOnce()>(name: &str, func: F) -> Result<()> {
    func();
    let what = last_error();
    if what.is_empty() {
        Ok(())
    } else {
        Err(Error::Device(format!("Error inside {}: {}", name, what)))
    }
}

fn c_bool(value: bool) -> c_int {
    value as c_int
}

fn c_flags<const N: usize>(values: &[bool]) -> [c_int; N] {
    let mut flags = [0; N];
    for (slot, &value) in flags.iter_mut().zip(values) {
        *slot = c_bool(value);
    }
    flags
}

fn c_path(path: &Option<PathBuf>) -> Result<CString> {
    let text = path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    CString::new(text).map_err(|e| Error::InvalidArgument(format!("bad file name: {}", e)))
}

fn trigger_settings(trigger: &TriggerSettings) -> WaIoTriggerSettings {
    WaIoTriggerSettings {
        external_trigger: c_bool(trigger.external_trigger),
        edge_trigger: c_bool(trigger.edge_trigger),
        framed: c_bool(trigger.framed),
        frame_size: trigger.frame_size,
        trigger_delay_period: trigger.trigger_delay_period,
        active_channels: c_flags(&trigger.active_channels),
        decimation_enable: trigger.decimation_enable,
        decimation_factor: trigger.decimation_factor,
    }
}

fn pri_settings(pri: &PriSettings, pattern_file: &CString) -> WaIoPriSettings {
    WaIoPriSettings {
        enable: c_bool(pri.enable),
        finite: c_bool(pri.finite),
        rearm: c_bool(pri.rearm),
        period: pri.period,
        count: pri.count,
        pattern_file: pattern_file.as_ptr(),
        pattern_file_size: pattern_file.as_bytes().len() as c_int,
    }
}

/// The X6-1000M board of this machine.
pub struct X6Board {
    settings: BoardSettings,
    idx_board: usize,
    rx_busmaster_size: i32,
    tx_busmaster_size: i32,
    is_open: bool,
    is_streaming: bool,
}

impl X6Board {
    /// Initializes the library for board `idx_board`, with 4 MiB busmasters.
    pub fn new(idx_board: usize) -> Result<Self> {
        wa_call("WaterlooApp_Init", || unsafe { WaterlooApp_Init() })?;
        Ok(Self {
            settings: BoardSettings::default(),
            idx_board,
            rx_busmaster_size: 4,
            tx_busmaster_size: 4,
            is_open: false,
            is_streaming: false,
        })
    }

    pub fn n_boards(&self) -> usize {
        unsafe { WaterlooApp_BoardCount() as usize }
    }

    fn apply_settings(&self) -> Result<()> {
        let s = &self.settings;
        let common = WaCommonSettings {
            ext_clock_src_selection: s.common.ext_clock_src_selection,
            reference_clock_source: s.common.reference_clock_source,
            reference_rate: s.common.reference_rate as c_float,
            sample_clock_source: s.common.sample_clock_source,
            sample_rate: s.common.sample_rate as c_float,
            ext_trigger_src_selection: s.common.ext_trigger_src_selection,
            alert_enable: c_flags(&s.common.alert_enable),
            auto_preconfig: c_bool(s.common.auto_preconfig),
            debug_verbosity: s.common.debug_verbosity,
        };
        log::debug!("Loading common settings...");
        wa_call_void("WaterlooApp_Load_Common", || unsafe { WaterlooApp_Load_Common(&common) })?;

        log::debug!("Loading trigger settings...");
        let rx_trigger = trigger_settings(&s.rx_trigger);
        let tx_trigger = trigger_settings(&s.tx_trigger);
        wa_call_void("WaterlooApp_Load_RxTrigger", || unsafe {
            WaterlooApp_Load_RxTrigger(&rx_trigger)
        })?;
        wa_call_void("WaterlooApp_Load_TxTrigger", || unsafe {
            WaterlooApp_Load_TxTrigger(&tx_trigger)
        })?;

        // The C strings must outlive the load calls
        log::debug!("Loading PRI settings...");
        let rx_pattern = c_path(&s.rx_pri.pattern_file)?;
        let tx_pattern = c_path(&s.tx_pri.pattern_file)?;
        let rx_pri = pri_settings(&s.rx_pri, &rx_pattern);
        let tx_pri = pri_settings(&s.tx_pri, &tx_pattern);
        wa_call_void("WaterlooApp_Load_RxPRI", || unsafe { WaterlooApp_Load_RxPRI(&rx_pri) })?;
        wa_call_void("WaterlooApp_Load_TxPRI", || unsafe { WaterlooApp_Load_TxPRI(&tx_pri) })?;

        log::debug!("Loading misc settings...");
        let rx = &s.rx_misc;
        let rx_misc = WaRxMiscSettings {
            packet_size: rx.packet_size,
            force_size: c_bool(rx.force_size),
            test_counter_enable: rx.test_counter_enable,
            test_gen_mode: rx.test_gen_mode,
            logger_enable: c_bool(rx.logger_enable),
            plot_enable: c_bool(rx.plot_enable),
            merge_parse_enable: c_bool(rx.merge_parse_enable),
            samples_to_log: rx.samples_to_log,
            overwrite_bdd: c_bool(rx.overwrite_bdd),
            auto_stop: c_bool(rx.auto_stop),
            merge_packet_size: rx.merge_packet_size,
        };
        let tx = &s.tx_misc;
        let play_file = c_path(&tx.play_from_file_filename)?;
        let tx_misc = WaTxMiscSettings {
            test_gen_enable: c_bool(tx.test_gen_enable),
            test_gen_mode: tx.test_gen_mode,
            test_frequency_mhz: tx.test_frequency_mhz,
            packet_size: tx.packet_size,
            play_from_file_enable: c_bool(tx.play_from_file_enable),
            play_from_file_filename: play_file.as_ptr(),
            play_from_file_filename_size: play_file.as_bytes().len() as c_int,
        };
        wa_call_void("WaterlooApp_Load_RxMisc", || unsafe { WaterlooApp_Load_RxMisc(&rx_misc) })?;
        wa_call_void("WaterlooApp_Load_TxMisc", || unsafe { WaterlooApp_Load_TxMisc(&tx_misc) })?;
        Ok(())
    }
}

impl X6Driver for X6Board {
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
        if self.idx_board >= self.n_boards() {
            return Err(Error::InvalidArgument(format!(
                "board index {} is invalid",
                self.idx_board
            )));
        }
        wa_call("WaterlooApp_Open", || unsafe {
            WaterlooApp_Open(
                self.idx_board as c_int,
                self.rx_busmaster_size,
                self.tx_busmaster_size,
            )
        })?;
        self.is_open = true;
        self.is_streaming = false;
        self.settings = BoardSettings::default();
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
        wa_call("WaterlooApp_Close", || unsafe { WaterlooApp_Close() })?;
        self.is_open = false;
        self.is_streaming = false;
        Ok(())
    }

    fn preconfigure(&mut self) -> Result<()> {
        self.require_open("preconfigure")?;
        self.settings.validate()?;
        self.apply_settings()?;
        wa_call_void("WaterlooApp_StreamPreconfigure", || unsafe {
            WaterlooApp_StreamPreconfigure()
        })
    }

    fn start_streaming(&mut self) -> Result<()> {
        self.require_open("start streaming")?;
        if self.is_streaming {
            return Err(Error::Device("the board is already streaming".to_string()));
        }
        wa_call("WaterlooApp_StreamStart", || unsafe { WaterlooApp_StreamStart() })?;
        self.is_streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.require_open("stop streaming")?;
        wa_call_void("WaterlooApp_StreamStop", || unsafe { WaterlooApp_StreamStop() })?;
        self.is_streaming = false;
        Ok(())
    }
}

// Define deletion behavior
impl Drop for X6Board {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("{}", e);
        }
        if let Err(e) = wa_call("WaterlooApp_Cleanup", || unsafe { WaterlooApp_Cleanup() }) {
            log::warn!("FPGA driver did not clean up properly. This is a bad sign. {}", e);
        }
    }
}

/// Number of boards the driver sees.
pub fn probe_boards() -> Result<usize> {
    let board = X6Board::new(0)?;
    Ok(board.n_boards())
}
