//! Ini-style configuration files and the typed board settings loaded from them.
//!
//! ## Configuration files
//! Board presets live in `*.pulse` files such as `standard_configurations.pulse`. Each section
//! (for example `[Single Pulse]`) is a named preset whose options override those of the
//! `[DEFAULT]` section. [`ConfigFile`] is a small parser for this dialect:
//! - `key=value` or `key: value` options, option names are case-insensitive,
//! - `#` and `;` comment lines, inline `;` comments after whitespace,
//! - indented continuation lines appended to the previous value,
//! - sections and options kept in file order.
//!
//! The same parser reads PRI pattern files, see [`crate::pattern`].
//!
//! ## Board settings
//! [`BoardSettings`] groups the register values the board driver loads before streaming. It is
//! split the same way as the driver's own setting blocks: common clock settings, receive and
//! transmit trigger settings, receive and transmit PRI settings, and miscellaneous streaming
//! settings. [`BoardSettings::load`] reads one preset; options a section does not name keep their
//! current value. File-valued options are resolved relative to the configuration file.

use indexmap::IndexMap;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use crate::channel::*;
use crate::error::*;
use crate::utils::*;

pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Parsed ini-style file.
#[derive(Clone, Debug, Default)]
pub struct ConfigFile {
    path: Option<PathBuf>,
    defaults: IndexMap<String, String>,
    sections: IndexMap<String, IndexMap<String, String>>,
}

fn ini_regexes() -> Result<(Regex, Regex)> {
    let compile = |pattern: &str| {
        Regex::new(pattern).map_err(|e| Error::InvalidArgument(format!("bad ini pattern: {}", e)))
    };
    Ok((
        compile(r"^\[(?P<header>[^\]]+)\]")?,
        compile(r"^(?P<key>[^:=\s][^:=]*?)\s*[:=]\s*(?P<value>.*)$")?,
    ))
}

impl ConfigFile {
    /// Reads and parses `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut conf = Self::parse_str(&text)?;
        conf.path = Some(path.to_path_buf());
        Ok(conf)
    }

    pub fn parse_str(text: &str) -> Result<Self> {
        let (section_re, option_re) = ini_regexes()?;
        let mut conf = ConfigFile::default();
        let mut section: Option<String> = None;
        let mut last_key: Option<String> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            let trimmed = line.trim();
            if trimmed.is_empty() {
                last_key = None;
                continue;
            }
            if trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            // Continuation of the previous value
            if line.starts_with(|c: char| c.is_whitespace()) {
                if let (Some(sec), Some(key)) = (&section, &last_key) {
                    if let Some(value) = conf.options_mut(sec).get_mut(key) {
                        value.push('\n');
                        value.push_str(trimmed);
                        continue;
                    }
                }
            }
            if let Some(caps) = section_re.captures(trimmed) {
                let header = caps["header"].trim().to_string();
                if header != DEFAULT_SECTION {
                    conf.sections.entry(header.clone()).or_default();
                }
                section = Some(header);
                last_key = None;
                continue;
            }
            let sec = match &section {
                Some(sec) => sec.clone(),
                None => return Err(Error::parse("section header", line)),
            };
            match option_re.captures(trimmed) {
                Some(caps) => {
                    let key = caps["key"].trim().to_lowercase();
                    let value = strip_inline_comment(&caps["value"]).to_string();
                    conf.options_mut(&sec).insert(key.clone(), value);
                    last_key = Some(key);
                }
                None => return Err(Error::parse("ini option", line)),
            }
        }
        Ok(conf)
    }

    fn options_mut(&mut self, section: &str) -> &mut IndexMap<String, String> {
        if section == DEFAULT_SECTION {
            &mut self.defaults
        } else {
            self.sections.entry(section.to_string()).or_default()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn source(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<string>".to_string())
    }

    /// Named sections, in file order. `[DEFAULT]` is not included.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn add_section(&mut self, section: &str) {
        self.options_mut(section);
    }

    pub fn has_option(&self, section: &str, key: &str) -> bool {
        let key = key.to_lowercase();
        if section == DEFAULT_SECTION {
            return self.defaults.contains_key(&key);
        }
        match self.sections.get(section) {
            Some(options) => options.contains_key(&key) || self.defaults.contains_key(&key),
            None => false,
        }
    }

    /// Option names visible in `section`, its own first, then inherited defaults.
    pub fn options(&self, section: &str) -> Result<Vec<String>> {
        let own = self.section_options(section)?;
        let mut keys: Vec<String> = own.keys().cloned().collect();
        keys.extend(
            self.defaults
                .keys()
                .filter(|k| !own.contains_key(*k))
                .cloned(),
        );
        Ok(keys)
    }

    fn section_options(&self, section: &str) -> Result<&IndexMap<String, String>> {
        if section == DEFAULT_SECTION {
            return Ok(&self.defaults);
        }
        self.sections
            .get(section)
            .ok_or_else(|| Error::MissingSection {
                file: self.source(),
                section: section.to_string(),
            })
    }

    /// Raw value of `key` in `section`, falling back on `[DEFAULT]`.
    pub fn get(&self, section: &str, key: &str) -> Result<&str> {
        let key = key.to_lowercase();
        self.section_options(section)?
            .get(&key)
            .or_else(|| self.defaults.get(&key))
            .map(String::as_str)
            .ok_or_else(|| Error::MissingKey {
                section: section.to_string(),
                key,
            })
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.options_mut(section)
            .insert(key.to_lowercase(), value.into());
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Result<bool> {
        parse_bool(self.get(section, key)?)
    }

    pub fn get_f64(&self, section: &str, key: &str) -> Result<f64> {
        let value = self.get(section, key)?;
        value
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::parse("float", value))
    }

    /// Integer option, converted into the width of the target register.
    pub fn get_int<T: TryFrom<i64>>(&self, section: &str, key: &str) -> Result<T> {
        let value = self.get(section, key)?;
        T::try_from(parse_int(value)?).map_err(|_| Error::parse("register value", value))
    }

    pub fn get_bool_list(&self, section: &str, key: &str) -> Result<Vec<bool>> {
        parse_bool_list(self.get(section, key)?)
    }

    /// File-valued option, resolved relative to this configuration file.
    pub fn get_path(&self, section: &str, key: &str) -> Result<PathBuf> {
        let value = self.get(section, key)?;
        search_for_file(Path::new(value.trim()), self.path())
    }

    /// Serializes back into ini text, `[DEFAULT]` first.
    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        let mut write_section = |name: &str, options: &IndexMap<String, String>| {
            out.push_str(&format!("[{}]\n", name));
            for (key, value) in options {
                out.push_str(&format!("{} = {}\n", key, value.replace('\n', "\n\t")));
            }
            out.push('\n');
        };
        if !self.defaults.is_empty() {
            write_section(DEFAULT_SECTION, &self.defaults);
        }
        for (name, options) in &self.sections {
            write_section(name, options);
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_ini_string())?;
        Ok(())
    }
}

fn strip_inline_comment(value: &str) -> &str {
    let cut = value
        .char_indices()
        .find(|&(i, c)| {
            c == ';' && i > 0 && value[..i].ends_with(|p: char| p.is_whitespace())
        })
        .map_or(value.len(), |(i, _)| i);
    value[..cut].trim()
}

/// Rewrites an ini file in place so that no spaces surround `=`.
///
/// The board's pattern loader silently ignores options written as `key = value`.
pub fn strip_spaces_from_ini(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)?;
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let line = line.trim();
        match line.split_once('=') {
            Some((key, value)) if !line.starts_with('#') => {
                out.push_str(key.trim());
                out.push('=');
                out.push_str(value.trim());
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommonSettings {
    pub ext_clock_src_selection: i32,
    pub reference_clock_source: i32,
    /// MHz
    pub reference_rate: f64,
    pub sample_clock_source: i32,
    /// MHz (samples/us)
    pub sample_rate: f64,
    pub ext_trigger_src_selection: i32,
    pub auto_preconfig: bool,
    pub debug_verbosity: i32,
    pub alert_enable: Vec<bool>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerSettings {
    pub external_trigger: bool,
    pub edge_trigger: bool,
    pub framed: bool,
    /// Samples, must be divisible by 8
    pub frame_size: i32,
    pub trigger_delay_period: i32,
    pub decimation_enable: bool,
    pub decimation_factor: i32,
    pub active_channels: Vec<bool>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PriSettings {
    pub enable: bool,
    pub finite: bool,
    pub rearm: bool,
    /// Period of the whole pattern, in samples
    pub period: u64,
    /// Number of pattern repetitions per trigger when `finite`
    pub count: u32,
    pub pattern_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RxMiscSettings {
    pub packet_size: i32,
    pub force_size: bool,
    pub test_counter_enable: bool,
    pub test_gen_mode: i32,
    /// Log received samples to the capture file
    pub logger_enable: bool,
    pub plot_enable: bool,
    pub merge_parse_enable: bool,
    pub samples_to_log: u32,
    pub overwrite_bdd: bool,
    pub auto_stop: bool,
    pub merge_packet_size: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxMiscSettings {
    pub test_gen_enable: bool,
    pub test_gen_mode: i32,
    pub test_frequency_mhz: f64,
    pub packet_size: i32,
    pub play_from_file_enable: bool,
    pub play_from_file_filename: Option<PathBuf>,
}

/// Register values of one board preset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoardSettings {
    pub common: CommonSettings,
    pub rx_trigger: TriggerSettings,
    pub tx_trigger: TriggerSettings,
    pub rx_pri: PriSettings,
    pub tx_pri: PriSettings,
    pub rx_misc: RxMiscSettings,
    pub tx_misc: TxMiscSettings,
}

// Assigns each listed option that the section defines, using the given typed getter
macro_rules! load_options {
    ($conf:expr, $section:expr; $( $key:literal => $field:expr, $getter:ident; )*) => {
        $(
            if $conf.has_option($section, $key) {
                $field = $conf.$getter($section, $key)?;
            }
        )*
    };
}

fn fixed_len(mut flags: Vec<bool>, len: usize, key: &str) -> Result<Vec<bool>> {
    if flags.len() > len {
        return Err(Error::InvalidArgument(format!(
            "{} holds {} entries, at most {} are supported",
            key,
            flags.len(),
            len
        )));
    }
    flags.resize(len, false);
    Ok(flags)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn bool_list_str(values: &[bool]) -> String {
    values
        .iter()
        .map(|&v| bool_str(v))
        .collect::<Vec<_>>()
        .join(", ")
}

impl BoardSettings {
    /// Loads the preset `section` of `conf_file` on top of default (zeroed) settings.
    pub fn load(conf_file: &Path, section: &str) -> Result<Self> {
        let mut settings = Self::default();
        settings.apply(&ConfigFile::read(conf_file)?, section)?;
        Ok(settings)
    }

    /// Overwrites every setting the preset `section` (or `[DEFAULT]`) defines.
    pub fn apply(&mut self, conf: &ConfigFile, section: &str) -> Result<()> {
        if section != DEFAULT_SECTION && !conf.has_section(section) {
            return Err(Error::MissingSection {
                file: conf.source(),
                section: section.to_string(),
            });
        }
        load_options!(conf, section;
            "ext_clock_src_selection" => self.common.ext_clock_src_selection, get_int;
            "reference_clock_source" => self.common.reference_clock_source, get_int;
            "reference_rate" => self.common.reference_rate, get_f64;
            "sample_clock_source" => self.common.sample_clock_source, get_int;
            "sample_rate" => self.common.sample_rate, get_f64;
            "ext_trigger_src_selection" => self.common.ext_trigger_src_selection, get_int;
            "auto_preconfig" => self.common.auto_preconfig, get_bool;
            "debug_verbosity" => self.common.debug_verbosity, get_int;
            "alert_enable" => self.common.alert_enable, get_bool_list;

            "rx_external_trigger" => self.rx_trigger.external_trigger, get_bool;
            "rx_edge_trigger" => self.rx_trigger.edge_trigger, get_bool;
            "rx_framed" => self.rx_trigger.framed, get_bool;
            "rx_frame_size" => self.rx_trigger.frame_size, get_int;
            "rx_trigger_delay_period" => self.rx_trigger.trigger_delay_period, get_int;
            "rx_decimation_enable" => self.rx_trigger.decimation_enable, get_bool;
            "rx_decimation_factor" => self.rx_trigger.decimation_factor, get_int;
            "rx_active_channels" => self.rx_trigger.active_channels, get_bool_list;

            "tx_external_trigger" => self.tx_trigger.external_trigger, get_bool;
            "tx_edge_trigger" => self.tx_trigger.edge_trigger, get_bool;
            "tx_framed" => self.tx_trigger.framed, get_bool;
            "tx_frame_size" => self.tx_trigger.frame_size, get_int;
            "tx_trigger_delay_period" => self.tx_trigger.trigger_delay_period, get_int;
            "tx_decimation_enable" => self.tx_trigger.decimation_enable, get_bool;
            "tx_decimation_factor" => self.tx_trigger.decimation_factor, get_int;
            "tx_active_channels" => self.tx_trigger.active_channels, get_bool_list;

            "rx_enable_pri" => self.rx_pri.enable, get_bool;
            "rx_finite" => self.rx_pri.finite, get_bool;
            "rx_rearm" => self.rx_pri.rearm, get_bool;
            "rx_period" => self.rx_pri.period, get_int;
            "rx_count" => self.rx_pri.count, get_int;

            "tx_enable_pri" => self.tx_pri.enable, get_bool;
            "tx_finite" => self.tx_pri.finite, get_bool;
            "tx_rearm" => self.tx_pri.rearm, get_bool;
            "tx_period" => self.tx_pri.period, get_int;
            "tx_count" => self.tx_pri.count, get_int;

            "rx_packet_size" => self.rx_misc.packet_size, get_int;
            "rx_force_size" => self.rx_misc.force_size, get_bool;
            "rx_test_counter_enable" => self.rx_misc.test_counter_enable, get_bool;
            "rx_test_gen_mode" => self.rx_misc.test_gen_mode, get_int;
            "rx_logger_enable" => self.rx_misc.logger_enable, get_bool;
            "rx_plot_enable" => self.rx_misc.plot_enable, get_bool;
            "rx_merge_parse_enable" => self.rx_misc.merge_parse_enable, get_bool;
            "rx_samples_to_log" => self.rx_misc.samples_to_log, get_int;
            "rx_overwrite_bdd" => self.rx_misc.overwrite_bdd, get_bool;
            "rx_auto_stop" => self.rx_misc.auto_stop, get_bool;
            "rx_merge_packet_size" => self.rx_misc.merge_packet_size, get_int;

            "tx_test_gen_enable" => self.tx_misc.test_gen_enable, get_bool;
            "tx_test_gen_mode" => self.tx_misc.test_gen_mode, get_int;
            "tx_test_frequency_mhz" => self.tx_misc.test_frequency_mhz, get_f64;
            "tx_packet_size" => self.tx_misc.packet_size, get_int;
            "tx_play_from_file_enable" => self.tx_misc.play_from_file_enable, get_bool;
        );

        // File options: paths are resolved relative to the configuration file
        if conf.has_option(section, "rx_pattern_file") {
            self.rx_pri.pattern_file = Some(conf.get_path(section, "rx_pattern_file")?);
        }
        if conf.has_option(section, "tx_pattern_file") {
            self.tx_pri.pattern_file = Some(conf.get_path(section, "tx_pattern_file")?);
        }
        if conf.has_option(section, "tx_play_from_file_filename") {
            self.tx_misc.play_from_file_filename =
                Some(conf.get_path(section, "tx_play_from_file_filename")?);
        }

        self.common.alert_enable =
            fixed_len(std::mem::take(&mut self.common.alert_enable), 7, "alert_enable")?;
        self.rx_trigger.active_channels = fixed_len(
            std::mem::take(&mut self.rx_trigger.active_channels),
            4,
            "rx_active_channels",
        )?;
        self.tx_trigger.active_channels = fixed_len(
            std::mem::take(&mut self.tx_trigger.active_channels),
            4,
            "tx_active_channels",
        )?;
        Ok(())
    }

    /// Writes these settings as preset `section` of `conf_file`, keeping its other sections.
    pub fn save(&self, conf_file: &Path, section: &str) -> Result<()> {
        let mut conf = if conf_file.exists() {
            ConfigFile::read(conf_file)?
        } else {
            ConfigFile::default()
        };
        conf.add_section(section);
        let c = &self.common;
        let scalars: Vec<(&str, String)> = vec![
            ("ext_clock_src_selection", c.ext_clock_src_selection.to_string()),
            ("reference_clock_source", c.reference_clock_source.to_string()),
            ("reference_rate", c.reference_rate.to_string()),
            ("sample_clock_source", c.sample_clock_source.to_string()),
            ("sample_rate", c.sample_rate.to_string()),
            ("ext_trigger_src_selection", c.ext_trigger_src_selection.to_string()),
            ("auto_preconfig", bool_str(c.auto_preconfig).to_string()),
            ("debug_verbosity", c.debug_verbosity.to_string()),
            ("alert_enable", bool_list_str(&c.alert_enable)),
        ];
        for (key, value) in scalars {
            conf.set(section, key, value);
        }
        for (prefix, trig) in [("rx", &self.rx_trigger), ("tx", &self.tx_trigger)] {
            conf.set(section, &format!("{}_external_trigger", prefix), bool_str(trig.external_trigger));
            conf.set(section, &format!("{}_edge_trigger", prefix), bool_str(trig.edge_trigger));
            conf.set(section, &format!("{}_framed", prefix), bool_str(trig.framed));
            conf.set(section, &format!("{}_frame_size", prefix), trig.frame_size.to_string());
            conf.set(
                section,
                &format!("{}_trigger_delay_period", prefix),
                trig.trigger_delay_period.to_string(),
            );
            conf.set(section, &format!("{}_decimation_enable", prefix), bool_str(trig.decimation_enable));
            conf.set(section, &format!("{}_decimation_factor", prefix), trig.decimation_factor.to_string());
            conf.set(section, &format!("{}_active_channels", prefix), bool_list_str(&trig.active_channels));
        }
        for (prefix, pri) in [("rx", &self.rx_pri), ("tx", &self.tx_pri)] {
            conf.set(section, &format!("{}_enable_pri", prefix), bool_str(pri.enable));
            conf.set(section, &format!("{}_finite", prefix), bool_str(pri.finite));
            conf.set(section, &format!("{}_rearm", prefix), bool_str(pri.rearm));
            conf.set(section, &format!("{}_period", prefix), pri.period.to_string());
            conf.set(section, &format!("{}_count", prefix), pri.count.to_string());
            if let Some(file) = &pri.pattern_file {
                conf.set(section, &format!("{}_pattern_file", prefix), file.display().to_string());
            }
        }
        let rx = &self.rx_misc;
        conf.set(section, "rx_packet_size", rx.packet_size.to_string());
        conf.set(section, "rx_force_size", bool_str(rx.force_size));
        conf.set(section, "rx_test_counter_enable", bool_str(rx.test_counter_enable));
        conf.set(section, "rx_test_gen_mode", rx.test_gen_mode.to_string());
        conf.set(section, "rx_logger_enable", bool_str(rx.logger_enable));
        conf.set(section, "rx_plot_enable", bool_str(rx.plot_enable));
        conf.set(section, "rx_merge_parse_enable", bool_str(rx.merge_parse_enable));
        conf.set(section, "rx_samples_to_log", rx.samples_to_log.to_string());
        conf.set(section, "rx_overwrite_bdd", bool_str(rx.overwrite_bdd));
        conf.set(section, "rx_auto_stop", bool_str(rx.auto_stop));
        conf.set(section, "rx_merge_packet_size", rx.merge_packet_size.to_string());
        let tx = &self.tx_misc;
        conf.set(section, "tx_test_gen_enable", bool_str(tx.test_gen_enable));
        conf.set(section, "tx_test_gen_mode", tx.test_gen_mode.to_string());
        conf.set(section, "tx_test_frequency_mhz", tx.test_frequency_mhz.to_string());
        conf.set(section, "tx_packet_size", tx.packet_size.to_string());
        conf.set(section, "tx_play_from_file_enable", bool_str(tx.play_from_file_enable));
        if let Some(file) = &tx.play_from_file_filename {
            conf.set(section, "tx_play_from_file_filename", file.display().to_string());
        }
        conf.write(conf_file)
    }

    /// Transmit active channels as the fixed four-entry list of the analog outputs.
    pub fn tx_active_channels(&self) -> [bool; 4] {
        let mut active = [false; 4];
        for (slot, &flag) in active.iter_mut().zip(&self.tx_trigger.active_channels) {
            *slot = flag;
        }
        active
    }

    /// Checks the settings before they are sent to the board.
    ///
    /// Referenced pattern and playback files must exist. Sample rates above what the DACs
    /// support in the selected channel mode are reported as warnings.
    pub fn validate(&self) -> Result<()> {
        let must_exist = |enabled: bool, file: &Option<PathBuf>, what: &str| -> Result<()> {
            if !enabled {
                return Ok(());
            }
            match file {
                Some(path) if path.is_file() => Ok(()),
                Some(path) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} `{}` does not exist", what, path.display()),
                ))),
                None => Err(Error::InvalidArgument(format!("{} is enabled but not set", what))),
            }
        };
        must_exist(
            self.tx_misc.play_from_file_enable,
            &self.tx_misc.play_from_file_filename,
            "tx_play_from_file_filename",
        )?;
        must_exist(self.tx_pri.enable, &self.tx_pri.pattern_file, "tx_pattern_file")?;
        must_exist(self.rx_pri.enable, &self.rx_pri.pattern_file, "rx_pattern_file")?;

        let active = validate_active_channels(&self.tx_active_channels())?;
        if is_interleaved(&active) {
            if self.common.sample_rate > HALF_SAMPLE_RATE {
                log::warn!("X6-1000M cannot exceed 500MS/s when in interlaced mode. Consider disabling a tx_active_channel or reducing sample_rate.");
            }
        } else if self.common.sample_rate > FULL_SAMPLE_RATE {
            log::warn!("X6-1000M cannot exceed 1GS/s. Consider reducing sample_rate.");
        }
        Ok(())
    }
}
