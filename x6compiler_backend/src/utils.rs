// Small helpers shared by the pattern, configuration and stream modules
use std::env;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::*;

// Utility class for time-tracking
pub struct TickTimer {
    pub milis: f64,
}

impl TickTimer {
    pub fn new() -> Self {
        Self { milis: now_milis() }
    }

    pub fn tick(&mut self) -> f64 {
        let milis = now_milis();
        let diff = milis - self.milis;
        self.milis = milis;
        diff
    }

    /// Same as [`TickTimer::tick`], logging the elapsed milliseconds at debug level.
    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn now_milis() -> f64 {
    // Clocks before the epoch read as zero
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as f64 * 1e3 + duration.subsec_nanos() as f64 / 1e6
}

/// Parses an integer literal the way the board's ini files write them: decimal, or with a
/// `0x`/`0o`/`0b` radix prefix, optionally signed and with `_` separators.
///
/// # Examples
/// ```
/// use x6compiler_backend::parse_int;
/// assert_eq!(parse_int("512").unwrap(), 512);
/// assert_eq!(parse_int("0x200").unwrap(), 512);
/// assert_eq!(parse_int(" -0b11 ").unwrap(), -3);
/// assert!(parse_int("abc").is_err());
/// ```
pub fn parse_int(text: &str) -> Result<i64> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let lower = body.to_ascii_lowercase();
    let (radix, digits) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else {
        (10, lower.as_str())
    };
    let digits: String = digits.chars().filter(|&c| c != '_').collect();
    if digits.is_empty() || digits.starts_with('+') || digits.starts_with('-') {
        return Err(Error::parse("integer", text));
    }
    let magnitude =
        i64::from_str_radix(&digits, radix).map_err(|_| Error::parse("integer", text))?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Parses a boolean option value (`True`/`False`, `1`/`0`, `yes`/`no`, `on`/`off`).
pub fn parse_bool(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::parse("boolean", text)),
    }
}

/// Parses a comma-separated list of booleans such as `True, False, True, False`.
pub fn parse_bool_list(text: &str) -> Result<Vec<bool>> {
    text.split(',').map(parse_bool).collect()
}

/// Locates `pathname` relative to `starting_point`.
///
/// Absolute paths (or a missing starting point) are returned unchanged. Otherwise the path is
/// first tried relative to `starting_point` (the directory itself, or the directory holding the
/// file), then relative to the current directory.
///
/// # Arguments
/// * `pathname` - file or folder to locate, absolute or relative.
/// * `starting_point` - file or folder where relative lookups start. Must exist.
pub fn search_for_file(pathname: &Path, starting_point: Option<&Path>) -> Result<PathBuf> {
    let starting_point = match starting_point {
        Some(start) if !pathname.is_absolute() => start,
        _ => return Ok(pathname.to_path_buf()),
    };
    if !starting_point.exists() {
        return Err(Error::InvalidArgument(format!(
            "the starting point `{}` does not exist",
            starting_point.display()
        )));
    }
    let starting_dir = if starting_point.is_dir() {
        starting_point.to_path_buf()
    } else {
        starting_point
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    };

    let would_be = starting_dir.join(pathname);
    if would_be.exists() {
        return Ok(would_be);
    }
    let from_cwd = env::current_dir()?.join(pathname);
    if from_cwd.exists() {
        Ok(from_cwd)
    } else {
        Err(Error::InvalidArgument(format!(
            "the file or folder `{}` was not found, even relative to `{}`",
            pathname.display(),
            starting_dir.display()
        )))
    }
}
