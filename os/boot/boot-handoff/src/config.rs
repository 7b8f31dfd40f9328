//! Loader options that shape the handoff.
//!
//! Options are whitespace-separated `key=value` pairs, matching the loader's
//! configuration file syntax:
//!
//! | Key        | Value                 |
//! |------------|-----------------------|
//! | `norts`    | `0` or `1`            |
//! | `noquirks` | `0` or `1`            |
//! | `rtsbase`  | window base address   |
//! | `rtssize`  | window size in bytes  |
//! | `rtstest`  | `0` or `1`            |
//!
//! Numbers are decimal or `0x`-prefixed hex. Unknown keys belong to other
//! parts of the loader and are ignored.

use crate::error::ConfigError;
use boot_addresses::VirtualAddress;
use boot_rts::{Capabilities, RtsConfig, RtsWindow};
use log::trace;

/// Window size used when only `rtsbase` is given: one top-level entry.
pub const DEFAULT_RTS_SIZE: u64 = 512 << 30;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HandoffConfig {
    pub rts_window: Option<RtsWindow>,
    pub no_rts: bool,
    pub no_quirks: bool,
    pub capabilities: Capabilities,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            rts_window: None,
            no_rts: false,
            no_quirks: false,
            capabilities: Capabilities::ALL_POLICIES,
        }
    }
}

impl HandoffConfig {
    #[must_use]
    pub const fn rts(&self) -> RtsConfig {
        RtsConfig {
            window: self.rts_window,
            no_rts: self.no_rts,
            no_quirks: self.no_quirks,
            capabilities: self.capabilities,
        }
    }

    /// Whether the kernel asked for a runtime-services window at all.
    #[must_use]
    pub const fn rts_requested(&self) -> bool {
        match self.rts_window {
            Some(window) => !window.is_empty(),
            None => false,
        }
    }

    /// Apply an option string on top of the current values.
    ///
    /// ```rust
    /// # use boot_handoff::HandoffConfig;
    /// let mut config = HandoffConfig::default();
    /// config.apply_options("title=test noquirks=1 rtsbase=0xffffff0000000000").unwrap();
    /// assert!(config.no_quirks);
    /// assert_eq!(config.rts_window.unwrap().size(), 512 << 30);
    /// ```
    ///
    /// # Errors
    /// [`ConfigError::InvalidValue`] for a known key with a malformed value.
    pub fn apply_options(&mut self, options: &str) -> Result<(), ConfigError> {
        let mut base = self.rts_window.map(|w| w.base());
        let mut size = self.rts_window.map(|w| w.size());

        for (key, value) in options.split_whitespace().filter_map(|o| o.split_once('=')) {
            match key {
                "norts" => self.no_rts = parse_flag("norts", value)?,
                "noquirks" => self.no_quirks = parse_flag("noquirks", value)?,
                "rtstest" => self
                    .capabilities
                    .set(Capabilities::RTS_DO_TEST, parse_flag("rtstest", value)?),
                "rtsbase" => base = Some(VirtualAddress::new(parse_number("rtsbase", value)?)),
                "rtssize" => size = Some(parse_number("rtssize", value)?),
                _ => trace!("ignoring option {key}"),
            }
        }

        self.rts_window =
            base.map(|base| RtsWindow::new(base, size.unwrap_or(DEFAULT_RTS_SIZE)));
        Ok(())
    }
}

fn parse_number(option: &'static str, value: &str) -> Result<u64, ConfigError> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidValue { option })
}

fn parse_flag(option: &'static str, value: &str) -> Result<bool, ConfigError> {
    match parse_number(option, value)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ConfigError::InvalidValue { option }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_request_nothing() {
        let config = HandoffConfig::default();
        assert!(!config.rts_requested());
        assert!(!config.capabilities.contains(Capabilities::RTS_DO_TEST));
        assert_eq!(config.rts().capabilities, Capabilities::ALL_POLICIES);
    }

    #[test]
    fn full_option_string() {
        let mut config = HandoffConfig::default();
        config
            .apply_options("kernel=/k norts=0 noquirks=1 rtstest=1 rtsbase=0xffffff0000000000 rtssize=68719476736")
            .unwrap();
        assert!(!config.no_rts);
        assert!(config.no_quirks);
        assert!(config.capabilities.contains(Capabilities::RTS_DO_TEST));
        let window = config.rts_window.unwrap();
        assert_eq!(window.base(), VirtualAddress::new(0xffff_ff00_0000_0000));
        assert_eq!(window.size(), 64 << 30);
        assert!(config.rts_requested());
    }

    #[test]
    fn later_options_override_earlier_ones() {
        let mut config = HandoffConfig::default();
        config.apply_options("rtsbase=0x8000000000 rtssize=0x1000").unwrap();
        config.apply_options("rtssize=0x2000 norts=1").unwrap();
        assert_eq!(config.rts_window.unwrap().size(), 0x2000);
        assert!(config.no_rts);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut config = HandoffConfig::default();
        assert_eq!(
            config.apply_options("norts=2"),
            Err(ConfigError::InvalidValue { option: "norts" })
        );
        assert_eq!(
            config.apply_options("rtsbase=0xzz"),
            Err(ConfigError::InvalidValue { option: "rtsbase" })
        );
        // Bare words are not options.
        assert_eq!(config.apply_options("verbose"), Ok(()));
    }
}
