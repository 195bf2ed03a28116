//! Kernel command line
//!
//! Parsed once during boot into a typed configuration. Unrecognised
//! options are reported and ignored; malformed values fall back to the
//! defaults so a typo cannot keep the machine from booting.

use crate::mm::paging::PaePolicy;

/// What the panic path does after printing the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicAction {
    #[default]
    Halt,
    Reboot,
}

/// Parsed kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub pae: PaePolicy,
    pub log_level: log::LevelFilter,
    pub on_panic: PanicAction,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pae: PaePolicy::Auto,
            log_level: log::LevelFilter::Info,
            on_panic: PanicAction::Halt,
        }
    }
}

/// Parse a kernel command line.
pub fn parse(cmdline: &str) -> Config {
    let mut config = Config::default();

    for token in cmdline.split_ascii_whitespace() {
        let (name, value) = match token.split_once('=') {
            Some(pair) => pair,
            None => (token, ""),
        };

        match name {
            "pae" => match value {
                "auto" => config.pae = PaePolicy::Auto,
                "disable" => config.pae = PaePolicy::Disable,
                "require" => config.pae = PaePolicy::Require,
                _ => log::warn!("cmdline: bad value '{}' for pae", value),
            },
            "log_level" => match value {
                "debug" => config.log_level = log::LevelFilter::Debug,
                "info" => config.log_level = log::LevelFilter::Info,
                "warn" => config.log_level = log::LevelFilter::Warn,
                "error" => config.log_level = log::LevelFilter::Error,
                _ => log::warn!("cmdline: bad value '{}' for log_level", value),
            },
            "on_panic" => match value {
                "halt" => config.on_panic = PanicAction::Halt,
                "reboot" => config.on_panic = PanicAction::Reboot,
                _ => log::warn!("cmdline: bad value '{}' for on_panic", value),
            },
            _ => log::warn!("cmdline: unknown option '{}'", name),
        }
    }

    config
}
