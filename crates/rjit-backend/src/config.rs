//! Backend configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! | variable | meaning |
//! |---|---|
//! | `RJIT_OPT_LEVEL` | `none`, `speed` or `speed_and_size` |
//! | `RJIT_VERIFY_TRACES` | run the trace consistency check before compiling |
//! | `RJIT_NURSERY_SIZE` | bytes per nursery window |
//! | `RJIT_LARGE_OBJECT` | arrays of at least this many bytes skip the nursery |
//! | `RJIT_CARD_PAGE_SHIFT` | log2 of array items per card |

use std::sync::OnceLock;

use rjit_runtime::NurseryConfig;

/// Cranelift optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// No optimization
    None,
    /// Optimize for speed
    #[default]
    Speed,
    /// Optimize for speed and code size
    SpeedAndSize,
}

impl OptLevel {
    /// Value of Cranelift's `opt_level` setting
    pub fn as_setting(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Speed => "speed",
            Self::SpeedAndSize => "speed_and_size",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Some(Self::None),
            "speed" | "1" => Some(Self::Speed),
            "speed_and_size" | "2" => Some(Self::SpeedAndSize),
            _ => None,
        }
    }
}

/// Tunables of a [`CraneliftCpu`](crate::CraneliftCpu)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Cranelift optimization level
    pub opt_level: OptLevel,
    /// Run `Trace::check_consistency` and the Cranelift verifier on every compilation
    pub verify_traces: bool,
    /// Bytes per nursery window
    pub nursery_size: usize,
    /// Arrays of at least this many bytes are allocated out of the nursery
    pub large_object_threshold: usize,
    /// `index >> card_page_shift` selects an array card
    pub card_page_shift: u8,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            verify_traces: cfg!(debug_assertions),
            nursery_size: 1 << 20,
            large_object_threshold: 64 << 10,
            card_page_shift: 7,
        }
    }
}

static ENV_CONFIG: OnceLock<BackendConfig> = OnceLock::new();

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

fn parse_env_u32(var_name: &str) -> Option<u32> {
    let value = std::env::var(var_name).ok()?;
    match value.trim().parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = var_name, value = %value, "ignoring unparsable setting");
            None
        }
    }
}

impl BackendConfig {
    /// Defaults overridden by `RJIT_*` variables; read once per process
    pub fn from_env() -> Self {
        ENV_CONFIG
            .get_or_init(|| {
                let mut config = Self::default();
                if let Ok(value) = std::env::var("RJIT_OPT_LEVEL") {
                    match OptLevel::parse(&value) {
                        Some(level) => config.opt_level = level,
                        None => {
                            tracing::warn!(value = %value, "ignoring unknown RJIT_OPT_LEVEL")
                        }
                    }
                }
                if let Ok(value) = std::env::var("RJIT_VERIFY_TRACES") {
                    config.verify_traces = parse_env_truthy(&value);
                }
                if let Some(size) = parse_env_u32("RJIT_NURSERY_SIZE") {
                    config.nursery_size = (size as usize).max(4096);
                }
                if let Some(size) = parse_env_u32("RJIT_LARGE_OBJECT") {
                    config.large_object_threshold = size as usize;
                }
                if let Some(shift) = parse_env_u32("RJIT_CARD_PAGE_SHIFT") {
                    config.card_page_shift = shift.min(16) as u8;
                }
                config
            })
            .clone()
    }

    /// Set the optimization level
    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    /// Turn trace verification on or off
    pub fn with_verify_traces(mut self, verify: bool) -> Self {
        self.verify_traces = verify;
        self
    }

    /// Set the nursery window size
    pub fn with_nursery_size(mut self, bytes: usize) -> Self {
        self.nursery_size = bytes;
        self
    }

    /// Set the large-array threshold
    pub fn with_large_object_threshold(mut self, bytes: usize) -> Self {
        self.large_object_threshold = bytes;
        self
    }

    /// Set the card size
    pub fn with_card_page_shift(mut self, shift: u8) -> Self {
        self.card_page_shift = shift;
        self
    }

    /// Sizing for the built-in nursery collector
    pub fn nursery_config(&self) -> NurseryConfig {
        NurseryConfig {
            nursery_size: self.nursery_size,
            large_object_threshold: self.large_object_threshold,
            card_page_shift: self.card_page_shift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(parse_env_truthy("1"));
        assert!(parse_env_truthy("yes"));
        assert!(!parse_env_truthy("0"));
        assert!(!parse_env_truthy(" Off "));
        assert!(!parse_env_truthy(""));
    }

    #[test]
    fn opt_level_names() {
        assert_eq!(OptLevel::parse("speed_and_size"), Some(OptLevel::SpeedAndSize));
        assert_eq!(OptLevel::parse("NONE"), Some(OptLevel::None));
        assert_eq!(OptLevel::parse("fast"), None);
        assert_eq!(OptLevel::Speed.as_setting(), "speed");
    }

    #[test]
    fn setters_chain() {
        let config = BackendConfig::default()
            .with_nursery_size(4096)
            .with_card_page_shift(3)
            .with_large_object_threshold(1024)
            .with_opt_level(OptLevel::None)
            .with_verify_traces(true);
        let nursery = config.nursery_config();
        assert_eq!(nursery.nursery_size, 4096);
        assert_eq!(nursery.card_page_shift, 3);
        assert_eq!(nursery.large_object_threshold, 1024);
        assert_eq!(config.opt_level.as_setting(), "none");
        assert!(config.verify_traces);
    }
}
