//! Recognized configuration options (spec.md §6 "Configuration") and their
//! validation (spec.md §7 kind 1 "Configuration" errors: surfaced from
//! construction, never during the RT loop).
//!
//! `[AMBIENT]` per SPEC_FULL.md: `EngineConfig::validate` is the single
//! place these get type-checked and range-checked, mirroring the teacher's
//! `Aes67OutputConfig`/`processor::config` pattern of a plain struct plus a
//! `Default` impl, but with an explicit fallible constructor instead of
//! silently clamping out-of-range values.

use crate::codec::rate_params;
use crate::error::ConfigError;

/// Raw, unvalidated configuration exactly as spec.md §6's table names it.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub period_size: u32,
    pub nb_periods: u32,
    pub frame_slack: u32,
    pub iso_slack: u32,
    pub port: u32,
    /// `-1` = auto.
    pub node_id: i32,
    /// `-1` = negotiate via a separate control path (out of scope, spec.md §1).
    pub channel: i32,
    pub realtime: bool,
    pub packetizer_priority: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            period_size: 512,
            nb_periods: 2,
            frame_slack: 0,
            iso_slack: 0,
            port: 0,
            node_id: -1,
            channel: -1,
            realtime: false,
            packetizer_priority: 0,
        }
    }
}

impl EngineConfig {
    /// Range/type-checks the recognized options (spec.md §6). Returns the
    /// syt_interval derived from `sample_rate` alongside the validated
    /// config since most callers need both immediately.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let (syt_interval, _fdf) = rate_params(self.sample_rate)?;
        if self.period_size < syt_interval as u32 {
            return Err(ConfigError::PeriodTooSmall { period: self.period_size, syt_interval: syt_interval as u32 });
        }
        if self.nb_periods < 2 {
            return Err(ConfigError::TooFewPeriods(self.nb_periods));
        }
        Ok(self)
    }

    pub fn syt_interval(&self) -> u8 {
        rate_params(self.sample_rate).expect("validated config carries a supported rate").0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn period_smaller_than_syt_interval_is_rejected() {
        let cfg = EngineConfig { period_size: 4, ..EngineConfig::default() };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err, ConfigError::PeriodTooSmall { period: 4, syt_interval: 8 });
    }

    #[test]
    fn unsupported_rate_is_rejected() {
        let cfg = EngineConfig { sample_rate: 22050, ..EngineConfig::default() };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedRate(22050));
    }

    #[test]
    fn too_few_periods_is_rejected() {
        let cfg = EngineConfig { nb_periods: 1, ..EngineConfig::default() };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err, ConfigError::TooFewPeriods(1));
    }
}
