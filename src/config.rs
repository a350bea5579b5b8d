//! Runtime configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! | Variable               | Values                          | Default  |
//! |------------------------|---------------------------------|----------|
//! | `STHREADS_PREEMPTION`  | `off`, `checkpoint`, `signal`   | `signal` |
//! | `STHREADS_CLOCK`       | `thread`, `process`, `wall`     | `thread` |
//! | `STHREADS_INTERVAL_MS` | milliseconds, non-zero          | `50`     |
//! | `STHREADS_STACK_KIB`   | KiB per spawned thread, >= 16   | `256`    |

use crate::errors::ConfigError;
use crate::mem::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::time::{ClockBasis, DEFAULT_INTERVAL};
use core::str::FromStr;
use core::time::Duration;

pub const ENV_PREEMPTION: &str = "STHREADS_PREEMPTION";
pub const ENV_CLOCK: &str = "STHREADS_CLOCK";
pub const ENV_INTERVAL_MS: &str = "STHREADS_INTERVAL_MS";
pub const ENV_STACK_KIB: &str = "STHREADS_STACK_KIB";

/// How the timer takes control away from a running thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreemptionMode {
    /// No timer; threads switch only in lifecycle calls
    Disabled,
    /// The timer raises a flag and the switch happens at the next
    /// [`preemption_point`](crate::preemption_point)
    Checkpoint,
    /// The timer signal handler switches threads directly.
    ///
    /// Code that may be preempted must not hold non-reentrant state shared
    /// with other threads of the runtime, such as the allocator or stdio locks.
    #[default]
    Signal,
}

impl PreemptionMode {
    pub fn uses_timer(self) -> bool {
        !matches!(self, PreemptionMode::Disabled)
    }
}

impl FromStr for PreemptionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "disabled" | "none" => Ok(PreemptionMode::Disabled),
            "checkpoint" | "cooperative" => Ok(PreemptionMode::Checkpoint),
            "signal" | "on" => Ok(PreemptionMode::Signal),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub preemption: PreemptionMode,
    pub clock: ClockBasis,
    /// Time slice before the timer expires
    pub interval: Duration,
    /// Stack size for spawned threads, in bytes
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            preemption: PreemptionMode::default(),
            clock: ClockBasis::default(),
            interval: DEFAULT_INTERVAL,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// Purely cooperative configuration with no timer.
    pub fn cooperative() -> Self {
        Self::default().with_preemption(PreemptionMode::Disabled)
    }

    pub fn with_preemption(mut self, mode: PreemptionMode) -> Self {
        self.preemption = mode;
        self
    }

    pub fn with_clock(mut self, clock: ClockBasis) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall(self.stack_size));
        }
        if self.preemption.uses_timer() && self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    /// Defaults overridden by the `STHREADS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_PREEMPTION) {
            config.preemption = parse(ENV_PREEMPTION, value)?;
        }
        if let Some(value) = lookup(ENV_CLOCK) {
            config.clock = parse(ENV_CLOCK, value)?;
        }
        if let Some(value) = lookup(ENV_INTERVAL_MS) {
            config.interval = Duration::from_millis(parse(ENV_INTERVAL_MS, value)?);
        }
        if let Some(value) = lookup(ENV_STACK_KIB) {
            let kib: usize = parse(ENV_STACK_KIB, value)?;
            config.stack_size = kib.saturating_mul(1024);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.preemption, PreemptionMode::Signal);
        assert_eq!(config.clock, ClockBasis::ThreadCpu);
        assert_eq!(config.interval, Duration::from_millis(50));
        assert_eq!(config.stack_size, 256 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[
            (ENV_PREEMPTION, "checkpoint"),
            (ENV_CLOCK, "wall"),
            (ENV_INTERVAL_MS, " 10 "),
            (ENV_STACK_KIB, "64"),
        ]))
        .unwrap();
        assert_eq!(config.preemption, PreemptionMode::Checkpoint);
        assert_eq!(config.clock, ClockBasis::Wall);
        assert_eq!(config.interval, Duration::from_millis(10));
        assert_eq!(config.stack_size, 64 * 1024);
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let err = SchedulerConfig::from_lookup(lookup_from(&[(ENV_INTERVAL_MS, "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: ENV_INTERVAL_MS,
                value: "soon".to_string()
            }
        );
    }

    #[test]
    fn test_validation_limits() {
        assert_eq!(
            SchedulerConfig::default().with_stack_size(4096).validate(),
            Err(ConfigError::StackTooSmall(4096))
        );
        assert_eq!(
            SchedulerConfig::default().with_interval(Duration::ZERO).validate(),
            Err(ConfigError::ZeroInterval)
        );
        // no timer, so no interval needed
        assert!(SchedulerConfig::cooperative()
            .with_interval(Duration::ZERO)
            .validate()
            .is_ok());

        let err = SchedulerConfig::from_lookup(lookup_from(&[(ENV_STACK_KIB, "8")])).unwrap_err();
        assert_eq!(err, ConfigError::StackTooSmall(8 * 1024));
    }
}
