//! Configuration management
//!
//! Values come from an optional `barterwave.toml` (or `.json`/`.yaml`) next to
//! the binary, overridden by `BARTERWAVE_*` environment variables, e.g.
//! `BARTERWAVE_PORT=9000` or `BARTERWAVE_DEFAULT_TIMER_MINUTES=30`.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::models::{MAX_TIMER_MINUTES, MIN_TIMER_MINUTES};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Response window for sellers without brand settings.
    #[serde(default = "defaults::default_timer_minutes")]
    pub default_timer_minutes: u32,

    /// Extension applied when a party asks for more time without naming it.
    #[serde(default = "defaults::timer_extension_minutes")]
    pub timer_extension_minutes: u32,

    #[serde(default = "defaults::max_timer_extensions")]
    pub max_timer_extensions: u32,

    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "defaults::pickup_pin_length")]
    pub pickup_pin_length: usize,

    /// Wrong PIN entries tolerated per locked deal before pickup is refused.
    #[serde(default = "defaults::max_pin_attempts")]
    pub max_pin_attempts: u32,

    /// Counters allowed per offer before the parties must accept or reject.
    #[serde(default = "defaults::max_counters")]
    pub max_counters: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            default_timer_minutes: defaults::default_timer_minutes(),
            timer_extension_minutes: defaults::timer_extension_minutes(),
            max_timer_extensions: defaults::max_timer_extensions(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
            pickup_pin_length: defaults::pickup_pin_length(),
            max_pin_attempts: defaults::max_pin_attempts(),
            max_counters: defaults::max_counters(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name("barterwave").required(false))
            .add_source(config::Environment::with_prefix("BARTERWAVE").try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timer_range = MIN_TIMER_MINUTES..=MAX_TIMER_MINUTES;
        ensure!(
            timer_range.contains(&i64::from(self.default_timer_minutes)),
            "default_timer_minutes must be between {MIN_TIMER_MINUTES} and {MAX_TIMER_MINUTES}"
        );
        ensure!(
            timer_range.contains(&i64::from(self.timer_extension_minutes)),
            "timer_extension_minutes must be between {MIN_TIMER_MINUTES} and {MAX_TIMER_MINUTES}"
        );
        ensure!(self.sweep_interval_secs > 0, "sweep_interval_secs must be positive");
        ensure!(
            (4..=10).contains(&self.pickup_pin_length),
            "pickup_pin_length must be between 4 and 10"
        );
        ensure!(self.max_pin_attempts > 0, "max_pin_attempts must be positive");
        ensure!(self.max_counters > 0, "max_counters must be positive");
        Ok(())
    }
}

mod defaults {
    pub fn port() -> u16 {
        8080
    }

    pub fn default_timer_minutes() -> u32 {
        60
    }

    pub fn timer_extension_minutes() -> u32 {
        60
    }

    pub fn max_timer_extensions() -> u32 {
        3
    }

    pub fn sweep_interval_secs() -> u64 {
        60
    }

    pub fn pickup_pin_length() -> usize {
        6
    }

    pub fn max_pin_attempts() -> u32 {
        5
    }

    pub fn max_counters() -> u32 {
        20
    }
}
