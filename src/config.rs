//! Server settings
//!
//! Settings are layered: built-in defaults, then the optional
//! `config/default.toml` and `config/{APP_ENV}.toml`, then `QUIZSYNC__*`
//! environment variables. A `.env`
//! file, when present, is loaded into the environment first.

use std::{path::PathBuf, time::Duration};

use ::config::{Config, Environment, File};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use thiserror::Error;

use crate::{constants::timer, leaderboard::Scoring};

type ValidationResult = garde::Result;

fn validate_duration<const MIN_MILLIS: u64, const MAX_MILLIS: u64>(
    field: &'static str,
    val: &Duration,
) -> ValidationResult {
    let millis = u64::try_from(val.as_millis()).unwrap_or(u64::MAX);
    if (MIN_MILLIS..=MAX_MILLIS).contains(&millis) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "{field} is outside of the bounds [{MIN_MILLIS},{MAX_MILLIS}] ms",
        )))
    }
}

fn validate_question_lead(val: &Duration, _ctx: &()) -> ValidationResult {
    validate_duration::<0, { timer::MAX_QUESTION_LEAD * 1000 }>("question_lead", val)
}

fn validate_activation_lead(val: &Duration, _ctx: &()) -> ValidationResult {
    validate_duration::<0, { timer::MAX_ACTIVATION_LEAD * 1000 }>(
        "activation_lead",
        val,
    )
}

fn validate_tick_interval(val: &Duration, _ctx: &()) -> ValidationResult {
    validate_duration::<{ timer::MIN_TICK_INTERVAL_MS }, { timer::MAX_TICK_INTERVAL_MS }>(
        "tick_interval",
        val,
    )
}

/// Settings of one quiz server process
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    /// Socket address the HTTP server listens on
    #[garde(length(min = 1))]
    pub bind: String,
    /// Shared PIN required by driver operations
    #[garde(length(min = 1))]
    pub driver_pin: String,
    /// Answering window of every question, in seconds
    #[garde(range(min = timer::MIN_TIMER_MAX, max = timer::MAX_TIMER_MAX))]
    pub timer_max: u64,
    /// Delay between deciding to show a question and its timer starting
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[garde(custom(validate_question_lead))]
    pub question_lead: Duration,
    /// Delay between a `step-transition` and its `step-activation`
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[garde(custom(validate_activation_lead))]
    pub activation_lead: Duration,
    /// Period of the timer authority
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[garde(custom(validate_tick_interval))]
    pub tick_interval: Duration,
    /// Directory of the file store; the store is in memory when unset
    #[garde(skip)]
    pub data_dir: Option<PathBuf>,
    /// JSON question list loaded when the store has none
    #[garde(skip)]
    pub questions_file: Option<PathBuf>,
    /// Points awarded for correct answers
    #[garde(skip)]
    pub scoring: Scoring,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
            driver_pin: "0000".to_owned(),
            timer_max: 20,
            question_lead: Duration::from_secs(3),
            activation_lead: Duration::from_millis(500),
            tick_interval: Duration::from_millis(100),
            data_dir: None,
            questions_file: None,
            scoring: Scoring::default(),
        }
    }
}

/// Errors raised while loading settings
#[derive(Error, Debug)]
pub enum Error {
    /// A source could not be read or merged
    #[error("failed to load settings: {0}")]
    Load(#[from] ::config::ConfigError),
    /// The merged settings are out of bounds
    #[error("invalid settings: {0}")]
    Invalid(#[from] garde::Report),
}

impl Settings {
    /// Loads the layered settings of the current environment
    ///
    /// `APP_ENV` selects the file under `config/` (default `development`).
    pub fn load() -> Result<Self, Error> {
        dotenvy::dotenv().ok();
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        let settings: Settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                Environment::with_prefix("QUIZSYNC")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.question_lead, Duration::from_secs(3));
        assert_eq!(settings.scoring, Scoring::Flat { points: 1 });
    }

    #[test]
    fn durations_are_milliseconds() {
        let settings: Settings =
            serde_json::from_str(r#"{"question_lead": 1500, "tick_interval": 50}"#).unwrap();
        assert_eq!(settings.question_lead, Duration::from_millis(1500));
        assert_eq!(settings.tick_interval, Duration::from_millis(50));
        assert_eq!(settings.timer_max, 20);
    }

    #[test]
    fn scoring_is_externally_tagged() {
        let settings: Settings =
            serde_json::from_str(r#"{"scoring": {"time-decay": {"max_points": 1000}}}"#).unwrap();
        assert_eq!(settings.scoring, Scoring::TimeDecay { max_points: 1000 });
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let settings = Settings {
            timer_max: 1,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            tick_interval: Duration::from_millis(1),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            question_lead: Duration::from_secs(31),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
