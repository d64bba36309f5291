//! Environment value types shared by every binary's `Envconfig` struct.
use std::str::FromStr;
use std::time;

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Whole seconds, limited to what a `chrono::Duration` can hold.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub chrono::Duration);

impl EnvSecsDuration {
    pub fn to_std(self) -> time::Duration {
        time::Duration::from_secs(self.0.num_seconds().unsigned_abs())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvSecsDurationError)?;
        let secs = i64::try_from(secs).map_err(|_| ParseEnvSecsDurationError)?;

        chrono::Duration::try_seconds(secs)
            .map(EnvSecsDuration)
            .ok_or(ParseEnvSecsDurationError)
    }
}

/// A positive number of whole hours.
#[derive(Debug, Clone, Copy)]
pub struct EnvHoursDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvHoursDurationError;

impl FromStr for EnvHoursDuration {
    type Err = ParseEnvHoursDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hours = s.parse::<u64>().map_err(|_| ParseEnvHoursDurationError)?;
        if hours == 0 {
            return Err(ParseEnvHoursDurationError);
        }

        hours
            .checked_mul(3600)
            .map(|secs| EnvHoursDuration(time::Duration::from_secs(secs)))
            .ok_or(ParseEnvHoursDurationError)
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
