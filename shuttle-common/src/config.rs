//! Configuration types shared by the shuttle binaries.
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::retry::RetryPolicy;

/// A duration read from the environment as a number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "100000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .provide()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
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

/// A comma-separated list of identities, e.g. `1,2,3`. Blank entries are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FidList(pub Vec<u64>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseFidListError(pub String);

impl FromStr for FidList {
    type Err = ParseFidListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|fid| !fid.is_empty())
            .map(|fid| fid.parse::<u64>().map_err(|_| ParseFidListError(fid.to_owned())))
            .collect::<Result<Vec<u64>, _>>()
            .map(FidList)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ms_duration() {
        assert_eq!(
            "250".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(250)))
        );
        assert_eq!("1s".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }

    #[test]
    fn test_non_empty_string() {
        assert_eq!("".parse::<NonEmptyString>(), Err(StringIsEmptyError));
        assert_eq!("reconcile".parse::<NonEmptyString>().unwrap().as_str(), "reconcile");
    }

    #[test]
    fn test_parse_fid_list() {
        assert_eq!("1, 2,,3".parse::<FidList>(), Ok(FidList(vec![1, 2, 3])));
        assert_eq!("".parse::<FidList>(), Ok(FidList(vec![])));
        assert_eq!(
            "1,two".parse::<FidList>(),
            Err(ParseFidListError("two".to_owned()))
        );
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = RetryPolicyConfig {
            backoff_coefficient: 3,
            initial_interval: EnvMsDuration(time::Duration::from_millis(100)),
            maximum_interval: EnvMsDuration(time::Duration::from_millis(500)),
        };

        let policy = config.policy();
        assert_eq!(policy.retry_interval(2), time::Duration::from_millis(300));
        assert_eq!(policy.retry_interval(3), time::Duration::from_millis(500));
    }
}
