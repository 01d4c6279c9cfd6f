//! Settings for the tee/adder/join demo graph.

use crate::error::{PipelineError, Result};
use std::str::FromStr;

pub const ENV_QUEUE_CAPACITY: &str = "STAGE_PIPELINE_QUEUE_CAPACITY";
pub const ENV_BLOCKSIZE: &str = "STAGE_PIPELINE_BLOCKSIZE";
pub const ENV_LEFT_ADD: &str = "STAGE_PIPELINE_LEFT_ADD";
pub const ENV_LOG: &str = "STAGE_PIPELINE_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoConfig {
    /// Elements per queue
    pub queue_capacity: usize,
    /// Elements per block on every connection
    pub blocksize: usize,
    /// Constant added on the tee's left branch before the join; the right
    /// branch feeds the join unchanged
    pub left_add: i32,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            blocksize: 1,
            left_add: 8,
            log_level: "info".to_string(),
        }
    }
}

impl DemoConfig {
    /// Defaults overridden by `STAGE_PIPELINE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, validating the result
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_QUEUE_CAPACITY) {
            config.queue_capacity = parse_var(ENV_QUEUE_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_BLOCKSIZE) {
            config.blocksize = parse_var(ENV_BLOCKSIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_LEFT_ADD) {
            config.left_add = parse_var(ENV_LEFT_ADD, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            config.log_level = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PipelineError::ConfigError(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.blocksize == 0 || self.blocksize > self.queue_capacity {
            return Err(PipelineError::ConfigError(format!(
                "block size must be between 1 and the queue capacity ({}), got {}",
                self.queue_capacity, self.blocksize
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PipelineError::ConfigError(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DemoConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DemoConfig::default());
        assert_eq!(config.queue_capacity, 2);
        assert_eq!(config.left_add, 8);
    }

    #[test]
    fn test_overrides() {
        let config = DemoConfig::from_lookup(lookup(&[
            (ENV_QUEUE_CAPACITY, "16"),
            (ENV_BLOCKSIZE, " 4 "),
            (ENV_LEFT_ADD, "5"),
            (ENV_LOG, "debug"),
        ]))
        .unwrap();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.blocksize, 4);
        assert_eq!(config.left_add, 5);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_values() {
        let result = DemoConfig::from_lookup(lookup(&[(ENV_BLOCKSIZE, "many")]));
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));

        let result = DemoConfig::from_lookup(lookup(&[(ENV_BLOCKSIZE, "3")]));
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));

        let result = DemoConfig::from_lookup(lookup(&[(ENV_QUEUE_CAPACITY, "0")]));
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
