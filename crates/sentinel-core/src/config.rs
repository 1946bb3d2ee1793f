use std::{collections::HashMap, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;

use crate::dispatcher::DispatcherConfig;

/// Key/value settings of one configuration section.
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl SectionConfig {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    pub fn required<T>(&self, field: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.optional(field)?
            .ok_or_else(|| ConfigError::RequiredValue {
                field: field.to_string(),
            })
    }

    pub fn optional<T>(&self, field: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(field)
            .map(|value| parse(value, field))
            .transpose()
    }

    pub fn with_default<T>(&self, field: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(field)?.unwrap_or(default))
    }

    /// Comma separated list. Empty when the field is missing.
    pub fn get_list<T>(&self, field: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(field)
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse(item, field))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SectionConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn parse<T>(value: &str, field: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

fn positive(field: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            err: "must be greater than 0".to_string(),
        });
    }
    Ok(value)
}

impl DispatcherConfig {
    /// Read `poll_interval_ms`, `batch_size` and `consumer_queue_size`.
    pub fn from_section(section: &SectionConfig) -> Result<Self, ConfigError> {
        let default = DispatcherConfig::default();
        let poll_interval_ms = section.with_default(
            "poll_interval_ms",
            default.poll_interval.as_millis() as u64,
        )?;
        let batch_size = section.with_default("batch_size", default.batch_size as u64)?;
        let queue_size = section.with_default("consumer_queue_size", default.queue_size as u64)?;
        Ok(Self {
            poll_interval: Duration::from_millis(positive("poll_interval_ms", poll_interval_ms)?),
            batch_size: positive("batch_size", batch_size)? as usize,
            queue_size: positive("consumer_queue_size", queue_size)? as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values() {
        let section: SectionConfig = [("batch_size", "32"), ("hooks", "a, b,,c")]
            .into_iter()
            .collect();
        assert_eq!(section.required::<usize>("batch_size"), Ok(32));
        assert_eq!(
            section.required::<usize>("missing"),
            Err(ConfigError::RequiredValue {
                field: "missing".to_string()
            })
        );
        assert_eq!(section.with_default("missing", 7u32), Ok(7));
        assert_eq!(
            section.get_list::<String>("hooks").unwrap(),
            vec!["a", "b", "c"]
        );
        assert!(matches!(
            section.optional::<u8>("hooks"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn dispatcher_config() {
        let config = DispatcherConfig::from_section(&SectionConfig::default()).unwrap();
        assert_eq!(config, DispatcherConfig::default());

        let section: SectionConfig = [("poll_interval_ms", "10"), ("consumer_queue_size", "8")]
            .into_iter()
            .collect();
        let config = DispatcherConfig::from_section(&section).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.queue_size, 8);
        assert_eq!(config.batch_size, 64);

        let section: SectionConfig = [("batch_size", "0")].into_iter().collect();
        assert!(DispatcherConfig::from_section(&section).is_err());
    }
}
