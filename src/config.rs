use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result, bail};
use sentinel_core::{DispatcherConfig, config::SectionConfig};

const DEFAULT_CONFIG_FILE: &str = "/var/lib/procsentinel/procsentinel.ini";

/// Section for the settings shared by every module.
pub const GENERAL_CONFIG: &str = "general";

const DEFAULT_OBJECT_PATH: &str = "/usr/lib/procsentinel/probes.bpf.o";
const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/procsentinel";
const DEFAULT_RING_BUFFER: &str = "events";

/// Configuration of the agent, one section per module.
///
/// It is backed by an `INI` file parsed on creation.
#[derive(Debug, Clone, Default)]
pub struct SentinelConfig {
    sections: HashMap<String, SectionConfig>,
}

/// Typed view of the `[general]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralConfig {
    pub object_path: PathBuf,
    pub pin_path: PathBuf,
    pub ring_buffer: String,
    pub dispatcher: DispatcherConfig,
}

impl SentinelConfig {
    /// Load the default file. Every setting takes its default when the file
    /// doesn't exist.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{DEFAULT_CONFIG_FILE} not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    pub fn load_from_str(content: &str) -> Result<Self> {
        let conf = ini::Ini::load_from_str(content).context("Error parsing configuration")?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut sections: HashMap<String, SectionConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let section_config = sections.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    section_config.insert(key, value);
                }
            }
        }
        Self { sections }
    }

    /// Settings of a section, empty when the file doesn't have it.
    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    pub fn general(&self) -> Result<GeneralConfig> {
        let section = self.section(GENERAL_CONFIG);
        Ok(GeneralConfig {
            object_path: section
                .with_default("object_path", PathBuf::from(DEFAULT_OBJECT_PATH))?,
            pin_path: section.with_default("pin_path", PathBuf::from(DEFAULT_PIN_PATH))?,
            ring_buffer: section.with_default("ring_buffer", DEFAULT_RING_BUFFER.to_string())?,
            dispatcher: DispatcherConfig::from_section(&section)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults() {
        let general = SentinelConfig::default().general().unwrap();
        assert_eq!(general.object_path, PathBuf::from(DEFAULT_OBJECT_PATH));
        assert_eq!(general.pin_path, PathBuf::from(DEFAULT_PIN_PATH));
        assert_eq!(general.ring_buffer, "events");
        assert_eq!(general.dispatcher, DispatcherConfig::default());
    }

    #[test]
    fn overrides() {
        let config = SentinelConfig::load_from_str(
            "[general]\n\
             pin_path=/sys/fs/bpf/test\n\
             poll_interval_ms=25\n\
             consumer_queue_size=16\n\
             [process-monitor]\n\
             capabilities=process-monitoring\n",
        )
        .unwrap();
        let general = config.general().unwrap();
        assert_eq!(general.pin_path, PathBuf::from("/sys/fs/bpf/test"));
        assert_eq!(general.dispatcher.poll_interval, Duration::from_millis(25));
        assert_eq!(general.dispatcher.queue_size, 16);
        assert_eq!(
            config
                .section("process-monitor")
                .get_list::<String>("capabilities")
                .unwrap(),
            vec!["process-monitoring"]
        );
    }

    #[test]
    fn invalid_value() {
        let config = SentinelConfig::load_from_str("[general]\nbatch_size=many\n").unwrap();
        assert!(config.general().is_err());
    }

    #[test]
    fn missing_custom_file() {
        assert!(SentinelConfig::with_custom_file("/nonexistent/procsentinel.ini").is_err());
    }
}
