use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::{
    endpoint::Numbering,
    error::Error,
    provision::ProvisionPolicy,
    settings::{self, FallbackPolicy},
};

/// The physical serial device we read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceConfig {
    /// Path to the device, e.g. `/dev/ttyACM0`.
    pub path: PathBuf,

    /// Baud rate.
    pub baud: u32,

    /// Flow control used on the device.
    pub flow_control: serialport::FlowControl,

    /// How many times to look for the device before giving up.
    pub open_attempts: u32,

    /// Time between looking for the device, in milliseconds.
    pub retry_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/ttyACM0"),
            baud: 9600,
            flow_control: serialport::FlowControl::None,
            open_attempts: 30,
            retry_interval_ms: 2000,
        }
    }
}

/// The virtual endpoints we expose.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Endpoint paths are this prefix with the id appended.
    pub prefix: PathBuf,

    /// Which ids to use.
    /// See [`Numbering`].
    pub numbering: Numbering,

    /// What to do if some endpoint can not be brought up.
    /// See [`ProvisionPolicy`].
    pub policy: ProvisionPolicy,

    /// How many chunks an endpoint may fall behind before losing data.
    pub queue_depth: usize,

    /// Remove all `<prefix><digits>` leftovers before provisioning.
    pub sweep_stale: bool,

    /// Remove our links when stopping.
    /// If `false` they are left in place and cleared on the next start.
    pub remove_on_shutdown: bool,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("/dev/gps"),
            numbering: Numbering::default(),
            policy: ProvisionPolicy::default(),
            queue_depth: 64,
            sweep_stale: true,
            remove_on_shutdown: false,
        }
    }
}

/// Where the endpoint count comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettingsConfig {
    /// The `key=value` file.
    pub path: PathBuf,

    /// The key holding the endpoint count.
    pub key: String,

    /// What to do if the file, the key or the value is unusable.
    pub fallback: FallbackPolicy,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/bin/wmt_winset/config.ini"),
            key: settings::DEFAULT_KEY.to_owned(),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// The configuration used for running the fanout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// The physical source.
    pub source: SourceConfig,

    /// The virtual endpoints.
    pub endpoints: EndpointsConfig,

    /// The endpoint count settings.
    pub settings: SettingsConfig,

    /// How long workers get to stop before they are aborted, in milliseconds.
    pub shutdown_timeout_ms: u64,

    /// Log level used unless `RUST_LOG` says otherwise.
    pub log_level: String,

    /// If set, also log to daily rotated files in this directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            endpoints: EndpointsConfig::default(),
            settings: SettingsConfig::default(),
            shutdown_timeout_ms: 3000,
            log_level: "info".into(),
            log_dir: None,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        let config = Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            endpoints: EndpointsConfig {
                numbering: Numbering::OneBased,
                remove_on_shutdown: true,
                ..Default::default()
            },
            settings: SettingsConfig {
                fallback: FallbackPolicy::DefaultCount(20),
                ..Default::default()
            },
            log_dir: Some(PathBuf::from("/var/log/serial-fanout")),
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let p = p.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::BadConfig(format!("Could not read {p:?}: {e}")))?;

        Self::deserialize(&s)
    }

    /// The log level, falling back to `info` if it does not parse.
    pub fn log_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        let prefix = self.endpoints.prefix.as_os_str();

        if prefix.is_empty() {
            return Err(Error::BadConfig("The endpoint prefix is empty".into()));
        }

        if self.endpoints.prefix.file_name().is_none()
            || prefix.to_string_lossy().ends_with(std::path::MAIN_SEPARATOR)
        {
            return Err(Error::BadConfig(format!(
                "The endpoint prefix {:?} must end in a file name stem, e.g. `/dev/gps`",
                self.endpoints.prefix
            )));
        }

        if self.endpoints.queue_depth == 0 {
            return Err(Error::BadConfig(
                "The queue depth must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();

        println!("{}", c.serialize_pretty().unwrap());
    }

    #[test]
    fn example_round_trips() {
        let c = Config::example();
        let back = Config::deserialize(&c.serialize_pretty().unwrap()).unwrap();

        assert_eq!(c, back);
    }

    #[test]
    fn partial_config_is_filled_with_defaults() {
        let input = r#"
(
    source: (
        path: "/dev/ttyUSB3",
    ),
    endpoints: (
        numbering: OneBased,
    ),
    settings: (
        fallback: DefaultCount(20),
    ),
)
"#;
        let config = Config::deserialize(input).unwrap();

        assert_eq!(config.source.path, PathBuf::from("/dev/ttyUSB3"));
        assert_eq!(config.source.baud, 9600);
        assert_eq!(config.endpoints.numbering, Numbering::OneBased);
        assert_eq!(config.endpoints.prefix, PathBuf::from("/dev/gps"));
        assert_eq!(config.settings.fallback, FallbackPolicy::DefaultCount(20));
        assert_eq!(config.settings.key, "gps_port");
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Config::deserialize("()").unwrap(), Config::default());
    }

    #[test]
    fn garbage_is_bad_config() {
        let err = Config::deserialize("(source: 3").unwrap_err();
        assert!(err.try_into_bad_config().is_some());
    }

    #[test]
    fn bad_config_empty_prefix() {
        let c = Config {
            endpoints: EndpointsConfig {
                prefix: PathBuf::new(),
                ..Default::default()
            },
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("empty"));
    }

    #[test]
    fn bad_config_directory_prefix() {
        let c = Config {
            endpoints: EndpointsConfig {
                prefix: PathBuf::from("/dev/"),
                ..Default::default()
            },
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("/dev/"));
    }

    #[test]
    fn bad_config_queue_depth() {
        let c = Config {
            endpoints: EndpointsConfig {
                queue_depth: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(c.validate().is_err());
    }

    #[test]
    fn log_level_falls_back() {
        let c = Config {
            log_level: "chatty".into(),
            ..Default::default()
        };

        assert_eq!(c.log_level(), Level::INFO);
    }
}
