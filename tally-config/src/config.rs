use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tally_log::{Level, LogConfig};
use tally_metrics::EngineConfig;

/// Name of the configuration file inside the config folder.
const CONFIG_FILE: &str = "config.yml";

/// Defines the source of a config error.
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: Some(Box::new(cause)),
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Reporting of tally's own operational metrics.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables reporting.
    pub statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"tally"`.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "tally".to_owned(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    metrics: Metrics,
    engine: EngineConfig,
}

/// Overrides for individual config values, taken from CLI arguments or environment variables.
#[derive(Clone, Debug, Default)]
pub struct OverridableConfig {
    /// The log level.
    pub log_level: Option<String>,
    /// The tick period in milliseconds.
    pub period_ms: Option<String>,
    /// The `host:port` of the statsd server for operational metrics.
    pub statsd: Option<String>,
}

/// Config struct.
#[derive(Clone, Debug)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads a config from the given config folder.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = path.join(CONFIG_FILE);

        let reader = fs::File::open(&file)
            .map(io::BufReader::new)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&file))?;
        let values: ConfigValues = serde_yaml::from_reader(reader)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&file))?;

        values
            .engine
            .validate()
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue).file(&file))?;

        Ok(Self {
            values,
            path: path.to_path_buf(),
        })
    }

    /// Creates a default config that is saved to the given config folder.
    pub fn default_in(path: impl Into<PathBuf>) -> Self {
        Self {
            values: ConfigValues::default(),
            path: path.into(),
        }
    }

    /// Creates a config from a YAML document, as if loaded from the given config folder.
    pub fn from_yaml_str(yaml: &str, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let values: ConfigValues = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?;

        values
            .engine
            .validate()
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue))?;

        Ok(Self {
            values,
            path: path.into(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<Level>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(period) = overrides.period_ms {
            let engine = &mut self.values.engine;
            engine.period_ms = period
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "period_ms"))?;
            engine
                .validate()
                .map_err(|err| ConfigError::for_field(err, "period_ms"))?;
        }

        if let Some(statsd) = overrides.statsd {
            self.values.metrics.statsd = (!statsd.is_empty()).then_some(statsd);
        }

        Ok(self)
    }

    /// Serializes the current configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Writes the configuration into its config folder, creating the folder if needed.
    pub fn save(&self) -> Result<(), ConfigError> {
        let file = self.path.join(CONFIG_FILE);
        let yaml = self.to_yaml_string()?;

        fs::create_dir_all(&self.path)
            .and_then(|()| fs::write(&file, yaml))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&file))
    }

    /// The folder the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the configuration of the aggregation engine.
    pub fn engine(&self) -> &EngineConfig {
        &self.values.engine
    }

    /// Returns the `host:port` of the statsd server, if configured.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix of operational metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags of operational metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the tag name that receives the hostname, if configured.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_in(".tally")
    }
}

#[cfg(test)]
mod tests {
    use tally_metrics::{Dialect, MetricKind};

    use super::*;

    fn write_config(yaml: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), yaml).unwrap();
        dir
    }

    #[test]
    fn test_load_from_folder() {
        let dir = write_config(
            r#"
logging:
  level: debug
metrics:
  statsd: 127.0.0.1:8125
  default_tags:
    dc: eu
engine:
  period_ms: 5000
  dialect: graphite
  adder:
    threads: 4
"#,
        );

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.logging().level, Level::Debug);
        assert_eq!(config.statsd_addr(), Some("127.0.0.1:8125"));
        assert_eq!(config.metrics_prefix(), "tally");
        assert_eq!(config.metrics_default_tags()["dc"], "eu");
        assert_eq!(config.engine().period_ms, 5000);
        assert_eq!(config.engine().dialect, Dialect::Graphite);
        assert_eq!(config.engine().type_settings(MetricKind::Adder).threads, 4);
        assert_eq!(config.path(), dir.path());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = Config::from_path(dir.path()).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
        assert!(error.to_string().starts_with("could not open config file (file "));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_bad_yaml() {
        let dir = write_config("engine: [unclosed");
        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
    }

    #[test]
    fn test_invalid_engine_values() {
        let error = Config::from_yaml_str("engine:\n  stats:\n    thresholds: \"50\"\n", ".")
            .unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        insta::assert_snapshot!(
            error.source().unwrap().to_string(),
            @r#"invalid threshold "50": the median is always reported"#
        );
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                log_level: Some("trace".to_owned()),
                period_ms: Some("250".to_owned()),
                statsd: Some("localhost:8125".to_owned()),
            })
            .unwrap();

        assert_eq!(config.logging().level, Level::Trace);
        assert_eq!(config.engine().period_ms, 250);
        assert_eq!(config.statsd_addr(), Some("localhost:8125"));
    }

    #[test]
    fn test_invalid_overrides() {
        let mut config = Config::default();

        let error = config
            .apply_override(OverridableConfig {
                log_level: Some("loud".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field log_level)");

        let error = config
            .apply_override(OverridableConfig {
                period_ms: Some("0".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("nested");

        let mut config = Config::from_yaml_str("engine:\n  period_ms: 1000\n", &folder).unwrap();
        config
            .apply_override(OverridableConfig {
                statsd: Some("10.0.0.1:8125".to_owned()),
                ..Default::default()
            })
            .unwrap();
        config.save().unwrap();

        let reloaded = Config::from_path(&folder).unwrap();
        assert_eq!(reloaded.engine(), config.engine());
        assert_eq!(reloaded.statsd_addr(), Some("10.0.0.1:8125"));
    }
}
