use serde::Deserialize;

/// The coordinator's on-disk configuration, loaded once at startup.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub agents: Vec<String>,
    pub port: u16,
    pub restport: u16,
    pub capture: CaptureConfig,
    pub history: ResultsHistory,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    /// RPC deadline, in milliseconds, for `StartCapture`/`GetResults`/`Goodbye`.
    pub timeout: u64,
    /// How long a capture window runs before results are collected, in milliseconds.
    pub period: u64,
    /// Pause between capture windows, in milliseconds.
    pub interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct ResultsHistory {
    pub file: String,
    /// Rolling-store flush interval, in minutes.
    pub period: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config.agents must list at least one agent address")]
    NoAgents,
    #[error("capture.period, capture.interval and history.period must all be positive")]
    NonPositivePeriod,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        if self.capture.period == 0 || self.capture.interval == 0 || self.history.period == 0 {
            return Err(ConfigError::NonPositivePeriod);
        }
        Ok(())
    }
}
