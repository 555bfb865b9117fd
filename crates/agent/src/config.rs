use serde::Deserialize;

/// The agent's on-disk configuration, loaded once at startup.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Port the agent's gRPC server listens on.
    pub port: u16,
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct InterfaceConfig {
    /// Capture device name, e.g. `eth0`.
    pub device: String,
    /// Kept as a string for forward compatibility with the original's
    /// afpacket/pfring backends; only `pcap` is implemented here.
    #[serde(rename = "type")]
    pub capture_type: String,
    #[serde(default, rename = "targetsize")]
    pub target_size_mb: u32,
    /// TCP port to filter for in the capture's BPF expression.
    pub port: u16,
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
    #[error("unsupported interface.type {0:?}; only \"pcap\" is implemented")]
    UnsupportedInterfaceType(String),
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
        if self.interface.capture_type != "pcap" {
            return Err(ConfigError::UnsupportedInterfaceType(self.interface.capture_type.clone()));
        }
        Ok(())
    }
}
