use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::machine::HardwareHandle;

fn deserialize_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    humantime::parse_duration(&buf).map_err(serde::de::Error::custom)
}

fn default_boards() -> u32 {
    3
}

fn default_status_update_period() -> Duration {
    Duration::from_secs(10)
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Address passed to every started worker so that it can reach the orchestrator.
    pub callback_address: String,

    /// Start replacement workers when a worker dies before taking a job.
    #[serde(default)]
    pub restart_executors_on_failure: bool,

    /// Boards requested for a job that does not specify its size.
    #[serde(default = "default_boards")]
    pub default_boards: u32,

    #[serde(default = "default_status_update_period")]
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub status_update_period: Duration,

    pub machines: MachinesConfig,
}

impl OrchestratorConfig {
    pub fn parse(text: &str) -> crate::Result<OrchestratorConfig> {
        let config: OrchestratorConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> crate::Result<OrchestratorConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.status_update_period.is_zero() {
            return Err(crate::Error::ConfigError(
                "status_update_period must be positive".into(),
            ));
        }
        match &self.machines {
            MachinesConfig::Static { machines } => {
                if machines.is_empty() {
                    return Err(crate::Error::ConfigError(
                        "Static machine pool is empty".into(),
                    ));
                }
                let mut seen = crate::Set::default();
                for machine in machines {
                    if !seen.insert(machine) {
                        return Err(crate::Error::ConfigError(format!(
                            "Machine {} is defined more than once",
                            machine.name
                        )));
                    }
                }
            }
            MachinesConfig::Remote(remote) => {
                if remote.keepalive_period.is_zero() || remote.response_timeout.is_zero() {
                    return Err(crate::Error::ConfigError(
                        "Allocator keepalive and response timeouts must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Which machine manager hands out the hardware.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MachinesConfig {
    Static {
        #[serde(deserialize_with = "deserialize_machines")]
        machines: Vec<HardwareHandle>,
    },
    Remote(RemoteAllocatorConfig),
}

/// A pool entry is either a table or the compact `(name:version:w:h:boards:bmp)` string.
fn deserialize_machines<'de, D>(deserializer: D) -> Result<Vec<HardwareHandle>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MachineDef {
        Compact(String),
        Full(HardwareHandle),
    }

    Vec::<MachineDef>::deserialize(deserializer)?
        .into_iter()
        .map(|def| match def {
            MachineDef::Compact(text) => text.parse().map_err(serde::de::Error::custom),
            MachineDef::Full(handle) => Ok(handle),
        })
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_keepalive_period() -> Duration {
    Duration::from_secs(5)
}

fn default_one_second() -> Duration {
    Duration::from_secs(1)
}

fn default_request_retries() -> u32 {
    3
}

fn default_machine_version() -> String {
    "5".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteAllocatorConfig {
    pub host: String,
    pub port: u16,
    /// Owner reported to the allocation service for every created session.
    pub owner: String,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Round requests for more than one board up to whole triads of boards.
    #[serde(default = "default_true")]
    pub round_to_triads: bool,

    #[serde(default = "default_keepalive_period")]
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub keepalive_period: Duration,

    #[serde(default = "default_one_second")]
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub response_timeout: Duration,

    #[serde(default = "default_one_second")]
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub reconnect_delay: Duration,

    #[serde(default = "default_request_retries")]
    pub request_retries: u32,

    /// Version tag given to the handles of remote machines.
    #[serde(default = "default_machine_version")]
    pub machine_version: String,
}

impl RemoteAllocatorConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_config(&self) -> spalloc::ClientConfig {
        spalloc::ClientConfig {
            address: self.address(),
            response_timeout: self.response_timeout,
            reconnect_delay: self.reconnect_delay,
            request_retries: self.request_retries,
        }
    }
}
