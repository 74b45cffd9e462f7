use std::{collections::HashSet, net::SocketAddr, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use data_model::{duration_secs, FunctionConfig};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use orchestrator::{
    runtime_host::{ContainerHostConfig, ProcessHostConfig},
    OrchestratorSettings,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "FAAS_";

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde_inline_default("0.0.0.0:8000".to_string())]
    pub listen_addr: String,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub process_host: ProcessHostConfig,
    #[serde(default)]
    pub container_host: ContainerHostConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Deployed at startup. The registry does not outlive the process.
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            orchestrator: OrchestratorSettings::default(),
            process_host: ProcessHostConfig::default(),
            container_host: ContainerHostConfig::default(),
            telemetry: TelemetryConfig::default(),
            functions: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &Path) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        Self::from_yaml_str(&config_str)
    }

    /// Defaults overridden by `FAAS_` environment variables only.
    pub fn from_env() -> Result<ServerConfig> {
        Self::extract(Figment::new())
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        Self::extract(Figment::new().merge(Yaml::string(config_str)))
    }

    fn extract(figment: Figment) -> Result<ServerConfig> {
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        self.orchestrator.validate()?;
        if self.telemetry.metrics_interval.is_zero() {
            return Err(anyhow!("telemetry.metrics_interval must be greater than zero"));
        }
        let mut names = HashSet::new();
        for function in &self.functions {
            function
                .validate()
                .with_context(|| format!("invalid preset function {}", function.name))?;
            if !names.insert(function.name.as_str()) {
                return Err(anyhow!("preset function {} is defined twice", function.name));
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint. Falls back to
    // OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(with = "duration_secs")]
    #[serde_inline_default(Duration::from_secs(10))]
    pub metrics_interval: Duration,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use data_model::ExecutionMode;
    use orchestrator::BackpressurePolicy;

    use super::*;

    const SAMPLE_CONFIG: &str = r#"
env: production
listen_addr: 127.0.0.1:9000
orchestrator:
  max_concurrent_functions: 50
  cold_start_timeout: 12.5
  warm_instance_ttl: 120
  backpressure:
    policy: reject
  provisioning:
    max_retries: 1
    fallback_mode: container
process_host:
  cgroup_root: null
container_host:
  enabled: false
telemetry:
  enable_metrics: true
  metrics_interval: 30
functions:
  - name: echo
    code_path: /srv/functions/echo.py
    min_instances: 1
    max_instances: 4
  - name: resize
    code_path: /srv/functions/resize.py
    execution_mode: container
    network_access: false
    memory: 512Mi
    cpu: "0.5"
"#;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert!(!config.structured_logging());
        assert_eq!(config.orchestrator, OrchestratorSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample_config() -> Result<()> {
        let config = ServerConfig::from_yaml_str(SAMPLE_CONFIG)?;
        assert_eq!(config.env, "production");
        assert!(config.structured_logging());
        assert_eq!(config.orchestrator.max_concurrent_functions, 50);
        assert_eq!(config.orchestrator.cold_start_timeout, Duration::from_millis(12_500));
        assert_eq!(config.orchestrator.warm_instance_ttl, Duration::from_secs(120));
        assert_eq!(config.orchestrator.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.orchestrator.backpressure, BackpressurePolicy::Reject);
        assert_eq!(
            config.orchestrator.provisioning.fallback_mode,
            Some(ExecutionMode::Container)
        );
        assert_eq!(config.process_host.cgroup_root, None);
        assert!(!config.container_host.enabled);
        assert_eq!(config.telemetry.metrics_interval, Duration::from_secs(30));

        assert_eq!(config.functions.len(), 2);
        let resize = &config.functions[1];
        assert_eq!(resize.execution_mode, ExecutionMode::Container);
        assert!(!resize.network_access);
        assert_eq!(resize.limits()?.cpu_millicores, 500);
        Ok(())
    }

    #[test]
    fn test_from_path() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"listen_addr: 127.0.0.1:8123\n")?;
        let config = ServerConfig::from_path(file.path())?;
        assert_eq!(config.listen_addr, "127.0.0.1:8123");
        assert!(config.functions.is_empty());

        assert!(ServerConfig::from_path(Path::new("/nonexistent/faas.yaml")).is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_listen_addr() {
        let err = ServerConfig::from_yaml_str("listen_addr: not-an-address\n").unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test]
    fn test_rejects_duplicate_presets() {
        let yaml = r#"
functions:
  - name: echo
    code_path: /srv/a.py
  - name: echo
    code_path: /srv/b.py
"#;
        let err = ServerConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_rejects_invalid_preset() {
        let yaml = r#"
functions:
  - name: echo
    code_path: /srv/a.py
    min_instances: 3
    max_instances: 1
"#;
        let err = ServerConfig::from_yaml_str(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("invalid preset function echo"));
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let yaml = "orchestrator:\n  cold_start_timeout: 0\n";
        assert!(ServerConfig::from_yaml_str(yaml).is_err());
    }
}
