pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use derive_builder::Builder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum::AsRefStr;

const INSTANCE_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

const MAX_FUNCTION_NAME_LEN: usize = 64;

/// Durations are written as (possibly fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Process,
    Container,
}

impl Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Memory and CPU held by one instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_millicores: u64,
}

/// Parses a memory quantity such as `256Mi`, `1G` or `1048576`.
///
/// Decimal suffixes (`k`, `m`, `g`) are powers of 1000, binary ones (`ki`,
/// `mi`, `gi`) powers of 1024. Suffixes are case-insensitive.
pub fn parse_memory(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_lowercase();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let multiplier: u64 = match suffix {
        "" | "b" => 1,
        "k" => 1_000,
        "ki" => 1 << 10,
        "m" => 1_000_000,
        "mi" => 1 << 20,
        "g" => 1_000_000_000,
        "gi" => 1 << 30,
        other => bail!("unknown memory unit {:?} in {:?}", other, value),
    };
    let number: f64 = number
        .parse()
        .with_context(|| format!("invalid memory quantity {:?}", value))?;
    let bytes = (number * multiplier as f64) as u64;
    if bytes == 0 {
        bail!("memory limit must be positive, got {:?}", value);
    }
    Ok(bytes)
}

/// Parses a CPU quantity: `100m` is a tenth of a core, `0.5` and `2` are
/// core counts.
pub fn parse_cpu(value: &str) -> Result<u64> {
    let value = value.trim();
    let millicores = match value.strip_suffix('m') {
        Some(millis) => millis
            .parse::<u64>()
            .with_context(|| format!("invalid cpu quantity {:?}", value))?,
        None => {
            let cores: f64 = value
                .parse()
                .with_context(|| format!("invalid cpu quantity {:?}", value))?;
            (cores * 1000.0) as u64
        }
    };
    if millicores == 0 {
        bail!("cpu limit must be positive, got {:?}", value);
    }
    Ok(millicores)
}

fn default_handler() -> String {
    "handle".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_memory() -> String {
    "256Mi".to_string()
}

fn default_cpu() -> String {
    "100m".to_string()
}

fn default_max_instances() -> u32 {
    10
}

fn default_network_access() -> bool {
    true
}

/// Deployment record of one function. Replaced wholesale on update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct FunctionConfig {
    pub name: String,
    /// Entry point the runtime resolves inside the code.
    #[serde(default = "default_handler")]
    pub handler: String,
    #[serde(default)]
    pub code_path: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Per-invocation timeout.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_network_access")]
    pub network_access: bool,
    /// Container image override. Process instances ignore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl FunctionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_FUNCTION_NAME_LEN {
            bail!(
                "function name must be 1-{} characters, got {:?}",
                MAX_FUNCTION_NAME_LEN,
                self.name
            );
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "function name {:?} may only contain letters, digits, '-' and '_'",
                self.name
            );
        }
        if self.handler.is_empty() {
            bail!("function {}: handler must not be empty", self.name);
        }
        if self.max_instances == 0 {
            bail!("function {}: max_instances must be at least 1", self.name);
        }
        if self.min_instances > self.max_instances {
            bail!(
                "function {}: min_instances ({}) exceeds max_instances ({})",
                self.name,
                self.min_instances,
                self.max_instances
            );
        }
        if self.timeout.is_zero() {
            bail!("function {}: timeout must be positive", self.name);
        }
        if self.environment.keys().any(|k| k.is_empty() || k.contains('=')) {
            bail!(
                "function {}: environment variable names must be non-empty and contain no '='",
                self.name
            );
        }
        self.limits()?;
        Ok(())
    }

    pub fn limits(&self) -> Result<ResourceLimits> {
        Ok(ResourceLimits {
            memory_bytes: parse_memory(&self.memory)
                .with_context(|| format!("function {}", self.name))?,
            cpu_millicores: parse_cpu(&self.cpu)
                .with_context(|| format!("function {}", self.name))?,
        })
    }
}

impl FunctionConfigBuilder {
    pub fn build(&self) -> Result<FunctionConfig> {
        let name = self
            .name
            .clone()
            .ok_or(anyhow!("function name is not present"))?;
        let config = FunctionConfig {
            name,
            handler: self.handler.clone().unwrap_or_else(default_handler),
            code_path: self.code_path.clone().unwrap_or_default(),
            execution_mode: self.execution_mode.unwrap_or_default(),
            timeout: self.timeout.unwrap_or_else(default_timeout),
            memory: self.memory.clone().unwrap_or_else(default_memory),
            cpu: self.cpu.clone().unwrap_or_else(default_cpu),
            environment: self.environment.clone().unwrap_or_default(),
            min_instances: self.min_instances.unwrap_or_default(),
            max_instances: self.max_instances.unwrap_or_else(default_max_instances),
            network_access: self.network_access.unwrap_or_else(default_network_access),
            image: self.image.clone().flatten(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12, &INSTANCE_ID_ALPHABET))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of an instance. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Ready,
    Busy,
    Draining,
    Terminated,
}

impl InstanceState {
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Provisioning, Ready) |
                (Provisioning, Busy) |
                (Provisioning, Draining) |
                (Ready, Busy) |
                (Ready, Draining) |
                (Busy, Ready) |
                (Busy, Draining) |
                (Draining, Terminated)
        )
    }

    /// Whether the instance still holds a slot against its function's limit.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstanceState::Provisioning | InstanceState::Ready | InstanceState::Busy
        )
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub function: String,
    pub state: InstanceState,
    pub backend: ExecutionMode,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub invocations: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionStats {
    pub function: String,
    pub ready_count: usize,
    pub busy_count: usize,
    pub provisioning_count: usize,
    pub draining_count: usize,
    pub queued: usize,
    pub cold_starts: u64,
    pub cold_start_failures: u64,
    pub invocations: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub evictions: u64,
}

/// An invocation as seen by the handler.
///
/// Header names are stored lowercase so lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RuntimeRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).context("request body is not valid utf-8")
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("request body is not valid json")
    }
}

/// Whatever the handler produced, with the status and content type the
/// runtime reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RuntimeResponse {
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: serde_json::to_vec(value)?.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).context("response body is not valid utf-8")
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("response body is not valid json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::mock_function_config;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("256Mi").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory("512ki").unwrap(), 512 * 1024);
        assert_eq!(parse_memory("1.5Gi").unwrap(), 3 * (1 << 29));
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert!(parse_memory("12 parsecs").is_err());
        assert!(parse_memory("0Mi").is_err());
        assert!(parse_memory("").is_err());
    }

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("100m").unwrap(), 100);
        assert_eq!(parse_cpu("0.5").unwrap(), 500);
        assert_eq!(parse_cpu("2").unwrap(), 2000);
        assert!(parse_cpu("0m").is_err());
        assert!(parse_cpu("fast").is_err());
    }

    #[test]
    fn test_state_machine() {
        use InstanceState::*;

        assert!(Provisioning.can_transition_to(Busy));
        assert!(Provisioning.can_transition_to(Draining));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(Draining.can_transition_to(Terminated));

        assert!(!Ready.can_transition_to(Terminated));
        assert!(!Draining.can_transition_to(Ready));
        assert!(!Busy.can_transition_to(Provisioning));
        for next in [Provisioning, Ready, Busy, Draining, Terminated] {
            assert!(!Terminated.can_transition_to(next));
        }

        assert!(Busy.is_active());
        assert!(!Draining.is_active());
    }

    #[test]
    fn test_function_config_defaults_from_json() {
        let config: FunctionConfig =
            serde_json::from_str(r#"{"name": "hello", "code_path": "/srv/hello.py"}"#).unwrap();
        assert_eq!(config.handler, "handle");
        assert_eq!(config.execution_mode, ExecutionMode::Process);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_instances, 10);
        assert!(config.network_access);
        assert_eq!(
            config.limits().unwrap(),
            ResourceLimits {
                memory_bytes: 256 * 1024 * 1024,
                cpu_millicores: 100,
            }
        );

        let config: FunctionConfig = serde_json::from_str(
            r#"{"name": "slow", "execution_mode": "container", "timeout": 0.25}"#,
        )
        .unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Container);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_function_config_validation() {
        assert!(FunctionConfigBuilder::default().build().is_err());
        assert!(FunctionConfigBuilder::default()
            .name("has space".to_string())
            .build()
            .is_err());
        assert!(FunctionConfigBuilder::default()
            .name("f".to_string())
            .min_instances(3)
            .max_instances(2)
            .build()
            .is_err());
        assert!(FunctionConfigBuilder::default()
            .name("f".to_string())
            .max_instances(0)
            .build()
            .is_err());
        assert!(FunctionConfigBuilder::default()
            .name("f".to_string())
            .memory("lots".to_string())
            .build()
            .is_err());

        let config = mock_function_config("f", 1, 2);
        assert_eq!(config.min_instances, 1);
        assert_eq!(config.max_instances, 2);
    }

    #[test]
    fn test_request_accessors() {
        let request = RuntimeRequest::new("POST", "/")
            .with_header("Content-Type", "application/json")
            .with_query("verbose", "1")
            .with_body(r#"{"n": 3}"#);

        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(request.header("x-missing"), None);
        let body: serde_json::Value = request.json().unwrap();
        assert_eq!(body["n"], 3);
        assert_eq!(request.text().unwrap(), r#"{"n": 3}"#);

        let response = RuntimeResponse::from_json(&serde_json::json!({"ok": true})).unwrap();
        assert!(response.is_success());
        assert_eq!(response.json::<serde_json::Value>().unwrap()["ok"], true);
    }
}
