//! Configuration loading and types (`spec.md` §6 "Configuration surface").
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Each subsection governs one component: the HTTP
//! listener, the static credential store, the backend registry/health
//! supervisor, per-operation routing policies, and the replication
//! executor's resource limits.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::model::HealthStateKind;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub replicator: ReplicatorConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout: u64,
    #[serde(default = "default_virtual_bucket")]
    pub virtual_bucket: String,
    #[serde(default)]
    pub use_mock: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            tls_cert_file: None,
            tls_key_file: None,
            read_timeout: default_timeout_secs(),
            write_timeout: default_timeout_secs(),
            virtual_bucket: default_virtual_bucket(),
            use_mock: false,
        }
    }
}

/// Static SigV4 credential store configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default = "default_auth_provider")]
    pub provider: String,
    #[serde(default, rename = "static")]
    pub static_users: StaticAuthConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StaticAuthConfig {
    #[serde(default)]
    pub users: Vec<StaticUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticUser {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub display_name: String,
}

/// Backend registry section: the health-supervisor tuning parameters plus
/// the map of individually configured backends.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendSection {
    #[serde(default)]
    pub manager: BackendManagerConfig,
    #[serde(default)]
    pub backends: HashMap<String, BackendEntryConfig>,
}

/// Backend Registry & Health Supervisor tuning (`spec.md` §4.1).
#[derive(Debug, Clone, Deserialize)]
pub struct BackendManagerConfig {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_circuit_breaker_window")]
    pub circuit_breaker_window: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_initial_state")]
    pub initial_state: String,
}

impl Default for BackendManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            check_timeout: default_check_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            circuit_breaker_window: default_circuit_breaker_window(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            initial_state: default_initial_state(),
        }
    }
}

impl BackendManagerConfig {
    /// Parse `initial_state` into a [`HealthStateKind`], defaulting to
    /// `Probing` for anything unrecognized (`spec.md` §4.1: "begins in the
    /// configured InitialState (normally PROBING)").
    pub fn initial_state_kind(&self) -> HealthStateKind {
        match self.initial_state.to_ascii_lowercase().as_str() {
            "up" => HealthStateKind::Up,
            "down" => HealthStateKind::Down,
            _ => HealthStateKind::Probing,
        }
    }

    /// Validate the `CheckTimeout < HealthCheckInterval` configuration
    /// invariant from `spec.md` §5.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_timeout >= self.health_check_interval {
            anyhow::bail!(
                "backend.manager.check_timeout ({}) must be strictly less than health_check_interval ({})",
                self.check_timeout,
                self.health_check_interval
            );
        }
        Ok(())
    }
}

/// One configured downstream backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntryConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Per-operation routing policies (`spec.md` §4.6/§6).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub policies: PoliciesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoliciesConfig {
    #[serde(default)]
    pub put: PutPolicyConfig,
    #[serde(default)]
    pub delete: DeletePolicyConfig,
    #[serde(default)]
    pub get: GetPolicyConfig,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            put: PutPolicyConfig::default(),
            delete: DeletePolicyConfig::default(),
            get: GetPolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PutPolicyConfig {
    #[serde(default = "default_ack_one")]
    pub ack: String,
}

impl Default for PutPolicyConfig {
    fn default() -> Self {
        Self { ack: default_ack_one() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeletePolicyConfig {
    /// `spec.md` §4.3 recommends `all` as the default for DeleteObject,
    /// since under `ack=one` a backend may silently retain a deleted
    /// object.
    #[serde(default = "default_ack_all")]
    pub ack: String,
}

impl Default for DeletePolicyConfig {
    fn default() -> Self {
        Self { ack: default_ack_all() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetPolicyConfig {
    #[serde(default = "default_strategy_first")]
    pub strategy: String,
}

impl Default for GetPolicyConfig {
    fn default() -> Self {
        Self { strategy: default_strategy_first() }
    }
}

/// Replication Executor and Multipart Coordinator resource limits
/// (`spec.md` §4.3/§4.5/§5/§6).
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default = "default_multipart_upload_ttl")]
    pub multipart_upload_ttl: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Per the Open Question resolution in `SPEC_FULL.md` §9: `ack=none`
    /// is rejected at load time unless this is explicitly set.
    #[serde(default)]
    pub allow_unsafe_ack_none: bool,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            multipart_upload_ttl: default_multipart_upload_ttl(),
            cleanup_interval: default_cleanup_interval(),
            max_concurrent_operations: default_max_concurrent_operations(),
            operation_timeout: default_operation_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            buffer_size: default_buffer_size(),
            allow_unsafe_ack_none: false,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_listen_address() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_virtual_bucket() -> String {
    "proxy".to_string()
}

fn default_auth_provider() -> String {
    "static".to_string()
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_check_timeout() -> u64 {
    3
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_circuit_breaker_window() -> u64 {
    60
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_initial_state() -> String {
    "probing".to_string()
}

fn default_ack_one() -> String {
    "one".to_string()
}

fn default_ack_all() -> String {
    "all".to_string()
}

fn default_strategy_first() -> String {
    "first".to_string()
}

fn default_multipart_upload_ttl() -> u64 {
    86400
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_concurrent_operations() -> usize {
    64
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    0
}

fn default_retry_delay() -> u64 {
    1
}

fn default_buffer_size() -> usize {
    64 * 1024
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`, validating the
/// cross-field invariants `spec.md` §5/§9 requires.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.backend.manager.validate()?;

    let reject_none = |ack: &str, field: &str| -> anyhow::Result<()> {
        if ack == "none" && !config.replicator.allow_unsafe_ack_none {
            anyhow::bail!(
                "{field} is configured as \"none\" but replicator.allow_unsafe_ack_none is not set; \
                 ack=none answers the client before writes complete and can silently drop data"
            );
        }
        Ok(())
    };
    reject_none(&config.routing.policies.put.ack, "routing.policies.put.ack")?;
    reject_none(&config.routing.policies.delete.ack, "routing.policies.delete.ack")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_check_timeout_invariant() {
        let cfg = BackendManagerConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_check_timeout_is_rejected() {
        let mut cfg = BackendManagerConfig::default();
        cfg.check_timeout = cfg.health_check_interval;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unrecognized_initial_state_defaults_to_probing() {
        let mut cfg = BackendManagerConfig::default();
        cfg.initial_state = "bogus".to_string();
        assert_eq!(cfg.initial_state_kind(), HealthStateKind::Probing);
    }
}
