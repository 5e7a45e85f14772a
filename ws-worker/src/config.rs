use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use ws_orchestrator::ProvisionSettings;
use ws_provider::PollPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Without a broker URL jobs live in process memory.
    #[serde(default = "default_redis_url")]
    pub redis_url: Option<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Upper bound on waiting for one provider operation.
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,

    #[serde(default = "default_cloud_api_url")]
    pub cloud_api_url: String,

    #[serde(default = "default_cloud_api_token")]
    pub cloud_api_token: Option<String>,

    #[serde(default = "default_mesh_api_url")]
    pub mesh_api_url: String,

    #[serde(default = "default_mesh_api_key")]
    pub mesh_api_key: Option<String>,

    #[serde(default = "default_mesh_tailnet")]
    pub mesh_tailnet: String,

    #[serde(default = "default_server_type")]
    pub server_type: String,

    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_callback_url")]
    pub callback_url: Option<String>,

    /// Base64 AES-256 key for stored credentials.
    #[serde(default = "default_credential_key")]
    pub credential_key: Option<String>,

    #[serde(default = "default_metering_url")]
    pub metering_url: Option<String>,

    #[serde(default = "default_metering_api_key")]
    pub metering_api_key: Option<String>,

    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: i64,

    #[serde(default = "default_sync_max_attempts")]
    pub sync_max_attempts: i64,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_db_path() -> PathBuf {
    if let Some(path) = env_opt("WS_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ws").join("ws.db")
}

fn default_redis_url() -> Option<String> {
    env_opt("WS_REDIS_URL")
}

fn default_poll_interval() -> u64 {
    env_parse("WS_POLL_INTERVAL_MS", 1000)
}

fn default_max_attempts() -> u32 {
    env_parse("WS_MAX_ATTEMPTS", 3)
}

fn default_stale_after() -> u64 {
    env_parse("WS_STALE_AFTER_SECS", 30 * 60)
}

fn default_reaper_interval() -> u64 {
    env_parse("WS_REAPER_INTERVAL_SECS", 60)
}

fn default_op_timeout() -> u64 {
    env_parse("WS_OP_TIMEOUT_SECS", 5 * 60)
}

fn default_cloud_api_url() -> String {
    env_opt("WS_CLOUD_API_URL").unwrap_or_else(|| "https://api.hetzner.cloud/v1".to_string())
}

fn default_cloud_api_token() -> Option<String> {
    env_opt("WS_CLOUD_API_TOKEN")
}

fn default_mesh_api_url() -> String {
    env_opt("WS_MESH_API_URL").unwrap_or_else(|| "https://api.tailscale.com/api/v2".to_string())
}

fn default_mesh_api_key() -> Option<String> {
    env_opt("WS_MESH_API_KEY")
}

fn default_mesh_tailnet() -> String {
    env_opt("WS_MESH_TAILNET").unwrap_or_else(|| "-".to_string())
}

fn default_server_type() -> String {
    env_opt("WS_SERVER_TYPE").unwrap_or_else(|| ProvisionSettings::default().server_type)
}

fn default_location() -> String {
    env_opt("WS_LOCATION").unwrap_or_else(|| ProvisionSettings::default().location)
}

fn default_image() -> String {
    env_opt("WS_IMAGE").unwrap_or_else(|| ProvisionSettings::default().image)
}

fn default_callback_url() -> Option<String> {
    env_opt("WS_CALLBACK_URL")
}

fn default_credential_key() -> Option<String> {
    env_opt("WS_CREDENTIAL_KEY")
}

fn default_metering_url() -> Option<String> {
    env_opt("WS_METERING_URL")
}

fn default_metering_api_key() -> Option<String> {
    env_opt("WS_METERING_API_KEY")
}

fn default_sync_batch_size() -> i64 {
    env_parse("WS_SYNC_BATCH_SIZE", 100)
}

fn default_sync_max_attempts() -> i64 {
    env_parse("WS_SYNC_MAX_ATTEMPTS", 5)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            redis_url: default_redis_url(),
            poll_interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
            stale_after_secs: default_stale_after(),
            reaper_interval_secs: default_reaper_interval(),
            op_timeout_secs: default_op_timeout(),
            cloud_api_url: default_cloud_api_url(),
            cloud_api_token: default_cloud_api_token(),
            mesh_api_url: default_mesh_api_url(),
            mesh_api_key: default_mesh_api_key(),
            mesh_tailnet: default_mesh_tailnet(),
            server_type: default_server_type(),
            location: default_location(),
            image: default_image(),
            callback_url: default_callback_url(),
            credential_key: default_credential_key(),
            metering_url: default_metering_url(),
            metering_api_key: default_metering_api_key(),
            sync_batch_size: default_sync_batch_size(),
            sync_max_attempts: default_sync_max_attempts(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// How often a running job renews its reservation lease. Three renewals
    /// fit in one `stale_after` window.
    pub fn lease_heartbeat(&self) -> Duration {
        (self.stale_after() / 3).max(Duration::from_secs(1))
    }

    pub fn op_poll_policy(&self) -> PollPolicy {
        PollPolicy {
            timeout: Duration::from_secs(self.op_timeout_secs.max(1)),
            ..PollPolicy::default()
        }
    }

    pub fn provision_settings(&self) -> ProvisionSettings {
        ProvisionSettings {
            server_type: self.server_type.clone(),
            location: self.location.clone(),
            image: self.image.clone(),
            callback_url: self.callback_url.clone(),
            ..ProvisionSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_settings_carry_overrides() {
        let config = Config {
            server_type: "cx32".to_string(),
            callback_url: Some("https://example.test/capture".to_string()),
            ..Config::default()
        };

        let settings = config.provision_settings();
        assert_eq!(settings.server_type, "cx32");
        assert_eq!(
            settings.callback_url.as_deref(),
            Some("https://example.test/capture")
        );
        assert_eq!(settings.mount_path, "/workspace");
    }

    #[test]
    fn poll_interval_is_never_zero() {
        let config = Config {
            poll_interval_ms: 0,
            ..Config::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn lease_heartbeat_fits_inside_stale_window() {
        let config = Config {
            stale_after_secs: 1800,
            ..Config::default()
        };
        assert_eq!(config.lease_heartbeat(), Duration::from_secs(600));
        assert!(config.lease_heartbeat() < config.stale_after());

        let tight = Config {
            stale_after_secs: 1,
            ..Config::default()
        };
        assert_eq!(tight.lease_heartbeat(), Duration::from_secs(1));
    }

    #[test]
    fn op_poll_policy_uses_configured_timeout() {
        let config = Config {
            op_timeout_secs: 900,
            ..Config::default()
        };
        let policy = config.op_poll_policy();
        assert_eq!(policy.timeout, Duration::from_secs(900));
        assert_eq!(policy.initial_interval, PollPolicy::default().initial_interval);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(config.max_attempts, 7);
        assert!(config.sync_batch_size > 0);
        assert!(config.op_timeout_secs > 0);
    }
}
