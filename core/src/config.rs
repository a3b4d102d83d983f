//! Global config singleton. Loaded once from `settings.json` (if present)
//! and overridable by environment variables; whichever caller hits
//! `ensure_loaded()` first does the work, everyone else gets the same
//! instance.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    pub sm_host: String,
    pub sm_port: u16,
    pub gw_host: String,
    pub gw_port: u16,
    pub registry_path: PathBuf,
    pub scrollback_capacity: usize,
    pub mux_session_prefix: String,
    pub jwt_secret: String,
    pub sm_upstream_url: String,
}

/// Ensure config is loaded (idempotent). Reads `settings.json` next to the
/// process's working directory on first call, then layers environment
/// variables on top; returns the same instance on every subsequent call.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| load_from(&PathBuf::from("settings.json")))
}

fn load_from(path: &std::path::Path) -> Config {
    let root: serde_json::Value = std::fs::read_to_string(path)
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or(serde_json::Value::Null);

    let str_field = |json_key: &str, env_key: &str, default: &str| -> String {
        std::env::var(env_key).ok().unwrap_or_else(|| {
            root.get(json_key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| default.to_string())
        })
    };
    let u16_field = |json_key: &str, env_key: &str, default: u16| -> u16 {
        std::env::var(env_key)
            .ok()
            .and_then(|v| v.parse().ok())
            .or_else(|| root.get(json_key).and_then(|v| v.as_u64()).map(|v| v as u16))
            .unwrap_or(default)
    };

    let registry_path = std::env::var("REGISTRY_PATH")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            root.get("registry_path")
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_registry_path);

    let scrollback_capacity = std::env::var("SCROLLBACK_CAPACITY")
        .ok()
        .and_then(|v| v.parse().ok())
        .or_else(|| {
            root.get("scrollback_capacity")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
        })
        .unwrap_or(10_000);

    Config {
        sm_host: str_field("host", "SM_HOST", "127.0.0.1"),
        sm_port: u16_field("port", "SM_PORT", 4096),
        gw_host: str_field("host", "GW_HOST", "127.0.0.1"),
        gw_port: u16_field("port", "GW_PORT", 4097),
        registry_path,
        scrollback_capacity,
        mux_session_prefix: str_field("mux_session_prefix", "MUX_SESSION_PREFIX", "tf-"),
        jwt_secret: str_field("jwt_secret", "GW_JWT_SECRET", "dev-insecure-secret"),
        sm_upstream_url: str_field("sm_url", "SM_UPSTREAM_URL", "http://127.0.0.1:4096"),
    }
}

fn default_registry_path() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("termfabric").join("registry.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_settings_file() {
        let cfg = load_from(std::path::Path::new("/nonexistent/settings.json"));
        assert_eq!(cfg.sm_port, 4096);
        assert_eq!(cfg.scrollback_capacity, 10_000);
        assert_eq!(cfg.mux_session_prefix, "tf-");
    }
}
