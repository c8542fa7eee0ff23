use crate::phone::{CommandProfile, Credentials};
use crate::port_allocator::DEFAULT_MAX_ATTEMPTS;
use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub phone: PhoneConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub actions: HashMap<String, ActionRuleConfig>,
    #[serde(default)]
    pub hotkeys: HotkeyConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEventMode {
    /// One request per key, client-side delays between them.
    #[default]
    PerKey,
    /// Whole program in a single request, timing left to the phone.
    Batch,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhoneConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub key_event_mode: KeyEventMode,
    pub inter_key_delay_ms: Option<u64>,
    #[serde(default)]
    pub profile: CommandProfile,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Host the phone should call back; detected from the route to the
    /// phone when unset.
    pub advertise_host: Option<String>,
    pub max_port_attempts: u16,
    pub dispatch_workers: usize,
    pub dispatch_queue: usize,
    pub action_timeout_ms: u64,
    pub provision: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionRuleConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub browser: bool,
}

/// Key bindings for the desktop shell; stored here, registered elsewhere.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotkeyConfig {
    pub show_window: String,
    pub hangup: String,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 18080,
            advertise_host: None,
            max_port_attempts: DEFAULT_MAX_ATTEMPTS,
            dispatch_workers: 4,
            dispatch_queue: 64,
            action_timeout_ms: 5000,
            provision: true,
        }
    }
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            show_window: "<ctrl>+<alt>+s".to_string(),
            hangup: "<ctrl>+<alt>+x".to_string(),
        }
    }
}

impl PhoneConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            host: self.host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| anyhow::anyhow!("{}: {}", e, path.as_ref().display()))?;
        Ok(())
    }

    /// Starting point written when no configuration file exists yet.
    pub fn template() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            phone: PhoneConfig {
                host: "192.168.188.221".to_string(),
                username: "admin".to_string(),
                password: "tester".to_string(),
                scheme: default_scheme(),
                accept_invalid_certs: true,
                timeout_ms: Some(5000),
                key_event_mode: KeyEventMode::PerKey,
                inter_key_delay_ms: None,
                profile: CommandProfile::default(),
            },
            callback: CallbackConfig::default(),
            actions: HashMap::new(),
            hotkeys: HotkeyConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(
            r#"
            [phone]
            host = "10.0.0.20"
            username = "admin"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.phone.scheme, "https");
        assert!(config.phone.accept_invalid_certs);
        assert_eq!(config.phone.key_event_mode, KeyEventMode::PerKey);
        assert_eq!(config.phone.profile.command_path, "/command.htm");
        assert_eq!(config.callback.port, 18080);
        assert_eq!(config.callback.max_port_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(config.actions.is_empty());
        assert_eq!(config.hotkeys.hangup, "<ctrl>+<alt>+x");
    }

    #[test]
    fn test_actions_and_overrides() {
        let config: Config = toml::from_str(
            r#"
            log_level = "debug"

            [phone]
            host = "10.0.0.20:8443"
            username = "admin"
            password = "secret"
            scheme = "http"
            key_event_mode = "batch"

            [phone.profile]
            version = "custom"
            hangup_key = "X"

            [callback]
            port = 9000
            advertise_host = "10.0.0.2"

            [actions.incoming]
            url = "https://crm.example/search?num={remote}"
            browser = true

            [actions.disconnected]
            url = "http://hooks.local/end?id={call_id}"
            "#,
        )
        .unwrap();

        assert_eq!(config.phone.key_event_mode, KeyEventMode::Batch);
        assert_eq!(config.phone.profile.version, "custom");
        assert_eq!(config.phone.profile.hangup_key, "X");
        assert_eq!(config.phone.profile.number_param, "number");
        assert_eq!(config.callback.port, 9000);
        assert_eq!(config.callback.dispatch_workers, 4);
        assert!(config.actions["incoming"].browser);
        assert!(!config.actions["disconnected"].browser);
    }

    #[test]
    fn test_save_persists_bound_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snomdialer.toml");

        let mut config = Config::template();
        config.actions.insert(
            "connected".to_string(),
            ActionRuleConfig {
                url: "http://x/{remote}".to_string(),
                browser: false,
            },
        );
        config.callback.port = 18081;
        config.save(&path).unwrap();

        let loaded = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.callback.port, 18081);
        assert_eq!(loaded.phone.host, "192.168.188.221");
        assert_eq!(loaded.actions["connected"].url, "http://x/{remote}");
    }
}
