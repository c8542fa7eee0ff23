use crate::config::{KeyEventMode, PhoneConfig};
use crate::error::{Error, Result};
use crate::keyevent::{self, KeyEventToken};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub mod provision;

pub use provision::{ActionUrlProvisioner, ProvisionReport};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Firmware-defined shape of the phone's remote-control requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandProfile {
    pub version: String,
    pub command_path: String,
    pub key_param: String,
    pub number_param: String,
    pub hangup_key: String,
    pub line_key_prefix: String,
    pub hangup_all_flag: String,
    pub settings_path: String,
    pub settings_save: String,
    /// `{event}` is replaced with the event name.
    pub action_setting_pattern: String,
    pub status_path: String,
}

impl Default for CommandProfile {
    fn default() -> Self {
        Self {
            version: "snom-v1".to_string(),
            command_path: "/command.htm".to_string(),
            key_param: "key".to_string(),
            number_param: "number".to_string(),
            hangup_key: "CANCEL".to_string(),
            line_key_prefix: "LINE".to_string(),
            hangup_all_flag: "RELEASE_ALL_CALLS".to_string(),
            settings_path: "/dummy.htm".to_string(),
            settings_save: "settings=save".to_string(),
            action_setting_pattern: "action_{event}_url".to_string(),
            status_path: "/".to_string(),
        }
    }
}

impl CommandProfile {
    pub fn action_setting(&self, event: &str) -> String {
        self.action_setting_pattern.replace("{event}", event)
    }
}

pub struct PhoneControlClient {
    scheme: String,
    profile: CommandProfile,
    mode: KeyEventMode,
    inter_key_delay: Option<Duration>,
    client: reqwest::Client,
}

impl PhoneControlClient {
    pub fn new(config: &PhoneConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(5000));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Unreachable(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            scheme: config.scheme.clone(),
            profile: config.profile.clone(),
            mode: config.key_event_mode,
            inter_key_delay: config.inter_key_delay_ms.map(Duration::from_millis),
            client,
        })
    }

    pub fn profile(&self) -> &CommandProfile {
        &self.profile
    }

    /// Runs a compiled key-event program. A failing key stops the program;
    /// keys already sent are not retried.
    pub async fn dial(&self, credentials: &Credentials, tokens: &[KeyEventToken]) -> Result<()> {
        if tokens.is_empty() {
            debug!("empty key sequence, nothing to send");
            return Ok(());
        }
        match self.mode {
            KeyEventMode::Batch => {
                let program = keyevent::render(tokens);
                let params = [(self.profile.key_param.as_str(), Some(program.as_str()))];
                self.command(credentials, &params).await
            }
            KeyEventMode::PerKey => {
                for (idx, token) in tokens.iter().enumerate() {
                    let key = token.press_form();
                    let params = [(self.profile.key_param.as_str(), Some(key.as_str()))];
                    self.command(credentials, &params).await?;
                    if idx + 1 < tokens.len() {
                        let delay = token
                            .inter_key_delay_ms
                            .map(|ms| Duration::from_millis(ms as u64))
                            .or(self.inter_key_delay);
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn dial_number(&self, credentials: &Credentials, number: &str) -> Result<()> {
        let number = number.trim();
        self.command(credentials, &[(self.profile.number_param.as_str(), Some(number))])
            .await
    }

    pub async fn hangup(&self, credentials: &Credentials, line: Option<u8>) -> Result<()> {
        if let Some(line) = line {
            let line_key = format!("{}{}", self.profile.line_key_prefix, line);
            let params = [(self.profile.key_param.as_str(), Some(line_key.as_str()))];
            self.command(credentials, &params).await?;
        }
        self.command(
            credentials,
            &[(
                self.profile.key_param.as_str(),
                Some(self.profile.hangup_key.as_str()),
            )],
        )
        .await
    }

    pub async fn hangup_all(&self, credentials: &Credentials) -> Result<()> {
        self.command(credentials, &[(self.profile.hangup_all_flag.as_str(), None)])
            .await
    }

    pub async fn test_connection(&self, credentials: &Credentials) -> Result<()> {
        self.send(credentials, &self.profile.status_path, &[]).await?;
        info!(host = %credentials.host, "phone connection ok");
        Ok(())
    }

    pub async fn save_setting(
        &self,
        credentials: &Credentials,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let mut params: Vec<(&str, Option<&str>)> = Vec::new();
        let save = self.profile.settings_save.split_once('=');
        match save {
            Some((k, v)) => params.push((k, Some(v))),
            None if !self.profile.settings_save.is_empty() => {
                params.push((self.profile.settings_save.as_str(), None))
            }
            None => {}
        }
        params.push((name, Some(value)));
        self.send(credentials, &self.profile.settings_path, &params)
            .await
    }

    async fn command(
        &self,
        credentials: &Credentials,
        params: &[(&str, Option<&str>)],
    ) -> Result<()> {
        self.send(credentials, &self.profile.command_path, params)
            .await
    }

    pub(crate) fn build_url(
        &self,
        host: &str,
        path: &str,
        params: &[(&str, Option<&str>)],
    ) -> String {
        let mut url = format!("{}://{}{}", self.scheme, host.trim_end_matches('/'), path);
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(name, value)| match value {
                    Some(v) => format!("{}={}", name, urlencoding::encode(v)),
                    None => name.to_string(),
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    async fn send(
        &self,
        credentials: &Credentials,
        path: &str,
        params: &[(&str, Option<&str>)],
    ) -> Result<()> {
        let url = self.build_url(&credentials.host, path, params);
        let start = Instant::now();
        let response = self
            .client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(|e| {
                warn!(
                    host = %credentials.host,
                    %path,
                    elapsed_ms = start.elapsed().as_millis(),
                    "phone request failed: {}",
                    e
                );
                Error::Unreachable(e.to_string())
            })?;

        let status = response.status();
        debug!(
            host = %credentials.host,
            %path,
            %status,
            elapsed_ms = start.elapsed().as_millis(),
            "phone request done"
        );
        check_status(status)
    }
}

fn check_status(status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::AuthenticationFailed(status.as_u16()))
        }
        _ => Err(Error::Unreachable(format!("phone answered {}", status))),
    }
}
