//! Relay configuration loader.
//!
//! Defaults, then an optional TOML file, then environment variables. The
//! result is validated once and shared read-only for the process lifetime.

use ig_assistant::PollPolicy;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub instagram: InstagramConfig,
    #[serde(default)]
    pub replies: RepliesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for a whole request, including every assistant run it triggers.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_http_timeout_seconds() -> u64 {
    900
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret echoed back by the platform during the subscribe handshake.
    #[serde(default)]
    pub verify_token: String,
    /// App secret used to check `x-hub-signature-256`. Unset disables the check.
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Value of the payload `object` field that is processed.
    #[serde(default = "default_webhook_object")]
    pub object: String,
}

fn default_webhook_object() -> String {
    ig_channels::INSTAGRAM_WEBHOOK_OBJECT.to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            verify_token: String::new(),
            app_secret: None,
            object: default_webhook_object(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default = "default_assistant_base_url")]
    pub base_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_backoff_factor")]
    pub poll_backoff_factor: f64,
    /// Cap for backed-off poll delays. Defaults to `poll_interval_ms`.
    #[serde(default)]
    pub poll_max_interval_ms: Option<u64>,
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,
    #[serde(default = "default_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,
    /// Delete each thread once its reply has been extracted.
    #[serde(default = "default_delete_threads")]
    pub delete_threads: bool,
}

fn default_assistant_base_url() -> String {
    ig_assistant::DEFAULT_BASE_URL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    ig_assistant::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_poll_backoff_factor() -> f64 {
    1.0
}

fn default_poll_max_attempts() -> u32 {
    ig_assistant::DEFAULT_POLL_MAX_ATTEMPTS
}

fn default_poll_timeout_seconds() -> u64 {
    ig_assistant::DEFAULT_POLL_TIMEOUT.as_secs()
}

fn default_delete_threads() -> bool {
    true
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            assistant_id: String::new(),
            base_url: default_assistant_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_backoff_factor: default_poll_backoff_factor(),
            poll_max_interval_ms: None,
            poll_max_attempts: default_poll_max_attempts(),
            poll_timeout_seconds: default_poll_timeout_seconds(),
            delete_threads: default_delete_threads(),
        }
    }
}

impl AssistantConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        let interval = Duration::from_millis(self.poll_interval_ms);
        let max_interval = self
            .poll_max_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(interval);
        PollPolicy::fixed(interval, self.poll_max_attempts)
            .with_backoff(self.poll_backoff_factor, max_interval)
            .with_timeout(Duration::from_secs(self.poll_timeout_seconds))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstagramConfig {
    #[serde(default)]
    pub page_access_token: String,
    #[serde(default = "default_graph_api_base_url")]
    pub graph_api_base_url: String,
    #[serde(default = "default_graph_api_version")]
    pub graph_api_version: String,
}

fn default_graph_api_base_url() -> String {
    ig_channels::DEFAULT_GRAPH_API_BASE_URL.to_string()
}

fn default_graph_api_version() -> String {
    ig_channels::DEFAULT_GRAPH_API_VERSION.to_string()
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            page_access_token: String::new(),
            graph_api_base_url: default_graph_api_base_url(),
            graph_api_version: default_graph_api_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepliesConfig {
    /// Sent instead of the assistant reply when the run could not produce one.
    #[serde(default = "default_fallback_text")]
    pub fallback_text: String,
    /// Sent for messages without text (images, stickers, ...).
    #[serde(default = "default_non_text_text")]
    pub non_text_text: String,
}

fn default_fallback_text() -> String {
    "Sorry, I'm having trouble responding right now. Please try again in a moment.".to_string()
}

fn default_non_text_text() -> String {
    "Sorry, I can only process text messages right now.".to_string()
}

impl Default for RepliesConfig {
    fn default() -> Self {
        Self {
            fallback_text: default_fallback_text(),
            non_text_text: default_non_text_text(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::read_file(&path).await?,
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    async fn read_file(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`, treating blank values as unset.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PORT") {
            self.server.port = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("PORT={v:?} is not a valid port: {e}"))?;
        }
        if let Some(v) = get("WEBHOOK_VERIFY_TOKEN") {
            self.webhook.verify_token = v;
        }
        if let Some(v) = get("INSTAGRAM_APP_SECRET") {
            self.webhook.app_secret = Some(v);
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.assistant.api_key = v;
        }
        if let Some(v) = get("OPENAI_ASSISTANT_ID") {
            self.assistant.assistant_id = v;
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.assistant.base_url = v;
        }
        if let Some(v) = get("PAGE_ACCESS_TOKEN") {
            self.instagram.page_access_token = v;
        }
        if let Some(v) = get("GRAPH_API_BASE_URL") {
            self.instagram.graph_api_base_url = v;
        }
        if let Some(v) = get("GRAPH_API_VERSION") {
            self.instagram.graph_api_version = v;
        }
        Ok(())
    }

    /// Check every required value, reporting all missing ones at once.
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("WEBHOOK_VERIFY_TOKEN", &self.webhook.verify_token),
            ("OPENAI_API_KEY", &self.assistant.api_key),
            ("OPENAI_ASSISTANT_ID", &self.assistant.assistant_id),
            ("PAGE_ACCESS_TOKEN", &self.instagram.page_access_token),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        for name in &missing {
            tracing::error!(setting = %name, "required configuration value is missing");
        }
        if !missing.is_empty() {
            return Err(anyhow::anyhow!(
                "missing required configuration: {}",
                missing.join(", ")
            ));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.webhook.object.trim().is_empty() {
            return Err(anyhow::anyhow!("webhook.object must not be empty"));
        }
        if self.replies.fallback_text.trim().is_empty() {
            return Err(anyhow::anyhow!("replies.fallback_text must not be empty"));
        }
        if self.replies.non_text_text.trim().is_empty() {
            return Err(anyhow::anyhow!("replies.non_text_text must not be empty"));
        }
        self.assistant
            .poll_policy()
            .validate()
            .map_err(|e| anyhow::anyhow!("assistant poll settings: {e}"))?;
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.host {:?} is not an IP address: {e}", self.server.host))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn app_secret(&self) -> Option<&str> {
        self.webhook
            .app_secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::RelayConfig;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn complete_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("WEBHOOK_VERIFY_TOKEN", "verify-me"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_ASSISTANT_ID", "asst_1"),
            ("PAGE_ACCESS_TOKEN", "page-token"),
        ]
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.webhook.object, "instagram");
        assert!(cfg.assistant.delete_threads);
        let policy = cfg.assistant.poll_policy();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_factor, 1.0);
    }

    #[test]
    fn validate_reports_every_missing_value() {
        let cfg = RelayConfig::default();
        let err = cfg.validate().expect_err("missing values").to_string();
        for name in [
            "WEBHOOK_VERIFY_TOKEN",
            "OPENAI_API_KEY",
            "OPENAI_ASSISTANT_ID",
            "PAGE_ACCESS_TOKEN",
        ] {
            assert!(err.contains(name), "{err} should mention {name}");
        }
    }

    #[test]
    fn env_overrides_fill_required_values() {
        let mut cfg = RelayConfig::default();
        let mut env = complete_env();
        env.push(("PORT", "8080"));
        env.push(("INSTAGRAM_APP_SECRET", "app-secret"));
        cfg.apply_overrides_from(lookup(&env)).expect("overrides");
        cfg.validate().expect("valid config");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.webhook.verify_token, "verify-me");
        assert_eq!(cfg.app_secret(), Some("app-secret"));
        assert_eq!(cfg.bind_addr().expect("addr").to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn blank_env_values_are_ignored_and_bad_port_is_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.apply_overrides_from(lookup(&[("WEBHOOK_VERIFY_TOKEN", "   ")]))
            .expect("overrides");
        assert!(cfg.webhook.verify_token.is_empty());
        assert!(
            cfg.apply_overrides_from(lookup(&[("PORT", "not-a-port")]))
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_bad_poll_settings() {
        let mut cfg = RelayConfig::default();
        cfg.apply_overrides_from(lookup(&complete_env()))
            .expect("overrides");
        cfg.assistant.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn load_reads_toml_then_applies_env() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[server]
port = 4000

[webhook]
verify_token = "from-file"
object = "instagram"

[assistant]
api_key = "sk-file"
assistant_id = "asst_file"
poll_interval_ms = 500
poll_backoff_factor = 2.0
poll_max_interval_ms = 4000

[instagram]
page_access_token = "page-file"
graph_api_version = "v21.0"

[replies]
fallback_text = "try later"
"#
        )
        .expect("write config");

        let mut cfg = RelayConfig::read_file(file.path()).await.expect("read");
        cfg.apply_overrides_from(lookup(&[("OPENAI_ASSISTANT_ID", "asst_env")]))
            .expect("overrides");
        cfg.validate().expect("valid");

        assert_eq!(cfg.server.port, 4000);
        assert_eq!(cfg.webhook.verify_token, "from-file");
        assert_eq!(cfg.assistant.assistant_id, "asst_env");
        assert_eq!(cfg.instagram.graph_api_version, "v21.0");
        assert_eq!(cfg.replies.fallback_text, "try later");
        assert_eq!(
            cfg.replies.non_text_text,
            "Sorry, I can only process text messages right now."
        );
        let policy = cfg.assistant.poll_policy();
        assert_eq!(policy.interval, Duration::from_millis(500));
        assert_eq!(policy.max_interval, Duration::from_millis(4000));
    }
}
