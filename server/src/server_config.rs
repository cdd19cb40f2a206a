use config::Config;
use lazy_static::lazy_static;
use serde::Deserialize;
use std::{env, path::Path, time::Duration};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub folder: String,
    #[serde(default)]
    pub account: Option<String>,
    pub lookback_days: i64,
    pub auth_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub idle_timeout_secs: u64,
}

impl MailboxConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".to_string(),
            port: 993,
            folder: "INBOX".to_string(),
            account: None,
            lookback_days: 30,
            auth_timeout_secs: 30,
            reconnect_delay_secs: 5,
            idle_timeout_secs: 29 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleLimits {
    pub max_submissions: usize,
    pub window_secs: u64,
    pub burst: usize,
    pub backoff_secs: u64,
}

impl Default for OracleLimits {
    fn default() -> Self {
        Self {
            max_submissions: 100,
            window_secs: 60,
            burst: 10,
            backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub endpoint: String,
    pub model_id: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub batch_size: usize,
    pub max_attempts: usize,
    pub rate_limit_backoff_secs: u64,
    pub error_retry_delay_ms: u64,
    pub default_confidence: f32,
    pub limits: OracleLimits,
}

impl OracleConfig {
    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }

    pub fn error_retry_delay(&self) -> Duration {
        Duration::from_millis(self.error_retry_delay_ms)
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            model_id: "llama-3.1-8b-instant".to_string(),
            temperature: 0.1,
            max_tokens: 1000,
            batch_size: 5,
            max_attempts: 2,
            rate_limit_backoff_secs: 3,
            error_retry_delay_ms: 2000,
            default_confidence: 0.9,
            limits: OracleLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub requeue_delay_secs: u64,
    pub status_interval_secs: u64,
}

impl PipelineConfig {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            requeue_delay_secs: 5,
            status_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    pub inter_record_delay_ms: u64,
    pub user_agent: String,
    pub source: String,
}

impl NotificationsConfig {
    pub fn inter_record_delay(&self) -> Duration {
        Duration::from_millis(self.inter_record_delay_ms)
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            inter_record_delay_ms: 500,
            user_agent: "inbox-triage-bot/1.0".to_string(),
            source: "inbox-triage".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Elastic,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub index: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    mailbox: MailboxConfig,
    oracle: OracleConfig,
    pipeline: PipelineConfig,
    notifications: NotificationsConfig,
    store: StoreConfig,
    server: HttpConfig,
}

/// Secrets and endpoints taken from the environment.
#[derive(Debug)]
pub struct Secrets {
    pub mail_user: String,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_refresh_token: Option<String>,
    pub static_access_token: Option<String>,
    pub oracle_api_key: Option<String>,
    pub elasticsearch_url: Url,
    pub slack_webhook_url: Option<Url>,
    pub webhook_url: Option<Url>,
    pub port: u16,
}

#[derive(Debug)]
pub struct ServerConfig {
    pub mailbox: MailboxConfig,
    pub oracle: OracleConfig,
    pub pipeline: PipelineConfig,
    pub notifications: NotificationsConfig,
    pub store: StoreConfig,
    pub server: HttpConfig,
    pub secrets: Secrets,
}

impl ServerConfig {
    /// Mailbox identity stamped on every record.
    pub fn account(&self) -> &str {
        self.mailbox
            .account
            .as_deref()
            .unwrap_or(&self.secrets.mail_user)
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\nMailbox: {:?}\n\nOracle: {} ({}), batch {} x{} attempts, limits {:?}\n\nPipeline: {:?}\n\nNotifications: {:?}\n\nStore: {:?}\n\nServer: {:?}",
            self.mailbox,
            self.oracle.model_id,
            self.oracle.endpoint,
            self.oracle.batch_size,
            self.oracle.max_attempts,
            self.oracle.limits,
            self.pipeline,
            self.notifications,
            self.store,
            self.server,
        )
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn optional_url(key: &str) -> Option<Url> {
    optional_env(key).map(|v| Url::parse(&v).unwrap_or_else(|_| panic!("{key} is invalid")))
}

lazy_static! {
    pub static ref cfg: ServerConfig = {
        let root = env::var("APP_DIR").unwrap_or_else(|_| {
            let dir =
                env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
            let dir = Path::new(&dir).parent().unwrap().display().to_string();
            format!("{}/config", dir)
        });
        let path = format!("{root}/config.toml");
        let cfg_file: ConfigFile = Config::builder()
            .add_source(config::File::with_name(&path))
            .build()
            .expect("config.toml is required")
            .try_deserialize()
            .expect("config.toml is invalid");

        let ConfigFile {
            mailbox,
            oracle,
            pipeline,
            notifications,
            store,
            server,
        } = cfg_file;

        let secrets = Secrets {
            mail_user: env::var("MAIL_USER").expect("MAIL_USER is required"),
            google_client_id: optional_env("GOOGLE_CLIENT_ID"),
            google_client_secret: optional_env("GOOGLE_CLIENT_SECRET"),
            google_refresh_token: optional_env("GOOGLE_REFRESH_TOKEN"),
            static_access_token: optional_env("MAIL_ACCESS_TOKEN"),
            oracle_api_key: optional_env("ORACLE_API_KEY"),
            elasticsearch_url: Url::parse(
                &env::var("ELASTICSEARCH_URL").unwrap_or_else(|_| "http://localhost:9200".to_string()),
            )
            .expect("ELASTICSEARCH_URL is invalid"),
            slack_webhook_url: optional_url("SLACK_WEBHOOK_URL"),
            webhook_url: optional_url("WEBHOOK_URL"),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5000),
        };

        ServerConfig {
            mailbox,
            oracle,
            pipeline,
            notifications,
            store,
            server,
            secrets,
        }
    };
}
