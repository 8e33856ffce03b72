//! Layered settings: built-in defaults, then `.env` file, then process
//! environment.
//!
//! The `.env` file lives in the working directory when present, otherwise
//! the nearest ancestor that has one. Reload is explicit, and updates are
//! merged back into the file in place so operator comments and ordering
//! survive.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reportstore::Engine;
use serde::Serialize;
use tracing::{debug, warn};

/// Error raised for unusable configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing credentials for {0}: set {1} in .env or the environment")]
    MissingCredentials(&'static str, &'static str),

    #[error("unrecognized config key: {0}")]
    UnknownKey(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Credentials and model selection for one LLM-backed role
#[derive(Debug, Clone, Serialize)]
pub struct LlmCredentials {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl LlmCredentials {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            api_key: None,
            base_url: base_url.to_string(),
            model: model.to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// One supervised engine child
#[derive(Debug, Clone, Serialize)]
pub struct EngineChildConfig {
    pub port: u16,
    /// Shell command used to launch the engine server
    pub command: String,
}

/// Global settings for the supervisor process
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    pub insight: LlmCredentials,
    pub media: LlmCredentials,
    pub query: LlmCredentials,
    pub report: LlmCredentials,
    pub forum_host: LlmCredentials,

    pub insight_child: EngineChildConfig,
    pub media_child: EngineChildConfig,
    pub query_child: EngineChildConfig,
    /// Optional idempotent migration command run before the engines start
    pub migrate_command: Option<String>,

    pub log_dir: PathBuf,
    pub insight_report_dir: PathBuf,
    pub media_report_dir: PathBuf,
    pub query_report_dir: PathBuf,
    pub final_reports_dir: PathBuf,
    pub template_dir: PathBuf,
    pub json_error_log_dir: PathBuf,
    pub baseline_file: PathBuf,

    pub chapter_json_max_attempts: u32,
    pub structural_retry_attempts: u32,
    pub enable_llm_repair: bool,

    pub llm_timeout: Duration,
    pub health_probe_timeout: Duration,
    pub child_stop_grace: Duration,
    pub shutdown_cleanup_timeout: Duration,
    pub sse_heartbeat_interval: Duration,
    pub sse_idle_timeout: Duration,

    pub host_speech_threshold: usize,
    pub forum_idle_ticks_limit: u64,
    pub task_registry_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,

            insight: LlmCredentials::new("https://api.moonshot.cn/v1", "kimi-k2-0711-preview"),
            media: LlmCredentials::new("https://aihubmix.com/v1", "gemini-2.5-pro"),
            query: LlmCredentials::new("https://api.deepseek.com", "deepseek-chat"),
            report: LlmCredentials::new("https://aihubmix.com/v1", "gemini-2.5-pro"),
            forum_host: LlmCredentials::new("https://api.deepseek.com", "deepseek-chat"),

            insight_child: EngineChildConfig {
                port: 8501,
                command: "streamlit run SingleEngineApp/insight_engine_streamlit_app.py --server.port 8501".to_string(),
            },
            media_child: EngineChildConfig {
                port: 8502,
                command: "streamlit run SingleEngineApp/media_engine_streamlit_app.py --server.port 8502".to_string(),
            },
            query_child: EngineChildConfig {
                port: 8503,
                command: "streamlit run SingleEngineApp/query_engine_streamlit_app.py --server.port 8503".to_string(),
            },
            migrate_command: None,

            log_dir: PathBuf::from("logs"),
            insight_report_dir: PathBuf::from("insight_engine_streamlit_reports"),
            media_report_dir: PathBuf::from("media_engine_streamlit_reports"),
            query_report_dir: PathBuf::from("query_engine_streamlit_reports"),
            final_reports_dir: PathBuf::from("final_reports"),
            template_dir: PathBuf::from("templates"),
            json_error_log_dir: PathBuf::from("logs/json_repair_failures"),
            baseline_file: PathBuf::from("logs/report_baseline.json"),

            chapter_json_max_attempts: 3,
            structural_retry_attempts: 2,
            enable_llm_repair: false,

            llm_timeout: Duration::from_secs(900),
            health_probe_timeout: Duration::from_secs(30),
            child_stop_grace: Duration::from_secs(5),
            shutdown_cleanup_timeout: Duration::from_secs(6),
            sse_heartbeat_interval: Duration::from_secs(15),
            sse_idle_timeout: Duration::from_secs(120),

            host_speech_threshold: 5,
            forum_idle_ticks_limit: 7200,
            task_registry_capacity: 50,
        }
    }
}

/// Keys the config endpoints accept, in canonical order.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "HOST",
    "PORT",
    "INSIGHT_ENGINE_API_KEY",
    "INSIGHT_ENGINE_BASE_URL",
    "INSIGHT_ENGINE_MODEL_NAME",
    "MEDIA_ENGINE_API_KEY",
    "MEDIA_ENGINE_BASE_URL",
    "MEDIA_ENGINE_MODEL_NAME",
    "QUERY_ENGINE_API_KEY",
    "QUERY_ENGINE_BASE_URL",
    "QUERY_ENGINE_MODEL_NAME",
    "REPORT_ENGINE_API_KEY",
    "REPORT_ENGINE_BASE_URL",
    "REPORT_ENGINE_MODEL_NAME",
    "FORUM_HOST_API_KEY",
    "FORUM_HOST_BASE_URL",
    "FORUM_HOST_MODEL_NAME",
    "INSIGHT_ENGINE_PORT",
    "MEDIA_ENGINE_PORT",
    "QUERY_ENGINE_PORT",
    "INSIGHT_ENGINE_COMMAND",
    "MEDIA_ENGINE_COMMAND",
    "QUERY_ENGINE_COMMAND",
    "MIGRATE_COMMAND",
    "LOG_DIR",
    "INSIGHT_REPORT_DIR",
    "MEDIA_REPORT_DIR",
    "QUERY_REPORT_DIR",
    "FINAL_REPORTS_DIR",
    "TEMPLATE_DIR",
    "JSON_ERROR_LOG_DIR",
    "REPORT_BASELINE_FILE",
    "CHAPTER_JSON_MAX_ATTEMPTS",
    "STRUCTURAL_RETRY_ATTEMPTS",
    "ENABLE_LLM_REPAIR",
    "LLM_TIMEOUT_SECONDS",
    "HEALTH_PROBE_TIMEOUT_SECONDS",
    "CHILD_STOP_GRACE_SECONDS",
    "SHUTDOWN_CLEANUP_TIMEOUT_SECONDS",
    "SSE_HEARTBEAT_SECONDS",
    "SSE_IDLE_TIMEOUT_SECONDS",
    "HOST_SPEECH_THRESHOLD",
    "FORUM_IDLE_TICKS_LIMIT",
    "TASK_REGISTRY_CAPACITY",
];

impl Settings {
    /// Load settings: defaults, then the `.env` file, then process env.
    pub fn load() -> Self {
        let env_path = find_env_file();
        Self::load_from(env_path.as_deref())
    }

    /// Load with an explicit `.env` path (or none).
    pub fn load_from(env_path: Option<&Path>) -> Self {
        let mut values = BTreeMap::new();
        if let Some(path) = env_path {
            values.extend(parse_env_file(path));
            debug!(path = %path.display(), keys = values.len(), "loaded .env");
        }
        for key in RECOGNIZED_KEYS {
            if let Ok(value) = std::env::var(key) {
                values.insert((*key).to_string(), value);
            }
        }

        let mut settings = Self::default();
        settings.apply(&values);
        settings
    }

    /// Re-read the `.env` file and environment. Explicit by design.
    pub fn reload() -> Self {
        Self::load()
    }

    fn apply(&mut self, values: &BTreeMap<String, String>) {
        for (key, value) in values {
            match key.as_str() {
                "HOST" => self.host = value.clone(),
                "PORT" => apply_parsed(&mut self.port, key, value),
                "INSIGHT_ENGINE_API_KEY" => self.insight.api_key = non_empty(value),
                "INSIGHT_ENGINE_BASE_URL" => self.insight.base_url = value.clone(),
                "INSIGHT_ENGINE_MODEL_NAME" => self.insight.model = value.clone(),
                "MEDIA_ENGINE_API_KEY" => self.media.api_key = non_empty(value),
                "MEDIA_ENGINE_BASE_URL" => self.media.base_url = value.clone(),
                "MEDIA_ENGINE_MODEL_NAME" => self.media.model = value.clone(),
                "QUERY_ENGINE_API_KEY" => self.query.api_key = non_empty(value),
                "QUERY_ENGINE_BASE_URL" => self.query.base_url = value.clone(),
                "QUERY_ENGINE_MODEL_NAME" => self.query.model = value.clone(),
                "REPORT_ENGINE_API_KEY" => self.report.api_key = non_empty(value),
                "REPORT_ENGINE_BASE_URL" => self.report.base_url = value.clone(),
                "REPORT_ENGINE_MODEL_NAME" => self.report.model = value.clone(),
                "FORUM_HOST_API_KEY" => self.forum_host.api_key = non_empty(value),
                "FORUM_HOST_BASE_URL" => self.forum_host.base_url = value.clone(),
                "FORUM_HOST_MODEL_NAME" => self.forum_host.model = value.clone(),
                "INSIGHT_ENGINE_PORT" => apply_parsed(&mut self.insight_child.port, key, value),
                "MEDIA_ENGINE_PORT" => apply_parsed(&mut self.media_child.port, key, value),
                "QUERY_ENGINE_PORT" => apply_parsed(&mut self.query_child.port, key, value),
                "INSIGHT_ENGINE_COMMAND" => self.insight_child.command = value.clone(),
                "MEDIA_ENGINE_COMMAND" => self.media_child.command = value.clone(),
                "QUERY_ENGINE_COMMAND" => self.query_child.command = value.clone(),
                "MIGRATE_COMMAND" => self.migrate_command = non_empty(value),
                "LOG_DIR" => self.log_dir = PathBuf::from(value),
                "INSIGHT_REPORT_DIR" => self.insight_report_dir = PathBuf::from(value),
                "MEDIA_REPORT_DIR" => self.media_report_dir = PathBuf::from(value),
                "QUERY_REPORT_DIR" => self.query_report_dir = PathBuf::from(value),
                "FINAL_REPORTS_DIR" => self.final_reports_dir = PathBuf::from(value),
                "TEMPLATE_DIR" => self.template_dir = PathBuf::from(value),
                "JSON_ERROR_LOG_DIR" => self.json_error_log_dir = PathBuf::from(value),
                "REPORT_BASELINE_FILE" => self.baseline_file = PathBuf::from(value),
                "CHAPTER_JSON_MAX_ATTEMPTS" => {
                    apply_parsed(&mut self.chapter_json_max_attempts, key, value)
                }
                "STRUCTURAL_RETRY_ATTEMPTS" => {
                    apply_parsed(&mut self.structural_retry_attempts, key, value)
                }
                "ENABLE_LLM_REPAIR" => self.enable_llm_repair = parse_bool(value),
                "LLM_TIMEOUT_SECONDS" => apply_seconds(&mut self.llm_timeout, key, value),
                "HEALTH_PROBE_TIMEOUT_SECONDS" => {
                    apply_seconds(&mut self.health_probe_timeout, key, value)
                }
                "CHILD_STOP_GRACE_SECONDS" => apply_seconds(&mut self.child_stop_grace, key, value),
                "SHUTDOWN_CLEANUP_TIMEOUT_SECONDS" => {
                    apply_seconds(&mut self.shutdown_cleanup_timeout, key, value)
                }
                "SSE_HEARTBEAT_SECONDS" => {
                    apply_seconds(&mut self.sse_heartbeat_interval, key, value)
                }
                "SSE_IDLE_TIMEOUT_SECONDS" => apply_seconds(&mut self.sse_idle_timeout, key, value),
                "HOST_SPEECH_THRESHOLD" => apply_parsed(&mut self.host_speech_threshold, key, value),
                "FORUM_IDLE_TICKS_LIMIT" => {
                    apply_parsed(&mut self.forum_idle_ticks_limit, key, value)
                }
                "TASK_REGISTRY_CAPACITY" => {
                    apply_parsed(&mut self.task_registry_capacity, key, value)
                }
                other => debug!(key = other, "ignoring unrecognized key"),
            }
        }
    }

    pub fn forum_log_path(&self) -> PathBuf {
        self.log_dir.join("forum.log")
    }

    pub fn engine_log_path(&self, engine: Engine) -> PathBuf {
        self.log_dir.join(format!("{engine}.log"))
    }

    pub fn report_log_path(&self) -> PathBuf {
        self.log_dir.join("report.log")
    }

    pub fn chapters_dir(&self) -> PathBuf {
        self.final_reports_dir.join("chapters")
    }

    pub fn ir_dir(&self) -> PathBuf {
        self.final_reports_dir.join("document_ir")
    }

    /// Artifact directory per engine, for baseline bookkeeping.
    pub fn report_dirs(&self) -> BTreeMap<Engine, PathBuf> {
        BTreeMap::from([
            (Engine::Insight, self.insight_report_dir.clone()),
            (Engine::Media, self.media_report_dir.clone()),
            (Engine::Query, self.query_report_dir.clone()),
        ])
    }

    pub fn engine_credentials(&self, engine: Engine) -> &LlmCredentials {
        match engine {
            Engine::Insight => &self.insight,
            Engine::Media => &self.media,
            Engine::Query => &self.query,
        }
    }

    /// Current values for the config endpoint. API keys are masked; only
    /// their presence is reported.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("HOST".into(), self.host.clone());
        map.insert("PORT".into(), self.port.to_string());
        for (prefix, creds) in [
            ("INSIGHT_ENGINE", &self.insight),
            ("MEDIA_ENGINE", &self.media),
            ("QUERY_ENGINE", &self.query),
            ("REPORT_ENGINE", &self.report),
            ("FORUM_HOST", &self.forum_host),
        ] {
            map.insert(
                format!("{prefix}_API_KEY"),
                if creds.is_configured() { "***".into() } else { String::new() },
            );
            map.insert(format!("{prefix}_BASE_URL"), creds.base_url.clone());
            map.insert(format!("{prefix}_MODEL_NAME"), creds.model.clone());
        }
        map.insert(
            "CHAPTER_JSON_MAX_ATTEMPTS".into(),
            self.chapter_json_max_attempts.to_string(),
        );
        map.insert(
            "STRUCTURAL_RETRY_ATTEMPTS".into(),
            self.structural_retry_attempts.to_string(),
        );
        map.insert("ENABLE_LLM_REPAIR".into(), format_bool(self.enable_llm_repair));
        map.insert("HOST_SPEECH_THRESHOLD".into(), self.host_speech_threshold.to_string());
        map.insert(
            "FORUM_IDLE_TICKS_LIMIT".into(),
            self.forum_idle_ticks_limit.to_string(),
        );
        map.insert("LOG_DIR".into(), self.log_dir.display().to_string());
        map.insert(
            "FINAL_REPORTS_DIR".into(),
            self.final_reports_dir.display().to_string(),
        );
        map.insert("TEMPLATE_DIR".into(), self.template_dir.display().to_string());
        map
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn apply_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "could not parse value, keeping default"),
    }
}

fn apply_seconds(slot: &mut Duration, key: &str, value: &str) {
    match value.trim().parse::<u64>() {
        Ok(secs) => *slot = Duration::from_secs(secs),
        Err(_) => warn!(key, value, "could not parse seconds, keeping default"),
    }
}

/// Booleans as persisted in `.env` files: `True` / `False`.
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

pub fn format_bool(value: bool) -> String {
    if value { "True".to_string() } else { "False".to_string() }
}

/// Prefer `.env` in the working directory, otherwise walk up to the
/// nearest ancestor that has one.
pub fn find_env_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: Option<&Path> = Some(cwd.as_path());
    while let Some(current) = dir {
        let candidate = current.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}

/// Parse a `.env` file into key/value pairs. Unreadable files yield an
/// empty map; a missing config file is not an error.
pub fn parse_env_file(path: &Path) -> BTreeMap<String, String> {
    let Ok(text) = fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        values.insert(key.trim().to_string(), unquote(value.trim()).to_string());
    }
    values
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.contains(char::is_whitespace) || value.contains('#') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Merge key/value updates into the `.env` file: update matching lines in
/// place, append new keys at the end, keep comments and ordering intact.
pub fn persist_updates(
    path: &Path,
    updates: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    for key in updates.keys() {
        if !RECOGNIZED_KEYS.contains(&key.as_str()) {
            return Err(ConfigError::UnknownKey(key.clone()));
        }
    }

    let existing = fs::read_to_string(path).unwrap_or_default();
    let mut remaining = updates.clone();
    let mut lines: Vec<String> = Vec::new();

    for line in existing.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            if let Some((key, _)) = trimmed.split_once('=') {
                let key = key.trim();
                if let Some(value) = remaining.remove(key) {
                    lines.push(format!("{key}={}", quote_if_needed(&value)));
                    continue;
                }
            }
        }
        lines.push(line.to_string());
    }

    for (key, value) in remaining {
        lines.push(format!("{key}={}", quote_if_needed(&value)));
    }

    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(path, body).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
