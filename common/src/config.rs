use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub change: ChangeConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Poll a still image on disk.
    File,
    /// Read a live MJPEG stream from a network camera.
    Mjpeg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_mode")]
    pub mode: SourceMode,
    #[serde(default = "default_image_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// A live stream silent for this long is dropped and reconnected.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// First active hour (inclusive).
    #[serde(default)]
    pub active_start_hour: u32,
    /// End of the active window (exclusive). Equal to the start means always active.
    #[serde(default)]
    pub active_end_hour: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeConfig {
    /// Fraction of changed pixels above which a frame counts as a scene change.
    #[serde(default = "default_change_threshold")]
    pub threshold: f64,
    /// Per-pixel luma difference at or below which a pixel counts as unchanged.
    #[serde(default = "default_noise_floor")]
    pub noise_floor: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_analyzer_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_trigger_terms")]
    pub trigger_terms: Vec<String>,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_telegram_base_url")]
    pub base_url: String,
    #[serde(default = "default_telegram_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: default_source_mode(),
            path: default_image_path(),
            url: None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            active_start_hour: 0,
            active_end_hour: 0,
        }
    }
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            threshold: default_change_threshold(),
            noise_floor: default_noise_floor(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_analyzer_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_analyzer_timeout(),
            jpeg_quality: default_jpeg_quality(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            trigger_terms: default_trigger_terms(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            chat_id: String::new(),
            base_url: default_telegram_base_url(),
            timeout_secs: default_telegram_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load the file if it exists (defaults otherwise), apply environment
    /// overrides and validate. This is what the agent binary calls at start-up.
    pub fn from_sources(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Override file values with environment variables. `lookup` abstracts
    /// `std::env::var` so tests never touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(mode) = get("SOURCE_MODE") {
            self.source.mode = match mode.trim().to_ascii_lowercase().as_str() {
                "file" => SourceMode::File,
                "mjpeg" => SourceMode::Mjpeg,
                _ => return Err(ConfigError::invalid("SOURCE_MODE", &mode)),
            };
        }
        if let Some(path) = get("IMAGE_PATH") {
            self.source.path = PathBuf::from(path);
        }
        if let Some(url) = get("CAPTURE_DEVICE") {
            self.source.url = Some(url);
            if get("SOURCE_MODE").is_none() {
                self.source.mode = SourceMode::Mjpeg;
            }
        }
        if let Some(v) = get("CHECK_INTERVAL_SECONDS") {
            self.schedule.interval_secs = parse_env("CHECK_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = get("ACTIVE_HOURS_START") {
            self.schedule.active_start_hour = parse_env("ACTIVE_HOURS_START", &v)?;
        }
        if let Some(v) = get("ACTIVE_HOURS_END") {
            self.schedule.active_end_hour = parse_env("ACTIVE_HOURS_END", &v)?;
        }
        if let Some(v) = get("CHANGE_THRESHOLD") {
            self.change.threshold = parse_env("CHANGE_THRESHOLD", &v)?;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.analyzer.api_key = key;
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.analyzer.base_url = url;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.analyzer.model = model;
        }
        if let Some(prompt) = get("SYSTEM_PROMPT") {
            self.analyzer.system_prompt = prompt;
        }
        if let Some(terms) = lookup("TRIGGER_TERMS") {
            // An explicitly empty list is a valid (silent) configuration.
            self.alert.trigger_terms = terms.split(',').map(str::to_string).collect();
        }
        if let Some(token) = get("TELEGRAM_TOKEN") {
            self.telegram.token = token;
        }
        if let Some(chat_id) = get("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = chat_id;
        }
        Ok(())
    }

    /// Trim and lowercase trigger terms, dropping blanks and duplicates.
    pub fn normalize(&mut self) {
        let mut terms: Vec<String> = self
            .alert
            .trigger_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        terms.sort();
        terms.dedup();
        self.alert.trigger_terms = terms;
        self.analyzer.base_url = self.analyzer.base_url.trim_end_matches('/').to_string();
        self.telegram.base_url = self.telegram.base_url.trim_end_matches('/').to_string();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, secs) in [
            ("schedule.interval_secs", self.schedule.interval_secs),
            ("source.connect_timeout_secs", self.source.connect_timeout_secs),
            ("source.read_timeout_secs", self.source.read_timeout_secs),
            ("analyzer.timeout_secs", self.analyzer.timeout_secs),
            ("telegram.timeout_secs", self.telegram.timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::invalid(key, "0"));
            }
        }
        for (key, hour) in [
            ("schedule.active_start_hour", self.schedule.active_start_hour),
            ("schedule.active_end_hour", self.schedule.active_end_hour),
        ] {
            if hour > 23 {
                return Err(ConfigError::invalid(key, &hour.to_string()));
            }
        }
        if !(0.0..=1.0).contains(&self.change.threshold) {
            return Err(ConfigError::invalid(
                "change.threshold",
                &self.change.threshold.to_string(),
            ));
        }
        if !(1..=100).contains(&self.analyzer.jpeg_quality) {
            return Err(ConfigError::invalid(
                "analyzer.jpeg_quality",
                &self.analyzer.jpeg_quality.to_string(),
            ));
        }
        if self.analyzer.max_tokens == 0 {
            return Err(ConfigError::invalid("analyzer.max_tokens", "0"));
        }
        if self.source.mode == SourceMode::Mjpeg && self.source.url.is_none() {
            return Err(ConfigError::Missing("source.url (CAPTURE_DEVICE)"));
        }
        if self.analyzer.api_key.is_empty() {
            return Err(ConfigError::Missing("analyzer.api_key (OPENAI_API_KEY)"));
        }
        if self.telegram.token.is_empty() {
            return Err(ConfigError::Missing("telegram.token (TELEGRAM_TOKEN)"));
        }
        if self.telegram.chat_id.is_empty() {
            return Err(ConfigError::Missing("telegram.chat_id (TELEGRAM_CHAT_ID)"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, value))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

// Default value functions
fn default_source_mode() -> SourceMode {
    SourceMode::File
}
fn default_image_path() -> PathBuf {
    PathBuf::from("images/frame.jpg")
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    10
}
fn default_interval() -> u64 {
    600
}
fn default_change_threshold() -> f64 {
    0.03
}
fn default_noise_floor() -> u8 {
    25
}
fn default_analyzer_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_max_tokens() -> u32 {
    300
}
fn default_analyzer_timeout() -> u64 {
    60
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_system_prompt() -> String {
    "You are a visual safety monitoring system. Analyze the image and summarize any risky \
     situations, such as falls, fights, intruders, unusual posture, or suspicious behavior. \
     Respond concisely without listing examples."
        .into()
}
fn default_trigger_terms() -> Vec<String> {
    ["fall", "intruder", "fight", "unusual", "risk", "suspicious"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("frames_detected/last_frame.jpg")
}
fn default_telegram_base_url() -> String {
    "https://api.telegram.org".into()
}
fn default_telegram_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}
