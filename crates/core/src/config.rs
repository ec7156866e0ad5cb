//! Configuration management for kbqa.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - Config file (`.kbqa/config.yaml`, or the path given by `KBQA_CONFIG`)
//! - Environment variables
//! - Command-line flags (`with_overrides`)
//!
//! State is workspace-centric: databases and the config file live in `.kbqa/`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

/// Name of the per-workspace state directory.
pub const STATE_DIR: &str = ".kbqa";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the workspace root (contains .kbqa/)
    #[serde(skip)]
    pub workspace: PathBuf,

    /// Optional config file path
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Verbose mode (enables debug logging)
    #[serde(skip)]
    pub verbose: bool,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub embedding: EmbeddingSettings,

    #[serde(default)]
    pub normalizer: NormalizerSettings,

    #[serde(default)]
    pub index: IndexSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub retrieval: RetrievalSettings,

    #[serde(default)]
    pub generator: GeneratorSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to bind, e.g. `127.0.0.1:8080`
    pub listen: String,

    /// Allowed CORS origins; empty allows any origin
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            cors_origins: Vec::new(),
        }
    }
}

/// Knowledge store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite database path; relative paths resolve against the workspace
    pub path: Option<PathBuf>,
}

/// Embedding backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Provider: "onnx" (transformer encoder) or "trigram" (hashed, offline)
    pub provider: String,

    /// Directory containing `model.onnx` and `tokenizer.json`
    pub model_dir: Option<PathBuf>,

    /// Human-readable model identifier reported in status output
    pub model_name: String,

    /// Output vector dimension
    pub dimensions: usize,

    /// Token limit per input; longer inputs are truncated
    pub max_seq_length: usize,

    /// Number of texts per encoder call
    pub batch_size: usize,

    /// Attempts to load the backend before giving up
    pub load_retries: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "onnx".to_string(),
            model_dir: None,
            model_name: "biencoder-camembert-base-mmarcoFR".to_string(),
            dimensions: 768,
            max_seq_length: 256,
            batch_size: 32,
            load_retries: 3,
        }
    }
}

/// Text normalizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerSettings {
    /// Drop stopwords from normalized text
    pub remove_stopwords: bool,

    /// Replace accented letters with their base letter
    pub fold_accents: bool,

    /// Additional stopwords on top of the built-in list
    pub extra_stopwords: Vec<String>,

    /// Words removed from the effective stopword list
    pub keep_words: Vec<String>,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            remove_stopwords: true,
            fold_accents: false,
            extra_stopwords: Vec::new(),
            keep_words: Vec::new(),
        }
    }
}

/// Vector index persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Snapshot database path; relative paths resolve against the workspace
    pub snapshot_path: Option<PathBuf>,

    /// Persist every successful rebuild
    pub persist: bool,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            persist: true,
        }
    }
}

/// Background synchronizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Run the periodic staleness check
    pub enabled: bool,

    /// Seconds between staleness checks
    pub interval_secs: u64,

    /// Minimum seconds between two rebuilds caused by store changes;
    /// explicit requests are never delayed
    pub min_rebuild_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            min_rebuild_interval_secs: 0,
        }
    }
}

/// Retrieval and confidence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Number of nearest entries retrieved per query
    pub top_k: usize,

    /// Minimum confidence in [0, 1] required to answer
    pub confidence_threshold: f32,

    /// Characters of the answer kept in source excerpts
    pub snippet_chars: usize,

    /// Answer returned when nothing in the knowledge base is close enough
    pub no_match_answer: String,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            confidence_threshold: 0.65,
            snippet_chars: 100,
            no_match_answer: "Je n'ai pas trouvé d'information pertinente dans la base de \
                connaissances pour répondre à votre question. Pourriez-vous la reformuler ?"
                .to_string(),
        }
    }
}

/// Generator adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Provider: "ollama", "llamacpp" or "none"
    pub provider: String,

    /// Base URL of the provider; provider default when unset
    pub endpoint: Option<String>,

    /// Model identifier passed to the provider
    pub model: String,

    /// Maximum tokens generated per answer
    pub max_tokens: u32,

    /// Context window of the model in tokens
    pub context_window: u32,

    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,

    /// Per-request generation timeout
    pub timeout_secs: u64,

    /// Language the answer must be written in
    pub language: String,

    /// Name the assistant uses for itself
    pub assistant_name: String,

    /// Sequences that end generation
    pub stop: Vec<String>,

    /// Handlebars prompt template replacing the built-in one
    pub prompt_template: Option<String>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            endpoint: None,
            model: "gemma2:2b".to_string(),
            max_tokens: 400,
            context_window: 4096,
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.3,
            timeout_secs: 30,
            language: "français".to_string(),
            assistant_name: "Mila".to_string(),
            stop: vec![
                "</s>".to_string(),
                "[INST]".to_string(),
                "[/INST]".to_string(),
                "Question:".to_string(),
                "Utilisateur:".to_string(),
            ],
            prompt_template: None,
        }
    }
}

/// Logging settings from the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub color: Option<bool>,
    pub json: bool,
}

const EMBEDDING_PROVIDERS: [&str; 2] = ["onnx", "trigram"];
const GENERATOR_PROVIDERS: [&str; 3] = ["ollama", "llamacpp", "none"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            verbose: false,
            server: ServerSettings::default(),
            store: StoreSettings::default(),
            embedding: EmbeddingSettings::default(),
            normalizer: NormalizerSettings::default(),
            index: IndexSettings::default(),
            sync: SyncSettings::default(),
            retrieval: RetrievalSettings::default(),
            generator: GeneratorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, the config file and the environment.
    ///
    /// Environment variables:
    /// - `KBQA_WORKSPACE`: workspace path
    /// - `KBQA_CONFIG`: config file path
    /// - `KBQA_LISTEN`: HTTP listen address
    /// - `KBQA_EMBEDDING_PROVIDER`, `KBQA_MODEL_DIR`: embedding backend
    /// - `KBQA_GENERATOR_PROVIDER`, `KBQA_GENERATOR_ENDPOINT`, `KBQA_GENERATOR_MODEL`
    /// - `RUST_LOG`: log level
    /// - `NO_COLOR`: disable colored output
    pub fn load() -> AppResult<Self> {
        Self::load_with(None, None)
    }

    /// Like [`AppConfig::load`], with explicit workspace and config file
    /// taking precedence over the environment.
    pub fn load_with(workspace: Option<PathBuf>, config_file: Option<PathBuf>) -> AppResult<Self> {
        let mut config = Self::default();

        if let Some(workspace) =
            workspace.or_else(|| std::env::var_os("KBQA_WORKSPACE").map(PathBuf::from))
        {
            config.workspace = workspace;
        }

        if let Some(config_file) =
            config_file.or_else(|| std::env::var_os("KBQA_CONFIG").map(PathBuf::from))
        {
            config.config_file = Some(config_file);
        }

        if !config.workspace.exists() {
            return Err(AppError::Config(format!(
                "Workspace directory does not exist: {:?}",
                config.workspace
            )));
        }

        let config_path = config.config_path();
        if config_path.exists() {
            config = config.merge_yaml(&config_path)?;
        } else if config.config_file.is_some() {
            return Err(AppError::Config(format!(
                "Config file not found: {:?}",
                config_path
            )));
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("KBQA_LISTEN") {
            self.server.listen = listen;
        }

        if let Ok(provider) = std::env::var("KBQA_EMBEDDING_PROVIDER") {
            self.embedding.provider = provider;
        }

        if let Ok(dir) = std::env::var("KBQA_MODEL_DIR") {
            self.embedding.model_dir = Some(PathBuf::from(dir));
        }

        if let Ok(provider) = std::env::var("KBQA_GENERATOR_PROVIDER") {
            self.generator.provider = provider;
        }

        if let Ok(endpoint) = std::env::var("KBQA_GENERATOR_ENDPOINT") {
            self.generator.endpoint = Some(endpoint);
        }

        if let Ok(model) = std::env::var("KBQA_GENERATOR_MODEL") {
            self.generator.model = model;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = Some(level);
        }

        if std::env::var("NO_COLOR").is_ok() {
            self.logging.color = Some(false);
        }
    }

    /// Merge a YAML configuration file into this config.
    ///
    /// Runtime-only fields (workspace, config file, verbosity) are kept.
    fn merge_yaml(&self, path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let mut parsed = Self::from_yaml_str(&contents).map_err(|e| {
            AppError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        parsed.workspace = self.workspace.clone();
        parsed.config_file = self.config_file.clone();
        parsed.verbose = self.verbose;
        Ok(parsed)
    }

    /// Parse a configuration document; missing sections take their defaults.
    pub fn from_yaml_str(contents: &str) -> AppResult<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply CLI overrides to the configuration.
    pub fn with_overrides(
        mut self,
        workspace: Option<PathBuf>,
        config_file: Option<PathBuf>,
        log_level: Option<String>,
        verbose: bool,
        no_color: bool,
        json_logs: bool,
    ) -> Self {
        if let Some(workspace) = workspace {
            self.workspace = workspace;
        }

        if let Some(config_file) = config_file {
            self.config_file = Some(config_file);
        }

        if let Some(log_level) = log_level {
            self.logging.level = Some(log_level);
        }

        if verbose {
            self.verbose = true;
            if self.logging.level.is_none() {
                self.logging.level = Some("debug".to_string());
            }
        }

        if no_color {
            self.logging.color = Some(false);
        }

        if json_logs {
            self.logging.json = true;
        }

        self
    }

    /// Path of the config file that `load` reads.
    pub fn config_path(&self) -> PathBuf {
        match self.config_file {
            Some(ref cf) => cf.clone(),
            None => self.state_dir().join("config.yaml"),
        }
    }

    /// Get the path to the .kbqa directory.
    pub fn state_dir(&self) -> PathBuf {
        self.workspace.join(STATE_DIR)
    }

    /// Ensure the .kbqa directory exists.
    pub fn ensure_state_dir(&self) -> AppResult<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AppError::Config(format!("Failed to create {} directory: {}", STATE_DIR, e))
            })?;
        }
        Ok(())
    }

    /// Knowledge store database path.
    pub fn store_path(&self) -> PathBuf {
        self.resolve(self.store.path.as_deref(), "knowledge.db")
    }

    /// Vector index snapshot database path.
    pub fn snapshot_path(&self) -> PathBuf {
        self.resolve(self.index.snapshot_path.as_deref(), "index.db")
    }

    /// Embedding model directory; defaults to `.kbqa/models/<model_name>`.
    pub fn model_dir(&self) -> PathBuf {
        let default_name = format!("models/{}", self.embedding.model_name);
        self.resolve(self.embedding.model_dir.as_deref(), &default_name)
    }

    fn resolve(&self, configured: Option<&Path>, default_name: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.workspace.join(path),
            None => self.state_dir().join(default_name),
        }
    }

    /// Whether logs should be colored.
    pub fn no_color(&self) -> bool {
        self.logging.color == Some(false)
    }

    /// Validate settings that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> AppResult<()> {
        if !EMBEDDING_PROVIDERS.contains(&self.embedding.provider.as_str()) {
            return Err(AppError::Config(format!(
                "Unknown embedding provider: {}. Supported: {}",
                self.embedding.provider,
                EMBEDDING_PROVIDERS.join(", ")
            )));
        }

        if !GENERATOR_PROVIDERS.contains(&self.generator.provider.as_str()) {
            return Err(AppError::Config(format!(
                "Unknown generator provider: {}. Supported: {}",
                self.generator.provider,
                GENERATOR_PROVIDERS.join(", ")
            )));
        }

        if self.embedding.dimensions == 0 {
            return Err(AppError::Config(
                "embedding.dimensions must be greater than 0".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 || self.embedding.max_seq_length == 0 {
            return Err(AppError::Config(
                "embedding.batch_size and embedding.max_seq_length must be greater than 0"
                    .to_string(),
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(AppError::Config(
                "retrieval.top_k must be greater than 0".to_string(),
            ));
        }

        let threshold = self.retrieval.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AppError::Config(format!(
                "retrieval.confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }

        if self.generator.max_tokens >= self.generator.context_window {
            return Err(AppError::Config(format!(
                "generator.max_tokens ({}) must be smaller than generator.context_window ({})",
                self.generator.max_tokens, self.generator.context_window
            )));
        }

        if self.sync.interval_secs == 0 {
            return Err(AppError::Config(
                "sync.interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
