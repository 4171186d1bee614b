use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cache_dir: PathBuf,
    pub openai_api_key: Option<String>,
    pub embedding_provider: String,
    pub judge_provider: String,
    pub judge_model: Option<String>,
    pub judge_timeout_s: u64,
    pub judge_meta_eval: bool,
    pub judge_rpm: f64,
    pub judge_burst: u32,
    pub embedding_cache_max_mb: u64,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            openai_api_key: None,
            embedding_provider: "auto".to_string(),
            judge_provider: "auto".to_string(),
            judge_model: None,
            judge_timeout_s: 30,
            judge_meta_eval: false,
            judge_rpm: 60.0,
            judge_burst: 10,
            embedding_cache_max_mb: 500,
            log_level: "info".to_string(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".attest").join("cache")
}

impl EngineConfig {
    /// Reads every `ATTEST_*` variable once at bootstrap. Missing or
    /// unparseable values keep their defaults; provider names are validated
    /// later, at provider construction, where bad values are fatal.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("ATTEST_CACHE_DIR") {
            if !v.is_empty() {
                cfg.cache_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("ATTEST_OPENAI_API_KEY") {
            if !v.is_empty() {
                cfg.openai_api_key = Some(v);
            }
        }
        if let Ok(v) = env::var("ATTEST_EMBEDDING_PROVIDER") {
            if !v.is_empty() {
                cfg.embedding_provider = v;
            }
        }
        if let Ok(v) = env::var("ATTEST_JUDGE_PROVIDER") {
            if !v.is_empty() {
                cfg.judge_provider = v;
            }
        }
        if let Ok(v) = env::var("ATTEST_JUDGE_MODEL") {
            if !v.is_empty() {
                cfg.judge_model = Some(v);
            }
        }
        if let Ok(v) = env::var("ATTEST_JUDGE_TIMEOUT_S") {
            if let Ok(n) = v.parse() {
                cfg.judge_timeout_s = n;
            }
        }
        if let Ok(v) = env::var("ATTEST_JUDGE_META_EVAL") {
            cfg.judge_meta_eval = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = env::var("ATTEST_JUDGE_RPM") {
            if let Ok(n) = v.parse() {
                cfg.judge_rpm = n;
            }
        }
        if let Ok(v) = env::var("ATTEST_JUDGE_BURST") {
            if let Ok(n) = v.parse() {
                cfg.judge_burst = n;
            }
        }
        if let Ok(v) = env::var("ATTEST_EMBEDDING_CACHE_MAX_MB") {
            if let Ok(n) = v.parse() {
                cfg.embedding_cache_max_mb = n;
            }
        }
        if let Ok(v) = env::var("ATTEST_LOG") {
            if !v.is_empty() {
                cfg.log_level = v;
            }
        }
        cfg
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("attest.db")
    }
}
