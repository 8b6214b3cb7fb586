//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on configurable recursion depth.
pub const MAX_DEPTH_CEILING: u32 = 5;
/// Hard ceiling on configurable fan-out breadth.
pub const MAX_BREADTH_CEILING: usize = 8;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gemini API key (required for any remote call)
    pub gemini_api_key: Option<String>,

    /// Deep-research agent name for streamed research calls
    pub agent_name: String,

    /// Model used for follow-up calls (gap analysis, synthesis)
    pub followup_model: String,

    /// SQLite database path for session history
    pub db_path: PathBuf,

    /// Maximum recursion depth for fan-out (0 disables fan-out)
    pub max_depth: u32,

    /// Maximum child tasks per gap analysis
    pub breadth: usize,

    /// Global ceiling on simultaneous outstanding remote calls
    pub max_workers: usize,

    /// Per-child wait budget during fan-in
    pub child_timeout: Duration,

    /// Reconnect attempts before a stream is declared exhausted
    pub stream_max_retries: u32,

    /// Initial reconnect delay (doubles per attempt)
    pub stream_retry_delay: Duration,

    /// Inactivity budget for a single stream attempt
    pub stream_idle_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let db_path = std::env::var("DEEP_RESEARCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("deep-research")
                    .join("history.db")
            });

        let agent_name = std::env::var("DEEP_RESEARCH_AGENT")
            .unwrap_or_else(|_| "deep-research-pro-preview-12-2025".to_string());

        let followup_model = std::env::var("DEEP_RESEARCH_FOLLOWUP_MODEL")
            .unwrap_or_else(|_| "gemini-3-pro-preview".to_string());

        let max_depth = env_parse("DEEP_RESEARCH_MAX_DEPTH", 1);
        let breadth = env_parse("DEEP_RESEARCH_BREADTH", 3);
        let max_workers = env_parse("DEEP_RESEARCH_MAX_WORKERS", 4);

        let child_timeout =
            Duration::from_secs(env_parse("DEEP_RESEARCH_CHILD_TIMEOUT_SECS", 1800));
        let stream_max_retries = env_parse("DEEP_RESEARCH_STREAM_RETRIES", 5);
        let stream_retry_delay =
            Duration::from_millis(env_parse("DEEP_RESEARCH_STREAM_RETRY_DELAY_MS", 2000));
        let stream_idle_timeout =
            Duration::from_secs(env_parse("DEEP_RESEARCH_STREAM_IDLE_TIMEOUT_SECS", 300));

        Ok(Self {
            gemini_api_key,
            agent_name,
            followup_model,
            db_path,
            max_depth,
            breadth,
            max_workers,
            child_timeout,
            stream_max_retries,
            stream_retry_delay,
            stream_idle_timeout,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// Platform-specific dirs fallback
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .ok()
                .or_else(|| {
                    std::env::var("HOME")
                        .map(|h| PathBuf::from(h).join(".local/share"))
                        .ok()
                })
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
                .ok()
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            None
        }
    }
}
