//! Summarization controls and the command line shared by the binaries.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use crate::normalizer::ChunkingConfig;
use crate::providers::{AnthropicClient, CompletionClient, OpenAiClient, RetryPolicy};
use crate::recall_set::DEFAULT_HARD_CAP;
use crate::regeneration::ControllerConfig;

/// Full-summary attempts a job grants each chapter. The bare controller
/// defaults to fewer.
pub const DEFAULT_JOB_ATTEMPTS: usize = 5;

/// Tunable knobs that bound a summarization job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryControls {
    chunking: ChunkingConfig,
    hard_cap: usize,
    controller: ControllerConfig,
    extraction_concurrency: usize,
    session_id: Option<String>,
}

impl SummaryControls {
    /// Constructs a new set of summary controls.
    pub fn new(
        chunking: ChunkingConfig,
        hard_cap: usize,
        controller: ControllerConfig,
        extraction_concurrency: usize,
    ) -> Self {
        Self {
            chunking,
            hard_cap,
            controller,
            extraction_concurrency: extraction_concurrency.max(1),
            session_id: None,
        }
    }

    /// Resumes (or names) the given session instead of starting a fresh one.
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id.filter(|id| !id.trim().is_empty());
        self
    }

    /// Chunk window settings.
    pub fn chunking(&self) -> ChunkingConfig {
        self.chunking
    }

    /// Maximum critical items per chapter.
    pub fn hard_cap(&self) -> usize {
        self.hard_cap
    }

    /// Regeneration and addendum budgets.
    pub fn controller(&self) -> ControllerConfig {
        self.controller
    }

    /// Extraction requests allowed in flight per chapter.
    pub fn extraction_concurrency(&self) -> usize {
        self.extraction_concurrency
    }

    /// Requested session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

impl Default for SummaryControls {
    fn default() -> Self {
        Self::new(
            ChunkingConfig::default(),
            DEFAULT_HARD_CAP,
            ControllerConfig {
                max_attempts: DEFAULT_JOB_ATTEMPTS,
                ..ControllerConfig::default()
            },
            8,
        )
    }
}

/// Completion API to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions.
    Openai,
    /// Anthropic messages.
    Anthropic,
}

/// Command-line interface for summarization runs.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "summarize",
    about = "Summarize a long document with verifiable coverage"
)]
pub struct Cli {
    /// Chapters to summarize: `.jsonl` (one chapter per line) or Markdown
    #[arg(long, env = "COVSUM_INPUT")]
    pub input: PathBuf,

    /// Completion provider
    #[arg(long, env = "COVSUM_PROVIDER", value_enum, default_value = "openai")]
    pub provider: ProviderKind,

    /// Model identifier passed to the provider
    #[arg(long, env = "COVSUM_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    /// Override for the provider base URL
    #[arg(long, env = "COVSUM_BASE_URL")]
    pub base_url: Option<String>,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Max seconds to wait for each completion request
    #[arg(long, env = "COVSUM_TIMEOUT_SECS", default_value_t = 120)]
    pub timeout_secs: u64,

    /// Retries for rate limits or transient errors
    #[arg(long, env = "COVSUM_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: usize,

    /// Words per chunk
    #[arg(long, env = "COVSUM_CHUNK_WORDS", default_value_t = 1000)]
    pub chunk_words: usize,

    /// Words shared by consecutive chunks
    #[arg(long, env = "COVSUM_OVERLAP_WORDS", default_value_t = 100)]
    pub overlap_words: usize,

    /// Maximum critical items per chapter
    #[arg(long, env = "COVSUM_HARD_CAP", default_value_t = DEFAULT_HARD_CAP)]
    pub hard_cap: usize,

    /// Full-summary attempts per chapter
    #[arg(long, env = "COVSUM_MAX_ATTEMPTS", default_value_t = DEFAULT_JOB_ATTEMPTS)]
    pub max_attempts: usize,

    /// Addendum attempts per chapter once full attempts are spent
    #[arg(long, env = "COVSUM_MAX_ADDENDUMS", default_value_t = 2)]
    pub max_addendums: usize,

    /// Concurrent extraction requests per chapter
    #[arg(long, env = "COVSUM_CONCURRENCY", default_value_t = 8)]
    pub extraction_concurrency: usize,

    /// Directory holding per-chapter checkpoints
    #[arg(long, env = "COVSUM_CHECKPOINT_DIR", default_value = "data/checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Directory receiving the coverage report and evidence files
    #[arg(long, env = "COVSUM_EVIDENCE_DIR", default_value = "data/evidence")]
    pub evidence_dir: PathBuf,

    /// Session to resume; a new one is started when omitted
    #[arg(long, env = "COVSUM_SESSION")]
    pub session_id: Option<String>,

    /// Append-only JSONL ledger of generation attempts
    #[arg(long, env = "COVSUM_LEDGER", default_value = "data/attempts.jsonl")]
    pub ledger: PathBuf,
}

impl Cli {
    /// Converts the parsed CLI into `SummaryControls`.
    pub fn build_controls(&self) -> SummaryControls {
        SummaryControls::new(
            ChunkingConfig {
                target_words: self.chunk_words,
                overlap_words: self.overlap_words,
            },
            self.hard_cap,
            ControllerConfig {
                max_attempts: self.max_attempts,
                max_addendums: self.max_addendums,
            },
            self.extraction_concurrency,
        )
        .with_session_id(self.session_id.clone())
    }

    /// Retry policy for transport failures.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Builds the completion client for the selected provider.
    pub fn build_client(&self) -> Result<Box<dyn CompletionClient>> {
        let client: Box<dyn CompletionClient> = match self.provider {
            ProviderKind::Openai => Box::new(OpenAiClient::new(
                self.openai_api_key.clone().context("OPENAI_API_KEY is not set")?,
                self.base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                self.model.clone(),
                self.request_timeout(),
                self.retry_policy(),
            )?),
            ProviderKind::Anthropic => Box::new(AnthropicClient::new(
                self.anthropic_api_key
                    .clone()
                    .context("ANTHROPIC_API_KEY is not set")?,
                self.base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
                self.model.clone(),
                self.request_timeout(),
                self.retry_policy(),
            )?),
        };
        Ok(client)
    }
}
