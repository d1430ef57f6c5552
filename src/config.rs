//! Configuration for a specwright run.
//!
//! Settings come from an optional `specwright.toml` next to the session
//! directory, with CLI flags layered on top by the binary. The orchestrator
//! itself only sees the validated [`WorkflowConfig`].

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::limiter::DEFAULT_CONCURRENCY;

/// Hard cap on reviewer models per round.
pub const MAX_REVIEWERS: usize = 5;

/// Provider endpoint settings, consumed by the binary to build the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub base_url: String,
    /// Environment variable holding the API key. The key itself never lives
    /// in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_api_key_env() -> String {
    "SPECWRIGHT_API_KEY".to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// The validated configuration the orchestrator runs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// The single model that clarifies, drafts, and revises.
    pub writer_model: String,
    /// 1–5 independent reviewer models, in fan-out submission order.
    pub reviewer_models: Vec<String>,
    /// How many review/revise rounds to run.
    #[serde(default = "default_review_rounds")]
    pub review_rounds: u32,
    /// Cap on simultaneously in-flight reviewer calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reviews: usize,
}

fn default_review_rounds() -> u32 {
    1
}

fn default_max_concurrent() -> usize {
    DEFAULT_CONCURRENCY
}

impl WorkflowConfig {
    pub fn new(writer_model: impl Into<String>, reviewer_models: Vec<String>) -> Self {
        Self {
            writer_model: writer_model.into(),
            reviewer_models,
            review_rounds: default_review_rounds(),
            max_concurrent_reviews: default_max_concurrent(),
        }
    }

    pub fn with_review_rounds(mut self, rounds: u32) -> Self {
        self.review_rounds = rounds;
        self
    }

    pub fn with_max_concurrent_reviews(mut self, limit: usize) -> Self {
        self.max_concurrent_reviews = limit;
        self
    }

    /// Writer plus deduplicated reviewers, for the preflight probe set.
    pub fn preflight_models(&self) -> Vec<String> {
        let mut models = vec![self.writer_model.clone()];
        for reviewer in &self.reviewer_models {
            if !models.contains(reviewer) {
                models.push(reviewer.clone());
            }
        }
        models
    }

    pub fn validate(&self) -> Result<()> {
        if self.writer_model.trim().is_empty() {
            bail!("writer model must not be empty");
        }
        if self.reviewer_models.is_empty() {
            bail!("at least one reviewer model is required");
        }
        if self.reviewer_models.len() > MAX_REVIEWERS {
            bail!(
                "at most {MAX_REVIEWERS} reviewer models are supported, got {}",
                self.reviewer_models.len()
            );
        }
        if self.review_rounds == 0 {
            bail!("review_rounds must be at least 1");
        }
        if self.max_concurrent_reviews == 0 {
            bail!("max_concurrent_reviews must be at least 1");
        }
        Ok(())
    }
}

/// On-disk configuration file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    pub workflow: Option<WorkflowConfig>,
}

impl FileConfig {
    /// Load `specwright.toml`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
