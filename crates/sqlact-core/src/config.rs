use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ActivityError;
use crate::materializer::RowCaps;

pub const DEFAULT_TOP_LIMIT: i64 = 500;

fn default_top_limit() -> i64 {
    DEFAULT_TOP_LIMIT
}

fn default_ui_enabled() -> bool {
    true
}

fn default_run_interval_secs() -> u64 {
    600
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ActivitySettings {
    /// Rows kept per ranking column in each bucket.
    #[serde(default = "default_top_limit")]
    pub top_limit: i64,
    /// Serve the UI from activity tables instead of raw statistics.
    #[serde(default = "default_ui_enabled")]
    pub ui_enabled: bool,
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,
    /// Deadline for each statistics read during a run.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default)]
    pub max_statement_rows: Option<usize>,
    #[serde(default)]
    pub max_transaction_rows: Option<usize>,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            top_limit: default_top_limit(),
            ui_enabled: default_ui_enabled(),
            run_interval_secs: default_run_interval_secs(),
            query_timeout_ms: default_query_timeout_ms(),
            max_statement_rows: None,
            max_transaction_rows: None,
        }
    }
}

impl ActivitySettings {
    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.top_limit <= 0 {
            return Err(ActivityError::Configuration(format!(
                "top_limit must be positive, got {}",
                self.top_limit
            )));
        }
        Ok(())
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.max(1))
    }

    pub fn row_caps(&self) -> RowCaps {
        RowCaps {
            max_statement_rows: self.max_statement_rows,
            max_transaction_rows: self.max_transaction_rows,
        }
    }

    /// `SQLACT_TOP_LIMIT` and `SQLACT_UI_ENABLED` win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(limit) = std::env::var("SQLACT_TOP_LIMIT")
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
        {
            self.top_limit = limit;
        }
        if let Ok(raw) = std::env::var("SQLACT_UI_ENABLED") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.ui_enabled = true,
                "0" | "false" | "no" | "off" => self.ui_enabled = false,
                _ => tracing::warn!(
                    target: "sqlact::config",
                    value = %raw,
                    "ignoring unrecognised SQLACT_UI_ENABLED"
                ),
            }
        }
    }
}

static SETTINGS_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(ActivitySettings);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// JSON schema describing the settings file.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn settings_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(ActivitySettings);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_settings(content: &str) -> Result<ActivitySettings> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = SETTINGS_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let settings: ActivitySettings = toml::from_str(content)?;
    Ok(settings)
}

pub fn load_settings(path: &Path) -> Result<ActivitySettings> {
    let content = std::fs::read_to_string(path)?;
    let mut settings = parse_settings(&content)?;
    settings.apply_env_overrides();
    Ok(settings)
}

/// Everything one run needs from configuration, taken together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunConfig {
    pub top_limit: i64,
    pub enabled: bool,
    pub caps: RowCaps,
}

/// Cluster-wide knobs consulted once at the start of each run.
pub trait ConfigProvider: Send + Sync {
    fn top_k_limit(&self) -> i64;

    fn enabled(&self) -> bool;

    fn row_caps(&self) -> RowCaps {
        RowCaps::default()
    }

    /// Providers backed by mutable state override this so a run never mixes
    /// values from before and after an update.
    fn run_config(&self) -> RunConfig {
        RunConfig {
            top_limit: self.top_k_limit(),
            enabled: self.enabled(),
            caps: self.row_caps(),
        }
    }
}

/// Hot-reloadable settings shared between the job, read path and driver.
#[derive(Clone, Debug, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<ActivitySettings>>,
}

impl SettingsHandle {
    pub fn new(settings: ActivitySettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> ActivitySettings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ActivitySettings)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn set_top_limit(&self, limit: i64) {
        self.update(|s| s.top_limit = limit);
    }

    pub fn set_ui_enabled(&self, enabled: bool) {
        self.update(|s| s.ui_enabled = enabled);
    }
}

impl ConfigProvider for SettingsHandle {
    fn top_k_limit(&self) -> i64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).top_limit
    }

    fn enabled(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).ui_enabled
    }

    fn row_caps(&self) -> RowCaps {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .row_caps()
    }

    fn run_config(&self) -> RunConfig {
        let settings = self.inner.read().unwrap_or_else(|e| e.into_inner());
        RunConfig {
            top_limit: settings.top_limit,
            enabled: settings.ui_enabled,
            caps: settings.row_caps(),
        }
    }
}
