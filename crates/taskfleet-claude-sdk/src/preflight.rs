//! Startup checks on the Claude Code backend.
//!
//! A worker only runs on an interactively logged-in Claude Code session.
//! API-key style credentials are refused outright, before anything else
//! is attempted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Environment variables that carry API-key style credentials.
pub const API_KEY_ENV_VARS: &[&str] = &["ANTHROPIC_API_KEY", "ANTHROPIC_AUTH_TOKEN"];

const VERSION_TIMEOUT: Duration = Duration::from_secs(15);

/// Reasons the backend cannot be used.
#[derive(Debug, Error)]
pub enum PreflightError {
    /// An API-key credential was found.
    #[error("API key credential detected ({0}); this worker only runs on a logged-in Claude Code session")]
    ApiKeyCredential(String),

    /// The CLI is missing or broken.
    #[error("Claude Code backend unavailable at '{path}': {reason}")]
    BackendUnavailable { path: String, reason: String },

    /// No logged-in session was found.
    #[error("Claude Code is not logged in ({0}); run `claude` and complete /login first")]
    Unauthenticated(String),
}

/// Where Claude Code keeps its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudePaths {
    /// Global state file holding the OAuth account.
    pub global_config: PathBuf,
    /// Directory holding `settings.json` and `.credentials.json`.
    pub config_dir: PathBuf,
}

impl ClaudePaths {
    /// Resolve paths from the environment.
    ///
    /// `CLAUDE_CONFIG_DIR` replaces both locations; otherwise they live
    /// under the home directory.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if let Some(dir) = non_empty(lookup("CLAUDE_CONFIG_DIR")) {
            let dir = PathBuf::from(dir);
            return Some(Self {
                global_config: dir.join(".claude.json"),
                config_dir: dir,
            });
        }

        let home = non_empty(lookup("HOME")).or_else(|| non_empty(lookup("USERPROFILE")))?;
        let home = PathBuf::from(home);
        Some(Self {
            global_config: home.join(".claude.json"),
            config_dir: home.join(".claude"),
        })
    }

    fn settings(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    fn credentials(&self) -> PathBuf {
        self.config_dir.join(".credentials.json")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Ignoring unreadable Claude config file");
            None
        }
    }
}

/// Find an API-key style credential in the environment or Claude settings.
///
/// Returns a description of where it was found.
pub fn detect_api_key_credential(
    lookup: impl Fn(&str) -> Option<String>,
    settings: Option<&Value>,
) -> Option<String> {
    for var in API_KEY_ENV_VARS {
        if non_empty(lookup(var)).is_some() {
            return Some(format!("environment variable {}", var));
        }
    }

    let settings = settings?;
    if settings.get("apiKeyHelper").is_some_and(|v| !v.is_null()) {
        return Some("apiKeyHelper in Claude settings".to_string());
    }
    for var in API_KEY_ENV_VARS {
        if settings
            .get("env")
            .and_then(|env| env.get(*var))
            .and_then(Value::as_str)
            .is_some_and(|v| !v.trim().is_empty())
        {
            return Some(format!("{} in Claude settings env", var));
        }
    }
    None
}

/// Check for a logged-in (OAuth) Claude Code session.
pub fn check_authenticated(paths: &ClaudePaths) -> Result<(), PreflightError> {
    let has_account = read_json(&paths.global_config)
        .and_then(|config| config.get("oauthAccount").cloned())
        .is_some_and(|account| account.is_object());
    if has_account {
        return Ok(());
    }

    let has_token = read_json(&paths.credentials())
        .and_then(|creds| creds.get("claudeAiOauth").cloned())
        .is_some_and(|oauth| oauth.is_object());
    if has_token {
        return Ok(());
    }

    Err(PreflightError::Unauthenticated(format!(
        "no OAuth account in {}",
        paths.global_config.display()
    )))
}

/// Run `claude --version` and return what it prints.
pub async fn check_installed(claude_path: &str) -> Result<String, PreflightError> {
    let unavailable = |reason: String| PreflightError::BackendUnavailable {
        path: claude_path.to_string(),
        reason,
    };

    let output = Command::new(claude_path)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(VERSION_TIMEOUT, output)
        .await
        .map_err(|_| unavailable("timed out running --version".to_string()))?
        .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "--version exited with {}",
            output.status.code().unwrap_or(-1)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Full startup check: credential policy, installation, login.
#[derive(Debug, Clone)]
pub struct Preflight {
    claude_path: String,
    paths: Option<ClaudePaths>,
}

impl Preflight {
    /// Build a preflight from the process environment.
    pub fn from_env(claude_path: impl Into<String>) -> Self {
        Self {
            claude_path: claude_path.into(),
            paths: ClaudePaths::resolve(|key| std::env::var(key).ok()),
        }
    }

    /// Use explicit config paths instead of the environment.
    pub fn with_paths(mut self, paths: ClaudePaths) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Run every check in order and return the backend version.
    pub async fn run(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<String, PreflightError> {
        let settings = self.paths.as_ref().and_then(|p| read_json(&p.settings()));
        if let Some(source) = detect_api_key_credential(&lookup, settings.as_ref()) {
            return Err(PreflightError::ApiKeyCredential(source));
        }

        let version = check_installed(&self.claude_path).await?;
        info!(version = %version, "Claude Code backend found");

        let paths = self.paths.as_ref().ok_or_else(|| {
            PreflightError::Unauthenticated("cannot locate Claude config directory".to_string())
        })?;
        check_authenticated(paths)?;
        info!("Claude Code session is logged in");

        Ok(version)
    }
}
