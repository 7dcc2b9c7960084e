//! Loading `config.toml` into a [`KeepsakeConfig`]
//!
//! Resolution order for each setting:
//!   1. Environment override (`KEEPSAKE_MODEL`, `KEEPSAKE_API_BASE`)
//!   2. `config.toml` in the keepsake home directory
//!   3. Built-in default
//!
//! The API key is read from `[provider].api_key`, falling back to the
//! environment variable named by `[provider].api_key_env` (`OPENAI_API_KEY`
//! when unset).

use crate::{KeepsakeConfig, KeepsakeError, ProviderConfig, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// On-disk shape of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigToml {
    workspace: Option<PathBuf>,
    model: Option<String>,
    memory_window: Option<usize>,
    relationship_mode: Option<bool>,
    provider: Option<ProviderToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderToml {
    api_base: Option<String>,
    api_key: Option<String>,
    api_key_env: Option<String>,
    extra_headers: Option<HashMap<String, String>>,
    timeout_secs: Option<u64>,
}

/// Get the keepsake home directory (`$KEEPSAKE_HOME` or `~/.keepsake`)
pub fn keepsake_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("KEEPSAKE_HOME") {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir()
        .ok_or_else(|| KeepsakeError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".keepsake"))
}

/// Load configuration from `{home}/config.toml`, applying env overrides.
///
/// A missing file yields defaults. A file that fails to parse is reported
/// and ignored, the same way a missing one is.
pub async fn load_config(home: &Path) -> Result<KeepsakeConfig> {
    let config_file = home.join("config.toml");

    let parsed = if config_file.exists() {
        let content = tokio::fs::read_to_string(&config_file).await?;
        match toml::from_str::<ConfigToml>(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring unparsable {:?}: {}", config_file, e);
                ConfigToml::default()
            }
        }
    } else {
        debug!("No config file at {:?}, using defaults", config_file);
        ConfigToml::default()
    };

    let config = resolve(parsed, home, |key| std::env::var(key).ok());

    info!(
        "Config resolved: workspace={:?}, model='{}', memory_window={}, relationship_mode={}, api_base='{}', api_key={}",
        config.workspace,
        config.model,
        config.memory_window,
        config.relationship_mode,
        config.provider.api_base,
        if config.provider.api_key.is_some() { "set" } else { "unset" },
    );

    Ok(config)
}

/// Parse a config document without touching the filesystem or environment.
pub fn parse_config(content: &str, home: &Path) -> Result<KeepsakeConfig> {
    let parsed = toml::from_str::<ConfigToml>(content)?;
    Ok(resolve(parsed, home, |_| None))
}

fn resolve(
    parsed: ConfigToml,
    home: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> KeepsakeConfig {
    let workspace = parsed
        .workspace
        .map(|p| if p.is_relative() { home.join(p) } else { p })
        .unwrap_or_else(|| home.join("workspace"));

    let mut config = KeepsakeConfig::new(workspace);

    if let Some(model) = env("KEEPSAKE_MODEL").or(parsed.model) {
        config = config.with_model(model);
    }
    if let Some(window) = parsed.memory_window {
        config = config.with_memory_window(window);
    }
    if let Some(enabled) = parsed.relationship_mode {
        config = config.with_relationship_mode(enabled);
    }

    let provider_toml = parsed.provider.unwrap_or_default();
    let mut provider = ProviderConfig::default();
    if let Some(base) = env("KEEPSAKE_API_BASE").or(provider_toml.api_base) {
        provider.api_base = base.trim_end_matches('/').to_string();
    }
    let key_env = provider_toml
        .api_key_env
        .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
    provider.api_key = provider_toml
        .api_key
        .or_else(|| env(&key_env))
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    if let Some(headers) = provider_toml.extra_headers {
        provider.extra_headers = headers;
    }
    if let Some(timeout) = provider_toml.timeout_secs {
        provider.timeout_secs = timeout;
    }

    config.with_provider(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_API_BASE, DEFAULT_MEMORY_WINDOW, DEFAULT_MODEL};

    #[test]
    fn test_defaults_from_empty_document() {
        let home = PathBuf::from("/tmp/keepsake-home");
        let config = parse_config("", &home).unwrap();

        assert_eq!(config.workspace, home.join("workspace"));
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.memory_window, DEFAULT_MEMORY_WINDOW);
        assert!(!config.relationship_mode);
        assert_eq!(config.provider.api_base, DEFAULT_API_BASE);
        assert!(config.provider.api_key.is_none());
    }

    #[test]
    fn test_full_document() {
        let home = PathBuf::from("/tmp/keepsake-home");
        let content = r#"
workspace = "/data/agent"
model = "llama3"
memory_window = 30
relationship_mode = true

[provider]
api_base = "http://localhost:11434/v1/"
api_key = "  sk-test  "
timeout_secs = 10

[provider.extra_headers]
X-Team = "memory"
"#;
        let config = parse_config(content, &home).unwrap();

        assert_eq!(config.workspace, PathBuf::from("/data/agent"));
        assert_eq!(config.model, "llama3");
        assert_eq!(config.memory_window, 30);
        assert!(config.relationship_mode);
        assert_eq!(config.provider.api_base, "http://localhost:11434/v1");
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.provider.timeout_secs, 10);
        assert_eq!(config.provider.extra_headers["X-Team"], "memory");
    }

    #[test]
    fn test_relative_workspace_is_under_home() {
        let home = PathBuf::from("/tmp/keepsake-home");
        let config = parse_config("workspace = \"ws\"", &home).unwrap();
        assert_eq!(config.workspace, home.join("ws"));
    }

    #[test]
    fn test_env_overrides() {
        let parsed: ConfigToml = toml::from_str(
            "model = \"from-file\"\n[provider]\napi_key_env = \"MY_KEY\"\n",
        )
        .unwrap();
        let config = resolve(parsed, Path::new("/h"), |key| match key {
            "KEEPSAKE_MODEL" => Some("from-env".to_string()),
            "MY_KEY" => Some("secret".to_string()),
            _ => None,
        });

        assert_eq!(config.model, "from-env");
        assert_eq!(config.provider.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_document_is_an_error() {
        assert!(parse_config("memory_window = \"many\"", Path::new("/h")).is_err());
    }
}
