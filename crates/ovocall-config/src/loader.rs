use std::path::{Path, PathBuf};

use ovocall_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_FILE: &str = "config.yml";

/// Loads `config.yml` from the ovocall config directory and applies environment overrides.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Loader rooted at `~/.ovocall`.
    pub fn new() -> Self {
        let config_dir = dirs::home_dir()
            .map(|h| h.join(".ovocall"))
            .unwrap_or_else(|| PathBuf::from(".ovocall"));
        Self { config_dir }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Read the file (defaults when missing), apply `OVOCALL_*` overrides, validate.
    pub fn load(&self) -> Result<AppConfig> {
        let mut config = self.load_file()?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        validate(&config)?;
        Ok(config)
    }

    fn load_file(&self) -> Result<AppConfig> {
        let path = self.config_path();
        if !path.exists() {
            debug!("no config file at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }

        info!("loading config from {}", path.display());
        let raw = std::fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(AppConfig::default());
        }
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(kind) = non_empty("OVOCALL_PROVIDER") {
        config.provider.kind = kind.parse().map_err(Error::Config)?;
    }
    if let Some(key) = non_empty("OVOCALL_API_KEY") {
        config.provider.api_key = Some(key);
    }
    if let Some(url) = non_empty("OVOCALL_BASE_URL") {
        config.provider.base_url = Some(url);
    }
    if let Some(model) = non_empty("OVOCALL_MODEL") {
        config.provider.model = Some(model);
    }
    Ok(())
}

fn validate(config: &AppConfig) -> Result<()> {
    let turn = &config.turn;
    if !(0.0..=2.0).contains(&turn.temperature) {
        return Err(Error::Config(format!(
            "turn.temperature must be within [0, 2], got {}",
            turn.temperature
        )));
    }
    if !(0.0..=1.0).contains(&turn.random_sms_probability) {
        return Err(Error::Config(format!(
            "turn.random_sms_probability must be within [0, 1], got {}",
            turn.random_sms_probability
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderKind;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_dir(dir.path());
        let config = loader.load_file().unwrap();
        assert_eq!(config.provider.kind, ProviderKind::OpenAi);
        assert_eq!(config.turn.temperature, 0.9);
        assert!(config.storage.database_path.is_none());
    }

    #[test]
    fn reads_yaml_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            "provider:\n  kind: gemini\n  model: gemini-2.0-flash\n  max_output_tokens: 8192\n\
             turn:\n  temperature: 0.7\n  test_mode: true\n\
             storage:\n  database_path: /tmp/ovocall.db\n",
        )
        .unwrap();

        let config = ConfigLoader::with_dir(dir.path()).load_file().unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Gemini);
        assert_eq!(config.provider.model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(config.provider.resolved_max_output_tokens(), 8192);
        assert_eq!(config.turn.temperature, 0.7);
        assert!(config.turn.test_mode);
        assert_eq!(config.turn.random_sms_probability, 0.60);
        assert_eq!(
            config.storage.database_path.as_deref(),
            Some(Path::new("/tmp/ovocall.db"))
        );
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yml"), "provider: [unclosed").unwrap();
        let err = ConfigLoader::with_dir(dir.path()).load_file().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OVOCALL_PROVIDER", "gemini"),
            ("OVOCALL_API_KEY", "key-from-env"),
            ("OVOCALL_MODEL", ""),
        ]);
        let mut config = AppConfig::default();
        config.provider.model = Some("from-file".to_string());

        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.provider.kind, ProviderKind::Gemini);
        assert_eq!(config.provider.api_key.as_deref(), Some("key-from-env"));
        // empty values are ignored
        assert_eq!(config.provider.model.as_deref(), Some("from-file"));
    }

    #[test]
    fn unknown_provider_override_is_rejected() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "OVOCALL_PROVIDER").then(|| "carrier-pigeon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn out_of_range_probability_fails_validation() {
        let mut config = AppConfig::default();
        config.turn.random_sms_probability = 1.5;
        assert!(validate(&config).is_err());
        config.turn.random_sms_probability = 0.2;
        config.turn.temperature = 3.0;
        assert!(validate(&config).is_err());
        config.turn.temperature = 1.0;
        assert!(validate(&config).is_ok());
    }
}
