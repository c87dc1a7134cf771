use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};
use toml_edit::{DocumentMut, value};

use crate::llm_update::DEFAULT_ENDPOINT;
use crate::service::BusinessDefaults;
use crate::synthesizer::{DEFAULT_TIMEOUT, SynthesizerSettings};

pub const API_KEY_VAR: &str = "GEMINI_API_KEY";
pub const MODEL_VAR: &str = "GEMINI_MODEL";
pub const RULE_FALLBACK_VAR: &str = "INVOICE_QUICK_EDIT_RULE_FALLBACK";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Opaque id every invoice written by this installation belongs to.
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub business: BusinessSection,
}

fn default_db_path() -> String {
    "invoices/invoices.db".to_string()
}

fn default_owner_id() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ModelSection {
    /// Pin a single model instead of the default candidate list.
    pub name: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub rule_fallback: bool,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            name: None,
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            rule_fallback: false,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

#[derive(Debug, Default, Deserialize)]
pub struct BusinessSection {
    pub from_name: Option<String>,
    pub from_email: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Like [`Config::load`], but a missing file means all defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(toml::from_str("")?)
        }
    }

    /// Pin the edit model in the config file, keeping its formatting.
    pub fn update_model(
        path: impl AsRef<Path>,
        model: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let content = fs::read_to_string(&path).unwrap_or_default();
        let mut doc = content.parse::<DocumentMut>()?;

        doc["model"]["name"] = value(model);

        fs::write(&path, doc.to_string())?;
        Ok(())
    }

    pub fn business_defaults(&self) -> BusinessDefaults {
        BusinessDefaults {
            from_name: self.business.from_name.clone(),
            from_email: self.business.from_email.clone(),
        }
    }

    /// Settings for the synthesizer, with secrets and overrides from the environment.
    pub fn synthesizer_settings(&self) -> SynthesizerSettings {
        self.settings_with(|name| env::var(name).ok())
    }

    fn settings_with(&self, lookup: impl Fn(&str) -> Option<String>) -> SynthesizerSettings {
        let rule_fallback = match lookup(RULE_FALLBACK_VAR) {
            Some(flag) => flag.trim() == "true",
            None => self.model.rule_fallback,
        };
        SynthesizerSettings {
            api_key: lookup(API_KEY_VAR),
            model: lookup(MODEL_VAR).or_else(|| self.model.name.clone()),
            endpoint: self.model.endpoint.clone(),
            timeout: Duration::from_secs(self.model.timeout_secs),
            rule_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.db_path, "invoices/invoices.db");
        assert_eq!(config.owner_id, "local");
        assert_eq!(config.model.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.model.timeout_secs, 20);
        assert!(!config.model.rule_fallback);
        assert!(config.business.from_name.is_none());
    }

    #[test]
    fn test_environment_overrides_file() {
        let config: Config = toml::from_str(
            r#"
            [model]
            name = "gemini-2.0-flash"
            timeout_secs = 5
            rule_fallback = false
            "#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            (API_KEY_VAR, "secret"),
            (RULE_FALLBACK_VAR, "true"),
        ]);
        let settings = config.settings_with(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(settings.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert!(settings.rule_fallback);

        let env: HashMap<&str, &str> =
            HashMap::from([(MODEL_VAR, "gemini-2.5-pro"), (RULE_FALLBACK_VAR, "yes")]);
        let settings = config.settings_with(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.model.as_deref(), Some("gemini-2.5-pro"));
        assert!(!settings.rule_fallback);
    }

    #[test]
    fn test_update_model_keeps_other_content() {
        let path = std::env::temp_dir().join(format!("invoice_drafter_cfg_{}.toml", std::process::id()));
        fs::write(
            &path,
            "# local setup\ndb_path = \"x.db\"\n\n[business]\nfrom_name = \"Studio Nine\"\n",
        )
        .unwrap();

        Config::update_model(&path, "gemini-2.5-flash").unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# local setup\ndb_path = \"x.db\""));

        let config = Config::load(&path).unwrap();
        assert_eq!(config.model.name.as_deref(), Some("gemini-2.5-flash"));
        assert_eq!(config.business.from_name.as_deref(), Some("Studio Nine"));
        assert_eq!(config.db_path, "x.db");
    }
}
