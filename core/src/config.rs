use crate::models::DEFAULT_MODEL;
use crate::store::CredentialFile;
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: Url,
    pub timeout_secs: u64,
    pub default_model: String,
    pub credentials_path: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("client configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("Parley is misconfigured: {detail}. Update parley.yaml."),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_model: DEFAULT_MODEL.to_string(),
            credentials_path: None,
        }
    }
}

impl ClientSettings {
    /// Settings for a service at `base_url`, defaults elsewhere.
    pub fn for_base_url(base_url: Url) -> Self {
        Self {
            base_url,
            ..Self::default()
        }
    }

    /// Load `parley.yaml` (if any), then apply `.env` and environment
    /// overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let section = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err| {
                    ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
                })?;
                let config: ParleyConfig = serde_yaml::from_str(&contents)
                    .map_err(|err| ConfigError::Invalid(format!("invalid parley.yaml: {err}")))?;
                config.client.unwrap_or_default()
            }
            None => ClientSection::default(),
        };
        let overrides = EnvOverrides::from_environment();
        resolve_client_settings(section, overrides)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn credential_file(&self) -> CredentialFile {
        CredentialFile::new(
            self.credentials_path
                .clone()
                .unwrap_or_else(CredentialFile::default_location),
        )
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("default base url is valid")
}

#[derive(Debug, Default)]
struct EnvOverrides {
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<String>,
    credentials: Option<String>,
}

impl EnvOverrides {
    fn from_environment() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|value| !value.trim().is_empty());
        Self {
            base_url: read("PARLEY_BASE_URL"),
            model: read("PARLEY_MODEL"),
            timeout_secs: read("PARLEY_TIMEOUT_SECS"),
            credentials: read("PARLEY_CREDENTIALS"),
        }
    }
}

fn resolve_client_settings(
    section: ClientSection,
    overrides: EnvOverrides,
) -> Result<ClientSettings, ConfigError> {
    let base_url = match overrides.base_url.or(section.base_url) {
        Some(raw) => {
            let url = Url::parse(raw.trim())
                .map_err(|err| ConfigError::Invalid(format!("invalid base url `{raw}`: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "base url `{raw}` must use http or https"
                )));
            }
            url
        }
        None => default_base_url(),
    };

    let timeout_secs = match overrides.timeout_secs {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(format!("PARLEY_TIMEOUT_SECS `{raw}` is not a number")))?,
        None => section.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
    };
    if timeout_secs == 0 {
        return Err(ConfigError::Invalid("timeout must be at least one second".to_string()));
    }

    let default_model = overrides
        .model
        .or(section.model)
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let credentials_path = overrides
        .credentials
        .or(section.credentials_path)
        .map(PathBuf::from);

    Ok(ClientSettings {
        base_url,
        timeout_secs,
        default_model,
        credentials_path,
    })
}

fn locate_config_file() -> Option<PathBuf> {
    parley_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn parley_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("parley");
        paths.push(config_dir.join("parley.yaml"));
        paths.push(config_dir.join("parley.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".parley").join("parley.yaml"));
        paths.push(home_dir.join(".parley").join("parley.yml"));
    } else {
        paths.push(PathBuf::from("parley.yaml"));
        paths.push(PathBuf::from("parley.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct ParleyConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    model: Option<String>,
    credentials_path: Option<String>,
}
