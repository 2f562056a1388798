use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentick_core::{DEFAULT_PAGE_SIZE, EngineConfig, ReconnectPolicy};
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::json_file::{JsonFileError, write_json_atomic};

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/chat";
pub const SETTINGS_DIRECTORY_NAME: &str = "agentick";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SESSION_FILE_NAME: &str = "session.json";
pub const ENV_PREFIX: &str = "AGENTICK_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_page_size")]
    pub history_page_size: usize,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            ws_url: default_ws_url(),
            token: String::new(),
            history_page_size: default_page_size(),
            reconnect: ReconnectPolicy::default(),
            session_file: None,
        }
    }
}

impl ClientSettings {
    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reconnect: self.reconnect,
            page_size: self.history_page_size,
        }
    }

    pub fn session_path(&self) -> PathBuf {
        self.session_file
            .clone()
            .unwrap_or_else(default_session_path)
    }

    pub fn normalized(mut self) -> Self {
        self.api_base = non_blank_or(&self.api_base, default_api_base)
            .trim_end_matches('/')
            .to_string();
        self.ws_url = non_blank_or(&self.ws_url, default_ws_url);
        self.token = self.token.trim().to_string();
        if self.history_page_size == 0 {
            self.history_page_size = default_page_size();
        }
        self.reconnect = self.reconnect.normalized();
        self.session_file = self
            .session_file
            .filter(|path| !path.as_os_str().is_empty());
        self
    }
}

/// Settings shared by the adapters; swapped atomically on reload.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".agentick"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads `config_path`, falling back to defaults when the file cannot be used.
    pub fn new(config_path: PathBuf) -> Self {
        let settings = match Self::load_from_disk(&config_path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(path = ?config_path, error = %error, "using default settings");
                ClientSettings::default()
            }
        };

        Self::from_settings(settings, config_path)
    }

    pub fn from_settings(settings: ClientSettings, config_path: PathBuf) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings.normalized())),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Re-reads the file and environment. On failure the current settings stay in place.
    pub fn reload(&self) -> SettingsResult<Arc<ClientSettings>> {
        let settings = Arc::new(Self::load_from_disk(&self.config_path)?);
        self.settings.store(settings.clone());
        tracing::info!(path = ?self.config_path, "settings reloaded");
        Ok(settings)
    }

    pub fn update(&self, settings: ClientSettings) -> SettingsResult<()> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> SettingsResult<ClientSettings> {
        let mut figment = Figment::from(Serialized::defaults(ClientSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings = figment
            .extract::<ClientSettings>()
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })?;
        Ok(settings.normalized())
    }

    fn persist(&self, settings: &ClientSettings) -> SettingsResult<()> {
        write_json_atomic(&self.config_path, settings).context(PersistSnafu {
            stage: "persist-settings",
        })?;
        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    Persist {
        stage: &'static str,
        source: JsonFileError,
    },
}

pub fn default_session_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".agentick"))
        .join(SESSION_FILE_NAME)
}

fn non_blank_or(value: &str, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME));

        let settings = store.settings();
        assert_eq!(settings.ws_url, DEFAULT_WS_URL);
        assert_eq!(settings.history_page_size, 50);
        assert_eq!(settings.reconnect, ReconnectPolicy::default());
        assert!(!settings.has_token());
    }

    #[test]
    fn partial_file_merges_over_defaults_and_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "api_base": "http://chat.local:9000/",
                "token": "  secret  ",
                "history_page_size": 0,
                "reconnect": { "max_delay_ms": 4000 }
            }"#,
        )
        .unwrap();

        let settings = SettingsStore::new(path).settings();

        assert_eq!(settings.api_base, "http://chat.local:9000");
        assert_eq!(settings.token, "secret");
        assert_eq!(settings.history_page_size, 50);
        assert_eq!(settings.reconnect.base_delay_ms, 1_000);
        assert_eq!(settings.reconnect.max_delay_ms, 4_000);
        assert_eq!(settings.ws_url, DEFAULT_WS_URL);
    }

    #[test]
    fn reload_keeps_previous_settings_when_the_file_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"token": "first"}"#).unwrap();
        let store = SettingsStore::new(path.clone());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.settings().token, "first");

        std::fs::write(&path, r#"{"token": "second"}"#).unwrap();
        assert_eq!(store.reload().unwrap().token, "second");
    }

    #[test]
    fn update_persists_atomically_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        let mut settings = (*store.settings()).clone();
        settings.token = "rotated".to_string();
        store.update(settings).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(SettingsStore::new(path).settings().token, "rotated");
    }
}
