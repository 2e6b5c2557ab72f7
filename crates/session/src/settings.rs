use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use lantern_llm::{LoadParams, RigEngineConfig, SamplingParams};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "lantern";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "LANTERN_";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/v1";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant running on the user's own machine. Answer concisely.";

/// Anti-prompts that end a generation. Fixed, not part of the persisted record.
pub const STOP_SEQUENCES: &[&str] = &["User:", "\nUser ", "<|eot_id|>", "<|im_end|>"];

const MIN_CONTEXT_SIZE: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub last_model_path: Option<PathBuf>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub gpu_layer_count: u32,
    pub context_size: u32,
    pub system_prompt: String,
    pub endpoint: String,
    pub api_key: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            last_model_path: None,
            temperature: 0.7,
            top_p: 0.95,
            max_tokens: 512,
            gpu_layer_count: 0,
            context_size: 4096,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
        }
    }
}

impl SessionSettings {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();

        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(0.0, 2.0)
        } else {
            defaults.temperature
        };
        self.top_p = if self.top_p.is_finite() {
            self.top_p.clamp(0.0, 1.0)
        } else {
            defaults.top_p
        };
        self.context_size = self.context_size.max(MIN_CONTEXT_SIZE);
        if self.max_tokens == 0 {
            self.max_tokens = defaults.max_tokens;
        }
        self.system_prompt = self.system_prompt.trim().to_string();
        self.endpoint = if self.endpoint.trim().is_empty() {
            defaults.endpoint
        } else {
            self.endpoint.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.last_model_path = self
            .last_model_path
            .filter(|path| !path.as_os_str().is_empty());

        self
    }

    pub fn load_params(&self) -> LoadParams {
        LoadParams::new(self.context_size, self.gpu_layer_count)
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stop_sequences: STOP_SEQUENCES.iter().map(ToString::to_string).collect(),
        }
    }

    /// Estimated tokens replayed history may use, leaving room for one reply.
    pub fn history_budget(&self) -> usize {
        let reserved = self.max_tokens.min(self.context_size / 2);
        (self.context_size - reserved) as usize
    }

    pub fn engine_config(&self) -> RigEngineConfig {
        RigEngineConfig::new(&self.endpoint, &self.api_key)
    }
}

/// Holds the current settings and writes changes back to disk.
///
/// Readers take a cheap snapshot with [`SettingsStore::settings`]; an update is
/// persisted first and only swapped in once the file is safely replaced.
pub struct SettingsStore {
    settings: Arc<ArcSwap<SessionSettings>>,
    config_path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lantern"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path: Some(config_path),
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// A store that never touches the filesystem.
    pub fn ephemeral(settings: SessionSettings) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings.normalized())),
            config_path: None,
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn settings(&self) -> Arc<SessionSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: SessionSettings) -> SettingsResult<()> {
        let normalized_settings = settings.normalized();
        if let Some(path) = &self.config_path {
            persist(path, &normalized_settings)?;
        }
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> SessionSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(SessionSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<SessionSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                SessionSettings::default()
            }
        }
    }
}

fn persist(path: &Path, settings: &SessionSettings) -> SettingsResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-settings-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
        stage: "serialize-settings-json",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-settings-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-settings-file",
        from: temp_path,
        to: path.to_path_buf(),
    })?;

    tracing::info!(path = ?path, "saved settings");
    Ok(())
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME));
        assert_eq!(store.settings().context_size, 4096);
        assert_eq!(store.settings().max_tokens, 512);
        assert!(store.settings().last_model_path.is_none());
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path);
        assert_eq!(*store.settings(), SessionSettings::default());
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "context_size": 2048, "system_prompt": "  be terse " }"#)
            .unwrap();

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.system_prompt, "be terse");
        assert_eq!(settings.max_tokens, 512);
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        let mut settings = (*store.settings()).clone();
        settings.last_model_path = Some(PathBuf::from("/models/tiny.gguf"));
        settings.temperature = 0.2;
        store.update(settings).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(
            reloaded.last_model_path.as_deref(),
            Some(Path::new("/models/tiny.gguf"))
        );
        assert!((reloaded.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn normalization_clamps_out_of_range_values() {
        let settings = SessionSettings {
            temperature: 9.0,
            top_p: -1.0,
            max_tokens: 0,
            context_size: 1,
            endpoint: "   ".to_string(),
            ..SessionSettings::default()
        }
        .normalized();

        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.top_p, 0.0);
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.context_size, MIN_CONTEXT_SIZE);
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn history_budget_reserves_reply_room() {
        let settings = SessionSettings {
            context_size: 4096,
            max_tokens: 512,
            ..SessionSettings::default()
        };
        assert_eq!(settings.history_budget(), 3584);

        let small = SessionSettings {
            context_size: 100,
            max_tokens: 512,
            ..SessionSettings::default()
        };
        assert_eq!(small.history_budget(), 50);
    }

    #[test]
    fn sampling_carries_fixed_stop_sequences() {
        let sampling = SessionSettings::default().sampling();
        assert_eq!(sampling.stop_sequences.len(), STOP_SEQUENCES.len());
        assert_eq!(sampling.max_tokens, 512);
    }
}
