//! Configuration types for the Kiln gateway

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{BackendPreference, NativeLoader};
use crate::error::{Error, Result};

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Directory scanned for GGUF models
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Explicit tokenizer file; otherwise `tokenizer.json` next to the model is used
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub generation: GenerationDefaults,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            tokenizer_path: None,
            backend: BackendSettings::default(),
            generation: GenerationDefaults::default(),
        }
    }
}

impl KilnConfig {
    /// Read an optional JSON config file, then apply `KILN_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read config {}: {}", path.display(), e))
                })?;
                let parsed: KilnConfig = serde_json::from_str(&raw).map_err(|e| {
                    Error::Config(format!("Failed to parse config {}: {}", path.display(), e))
                })?;
                info!("Loaded configuration from {}", path.display());
                parsed
            }
            None => KilnConfig::default(),
        };
        config.apply_env();
        config.generation.validate()?;
        Ok(config)
    }

    /// Load using the file named by `KILN_CONFIG`, if any.
    pub fn from_env() -> Result<Self> {
        let path = env_nonempty("KILN_CONFIG").map(PathBuf::from);
        Self::load(path.as_deref())
    }

    fn apply_env(&mut self) {
        if let Some(dir) = env_nonempty("KILN_MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_nonempty("KILN_TOKENIZER_PATH") {
            self.tokenizer_path = Some(PathBuf::from(path));
        }
        self.backend.apply_env();
    }
}

/// Native backend selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// `auto`, `cpu` or `gpu` (`cuda`/`metal` are accepted as `gpu`)
    #[serde(default)]
    pub preference: BackendPreference,

    /// Explicit native library path; `$VAR`, `${VAR}` and `%VAR%` are expanded
    #[serde(default)]
    pub library_path: Option<String>,

    /// Root of the layered `<os>-<arch>/native/<variant>/` runtime directories
    #[serde(default = "default_runtimes_dir")]
    pub runtimes_dir: PathBuf,

    /// Flat directory used by container images
    #[serde(default = "default_container_lib_dir")]
    pub container_lib_dir: PathBuf,

    /// Upper bound for running the vendor diagnostic tool
    #[serde(default = "default_gpu_probe_timeout_ms")]
    pub gpu_probe_timeout_ms: u64,

    /// `candle` (built-in kernels) or `dynamic` (external shared library)
    #[serde(default)]
    pub loader: NativeLoader,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            preference: BackendPreference::default(),
            library_path: None,
            runtimes_dir: default_runtimes_dir(),
            container_lib_dir: default_container_lib_dir(),
            gpu_probe_timeout_ms: default_gpu_probe_timeout_ms(),
            loader: NativeLoader::default(),
        }
    }
}

impl BackendSettings {
    pub fn gpu_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu_probe_timeout_ms)
    }

    fn apply_env(&mut self) {
        if let Some(raw) = env_nonempty("KILN_BACKEND") {
            match raw.parse::<BackendPreference>() {
                Ok(preference) => self.preference = preference,
                Err(_) => warn!("Invalid KILN_BACKEND='{}', keeping {}", raw, self.preference),
            }
        }
        if let Some(raw) = env_nonempty("KILN_NATIVE_LOADER") {
            match raw.parse::<NativeLoader>() {
                Ok(loader) => self.loader = loader,
                Err(_) => warn!("Invalid KILN_NATIVE_LOADER='{}', keeping {}", raw, self.loader),
            }
        }
        if let Some(path) = env_nonempty("KILN_LIBRARY_PATH") {
            self.library_path = Some(path);
        }
        if let Some(dir) = env_nonempty("KILN_RUNTIMES_DIR") {
            self.runtimes_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("KILN_CONTAINER_LIB_DIR") {
            self.container_lib_dir = PathBuf::from(dir);
        }
        if let Some(raw) = env_nonempty("KILN_GPU_PROBE_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => self.gpu_probe_timeout_ms = ms,
                Err(_) => warn!(
                    "Invalid KILN_GPU_PROBE_TIMEOUT_MS='{}', keeping {}ms",
                    raw, self.gpu_probe_timeout_ms
                ),
            }
        }
    }
}

/// Defaults applied when a request omits sampling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Hard ceiling applied to every request
    #[serde(default = "default_max_tokens_ceiling")]
    pub max_tokens_ceiling: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_tokens_ceiling: default_max_tokens_ceiling(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            seed: default_seed(),
        }
    }
}

impl GenerationDefaults {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens_ceiling == 0 {
            return Err(Error::Config("max_tokens_ceiling must be at least 1".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Config(format!(
                "default temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) || self.top_p == 0.0 {
            return Err(Error::Config(format!("default top_p {} outside (0, 1]", self.top_p)));
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn kiln_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiln")
}

fn default_models_dir() -> PathBuf {
    kiln_data_dir().join("models")
}

fn default_runtimes_dir() -> PathBuf {
    kiln_data_dir().join("runtimes")
}

fn default_container_lib_dir() -> PathBuf {
    PathBuf::from("/usr/local/lib/kiln")
}

fn default_gpu_probe_timeout_ms() -> u64 {
    3_000
}

fn default_max_tokens() -> usize {
    512
}

fn default_max_tokens_ceiling() -> usize {
    4096
}

fn default_temperature() -> f64 {
    0.8
}

fn default_top_p() -> f64 {
    0.9
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_repeat_last_n() -> usize {
    64
}

fn default_seed() -> u64 {
    299_792_458
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.json");
        std::fs::write(
            &path,
            r#"{"models_dir": "/srv/models", "backend": {"preference": "cpu"}}"#,
        )
        .unwrap();

        let config = KilnConfig::load(Some(&path)).unwrap();
        assert_eq!(config.backend.preference, BackendPreference::Cpu);
        assert_eq!(config.generation.max_tokens, 512);
        assert_eq!(config.backend.gpu_probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.backend.loader, NativeLoader::Candle);
    }

    #[test]
    fn file_selects_dynamic_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.json");
        std::fs::write(
            &path,
            r#"{"backend": {"loader": "dynamic", "library_path": "/opt/llama/libllama.so"}}"#,
        )
        .unwrap();

        let config = KilnConfig::load(Some(&path)).unwrap();
        assert_eq!(config.backend.loader, NativeLoader::Dynamic);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = KilnConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let defaults = GenerationDefaults {
            temperature: 3.5,
            ..GenerationDefaults::default()
        };
        assert!(defaults.validate().is_err());
        assert!(GenerationDefaults::default().validate().is_ok());
    }
}
