//! Native compute backend selection.
//!
//! A process selects and loads exactly one backend. Selection runs once,
//! guarded by the selector's lock, and never aborts startup: a failed GPU load
//! is retried once on CPU, and any remaining failure is recorded in the
//! [`BackendDescriptor`] so that engine construction can report it later.

pub mod detect;
pub mod device;
pub mod loader;
pub mod paths;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BackendSettings;
use crate::error::Error;

pub use detect::{CpuTier, Platform, PlatformProbe, SystemProbe};
pub use device::DeviceSelector;
pub use loader::{CandleRuntimeLoader, DynamicLibraryLoader, LibraryLoader, NativeLibrary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpu,
    Gpu,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator preference; anything other than `Auto` bypasses detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendPreference {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl BackendPreference {
    pub fn forced(&self) -> Option<BackendKind> {
        match self {
            BackendPreference::Auto => None,
            BackendPreference::Cpu => Some(BackendKind::Cpu),
            BackendPreference::Gpu => Some(BackendKind::Gpu),
        }
    }
}

impl FromStr for BackendPreference {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendPreference::Auto),
            "cpu" => Ok(BackendPreference::Cpu),
            "gpu" | "cuda" | "metal" => Ok(BackendPreference::Gpu),
            other => Err(Error::Config(format!("Unknown backend preference: {other}"))),
        }
    }
}

impl TryFrom<String> for BackendPreference {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<BackendPreference> for String {
    fn from(preference: BackendPreference) -> Self {
        preference.to_string()
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Cpu => "cpu",
            BackendPreference::Gpu => "gpu",
        })
    }
}

/// How the chosen backend is bound into the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeLoader {
    /// candle's own CPU/CUDA/Metal kernels, linked into the binary.
    #[default]
    Candle,
    /// An external llama/ggml shared library opened at runtime.
    Dynamic,
}

impl FromStr for NativeLoader {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "candle" | "builtin" => Ok(NativeLoader::Candle),
            "dynamic" | "native" => Ok(NativeLoader::Dynamic),
            other => Err(Error::Config(format!("Unknown native loader: {other}"))),
        }
    }
}

impl fmt::Display for NativeLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NativeLoader::Candle => "candle",
            NativeLoader::Dynamic => "dynamic",
        })
    }
}

/// Outcome of backend selection. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub library_path: PathBuf,
    pub loaded: bool,
    /// True when the GPU load failed and CPU was used instead.
    pub fell_back: bool,
    pub failure: Option<String>,
}

impl BackendDescriptor {
    /// Error to report when an engine is requested against an unusable backend.
    pub fn ensure_loaded(&self) -> crate::Result<()> {
        if self.loaded {
            return Ok(());
        }
        Err(Error::BackendUnavailable(
            self.failure
                .clone()
                .unwrap_or_else(|| format!("{} backend was not loaded", self.kind)),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorPhase {
    Unconfigured,
    Detecting,
    CpuChosen,
    GpuChosen,
    PathResolved,
    Loading,
    Loaded,
    LoadFailed,
    FallbackToCpu,
    Unavailable,
}

/// Chooses and loads the process backend. Construct one per process and share it.
pub struct BackendSelector {
    probe: Arc<dyn PlatformProbe>,
    loader: Arc<dyn LibraryLoader>,
    configure_lock: tokio::sync::Mutex<()>,
    descriptor: OnceLock<BackendDescriptor>,
    phase: Mutex<SelectorPhase>,
    libraries: Mutex<Vec<Box<dyn NativeLibrary>>>,
}

impl BackendSelector {
    pub fn new(probe: Arc<dyn PlatformProbe>, loader: Arc<dyn LibraryLoader>) -> Self {
        Self {
            probe,
            loader,
            configure_lock: tokio::sync::Mutex::new(()),
            descriptor: OnceLock::new(),
            phase: Mutex::new(SelectorPhase::Unconfigured),
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// System probe with the loader named in `settings`.
    pub fn for_settings(settings: &BackendSettings) -> Self {
        let loader: Arc<dyn LibraryLoader> = match settings.loader {
            NativeLoader::Candle => Arc::new(CandleRuntimeLoader),
            NativeLoader::Dynamic => Arc::new(DynamicLibraryLoader),
        };
        Self::new(Arc::new(SystemProbe), loader)
    }

    pub fn phase(&self) -> SelectorPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(SelectorPhase::Unconfigured)
    }

    /// The published descriptor, if `configure` has completed.
    pub fn descriptor(&self) -> Option<&BackendDescriptor> {
        self.descriptor.get()
    }

    /// Select and load the backend. Later calls return the first result unchanged.
    pub async fn configure(&self, settings: &BackendSettings) -> &BackendDescriptor {
        if let Some(existing) = self.descriptor.get() {
            return existing;
        }

        let _guard = self.configure_lock.lock().await;
        if let Some(existing) = self.descriptor.get() {
            return existing;
        }

        let descriptor = self.select_and_load(settings).await;
        match &descriptor.failure {
            None => info!(
                "Backend ready: {} ({})",
                descriptor.kind,
                descriptor.library_path.display()
            ),
            Some(reason) => warn!("No usable native backend: {}", reason),
        }
        self.descriptor.get_or_init(|| descriptor)
    }

    /// Backend to use before any loading: override, platform pin, then probes.
    pub async fn determine_backend(&self, settings: &BackendSettings) -> BackendKind {
        self.set_phase(SelectorPhase::Detecting);
        let kind = detect::determine_backend(
            self.probe.as_ref(),
            settings.preference,
            settings.gpu_probe_timeout(),
        )
        .await;
        self.set_phase(match kind {
            BackendKind::Cpu => SelectorPhase::CpuChosen,
            BackendKind::Gpu => SelectorPhase::GpuChosen,
        });
        kind
    }

    async fn select_and_load(&self, settings: &BackendSettings) -> BackendDescriptor {
        let chosen = self.determine_backend(settings).await;

        let first_path = self.resolve(chosen, settings);
        let first_error = match self.try_load(chosen, &first_path) {
            Ok(()) => {
                return BackendDescriptor {
                    kind: chosen,
                    library_path: first_path,
                    loaded: true,
                    fell_back: false,
                    failure: None,
                };
            }
            Err(err) => err,
        };

        if chosen == BackendKind::Cpu {
            self.set_phase(SelectorPhase::Unavailable);
            return BackendDescriptor {
                kind: BackendKind::Cpu,
                library_path: first_path,
                loaded: false,
                fell_back: false,
                failure: Some(first_error.to_string()),
            };
        }

        warn!(
            "GPU backend failed to load from {}: {}; retrying with CPU",
            first_path.display(),
            first_error
        );
        self.set_phase(SelectorPhase::FallbackToCpu);

        let cpu_path = self.resolve(BackendKind::Cpu, settings);
        match self.try_load(BackendKind::Cpu, &cpu_path) {
            Ok(()) => BackendDescriptor {
                kind: BackendKind::Cpu,
                library_path: cpu_path,
                loaded: true,
                fell_back: true,
                failure: None,
            },
            Err(err) => {
                self.set_phase(SelectorPhase::Unavailable);
                BackendDescriptor {
                    kind: BackendKind::Cpu,
                    library_path: cpu_path,
                    loaded: false,
                    fell_back: true,
                    failure: Some(format!("gpu: {first_error}; cpu: {err}")),
                }
            }
        }
    }

    fn resolve(&self, kind: BackendKind, settings: &BackendSettings) -> PathBuf {
        let path = paths::resolve_library_path(self.probe.as_ref(), kind, settings);
        self.set_phase(SelectorPhase::PathResolved);
        path
    }

    fn try_load(&self, kind: BackendKind, path: &std::path::Path) -> crate::Result<()> {
        self.set_phase(SelectorPhase::Loading);
        let platform = self.probe.platform();
        let loaded = self
            .loader
            .load(path, kind, &platform)
            .and_then(|library| {
                let devices = library.max_devices()?;
                let offload = library.supports_gpu_offload()?;
                info!(
                    "Loaded {} backend from {} (devices: {}, gpu offload: {})",
                    kind,
                    path.display(),
                    devices,
                    offload
                );
                Ok(library)
            });

        match loaded {
            Ok(library) => {
                if let Ok(mut libraries) = self.libraries.lock() {
                    libraries.push(library);
                }
                self.set_phase(SelectorPhase::Loaded);
                Ok(())
            }
            Err(err) => {
                self.set_phase(SelectorPhase::LoadFailed);
                Err(err)
            }
        }
    }

    fn set_phase(&self, next: SelectorPhase) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = next;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory probe and loader used by selector and registry tests.

    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeProbe {
        pub platform: Option<Platform>,
        pub files: HashSet<PathBuf>,
        pub env: HashMap<String, String>,
        pub vendor_tool_gpu: bool,
        pub tier: Option<CpuTier>,
        pub probes: AtomicUsize,
    }

    impl FakeProbe {
        pub fn linux() -> Self {
            Self {
                platform: Some(Platform::new("linux", "x86_64")),
                tier: Some(CpuTier::Avx2),
                ..Self::default()
            }
        }

        pub fn probe_count(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PlatformProbe for FakeProbe {
        fn platform(&self) -> Platform {
            self.platform
                .clone()
                .unwrap_or_else(|| Platform::new("linux", "x86_64"))
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.files.contains(path)
        }

        fn env_var(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }

        async fn vendor_tool_reports_gpu(&self, _timeout: Duration) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.vendor_tool_gpu
        }

        fn cpu_tier(&self) -> CpuTier {
            self.tier.unwrap_or(CpuTier::NoAvx)
        }
    }

    pub struct FakeLibrary {
        path: PathBuf,
    }

    impl NativeLibrary for FakeLibrary {
        fn path(&self) -> &Path {
            &self.path
        }

        fn max_devices(&self) -> crate::Result<usize> {
            Ok(1)
        }

        fn supports_gpu_offload(&self) -> crate::Result<bool> {
            Ok(false)
        }
    }

    /// Loads successfully for kinds listed in `working`, records every attempt.
    #[derive(Default)]
    pub struct FakeLoader {
        pub working: Vec<BackendKind>,
        pub attempts: Mutex<Vec<BackendKind>>,
    }

    impl FakeLoader {
        pub fn working(kinds: &[BackendKind]) -> Self {
            Self {
                working: kinds.to_vec(),
                attempts: Mutex::new(Vec::new()),
            }
        }

        pub fn attempts(&self) -> Vec<BackendKind> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl LibraryLoader for FakeLoader {
        fn load(
            &self,
            path: &Path,
            kind: BackendKind,
            _platform: &Platform,
        ) -> crate::Result<Box<dyn NativeLibrary>> {
            self.attempts.lock().unwrap().push(kind);
            if self.working.contains(&kind) {
                Ok(Box::new(FakeLibrary {
                    path: path.to_path_buf(),
                }))
            } else {
                Err(Error::BackendUnavailable(format!(
                    "cannot open {}",
                    path.display()
                )))
            }
        }
    }
}
