//! Platform capability detection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{BackendKind, BackendPreference};

/// Operating system and architecture, named the way runtime directories are (`linux`, `x86_64`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// Combinations for which no GPU backend is built.
    pub fn lacks_gpu_support(&self) -> bool {
        matches!(
            (self.os.as_str(), self.arch.as_str()),
            ("macos", "x86_64") | ("linux", "aarch64") | ("windows", "aarch64")
        )
    }

    /// Directory name under the runtimes root, e.g. `linux-x64`.
    pub fn runtime_id(&self) -> String {
        let arch = match self.arch.as_str() {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            "x86" => "x86",
            other => other,
        };
        let os = match self.os.as_str() {
            "macos" => "osx",
            "windows" => "win",
            other => other,
        };
        format!("{os}-{arch}")
    }
}

/// CPU instruction-set tier, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuTier {
    Avx512,
    Avx2,
    Avx,
    NoAvx,
}

impl CpuTier {
    pub const ALL: [CpuTier; 4] = [CpuTier::Avx512, CpuTier::Avx2, CpuTier::Avx, CpuTier::NoAvx];

    pub fn dir_name(&self) -> &'static str {
        match self {
            CpuTier::Avx512 => "avx512",
            CpuTier::Avx2 => "avx2",
            CpuTier::Avx => "avx",
            CpuTier::NoAvx => "noavx",
        }
    }

    /// This tier and every tier below it, best to worst.
    pub fn fallbacks(self) -> impl Iterator<Item = CpuTier> {
        CpuTier::ALL.into_iter().filter(move |tier| *tier >= self)
    }

    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if std::arch::is_x86_feature_detected!("avx512f") {
                return CpuTier::Avx512;
            }
            if std::arch::is_x86_feature_detected!("avx2") {
                return CpuTier::Avx2;
            }
            if std::arch::is_x86_feature_detected!("avx") {
                return CpuTier::Avx;
            }
        }
        CpuTier::NoAvx
    }
}

/// Host facts consulted during selection.
#[async_trait]
pub trait PlatformProbe: Send + Sync {
    fn platform(&self) -> Platform;

    fn path_exists(&self, path: &Path) -> bool;

    fn env_var(&self, key: &str) -> Option<String>;

    /// Run the vendor diagnostic tool; false on absence, failure or timeout.
    async fn vendor_tool_reports_gpu(&self, timeout: Duration) -> bool;

    fn cpu_tier(&self) -> CpuTier;
}

/// Probe backed by the real filesystem, environment and process table.
pub struct SystemProbe;

#[async_trait]
impl PlatformProbe for SystemProbe {
    fn platform(&self) -> Platform {
        Platform::current()
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    async fn vendor_tool_reports_gpu(&self, timeout: Duration) -> bool {
        let run = tokio::process::Command::new("nvidia-smi")
            .arg("-L")
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                stdout.lines().any(|line| line.trim_start().starts_with("GPU"))
            }
            Ok(Ok(_)) => false,
            Ok(Err(err)) => {
                debug!("nvidia-smi not runnable: {}", err);
                false
            }
            Err(_) => {
                warn!("nvidia-smi did not answer within {:?}", timeout);
                false
            }
        }
    }

    fn cpu_tier(&self) -> CpuTier {
        CpuTier::detect()
    }
}

/// Container runtimes set this when a GPU is passed through.
pub const CONTAINER_GPU_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

pub(crate) fn driver_marker(probe: &dyn PlatformProbe, platform: &Platform) -> Option<PathBuf> {
    match platform.os.as_str() {
        "linux" => Some(PathBuf::from("/proc/driver/nvidia/version")),
        "windows" => {
            let root = probe
                .env_var("SystemRoot")
                .unwrap_or_else(|| "C:\\Windows".to_string());
            Some(PathBuf::from(root).join("System32").join("nvcuda.dll"))
        }
        "macos" => Some(PathBuf::from("/System/Library/Frameworks/Metal.framework")),
        _ => None,
    }
}

fn known_gpu_libraries(platform: &Platform) -> &'static [&'static str] {
    match platform.os.as_str() {
        "linux" => &[
            "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
            "/usr/lib64/libcuda.so.1",
            "/usr/lib/wsl/lib/libcuda.so.1",
            "/usr/local/cuda/lib64/libcudart.so",
        ],
        "windows" => &["C:\\Program Files\\NVIDIA GPU Computing Toolkit\\CUDA"],
        _ => &[],
    }
}

/// Apply the override, the platform pin, then the probes in reliability order.
pub async fn determine_backend(
    probe: &dyn PlatformProbe,
    preference: BackendPreference,
    probe_timeout: Duration,
) -> BackendKind {
    if let Some(forced) = preference.forced() {
        info!("Backend forced to {} by configuration", forced);
        return forced;
    }

    let platform = probe.platform();
    if platform.lacks_gpu_support() {
        info!(
            "No GPU backend for {}-{}; using CPU",
            platform.os, platform.arch
        );
        return BackendKind::Cpu;
    }

    if let Some(marker) = driver_marker(probe, &platform) {
        if probe.path_exists(&marker) {
            debug!("GPU driver marker present at {}", marker.display());
            return BackendKind::Gpu;
        }
    }

    if let Some(value) = probe.env_var(CONTAINER_GPU_ENV) {
        let value = value.trim().to_ascii_lowercase();
        if !value.is_empty() && value != "void" && value != "none" {
            debug!("{}={} indicates a passed-through GPU", CONTAINER_GPU_ENV, value);
            return BackendKind::Gpu;
        }
    }

    if platform.os != "macos" && probe.vendor_tool_reports_gpu(probe_timeout).await {
        debug!("nvidia-smi reported a GPU");
        return BackendKind::Gpu;
    }

    for candidate in known_gpu_libraries(&platform) {
        if probe.path_exists(Path::new(candidate)) {
            debug!("GPU runtime library found at {}", candidate);
            return BackendKind::Gpu;
        }
    }

    info!("No GPU detected; using CPU");
    BackendKind::Cpu
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeProbe;
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn pinned_platforms_use_cpu_without_probing() {
        for (os, arch) in [("macos", "x86_64"), ("linux", "aarch64"), ("windows", "aarch64")] {
            let probe = FakeProbe {
                platform: Some(Platform::new(os, arch)),
                vendor_tool_gpu: true,
                ..FakeProbe::default()
            };
            let kind = determine_backend(&probe, BackendPreference::Auto, TIMEOUT).await;
            assert_eq!(kind, BackendKind::Cpu, "{os}-{arch}");
            assert_eq!(probe.probe_count(), 0);
        }
    }

    #[tokio::test]
    async fn override_beats_platform_pin() {
        let probe = FakeProbe {
            platform: Some(Platform::new("linux", "aarch64")),
            ..FakeProbe::default()
        };
        let kind = determine_backend(&probe, BackendPreference::Gpu, TIMEOUT).await;
        assert_eq!(kind, BackendKind::Gpu);
    }

    #[tokio::test]
    async fn driver_marker_wins_before_vendor_tool() {
        let mut probe = FakeProbe::linux();
        probe
            .files
            .insert(PathBuf::from("/proc/driver/nvidia/version"));
        let kind = determine_backend(&probe, BackendPreference::Auto, TIMEOUT).await;
        assert_eq!(kind, BackendKind::Gpu);
        assert_eq!(probe.probe_count(), 1);
    }

    #[tokio::test]
    async fn container_hint_ignores_void() {
        let mut probe = FakeProbe::linux();
        probe.env.insert(CONTAINER_GPU_ENV.into(), "void".into());
        assert_eq!(
            determine_backend(&probe, BackendPreference::Auto, TIMEOUT).await,
            BackendKind::Cpu
        );

        probe.env.insert(CONTAINER_GPU_ENV.into(), "all".into());
        assert_eq!(
            determine_backend(&probe, BackendPreference::Auto, TIMEOUT).await,
            BackendKind::Gpu
        );
    }

    #[tokio::test]
    async fn shared_library_is_last_resort() {
        let mut probe = FakeProbe::linux();
        probe.files.insert(PathBuf::from("/usr/lib64/libcuda.so.1"));
        assert_eq!(
            determine_backend(&probe, BackendPreference::Auto, TIMEOUT).await,
            BackendKind::Gpu
        );
    }

    #[tokio::test]
    async fn windows_marker_uses_system_root() {
        let mut probe = FakeProbe {
            platform: Some(Platform::new("windows", "x86_64")),
            ..FakeProbe::default()
        };
        probe.env.insert("SystemRoot".into(), "D:\\Win".into());
        probe.files.insert(
            PathBuf::from("D:\\Win")
                .join("System32")
                .join("nvcuda.dll"),
        );
        assert_eq!(
            determine_backend(&probe, BackendPreference::Auto, TIMEOUT).await,
            BackendKind::Gpu
        );
    }

    #[test]
    fn tier_fallbacks_run_best_to_worst() {
        let tiers: Vec<_> = CpuTier::Avx2.fallbacks().collect();
        assert_eq!(tiers, vec![CpuTier::Avx2, CpuTier::Avx, CpuTier::NoAvx]);
    }

    #[test]
    fn runtime_ids() {
        assert_eq!(Platform::new("linux", "x86_64").runtime_id(), "linux-x64");
        assert_eq!(Platform::new("macos", "aarch64").runtime_id(), "osx-arm64");
        assert_eq!(Platform::new("windows", "x86_64").runtime_id(), "win-x64");
    }
}
