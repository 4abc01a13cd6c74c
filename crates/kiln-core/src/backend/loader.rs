//! Binding of native backend libraries.

use std::path::{Path, PathBuf};

use candle_core::Device;
use libloading::{Library, Symbol};
use tracing::{debug, info};

use super::detect::Platform;
use super::device::DeviceSelector;
use super::paths::library_file_name;
use super::BackendKind;
use crate::error::{Error, Result};

/// A bound backend. Stays mapped for as long as the value lives.
pub trait NativeLibrary: Send + Sync {
    fn path(&self) -> &Path;

    /// Exercising call made right after binding so that a broken library fails at load time.
    fn max_devices(&self) -> Result<usize>;

    fn supports_gpu_offload(&self) -> Result<bool>;
}

pub trait LibraryLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        kind: BackendKind,
        platform: &Platform,
    ) -> Result<Box<dyn NativeLibrary>>;
}

/// Libraries that must be mapped before `llama` on Windows, in dependency order.
pub fn windows_preload_order(kind: BackendKind) -> [&'static str; 3] {
    match kind {
        BackendKind::Cpu => ["ggml-base", "ggml-cpu", "ggml"],
        BackendKind::Gpu => ["ggml-base", "ggml-cuda", "ggml"],
    }
}

/// Loads an external ggml/llama shared library with `libloading`.
pub struct DynamicLibraryLoader;

struct DynamicLibrary {
    path: PathBuf,
    library: Library,
    // Dropped after `library`.
    _dependencies: Vec<Library>,
}

impl DynamicLibrary {
    fn call<T>(&self, symbol: &[u8]) -> Result<T> {
        // SAFETY: the symbols looked up here are argument-less C functions
        // returning plain values.
        unsafe {
            let func: Symbol<unsafe extern "C" fn() -> T> =
                self.library.get(symbol).map_err(|e| {
                    Error::BackendUnavailable(format!(
                        "{} lacks {}: {}",
                        self.path.display(),
                        String::from_utf8_lossy(&symbol[..symbol.len().saturating_sub(1)]),
                        e
                    ))
                })?;
            Ok(func())
        }
    }
}

impl NativeLibrary for DynamicLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn max_devices(&self) -> Result<usize> {
        self.call::<usize>(b"llama_max_devices\0")
    }

    fn supports_gpu_offload(&self) -> Result<bool> {
        self.call::<bool>(b"llama_supports_gpu_offload\0")
    }
}

fn open(path: &Path) -> Result<Library> {
    // SAFETY: loading runs the library's initializers; the caller vouches for the path.
    unsafe { Library::new(path) }.map_err(|e| {
        Error::BackendUnavailable(format!("failed to load {}: {}", path.display(), e))
    })
}

impl LibraryLoader for DynamicLibraryLoader {
    fn load(
        &self,
        path: &Path,
        kind: BackendKind,
        platform: &Platform,
    ) -> Result<Box<dyn NativeLibrary>> {
        if !path.exists() {
            return Err(Error::BackendUnavailable(format!(
                "native library not found at {}",
                path.display()
            )));
        }

        let mut dependencies = Vec::new();
        if platform.is_windows() {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            for stem in windows_preload_order(kind) {
                let dependency = dir.join(library_file_name(platform, stem));
                debug!("Preloading {}", dependency.display());
                dependencies.push(open(&dependency)?);
            }
        }

        let library = open(path)?;
        Ok(Box::new(DynamicLibrary {
            path: path.to_path_buf(),
            library,
            _dependencies: dependencies,
        }))
    }
}

/// The in-process candle runtime. Binding means acquiring the device for the backend kind.
pub struct CandleRuntimeLoader;

struct CandleRuntime {
    path: PathBuf,
    device: Device,
}

impl NativeLibrary for CandleRuntime {
    fn path(&self) -> &Path {
        &self.path
    }

    fn max_devices(&self) -> Result<usize> {
        // Allocating a scalar proves the device is usable.
        candle_core::Tensor::zeros(1, candle_core::DType::F32, &self.device)?;
        Ok(1)
    }

    fn supports_gpu_offload(&self) -> Result<bool> {
        Ok(!self.device.is_cpu())
    }
}

impl LibraryLoader for CandleRuntimeLoader {
    fn load(
        &self,
        path: &Path,
        kind: BackendKind,
        _platform: &Platform,
    ) -> Result<Box<dyn NativeLibrary>> {
        let device = DeviceSelector::for_kind(kind)?;
        info!(
            "Candle runtime bound to {} device (external library path {} unused)",
            DeviceSelector::describe(&device),
            path.display()
        );
        Ok(Box::new(CandleRuntime {
            path: path.to_path_buf(),
            device,
        }))
    }
}
