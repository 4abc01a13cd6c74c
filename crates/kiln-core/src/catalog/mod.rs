//! Model catalog: resolves public model names to concrete GGUF artifacts.
//!
//! Names take the form `<model>` or `<model>:<quantization>`. A `:latest` tag is
//! treated as no tag. The default artifact of a model is the best-ranked
//! candidate according to [`quantization`].

pub mod quantization;
pub mod remote;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
pub use quantization::GgufCandidate;

/// Cache key for an engine: the canonical path of the weight file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ModelIdentity(PathBuf);

impl ModelIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Identity for an on-disk file, canonicalized when possible so that
    /// different spellings of one path share an engine.
    pub fn for_file(path: &Path) -> Self {
        Self(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    /// Public name, including the quantization tag when one was requested.
    pub name: String,
    pub identity: ModelIdentity,
    pub path: PathBuf,
    pub quantization: String,
    pub size_bytes: u64,
    /// Unix seconds.
    pub modified_at: Option<u64>,
    /// All primary weight files for the model, best first.
    pub candidates: Vec<GgufCandidate>,
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<ModelDescriptor>>;

    async fn list(&self) -> Result<Vec<ModelDescriptor>>;
}

/// Split `name:tag` into its parts; `latest` and empty tags count as none.
pub fn split_model_tag(name: &str) -> (&str, Option<&str>) {
    let name = name.trim();
    match name.rsplit_once(':') {
        Some((base, tag)) => {
            let tag = tag.trim();
            if tag.is_empty() || tag.eq_ignore_ascii_case("latest") {
                (base, None)
            } else {
                (base, Some(tag))
            }
        }
        None => (name, None),
    }
}

/// Catalog over a models directory.
///
/// `<dir>/<model>/*.gguf` is model `<model>`; a loose `<dir>/<stem>.gguf` is model `<stem>`.
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    models_dir: PathBuf,
}

impl LocalCatalog {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn lookup_blocking(&self, name: &str) -> Result<Option<ModelDescriptor>> {
        let (base, tag) = split_model_tag(name);
        if base.is_empty() || base.contains("..") || Path::new(base).is_absolute() {
            return Ok(None);
        }

        let dir = self.models_dir.join(base);
        if dir.is_dir() {
            let candidates = scan_candidates(&dir)?;
            let chosen = match tag {
                Some(tag) => candidates
                    .iter()
                    .find(|c| c.quantization_label.eq_ignore_ascii_case(tag))
                    .cloned(),
                None => quantization::best(&candidates),
            };
            return Ok(chosen.map(|file| describe(name.trim(), file, candidates)));
        }

        let file = self.models_dir.join(format!("{base}.gguf"));
        if file.is_file() {
            let candidate = candidate_for(&file)?;
            if let Some(tag) = tag {
                if !candidate.quantization_label.eq_ignore_ascii_case(tag) {
                    return Ok(None);
                }
            }
            return Ok(Some(describe(name.trim(), candidate.clone(), vec![candidate])));
        }

        Ok(None)
    }

    fn list_blocking(&self) -> Result<Vec<ModelDescriptor>> {
        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut models = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };

            if path.is_dir() {
                let candidates = scan_candidates(&path)?;
                if let Some(best) = quantization::best(&candidates) {
                    models.push(describe(&name, best, candidates));
                }
            } else if is_gguf(&path) {
                let stem = name.trim_end_matches(".gguf").to_string();
                let candidate = candidate_for(&path)?;
                models.push(describe(&stem, candidate.clone(), vec![candidate]));
            }
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }
}

#[async_trait]
impl ModelCatalog for LocalCatalog {
    async fn lookup(&self, name: &str) -> Result<Option<ModelDescriptor>> {
        let catalog = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || catalog.lookup_blocking(&name)).await?
    }

    async fn list(&self) -> Result<Vec<ModelDescriptor>> {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || catalog.list_blocking()).await?
    }
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

fn candidate_for(path: &Path) -> Result<GgufCandidate> {
    let size = std::fs::metadata(path)?.len();
    Ok(GgufCandidate::from_path(path, size))
}

/// Primary GGUF files directly inside `dir`, best first.
fn scan_candidates(dir: &Path) -> Result<Vec<GgufCandidate>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_gguf(&path) {
            continue;
        }
        match candidate_for(&path) {
            Ok(candidate) if candidate.is_main_model_file => candidates.push(candidate),
            Ok(_) => {}
            Err(err) => warn!("Skipping unreadable model file {}: {}", path.display(), err),
        }
    }
    Ok(quantization::rank(&candidates))
}

fn describe(name: &str, file: GgufCandidate, candidates: Vec<GgufCandidate>) -> ModelDescriptor {
    let modified_at = std::fs::metadata(&file.path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());

    ModelDescriptor {
        name: name.to_string(),
        identity: ModelIdentity::for_file(&file.path),
        path: file.path.clone(),
        quantization: file.quantization_label.clone(),
        size_bytes: file.size_bytes,
        modified_at,
        candidates,
    }
}
