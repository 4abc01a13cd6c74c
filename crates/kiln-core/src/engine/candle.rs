//! GGUF engine backed by candle's quantized llama implementation.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::{ModelWeights, MAX_SEQ_LEN};
use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use super::template::ChatTemplate;
use super::text::{text_delta, StopSequenceFilter};
use super::{
    lock_recovering, spawn_producer, CancellationSignal, EngineCapabilities, EngineFactory,
    EngineState, GenerationParams, InferenceEngine, Lifecycle, TextStream,
};
use crate::backend::{BackendDescriptor, DeviceSelector};
use crate::catalog::ModelIdentity;
use crate::config::GenerationDefaults;
use crate::error::{Error, Result};

/// Architectures the quantized llama graph can run.
const GENERATION_ARCHITECTURES: &[&str] = &["llama", "mistral"];

const FALLBACK_EOS_TOKENS: &[&str] = &["</s>", "<|end|>", "<|eot_id|>", "<|endoftext|>"];

#[derive(Debug, Clone, Default)]
pub struct CandleEngineSettings {
    /// Used when no `tokenizer.json` sits next to the model file.
    pub tokenizer_path: Option<PathBuf>,
    pub generation: GenerationDefaults,
}

struct LoadedModel {
    name: String,
    weights: Option<ModelWeights>,
    embeddings: Option<(Embedding, usize)>,
    tokenizer: Tokenizer,
    eos_tokens: Vec<u32>,
}

pub struct CandleGgufEngine {
    identity: ModelIdentity,
    device: Device,
    settings: CandleEngineSettings,
    lifecycle: Lifecycle,
    model: Arc<Mutex<Option<LoadedModel>>>,
    capabilities: OnceLock<EngineCapabilities>,
    template: OnceLock<ChatTemplate>,
    embedding_dim: OnceLock<usize>,
}

impl CandleGgufEngine {
    pub fn new(identity: ModelIdentity, device: Device, settings: CandleEngineSettings) -> Self {
        Self {
            identity,
            device,
            settings,
            lifecycle: Lifecycle::default(),
            model: Arc::new(Mutex::new(None)),
            capabilities: OnceLock::new(),
            template: OnceLock::new(),
            embedding_dim: OnceLock::new(),
        }
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    fn ready_capabilities(&self) -> Result<EngineCapabilities> {
        self.lifecycle.require_ready()?;
        self.capabilities
            .get()
            .copied()
            .ok_or_else(|| Error::Precondition("engine capabilities unknown".into()))
    }
}

fn resolve_tokenizer_path(model_path: &Path, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(parent) = model_path.parent() {
        let sibling = parent.join("tokenizer.json");
        if sibling.exists() {
            return Ok(sibling);
        }
    }
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    Err(Error::ModelLoad(format!(
        "tokenizer.json not found next to {}; set KILN_TOKENIZER_PATH",
        model_path.display()
    )))
}

fn metadata_string(content: &gguf_file::Content, key: &str) -> Option<String> {
    content
        .metadata
        .get(key)
        .and_then(|value| value.to_string().ok())
        .cloned()
}

fn metadata_u32(content: &gguf_file::Content, key: &str) -> Option<u32> {
    content.metadata.get(key).and_then(|value| value.to_u32().ok())
}

fn eos_tokens(
    content: &gguf_file::Content,
    tokenizer: &Tokenizer,
    template: ChatTemplate,
) -> Vec<u32> {
    let mut ids: Vec<u32> = metadata_u32(content, "tokenizer.ggml.eos_token_id")
        .into_iter()
        .collect();
    for marker in template
        .end_of_turn_markers()
        .iter()
        .chain(FALLBACK_EOS_TOKENS)
    {
        if let Some(id) = tokenizer.token_to_id(marker) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

struct LoadOutcome {
    model: LoadedModel,
    capabilities: EngineCapabilities,
    template: ChatTemplate,
}

fn load_blocking(
    model_path: &Path,
    device: &Device,
    settings: &CandleEngineSettings,
) -> Result<LoadOutcome> {
    let mut file = File::open(model_path)?;
    let content = gguf_file::Content::read(&mut file)
        .map_err(|e| Error::ModelLoad(format!("invalid GGUF {}: {}", model_path.display(), e)))?;

    let architecture = metadata_string(&content, "general.architecture").unwrap_or_default();
    let name = metadata_string(&content, "general.name").unwrap_or_else(|| {
        model_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    });
    let template = ChatTemplate::detect(metadata_string(&content, "tokenizer.chat_template").as_deref());
    let has_pooling = content
        .metadata
        .contains_key(&format!("{architecture}.pooling_type"));
    let can_generate = GENERATION_ARCHITECTURES.contains(&architecture.as_str());

    let tokenizer_path = resolve_tokenizer_path(model_path, settings.tokenizer_path.as_deref())?;
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
        Error::ModelLoad(format!(
            "failed to load tokenizer {}: {}",
            tokenizer_path.display(),
            e
        ))
    })?;
    let eos_tokens = eos_tokens(&content, &tokenizer, template);

    let embeddings = if has_pooling {
        let table = content
            .tensor(&mut file, "token_embd.weight", device)
            .map_err(|e| Error::ModelLoad(format!("missing token embeddings: {e}")))?
            .dequantize(device)?;
        let hidden = table.dim(1)?;
        Some((Embedding::new(table, hidden), hidden))
    } else {
        None
    };

    let weights = if can_generate {
        Some(
            ModelWeights::from_gguf(content, &mut file, device)
                .map_err(|e| Error::ModelLoad(format!("failed to load weights: {e}")))?,
        )
    } else {
        None
    };

    if weights.is_none() && embeddings.is_none() {
        return Err(Error::ModelLoad(format!(
            "architecture '{architecture}' supports neither generation nor embeddings"
        )));
    }

    let capabilities = EngineCapabilities {
        supports_embeddings: embeddings.is_some(),
        supports_generation: weights.is_some(),
        supports_gpu: !device.is_cpu(),
    };

    info!(
        "Loaded '{}' ({}) on {}: generation={}, embeddings={}, eos={:?}",
        name,
        architecture,
        DeviceSelector::describe(device),
        capabilities.supports_generation,
        capabilities.supports_embeddings,
        eos_tokens
    );

    Ok(LoadOutcome {
        model: LoadedModel {
            name,
            weights,
            embeddings,
            tokenizer,
            eos_tokens,
        },
        capabilities,
        template,
    })
}

fn decode(tokenizer: &Tokenizer, ids: &[u32]) -> Result<String> {
    tokenizer
        .decode(ids, true)
        .map_err(|e| Error::Tokenization(e.to_string()))
}

fn encode(tokenizer: &Tokenizer, text: &str) -> Result<Vec<u32>> {
    let add_special = !text.starts_with("<|begin_of_text|>");
    tokenizer
        .encode(text, add_special)
        .map(|encoding| encoding.get_ids().to_vec())
        .map_err(|e| Error::Tokenization(e.to_string()))
}

/// Autoregressive loop. Runs on a blocking thread with the model lock held.
fn run_generation(
    model: &Mutex<Option<LoadedModel>>,
    device: &Device,
    params: &GenerationParams,
    defaults: &GenerationDefaults,
    cancel: &CancellationSignal,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let mut guard = lock_recovering(model);
    let loaded = guard
        .as_mut()
        .ok_or_else(|| Error::Precondition("engine has been disposed".into()))?;
    let weights = loaded
        .weights
        .as_mut()
        .ok_or_else(|| Error::Capability("model does not support text generation".into()))?;

    let prompt_tokens = encode(&loaded.tokenizer, &params.prompt)?;
    if prompt_tokens.is_empty() {
        return Err(Error::Validation("prompt produced no tokens".into()));
    }
    if prompt_tokens.len() >= MAX_SEQ_LEN {
        return Err(Error::Validation(format!(
            "prompt is {} tokens; the context holds {}",
            prompt_tokens.len(),
            MAX_SEQ_LEN
        )));
    }
    let budget = params.max_tokens.min(MAX_SEQ_LEN - prompt_tokens.len());

    let temperature = (params.temperature > 0.0).then_some(params.temperature);
    let mut sampler = LogitsProcessor::new(params.seed, temperature, Some(params.top_p));
    let mut stops = StopSequenceFilter::new(&params.stop_sequences);

    let mut all_tokens = prompt_tokens.clone();
    let mut generated: Vec<u32> = Vec::new();
    let mut assembled = String::new();

    let input = Tensor::new(prompt_tokens.as_slice(), device)?.unsqueeze(0)?;
    let mut logits = weights.forward(&input, 0)?;

    for step in 0..budget {
        if cancel.is_cancelled() {
            debug!("Generation cancelled after {} tokens", step);
            return Ok(());
        }

        let mut step_logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        if defaults.repeat_penalty != 1.0 {
            let start = all_tokens.len().saturating_sub(defaults.repeat_last_n);
            step_logits = candle_transformers::utils::apply_repeat_penalty(
                &step_logits,
                defaults.repeat_penalty,
                &all_tokens[start..],
            )?;
        }

        let next = sampler.sample(&step_logits)?;
        if loaded.eos_tokens.contains(&next) {
            break;
        }
        all_tokens.push(next);
        generated.push(next);

        let decoded = decode(&loaded.tokenizer, &generated)?;
        let delta = text_delta(&assembled, &decoded);
        assembled = decoded;

        if !delta.is_empty() {
            let ready = stops.push(&delta);
            if !ready.is_empty() && tx.blocking_send(Ok(ready)).is_err() {
                debug!("Consumer went away; stopping generation");
                return Ok(());
            }
            if stops.stopped() {
                return Ok(());
            }
        }

        if step + 1 < budget {
            let input = Tensor::new(&[next], device)?.unsqueeze(0)?;
            logits = weights.forward(&input, prompt_tokens.len() + step)?;
        }
    }

    let rest = stops.finish();
    if !rest.is_empty() {
        let _ = tx.blocking_send(Ok(rest));
    }
    Ok(())
}

fn embed_blocking(
    model: &Mutex<Option<LoadedModel>>,
    device: &Device,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let guard = lock_recovering(model);
    let loaded = guard
        .as_ref()
        .ok_or_else(|| Error::Precondition("engine has been disposed".into()))?;
    let (table, _) = loaded
        .embeddings
        .as_ref()
        .ok_or_else(|| Error::Capability("model does not support embeddings".into()))?;

    texts
        .iter()
        .map(|text| {
            let ids = encode(&loaded.tokenizer, text)?;
            if ids.is_empty() {
                return Err(Error::Validation("embedding input produced no tokens".into()));
            }
            let ids = Tensor::new(ids.as_slice(), device)?;
            let pooled = table.forward(&ids)?.mean(0)?;
            let norm = pooled.sqr()?.sum_all()?.sqrt()?;
            let normalized = pooled.broadcast_div(&norm)?;
            Ok(normalized.to_dtype(DType::F32)?.to_vec1::<f32>()?)
        })
        .collect()
}

#[async_trait]
impl InferenceEngine for CandleGgufEngine {
    async fn initialize(&self, model_path: &Path) -> Result<()> {
        self.lifecycle.begin_initialize()?;
        info!("Loading GGUF model {}", model_path.display());

        let path = model_path.to_path_buf();
        let device = self.device.clone();
        let settings = self.settings.clone();
        let outcome = tokio::task::spawn_blocking(move || load_blocking(&path, &device, &settings))
            .await
            .map_err(|e| Error::ModelLoad(e.to_string()))
            .and_then(|result| result);

        match outcome {
            Ok(outcome) => {
                if let Some((_, hidden)) = &outcome.model.embeddings {
                    let _ = self.embedding_dim.set(*hidden);
                }
                let _ = self.capabilities.set(outcome.capabilities);
                let _ = self.template.set(outcome.template);
                debug!("Engine for {} ready", outcome.model.name);
                *lock_recovering(&self.model) = Some(outcome.model);
                self.lifecycle.finish_initialize(true);
                Ok(())
            }
            Err(err) => {
                self.lifecycle.finish_initialize(false);
                Err(err)
            }
        }
    }

    fn state(&self) -> EngineState {
        self.lifecycle.current()
    }

    fn capabilities(&self) -> Result<EngineCapabilities> {
        self.ready_capabilities()
    }

    fn chat_template(&self) -> ChatTemplate {
        self.template.get().copied().unwrap_or_default()
    }

    async fn generate_text_stream(
        &self,
        params: GenerationParams,
        cancel: CancellationSignal,
    ) -> Result<TextStream> {
        if !self.ready_capabilities()?.supports_generation {
            return Err(Error::Capability(
                "model does not support text generation".into(),
            ));
        }
        let params = params.validated(self.settings.generation.max_tokens_ceiling)?;

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let model = self.model.clone();
        let device = self.device.clone();
        let defaults = self.settings.generation.clone();

        spawn_producer(tx, move |tx| {
            run_generation(&model, &device, &params, &defaults, &cancel, tx)
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if !self.ready_capabilities()?.supports_embeddings {
            return Err(Error::Capability("model does not support embeddings".into()));
        }

        let model = self.model.clone();
        let device = self.device.clone();
        let texts = texts.to_vec();
        let vectors =
            tokio::task::spawn_blocking(move || embed_blocking(&model, &device, &texts)).await??;

        if let Some(first) = vectors.first() {
            let _ = self.embedding_dim.set(first.len());
        }
        Ok(vectors)
    }

    fn embedding_dimension(&self) -> Option<usize> {
        self.embedding_dim.get().copied()
    }

    async fn dispose(&self) {
        lock_recovering(&self.model).take();
        self.lifecycle.dispose();
        info!("Disposed engine for {}", self.identity);
    }
}

/// Builds candle engines on the device matching the selected backend.
#[derive(Debug, Clone, Default)]
pub struct CandleEngineFactory {
    settings: CandleEngineSettings,
}

impl CandleEngineFactory {
    pub fn new(settings: CandleEngineSettings) -> Self {
        Self { settings }
    }
}

impl EngineFactory for CandleEngineFactory {
    fn create(
        &self,
        identity: &ModelIdentity,
        backend: &BackendDescriptor,
    ) -> Result<Arc<dyn InferenceEngine>> {
        backend.ensure_loaded()?;
        let device = DeviceSelector::for_kind(backend.kind)?;
        Ok(Arc::new(CandleGgufEngine::new(
            identity.clone(),
            device,
            self.settings.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    fn cpu_backend(loaded: bool) -> BackendDescriptor {
        BackendDescriptor {
            kind: BackendKind::Cpu,
            library_path: PathBuf::from("builtin"),
            loaded,
            fell_back: false,
            failure: (!loaded).then(|| "no runtime".to_string()),
        }
    }

    #[test]
    fn factory_refuses_unloaded_backend() {
        let factory = CandleEngineFactory::default();
        let identity = ModelIdentity::new("/models/m.gguf");
        let err = factory.create(&identity, &cpu_backend(false)).err().unwrap();
        assert!(matches!(err, Error::BackendUnavailable(_)));

        let engine = factory.create(&identity, &cpu_backend(true)).unwrap();
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn invalid_file_fails_initialize_and_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.gguf");
        std::fs::write(&path, b"definitely not gguf").unwrap();

        let engine = CandleGgufEngine::new(
            ModelIdentity::new(&path),
            Device::Cpu,
            CandleEngineSettings::default(),
        );
        let err = engine.initialize(&path).await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(matches!(
            engine.capabilities(),
            Err(Error::Precondition(_))
        ));

        // A failed engine may be initialized again.
        assert!(engine.initialize(&path).await.is_err());
    }

    #[tokio::test]
    async fn disposed_engine_rejects_generation() {
        let engine = CandleGgufEngine::new(
            ModelIdentity::new("/models/m.gguf"),
            Device::Cpu,
            CandleEngineSettings::default(),
        );
        engine.dispose().await;
        let params = GenerationParams {
            prompt: "hi".into(),
            max_tokens: 4,
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
            stop_sequences: Vec::new(),
        };
        let err = engine
            .generate_text(params, CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn tokenizer_sibling_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.gguf");
        let sibling = dir.path().join("tokenizer.json");
        std::fs::write(&sibling, "{}").unwrap();
        assert_eq!(resolve_tokenizer_path(&model, None).unwrap(), sibling);

        let other = tempfile::tempdir().unwrap();
        let lonely = other.path().join("m.gguf");
        assert!(matches!(
            resolve_tokenizer_path(&lonely, None),
            Err(Error::ModelLoad(_))
        ));
    }
}
