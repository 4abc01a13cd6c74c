//! Completion dispatch: validates a request, obtains the engine, drives it.
//!
//! Requests are checked in a fixed order before any generation call: a model
//! name is present, the catalog knows it, the engine can perform the
//! operation, and (for embeddings) the input is non-empty.

pub mod frames;

use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::config::GenerationDefaults;
use crate::engine::{
    CancellationSignal, ChatMessage, EngineCapabilities, GenerationParams, InferenceEngine,
};
use crate::error::{Error, Result};
use crate::registry::EngineRegistry;

pub use frames::{lookahead, FrameStream, StreamFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Generation,
    Embeddings,
}

impl Operation {
    fn check(&self, capabilities: &EngineCapabilities, model: &str) -> Result<()> {
        match self {
            Operation::Generation if !capabilities.supports_generation => Err(Error::Capability(
                format!("model '{model}' does not support text generation"),
            )),
            Operation::Embeddings if !capabilities.supports_embeddings => Err(Error::Capability(
                format!("model '{model}' does not support embeddings"),
            )),
            _ => Ok(()),
        }
    }
}

/// Prompt source for a generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptInput {
    /// One or more raw prompts; more than one makes a batch.
    Text(Vec<String>),
    /// A conversation rendered with the engine's chat template.
    Chat(Vec<ChatMessage>),
}

/// Sampling options as sent by a client; `None` falls back to configured defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingOptions {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<u64>,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: Option<String>,
    pub input: PromptInput,
    pub options: SamplingOptions,
}

#[derive(Debug, Clone, Default)]
pub struct GeneratedText {
    pub text: String,
    pub fragments: usize,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub model: ModelDescriptor,
    pub choices: Vec<GeneratedText>,
}

pub struct CompletionStream {
    pub model: ModelDescriptor,
    /// Number of responses in the stream; frames carry their index.
    pub batch_size: usize,
    pub frames: FrameStream,
}

#[derive(Debug, Clone)]
pub struct Embeddings {
    pub model: ModelDescriptor,
    pub vectors: Vec<Vec<f32>>,
}

/// A model resolved to a ready engine that supports the requested operation.
pub struct ResolvedModel {
    pub descriptor: ModelDescriptor,
    pub engine: Arc<dyn InferenceEngine>,
}

#[derive(Clone)]
pub struct CompletionDispatcher {
    catalog: Arc<dyn ModelCatalog>,
    registry: EngineRegistry,
    defaults: GenerationDefaults,
}

impl CompletionDispatcher {
    pub fn new(
        catalog: Arc<dyn ModelCatalog>,
        registry: EngineRegistry,
        defaults: GenerationDefaults,
    ) -> Self {
        Self {
            catalog,
            registry,
            defaults,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn ModelCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Steps 1 to 3 of validation: name present, known to the catalog, capable.
    pub async fn resolve(&self, model: Option<&str>, operation: Operation) -> Result<ResolvedModel> {
        let name = model
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Validation("`model` is required".into()))?;

        let descriptor = self
            .catalog
            .lookup(name)
            .await?
            .ok_or_else(|| Error::ModelNotFound(format!("model '{name}' not found")))?;

        let engine = self.registry.get_or_create(&descriptor.identity).await?;
        operation.check(&engine.capabilities()?, name)?;

        Ok(ResolvedModel { descriptor, engine })
    }

    fn params_for(&self, prompt: String, options: &SamplingOptions) -> Result<GenerationParams> {
        GenerationParams {
            prompt,
            max_tokens: options.max_tokens.unwrap_or(self.defaults.max_tokens),
            temperature: options.temperature.unwrap_or(self.defaults.temperature),
            top_p: options.top_p.unwrap_or(self.defaults.top_p),
            seed: options.seed.unwrap_or(self.defaults.seed),
            stop_sequences: options.stop.clone(),
        }
        .validated(self.defaults.max_tokens_ceiling)
    }

    fn prompts_for(engine: &dyn InferenceEngine, input: &PromptInput) -> Result<Vec<String>> {
        match input {
            PromptInput::Text(prompts) => {
                if prompts.is_empty() {
                    return Err(Error::Validation("`prompt` must not be empty".into()));
                }
                Ok(prompts.clone())
            }
            PromptInput::Chat(messages) => {
                if messages.is_empty() {
                    return Err(Error::Validation(
                        "chat request must include at least one message".into(),
                    ));
                }
                Ok(vec![engine.chat_template().render(messages)])
            }
        }
    }

    /// Generate every prompt to completion.
    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationSignal,
    ) -> Result<Completion> {
        let resolved = self
            .resolve(request.model.as_deref(), Operation::Generation)
            .await?;
        let prompts = Self::prompts_for(resolved.engine.as_ref(), &request.input)?;

        let mut choices = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let params = self.params_for(prompt, &request.options)?;
            let mut stream = resolved
                .engine
                .generate_text_stream(params, cancel.clone())
                .await?;
            let mut text = String::new();
            let mut fragments = 0;
            while let Some(fragment) = stream.next().await {
                text.push_str(&fragment?);
                fragments += 1;
            }
            choices.push(GeneratedText { text, fragments });
        }

        Ok(Completion {
            model: resolved.descriptor,
            choices,
        })
    }

    /// Validate and resolve up front, then stream frames for each prompt in order.
    ///
    /// Errors before the first frame are returned directly so the caller can
    /// still answer with a plain error response.
    pub async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationSignal,
    ) -> Result<CompletionStream> {
        let resolved = self
            .resolve(request.model.as_deref(), Operation::Generation)
            .await?;
        let prompts = Self::prompts_for(resolved.engine.as_ref(), &request.input)?;
        let params: Vec<GenerationParams> = prompts
            .into_iter()
            .map(|prompt| self.params_for(prompt, &request.options))
            .collect::<Result<_>>()?;
        let batch_size = params.len();

        let engine = resolved.engine.clone();
        let frames: FrameStream = Box::pin(async_stream::stream! {
            for (index, params) in params.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    debug!("Batch cancelled before prompt {}", index);
                    return;
                }
                let fragments = match engine.generate_text_stream(params, cancel.clone()).await {
                    Ok(fragments) => fragments,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let mut framed = lookahead(index, fragments);
                while let Some(frame) = framed.next().await {
                    let failed = frame.is_err();
                    yield frame;
                    if failed {
                        return;
                    }
                }
            }
        });

        Ok(CompletionStream {
            model: resolved.descriptor,
            batch_size,
            frames,
        })
    }

    /// Embed each input string. The input check runs after capability resolution.
    pub async fn embed(&self, model: Option<&str>, input: Vec<String>) -> Result<Embeddings> {
        let resolved = self.resolve(model, Operation::Embeddings).await?;

        if input.is_empty() {
            return Err(Error::Validation("`input` must not be empty".into()));
        }
        if input.iter().any(|text| text.is_empty()) {
            return Err(Error::Validation(
                "`input` must not contain empty strings".into(),
            ));
        }

        let vectors = resolved.engine.generate_embeddings(&input).await?;
        Ok(Embeddings {
            model: resolved.descriptor,
            vectors,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::dispatcher;
    use super::*;
    use crate::engine::testing::ScriptedEngine;
    use crate::engine::ChatRole;

    fn text_request(model: Option<&str>, prompts: &[&str]) -> CompletionRequest {
        CompletionRequest {
            model: model.map(str::to_string),
            input: PromptInput::Text(prompts.iter().map(|p| p.to_string()).collect()),
            options: SamplingOptions::default(),
        }
    }

    #[tokio::test]
    async fn missing_model_name_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path(), vec![]);
        let err = dispatcher
            .complete(text_request(Some("  "), &["hi"]), CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_model_embeddings_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path(), vec![]);
        let err = dispatcher
            .embed(Some("missing-model"), vec!["hello".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
        assert_eq!(err.code(), "model_not_found");
    }

    #[tokio::test]
    async fn streaming_chat_against_embedding_model_never_generates() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, factory) =
            dispatcher(dir.path(), vec![("embedder", ScriptedEngine::embedding())]);

        let request = CompletionRequest {
            model: Some("embedder".into()),
            input: PromptInput::Chat(vec![ChatMessage::new(ChatRole::User, "hi")]),
            options: SamplingOptions::default(),
        };
        let err = dispatcher
            .stream(request, CancellationSignal::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Capability(_)));
        assert_eq!(factory.engine("embedder").generate_count(), 0);
    }

    #[tokio::test]
    async fn embeddings_against_generation_model_is_capability_error() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) =
            dispatcher(dir.path(), vec![("chat", ScriptedEngine::generating(&["x"]))]);
        let err = dispatcher.embed(Some("chat"), vec![]).await.unwrap_err();
        // Capability is checked before the (also invalid) input.
        assert!(matches!(err, Error::Capability(_)));
    }

    #[tokio::test]
    async fn empty_embedding_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path(), vec![("emb", ScriptedEngine::embedding())]);
        assert!(matches!(
            dispatcher.embed(Some("emb"), vec![]).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            dispatcher.embed(Some("emb"), vec!["ok".into(), String::new()]).await,
            Err(Error::Validation(_))
        ));
        let result = dispatcher.embed(Some("emb"), vec!["abc".into()]).await.unwrap();
        assert_eq!(result.vectors, vec![vec![3.0, 1.0]]);
    }

    #[tokio::test]
    async fn batch_stream_indexes_each_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, factory) =
            dispatcher(dir.path(), vec![("chat", ScriptedEngine::generating(&["a", "b"]))]);

        let stream = dispatcher
            .stream(text_request(Some("chat"), &["one", "two"]), CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(stream.batch_size, 2);
        let frames: Vec<StreamFrame> = stream
            .frames
            .map(|f| f.unwrap())
            .collect()
            .await;

        let summary: Vec<(usize, &str, bool)> = frames
            .iter()
            .map(|f| (f.index, f.content.as_str(), f.is_final))
            .collect();
        assert_eq!(
            summary,
            vec![(0, "a", false), (0, "b", true), (1, "a", false), (1, "b", true)]
        );
        assert_eq!(frames.iter().filter(|f| f.ends_batch(2)).count(), 1);
        assert_eq!(
            *factory.engine("chat").prompts.lock().unwrap(),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[tokio::test]
    async fn chat_prompt_uses_engine_template() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, factory) =
            dispatcher(dir.path(), vec![("chat", ScriptedEngine::generating(&["hey"]))]);
        let request = CompletionRequest {
            model: Some("chat".into()),
            input: PromptInput::Chat(vec![ChatMessage::new(ChatRole::User, "hi")]),
            options: SamplingOptions::default(),
        };

        let completion = dispatcher
            .complete(request, CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(completion.choices[0].text, "hey");
        assert_eq!(completion.choices[0].fragments, 1);
        let prompts = factory.engine("chat").prompts.lock().unwrap().clone();
        assert!(prompts[0].ends_with("<|im_start|>assistant\n"));
    }

    #[tokio::test]
    async fn mid_stream_failure_surfaces_after_emitted_frames() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine {
            fail_after: Some(2),
            ..ScriptedEngine::generating(&["a", "b", "c"])
        };
        let (dispatcher, _) = dispatcher(dir.path(), vec![("chat", engine)]);

        let stream = dispatcher
            .stream(text_request(Some("chat"), &["go", "again"]), CancellationSignal::new())
            .await
            .unwrap();
        let items: Vec<_> = stream.frames.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[..2].iter().all(|f| !f.as_ref().unwrap().is_final));
        assert!(matches!(items[2], Err(Error::Generation { .. })));
    }

    #[tokio::test]
    async fn out_of_range_temperature_fails_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, factory) =
            dispatcher(dir.path(), vec![("chat", ScriptedEngine::generating(&["x"]))]);
        let mut request = text_request(Some("chat"), &["hi"]);
        request.options.temperature = Some(3.0);

        let err = dispatcher
            .stream(request, CancellationSignal::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(factory.engine("chat").generate_count(), 0);
    }
}
