use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result as AnyResult;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama;
use candle_transformers::models::quantized_llama;

use crate::error::{LoomError, Result};
use crate::types::{GenerationParams, InferenceLibrary, ModelRole};

use super::gpt2::Gpt2;
use super::tokenizer::TextTokenizer;
use super::{CancelFlag, LoadedModel, TokenEstimator};

/// The network weights of a loaded model, one case per supported architecture.
pub(crate) enum Network {
    Gpt2(Gpt2),
    Llama {
        model: llama::Llama,
        config: llama::Config,
        dtype: DType,
        cache: Option<llama::Cache>,
    },
    QuantizedLlama(quantized_llama::ModelWeights),
}

impl Network {
    /// Reset per-generation state.
    fn begin(&mut self, device: &Device) -> candle_core::Result<()> {
        match self {
            Network::Gpt2(model) => {
                model.clear_kv_cache();
                Ok(())
            }
            Network::Llama {
                config,
                dtype,
                cache,
                ..
            } => {
                *cache = Some(llama::Cache::new(true, *dtype, config, device)?);
                Ok(())
            }
            // quantized_llama drops its cache whenever index_pos is 0
            Network::QuantizedLlama(_) => Ok(()),
        }
    }

    /// Logits for the last input position, shape `[1, vocab]`.
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        match self {
            Network::Gpt2(model) => model.forward(input, index_pos),
            Network::Llama { model, cache, .. } => {
                let cache = cache.as_mut().ok_or_else(|| {
                    candle_core::Error::Msg("kv cache not initialised".to_string())
                })?;
                model.forward(input, index_pos, cache)
            }
            Network::QuantizedLlama(model) => model.forward(input, index_pos),
        }
    }
}

enum Decoded {
    Finished(Vec<u32>),
    Cancelled,
}

/// A model loaded by one of the candle-backed adapters.
pub struct NativeModel {
    library: InferenceLibrary,
    role: ModelRole,
    identifier: String,
    device: Device,
    max_context: usize,
    network: Option<Network>,
    tokenizer: TextTokenizer,
}

impl NativeModel {
    pub(crate) fn new(
        library: InferenceLibrary,
        role: ModelRole,
        identifier: String,
        device: Device,
        max_context: usize,
        network: Network,
        tokenizer: TextTokenizer,
    ) -> Self {
        Self {
            library,
            role,
            identifier,
            device,
            max_context,
            network: Some(network),
            tokenizer,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn decode_loop(
        network: &mut Network,
        tokenizer: &TextTokenizer,
        device: &Device,
        prompt_ids: &[u32],
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> AnyResult<Decoded> {
        network.begin(device)?;

        let seed = params.seed.unwrap_or_else(time_seed);
        let mut logits_processor = LogitsProcessor::from_sampling(
            seed,
            Sampling::TopKThenTopP {
                k: params.top_k,
                p: params.top_p,
                temperature: params.temperature,
            },
        );

        let mut tokens = prompt_ids.to_vec();
        let mut generated = Vec::with_capacity(params.max_new_tokens);
        let mut index_pos = 0;

        for step in 0..params.max_new_tokens {
            if cancel.is_cancelled() {
                return Ok(Decoded::Cancelled);
            }

            let context = if step == 0 {
                &tokens[..]
            } else {
                &tokens[tokens.len() - 1..]
            };
            let input = Tensor::new(context, device)?.unsqueeze(0)?;
            let logits = network
                .forward(&input, index_pos)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            index_pos += context.len();

            let next = logits_processor.sample(&logits)?;
            if tokenizer.is_eos(next) {
                break;
            }
            tokens.push(next);
            generated.push(next);
        }

        Ok(Decoded::Finished(generated))
    }
}

impl TokenEstimator for NativeModel {
    fn estimate_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    fn prompt_tokens(&self, prompt: &str) -> usize {
        self.tokenizer.prompt_len(prompt)
    }
}

impl LoadedModel for NativeModel {
    fn library(&self) -> InferenceLibrary {
        self.library
    }

    fn max_context(&self) -> usize {
        self.max_context
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<String> {
        let network = self
            .network
            .as_mut()
            .ok_or(LoomError::ModelNotLoaded { role: self.role })?;

        let mut prompt_ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(LoomError::generation_with)?;
        if prompt_ids.is_empty() {
            let seed = self.tokenizer.seed_token().ok_or_else(|| {
                LoomError::generation("prompt is empty and the tokenizer has no BOS or EOS token")
            })?;
            prompt_ids.push(seed);
        }

        let required = prompt_ids.len().saturating_add(params.max_new_tokens);
        if required > self.max_context {
            return Err(LoomError::ContextOverflow {
                max_context: self.max_context,
                required,
                max_new_tokens: params.max_new_tokens,
            });
        }

        let start = Instant::now();
        let decoded = Self::decode_loop(
            network,
            &self.tokenizer,
            &self.device,
            &prompt_ids,
            params,
            cancel,
        )
        .map_err(|e| {
            tracing::error!(
                identifier = %self.identifier,
                error = %format!("{:#}", e),
                "native generation fault"
            );
            LoomError::generation_with(e)
        })?;

        match decoded {
            Decoded::Cancelled => Err(LoomError::generation("generation was cancelled")),
            Decoded::Finished(generated) => {
                tracing::debug!(
                    identifier = %self.identifier,
                    prompt_tokens = prompt_ids.len(),
                    new_tokens = generated.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "generation complete"
                );
                self.tokenizer
                    .decode(&generated)
                    .map_err(LoomError::generation_with)
            }
        }
    }

    fn unload(&mut self) -> Result<()> {
        if self.network.take().is_some() {
            tracing::info!(
                identifier = %self.identifier,
                library = %self.library,
                "model weights released"
            );
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.network.is_some()
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(299_792_458)
}

/// Clamp a requested window to what the network was trained for.
pub(crate) fn effective_context(
    identifier: &str,
    requested: usize,
    native: Option<usize>,
) -> usize {
    match native {
        Some(native) if native < requested => {
            tracing::warn!(
                identifier,
                requested,
                native,
                "max_context exceeds the model's trained window; clamping"
            );
            native
        }
        _ => requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarBuilder;
    use std::str::FromStr;
    use tokenizers::Tokenizer;

    use super::super::gpt2::Gpt2Config;
    use crate::context::{ContextAssembler, PromptFrame, Selection};

    const WORD_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<|endoftext|>": 0, "once": 1, "upon": 2, "a": 3, "time": 4, "[UNK]": 5, "<s>": 6
            },
            "unk_token": "[UNK]"
        }
    }"#;

    /// Prepends `<s>` to every encoding, as llama tokenizers do.
    const BOS_TEMPLATE: &str = r#""post_processor": {
        "type": "TemplateProcessing",
        "single": [
            {"SpecialToken": {"id": "<s>", "type_id": 0}},
            {"Sequence": {"id": "A", "type_id": 0}}
        ],
        "pair": [
            {"SpecialToken": {"id": "<s>", "type_id": 0}},
            {"Sequence": {"id": "A", "type_id": 0}},
            {"Sequence": {"id": "B", "type_id": 1}}
        ],
        "special_tokens": {"<s>": {"id": "<s>", "ids": [6], "tokens": ["<s>"]}}
    }"#;

    fn word_tokenizer() -> TextTokenizer {
        TextTokenizer::from_tokenizer(Tokenizer::from_str(WORD_TOKENIZER).unwrap())
    }

    fn bos_tokenizer() -> TextTokenizer {
        let json = WORD_TOKENIZER.replace(r#""post_processor": null"#, BOS_TEMPLATE);
        TextTokenizer::from_tokenizer(Tokenizer::from_str(&json).unwrap())
    }

    fn tiny_model(max_context: usize) -> NativeModel {
        tiny_model_with(max_context, word_tokenizer())
    }

    fn tiny_model_with(max_context: usize, tokenizer: TextTokenizer) -> NativeModel {
        let cfg = Gpt2Config {
            vocab_size: 7,
            n_positions: 16,
            n_embd: 8,
            n_layer: 1,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
        };
        let gpt2 = Gpt2::load(VarBuilder::zeros(DType::F32, &Device::Cpu), &cfg).unwrap();
        NativeModel::new(
            InferenceLibrary::Transformers,
            ModelRole::Primary,
            "tiny".to_string(),
            Device::Cpu,
            max_context,
            Network::Gpt2(gpt2),
            tokenizer,
        )
    }

    fn params(max_new_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_new_tokens,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_runs_on_zero_weights() {
        let mut model = tiny_model(16);
        let result = model.generate("once upon a time", &params(3), &CancelFlag::new());
        assert!(result.is_ok());
    }

    #[test]
    fn test_engine_level_overflow() {
        let mut model = tiny_model(6);
        let err = model
            .generate("once upon a time", &params(3), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(
            err,
            LoomError::ContextOverflow { max_context: 6, required: 7, .. }
        ));
    }

    #[test]
    fn test_huge_max_new_tokens_is_an_overflow() {
        let mut model = tiny_model(16);
        let err = model
            .generate("once upon a time", &params(usize::MAX), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(
            err,
            LoomError::ContextOverflow { max_context: 16, required: usize::MAX, .. }
        ));
        assert!(model.is_loaded());
    }

    #[test]
    fn test_truncated_prompt_fits_when_tokenizer_adds_bos() {
        let mut model = tiny_model_with(10, bos_tokenizer());
        let story = "once upon a time once upon a time once upon a time";
        let bundle = ContextAssembler::new(&model, model.max_context())
            .assemble(story, &Selection::default(), &PromptFrame::plain(), 4)
            .unwrap();

        assert!(bundle.truncated);
        assert!(bundle.prompt.ends_with("once upon a time"));
        let encoded = model.tokenizer.encode(&bundle.prompt, true).unwrap();
        assert_eq!(bundle.estimated_tokens, encoded.len());
        assert!(bundle.estimated_tokens + 4 <= 10);
        assert!(model.generate(&bundle.prompt, &params(4), &CancelFlag::new()).is_ok());
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let mut model = tiny_model(16);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = model.generate("once", &params(3), &cancel).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_unload_is_idempotent() {
        let mut model = tiny_model(16);
        assert!(model.is_loaded());
        model.unload().unwrap();
        model.unload().unwrap();
        assert!(!model.is_loaded());
        let err = model.generate("once", &params(1), &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, LoomError::ModelNotLoaded { .. }));
    }

    #[test]
    fn test_estimate_uses_tokenizer() {
        let model = tiny_model(16);
        assert_eq!(model.estimate_tokens("once upon a time"), 4);
        let longer = model.estimate_tokens("once upon a time time");
        assert!(longer >= model.estimate_tokens("once upon a time"));
    }

    #[test]
    fn test_effective_context_clamps() {
        assert_eq!(effective_context("m", 4096, Some(1024)), 1024);
        assert_eq!(effective_context("m", 512, Some(1024)), 512);
        assert_eq!(effective_context("m", 512, None), 512);
    }
}
