//! GPT-2 decoder in candle, with an incremental key/value cache.
//!
//! Checkpoints come in two layouts: bare (`h.0.attn...`, as the upstream `gpt2` repo
//! ships them) and prefixed with `transformer.`; both are accepted.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Embedding, LayerNorm, VarBuilder};
use serde::Deserialize;

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

/// GPT-2's transposed linear layer: weight is stored as `[in, out]`.
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(vb: VarBuilder, n_in: usize, n_out: usize) -> Result<Self> {
        Ok(Self {
            weight: vb.get((n_in, n_out), "weight")?,
            bias: vb.get(n_out, "bias")?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}

struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            c_attn: Conv1D::load(vb.pp("c_attn"), cfg.n_embd, 3 * cfg.n_embd)?,
            c_proj: Conv1D::load(vb.pp("c_proj"), cfg.n_embd, cfg.n_embd)?,
            n_head: cfg.n_head,
            head_dim: cfg.n_embd / cfg.n_head,
            kv_cache: None,
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&mut self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;
        let q = self.split_heads(&qkv.narrow(2, 0, c)?, b, t)?;
        let k = self.split_heads(&qkv.narrow(2, c, c)?, b, t)?;
        let v = self.split_heads(&qkv.narrow(2, 2 * c, c)?, b, t)?;

        let (k, v) = match &self.kv_cache {
            Some((past_k, past_v)) => (
                Tensor::cat(&[past_k, &k], 2)?,
                Tensor::cat(&[past_v, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let y = weights.matmul(&v)?.transpose(1, 2)?.reshape((b, t, c))?;
        self.c_proj.forward(&y)
    }
}

struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            c_fc: Conv1D::load(vb.pp("c_fc"), cfg.n_embd, 4 * cfg.n_embd)?,
            c_proj: Conv1D::load(vb.pp("c_proj"), 4 * cfg.n_embd, cfg.n_embd)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.c_proj.forward(&self.c_fc.forward(x)?.gelu()?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            ln_1: candle_nn::layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), cfg)?,
            ln_2: candle_nn::layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), cfg)?,
        })
    }

    fn forward(&mut self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let h = (x + self.attn.forward(&self.ln_1.forward(x)?, mask)?)?;
        &h + self.mlp.forward(&self.ln_2.forward(&h)?)?
    }
}

pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    device: Device,
    n_positions: usize,
}

impl Gpt2 {
    pub fn load(vb: VarBuilder, cfg: &Gpt2Config) -> Result<Self> {
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = candle_nn::embedding(cfg.vocab_size, cfg.n_embd, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(cfg.n_positions, cfg.n_embd, vb.pp("wpe"))?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::load(vb.pp(format!("h.{i}")), cfg))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = candle_nn::layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            device: vb.device().clone(),
            n_positions: cfg.n_positions,
        })
    }

    pub fn clear_kv_cache(&mut self) {
        for block in &mut self.blocks {
            block.attn.kv_cache = None;
        }
    }

    /// Logits for the last position of `input_ids` (`[batch, seq]`), as `[batch, vocab]`.
    ///
    /// `index_pos` is the number of tokens already held in the cache.
    pub fn forward(&mut self, input_ids: &Tensor, index_pos: usize) -> Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        if index_pos + t > self.n_positions {
            candle_core::bail!(
                "sequence of {} tokens exceeds the {} positions GPT-2 supports",
                index_pos + t,
                self.n_positions
            );
        }

        let positions =
            Tensor::arange(index_pos as u32, (index_pos + t) as u32, &self.device)?.unsqueeze(0)?;
        let mut x = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        let mask = if t > 1 {
            Some(causal_mask(t, index_pos, &self.device)?)
        } else {
            None
        };
        for block in &mut self.blocks {
            x = block.forward(&x, mask.as_ref())?;
        }

        let x = self.ln_f.forward(&x)?;
        let last = x.i((.., t - 1, ..))?.contiguous()?;
        let logits = last.matmul(&self.wte.embeddings().t()?)?;
        logits.to_dtype(DType::F32)
    }
}

/// `[t, past + t]` additive mask hiding future positions.
fn causal_mask(t: usize, past: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| {
            (0..past + t).map(move |j| if j > i + past { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_slice(&mask, (t, past + t), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            vocab_size: 16,
            n_positions: 8,
            n_embd: 8,
            n_layer: 2,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
        }
    }

    #[test]
    fn test_config_from_hub_json() {
        let raw = r#"{"model_type":"gpt2","vocab_size":50257,"n_positions":1024,"n_ctx":1024,
                      "n_embd":768,"n_layer":12,"n_head":12,"layer_norm_epsilon":1e-05}"#;
        let cfg: Gpt2Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.n_positions, 1024);
        assert_eq!(cfg.n_embd / cfg.n_head, 64);
    }

    #[test]
    fn test_causal_mask_with_past() {
        let mask = causal_mask(2, 1, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![0.0, 0.0, f32::NEG_INFINITY]);
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_forward_shapes_with_cache() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut model = Gpt2::load(vb, &cfg).unwrap();

        let prompt = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let logits = model.forward(&prompt, 0).unwrap();
        assert_eq!(logits.dims(), &[1, cfg.vocab_size]);

        let next = Tensor::new(&[[4u32]], &Device::Cpu).unwrap();
        let logits = model.forward(&next, 3).unwrap();
        assert_eq!(logits.dims(), &[1, cfg.vocab_size]);
    }

    #[test]
    fn test_forward_rejects_overlong_sequences() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut model = Gpt2::load(vb, &cfg).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        assert!(model.forward(&ids, 6).is_err());
    }
}
