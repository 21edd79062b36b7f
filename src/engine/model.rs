//! Pure Rust reference engine.
//!
//! A small decoder-only transformer with a byte-level vocabulary and
//! deterministic pseudo-random weights. Its job is to behave like a real
//! stateful engine at the capability boundary: a KV cache that grows with
//! every eval, logits for the last evaluated token, an internal sampler RNG,
//! and a fixed-size opaque state blob holding all of the above.
//!
//! ## Model artifact
//! Little-endian, 24 bytes:
//! `magic "WFRM" | version u32 | hidden_size u32 | num_layers u32 | weight_seed u64`.
//! All weights are derived from `weight_seed`.
//!
//! ## State blob
//! `rng_seed u64 | rng_draws u64 | logits_len u32 | logits [n_vocab x f32] |
//! kv_len u32 | kv cache`. The size depends only on the context length and
//! KV precision, never on how far a generation has progressed.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use super::backend::{EngineError, InferenceBackend, TokenId};
use super::kv_cache::{KVCache, KVCacheConfig};
use super::sampling::{sample_from_probs, CandidateSet};
use crate::config::ContextParams;

/// Artifact magic, "WFRM" read as little-endian u32
pub const MODEL_MAGIC: u32 = u32::from_le_bytes(*b"WFRM");
pub const MODEL_VERSION: u32 = 1;
const MODEL_HEADER_LEN: usize = 24;

pub const TOKEN_UNK: TokenId = 0;
pub const TOKEN_BOS: TokenId = 1;
pub const TOKEN_EOS: TokenId = 2;
/// Token id of byte 0x00; byte `b` maps to `BYTE_TOKEN_OFFSET + b`
const BYTE_TOKEN_OFFSET: TokenId = 3;
/// Three special tokens plus 256 bytes
pub const REFERENCE_VOCAB_SIZE: usize = 259;

const MAX_HIDDEN_SIZE: u32 = 4096;
const MAX_LAYERS: u32 = 64;
const RMS_NORM_EPS: f32 = 1e-5;

/// Reference model hyperparameters, the whole content of a model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceModelSpec {
    pub hidden_size: u32,
    pub num_layers: u32,
    pub weight_seed: u64,
}

impl Default for ReferenceModelSpec {
    fn default() -> Self {
        Self {
            hidden_size: 32,
            num_layers: 2,
            weight_seed: 0x5eed,
        }
    }
}

impl ReferenceModelSpec {
    pub fn to_bytes(&self) -> [u8; MODEL_HEADER_LEN] {
        let mut out = [0u8; MODEL_HEADER_LEN];
        out[0..4].copy_from_slice(&MODEL_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&MODEL_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.hidden_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.num_layers.to_le_bytes());
        out[16..24].copy_from_slice(&self.weight_seed.to_le_bytes());
        out
    }

    /// Parse and validate an artifact.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        if data.len() < MODEL_HEADER_LEN {
            return Err(format!(
                "file too small: {} bytes, need {}",
                data.len(),
                MODEL_HEADER_LEN
            ));
        }
        let magic = read_u32_at(data, 0);
        if magic != MODEL_MAGIC {
            return Err(format!("invalid magic 0x{:08x}", magic));
        }
        let version = read_u32_at(data, 4);
        if version != MODEL_VERSION {
            return Err(format!("unsupported version {}", version));
        }
        let spec = Self {
            hidden_size: read_u32_at(data, 8),
            num_layers: read_u32_at(data, 12),
            weight_seed: read_u64_at(data, 16),
        };
        if spec.hidden_size == 0 || spec.hidden_size > MAX_HIDDEN_SIZE {
            return Err(format!("hidden_size {} out of range", spec.hidden_size));
        }
        if spec.num_layers == 0 || spec.num_layers > MAX_LAYERS {
            return Err(format!("num_layers {} out of range", spec.num_layers));
        }
        Ok(spec)
    }

    /// Open an artifact, memory-mapped or read into memory.
    pub fn open<P: AsRef<Path>>(path: P, use_mmap: bool) -> Result<Self, String> {
        let path = path.as_ref();
        if use_mmap {
            let file = File::open(path).map_err(|e| e.to_string())?;
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| e.to_string())?;
            Self::parse(&mmap[..])
        } else {
            let data = std::fs::read(path).map_err(|e| e.to_string())?;
            Self::parse(&data)
        }
    }

    /// Write this spec as a model artifact.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.to_bytes())
    }
}

/// Weights for a single layer, each [hidden, hidden] row-major
struct LayerWeights {
    wq: Vec<f32>,
    wk: Vec<f32>,
    wv: Vec<f32>,
    wo: Vec<f32>,
}

/// Counter-based sampler RNG.
///
/// Draw `n` comes from a generator keyed by `(seed, n)`, so the state is just
/// `(seed, draws)` and restoring it costs the same for any `draws`.
struct SamplerRng {
    seed: u64,
    draws: u64,
}

impl SamplerRng {
    fn new(seed: u64) -> Self {
        Self { seed, draws: 0 }
    }

    fn restore(seed: u64, draws: u64) -> Self {
        Self { seed, draws }
    }

    fn generator(&self) -> StdRng {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&self.seed.to_le_bytes());
        key[8..16].copy_from_slice(&self.draws.to_le_bytes());
        StdRng::from_seed(key)
    }

    /// Draw one index from `probs` and advance the counter.
    fn sample_index(&mut self, probs: &[f32]) -> usize {
        let mut rng = self.generator();
        self.draws = self.draws.wrapping_add(1);
        sample_from_probs(probs, &mut rng)
    }
}

/// Deterministic reference inference engine
pub struct ReferenceEngine {
    spec: ReferenceModelSpec,
    n_ctx: usize,
    /// Token embeddings [vocab, hidden], tied with the output projection
    embed_tokens: Vec<f32>,
    layers: Vec<LayerWeights>,
    kv_cache: KVCache,
    logits: Vec<f32>,
    rng: SamplerRng,
    /// Thread pool for the output projection, keyed by thread count
    pool: Option<(usize, rayon::ThreadPool)>,
}

impl ReferenceEngine {
    /// Build an engine directly from a spec, without an artifact on disk.
    pub fn from_spec(spec: ReferenceModelSpec, params: &ContextParams) -> Result<Self, EngineError> {
        if params.context_length == 0 {
            return Err(EngineError::InvalidConfig(
                "context_length must be greater than zero".to_string(),
            ));
        }

        let hidden = spec.hidden_size as usize;
        let mut rng = StdRng::seed_from_u64(spec.weight_seed);
        let mut random = |len: usize, scale: f32| -> Vec<f32> {
            (0..len).map(|_| rng.gen_range(-1.0f32..1.0) * scale).collect()
        };

        let embed_tokens = random(REFERENCE_VOCAB_SIZE * hidden, 1.0);
        let mat_scale = 1.0 / (hidden as f32).sqrt();
        let layers = (0..spec.num_layers)
            .map(|_| LayerWeights {
                wq: random(hidden * hidden, mat_scale),
                wk: random(hidden * hidden, mat_scale),
                wv: random(hidden * hidden, mat_scale),
                wo: random(hidden * hidden, mat_scale),
            })
            .collect();

        let kv_cache = KVCache::new(KVCacheConfig {
            num_layers: spec.num_layers as usize,
            head_dim: hidden,
            max_seq_len: params.context_length,
            half_precision: params.use_half_precision_cache,
        });

        Ok(Self {
            spec,
            n_ctx: params.context_length,
            embed_tokens,
            layers,
            kv_cache,
            logits: Vec::new(),
            rng: SamplerRng::new(params.seed),
            pool: None,
        })
    }

    pub fn spec(&self) -> &ReferenceModelSpec {
        &self.spec
    }

    fn hidden(&self) -> usize {
        self.spec.hidden_size as usize
    }

    fn embedding(&self, token: TokenId) -> &[f32] {
        let h = self.hidden();
        let row = token as usize;
        &self.embed_tokens[row * h..(row + 1) * h]
    }

    /// Run one position through all layers, filling the KV cache at `pos`.
    ///
    /// Returns the normalized final hidden state.
    fn forward_position(&mut self, token: TokenId, pos: usize) -> Vec<f32> {
        let h = self.hidden();
        let mut x: Vec<f32> = self
            .embedding(token)
            .iter()
            .enumerate()
            .map(|(i, &e)| e + positional(pos, i, h))
            .collect();

        let scale = 1.0 / (h as f32).sqrt();
        for layer_idx in 0..self.layers.len() {
            let xn = rms_norm(&x);
            let layer = &self.layers[layer_idx];
            let q = matvec(&layer.wq, &xn);
            let k = matvec(&layer.wk, &xn);
            let v = matvec(&layer.wv, &xn);
            self.kv_cache.update(layer_idx, pos, &k, &v);

            // Attend over cached positions, including this one
            let cache = self.kv_cache.layer(layer_idx);
            let scores: Vec<f32> = (0..=pos).map(|j| dot(&q, cache.key_at(j)) * scale).collect();
            let weights = super::sampling::softmax(&scores);
            let mut attn = vec![0.0f32; h];
            for (j, &w) in weights.iter().enumerate() {
                for (a, &val) in attn.iter_mut().zip(cache.value_at(j)) {
                    *a += w * val;
                }
            }

            let out = matvec(&self.layers[layer_idx].wo, &attn);
            for (xi, o) in x.iter_mut().zip(out) {
                *xi += o;
            }
        }

        rms_norm(&x)
    }

    fn ensure_pool(&mut self, n_threads: usize) -> Result<(), EngineError> {
        if matches!(&self.pool, Some((n, _)) if *n == n_threads) {
            return Ok(());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| EngineError::EvalFailed(format!("thread pool: {}", e)))?;
        self.pool = Some((n_threads, pool));
        Ok(())
    }

    /// Project the final hidden state onto the tied embedding matrix.
    fn compute_logits(&mut self, hidden_state: &[f32]) {
        let h = self.hidden();
        let embed = &self.embed_tokens;
        let mut logits = vec![0.0f32; REFERENCE_VOCAB_SIZE];
        let project = |logits: &mut [f32]| {
            logits
                .par_iter_mut()
                .enumerate()
                .for_each(|(v, l)| *l = dot(&embed[v * h..(v + 1) * h], hidden_state));
        };
        match &self.pool {
            Some((_, pool)) => pool.install(|| project(&mut logits)),
            None => project(&mut logits),
        }
        self.logits = logits;
    }

    fn state_header_size() -> usize {
        8 + 8 + 4 + REFERENCE_VOCAB_SIZE * 4 + 4
    }
}

impl InferenceBackend for ReferenceEngine {
    fn load(model_path: &Path, params: &ContextParams) -> Result<Self, EngineError> {
        let spec = ReferenceModelSpec::open(model_path, params.use_mmap).map_err(|reason| {
            EngineError::ModelLoad {
                path: model_path.display().to_string(),
                reason,
            }
        })?;
        if params.use_mlock {
            debug!("use_mlock has no effect: reference weights are generated in memory");
        }

        let engine = Self::from_spec(spec, params)?;
        info!(
            "Reference engine loaded: {} layers, hidden_size={}, n_ctx={}, state_size={}",
            spec.num_layers,
            spec.hidden_size,
            engine.n_ctx,
            engine.state_size()
        );
        Ok(engine)
    }

    fn n_vocab(&self) -> usize {
        REFERENCE_VOCAB_SIZE
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(TOKEN_BOS);
        }
        tokens.extend(text.bytes().map(|b| BYTE_TOKEN_OFFSET + b as TokenId));

        if tokens.len() > self.n_ctx {
            return Err(EngineError::TokenizeOverflow {
                needed: tokens.len(),
                capacity: self.n_ctx,
            });
        }
        Ok(tokens)
    }

    fn eval(
        &mut self,
        tokens: &[TokenId],
        n_past: usize,
        n_threads: usize,
    ) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::EvalFailed("empty token batch".to_string()));
        }
        if n_past > self.kv_cache.seq_len() {
            return Err(EngineError::EvalFailed(format!(
                "n_past {} is past the {} cached positions",
                n_past,
                self.kv_cache.seq_len()
            )));
        }
        let end = n_past + tokens.len();
        if end > self.n_ctx {
            return Err(EngineError::EvalFailed(format!(
                "positions {}..{} exceed context length {}",
                n_past, end, self.n_ctx
            )));
        }
        if let Some(&bad) = tokens
            .iter()
            .find(|&&t| t < 0 || t as usize >= REFERENCE_VOCAB_SIZE)
        {
            return Err(EngineError::EvalFailed(format!("token {} out of vocabulary", bad)));
        }
        self.ensure_pool(n_threads)?;

        let mut last = Vec::new();
        for (i, &token) in tokens.iter().enumerate() {
            last = self.forward_position(token, n_past + i);
        }
        self.kv_cache.set_seq_len(end);
        self.compute_logits(&last);
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn has_logits(&self) -> bool {
        !self.logits.is_empty()
    }

    fn sample(&mut self, candidates: &mut CandidateSet) -> TokenId {
        candidates.softmax();
        let probs: Vec<f32> = candidates.data.iter().map(|c| c.p).collect();
        let idx = self.rng.sample_index(&probs);
        candidates.data[idx].id
    }

    fn token_to_str(&self, token: TokenId) -> String {
        if (BYTE_TOKEN_OFFSET..REFERENCE_VOCAB_SIZE as TokenId).contains(&token) {
            let byte = (token - BYTE_TOKEN_OFFSET) as u8;
            String::from_utf8_lossy(&[byte]).into_owned()
        } else {
            String::new()
        }
    }

    fn state_size(&self) -> usize {
        Self::state_header_size() + self.kv_cache.config.serialized_bytes()
    }

    fn copy_state_data(&self, dst: &mut [u8]) -> Result<usize, EngineError> {
        let size = self.state_size();
        if dst.len() < size {
            return Err(EngineError::StateSize {
                expected: size,
                actual: dst.len(),
            });
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&self.rng.seed.to_le_bytes());
        out.extend_from_slice(&self.rng.draws.to_le_bytes());
        out.extend_from_slice(&(self.logits.len() as u32).to_le_bytes());
        for v in 0..REFERENCE_VOCAB_SIZE {
            let l = self.logits.get(v).copied().unwrap_or(0.0);
            out.extend_from_slice(&l.to_le_bytes());
        }
        out.extend_from_slice(&(self.kv_cache.seq_len() as u32).to_le_bytes());
        self.kv_cache.write_to(&mut out);
        debug_assert_eq!(out.len(), size);

        dst[..size].copy_from_slice(&out);
        Ok(size)
    }

    fn set_state_data(&mut self, src: &[u8]) -> Result<usize, EngineError> {
        let size = self.state_size();
        if src.len() != size {
            return Err(EngineError::StateSize {
                expected: size,
                actual: src.len(),
            });
        }

        let seed = read_u64_at(src, 0);
        let draws = read_u64_at(src, 8);
        let logits_len = read_u32_at(src, 16) as usize;
        if logits_len != 0 && logits_len != REFERENCE_VOCAB_SIZE {
            return Err(EngineError::CorruptState(format!(
                "logits length {} (vocab {})",
                logits_len, REFERENCE_VOCAB_SIZE
            )));
        }
        let logits_offset = 20;
        let kv_len_offset = logits_offset + REFERENCE_VOCAB_SIZE * 4;
        let kv_len = read_u32_at(src, kv_len_offset) as usize;
        if kv_len > self.n_ctx {
            return Err(EngineError::CorruptState(format!(
                "kv length {} exceeds context length {}",
                kv_len, self.n_ctx
            )));
        }

        self.logits = src[logits_offset..logits_offset + logits_len * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.kv_cache
            .read_from(&src[Self::state_header_size()..], kv_len);
        self.rng = SamplerRng::restore(seed, draws);
        Ok(size)
    }
}

/// Sinusoidal position encoding for element `i` of a `dim`-wide vector.
fn positional(pos: usize, i: usize, dim: usize) -> f32 {
    let exponent = (2 * (i / 2)) as f32 / dim as f32;
    let angle = pos as f32 / 10000f32.powf(exponent);
    if i % 2 == 0 {
        angle.sin()
    } else {
        angle.cos()
    }
}

fn rms_norm(x: &[f32]) -> Vec<f32> {
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
    x.iter().map(|v| v * inv).collect()
}

fn matvec(w: &[f32], x: &[f32]) -> Vec<f32> {
    w.chunks_exact(x.len()).map(|row| dot(row, x)).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64_at(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
