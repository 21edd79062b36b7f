//! Safe Rust wrapper for a llama.cpp context.

use super::llama_ffi::{self, LlamaContext, LlamaToken, LlamaTokenData, LlamaTokenDataArray};
use std::ffi::{CStr, CString};
use std::path::Path;
use std::ptr;

use tracing::info;

use crate::config::ContextParams;
use crate::engine::{CandidateSet, EngineError, InferenceBackend, TokenId};

/// Size of the fixed RNG region at the start of a llama.cpp state blob
const LLAMA_MAX_RNG_STATE: usize = 64 * 1024;
/// Offset of the logits element count: rng size, rng buffer, logits capacity
const LOGITS_SIZE_OFFSET: usize = 2 * std::mem::size_of::<usize>() + LLAMA_MAX_RNG_STATE;

/// Whether a llama.cpp state blob carries logits.
///
/// Layout: `rng_size | rng[LLAMA_MAX_RNG_STATE] | logits_cap | logits_size | ...`,
/// all sizes native `size_t`.
fn state_has_logits(state: &[u8]) -> bool {
    const WIDTH: usize = std::mem::size_of::<usize>();
    match state.get(LOGITS_SIZE_OFFSET..LOGITS_SIZE_OFFSET + WIDTH) {
        Some(bytes) => {
            let mut raw = [0u8; WIDTH];
            raw.copy_from_slice(bytes);
            usize::from_ne_bytes(raw) > 0
        }
        None => false,
    }
}

/// One llama.cpp context with its own model handle.
///
/// The context is freed on drop.
pub struct LlamaEngine {
    ctx: *mut LlamaContext,
    n_vocab: usize,
    n_ctx: usize,
    /// Logits were produced by an eval or restored with the state
    has_logits: bool,
}

// Safety: the context is only touched through &self/&mut self on one thread at a time
unsafe impl Send for LlamaEngine {}

impl LlamaEngine {
    fn state_size_raw(&self) -> usize {
        unsafe { llama_ffi::llama_get_state_size(self.ctx) }
    }
}

impl InferenceBackend for LlamaEngine {
    fn load(model_path: &Path, params: &ContextParams) -> Result<Self, EngineError> {
        let path_str = model_path.to_str().ok_or_else(|| EngineError::ModelLoad {
            path: model_path.display().to_string(),
            reason: "path is not valid UTF-8".to_string(),
        })?;
        let c_path = CString::new(path_str).map_err(|_| EngineError::ModelLoad {
            path: path_str.to_string(),
            reason: "path contains null bytes".to_string(),
        })?;
        let n_ctx = i32::try_from(params.context_length)
            .map_err(|_| EngineError::InvalidConfig("context_length exceeds i32".to_string()))?;

        let mut lparams = unsafe { llama_ffi::llama_context_default_params() };
        lparams.n_ctx = n_ctx;
        // llama.cpp takes a C int seed; keep the low 31 bits so it stays non-negative
        lparams.seed = (params.seed & 0x7fff_ffff) as i32;
        lparams.f16_kv = params.use_half_precision_cache;
        lparams.use_mmap = params.use_mmap;
        lparams.use_mlock = params.use_mlock;

        let ctx = unsafe { llama_ffi::llama_init_from_file(c_path.as_ptr(), lparams) };
        if ctx.is_null() {
            return Err(EngineError::ModelLoad {
                path: path_str.to_string(),
                reason: "llama_init_from_file returned null".to_string(),
            });
        }

        let n_vocab = unsafe { llama_ffi::llama_n_vocab(ctx) }.max(0) as usize;
        let n_ctx = unsafe { llama_ffi::llama_n_ctx(ctx) }.max(0) as usize;
        let engine = Self {
            ctx,
            n_vocab,
            n_ctx,
            has_logits: false,
        };
        info!(
            "llama.cpp context created: n_vocab={}, n_ctx={}, state_size={}",
            n_vocab,
            n_ctx,
            engine.state_size_raw()
        );
        Ok(engine)
    }

    fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let c_text = CString::new(text)
            .map_err(|_| EngineError::InvalidConfig("text contains null bytes".to_string()))?;
        let mut tokens: Vec<LlamaToken> = vec![0; self.n_ctx];
        let n = unsafe {
            llama_ffi::llama_tokenize(
                self.ctx,
                c_text.as_ptr(),
                tokens.as_mut_ptr(),
                self.n_ctx as i32,
                add_bos,
            )
        };
        if n < 0 {
            return Err(EngineError::TokenizeOverflow {
                needed: n.unsigned_abs() as usize,
                capacity: self.n_ctx,
            });
        }
        tokens.truncate(n as usize);
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
        let ret = unsafe {
            llama_ffi::llama_eval(
                self.ctx,
                tokens.as_ptr(),
                tokens.len() as i32,
                n_past as i32,
                n_threads as i32,
            )
        };
        if ret != 0 {
            self.has_logits = false;
            return Err(EngineError::EvalFailed(format!(
                "llama_eval returned {} at n_past={}",
                ret, n_past
            )));
        }
        self.has_logits = true;
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        if !self.has_logits {
            return &[];
        }
        let ptr = unsafe { llama_ffi::llama_get_logits(self.ctx) };
        if ptr.is_null() {
            return &[];
        }
        // Without logits_all the buffer holds one row of n_vocab entries
        unsafe { std::slice::from_raw_parts(ptr, self.n_vocab) }
    }

    fn has_logits(&self) -> bool {
        self.has_logits
    }

    fn sample(&mut self, candidates: &mut CandidateSet) -> TokenId {
        let mut data: Vec<LlamaTokenData> = candidates
            .data
            .iter()
            .map(|c| LlamaTokenData {
                id: c.id,
                logit: c.logit,
                p: c.p,
            })
            .collect();
        let mut array = LlamaTokenDataArray {
            data: data.as_mut_ptr(),
            size: data.len(),
            sorted: candidates.sorted,
        };
        unsafe { llama_ffi::llama_sample_token(self.ctx, &mut array) }
    }

    fn token_to_str(&self, token: TokenId) -> String {
        let ptr = unsafe { llama_ffi::llama_token_to_str(self.ctx, token) };
        if ptr.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn state_size(&self) -> usize {
        self.state_size_raw()
    }

    fn copy_state_data(&self, dst: &mut [u8]) -> Result<usize, EngineError> {
        let expected = self.state_size_raw();
        if dst.len() < expected {
            return Err(EngineError::StateSize {
                expected,
                actual: dst.len(),
            });
        }
        Ok(unsafe { llama_ffi::llama_copy_state_data(self.ctx, dst.as_mut_ptr()) })
    }

    fn set_state_data(&mut self, src: &[u8]) -> Result<usize, EngineError> {
        let expected = self.state_size_raw();
        if src.len() != expected {
            return Err(EngineError::StateSize {
                expected,
                actual: src.len(),
            });
        }
        // llama.cpp only reads from src despite the mutable pointer
        let mut buf = src.to_vec();
        let read = unsafe { llama_ffi::llama_set_state_data(self.ctx, buf.as_mut_ptr()) };
        if read > expected {
            return Err(EngineError::CorruptState(format!(
                "llama_set_state_data read {} bytes of {}",
                read, expected
            )));
        }
        self.has_logits = state_has_logits(src);
        Ok(read)
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        if !self.ctx.is_null() {
            unsafe {
                llama_ffi::llama_free(self.ctx);
            }
            self.ctx = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InferenceSession;

    fn blob_with_logits_size(n: usize) -> Vec<u8> {
        let mut blob = vec![0u8; LOGITS_SIZE_OFFSET + 64];
        let width = std::mem::size_of::<usize>();
        blob[LOGITS_SIZE_OFFSET..LOGITS_SIZE_OFFSET + width].copy_from_slice(&n.to_ne_bytes());
        blob
    }

    #[test]
    fn test_state_has_logits_reads_logits_size() {
        assert!(!state_has_logits(&blob_with_logits_size(0)));
        assert!(state_has_logits(&blob_with_logits_size(32000)));
        assert!(!state_has_logits(&[0u8; 16]));
    }

    // Note: these tests need libllama linked and a model at LLAMA_TEST_MODEL.

    fn model_path() -> std::path::PathBuf {
        std::env::var("LLAMA_TEST_MODEL")
            .unwrap_or_else(|_| "models/7B/ggml-model.bin".to_string())
            .into()
    }

    #[test]
    #[ignore = "Requires libllama and a model file"]
    fn test_state_size_is_stable_across_contexts() {
        let params = ContextParams::default();
        let a = LlamaEngine::load(&model_path(), &params).unwrap();
        let b = LlamaEngine::load(&model_path(), &params).unwrap();
        assert_eq!(a.state_size(), b.state_size());
    }

    #[test]
    #[ignore = "Requires libllama and a model file"]
    fn test_restore_reproduces_logits() {
        let params = ContextParams::default();
        let mut a = InferenceSession::<LlamaEngine>::create(&model_path(), &params).unwrap();
        let tokens = a.tokenize("The quick brown fox").unwrap();
        a.evaluate(&tokens).unwrap();
        let state = a.capture_state().unwrap();

        let mut b = InferenceSession::<LlamaEngine>::create(&model_path(), &params).unwrap();
        b.restore_state(&state).unwrap();
        assert_eq!(a.logits().unwrap(), b.logits().unwrap());
    }
}
