//! FFI bindings to llama.cpp.
//!
//! These bindings match the C API in llama.h from the May 2023 releases
//! (file-based `llama_init_from_file`, `llama_sample_token`, state copy
//! functions). The struct layouts must match the linked library exactly.

use libc::{c_char, c_float, c_int, c_void, size_t};

pub type LlamaToken = c_int;

/// Opaque context handle
#[repr(C)]
pub struct LlamaContext {
    _private: [u8; 0],
}

/// One candidate passed to the sampler
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LlamaTokenData {
    pub id: LlamaToken,
    pub logit: c_float,
    pub p: c_float,
}

#[repr(C)]
pub struct LlamaTokenDataArray {
    pub data: *mut LlamaTokenData,
    pub size: size_t,
    pub sorted: bool,
}

pub type LlamaProgressCallback = Option<unsafe extern "C" fn(progress: c_float, ctx: *mut c_void)>;

/// Context configuration. Obtain defaults from `llama_context_default_params`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LlamaContextParams {
    pub n_ctx: c_int,
    pub n_gpu_layers: c_int,
    pub seed: c_int,
    pub f16_kv: bool,
    pub logits_all: bool,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding: bool,
    pub progress_callback: LlamaProgressCallback,
    pub progress_callback_user_data: *mut c_void,
}

// Link to the prebuilt llama library (see build.rs)
#[link(name = "llama")]
extern "C" {
    pub fn llama_context_default_params() -> LlamaContextParams;

    // Context lifecycle
    pub fn llama_init_from_file(
        path_model: *const c_char,
        params: LlamaContextParams,
    ) -> *mut LlamaContext;

    pub fn llama_free(ctx: *mut LlamaContext);

    // State
    pub fn llama_get_state_size(ctx: *const LlamaContext) -> size_t;

    pub fn llama_copy_state_data(ctx: *mut LlamaContext, dst: *mut u8) -> size_t;

    pub fn llama_set_state_data(ctx: *mut LlamaContext, src: *mut u8) -> size_t;

    // Inference
    pub fn llama_eval(
        ctx: *mut LlamaContext,
        tokens: *const LlamaToken,
        n_tokens: c_int,
        n_past: c_int,
        n_threads: c_int,
    ) -> c_int;

    pub fn llama_tokenize(
        ctx: *mut LlamaContext,
        text: *const c_char,
        tokens: *mut LlamaToken,
        n_max_tokens: c_int,
        add_bos: bool,
    ) -> c_int;

    pub fn llama_get_logits(ctx: *mut LlamaContext) -> *mut c_float;

    pub fn llama_sample_token(
        ctx: *mut LlamaContext,
        candidates: *mut LlamaTokenDataArray,
    ) -> LlamaToken;

    // Model info
    pub fn llama_n_vocab(ctx: *const LlamaContext) -> c_int;
    pub fn llama_n_ctx(ctx: *const LlamaContext) -> c_int;

    pub fn llama_token_to_str(ctx: *const LlamaContext, token: LlamaToken) -> *const c_char;
}
