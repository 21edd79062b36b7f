//! KV cache for the reference engine.
//!
//! Stores key and value projections per layer so decoding one token only
//! attends over cached positions. Entries are either full f32 or rounded to
//! bf16; in half precision the serialized form uses two bytes per element.

/// KV cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCacheConfig {
    /// Number of transformer layers
    pub num_layers: usize,
    /// Width of one key/value vector
    pub head_dim: usize,
    /// Maximum sequence length
    pub max_seq_len: usize,
    /// Keep entries in 16-bit precision
    pub half_precision: bool,
}

impl KVCacheConfig {
    /// Bytes per stored element in serialized form.
    pub fn elem_bytes(&self) -> usize {
        if self.half_precision {
            2
        } else {
            4
        }
    }

    /// Serialized size of the whole cache, excluding the length field.
    pub fn serialized_bytes(&self) -> usize {
        self.num_layers * 2 * self.max_seq_len * self.head_dim * self.elem_bytes()
    }
}

/// Single layer's KV cache
pub struct LayerKVCache {
    /// Key cache: [max_seq_len, head_dim]
    keys: Vec<f32>,
    /// Value cache: [max_seq_len, head_dim]
    values: Vec<f32>,
    head_dim: usize,
    max_seq_len: usize,
    half_precision: bool,
}

impl LayerKVCache {
    pub fn new(head_dim: usize, max_seq_len: usize, half_precision: bool) -> Self {
        let cache_size = max_seq_len * head_dim;
        Self {
            keys: vec![0.0; cache_size],
            values: vec![0.0; cache_size],
            head_dim,
            max_seq_len,
            half_precision,
        }
    }

    /// Store key/value at the given position.
    pub fn update(&mut self, pos: usize, key: &[f32], value: &[f32]) {
        debug_assert!(pos < self.max_seq_len, "Position exceeds max_seq_len");
        debug_assert_eq!(key.len(), self.head_dim, "Key size mismatch");
        debug_assert_eq!(value.len(), self.head_dim, "Value size mismatch");

        let offset = pos * self.head_dim;
        let half = self.half_precision;
        let store = |dst: &mut [f32], src: &[f32]| {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = if half { bf16_to_f32(f32_to_bf16(s)) } else { s };
            }
        };
        store(&mut self.keys[offset..offset + self.head_dim], key);
        store(&mut self.values[offset..offset + self.head_dim], value);
    }

    /// Key at a specific position.
    pub fn key_at(&self, pos: usize) -> &[f32] {
        let offset = pos * self.head_dim;
        &self.keys[offset..offset + self.head_dim]
    }

    /// Value at a specific position.
    pub fn value_at(&self, pos: usize) -> &[f32] {
        let offset = pos * self.head_dim;
        &self.values[offset..offset + self.head_dim]
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for buf in [&self.keys, &self.values] {
            for &x in buf.iter() {
                if self.half_precision {
                    out.extend_from_slice(&f32_to_bf16(x).to_le_bytes());
                } else {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
    }

    fn read_from(&mut self, data: &[u8]) {
        let elem = if self.half_precision { 2 } else { 4 };
        let (k_bytes, v_bytes) = data.split_at(self.keys.len() * elem);
        for (buf, bytes) in [(&mut self.keys, k_bytes), (&mut self.values, v_bytes)] {
            for (x, chunk) in buf.iter_mut().zip(bytes.chunks_exact(elem)) {
                *x = if elem == 2 {
                    bf16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]))
                } else {
                    f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                };
            }
        }
    }
}

/// Full KV cache for all layers.
pub struct KVCache {
    layers: Vec<LayerKVCache>,
    /// Number of valid positions
    seq_len: usize,
    pub config: KVCacheConfig,
}

impl KVCache {
    pub fn new(config: KVCacheConfig) -> Self {
        let layers = (0..config.num_layers)
            .map(|_| LayerKVCache::new(config.head_dim, config.max_seq_len, config.half_precision))
            .collect();
        Self {
            layers,
            seq_len: 0,
            config,
        }
    }

    pub fn layer(&self, layer_idx: usize) -> &LayerKVCache {
        &self.layers[layer_idx]
    }

    pub fn update(&mut self, layer_idx: usize, pos: usize, key: &[f32], value: &[f32]) {
        self.layers[layer_idx].update(pos, key, value);
    }

    /// Mark positions `0..seq_len` as valid.
    ///
    /// Positions at or past `seq_len` are stale and are overwritten by the
    /// next update.
    pub fn set_seq_len(&mut self, seq_len: usize) {
        debug_assert!(seq_len <= self.config.max_seq_len);
        self.seq_len = seq_len;
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Append every layer's keys then values to `out`.
    ///
    /// Always writes [`KVCacheConfig::serialized_bytes`] bytes, independent
    /// of how many positions are filled.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for layer in &self.layers {
            layer.write_to(out);
        }
    }

    /// Inverse of [`KVCache::write_to`]. `data` must be exactly
    /// [`KVCacheConfig::serialized_bytes`] long.
    pub fn read_from(&mut self, data: &[u8], seq_len: usize) {
        debug_assert_eq!(data.len(), self.config.serialized_bytes());
        let per_layer = data.len() / self.layers.len().max(1);
        for (layer, chunk) in self.layers.iter_mut().zip(data.chunks_exact(per_layer)) {
            layer.read_from(chunk);
        }
        self.seq_len = seq_len;
    }
}

fn f32_to_bf16(x: f32) -> u16 {
    // Round to nearest even
    let bits = x.to_bits();
    let rounding_bias = 0x7FFF + ((bits >> 16) & 1);
    (bits.wrapping_add(rounding_bias) >> 16) as u16
}

fn bf16_to_f32(x: u16) -> f32 {
    f32::from_bits((x as u32) << 16)
}
