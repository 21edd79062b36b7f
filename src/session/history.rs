//! Rolling window of recently consumed and generated tokens.

use std::collections::VecDeque;

use crate::engine::TokenId;

/// Bounded token history.
///
/// Once `capacity` tokens are held, each append evicts the oldest one.
/// The history is bookkeeping for the harness only; eviction never touches
/// engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHistory {
    tokens: VecDeque<TokenId>,
    capacity: usize,
}

impl TokenHistory {
    /// Empty history holding at most `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Full history of zero tokens, the usual starting point for a
    /// repetition window.
    pub fn zeroed(capacity: usize) -> Self {
        Self {
            tokens: std::iter::repeat(0).take(capacity).collect(),
            capacity,
        }
    }

    /// Append a token, evicting the oldest when full.
    pub fn append(&mut self, token: TokenId) {
        if self.capacity == 0 {
            return;
        }
        if self.tokens.len() == self.capacity {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token);
    }

    pub fn extend(&mut self, tokens: &[TokenId]) {
        for &token in tokens {
            self.append(token);
        }
    }

    /// Independent deep copy, for forking a run.
    pub fn snapshot_copy(&self) -> Self {
        self.clone()
    }

    /// Replace contents and capacity with a previously taken copy.
    pub fn restore(&mut self, copy: &TokenHistory) {
        self.tokens.clone_from(&copy.tokens);
        self.capacity = copy.capacity;
    }

    /// Rebuild a history from saved tokens, keeping the newest `capacity`.
    ///
    /// Only the kept tokens are allocated, whatever `capacity` says.
    pub fn from_tokens(capacity: usize, tokens: &[TokenId]) -> Self {
        let keep = tokens.len().min(capacity);
        Self {
            tokens: tokens[tokens.len() - keep..].iter().copied().collect(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent token, if any.
    pub fn last(&self) -> Option<TokenId> {
        self.tokens.back().copied()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.tokens.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<TokenId> {
        self.iter().collect()
    }

    /// Contiguous view, oldest first.
    pub fn as_slice(&mut self) -> &[TokenId] {
        self.tokens.make_contiguous()
    }
}
