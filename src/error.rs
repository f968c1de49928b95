// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Crate-wide error type.
//!
//! Every variant is a programmer or configuration error surfaced synchronously;
//! nothing here is retried.

use thiserror::Error;

use crate::tensor::TensorError;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("cannot forward sequence of length {seq_len}, block size is only {block_size}")]
    SequenceTooLong { seq_len: usize, block_size: usize },

    #[error("cannot attend to {max_seq_length}, block size is only {block_size}")]
    MaxSeqLenTooLong {
        max_seq_length: usize,
        block_size: usize,
    },

    #[error("cannot forward sequence of length {seq_len}, max seq length is only {max_seq_length}")]
    DecodeLengthExceeded {
        seq_len: usize,
        max_seq_length: usize,
    },

    #[error("expected {expected} input positions, got {got}")]
    PositionCountMismatch { expected: usize, got: usize },

    #[error("input position {position} is outside the block size {block_size}")]
    PositionOutOfRange { position: usize, block_size: usize },

    #[error("cannot forward an empty input of shape ({batch}, {seq})")]
    EmptyInput { batch: usize, seq: usize },

    #[error("token id {token} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[error("no checkpoint uses non-parallel residual together with a shared attention norm")]
    UnsupportedResidual,

    #[error("learnable threshold already initialized")]
    AlreadyInitialized,

    #[error("cannot initialize a learnable threshold from an empty batch")]
    EmptyThresholdBatch,

    #[error("cache overflow: {tokens} tokens written past the last slot of a {capacity}-slot cache")]
    CacheOverflow { tokens: usize, capacity: usize },

    #[error("kv cache holds {capacity} slots but max seq length is {max_seq_length}; reset the cache first")]
    CacheLengthMismatch {
        capacity: usize,
        max_seq_length: usize,
    },

    #[error("backward requires a preceding full-sequence forward in training mode")]
    BackwardUnavailable,

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("missing parameter `{0}`")]
    MissingParameter(String),

    #[error("parameter `{name}` expects shape {expected:?}, got {got:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
