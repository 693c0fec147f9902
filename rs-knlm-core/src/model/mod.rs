//! Top-level module for the Kneser-Ney language-model system.
//!
//! This crate provides a modified Kneser-Ney smoothed n-gram model,
//! including:
//! - The offset-linked trie and smoothing engine (`KneserNeyModel`)
//! - Sequence sampling from an optimized model (`Generator`)
//! - Error kinds shared across training, optimization and persistence
//! - Internal storage primitives (baked child maps, id widths)

/// The n-gram trie and the modified Kneser-Ney engine.
///
/// Exposes training, the one-way optimize transition, the scoring family,
/// and binary persistence.
pub mod kneser_ney_model;

/// Sequence sampling on top of an optimized model.
///
/// Draws continuations proportional to the predicted next-token
/// distribution.
pub mod generator;

/// Error kinds for training, optimization and (de)serialization.
pub mod error;

/// Token-id storage widths (`u8`, `u16`, `u32`).
///
/// The model is generic over the width; it is recorded in serialized
/// models and checked on load.
pub mod word_id;

/// Immutable sorted child map used after optimization.
///
/// This module is not exposed publicly.
mod baked_map;

/// Internal trie node representation (two-phase child map, relative
/// offsets, shared count/log-likelihood slot).
///
/// Not exposed publicly.
mod node;
