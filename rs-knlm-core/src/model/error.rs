use std::io;

use thiserror::Error;

/// Errors surfaced by model training, optimization and (de)serialization.
///
/// Scoring calls are infallible by signature; calling them on a model that
/// has not been optimized is a contract violation and panics instead (see
/// the `# Panics` sections on the scoring methods).
#[derive(Debug, Error)]
pub enum ModelError {
	/// The n-gram order passed to the constructor is below 2.
	#[error("n-gram order must be >= 2, got {0}")]
	InvalidOrder(usize),

	/// A token id in a training sequence does not fit the configured id
	/// width. The model never truncates silently; retrain with a wider
	/// instance.
	#[error("token id {token} does not fit a {width}-byte word id")]
	TokenTooWide { token: u32, width: u32 },

	/// Training or optimizing was attempted after `optimize` already ran;
	/// the transition to the serving phase is one-way.
	#[error("model is already optimized")]
	AlreadyOptimized,

	/// A model file was written with a wider word id than this instance
	/// uses. Distinguishable so that a loader can probe widths, retrying
	/// with the next wider instance.
	#[error("stored word width is {stored} bytes but this model supports at most {supported}")]
	WidthMismatch { stored: u32, supported: u32 },

	/// The stream decoded to something structurally impossible.
	#[error("model stream corrupted: {0}")]
	Corrupted(&'static str),

	#[error("stream i/o failed: {0}")]
	Io(#[from] io::Error),
}
