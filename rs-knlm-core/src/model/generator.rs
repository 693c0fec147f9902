use rand::Rng;

use super::kneser_ney_model::KneserNeyModel;
use super::word_id::WordId;

/// Samples token sequences from an optimized model.
///
/// Wraps a model in the serving phase and draws continuations with
/// probability proportional to the predicted next-token distribution,
/// stopping at a designated end token or at a length cap.
///
/// # Notes
/// - The model must already be optimized; scoring panics otherwise.
/// - Sampling shares no state, so one generator can serve many calls.
pub struct Generator<'a, W: WordId = u16> {
	model: &'a KneserNeyModel<W>,
	end_token: u32,
	max_len: usize,
}

impl<'a, W: WordId> Generator<'a, W> {
	/// Creates a generator that stops when `end_token` is drawn.
	pub fn new(model: &'a KneserNeyModel<W>, end_token: u32) -> Self {
		Self {
			model,
			end_token,
			max_len: 64,
		}
	}

	/// Caps generated sequences (seed included) at `max_len` tokens.
	pub fn with_max_len(mut self, max_len: usize) -> Self {
		self.max_len = max_len;
		self
	}

	/// Draws one token following `history`, with probability proportional
	/// to the model's predicted distribution.
	///
	/// Returns `None` when the distribution carries no mass (nothing was
	/// ever observed after any suffix of the history).
	pub fn sample_next(&self, history: &[u32]) -> Option<u32> {
		let weights: Vec<f32> = self
			.model
			.predict_next(history)
			.iter()
			.map(|ll| ll.exp())
			.collect();
		let total: f32 = weights.iter().sum();
		if total <= 0.0 {
			return None;
		}

		// Cumulative subtraction over the positive weights
		let mut r = rand::rng().random_range(0.0..total);
		let mut fallback = None;
		for (token, &weight) in weights.iter().enumerate() {
			if weight <= 0.0 {
				continue;
			}
			if r < weight {
				return Some(token as u32);
			}
			r -= weight;
			fallback = Some(token as u32);
		}

		// Rounding can exhaust r on the last positive weight
		fallback
	}

	/// Extends `seed` token by token until the end token is drawn, the
	/// distribution runs dry, or the length cap is reached. The end token
	/// itself is not appended.
	pub fn generate(&self, seed: &[u32]) -> Vec<u32> {
		let mut seq = seed.to_vec();
		while seq.len() < self.max_len {
			match self.sample_next(&seq) {
				Some(token) if token != self.end_token => seq.push(token),
				_ => break,
			}
		}
		seq
	}
}
