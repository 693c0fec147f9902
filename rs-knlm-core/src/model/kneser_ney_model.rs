use std::io::{Read, Write};

use tracing::{debug, info};

use crate::codec::{read_u32, write_u32};

use super::error::ModelError;
use super::node::{Children, Node};
use super::word_id::WordId;

/// Summary of an optimized model, in the spirit of a training log line:
/// node count and the ranges of the finite log-likelihoods and backoff
/// weights.
#[derive(Debug, Clone, Copy)]
pub struct ModelStats {
	pub node_count: usize,
	pub ll_min: f32,
	pub ll_max: f32,
	pub gamma_min: f32,
	pub gamma_max: f32,
}

/// A modified Kneser-Ney smoothed n-gram language model.
///
/// The model is a prefix trie of contexts up to `order - 1` tokens deep,
/// stored as one growable vector of nodes linked by relative offsets, plus
/// the smoothing machinery that turns raw counts into backed-off
/// log-probabilities.
///
/// # Responsibilities
/// - Accumulate n-gram counts from token sequences (`train`)
/// - Compute the modified Kneser-Ney discounts, backoff weights and
///   smoothed probabilities, then freeze the trie (`optimize`)
/// - Score tokens and sequences with longest-context backoff
/// - Persist and restore the frozen form through byte streams
///
/// # Lifecycle
/// A model starts in the training phase, where only `train` is valid.
/// `optimize` is a one-way transition into the serving phase, after which
/// the trie is immutable: scoring and serialization become valid, further
/// training is rejected. A model restored with `read` is already in the
/// serving phase. An optimized model never mutates, so it can be shared
/// freely between reader threads.
///
/// # Invariants
/// - Node 0 is the root; every other node has its parent allocated before
///   itself
/// - Every non-root node has a `lower` link to the context with its oldest
///   token dropped
/// - `depth(child) = depth(parent) + 1` along every edge
/// - Leaf contexts (`depth == order - 1`) keep their continuations in the
///   child-map value slots instead of allocating deeper nodes
pub struct KneserNeyModel<W: WordId = u16> {
	nodes: Vec<Node<W>>,
	order: usize,
	vocab_size: usize,
}

impl<W: WordId> KneserNeyModel<W> {
	/// Creates an empty model of the given n-gram order.
	///
	/// The customary order is 3.
	///
	/// # Errors
	/// Returns an error if `order < 2`.
	pub fn new(order: usize) -> Result<Self, ModelError> {
		if order < 2 {
			return Err(ModelError::InvalidOrder(order));
		}
		Ok(Self {
			nodes: vec![Node::new()],
			order,
			vocab_size: 0,
		})
	}

	/// The n-gram order of the model.
	pub fn order(&self) -> usize {
		self.order
	}

	/// One past the highest token id seen in training (or restored from a
	/// stream).
	pub fn vocab_size(&self) -> usize {
		self.vocab_size
	}

	/// Whether `optimize` has run (or the model was restored from a
	/// stream); the serving phase.
	pub fn is_baked(&self) -> bool {
		matches!(self.nodes[0].children, Children::Baked(_))
	}

	fn resolve(&self, idx: usize, offset: i32) -> usize {
		(idx as i64 + offset as i64) as usize
	}

	fn lower_of(&self, idx: usize) -> usize {
		self.resolve(idx, self.nodes[idx].lower)
	}

	/// Grows the node vector so that at least `min_free` nodes fit without
	/// reallocation, expanding exponentially.
	fn prepare_capacity(&mut self, min_free: usize) {
		if self.nodes.capacity() < self.nodes.len() + min_free {
			let target = usize::max(
				self.nodes.len() + min_free,
				self.nodes.capacity() + self.nodes.capacity() / 2,
			);
			self.nodes.reserve(target - self.nodes.len());
		}
	}

	/// Accumulates counts for every n-gram of the sequence, for all
	/// lengths up to the model order.
	///
	/// May be called repeatedly; counts are commutative, so the order in
	/// which sequences are trained does not affect the optimized model.
	///
	/// # Errors
	/// - `TokenTooWide` if a token id does not fit the configured width;
	///   nothing is truncated and the model should be discarded
	/// - `AlreadyOptimized` if `optimize` has already run
	pub fn train(&mut self, seq: &[u32]) -> Result<(), ModelError> {
		if self.is_baked() {
			return Err(ModelError::AlreadyOptimized);
		}
		if seq.is_empty() {
			return Ok(());
		}

		let mut words = Vec::with_capacity(seq.len());
		for &token in seq {
			words.push(W::from_u32(token).ok_or(ModelError::TokenTooWide {
				token,
				width: W::WIDTH,
			})?);
		}

		self.prepare_capacity(seq.len() * self.order);
		for i in 0..words.len() {
			let end = usize::min(i + self.order, words.len());
			self.increase_count(0, &words[i..end]);
		}

		// Checked non-empty above
		let highest = seq.iter().copied().max().unwrap() as usize;
		self.vocab_size = usize::max(self.vocab_size, highest + 1);
		debug!(len = seq.len(), nodes = self.nodes.len(), "trained sequence");
		Ok(())
	}

	/// Bumps the count of every prefix along `window`, descending from
	/// `idx` and allocating missing nodes on the way.
	fn increase_count(&mut self, idx: usize, window: &[W]) {
		self.nodes[idx].inc_count();
		let Some((&first, rest)) = window.split_first() else {
			return;
		};
		if self.nodes[idx].depth as usize == self.order - 1 {
			self.nodes[idx].leaf_inc(first);
			return;
		}
		let next = match self.child_of(idx, first) {
			Some(next) => next,
			None => self.add_next_node(idx, first),
		};
		self.increase_count(next, rest);
	}

	fn child_of(&self, idx: usize, w: W) -> Option<usize> {
		self.nodes[idx].training_get(w).map(|off| self.resolve(idx, off))
	}

	/// Allocates the child of `idx` for token `w`, wiring its parent link
	/// and its lower link; the lower context is created recursively when it
	/// does not exist yet. Lower links of depth-1 nodes point at the root.
	fn add_next_node(&mut self, idx: usize, w: W) -> usize {
		let new_idx = self.nodes.len();
		let mut node = Node::new();
		node.depth = self.nodes[idx].depth + 1;
		node.parent = (idx as i64 - new_idx as i64) as i32;
		self.nodes.push(node);
		self.nodes[idx].training_insert(w, (new_idx as i64 - idx as i64) as i32);

		if self.nodes[idx].depth > 0 {
			let lower_idx = self.lower_of(idx);
			let lower_child = match self.child_of(lower_idx, w) {
				Some(child) => child,
				None => self.add_next_node(lower_idx, w),
			};
			self.nodes[new_idx].lower = (lower_child as i64 - new_idx as i64) as i32;
		} else {
			self.nodes[new_idx].lower = self.nodes[new_idx].parent;
		}
		new_idx
	}

	/// One-way transition from the training phase to the serving phase.
	///
	/// Runs the modified Kneser-Ney computation order by order over a
	/// snapshot of the counts, converts every probability and backoff
	/// weight to log space, and bakes every child map.
	///
	/// # Errors
	/// Returns `AlreadyOptimized` when called twice.
	pub fn optimize(&mut self) -> Result<(), ModelError> {
		if self.is_baked() {
			return Err(ModelError::AlreadyOptimized);
		}

		// The count/ll slot is shared, so counts are captured before any
		// pass starts overwriting slots with probabilities.
		let counts: Vec<u32> = self.nodes.iter().map(Node::count).collect();
		for order in 1..=self.order {
			self.apply_discounted_probabilities(order, &counts);
		}

		self.nodes[0].set_ll(1.0);
		for idx in 0..self.nodes.len() {
			let is_leaf = self.nodes[idx].depth as usize == self.order - 1;
			let node = &mut self.nodes[idx];
			node.set_ll(node.ll().ln());
			node.gamma = node.gamma.ln();
			if is_leaf {
				node.leaf_log_values();
			}
			node.bake();
		}

		let stats = self.stats();
		info!(
			nodes = stats.node_count,
			vocab = self.vocab_size,
			ll_min = stats.ll_min as f64,
			ll_max = stats.ll_max as f64,
			"model optimized"
		);
		Ok(())
	}

	/// Runs one smoothing pass for n-grams of length `order`, writing
	/// linear probabilities into the ll slots (or leaf value slots) of the
	/// nodes at that depth and backoff weights into their parents.
	fn apply_discounted_probabilities(&mut self, order: usize, counts: &[u32]) {
		// The unigram level is the modified Kneser-Ney continuation
		// estimator: how many distinct one-token contexts each token
		// follows, normalized by the number of distinct bigram types.
		if order == 1 {
			let mut continuations = vec![0u32; self.vocab_size];
			let mut bigram_types = 0u64;
			for node in &self.nodes {
				if node.depth != 1 {
					continue;
				}
				for (w, _) in node.training_iter() {
					continuations[w.to_u32() as usize] += 1;
					bigram_types += 1;
				}
			}
			let root_children: Vec<(W, i32)> = self.nodes[0].training_iter().collect();
			for (w, off) in root_children {
				let child = self.resolve(0, off);
				let p = continuations[w.to_u32() as usize] as f32 / bigram_types as f32;
				self.nodes[child].set_ll(p);
			}
			return;
		}

		// Count-of-counts N(1)..N(4); the count of a full-order n-gram
		// lives in a leaf value slot, any shorter one in its node.
		let mut num_count = [0u64; 4];
		if order == self.order {
			for node in &self.nodes {
				if node.depth as usize != self.order - 1 {
					continue;
				}
				for (_, value) in node.training_iter() {
					let cnt = value as u32;
					if (1..=4).contains(&cnt) {
						num_count[(cnt - 1) as usize] += 1;
					}
				}
			}
		} else {
			for (idx, node) in self.nodes.iter().enumerate() {
				if node.depth as usize != order {
					continue;
				}
				let cnt = counts[idx];
				if (1..=4).contains(&cnt) {
					num_count[(cnt - 1) as usize] += 1;
				}
			}
		}

		let y = num_count[0] as f32 / (num_count[0] as f32 + 2.0 * num_count[1] as f32);
		let mut discount = [0.0f32; 3];
		for i in 0..3 {
			if num_count[i] > 0 {
				discount[i] = (i as f32 + 1.0)
					- (i as f32 + 2.0) * y * num_count[i + 1] as f32 / num_count[i] as f32;
				debug_assert!(discount[i] >= 0.0);
			}
		}

		// Backoff weight of every context at depth order - 1: discounted
		// mass bucketed by child count {1, 2, >= 3}, over the context count.
		for idx in 0..self.nodes.len() {
			if self.nodes[idx].depth as usize != order - 1 {
				continue;
			}
			let mut bucket = [0u64; 3];
			for (_, value) in self.nodes[idx].training_iter() {
				let cnt = if order == self.order {
					value as u32
				} else {
					counts[self.resolve(idx, value)]
				};
				bucket[(u32::min(cnt, 3) - 1) as usize] += 1;
			}
			let mut gamma = 0.0f32;
			for i in 0..3 {
				gamma += discount[i] * bucket[i] as f32;
			}
			self.nodes[idx].gamma = gamma / counts[idx] as f32;
		}

		// Smoothed probability: discounted relative count plus the backoff
		// weight times the probability one order lower.
		if order == self.order {
			for idx in 0..self.nodes.len() {
				if self.nodes[idx].depth as usize != self.order - 1 {
					continue;
				}
				let gamma = self.nodes[idx].gamma;
				let context_count = counts[idx];
				let lower_idx = self.lower_of(idx);
				let entries: Vec<(W, i32)> = self.nodes[idx].training_iter().collect();
				for (w, value) in entries {
					let cnt = value as u32;
					let discounted =
						(cnt as f32 - discount[(u32::min(cnt, 3) - 1) as usize]).max(0.0);
					// The suffix n-gram of every trained n-gram is trained
					// one position later, so this child always exists
					let continuation = self.child_of(lower_idx, w)
						.expect("suffix context exists for every trained n-gram");
					let ll = discounted / context_count as f32
						+ gamma * self.nodes[continuation].ll();
					self.nodes[idx].leaf_set_ll(w, ll);
				}
			}
		} else {
			for idx in 0..self.nodes.len() {
				if self.nodes[idx].depth as usize != order {
					continue;
				}
				let cnt = counts[idx];
				let parent_idx = self.resolve(idx, self.nodes[idx].parent);
				let lower_idx = self.lower_of(idx);
				let discounted =
					(cnt as f32 - discount[(u32::min(cnt, 3) - 1) as usize]).max(0.0);
				let ll = discounted / counts[parent_idx] as f32
					+ self.nodes[parent_idx].gamma * self.nodes[lower_idx].ll();
				self.nodes[idx].set_ll(ll);
			}
		}
	}

	/// Log-probability of `word` in the context represented by `idx`,
	/// backing off along the suffix links and accumulating backoff weights
	/// until an entry is found or the root is exhausted.
	fn get_ll(&self, mut idx: usize, word: u32) -> f32 {
		let Some(w) = W::from_u32(word) else {
			return f32::NEG_INFINITY;
		};
		let end_order = self.order - 1;
		let mut backoff = 0.0f32;
		loop {
			let node = &self.nodes[idx];
			if node.depth as usize == end_order {
				if let Some(bits) = node.baked_get(w) {
					return backoff + f32::from_bits(bits as u32);
				}
			} else if let Some(off) = node.baked_get(w) {
				return backoff + self.nodes[self.resolve(idx, off)].ll();
			}
			if node.lower == 0 {
				return f32::NEG_INFINITY;
			}
			backoff += node.gamma;
			idx = self.resolve(idx, node.lower);
		}
	}

	/// Descends from `idx` matching `seq` exactly; `None` on the first
	/// missing edge.
	fn descend(&self, mut idx: usize, seq: &[u32]) -> Option<usize> {
		for &token in seq {
			let w = W::from_u32(token)?;
			let off = self.nodes[idx].baked_get(w)?;
			idx = self.resolve(idx, off);
		}
		Some(idx)
	}

	/// Finds the node of the longest suffix of `seq` (clipped to
	/// `order - 1` tokens) present in the trie; the root when none is.
	fn find_longest_context(&self, seq: &[u32]) -> usize {
		let start = seq.len().saturating_sub(self.order - 1);
		for i in start..seq.len() {
			if let Some(idx) = self.descend(0, &seq[i..]) {
				return idx;
			}
		}
		0
	}

	fn require_baked(&self) {
		assert!(
			self.is_baked(),
			"scoring requires an optimized model; call optimize() first"
		);
	}

	/// Log-probability of the last token of `seq` given the longest
	/// in-trie context formed by the preceding tokens.
	///
	/// Tokens never seen in training score negative infinity.
	///
	/// # Panics
	/// Panics if the model is not optimized, or if `seq` is empty.
	pub fn evaluate_ll(&self, seq: &[u32]) -> f32 {
		self.require_baked();
		assert!(!seq.is_empty(), "cannot score an empty sequence");
		let context = self.find_longest_context(&seq[..seq.len() - 1]);
		self.get_ll(context, seq[seq.len() - 1])
	}

	/// Sum of per-token log-probabilities of `seq`, skipping the first
	/// token and clamping each term to at least `min_value` (conventionally
	/// -100) so a single unseen token does not erase the whole score.
	///
	/// Navigates by suffix links instead of re-descending from the root at
	/// every position; when the chain runs out without a match the cursor
	/// resets to the root.
	///
	/// # Panics
	/// Panics if the model is not optimized.
	pub fn evaluate_ll_sent(&self, seq: &[u32], min_value: f32) -> f32 {
		self.require_baked();
		let mut cursor = 0usize;
		let mut score = 0.0f32;
		for (i, &token) in seq.iter().enumerate() {
			if i > 0 {
				score += self.get_ll(cursor, token).max(min_value);
			}
			cursor = self.advance_cursor(cursor, token);
		}
		score
	}

	/// Log-probability of every token of `seq` in order, first token
	/// included, using the same suffix-link cursor walk as
	/// [`KneserNeyModel::evaluate_ll_sent`].
	///
	/// # Panics
	/// Panics if the model is not optimized.
	pub fn evaluate_ll_each_word(&self, seq: &[u32]) -> Vec<f32> {
		self.require_baked();
		let mut cursor = 0usize;
		let mut scores = Vec::with_capacity(seq.len());
		for &token in seq {
			scores.push(self.get_ll(cursor, token));
			cursor = self.advance_cursor(cursor, token);
		}
		scores
	}

	/// Moves the streaming cursor after consuming `token`: drop leaf
	/// contexts to their suffix first, then follow the `token` edge,
	/// falling down the suffix chain on misses and resetting to the root
	/// when the chain is exhausted.
	fn advance_cursor(&self, cursor: usize, token: u32) -> usize {
		let mut idx = cursor;
		if self.nodes[idx].depth as usize == self.order - 1 {
			idx = self.lower_of(idx);
		}
		let Some(w) = W::from_u32(token) else {
			return 0;
		};
		loop {
			if let Some(off) = self.nodes[idx].baked_get(w) {
				return self.resolve(idx, off);
			}
			if self.nodes[idx].lower == 0 {
				return 0;
			}
			idx = self.lower_of(idx);
		}
	}

	/// Log-probability of every token in the vocabulary following
	/// `history`; the returned vector has `vocab_size` entries.
	///
	/// # Panics
	/// Panics if the model is not optimized.
	pub fn predict_next(&self, history: &[u32]) -> Vec<f32> {
		self.require_baked();
		let context = self.find_longest_context(history);
		(0..self.vocab_size as u32)
			.map(|w| self.get_ll(context, w))
			.collect()
	}

	/// Branching entropy of the next-token distribution after `seq`:
	/// `-sum(p * ln p)` over the vocabulary, with zero-probability tokens
	/// skipped.
	///
	/// # Panics
	/// Panics if the model is not optimized.
	pub fn branching_entropy(&self, seq: &[u32]) -> f32 {
		self.require_baked();
		let context = self.find_longest_context(seq);
		let mut entropy = 0.0f32;
		for w in 0..self.vocab_size as u32 {
			let p = self.get_ll(context, w);
			if p.is_infinite() {
				continue;
			}
			entropy -= p * p.exp();
		}
		entropy
	}

	/// Node count and the ranges of finite log-likelihoods and backoff
	/// weights, for logging and inspection.
	///
	/// # Panics
	/// Panics if the model is not optimized.
	pub fn stats(&self) -> ModelStats {
		self.require_baked();
		let mut stats = ModelStats {
			node_count: self.nodes.len(),
			ll_min: f32::INFINITY,
			ll_max: f32::NEG_INFINITY,
			gamma_min: f32::INFINITY,
			gamma_max: f32::NEG_INFINITY,
		};
		for node in &self.nodes {
			if node.ll().is_normal() {
				stats.ll_min = stats.ll_min.min(node.ll());
				stats.ll_max = stats.ll_max.max(node.ll());
			}
			if node.gamma.is_normal() {
				stats.gamma_min = stats.gamma_min.min(node.gamma);
				stats.gamma_max = stats.gamma_max.max(node.gamma);
			}
		}
		stats
	}

	/// Serializes the optimized model: a fixed header (id width in bytes,
	/// order, vocabulary size, node count as little-endian `u32`) followed
	/// by every node record in array order.
	///
	/// # Panics
	/// Panics if the model is not optimized; only the frozen form is
	/// persistable.
	///
	/// # Errors
	/// Propagates stream write failures.
	pub fn write(&self, os: &mut impl Write) -> Result<(), ModelError> {
		self.require_baked();
		write_u32(os, W::WIDTH)?;
		write_u32(os, self.order as u32)?;
		write_u32(os, self.vocab_size as u32)?;
		write_u32(os, self.nodes.len() as u32)?;
		for node in &self.nodes {
			node.write_to_stream(os, self.order)?;
		}
		debug!(nodes = self.nodes.len(), "model written");
		Ok(())
	}

	/// Replaces this model with one restored from a stream written by
	/// [`KneserNeyModel::write`]. The restored model is in the serving
	/// phase.
	///
	/// # Errors
	/// - `WidthMismatch` if the stored id width exceeds this instance's;
	///   retry with a wider instance
	/// - `Corrupted` if the stream is structurally invalid
	/// - `Io` on read failures
	///
	/// On error the model is left cleared and should be discarded.
	pub fn read(&mut self, is: &mut impl Read) -> Result<(), ModelError> {
		self.nodes.clear();
		let stored = read_u32(is)?;
		if stored > W::WIDTH {
			return Err(ModelError::WidthMismatch {
				stored,
				supported: W::WIDTH,
			});
		}
		self.order = read_u32(is)? as usize;
		if self.order < 2 {
			return Err(ModelError::Corrupted("stored order below 2"));
		}
		self.vocab_size = read_u32(is)? as usize;
		let node_count = read_u32(is)? as usize;
		if node_count == 0 {
			return Err(ModelError::Corrupted("stored model has no root node"));
		}
		self.nodes.reserve(node_count);
		for _ in 0..node_count {
			self.nodes.push(Node::read_from_stream(is, self.order)?);
		}
		debug!(nodes = node_count, vocab = self.vocab_size, "model restored");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn trained(order: usize, seqs: &[&[u32]]) -> KneserNeyModel<u16> {
		let mut model = KneserNeyModel::new(order).unwrap();
		for seq in seqs {
			model.train(seq).unwrap();
		}
		model.optimize().unwrap();
		model
	}

	/// Deterministic pseudo-random corpus; sentence-begin 1, sentence-end 2,
	/// content tokens in [3, vocab).
	fn lcg_corpus(count: usize, len: usize, vocab: u32, mut state: u32) -> Vec<Vec<u32>> {
		let mut seqs = Vec::with_capacity(count);
		for _ in 0..count {
			let mut seq = vec![1u32];
			for _ in 0..len {
				state = state.wrapping_mul(1103515245).wrapping_add(12345) & 0x7FFF_FFFF;
				seq.push(3 + state % (vocab - 3));
			}
			seq.push(2);
			seqs.push(seq);
		}
		seqs
	}

	#[test]
	fn trivial_bigram() {
		let model = trained(2, &[&[1, 5, 5, 2]]);
		assert_eq!(model.order(), 2);
		assert_eq!(model.vocab_size(), 6);

		let ll = model.evaluate_ll_sent(&[1, 5, 5, 2], -100.0);
		assert!(ll.is_finite());
		assert!(ll < 0.0);

		let pred = model.predict_next(&[1]);
		assert_eq!(pred.len(), 6);
		assert!(pred[5].is_finite());
		// Token 3 was never trained, so every backoff level misses
		assert_eq!(pred[3], f32::NEG_INFINITY);
	}

	#[test]
	fn continuation_beats_raw_frequency() {
		// Token 7 occurs three times but always after 5; token 8 occurs
		// three times after three distinct contexts. Modified Kneser-Ney
		// gives 8 the higher unigram probability despite equal raw counts.
		let model = trained(
			2,
			&[&[5, 7], &[5, 7], &[5, 7], &[3, 8], &[4, 8], &[6, 8]],
		);
		let ll_a = model.evaluate_ll(&[7]);
		let ll_b = model.evaluate_ll(&[8]);
		assert!(ll_a.is_finite());
		assert!(ll_b.is_finite());
		assert!(ll_b > ll_a, "continuation {ll_b} should beat frequency {ll_a}");
	}

	#[test]
	fn unseen_context_backs_off_to_unigram() {
		let model = trained(3, &[&[1, 2, 3, 4, 2]]);
		// No context [9, 9] or [9] exists, so the full backoff chain
		// collapses to the root unigram estimate.
		assert_eq!(model.evaluate_ll(&[9, 9, 4]), model.evaluate_ll(&[4]));
	}

	fn normalization_corpus() -> KneserNeyModel<u16> {
		trained(
			3,
			&[
				&[1, 3, 4, 5, 2],
				&[1, 3, 5, 4, 2],
				&[1, 4, 3, 5, 2],
				&[1, 5, 3, 4, 3, 2],
				&[1, 4, 4, 5, 3, 2],
			],
		)
	}

	#[test]
	fn predicted_distributions_normalize() {
		let model = normalization_corpus();
		for history in [&[][..], &[3][..], &[1][..], &[3, 4][..]] {
			let sum: f32 = model
				.predict_next(history)
				.iter()
				.map(|ll| ll.exp())
				.sum();
			assert!(
				(sum - 1.0).abs() < 1e-3,
				"context {history:?} sums to {sum}"
			);
		}
	}

	#[test]
	fn explicit_entries_dominate_backoff() {
		let model = normalization_corpus();
		let ctx = model.find_longest_context(&[3]);
		assert!(ctx != 0);
		let lower = model.lower_of(ctx);
		let gamma = model.nodes[ctx].gamma;
		for w in 0..model.vocab_size() as u32 {
			let ll = model.get_ll(ctx, w);
			let backed_off = gamma + model.get_ll(lower, w);
			if model.nodes[ctx].baked_get(w as u16).is_some() {
				assert!(ll >= backed_off - 1e-5, "token {w}: {ll} < {backed_off}");
			} else {
				assert_eq!(ll, backed_off, "token {w}");
			}
		}
	}

	#[test]
	fn sentence_score_matches_per_word_scores() {
		let model = normalization_corpus();
		for seq in [&[1u32, 3, 4, 5, 2][..], &[1, 5, 3, 9, 2][..]] {
			let each = model.evaluate_ll_each_word(seq);
			assert_eq!(each.len(), seq.len());
			let sum: f32 = each[1..].iter().sum();
			assert_eq!(model.evaluate_ll_sent(seq, f32::NEG_INFINITY), sum);
		}
	}

	#[test]
	fn cursor_walk_matches_longest_context_descent() {
		let model = normalization_corpus();
		let seq = [1u32, 3, 4, 5, 2];
		let each = model.evaluate_ll_each_word(&seq);
		for i in 1..seq.len() {
			assert_eq!(each[i], model.evaluate_ll(&seq[..=i]), "position {i}");
		}
	}

	#[test]
	fn branching_entropy_is_finite_and_non_negative() {
		let model = normalization_corpus();
		for history in [&[][..], &[3][..], &[3, 4][..]] {
			let entropy = model.branching_entropy(history);
			assert!(entropy.is_finite());
			assert!(entropy >= 0.0, "context {history:?}: {entropy}");
		}
	}

	#[test]
	fn suffix_links_drop_the_oldest_token() {
		let mut model = KneserNeyModel::<u16>::new(3).unwrap();
		for seq in lcg_corpus(40, 6, 12, 7) {
			model.train(&seq).unwrap();
		}

		fn collect(
			model: &KneserNeyModel<u16>,
			idx: usize,
			prefix: &mut Vec<u16>,
			out: &mut Vec<(usize, Vec<u16>)>,
		) {
			out.push((idx, prefix.clone()));
			if (model.nodes[idx].depth as usize) < model.order - 1 {
				let children: Vec<(u16, i32)> = model.nodes[idx].training_iter().collect();
				for (w, off) in children {
					prefix.push(w);
					collect(model, model.resolve(idx, off), prefix, out);
					prefix.pop();
				}
			}
		}

		let mut prefixes = Vec::new();
		collect(&model, 0, &mut Vec::new(), &mut prefixes);
		let by_index: std::collections::HashMap<usize, Vec<u16>> =
			prefixes.iter().cloned().collect();
		for (idx, prefix) in &prefixes {
			if *idx == 0 {
				continue;
			}
			let lower = model.lower_of(*idx);
			assert_eq!(by_index[&lower], &prefix[1..], "node {idx}");
		}
	}

	#[test]
	fn round_trip_preserves_queries() {
		let mut model = KneserNeyModel::<u16>::new(3).unwrap();
		let corpus = lcg_corpus(3000, 10, 280, 42);
		for seq in &corpus {
			model.train(seq).unwrap();
		}
		model.optimize().unwrap();

		// The trie is large enough that some links need 3-byte varints
		let mut widest = 0i32;
		for node in &model.nodes {
			if (node.depth as usize) < model.order - 1 {
				if let Children::Baked(map) = &node.children {
					for (_, off) in map.iter() {
						widest = widest.max(off);
					}
				}
			}
		}
		assert!(widest >= 0x4080, "widest offset {widest:#x}");

		let mut bytes = Vec::new();
		model.write(&mut bytes).unwrap();

		let mut restored = KneserNeyModel::<u16>::new(3).unwrap();
		restored.read(&mut bytes.as_slice()).unwrap();
		assert_eq!(restored.order(), model.order());
		assert_eq!(restored.vocab_size(), model.vocab_size());
		assert_eq!(restored.stats().node_count, model.stats().node_count);

		for seq in corpus.iter().take(25) {
			let original = model.evaluate_ll_each_word(seq);
			let reloaded = restored.evaluate_ll_each_word(seq);
			for (a, b) in original.iter().zip(&reloaded) {
				if a.is_infinite() {
					// negative infinity saturates to the lowest
					// fixed-point step on disk
					assert!(*b <= -15.99, "infinite score reloaded as {b}");
				} else {
					assert!(
						(a - b).abs() <= 5e-3,
						"score drifted beyond fixed-point precision: {a} vs {b}"
					);
				}
			}
		}
	}

	#[test]
	fn width_probing() {
		let mut model = KneserNeyModel::<u16>::new(3).unwrap();
		for seq in lcg_corpus(50, 6, 300, 9) {
			model.train(&seq).unwrap();
		}
		model.optimize().unwrap();
		let mut bytes = Vec::new();
		model.write(&mut bytes).unwrap();

		// A 2-byte file does not fit a 1-byte instance...
		let mut narrow = KneserNeyModel::<u8>::new(3).unwrap();
		match narrow.read(&mut bytes.as_slice()) {
			Err(ModelError::WidthMismatch { stored: 2, supported: 1 }) => {}
			other => panic!("expected width mismatch, got {other:?}"),
		}

		// ...but loads into a wider one with identical scores.
		let mut wide = KneserNeyModel::<u32>::new(3).unwrap();
		wide.read(&mut bytes.as_slice()).unwrap();
		let probe = [1u32, 17, 205];
		let a = model.evaluate_ll_sent(&probe, -100.0);
		let b = wide.evaluate_ll_sent(&probe, -100.0);
		assert!((a - b).abs() <= 5e-3, "{a} vs {b}");
	}

	#[test]
	fn training_order_does_not_change_scores() {
		let corpus = lcg_corpus(60, 6, 40, 123);
		let mut forward = KneserNeyModel::<u16>::new(3).unwrap();
		for seq in &corpus {
			forward.train(seq).unwrap();
		}
		forward.optimize().unwrap();

		let mut backward = KneserNeyModel::<u16>::new(3).unwrap();
		for seq in corpus.iter().rev() {
			backward.train(seq).unwrap();
		}
		backward.optimize().unwrap();

		assert_eq!(forward.predict_next(&[]), backward.predict_next(&[]));
		for seq in corpus.iter().take(10) {
			assert_eq!(
				forward.evaluate_ll_sent(seq, -100.0),
				backward.evaluate_ll_sent(seq, -100.0)
			);
		}
	}

	#[test]
	fn rejects_invalid_order() {
		assert!(matches!(
			KneserNeyModel::<u16>::new(1),
			Err(ModelError::InvalidOrder(1))
		));
	}

	#[test]
	fn rejects_token_wider_than_storage() {
		let mut model = KneserNeyModel::<u8>::new(2).unwrap();
		match model.train(&[1, 300]) {
			Err(ModelError::TokenTooWide { token: 300, width: 1 }) => {}
			other => panic!("expected token-too-wide, got {other:?}"),
		}
	}

	#[test]
	fn one_way_lifecycle() {
		let mut model = trained(2, &[&[1, 5, 2]]);
		assert!(matches!(model.train(&[1, 5, 2]), Err(ModelError::AlreadyOptimized)));
		assert!(matches!(model.optimize(), Err(ModelError::AlreadyOptimized)));
	}

	#[test]
	fn oov_query_tokens_are_not_errors() {
		let model = trained(2, &[&[1, 5, 2]]);
		assert_eq!(model.evaluate_ll(&[300]), f32::NEG_INFINITY);
		assert_eq!(model.evaluate_ll(&[1, 1_000_000]), f32::NEG_INFINITY);
	}

	#[test]
	#[should_panic(expected = "optimized")]
	fn scoring_before_optimize_panics() {
		let mut model = KneserNeyModel::<u16>::new(2).unwrap();
		model.train(&[1, 5, 2]).unwrap();
		model.evaluate_ll(&[5]);
	}

	#[test]
	fn empty_sequence_trains_nothing() {
		let mut model = KneserNeyModel::<u16>::new(3).unwrap();
		model.train(&[]).unwrap();
		assert_eq!(model.vocab_size(), 0);
		assert_eq!(model.nodes.len(), 1);
	}

	#[test]
	fn stats_report_finite_ranges() {
		let model = normalization_corpus();
		let stats = model.stats();
		assert!(stats.node_count > 1);
		assert!(stats.ll_min <= stats.ll_max);
		assert!(stats.ll_max < 0.0);
		assert!(stats.gamma_min <= stats.gamma_max);
	}
}
