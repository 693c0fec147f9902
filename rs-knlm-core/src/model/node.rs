use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::codec::{
	read_neg_fixed16, read_svint, read_vuint, write_neg_fixed16, write_svint, write_vuint,
};

use super::baked_map::BakedMap;
use super::error::ModelError;
use super::word_id::WordId;

/// Child map of a trie node, in one of its two phases.
///
/// While training the map must take random-key insertions, so it is an
/// ordered mutable map. `bake` converts it one-way into the compact sorted
/// form used for serving.
pub(crate) enum Children<W: WordId> {
	Training(BTreeMap<W, i32>),
	Baked(BakedMap<W>),
}

/// A node of the n-gram trie: the context made of the tokens along the path
/// from the root.
///
/// All links between nodes are *relative offsets in node units* (`other
/// index - own index`), never indices or pointers, so the backing vector can
/// be reallocated without fixing anything up. An offset of 0 means "none";
/// no node links to itself.
///
/// The `slot` field is shared storage: the occurrence count while training,
/// the bits of the log-probability once optimized. The bake phase of
/// `children` disambiguates, as does the leaf value slot, which holds raw
/// continuation counts while training and log-probability bits afterwards.
pub(crate) struct Node<W: WordId> {
	pub depth: u8,
	/// Relative offset to the parent; 0 only for the root. Always
	/// non-positive, parents are allocated before their children.
	pub parent: i32,
	/// Relative offset to the node for this context with its oldest token
	/// dropped; 0 only for the root. May be positive, suffix contexts can
	/// be allocated on demand after this node.
	pub lower: i32,
	slot: u32,
	pub gamma: f32,
	pub children: Children<W>,
}

impl<W: WordId> Node<W> {
	pub fn new() -> Self {
		Self {
			depth: 0,
			parent: 0,
			lower: 0,
			slot: 0,
			gamma: 0.0,
			children: Children::Training(BTreeMap::new()),
		}
	}

	fn training(&self) -> &BTreeMap<W, i32> {
		match &self.children {
			Children::Training(map) => map,
			Children::Baked(_) => unreachable!("children accessed mutably after bake"),
		}
	}

	fn training_mut(&mut self) -> &mut BTreeMap<W, i32> {
		match &mut self.children {
			Children::Training(map) => map,
			Children::Baked(_) => unreachable!("children accessed mutably after bake"),
		}
	}

	fn baked(&self) -> &BakedMap<W> {
		match &self.children {
			Children::Baked(map) => map,
			Children::Training(_) => unreachable!("baked children read before optimize"),
		}
	}

	pub fn count(&self) -> u32 {
		self.slot
	}

	pub fn inc_count(&mut self) {
		self.slot += 1;
	}

	pub fn ll(&self) -> f32 {
		f32::from_bits(self.slot)
	}

	pub fn set_ll(&mut self, ll: f32) {
		self.slot = ll.to_bits();
	}

	pub fn training_get(&self, w: W) -> Option<i32> {
		self.training().get(&w).copied()
	}

	pub fn training_insert(&mut self, w: W, offset: i32) {
		self.training_mut().insert(w, offset);
	}

	/// Bumps the raw continuation count stored in a leaf value slot.
	pub fn leaf_inc(&mut self, w: W) {
		*self.training_mut().entry(w).or_insert(0) += 1;
	}

	/// Overwrites a leaf value slot with the bits of a log-probability.
	pub fn leaf_set_ll(&mut self, w: W, ll: f32) {
		self.training_mut().insert(w, ll.to_bits() as i32);
	}

	/// Converts every leaf value from linear to log space, in place.
	pub fn leaf_log_values(&mut self) {
		for value in self.training_mut().values_mut() {
			let linear = f32::from_bits(*value as u32);
			*value = linear.ln().to_bits() as i32;
		}
	}

	pub fn training_iter(&self) -> impl Iterator<Item = (W, i32)> + '_ {
		self.training().iter().map(|(&k, &v)| (k, v))
	}

	pub fn baked_get(&self, w: W) -> Option<i32> {
		self.baked().get(w)
	}

	/// One-way conversion of the child map into its immutable sorted form.
	pub fn bake(&mut self) {
		let map = std::mem::take(self.training_mut());
		self.children = Children::Baked(BakedMap::from_pairs(map.into_iter().collect()));
	}

	/// Serializes one baked node record.
	///
	/// Layout: `vuint(-parent)`, `svint(lower)`, `neg_fixed16(ll)`,
	/// `neg_fixed16(gamma)`, `u8 depth`, `vuint(child count)`, then the
	/// children in ascending key order, each a `vuint(key)` followed by a
	/// `vuint(offset)` for interior nodes or a `neg_fixed16(ll)` for leaf
	/// value slots.
	pub fn write_to_stream(&self, os: &mut impl Write, leaf_depth: usize) -> Result<(), ModelError> {
		write_vuint(os, (-self.parent) as u32)?;
		write_svint(os, self.lower)?;
		write_neg_fixed16(os, self.ll())?;
		write_neg_fixed16(os, self.gamma)?;
		os.write_all(&[self.depth])?;

		let map = self.baked();
		write_vuint(os, map.len() as u32)?;
		for (key, value) in map.iter() {
			write_vuint(os, key.to_u32())?;
			if (self.depth as usize) < leaf_depth - 1 {
				write_vuint(os, value as u32)?;
			} else {
				write_neg_fixed16(os, f32::from_bits(value as u32))?;
			}
		}
		Ok(())
	}

	/// Reconstructs a node record written by [`Node::write_to_stream`],
	/// directly in baked form.
	pub fn read_from_stream(is: &mut impl Read, leaf_depth: usize) -> Result<Self, ModelError> {
		let parent = -(read_vuint(is)? as i32);
		let lower = read_svint(is)?;
		let ll = read_neg_fixed16(is)?;
		let gamma = read_neg_fixed16(is)?;
		let mut depth = [0u8; 1];
		is.read_exact(&mut depth)?;
		let depth = depth[0];

		let size = read_vuint(is)? as usize;
		let mut pairs = Vec::with_capacity(size);
		for _ in 0..size {
			let key = W::from_u32(read_vuint(is)?)
				.ok_or(ModelError::Corrupted("child key wider than the stored word width"))?;
			let value = if (depth as usize) < leaf_depth - 1 {
				read_vuint(is)? as i32
			} else {
				read_neg_fixed16(is)?.to_bits() as i32
			};
			pairs.push((key, value));
		}

		Ok(Self {
			depth,
			parent,
			lower,
			slot: ll.to_bits(),
			gamma,
			children: Children::Baked(BakedMap::from_pairs(pairs)),
		})
	}
}
