/// An immutable, sorted key-to-value map over token ids.
///
/// During training the trie uses an ordered mutable map per node; once the
/// model is optimized the children become read-only and the dominant cost is
/// lookup speed and per-node footprint. This structure replaces the mutable
/// map after baking: two parallel arrays, binary-searched on lookup,
/// iterated in ascending key order.
///
/// Absence is reported as `None` rather than a zero sentinel; no node ever
/// references itself, so nothing is lost by making the empty case explicit.
pub(crate) struct BakedMap<K> {
	keys: Vec<K>,
	values: Vec<i32>,
}

impl<K: Copy + Ord> BakedMap<K> {
	/// Builds a map from key-value pairs, sorting them first if needed.
	///
	/// Keys must be distinct; pairs coming from an ordered map or from a
	/// serialized stream are already sorted and skip the sort.
	pub fn from_pairs(mut pairs: Vec<(K, i32)>) -> Self {
		if !pairs.windows(2).all(|w| w[0].0 <= w[1].0) {
			pairs.sort_unstable_by_key(|p| p.0);
		}
		let mut keys = Vec::with_capacity(pairs.len());
		let mut values = Vec::with_capacity(pairs.len());
		for (k, v) in pairs {
			keys.push(k);
			values.push(v);
		}
		Self { keys, values }
	}

	/// Looks up the value stored under `key`.
	pub fn get(&self, key: K) -> Option<i32> {
		self.keys.binary_search(&key).ok().map(|i| self.values[i])
	}

	/// Iterates the entries in ascending key order.
	pub fn iter(&self) -> impl Iterator<Item = (K, i32)> + '_ {
		self.keys.iter().copied().zip(self.values.iter().copied())
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lookup_hits_and_misses() {
		let map = BakedMap::from_pairs(vec![(3u16, 30), (7, 70), (11, -4)]);
		assert_eq!(map.get(3), Some(30));
		assert_eq!(map.get(7), Some(70));
		assert_eq!(map.get(11), Some(-4));
		assert_eq!(map.get(0), None);
		assert_eq!(map.get(8), None);
		assert_eq!(map.get(12), None);
	}

	#[test]
	fn unsorted_input_is_sorted() {
		let map = BakedMap::from_pairs(vec![(9u16, 1), (2, 2), (5, 3)]);
		let entries: Vec<_> = map.iter().collect();
		assert_eq!(entries, vec![(2, 2), (5, 3), (9, 1)]);
		assert_eq!(map.len(), 3);
	}

	#[test]
	fn empty_map() {
		let map = BakedMap::<u16>::from_pairs(Vec::new());
		assert_eq!(map.get(0), None);
		assert_eq!(map.len(), 0);
	}
}
