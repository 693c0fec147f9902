use std::fmt::Debug;

/// Storage type of a token id inside the trie.
///
/// The model is generic over the id width so that small vocabularies can be
/// held (and serialized) with one byte per key while large ones get the full
/// four. The width is recorded in the model file header; loading a file into
/// an instance narrower than the stored width is rejected.
///
/// # Invariants
/// - `WIDTH` is the serialized size in bytes (1, 2 or 4)
/// - `from_u32(v)` succeeds exactly when `v` fits the width
pub trait WordId: Copy + Ord + Eq + Debug + Send + Sync + 'static {
	/// Serialized width of one id, in bytes.
	const WIDTH: u32;

	/// Narrows a caller-facing id into this width, or `None` if it does
	/// not fit.
	fn from_u32(v: u32) -> Option<Self>;

	/// Widens this id back into the caller-facing representation.
	fn to_u32(self) -> u32;
}

impl WordId for u8 {
	const WIDTH: u32 = 1;

	fn from_u32(v: u32) -> Option<Self> {
		u8::try_from(v).ok()
	}

	fn to_u32(self) -> u32 {
		self as u32
	}
}

impl WordId for u16 {
	const WIDTH: u32 = 2;

	fn from_u32(v: u32) -> Option<Self> {
		u16::try_from(v).ok()
	}

	fn to_u32(self) -> u32 {
		self as u32
	}
}

impl WordId for u32 {
	const WIDTH: u32 = 4;

	fn from_u32(v: u32) -> Option<Self> {
		Some(v)
	}

	fn to_u32(self) -> u32 {
		self
	}
}
