use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use rs_knlm_core::model::error::ModelError;
use rs_knlm_core::model::generator::Generator;
use rs_knlm_core::model::kneser_ney_model::KneserNeyModel;
use tracing::info;

/// A model of whichever id width its file was written with.
///
/// The core rejects loading a file into an instance narrower than the
/// stored width, reporting the mismatch as its own error kind; this wrapper
/// turns that into width probing, trying instances from the narrowest to
/// the widest until one accepts the stream.
pub(crate) enum AnyModel {
	Narrow(KneserNeyModel<u8>),
	Medium(KneserNeyModel<u16>),
	Wide(KneserNeyModel<u32>),
}

impl AnyModel {
	/// Loads a model file, probing id widths upward on mismatch.
	pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
		let bytes = std::fs::read(path)?;

		let mut narrow = KneserNeyModel::<u8>::new(3)?;
		match narrow.read(&mut bytes.as_slice()) {
			Ok(()) => return Ok(Self::Narrow(narrow)),
			Err(ModelError::WidthMismatch { .. }) => {}
			Err(e) => return Err(e.into()),
		}

		let mut medium = KneserNeyModel::<u16>::new(3)?;
		match medium.read(&mut bytes.as_slice()) {
			Ok(()) => return Ok(Self::Medium(medium)),
			Err(ModelError::WidthMismatch { stored, .. }) => {
				info!(stored, "stored width above 2 bytes, retrying wide");
			}
			Err(e) => return Err(e.into()),
		}

		let mut wide = KneserNeyModel::<u32>::new(3)?;
		wide.read(&mut bytes.as_slice())?;
		Ok(Self::Wide(wide))
	}

	/// Writes the model to `path` in the binary model format.
	pub fn save(&self, path: &Path) -> Result<(), Box<dyn Error>> {
		let mut out = BufWriter::new(File::create(path)?);
		match self {
			Self::Narrow(m) => m.write(&mut out)?,
			Self::Medium(m) => m.write(&mut out)?,
			Self::Wide(m) => m.write(&mut out)?,
		}
		Ok(())
	}

	pub fn order(&self) -> usize {
		match self {
			Self::Narrow(m) => m.order(),
			Self::Medium(m) => m.order(),
			Self::Wide(m) => m.order(),
		}
	}

	pub fn vocab_size(&self) -> usize {
		match self {
			Self::Narrow(m) => m.vocab_size(),
			Self::Medium(m) => m.vocab_size(),
			Self::Wide(m) => m.vocab_size(),
		}
	}

	/// Serialized id width of the underlying instance, in bytes.
	pub fn width(&self) -> u32 {
		match self {
			Self::Narrow(_) => 1,
			Self::Medium(_) => 2,
			Self::Wide(_) => 4,
		}
	}

	pub fn evaluate_ll_sent(&self, seq: &[u32], min_value: f32) -> f32 {
		match self {
			Self::Narrow(m) => m.evaluate_ll_sent(seq, min_value),
			Self::Medium(m) => m.evaluate_ll_sent(seq, min_value),
			Self::Wide(m) => m.evaluate_ll_sent(seq, min_value),
		}
	}

	pub fn evaluate_ll_each_word(&self, seq: &[u32]) -> Vec<f32> {
		match self {
			Self::Narrow(m) => m.evaluate_ll_each_word(seq),
			Self::Medium(m) => m.evaluate_ll_each_word(seq),
			Self::Wide(m) => m.evaluate_ll_each_word(seq),
		}
	}

	pub fn branching_entropy(&self, seq: &[u32]) -> f32 {
		match self {
			Self::Narrow(m) => m.branching_entropy(seq),
			Self::Medium(m) => m.branching_entropy(seq),
			Self::Wide(m) => m.branching_entropy(seq),
		}
	}

	/// Samples a continuation of `seed` until `end_token` or `max_len`.
	pub fn generate(&self, seed: &[u32], end_token: u32, max_len: usize) -> Vec<u32> {
		match self {
			Self::Narrow(m) => Generator::new(m, end_token).with_max_len(max_len).generate(seed),
			Self::Medium(m) => Generator::new(m, end_token).with_max_len(max_len).generate(seed),
			Self::Wide(m) => Generator::new(m, end_token).with_max_len(max_len).generate(seed),
		}
	}
}
