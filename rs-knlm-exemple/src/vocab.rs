use std::collections::HashMap;
use std::error::Error;
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};

/// Id given to words that are not part of the vocabulary.
pub const UNK: u32 = 0;
/// Sentence-begin marker, by convention id 1.
pub const BOS: u32 = 1;
/// Sentence-end marker, by convention id 2.
pub const EOS: u32 = 2;

/// First id handed out to a real corpus word.
const FIRST_WORD_ID: u32 = 3;

/// The caller-side dictionary between corpus words and the integer ids the
/// model works on.
///
/// The model core never sees strings; this structure owns the mapping, the
/// way a host application embedding the model would. Ids 0..=2 are reserved
/// for the unknown / sentence-begin / sentence-end markers, real words get
/// ids from 3 upward in descending corpus frequency, so the densest ids are
/// the smallest.
///
/// # Responsibilities
/// - Build the word list from a corpus (fanned out over worker threads)
/// - Encode whitespace-split lines into id sequences with boundary markers
/// - Persist and restore itself next to the model file
#[derive(Serialize, Deserialize)]
pub struct Vocab {
	/// Words by id, offset by `FIRST_WORD_ID`.
	words: Vec<String>,
	/// Reverse lookup, rebuilt on load.
	#[serde(skip)]
	index: HashMap<String, u32>,
}

impl Vocab {
	/// Builds a vocabulary from corpus lines.
	///
	/// Word frequencies are counted in parallel chunks and merged, then
	/// ids are assigned by descending frequency (ties broken
	/// alphabetically) so the assignment does not depend on chunking.
	pub fn build(lines: &[String]) -> Self {
		let cpus = num_cpus::get();
		let chunks = cpus * 8;
		let chunk_size = lines.len().div_ceil(chunks).max(1);

		let (tx, rx) = mpsc::channel();
		thread::scope(|scope| {
			for chunk in lines.chunks(chunk_size) {
				let tx = tx.clone();
				scope.spawn(move || {
					let mut freq: HashMap<&str, u64> = HashMap::new();
					for line in chunk {
						for word in line.split_whitespace() {
							*freq.entry(word).or_insert(0) += 1;
						}
					}
					tx.send(freq).expect("Failed to send from thread");
				});
			}
		});
		drop(tx);

		let mut merged: HashMap<&str, u64> = HashMap::new();
		for partial in rx.iter() {
			for (word, count) in partial {
				*merged.entry(word).or_insert(0) += count;
			}
		}

		let mut entries: Vec<(&str, u64)> = merged.into_iter().collect();
		entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

		let words: Vec<String> = entries.into_iter().map(|(w, _)| w.to_owned()).collect();
		let index = Self::build_index(&words);
		Self { words, index }
	}

	fn build_index(words: &[String]) -> HashMap<String, u32> {
		words
			.iter()
			.enumerate()
			.map(|(i, w)| (w.clone(), FIRST_WORD_ID + i as u32))
			.collect()
	}

	/// Id of a word, or `None` when out of vocabulary.
	pub fn id(&self, word: &str) -> Option<u32> {
		self.index.get(word).copied()
	}

	/// Word behind an id; the reserved markers and unknown ids render as
	/// their conventional tags.
	pub fn word(&self, id: u32) -> &str {
		match id {
			UNK => "<unk>",
			BOS => "<s>",
			EOS => "</s>",
			_ => self
				.words
				.get((id - FIRST_WORD_ID) as usize)
				.map(String::as_str)
				.unwrap_or("<unk>"),
		}
	}

	/// Total id count, reserved markers included; tokens fed to the model
	/// are always below this.
	pub fn token_count(&self) -> usize {
		FIRST_WORD_ID as usize + self.words.len()
	}

	/// Encodes one line into an id sequence wrapped in the
	/// sentence-begin/end markers. Out-of-vocabulary words map to `UNK`.
	pub fn encode_line(&self, line: &str) -> Vec<u32> {
		let mut seq = vec![BOS];
		for word in line.split_whitespace() {
			seq.push(self.id(word).unwrap_or(UNK));
		}
		seq.push(EOS);
		seq
	}

	/// Encodes every corpus line, fanned out over worker threads.
	///
	/// The resulting sequence order may differ from the line order; model
	/// training is count-based and does not care.
	pub fn encode_corpus(&self, lines: &[String]) -> Vec<Vec<u32>> {
		let cpus = num_cpus::get();
		let chunks = cpus * 8;
		let chunk_size = lines.len().div_ceil(chunks).max(1);

		let (tx, rx) = mpsc::channel();
		thread::scope(|scope| {
			for chunk in lines.chunks(chunk_size) {
				let tx = tx.clone();
				scope.spawn(move || {
					let encoded: Vec<Vec<u32>> =
						chunk.iter().map(|line| self.encode_line(line)).collect();
					tx.send(encoded).expect("Failed to send from thread");
				});
			}
		});
		drop(tx);

		rx.iter().flatten().collect()
	}

	/// Serializes the vocabulary with `postcard` next to the model file.
	pub fn save(&self, path: &Path) -> Result<(), Box<dyn Error>> {
		let bytes = postcard::to_stdvec(self)?;
		std::fs::write(path, bytes)?;
		Ok(())
	}

	/// Restores a vocabulary saved by [`Vocab::save`], rebuilding the
	/// reverse index.
	pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
		let bytes = std::fs::read(path)?;
		let mut vocab: Vocab = postcard::from_bytes(&bytes)?;
		vocab.index = Self::build_index(&vocab.words);
		Ok(vocab)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lines(raw: &[&str]) -> Vec<String> {
		raw.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn frequent_words_get_small_ids() {
		let vocab = Vocab::build(&lines(&["the cat sat", "the cat", "the"]));
		assert_eq!(vocab.id("the"), Some(3));
		assert_eq!(vocab.id("cat"), Some(4));
		assert_eq!(vocab.id("sat"), Some(5));
		assert_eq!(vocab.id("dog"), None);
		assert_eq!(vocab.token_count(), 6);
	}

	#[test]
	fn encoding_wraps_in_markers() {
		let vocab = Vocab::build(&lines(&["a b", "a"]));
		let ids = vocab.encode_line("a b c");
		assert_eq!(ids[0], BOS);
		assert_eq!(*ids.last().unwrap(), EOS);
		assert_eq!(ids[3], UNK);
		assert_eq!(ids.len(), 5);
	}

	#[test]
	fn corpus_encoding_matches_line_encoding() {
		let corpus = lines(&["a b", "b a", "a a b"]);
		let vocab = Vocab::build(&corpus);
		let mut parallel = vocab.encode_corpus(&corpus);
		let mut sequential: Vec<Vec<u32>> =
			corpus.iter().map(|l| vocab.encode_line(l)).collect();
		parallel.sort();
		sequential.sort();
		assert_eq!(parallel, sequential);
	}
}
