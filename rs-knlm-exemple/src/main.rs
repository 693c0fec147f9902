use std::error::Error;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use rs_knlm_core::model::kneser_ney_model::KneserNeyModel;
use rs_knlm_core::model::word_id::WordId;
use tracing::info;

use crate::loader::AnyModel;
use crate::vocab::Vocab;

mod loader;
mod vocab;

/// Trains and optimizes a model of one concrete id width.
fn train_width<W: WordId>(
	seqs: &[Vec<u32>],
	order: usize,
) -> Result<KneserNeyModel<W>, Box<dyn Error>> {
	let mut model = KneserNeyModel::new(order)?;
	for seq in seqs {
		model.train(seq)?;
	}
	model.optimize()?;
	Ok(model)
}

/// Picks the narrowest id width that fits the vocabulary and trains with
/// it, so the saved model is as small as the corpus allows.
fn train_model(
	seqs: &[Vec<u32>],
	token_count: usize,
	order: usize,
) -> Result<AnyModel, Box<dyn Error>> {
	if token_count <= u8::MAX as usize + 1 {
		Ok(AnyModel::Narrow(train_width(seqs, order)?))
	} else if token_count <= u16::MAX as usize + 1 {
		Ok(AnyModel::Medium(train_width(seqs, order)?))
	} else {
		Ok(AnyModel::Wide(train_width(seqs, order)?))
	}
}

/// Scores one whitespace-split sentence and prints the total, average and
/// per-word log-likelihoods.
fn score_sentence(model: &AnyModel, vocab: &Vocab, line: &str) {
	let words: Vec<&str> = line.split_whitespace().collect();
	let ids = vocab.encode_line(line);

	let ll = model.evaluate_ll_sent(&ids, -100.0);
	println!("ll: {:.4}, avg ll: {:.4}", ll, ll / (words.len() as f32 + 1.0));

	let scores = model.evaluate_ll_each_word(&ids);
	for (word, score) in words.iter().zip(scores[1..].iter()) {
		println!("{word}: {score:.4}");
	}
	// The sentence-end marker is scored too
	println!("</s>: {:.4}", scores[scores.len() - 1]);
	// Entropy of what could follow the sentence content
	println!(
		"branching entropy: {:.4}",
		model.branching_entropy(&ids[..ids.len() - 1])
	);
}

fn main() -> Result<(), Box<dyn Error>> {
	tracing_subscriber::fmt::init();

	let mut args = std::env::args().skip(1);
	let Some(corpus_path) = args.next() else {
		eprintln!("Usage: rs-knlm-exemple <corpus.txt> [order]");
		return Ok(());
	};
	let order: usize = match args.next() {
		Some(raw) => raw.parse()?,
		None => 3,
	};

	// The model and vocabulary are cached side by side with the corpus,
	// as corpus.knlm / corpus.vocab
	let corpus_path = Path::new(&corpus_path);
	let model_path = corpus_path.with_extension("knlm");
	let vocab_path = corpus_path.with_extension("vocab");

	// Load the cached binary pair when it exists, otherwise build both
	// from the corpus and cache them for the next run
	let (model, vocab) = if model_path.exists() && vocab_path.exists() {
		info!(model = %model_path.display(), "loading cached model");
		(AnyModel::load(&model_path)?, Vocab::load(&vocab_path)?)
	} else {
		let lines: Vec<String> = fs::read_to_string(corpus_path)?
			.lines()
			.map(str::to_owned)
			.collect();
		info!(lines = lines.len(), "building model from corpus");
		let vocab = Vocab::build(&lines);
		let seqs = vocab.encode_corpus(&lines);
		let model = train_model(&seqs, vocab.token_count(), order)?;
		model.save(&model_path)?;
		vocab.save(&vocab_path)?;
		(model, vocab)
	};

	println!(
		"Order: {}, Vocab Size: {}, Word Width: {}",
		model.order(),
		model.vocab_size(),
		model.width()
	);
	println!("Enter a sentence to score it, ':gen' to sample one, or EOF to quit.");

	let stdin = std::io::stdin();
	let mut input = String::new();
	loop {
		print!(">> ");
		std::io::stdout().flush()?;
		input.clear();
		if stdin.read_line(&mut input)? == 0 {
			break;
		}
		let line = input.trim();
		if line.is_empty() {
			continue;
		}

		if line == ":gen" {
			let ids = model.generate(&[vocab::BOS], vocab::EOS, 32);
			let text: Vec<&str> = ids.iter().skip(1).map(|&id| vocab.word(id)).collect();
			println!("{}", text.join(" "));
		} else {
			score_sentence(&model, &vocab, line);
		}
	}

	Ok(())
}
