//! Token estimation and budget trimming.
//!
//! The estimator is deliberately coarse: words × 1.3 for text, flat costs
//! for media parts. It only has to be consistent — every budget in the
//! assembler and the Gemini request builder uses the same numbers.

use crate::types::{MediaData, Turn};

pub const INLINE_MEDIA_TOKENS: usize = 258;
pub const FILE_URI_TOKENS: usize = 100;
const WORDS_TO_TOKENS: f64 = 1.3;

pub fn estimate_text(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words as f64 * WORDS_TO_TOKENS).ceil() as usize
}

pub fn estimate_turn(turn: &Turn) -> usize {
    let media: usize = turn
        .media
        .iter()
        .map(|m| match m.data {
            MediaData::Base64(_) => INLINE_MEDIA_TOKENS,
            MediaData::FileUri(_) => FILE_URI_TOKENS,
        })
        .sum();
    estimate_text(&turn.text) + media
}

pub fn estimate_turns(turns: &[Turn]) -> usize {
    turns.iter().map(estimate_turn).sum()
}

/// Greedily drop turns from the head until the remainder fits `budget`.
/// The most recent turn is always kept, even if it alone exceeds the budget.
pub fn truncate_history_to_tokens(mut turns: Vec<Turn>, budget: usize) -> Vec<Turn> {
    while turns.len() > 1 && estimate_turns(&turns) > budget {
        turns.remove(0);
    }
    turns
}
