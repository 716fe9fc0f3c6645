//! Local sentiment analysis.
//!
//! Lexicon-based scorer producing the same contract as upstream
//! annotations: a five-label sentiment mapped to a 1–5 star rating plus a
//! confidence score. Handles French and English vocabulary, simple
//! negation ("pas content", "not good"), and intensifiers ("très bien").
//!
//! Like the local NER fallback, this only runs for legacy documents when
//! `NLP_ENABLE_LOCAL` is set.

use crate::document::SentimentLabel;

const POSITIVE: &[&str] = &[
    "bien", "bon", "bonne", "super", "excellent", "excellente", "génial", "géniale", "parfait",
    "parfaite", "merci", "content", "contente", "heureux", "heureuse", "bravo", "formidable",
    "agréable", "réussi", "good", "great", "excellent", "awesome", "happy", "glad", "love",
    "loved", "perfect", "nice", "wonderful", "fantastic", "thanks", "helpful", "success",
    "successful",
];

const NEGATIVE: &[&str] = &[
    "mauvais", "mauvaise", "mal", "horrible", "terrible", "nul", "nulle", "triste", "problème",
    "problèmes", "échec", "difficile", "inquiet", "inquiète", "déçu", "déçue", "colère", "pire",
    "bad", "awful", "poor", "sad", "angry", "hate", "hated", "problem", "problems", "failure",
    "failed", "worst", "worse", "broken", "wrong", "difficult", "disappointed",
];

const INTENSIFIERS: &[&str] = &[
    "très", "vraiment", "tellement", "trop", "very", "really", "extremely", "so", "totally",
];

const NEGATORS: &[&str] = &["pas", "ne", "n'", "jamais", "aucun", "not", "no", "never", "don't", "doesn't", "didn't"];

/// How many tokens a negator or intensifier reaches forward.
const MODIFIER_WINDOW: usize = 3;

/// Sentiment verdict for one piece of text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentimentScore {
    pub label: SentimentLabel,
    /// 1–5 rating on the review-star scale.
    pub stars: u8,
    /// Confidence in the verdict, in `[0, 1]`.
    pub score: f64,
}

/// Score one text. Empty or purely factual text lands on neutral.
pub fn analyze_text(text: &str) -> SentimentScore {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    let mut total = 0.0f64;
    let mut hits = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        let polarity = if POSITIVE.contains(&token.as_str()) {
            1.0
        } else if NEGATIVE.contains(&token.as_str()) {
            -1.0
        } else {
            continue;
        };

        let window = &tokens[i.saturating_sub(MODIFIER_WINDOW)..i];
        let negated = window.iter().any(|t| NEGATORS.contains(&t.as_str()));
        let intensified = window.iter().any(|t| INTENSIFIERS.contains(&t.as_str()));

        let mut value = polarity;
        if negated {
            value = -value * 0.5;
        }
        if intensified {
            value *= 1.5;
        }

        total += value;
        hits += 1;
    }

    let stars = stars_from_total(total);
    let label = SentimentLabel::from_stars(stars);
    let score = if hits == 0 {
        0.5
    } else {
        (0.5 + total.abs() / (hits as f64 * 2.0)).min(1.0)
    };

    SentimentScore { label, stars, score }
}

fn stars_from_total(total: f64) -> u8 {
    if total <= -2.0 {
        1
    } else if total <= -0.5 {
        2
    } else if total < 0.5 {
        3
    } else if total < 2.0 {
        4
    } else {
        5
    }
}
