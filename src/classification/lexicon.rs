//! 辞書ベースの感情スコアリング。
//!
//! 単語ごとの極性値を合算し、否定・強調語・大文字強調・感嘆符・逆接 "but" を補正したうえで
//! `x / sqrt(x^2 + alpha)` で [-1, 1] に正規化する。
use std::sync::LazyLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use super::vocabulary::{is_negation, BOOSTERS, VALENCE};
use super::{ClassificationError, RawScore, SentimentStrategy};

const NORMALIZATION_ALPHA: f64 = 15.0;
const BOOSTER_SCALAR: f64 = 0.293;
const CAPS_EMPHASIS: f64 = 0.733;
const NEGATION_SCALAR: f64 = -0.74;
const EXCLAMATION_WEIGHT: f64 = 0.292;
const MAX_EXCLAMATIONS: usize = 4;
const QUESTION_WEIGHT: f64 = 0.18;
const MAX_QUESTIONS: usize = 3;
const BUT_BEFORE: f64 = 0.5;
const BUT_AFTER: f64 = 1.5;
/// 直前 1〜3 語の強調語に掛ける減衰。
const BOOSTER_DAMPING: [f64; 3] = [1.0, 0.95, 0.9];

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("compile url regex"));
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w+").expect("compile mention regex"));

#[derive(Debug, Clone, Default)]
pub struct LexiconStrategy;

impl LexiconStrategy {
    pub const NAME: &'static str = "lexicon";
    pub const VERSION: &'static str = "lexicon-v1";

    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// 正規化前の合計極性値から複合スコアを求める。
    #[must_use]
    pub fn compound(&self, text: &str) -> f64 {
        let cleaned = strip_noise(text);
        let tokens: Vec<&str> = cleaned.unicode_words().collect();
        if tokens.is_empty() {
            return 0.0;
        }
        let lowers: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

        let mut sentiments = word_sentiments(&tokens, &lowers);
        apply_but_shift(&lowers, &mut sentiments);

        let mut total: f64 = sentiments.iter().sum();
        if total != 0.0 {
            total += punctuation_emphasis(&cleaned).copysign(total);
        }
        normalize(total)
    }
}

impl SentimentStrategy for LexiconStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        Self::VERSION
    }

    fn score(&self, text: &str) -> Result<RawScore, ClassificationError> {
        let compound = self.compound(text);
        Ok(RawScore::new(compound, compound.abs()))
    }
}

fn strip_noise(text: &str) -> String {
    let without_urls = URL_RE.replace_all(text, " ");
    MENTION_RE
        .replace_all(&without_urls, " ")
        .replace('\u{2019}', "'")
}

fn is_shouting(token: &str) -> bool {
    let mut letters = token.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn word_sentiments(tokens: &[&str], lowers: &[String]) -> Vec<f64> {
    let shouting = tokens.iter().filter(|t| is_shouting(t)).count();
    // 全語が大文字なら強調とはみなさない
    let caps_differential = shouting > 0 && shouting < tokens.len();

    lowers
        .iter()
        .enumerate()
        .map(|(i, lower)| {
            if BOOSTERS.contains_key(lower.as_str()) {
                return 0.0;
            }
            let Some(&base) = VALENCE.get(lower.as_str()) else {
                return 0.0;
            };

            let mut valence = base;
            if caps_differential && is_shouting(tokens[i]) {
                valence += CAPS_EMPHASIS.copysign(valence);
            }

            for (offset, damping) in BOOSTER_DAMPING.iter().enumerate() {
                let j = offset + 1;
                if i < j {
                    break;
                }
                if let Some(&increases) = BOOSTERS.get(lowers[i - j].as_str()) {
                    let mut scalar = if increases {
                        BOOSTER_SCALAR
                    } else {
                        -BOOSTER_SCALAR
                    };
                    if valence < 0.0 {
                        scalar = -scalar;
                    }
                    if caps_differential && is_shouting(tokens[i - j]) {
                        scalar += CAPS_EMPHASIS.copysign(valence);
                    }
                    valence += scalar * damping;
                }
            }

            let negated = (1..=3)
                .filter(|j| i >= *j)
                .any(|j| is_negation(&lowers[i - j]));
            if negated {
                valence *= NEGATION_SCALAR;
            }
            valence
        })
        .collect()
}

fn apply_but_shift(lowers: &[String], sentiments: &mut [f64]) {
    let Some(pivot) = lowers.iter().position(|w| w == "but") else {
        return;
    };
    for (i, sentiment) in sentiments.iter_mut().enumerate() {
        if i < pivot {
            *sentiment *= BUT_BEFORE;
        } else if i > pivot {
            *sentiment *= BUT_AFTER;
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn punctuation_emphasis(text: &str) -> f64 {
    let exclamations = text.matches('!').count().min(MAX_EXCLAMATIONS);
    let questions = text.matches('?').count();
    let question_boost = if questions > 1 {
        questions.min(MAX_QUESTIONS) as f64 * QUESTION_WEIGHT
    } else {
        0.0
    };
    exclamations as f64 * EXCLAMATION_WEIGHT + question_boost
}

fn normalize(total: f64) -> f64 {
    (total / (total * total + NORMALIZATION_ALPHA).sqrt()).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::{LabelThresholds, SentimentLabel};

    fn score(text: &str) -> f64 {
        LexiconStrategy::new().score(text).expect("lexicon never fails").score
    }

    #[test]
    fn love_with_exclamation_is_positive() {
        let value = score("I love this!");
        assert!((value - 0.6696).abs() < 0.001, "got {value}");
        assert_eq!(
            LabelThresholds::default().label_for(value),
            SentimentLabel::Positive
        );
    }

    #[test]
    fn terrible_worst_is_negative() {
        let value = score("terrible, worst ever");
        assert!(value < -0.8, "got {value}");
        assert_eq!(
            LabelThresholds::default().label_for(value),
            SentimentLabel::Negative
        );
    }

    #[test]
    fn text_without_sentiment_words_is_zero() {
        assert_eq!(score("The train leaves at noon"), 0.0);
        assert_eq!(score(""), 0.0);
        assert_eq!(score("   "), 0.0);
    }

    #[test]
    fn negation_flips_polarity() {
        assert!(score("this is good") > 0.0);
        assert!(score("this is not good") < 0.0);
        assert!(score("this isn't good") < 0.0);
        assert!(score("this isn\u{2019}t good") < 0.0);
    }

    #[test]
    fn boosters_amplify_and_dampen() {
        let plain = score("good");
        assert!(score("very good") > plain);
        assert!(score("slightly good") < plain);
        assert!(score("very bad") < score("bad"));
    }

    #[test]
    fn caps_emphasis_applies_only_with_mixed_case() {
        assert!(score("this is GREAT") > score("this is great"));
        assert!((score("THIS IS GREAT") - score("this is great")).abs() < 1e-9);
    }

    #[test]
    fn but_shifts_weight_to_second_clause() {
        assert!(score("the food was good but the service was terrible") < 0.0);
    }

    #[test]
    fn exclamations_are_capped() {
        assert!(score("great!!") > score("great"));
        assert!((score("great!!!!") - score("great!!!!!!!!")).abs() < 1e-9);
    }

    #[test]
    fn urls_and_mentions_are_ignored() {
        let base = score("good day");
        assert!((score("@bad_guy good day https://bad.example/worst") - base).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_score_magnitude() {
        let raw = LexiconStrategy::new().score("awful").expect("score");
        assert!((raw.confidence - raw.score.abs()).abs() < 1e-12);
        assert!((-1.0..=1.0).contains(&raw.score));
    }
}
