//! 辞書ベース分類で使う単語表。
//!
//! 極性値は -4.0〜+4.0 の範囲。キーは小文字。
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

const VALENCE_ENTRIES: &[(&str, f64)] = &[
    // positive
    ("love", 3.2),
    ("loved", 2.9),
    ("loves", 2.7),
    ("loving", 2.9),
    ("lovely", 2.8),
    ("like", 1.5),
    ("liked", 1.8),
    ("good", 1.9),
    ("great", 3.1),
    ("excellent", 2.7),
    ("amazing", 2.8),
    ("awesome", 3.1),
    ("best", 3.2),
    ("better", 1.9),
    ("happy", 2.7),
    ("happiness", 2.6),
    ("glad", 2.0),
    ("nice", 1.8),
    ("fantastic", 2.6),
    ("wonderful", 2.7),
    ("perfect", 2.7),
    ("beautiful", 2.9),
    ("brilliant", 2.8),
    ("cool", 1.3),
    ("fun", 2.3),
    ("funny", 1.9),
    ("enjoy", 2.2),
    ("enjoyed", 2.3),
    ("excited", 1.4),
    ("exciting", 2.2),
    ("win", 2.8),
    ("wins", 2.7),
    ("winning", 2.4),
    ("won", 2.7),
    ("thanks", 1.9),
    ("thank", 1.5),
    ("grateful", 2.0),
    ("hope", 1.9),
    ("hopeful", 1.6),
    ("positive", 2.6),
    ("success", 2.7),
    ("successful", 2.8),
    ("proud", 2.1),
    ("impressive", 2.3),
    ("impressed", 2.1),
    ("recommend", 1.5),
    ("favorite", 2.0),
    ("yay", 2.4),
    ("lol", 1.8),
    ("haha", 2.0),
    ("smile", 1.5),
    ("strong", 2.3),
    ("support", 1.7),
    ("safe", 1.9),
    ("kind", 2.4),
    ("sweet", 2.0),
    ("superb", 3.1),
    ("agree", 1.5),
    ("calm", 1.3),
    ("easy", 1.9),
    ("free", 2.3),
    ("gain", 2.4),
    ("gains", 2.0),
    ("glorious", 3.2),
    ("joy", 2.8),
    ("laugh", 2.6),
    ("peace", 2.5),
    ("pleased", 1.9),
    ("ok", 0.9),
    ("okay", 0.9),
    ("fine", 0.8),
    ("wow", 2.8),
    ("welcome", 2.0),
    ("worth", 0.9),
    ("helpful", 1.8),
    ("useful", 1.9),
    ("effective", 2.1),
    ("fair", 1.3),
    ("trust", 2.3),
    ("bullish", 2.0),
    ("rally", 1.6),
    ("congrats", 2.4),
    ("congratulations", 2.9),
    ("celebrate", 2.7),
    ("delighted", 3.0),
    ("outstanding", 3.0),
    ("solid", 1.6),
    ("improve", 1.9),
    ("improved", 2.1),
    // negative
    ("hate", -2.7),
    ("hated", -3.2),
    ("hates", -1.9),
    ("terrible", -2.5),
    ("worst", -3.1),
    ("worse", -2.1),
    ("bad", -2.5),
    ("awful", -2.0),
    ("horrible", -2.5),
    ("sad", -2.1),
    ("angry", -2.3),
    ("annoying", -1.7),
    ("annoyed", -1.6),
    ("disappointed", -1.9),
    ("disappointing", -2.2),
    ("poor", -2.1),
    ("ugly", -2.3),
    ("stupid", -2.4),
    ("boring", -1.3),
    ("fail", -2.5),
    ("failed", -2.3),
    ("fails", -2.0),
    ("failure", -2.3),
    ("wrong", -2.1),
    ("problem", -1.7),
    ("problems", -1.7),
    ("broken", -2.1),
    ("crash", -1.7),
    ("crashed", -2.0),
    ("lose", -1.7),
    ("loss", -1.3),
    ("losses", -1.7),
    ("lost", -1.3),
    ("kill", -3.7),
    ("killed", -3.5),
    ("dead", -3.3),
    ("death", -2.9),
    ("die", -2.9),
    ("cry", -2.1),
    ("pain", -2.3),
    ("hurt", -2.4),
    ("sick", -2.3),
    ("fear", -2.2),
    ("scared", -1.9),
    ("afraid", -2.0),
    ("worry", -1.9),
    ("worried", -1.2),
    ("crisis", -3.1),
    ("disaster", -3.1),
    ("scam", -2.9),
    ("fraud", -2.8),
    ("useless", -1.8),
    ("waste", -1.8),
    ("sucks", -1.5),
    ("suck", -1.9),
    ("damn", -1.7),
    ("shit", -2.6),
    ("crap", -1.6),
    ("wtf", -2.8),
    ("ugh", -1.8),
    ("mess", -1.5),
    ("nightmare", -1.9),
    ("evil", -3.4),
    ("miserable", -2.2),
    ("upset", -1.6),
    ("mad", -2.2),
    ("rude", -2.0),
    ("toxic", -2.4),
    ("unfair", -2.1),
    ("weak", -1.9),
    ("panic", -1.9),
    ("bearish", -1.8),
    ("delay", -1.3),
    ("delayed", -0.9),
    ("negative", -2.7),
    ("unhappy", -1.8),
    ("lie", -1.6),
    ("liar", -2.4),
    ("lonely", -1.5),
    ("guilty", -1.8),
    ("pathetic", -2.9),
    ("disgusting", -2.9),
    ("furious", -2.7),
    ("ruined", -2.5),
];

/// 後続の極性語を強める(+)・弱める(-)修飾語。
const BOOSTER_ENTRIES: &[(&str, bool)] = &[
    ("absolutely", true),
    ("amazingly", true),
    ("completely", true),
    ("considerably", true),
    ("deeply", true),
    ("enormously", true),
    ("entirely", true),
    ("especially", true),
    ("exceptionally", true),
    ("extremely", true),
    ("fully", true),
    ("greatly", true),
    ("highly", true),
    ("hugely", true),
    ("incredibly", true),
    ("intensely", true),
    ("more", true),
    ("most", true),
    ("particularly", true),
    ("purely", true),
    ("quite", true),
    ("really", true),
    ("remarkably", true),
    ("so", true),
    ("substantially", true),
    ("thoroughly", true),
    ("totally", true),
    ("tremendously", true),
    ("unbelievably", true),
    ("utterly", true),
    ("very", true),
    ("almost", false),
    ("barely", false),
    ("hardly", false),
    ("kinda", false),
    ("less", false),
    ("little", false),
    ("marginally", false),
    ("occasionally", false),
    ("partly", false),
    ("scarcely", false),
    ("slightly", false),
    ("somewhat", false),
    ("sorta", false),
];

const NEGATION_ENTRIES: &[&str] = &[
    "not", "no", "never", "none", "nobody", "nothing", "neither", "nor", "nowhere", "cannot",
    "without", "aint", "dont", "doesnt", "didnt", "isnt", "wasnt", "arent", "werent", "wont",
    "cant", "couldnt", "shouldnt", "wouldnt", "hasnt", "havent", "hadnt",
];

pub(super) static VALENCE: LazyLock<HashMap<&'static str, f64>> =
    LazyLock::new(|| VALENCE_ENTRIES.iter().copied().collect());

/// 値が `true` なら強調、`false` なら減衰。
pub(super) static BOOSTERS: LazyLock<HashMap<&'static str, bool>> =
    LazyLock::new(|| BOOSTER_ENTRIES.iter().copied().collect());

pub(super) static NEGATIONS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| NEGATION_ENTRIES.iter().copied().collect());

/// 否定語かどうか。`n't` で終わる語も否定として扱う。
pub(super) fn is_negation(lower: &str) -> bool {
    NEGATIONS.contains(lower) || lower.ends_with("n't")
}
