/// テキスト処理ユーティリティ。
///
/// 正規化とハッシングを提供する。重複排除と辞書照合はどちらも
/// ここで正規化した文字列を前提にしている。
use unicode_normalization::UnicodeNormalization;
use xxhash_rust::xxh3::xxh3_64;

/// テキストをXXH3でハッシュする。
#[must_use]
pub fn hash_text(text: &str) -> u64 {
    xxh3_64(text.as_bytes())
}

/// NFC正規化したうえで制御文字を空白に置き換え、連続する空白を1つにまとめる。
///
/// 先頭と末尾の空白は取り除く。ゼロ幅文字（U+200B..U+200D, U+FEFF）も除去する。
#[must_use]
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;

    for ch in input.nfc() {
        if matches!(ch, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}') {
            continue;
        }
        if ch.is_whitespace() || ch.is_control() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }

    out
}

/// ログ出力用に先頭 `max_chars` 文字だけを返す。
#[must_use]
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
