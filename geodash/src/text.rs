//! Text normalisation shared by the matcher, the stores and the cache key.

/// Fold text for matching: transliterate to ASCII, lower-case, collapse
/// whitespace runs to one space and trim.
///
/// Glyphs `deunicode` has no rendering for are dropped.
pub fn fold(text: &str) -> String {
    let ascii = deunicode::deunicode_with_tofu(text, "");
    let mut out = String::with_capacity(ascii.len());
    for word in ascii.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars().map(|c| c.to_ascii_lowercase()));
    }
    out
}

/// Upper-case a two-letter country code, trimming surrounding whitespace.
pub fn normalize_country(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// The first `n` characters of a folded string.
pub fn prefix(folded: &str, n: usize) -> &str {
    match folded.char_indices().nth(n) {
        Some((idx, _)) => &folded[..idx],
        None => folded,
    }
}
