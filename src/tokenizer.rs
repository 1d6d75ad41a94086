//! Text normalization and word tokenization shared by all embedding backends.

use std::sync::LazyLock;

use regex::Regex;

/// Words (with inner `-` or `.` kept, so `col-1` and `3.5` stay whole),
/// apostrophe suffixes, then any other single non-space character.
static WORD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\w+(?:[-.]\w+)*|'\w+|[^\w\s]").expect("word pattern is a valid regex")
});

/// Anything that turns a piece of text into an ordered list of tokens.
pub trait Tokenizer {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Lowercase `text`. Every backend sees text through this before tokenizing.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
}

/// Treebank-flavoured word tokenizer.
///
/// Follows the Penn Treebank conventions that change token counts:
/// - punctuation becomes its own token;
/// - `'s`, `'re`, `'ll` and similar suffixes split off, and `n't` splits as
///   a unit (`can't` → `ca`, `n't`);
/// - double quotes become ``` `` ``` when opening and `''` when closing.
///
/// Underscores, and `-` or `.` between word characters, stay inside words.
/// Sentence-final period handling and the rarer contraction rules (`cannot`,
/// `gonna`) are not applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        let mut prev_end = None;

        for m in WORD_PATTERN.find_iter(text) {
            let token = m.as_str();
            let attached = prev_end == Some(m.start());
            prev_end = Some(m.end());

            if token == "\"" {
                tokens.push(quote_token(text, m.start()).to_string());
                continue;
            }
            let negation = attached
                && token.eq_ignore_ascii_case("'t")
                && tokens.last().is_some_and(|p| p.ends_with(['n', 'N']));
            if negation {
                if let Some(mut prev) = tokens.pop() {
                    let n = prev.pop().unwrap_or('n');
                    if !prev.is_empty() {
                        tokens.push(prev);
                    }
                    tokens.push(format!("{n}{token}"));
                    continue;
                }
            }
            tokens.push(token.to_string());
        }
        tokens
    }
}

/// Opening quote at the start of text or after whitespace or an opening bracket.
fn quote_token(text: &str, start: usize) -> &'static str {
    match text[..start].chars().next_back() {
        None => "``",
        Some(c) if c.is_whitespace() || "([{<".contains(c) => "``",
        Some(_) => "''",
    }
}

/// Splits on whitespace only.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }
}
