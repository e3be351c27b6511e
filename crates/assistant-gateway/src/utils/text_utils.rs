//! Small text helpers shared by detectors and renderers

use std::borrow::Cow;

pub struct TextUtils;

impl TextUtils {
    /// True when any of `patterns` occurs in `text`, ignoring case
    pub fn contains_any(text: &str, patterns: &[&str]) -> bool {
        let lowered = text.to_lowercase();
        patterns.iter().any(|p| lowered.contains(&p.to_lowercase()))
    }

    /// True when any of `words` occurs in `text` as a whole word, ignoring case.
    /// See [`TextUtils::find_word`].
    pub fn contains_any_word(text: &str, words: &[&str]) -> bool {
        let lowered = text.to_lowercase();
        words.iter().any(|w| Self::find_word(&lowered, &w.to_lowercase()).is_some())
    }

    /// Byte offset of the first whole-word occurrence of `word` in `text`.
    ///
    /// Only ASCII alphanumerics glue words together, so "list" does not match
    /// inside "listen" while kana and kanji keywords still match anywhere.
    pub fn find_word(text: &str, word: &str) -> Option<usize> {
        if word.is_empty() {
            return None;
        }
        text.match_indices(word)
            .map(|(pos, _)| pos)
            .find(|&pos| Self::is_whole_word_at(text, pos, word))
    }

    /// Whether `word`, found at byte offset `pos`, is not part of a longer ASCII word.
    pub fn is_whole_word_at(text: &str, pos: usize, word: &str) -> bool {
        let before = text.get(..pos).and_then(|s| s.chars().next_back());
        let after = text.get(pos + word.len()..).and_then(|s| s.chars().next());
        !glued(word.chars().next(), before) && !glued(word.chars().next_back(), after)
    }

    /// Whitespace-delimited word count, used as a token estimate
    pub fn count_words(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        text.split_whitespace().count()
    }

    /// Truncate to `max_chars` characters, appending "..." when cut
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        let mut result: String = text.chars().take(max_chars).collect();
        result.push_str("...");
        Cow::Owned(result)
    }
}

fn glued(edge: Option<char>, neighbour: Option<char>) -> bool {
    matches!((edge, neighbour), (Some(e), Some(n)) if e.is_ascii_alphanumeric() && n.is_ascii_alphanumeric())
}
