//! Pattern-only detection of "remember / recall / forget" requests

use super::{Detection, IntentDetector};
use async_trait::async_trait;

const LIST_ALL_PHRASES: &[&str] = &[
    "覚えていることを教えて",
    "覚えていることを一覧表示",
    "覚えていることをリストアップ",
    "記憶していることを教えて",
    "記憶一覧",
    "メモリーリスト",
    "全ての記憶を教えて",
    "すべての記憶を教えて",
    "全ての記憶を見せて",
    "すべての記憶を見せて",
    "全ての記憶を表示",
    "すべての記憶を表示",
    "記憶を見せて",
    "覚えていることは何",
    "何を覚えている",
    "何を記憶している",
];

const FORGET_ALL_PHRASES: &[&str] = &[
    "全部忘れて",
    "全て忘れて",
    "すべて忘れて",
    "全ての記憶を忘れて",
    "すべての記憶を忘れて",
    "全ての記憶を消して",
    "すべての記憶を消して",
    "全ての記憶を削除",
    "すべての記憶を削除",
    "記憶をすべて消して",
    "記憶を全部消して",
    "記憶をリセット",
];

const HELP_PHRASES: &[&str] = &[
    "記憶の使い方",
    "記憶機能の使い方",
    "記憶機能について",
    "メモリー機能の使い方",
    "記憶のヘルプ",
    "記憶ヘルプ",
];

const STORE_MARKERS: &[&str] = &["を覚えて", "を記憶して"];
const RETRIEVE_MARKERS: &[&str] = &["を思い出して", "について教えて"];
const FORGET_MARKERS: &[&str] = &["を忘れて"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryIntent {
    ListAll,
    ForgetAll,
    Help,
    Store { content: String },
    Retrieve { key: String },
    Forget { key: String },
}

impl MemoryIntent {
    pub fn tag(&self) -> &'static str {
        match self {
            MemoryIntent::ListAll => "list_all",
            MemoryIntent::ForgetAll => "forget_all",
            MemoryIntent::Help => "help",
            MemoryIntent::Store { .. } => "store",
            MemoryIntent::Retrieve { .. } => "retrieve",
            MemoryIntent::Forget { .. } => "forget",
        }
    }
}

/// Split stored content into key and value on the first colon, else on the
/// first topic particle "は". Without either, the whole text is both.
pub fn split_key_value(content: &str) -> (String, String) {
    let content = content.trim();
    let split = [":", "：", "は"].iter().find_map(|delimiter| {
        content
            .split_once(delimiter)
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
    });
    match split {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => (key, value),
        _ => (content.to_string(), content.to_string()),
    }
}

/// Text before the first occurrence of the earliest-listed marker present.
/// `None` when no marker occurs; `Some("")` when one occurs with nothing before it.
fn content_before(text: &str, markers: &[&str]) -> Option<String> {
    let mut seen = false;
    for marker in markers {
        if let Some((before, _)) = text.split_once(marker) {
            seen = true;
            let before = before.trim();
            if !before.is_empty() {
                return Some(before.to_string());
            }
        }
    }
    seen.then(String::new)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryIntentDetector;

impl MemoryIntentDetector {
    pub fn new() -> Self {
        Self
    }

    /// Bulk operations and help are checked before single-key markers.
    pub fn classify(&self, utterance: &str) -> Detection<MemoryIntent> {
        let text = utterance.trim();
        let contains = |phrases: &[&str]| phrases.iter().any(|p| text.contains(p));

        if contains(LIST_ALL_PHRASES) {
            return Detection::Match(MemoryIntent::ListAll);
        }
        if contains(FORGET_ALL_PHRASES) {
            return Detection::Match(MemoryIntent::ForgetAll);
        }
        if contains(HELP_PHRASES) {
            return Detection::Match(MemoryIntent::Help);
        }

        let single_key: [(&[&str], fn(String) -> MemoryIntent); 3] = [
            (STORE_MARKERS, |content| MemoryIntent::Store { content }),
            (RETRIEVE_MARKERS, |key| MemoryIntent::Retrieve { key }),
            (FORGET_MARKERS, |key| MemoryIntent::Forget { key }),
        ];
        for (markers, build) in single_key {
            if let Some(content) = content_before(text, markers) {
                if content.is_empty() {
                    return Detection::NoMatch;
                }
                return Detection::Match(build(content));
            }
        }
        Detection::NoMatch
    }
}

#[async_trait]
impl IntentDetector for MemoryIntentDetector {
    type Intent = MemoryIntent;

    async fn detect(&self, utterance: &str) -> anyhow::Result<Detection<MemoryIntent>> {
        Ok(self.classify(utterance))
    }
}
