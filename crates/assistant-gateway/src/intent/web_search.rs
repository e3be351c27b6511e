//! Web-search detection: date fast path, keyword fast path, then a model probe

use super::code_host::mentions_code_host;
use super::{decision, probe, Detection, IntentDetector};
use crate::capabilities::Generator;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const DATE_PHRASES: &[&str] = &[
    "今日の日付",
    "本日の日付",
    "今日は何日",
    "今日は何月何日",
    "今日は何曜日",
    "今日の曜日",
    "today's date",
    "what day is it today",
    "what is the date today",
];

const SEARCH_KEYWORDS: &[&str] = &[
    "web検索",
    "ウェブ検索",
    "ネットで検索",
    "検索して",
    "調べて",
    "ググって",
    "search for",
    "look up",
];

const TRAILING_NOISE: &[&str] = &["について", "に関して", "のこと", "を", "で", "、", ",", "，"];
const EDGE_PUNCTUATION: &[char] = &[' ', '　', '、', '。', ':', '：', '?', '？', '!', '！', '「', '」'];

const INSTRUCTION: &str = r#"あなたはユーザーメッセージからWeb検索の意図を特定するアシスタントです。
以下のメッセージからWeb検索の意図を検出し、JSONフォーマットで返してください。

以下のような表現が検索意図を示します:
1. 「検索して」「調べて」などの明示的な検索リクエスト
2. 「〜について教えて」のような情報要求
3. 「最新の〜は?」のような最新情報の要求
4. 「〜の方法は?」のような手順や方法の質問

出力はJSON形式で:
{
  "is_search_intent": true/false,
  "search_query": "検索クエリ（検索意図がない場合は空）"
}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSearchIntent {
    /// "What is today's date", answered from the local clock.
    CurrentDate,
    Query(String),
}

fn strip_trailing_noise(text: &str) -> &str {
    let mut current = text.trim_matches(EDGE_PUNCTUATION);
    loop {
        let stripped = TRAILING_NOISE
            .iter()
            .find_map(|noise| current.strip_suffix(noise))
            .map(|s| s.trim_matches(EDGE_PUNCTUATION));
        match stripped {
            Some(next) if next.len() < current.len() => current = next,
            _ => return current,
        }
    }
}

/// Query text around the first search keyword: the text before it, or the
/// text after it when nothing precedes the keyword.
pub(crate) fn derive_query(text: &str) -> Option<String> {
    let lowered = text.to_ascii_lowercase();
    let (start, keyword) = SEARCH_KEYWORDS
        .iter()
        .filter_map(|kw| lowered.find(kw).map(|pos| (pos, *kw)))
        .min_by_key(|(pos, _)| *pos)?;

    let before = strip_trailing_noise(&text[..start]);
    let query = if before.is_empty() {
        let after = text[start + keyword.len()..].trim_matches(EDGE_PUNCTUATION);
        let after = ["ください", "下さい"]
            .iter()
            .find_map(|polite| after.strip_suffix(polite))
            .unwrap_or(after);
        strip_trailing_noise(after)
    } else {
        before
    };
    (!query.is_empty()).then(|| query.to_string())
}

pub struct WebSearchIntentDetector {
    generator: Arc<dyn Generator>,
}

impl WebSearchIntentDetector {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// The model-free part of detection. `None` means "ask the model".
    pub fn fast_path(utterance: &str) -> Option<Detection<WebSearchIntent>> {
        let lowered = utterance.to_ascii_lowercase();
        if DATE_PHRASES.iter().any(|p| lowered.contains(p)) {
            return Some(Detection::Match(WebSearchIntent::CurrentDate));
        }
        if mentions_code_host(utterance) {
            return Some(Detection::NoMatch);
        }
        if SEARCH_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            return Some(derive_query(utterance).map(WebSearchIntent::Query).into());
        }
        None
    }
}

#[async_trait]
impl IntentDetector for WebSearchIntentDetector {
    type Intent = WebSearchIntent;

    async fn detect(&self, utterance: &str) -> anyhow::Result<Detection<WebSearchIntent>> {
        if let Some(detection) = Self::fast_path(utterance) {
            return Ok(detection);
        }

        let Some(object) = probe(self.generator.as_ref(), INSTRUCTION, utterance, false).await? else {
            return Ok(Detection::NoMatch);
        };
        let query = decision(&object, &["is_search_intent", "is_match"], &["search_query", "query"])
            .map(|(query, _)| query)
            .filter(|query| !query.is_empty());
        if let Some(query) = &query {
            debug!("Model detected web search for '{}'", query);
        }
        Ok(query.map(WebSearchIntent::Query).into())
    }
}
