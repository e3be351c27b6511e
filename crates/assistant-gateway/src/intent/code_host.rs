//! Code-host (GitHub) operation detection

use super::{decision, probe, Detection, IntentDetector};
use crate::capabilities::{CodeHostOperation, Generator};
use crate::utils::TextUtils;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const CODE_HOST_WORDS: &[&str] = &["github", "リポジトリ", "レポジトリ", "repository", "repositories"];
const SEARCH_WORDS: &[&str] = &["検索", "探して", "search", "find"];
const LIST_WORDS: &[&str] = &["一覧", "リスト", "list"];

/// Particles that tie a query to the code-host words or the search word.
const QUERY_PARTICLES: &[&str] = &["上", "から", "で", "の", "を", "、", "for", "on", "in"];
/// Request endings that follow a Japanese search word.
const REQUEST_ENDINGS: &[&str] = &["してください", "して下さい", "して", "する", "for", "on", "in"];

const INSTRUCTION: &str = r#"あなたはユーザーメッセージからGitHub操作の意図を特定するアシスタントです。
以下のメッセージからGitHub操作の意図を検出し、JSONフォーマットで返してください。

以下の操作を検出できます:
1. リポジトリ一覧表示: 例「GitHubのリポジトリ一覧を表示して」
2. リポジトリ作成: 例「新しいリポジトリを作成して」
3. リポジトリ検索: 例「Pythonのマークダウンパーサーのリポジトリを検索して」
4. ファイル内容取得: 例「リポジトリのREADME.mdを表示して」
5. ファイル作成・更新: 例「リポジトリにHello Worldのファイルを作成して」
6. イシュー作成: 例「バグ報告のイシューを作成して」
7. プルリクエスト作成: 例「このブランチからプルリクエストを作成して」

出力はJSON形式で:
{
  "is_github_operation": true/false,
  "operation_type": "list_repos/create_repo/search_repos/get_file/update_file/create_issue/create_pr",
  "parameters": {
    "owner": "リポジトリのオーナー",
    "repo": "リポジトリ名",
    "path": "ファイルパス",
    "content": "ファイル内容",
    "name": "作成するリポジトリ名",
    "query": "検索クエリ",
    "title": "イシュー・プルリクエストのタイトル",
    "head": "変更を含むブランチ",
    "base": "マージ先のブランチ"
  }
}"#;

pub(crate) fn mentions_code_host(text: &str) -> bool {
    TextUtils::contains_any_word(text, CODE_HOST_WORDS)
}

fn strip_leading<'a>(text: &'a str, words: &[&str]) -> Option<&'a str> {
    let lowered = text.to_ascii_lowercase();
    words
        .iter()
        .find(|w| lowered.starts_with(*w) && TextUtils::is_whole_word_at(&lowered, 0, w))
        .map(|w| text[w.len()..].trim_start())
}

fn strip_trailing<'a>(text: &'a str, words: &[&str]) -> Option<&'a str> {
    let lowered = text.to_ascii_lowercase();
    words
        .iter()
        .find(|w| lowered.ends_with(*w) && TextUtils::is_whole_word_at(&lowered, lowered.len() - w.len(), w))
        .map(|w| text[..text.len() - w.len()].trim_end())
}

#[derive(Debug, Clone, Copy)]
enum Side {
    BeforeSearchWord,
    AfterSearchWord,
}

/// Peel code-host words off both ends of a fragment. A particle is only
/// dropped next to a removed code-host word or the search word, so names
/// such as "上海" or "formatter" survive.
fn trim_noise(text: &str, side: Side) -> &str {
    let mut current = text.trim();
    current = match side {
        Side::BeforeSearchWord => strip_trailing(current, QUERY_PARTICLES),
        Side::AfterSearchWord => strip_leading(current, REQUEST_ENDINGS),
    }
    .unwrap_or(current);

    loop {
        if let Some(rest) = strip_leading(current, CODE_HOST_WORDS) {
            current = strip_leading(rest, QUERY_PARTICLES).unwrap_or(rest);
        } else if let Some(rest) = strip_trailing(current, CODE_HOST_WORDS) {
            current = strip_trailing(rest, QUERY_PARTICLES).unwrap_or(rest);
        } else {
            return current;
        }
    }
}

/// Search query around the first search word: before it, else after it.
fn derive_search_query(text: &str) -> Option<String> {
    let lowered = text.to_ascii_lowercase();
    let (start, word) = SEARCH_WORDS
        .iter()
        .filter_map(|w| TextUtils::find_word(&lowered, w).map(|pos| (pos, *w)))
        .min_by_key(|(pos, _)| *pos)?;

    let before = trim_noise(&text[..start], Side::BeforeSearchWord);
    let query = if before.is_empty() {
        trim_noise(&text[start + word.len()..], Side::AfterSearchWord)
    } else {
        before
    };
    (!query.is_empty()).then(|| query.to_string())
}

pub struct CodeHostIntentDetector {
    generator: Arc<dyn Generator>,
}

impl CodeHostIntentDetector {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// Rule-based operations. `None` leaves the decision to the model.
    fn by_rules(utterance: &str) -> Option<CodeHostOperation> {
        if TextUtils::contains_any_word(utterance, SEARCH_WORDS) {
            return derive_search_query(utterance).map(|query| CodeHostOperation::SearchRepos {
                query,
                page: 1,
                per_page: 10,
            });
        }
        if TextUtils::contains_any_word(utterance, LIST_WORDS) {
            return Some(CodeHostOperation::ListRepos);
        }
        None
    }
}

#[async_trait]
impl IntentDetector for CodeHostIntentDetector {
    type Intent = CodeHostOperation;

    async fn detect(&self, utterance: &str) -> anyhow::Result<Detection<CodeHostOperation>> {
        if !mentions_code_host(utterance) {
            return Ok(Detection::NoMatch);
        }
        if let Some(operation) = Self::by_rules(utterance) {
            return Ok(Detection::Match(operation));
        }

        let Some(object) = probe(self.generator.as_ref(), INSTRUCTION, utterance, false).await? else {
            return Ok(Detection::NoMatch);
        };
        let Some((tag, params)) = decision(
            &object,
            &["is_github_operation", "is_code_host_operation", "is_match"],
            &["operation_type", "operation"],
        ) else {
            return Ok(Detection::NoMatch);
        };

        let operation = CodeHostOperation::from_wire(&tag, &params);
        if operation.is_none() {
            debug!("Code-host probe returned unusable operation '{}'", tag);
        }
        Ok(operation.into())
    }
}
