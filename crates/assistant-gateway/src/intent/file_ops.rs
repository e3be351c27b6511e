//! File-operation detection via a model probe, gated by file vocabulary

use super::{decision, probe, Detection, IntentDetector};
use crate::capabilities::{FileOperation, Generator};
use crate::utils::TextUtils;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref FILE_NAME: Regex = Regex::new(r"[\w\-]+\.[A-Za-z][A-Za-z0-9]{0,4}(?:[^A-Za-z0-9]|$)").unwrap();
}

const FILE_WORDS: &[&str] = &[
    "ファイル", "フォルダ", "ディレクトリ", "file", "folder", "directory",
];

const INSTRUCTION: &str = r#"あなたはユーザーメッセージからファイル操作意図を特定するアシスタントです。
以下のメッセージからファイル操作の意図を検出し、JSONフォーマットで返してください。

以下の操作を検出できます:
1. ファイル一覧表示: 例「ファイル一覧を表示して」「ディレクトリの内容を見せて」
2. ファイル読み込み: 例「example.txtの内容を見せて」「このファイルを開いて」
3. ファイル書き込み: 例「example.txtに次の内容を書き込んで: [内容]」
4. ディレクトリ作成: 例「新しいフォルダを作って」
5. ファイル/ディレクトリ削除: 例「このファイルを削除して」
6. ファイル移動: 例「このファイルをそのディレクトリに移動して」
7. ファイルコピー: 例「このファイルをコピーして」

出力はJSON形式で:
{
  "is_file_operation": true/false,
  "operation_type": "list_files/read_file/write_file/create_directory/delete_file/move_file/copy_file",
  "parameters": {
    "path": "ファイルパス",
    "content": "書き込む内容",
    "source": "移動元・コピー元パス",
    "destination": "移動先・コピー先パス"
  }
}"#;

/// True when the utterance talks about files at all.
fn mentions_files(text: &str) -> bool {
    TextUtils::contains_any(text, FILE_WORDS) || text.contains('/') || text.contains('\\') || FILE_NAME.is_match(text)
}

pub struct FileIntentDetector {
    generator: Arc<dyn Generator>,
}

impl FileIntentDetector {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl IntentDetector for FileIntentDetector {
    type Intent = FileOperation;

    async fn detect(&self, utterance: &str) -> anyhow::Result<Detection<FileOperation>> {
        if !mentions_files(utterance) {
            return Ok(Detection::NoMatch);
        }

        // No repair here: a half-formed answer is treated as "not a file request".
        let Some(object) = probe(self.generator.as_ref(), INSTRUCTION, utterance, false).await? else {
            return Ok(Detection::NoMatch);
        };
        let Some((tag, params)) = decision(&object, &["is_file_operation", "is_match"], &["operation_type", "operation"]) else {
            return Ok(Detection::NoMatch);
        };

        let operation = FileOperation::from_wire(&tag, &params);
        if operation.is_none() {
            debug!("File probe returned unusable operation '{}'", tag);
        }
        Ok(operation.into())
    }
}
