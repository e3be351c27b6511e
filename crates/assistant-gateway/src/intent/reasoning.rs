//! Reasoning-request detection.
//!
//! Explicit "explain why / think step by step" wording is claimed directly as a
//! step-by-step task; anything else is classified by the model, which may also
//! pick statement evaluation or option comparison.

use super::{decision, probe, Detection, IntentDetector};
use crate::capabilities::Generator;
use crate::reasoning::{DetailLevel, ReasoningTask};
use crate::utils::TextUtils;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

const REASONING_KEYWORDS: &[&str] = &[
    "理由を説明して",
    "分析して",
    "考えて",
    "推論して",
    "ステップバイステップで",
    "考察して",
    "論理的に説明して",
    "なぜ",
    "どうして",
    "証明して",
];

const DETAIL_KEYWORDS: &[(&str, DetailLevel)] = &[
    ("詳しく", DetailLevel::High),
    ("詳細に", DetailLevel::High),
    ("簡潔に", DetailLevel::Low),
    ("簡単に", DetailLevel::Low),
    ("要点だけ", DetailLevel::Low),
];

const INSTRUCTION: &str = r#"あなたはユーザーメッセージから推論の意図を特定するアシスタントです。
以下のメッセージから推論の意図を検出し、JSONフォーマットで返してください。

以下のような表現が推論意図を示します:
1. ステップバイステップで考えてほしい要求
2. 理由を説明してほしい要求
3. 論理的分析や証明を求める表現
4. オプションの比較や評価を求める表現
5. 文の真偽の評価を求める表現

必ず以下のJSON形式で出力してください。すべてのプロパティ名はダブルクォーテーション（"）で囲んでください：
{
  "is_reasoning_intent": true/false,
  "reasoning_type": "step_by_step/evaluate_statement/compare_options",
  "parameters": {
    "question": "推論のための質問・問題",
    "context": "追加コンテキスト（あれば）",
    "detail_level": "low/medium/high",
    "options": ["選択肢1", "選択肢2"]
  }
}"#;

/// Detail level requested by wording such as "詳しく" or "簡潔に".
pub fn detect_detail_level(text: &str) -> DetailLevel {
    DETAIL_KEYWORDS
        .iter()
        .find(|(keyword, _)| text.contains(keyword))
        .map(|(_, level)| *level)
        .unwrap_or_default()
}

pub struct ReasoningIntentDetector {
    generator: Arc<dyn Generator>,
}

impl ReasoningIntentDetector {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl IntentDetector for ReasoningIntentDetector {
    type Intent = ReasoningTask;

    async fn detect(&self, utterance: &str) -> anyhow::Result<Detection<ReasoningTask>> {
        let text = utterance.trim();
        if text.is_empty() {
            return Ok(Detection::NoMatch);
        }
        let detail = detect_detail_level(text);

        if TextUtils::contains_any(text, REASONING_KEYWORDS) {
            debug!("Reasoning keyword found, detail={}", detail.as_str());
            return Ok(Detection::Match(ReasoningTask::StepByStep {
                question: text.to_string(),
                context: None,
                detail,
            }));
        }

        let Some(object) = probe(self.generator.as_ref(), INSTRUCTION, text, true).await? else {
            return Ok(Detection::NoMatch);
        };
        let Some((kind, params)) = decision(&object, &["is_reasoning_intent", "is_match"], &["reasoning_type"]) else {
            return Ok(Detection::NoMatch);
        };

        let task = ReasoningTask::from_wire(&kind, &params, detail);
        if let Some(task) = &task {
            info!("Reasoning intent detected: {} ({})", task.kind(), task.detail().as_str());
        } else {
            debug!("Reasoning probe returned unusable type '{}'", kind);
        }
        Ok(task.into())
    }
}
