//! Generator-backed structured reasoning.
//!
//! Three operations share one shape: a guideline prompt scaled by a
//! [`DetailLevel`], one generator call, best-effort JSON extraction with a
//! single repair pass, and a templated fallback when nothing parses.

pub mod format;

pub use format::format_reasoning_result;

use crate::capabilities::{Generator, SamplingParams, WireParams};
use crate::context_engine::prompt_composer::render_instruction_prompt;
use crate::error::{GatewayError, GatewayResult};
use crate::memory::Message;
use crate::utils::{extract_object_with_repair, ExtractError, TextUtils};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Confidence used when the model's answer carries no score.
pub const DEFAULT_CONFIDENCE: u8 = 75;

/// Confidence attached to templated results built from unparsable output.
pub const FALLBACK_CONFIDENCE: u8 = 50;

const RAW_OUTPUT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl DetailLevel {
    /// Lenient parse: anything unrecognised becomes `Medium`.
    pub fn parse_or_default(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => DetailLevel::Low,
            "medium" => DetailLevel::Medium,
            "high" => DetailLevel::High,
            other => {
                warn!("Invalid detail level '{}', falling back to medium", other);
                DetailLevel::Medium
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetailLevel::Low => "low",
            DetailLevel::Medium => "medium",
            DetailLevel::High => "high",
        }
    }

    pub fn max_steps(&self) -> usize {
        match self {
            DetailLevel::Low => 3,
            DetailLevel::Medium => 5,
            DetailLevel::High => 8,
        }
    }

    pub fn evidence_count(&self) -> usize {
        match self {
            DetailLevel::Low => 2,
            DetailLevel::Medium => 3,
            DetailLevel::High => 5,
        }
    }

    pub fn evaluation_points(&self) -> usize {
        self.evidence_count()
    }

    fn evaluation_wording(&self) -> &'static str {
        match self {
            DetailLevel::Low => "簡潔",
            DetailLevel::Medium => "標準",
            DetailLevel::High => "詳細",
        }
    }
}

/// A reasoning request, either detected in a chat turn or invoked directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasoningTask {
    StepByStep { question: String, context: Option<String>, detail: DetailLevel },
    Evaluate { statement: String, context: Option<String>, detail: DetailLevel },
    Compare {
        question: String,
        options: Vec<String>,
        criteria: Vec<String>,
        context: Option<String>,
        detail: DetailLevel,
    },
}

impl ReasoningTask {
    pub fn kind(&self) -> &'static str {
        match self {
            ReasoningTask::StepByStep { .. } => "step_by_step",
            ReasoningTask::Evaluate { .. } => "evaluate_statement",
            ReasoningTask::Compare { .. } => "compare_options",
        }
    }

    pub fn detail(&self) -> DetailLevel {
        match self {
            ReasoningTask::StepByStep { detail, .. }
            | ReasoningTask::Evaluate { detail, .. }
            | ReasoningTask::Compare { detail, .. } => *detail,
        }
    }

    /// Build from a detector's `{reasoning_type, parameters}` pair.
    /// `detected_detail` applies when the parameters carry no `detail_level`.
    pub fn from_wire(kind: &str, params: &WireParams, detected_detail: DetailLevel) -> Option<Self> {
        let text = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let detail = text("detail_level")
            .map(|raw| DetailLevel::parse_or_default(&raw))
            .unwrap_or(detected_detail);
        let context = text("context");

        match kind.trim() {
            "step_by_step" => Some(ReasoningTask::StepByStep { question: text("question")?, context, detail }),
            "evaluate_statement" => Some(ReasoningTask::Evaluate {
                statement: text("statement").or_else(|| text("question"))?,
                context,
                detail,
            }),
            "compare_options" => Some(ReasoningTask::Compare {
                question: text("question")?,
                options: string_list(params.get("options")),
                criteria: string_list(params.get("criteria")),
                context,
                detail,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepByStepResult {
    pub steps: Vec<String>,
    pub answer: String,
    pub confidence: u8,
    pub reasoning_quality: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementEvaluation {
    pub is_true: Option<bool>,
    pub confidence: u8,
    pub evidence: Vec<String>,
    pub uncertainties: Vec<String>,
    pub conclusion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionEvaluation {
    pub option: String,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionComparison {
    pub evaluations: Vec<OptionEvaluation>,
    pub ranking: Vec<String>,
    pub best_option: Option<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reasoning_type", rename_all = "snake_case")]
pub enum ReasoningOutcome {
    StepByStep(StepByStepResult),
    EvaluateStatement(StatementEvaluation),
    CompareOptions(OptionComparison),
}

/// Clamp a model-reported score into 0..=100. Missing or unreadable scores
/// become `DEFAULT_CONFIDENCE`; strings like "85%" are accepted.
pub fn normalize_confidence(raw: Option<&Value>) -> u8 {
    let value = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 100.0).round() as u8,
        _ => DEFAULT_CONFIDENCE,
    }
}

fn string_list(raw: Option<&Value>) -> Vec<String> {
    match raw {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn string_field(obj: &WireParams, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn raw_excerpt(raw: &str) -> String {
    TextUtils::truncate_with_ellipsis(raw, RAW_OUTPUT_LIMIT).into_owned()
}

fn current_date_line() -> String {
    format!("現在の日付: {}", chrono::Local::now().format("%Y年%m月%d日"))
}

fn push_context(prompt: &mut String, context: Option<&str>) {
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\n\n追加コンテキスト:\n");
        prompt.push_str(context);
    }
}

fn step_by_step_instruction(detail: DetailLevel) -> String {
    format!(
        r#"あなたは高度な論理的推論を行う専門家です。指定された問題について、ステップバイステップで詳細かつ正確な思考プロセスを示してください。

この分析では以下のガイドラインに従ってください：

1. まず問題を慎重に理解し、重要な要素を特定し、解決に必要な情報を明確にしてください。
2. 問題を解決するための論理的アプローチと方法論を選択してください。
3. 最大{max_steps}ステップで論理的思考プロセスを明示し、各ステップで推論を前進させてください。
4. 各ステップを明確に区別し、「ステップ1:」「ステップ2:」などと番号付けしてください。
5. 数学的/論理的問題の場合は、具体的な計算や論理式も示してください。
6. 最後に最終的な回答と、その確信度（0-100%）を提供してください。
7. 確信度の評価では以下の基準を使用してください：
   - 90-100%: 答えが明確で議論の余地がほとんどない
   - 75-89%: 強い確信があるが小さな不確実性が存在する
   - 60-74%: 中程度の確信、複数の解釈の可能性がある
   - 40-59%: 不確実性が高い
   - 0-39%: 推測に基づく回答
8. 会話履歴がある場合は、それを考慮して一貫性のある回答を提供してください。

必ず以下のJSON形式で出力してください。すべてのプロパティ名はダブルクォーテーション（"）で囲んでください：
{{
  "steps": ["ステップ1: ...", "ステップ2: ..."],
  "answer": "最終的な回答",
  "confidence": 85,
  "reasoning_quality": "high/medium/low"
}}

詳細レベル: {level}
{date}"#,
        max_steps = detail.max_steps(),
        level = detail.as_str(),
        date = current_date_line(),
    )
}

fn evaluation_instruction(detail: DetailLevel) -> String {
    format!(
        r#"あなたは文の真偽を厳密に評価する専門家です。以下の文が真であるか偽であるかを慎重に判断し、その確信度と詳細な根拠を示してください。

評価では以下のガイドラインに従ってください：

1. 文を慎重に分析し、含まれる主張を明確に特定してください。
2. 文の各部分について事実関係を検証し、主張全体の真偽を判断してください。
3. 判断に至った根拠を{evidence}つ以上提示し、各根拠が主張のどの部分を支持または反証するかを明確にしてください。
4. 確信度を0%（完全に偽）から100%（完全に真）のスケールで評価してください：
   - 90-100%: 主張が明確に真実で、信頼できる情報源で広く確認されている
   - 75-89%: おそらく真実だが、小さな不正確さや例外がある可能性がある
   - 60-74%: 部分的に真実だが、重要な限定や例外がある
   - 40-59%: 真偽が混在し、確定的な判断が難しい
   - 25-39%: おそらく偽だが、部分的に正確な要素を含む
   - 0-24%: 主張が明確に偽である
5. 判断に不確実性がある場合は、その具体的な内容と理由を明示してください。
6. 会話履歴がある場合は、それを考慮して評価してください。

必ず以下のJSON形式で出力してください。すべてのプロパティ名はダブルクォーテーション（"）で囲んでください：
{{
  "is_true": true,
  "confidence": 75,
  "evidence": ["根拠1: ...", "根拠2: ..."],
  "uncertainties": ["不確実性がある場合はここに記述"],
  "conclusion": "最終的な評価の要約"
}}

詳細レベル: {level}
{date}"#,
        evidence = detail.evidence_count(),
        level = detail.as_str(),
        date = current_date_line(),
    )
}

fn comparison_instruction(detail: DetailLevel) -> String {
    format!(
        r#"あなたは複数の選択肢を論理的に比較して最適な選択をする専門家です。以下の質問に対して、与えられた選択肢を慎重に比較分析し、最適なものを選んでください。

比較では以下のガイドラインに従ってください：

1. 各選択肢を{wording}に評価し、それぞれ少なくとも{points}つの評価ポイントを挙げてください。
2. 質問の文脈を考慮して選択肢を比較し、どの選択基準が最も重要かを考慮してください。
3. 各選択肢の長所と短所を具体的に分析し、各選択肢に0-100のスコアを割り当ててください。
4. スコアの根拠を明確に説明してください。
5. 最終的に最適な選択肢を選び、その選択の根拠と理由を詳細に説明してください。
6. オプション間の相対的な優劣を明確にするためにランキングを作成してください。
7. 会話履歴がある場合は、それを考慮して一貫性のある比較を提供してください。

必ず以下のJSON形式で出力してください。すべてのプロパティ名はダブルクォーテーション（"）で囲んでください：
{{
  "evaluations": [
    {{"option": "選択肢1", "pros": ["長所1"], "cons": ["短所1"], "score": 85}}
  ],
  "ranking": ["選択肢2", "選択肢1"],
  "best_option": "選択肢2",
  "reasoning": "最適な選択肢を選んだ理由の詳細な説明"
}}

詳細レベル: {level}
{date}"#,
        wording = detail.evaluation_wording(),
        points = detail.evaluation_points(),
        level = detail.as_str(),
        date = current_date_line(),
    )
}

pub struct ReasoningEngine {
    generator: Arc<dyn Generator>,
    params: SamplingParams,
}

impl ReasoningEngine {
    pub fn new(generator: Arc<dyn Generator>, params: SamplingParams) -> Self {
        info!("Reasoning engine initialized");
        Self { generator, params }
    }

    async fn ask(&self, instruction: &str, history: &[Message], user_text: &str) -> GatewayResult<String> {
        let prompt = render_instruction_prompt(instruction, history, user_text);
        self.generator
            .generate(&prompt, &self.params)
            .await
            .map_err(GatewayError::Generation)
    }

    pub async fn step_by_step(
        &self,
        question: &str,
        context: Option<&str>,
        detail: DetailLevel,
        history: &[Message],
    ) -> GatewayResult<StepByStepResult> {
        if question.trim().is_empty() {
            return Err(GatewayError::validation("question must not be empty"));
        }
        let mut user_text = match context.filter(|c| !c.trim().is_empty()) {
            Some(_) => format!("問題: {}", question),
            None => question.to_string(),
        };
        push_context(&mut user_text, context);

        let raw = self.ask(&step_by_step_instruction(detail), history, &user_text).await?;
        Ok(parse_step_by_step(&raw))
    }

    pub async fn evaluate_statement(
        &self,
        statement: &str,
        context: Option<&str>,
        detail: DetailLevel,
        history: &[Message],
    ) -> GatewayResult<StatementEvaluation> {
        if statement.trim().is_empty() {
            return Err(GatewayError::validation("statement must not be empty"));
        }
        let mut user_text = format!("評価する文: {}", statement);
        push_context(&mut user_text, context);

        let raw = self.ask(&evaluation_instruction(detail), history, &user_text).await?;
        Ok(parse_evaluation(&raw))
    }

    pub async fn compare_options(
        &self,
        question: &str,
        options: &[String],
        criteria: &[String],
        context: Option<&str>,
        detail: DetailLevel,
        history: &[Message],
    ) -> GatewayResult<OptionComparison> {
        if question.trim().is_empty() {
            return Err(GatewayError::validation("question must not be empty"));
        }
        if options.len() < 2 {
            return Err(GatewayError::validation("at least two options are required for comparison"));
        }

        let options_text: Vec<String> = options.iter().enumerate().map(|(i, o)| format!("{}. {}", i + 1, o)).collect();
        let mut user_text = format!("質問: {}\n\n選択肢:\n{}", question, options_text.join("\n"));
        if !criteria.is_empty() {
            let criteria_text: Vec<String> = criteria.iter().map(|c| format!("- {}", c)).collect();
            user_text.push_str(&format!("\n\n評価基準:\n{}", criteria_text.join("\n")));
        }
        push_context(&mut user_text, context);

        let raw = self.ask(&comparison_instruction(detail), history, &user_text).await?;
        Ok(parse_comparison(&raw, options))
    }

    pub async fn run(&self, task: &ReasoningTask, history: &[Message]) -> GatewayResult<ReasoningOutcome> {
        debug!("Running {} reasoning at {} detail", task.kind(), task.detail().as_str());
        match task {
            ReasoningTask::StepByStep { question, context, detail } => self
                .step_by_step(question, context.as_deref(), *detail, history)
                .await
                .map(ReasoningOutcome::StepByStep),
            ReasoningTask::Evaluate { statement, context, detail } => self
                .evaluate_statement(statement, context.as_deref(), *detail, history)
                .await
                .map(ReasoningOutcome::EvaluateStatement),
            ReasoningTask::Compare { question, options, criteria, context, detail } => self
                .compare_options(question, options, criteria, context.as_deref(), *detail, history)
                .await
                .map(ReasoningOutcome::CompareOptions),
        }
    }

    /// Execute a detected task and render it for the chat transcript.
    pub async fn run_detected(&self, task: &ReasoningTask, history: &[Message]) -> GatewayResult<String> {
        let outcome = self.run(task, history).await?;
        Ok(format_reasoning_result(&outcome))
    }
}

fn parse_step_by_step(raw: &str) -> StepByStepResult {
    match extract_object_with_repair(raw) {
        Ok(obj) => {
            if !obj.contains_key("steps") || !obj.contains_key("answer") {
                warn!("Step-by-step result is missing fields");
            }
            let quality = string_field(&obj, "reasoning_quality")
                .filter(|q| matches!(q.as_str(), "low" | "medium" | "high"))
                .unwrap_or_else(|| "medium".to_string());
            StepByStepResult {
                steps: string_list(obj.get("steps")),
                answer: string_field(&obj, "answer").unwrap_or_else(|| "回答が生成できませんでした".to_string()),
                confidence: normalize_confidence(obj.get("confidence")),
                reasoning_quality: quality,
            }
        }
        Err(ExtractError::NoObject) => {
            warn!("No JSON object in step-by-step output");
            StepByStepResult {
                steps: vec!["ステップ1: 問題分析".to_string(), "ステップ2: 回答導出".to_string()],
                answer: raw.trim().to_string(),
                confidence: FALLBACK_CONFIDENCE,
                reasoning_quality: "medium".to_string(),
            }
        }
        Err(ExtractError::Malformed(e)) => {
            warn!("Step-by-step output unparsable after repair: {}", e);
            StepByStepResult {
                steps: vec!["ステップ1: 問題分析（JSONパース失敗）".to_string()],
                answer: format!(
                    "推論結果の処理中にエラーが発生しました。モデルの出力を直接表示します:\n\n{}",
                    raw_excerpt(raw)
                ),
                confidence: FALLBACK_CONFIDENCE,
                reasoning_quality: "medium".to_string(),
            }
        }
    }
}

fn parse_evaluation(raw: &str) -> StatementEvaluation {
    match extract_object_with_repair(raw) {
        Ok(obj) => StatementEvaluation {
            is_true: obj.get("is_true").and_then(Value::as_bool),
            confidence: normalize_confidence(obj.get("confidence")),
            evidence: string_list(obj.get("evidence")),
            uncertainties: string_list(obj.get("uncertainties")),
            conclusion: string_field(&obj, "conclusion").unwrap_or_else(|| "評価結果がありません".to_string()),
        },
        Err(err) => {
            warn!("Statement evaluation output unusable: {}", err);
            let (evidence, conclusion) = match err {
                ExtractError::NoObject => ("評価結果をJSONとして解析できませんでした", raw.trim().to_string()),
                ExtractError::Malformed(_) => ("JSONパース失敗", raw_excerpt(raw)),
            };
            StatementEvaluation {
                is_true: None,
                confidence: FALLBACK_CONFIDENCE,
                evidence: vec![evidence.to_string()],
                uncertainties: vec!["解析エラー".to_string()],
                conclusion,
            }
        }
    }
}

fn parse_comparison(raw: &str, options: &[String]) -> OptionComparison {
    match extract_object_with_repair(raw) {
        Ok(obj) => {
            let evaluations = match obj.get("evaluations") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|item| OptionEvaluation {
                        option: string_field(item, "option").unwrap_or_default(),
                        pros: string_list(item.get("pros")),
                        cons: string_list(item.get("cons")),
                        score: normalize_confidence(item.get("score")),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            OptionComparison {
                evaluations,
                ranking: string_list(obj.get("ranking")),
                best_option: string_field(&obj, "best_option").filter(|s| !s.is_empty()),
                reasoning: string_field(&obj, "reasoning").unwrap_or_default(),
            }
        }
        Err(err) => {
            warn!("Option comparison output unusable: {}", err);
            let (note, reasoning) = match err {
                ExtractError::NoObject => ("十分な情報がありません", raw.trim().to_string()),
                ExtractError::Malformed(_) => ("JSONパース失敗", raw_excerpt(raw)),
            };
            OptionComparison {
                evaluations: options
                    .iter()
                    .map(|option| OptionEvaluation {
                        option: option.clone(),
                        pros: vec![note.to_string()],
                        cons: vec![note.to_string()],
                        score: FALLBACK_CONFIDENCE,
                    })
                    .collect(),
                ranking: options.to_vec(),
                best_option: options.first().cloned(),
                reasoning,
            }
        }
    }
}
