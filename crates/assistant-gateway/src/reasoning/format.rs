//! Markdown rendering of reasoning results

use super::{OptionComparison, ReasoningOutcome, StatementEvaluation, StepByStepResult};

fn confidence_band(confidence: u8) -> &'static str {
    match confidence {
        90..=100 => "非常に高い",
        75..=89 => "高い",
        60..=74 => "中程度",
        40..=59 => "不確か",
        _ => "低い",
    }
}

fn step_by_step(result: &StepByStepResult) -> String {
    let mut out = String::from("## ステップバイステップ推論\n\n");
    for step in &result.steps {
        out.push_str(step);
        out.push_str("\n\n");
    }
    out.push_str(&format!("## 最終回答\n\n{}\n\n", result.answer));
    out.push_str(&format!(
        "**確信度**: {}% ({})\n**推論品質**: {}",
        result.confidence,
        confidence_band(result.confidence),
        result.reasoning_quality
    ));
    out
}

fn evaluation(result: &StatementEvaluation) -> String {
    let verdict = match result.is_true {
        Some(true) => "真",
        Some(false) => "偽",
        None => "不明",
    };
    let mut out = format!("## 文の評価: {} (確信度: {}%)\n\n### 根拠:\n\n", verdict, result.confidence);
    for item in &result.evidence {
        out.push_str(&format!("- {}\n", item));
    }
    if !result.uncertainties.is_empty() {
        out.push_str("\n### 不確実性:\n\n");
        for item in &result.uncertainties {
            out.push_str(&format!("- {}\n", item));
        }
    }
    out.push_str(&format!("\n### 結論:\n\n{}", result.conclusion));
    out
}

fn comparison(result: &OptionComparison) -> String {
    let mut out = String::from("## 選択肢の比較\n\n### 各選択肢の評価:\n\n");
    for evaluation in &result.evaluations {
        out.push_str(&format!("#### {} (スコア: {}/100)\n\n", evaluation.option, evaluation.score));
        if !evaluation.pros.is_empty() {
            out.push_str("長所:\n");
            for pro in &evaluation.pros {
                out.push_str(&format!("- {}\n", pro));
            }
            out.push('\n');
        }
        if !evaluation.cons.is_empty() {
            out.push_str("短所:\n");
            for con in &evaluation.cons {
                out.push_str(&format!("- {}\n", con));
            }
            out.push('\n');
        }
    }

    if !result.ranking.is_empty() {
        out.push_str("### ランキング:\n\n");
        for (i, option) in result.ranking.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, option));
        }
        out.push('\n');
    }
    if let Some(best) = &result.best_option {
        out.push_str(&format!("### 最適な選択肢: {}\n\n", best));
    }
    if !result.reasoning.is_empty() {
        out.push_str(&format!("### 理由:\n\n{}", result.reasoning));
    }
    out
}

pub fn format_reasoning_result(outcome: &ReasoningOutcome) -> String {
    match outcome {
        ReasoningOutcome::StepByStep(result) => step_by_step(result),
        ReasoningOutcome::EvaluateStatement(result) => evaluation(result),
        ReasoningOutcome::CompareOptions(result) => comparison(result),
    }
}
