//! User-facing text for turns answered without (or before) free generation

use crate::capabilities::{CodeHostOperation, CodeHostOutcome, FileEntry, FileOutcome, FilePayload, SearchOutcome};
use crate::memory_db::UserMemory;
use chrono::{DateTime, Datelike, TimeZone, Weekday};
use serde_json::Value;

// ===== Memory =====

pub const MEMORY_HELP: &str = "記憶機能の使い方:\n\
- 「好きな色は赤を覚えて」: 情報を記憶します（「キー: 値」の形式も使えます）\n\
- 「好きな色を思い出して」「好きな色について教えて」: 記憶した情報を答えます\n\
- 「好きな色を忘れて」: その記憶を削除します\n\
- 「覚えていることを教えて」: 記憶している情報を一覧表示します\n\
- 「すべての記憶を忘れて」: 記憶をすべて削除します";

pub fn memory_stored(key: &str, value: &str) -> String {
    if key == value {
        format!("「{}」を覚えました。", value)
    } else {
        format!("「{}」は「{}」だと覚えました。", key, value)
    }
}

pub fn memory_recalled(key: &str, value: &str) -> String {
    format!("「{}」は「{}」です。", key, value)
}

pub fn memory_not_found(key: &str) -> String {
    format!("「{}」については何も覚えていません。", key)
}

pub fn memory_forgotten(key: &str) -> String {
    format!("「{}」についての記憶を削除しました。", key)
}

pub fn memory_forget_missing(key: &str) -> String {
    format!("「{}」についての記憶は見つかりませんでした。", key)
}

pub fn memory_list(memories: &[UserMemory]) -> String {
    if memories.is_empty() {
        return "まだ何も覚えていません。".to_string();
    }
    let mut text = format!("{}件の情報を覚えています:\n", memories.len());
    for memory in memories {
        text.push_str(&format!("- {}: {}\n", memory.key, memory.value));
    }
    text.trim_end().to_string()
}

pub fn memory_cleared(count: usize) -> String {
    if count == 0 {
        "削除する記憶はありませんでした。".to_string()
    } else {
        format!("{}件の記憶をすべて削除しました。", count)
    }
}

// ===== Files =====

fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / (KB * KB))
    }
}

fn listing_line(entry: &FileEntry) -> String {
    if entry.is_dir {
        format!("📁 {}/", entry.name)
    } else {
        match entry.size {
            Some(size) => format!("📄 {} ({})", entry.name, human_size(size)),
            None => format!("📄 {}", entry.name),
        }
    }
}

pub fn render_file_outcome(outcome: &FileOutcome) -> String {
    if !outcome.success {
        return format!("ファイル操作エラー: {}", outcome.message);
    }
    match &outcome.payload {
        FilePayload::Listing { current_dir, entries } => {
            let dir = if current_dir.is_empty() { "." } else { current_dir.as_str() };
            let mut text = format!("## {} の内容\n\n", dir);
            if entries.is_empty() {
                text.push_str("（空のディレクトリです）");
                return text;
            }
            let lines: Vec<String> = entries.iter().map(listing_line).collect();
            text.push_str(&lines.join("\n"));
            text
        }
        FilePayload::Content { path, content } => {
            format!("## ファイル内容: {}\n\n```\n{}\n```", path, content)
        }
        FilePayload::None => outcome.message.clone(),
    }
}

// ===== Web search =====

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "月曜日",
        Weekday::Tue => "火曜日",
        Weekday::Wed => "水曜日",
        Weekday::Thu => "木曜日",
        Weekday::Fri => "金曜日",
        Weekday::Sat => "土曜日",
        Weekday::Sun => "日曜日",
    }
}

pub fn current_date_answer<Tz: TimeZone>(now: &DateTime<Tz>) -> String {
    format!(
        "今日は{:04}年{:02}月{:02}日（{}）です。",
        now.year(),
        now.month(),
        now.day(),
        weekday_name(now.weekday())
    )
}

pub fn format_search_results(outcome: &SearchOutcome) -> String {
    if !outcome.success {
        return format!("検索エラー: {}", outcome.message.as_deref().unwrap_or("不明なエラー"));
    }
    if outcome.results.is_empty() {
        return format!("「{}」に関する検索結果はありませんでした。", outcome.query);
    }
    let mut text = format!("## 「{}」の検索結果\n\n", outcome.query);
    for (i, hit) in outcome.results.iter().enumerate() {
        let title = if hit.title.is_empty() { "無題" } else { hit.title.as_str() };
        text.push_str(&format!("### {}. {}\n", i + 1, title));
        text.push_str(&format!("URL: {}\n", hit.url));
        text.push_str(&format!("{}\n\n", hit.description));
    }
    text
}

/// Instruction for answering from search results only.
pub fn search_answer_instruction(user_message: &str, formatted_results: &str) -> String {
    format!(
        "あなたは、ユーザーの質問に答えるためにWeb検索結果を活用するアシスタントです。\n\
以下のWeb検索結果だけを根拠にして、ユーザーの質問に回答してください。\n\n\
ユーザーの質問: {}\n\n\
検索結果:\n{}\n\
検索結果の情報を適切に引用しながら、わかりやすく回答してください。\n\
検索結果に含まれない情報は推測で補わず、情報が不足していることを明記してください。",
        user_message, formatted_results
    )
}

// ===== Code host =====

fn text_or<'a>(value: &'a Value, key: &str, fallback: &'a str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or(fallback)
}

pub fn render_code_host_outcome(operation: &CodeHostOperation, outcome: &CodeHostOutcome) -> String {
    if !outcome.success {
        return format!("GitHub操作エラー: {}", outcome.message);
    }
    let data = outcome.data.as_ref().unwrap_or(&Value::Null);

    match operation {
        CodeHostOperation::ListRepos => {
            let mut text = "## GitHubリポジトリ一覧\n\n".to_string();
            for (i, repo) in data.as_array().map(Vec::as_slice).unwrap_or_default().iter().enumerate() {
                let private = repo.get("private").and_then(Value::as_bool).unwrap_or(false);
                text.push_str(&format!("### {}. {}\n", i + 1, text_or(repo, "name", "無名")));
                text.push_str(&format!("URL: {}\n", text_or(repo, "html_url", "")));
                text.push_str(&format!("説明: {}\n", text_or(repo, "description", "説明なし")));
                text.push_str(&format!("可視性: {}\n\n", if private { "プライベート" } else { "パブリック" }));
            }
            text
        }
        CodeHostOperation::SearchRepos { .. } => {
            let mut text = "## GitHubリポジトリ検索結果\n\n".to_string();
            let items = data.get("items").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
            for (i, repo) in items.iter().enumerate() {
                let stars = repo.get("stargazers_count").and_then(Value::as_u64).unwrap_or(0);
                text.push_str(&format!("### {}. {}\n", i + 1, text_or(repo, "full_name", "")));
                text.push_str(&format!("URL: {}\n", text_or(repo, "html_url", "")));
                text.push_str(&format!("説明: {}\n", text_or(repo, "description", "説明なし")));
                text.push_str(&format!("スター数: {}\n\n", stars));
            }
            text
        }
        CodeHostOperation::GetFile { .. } => match data.get("decoded_content").and_then(Value::as_str) {
            Some(content) => format!("## ファイル内容: {}\n\n```\n{}\n```", text_or(data, "path", "不明"), content),
            None => "ファイル内容を取得できませんでした。".to_string(),
        },
        _ => format!("GitHub操作が成功しました: {}", outcome.message),
    }
}

// ===== Failures =====

pub fn capability_failure(capability: &str, err: &anyhow::Error) -> String {
    format!("申し訳ありません。{}の実行中にエラーが発生しました: {}", capability, err)
}

pub fn generation_failure(err: &anyhow::Error) -> String {
    format!("申し訳ありません。応答の生成中にエラーが発生しました: {}", err)
}
