//! End-to-end turns through `TurnOrchestrator` with in-process capability fakes.

use assistant_gateway::capabilities::{
    CodeHostClient, CodeHostOperation, CodeHostOutcome, FileOperation, FileOutcome, FileStore, GenerationParams,
    Generator, SamplingParams, SearchHit, SearchOutcome, TextStream, WebSearch,
};
use assistant_gateway::{
    GatewayError, MemoryDatabase, Message, Role, StreamEvent, TurnOrchestrator, TurnOutput, TurnRequest,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ===== Fakes =====

struct FakeGenerator {
    reply: Result<String, String>,
    chunks: Vec<String>,
    prompts: Mutex<Vec<String>>,
    params: Mutex<Vec<SamplingParams>>,
    pulled: Arc<AtomicUsize>,
}

impl FakeGenerator {
    fn build(reply: Result<String, String>, chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            reply,
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            prompts: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
            pulled: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn replying(reply: &str) -> Arc<Self> {
        Self::build(Ok(reply.to_string()), &[])
    }

    fn streaming(reply: &str, chunks: &[&str]) -> Arc<Self> {
        Self::build(Ok(reply.to_string()), chunks)
    }

    fn failing(message: &str) -> Arc<Self> {
        Self::build(Err(message.to_string()), &[])
    }

    fn record(&self, prompt: &str, params: &SamplingParams) {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.params.lock().unwrap().push(*params);
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn last_params(&self) -> Option<SamplingParams> {
        self.params.lock().unwrap().last().copied()
    }

    /// Stream chunks handed out so far.
    fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<String> {
        self.record(prompt, params);
        self.reply.clone().map_err(|e| anyhow::anyhow!(e))
    }

    async fn generate_stream(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<TextStream> {
        self.record(prompt, params);
        if let Err(e) = &self.reply {
            return Err(anyhow::anyhow!(e.clone()));
        }
        let chunks: Vec<anyhow::Result<String>> = self.chunks.iter().cloned().map(Ok).collect();
        let pulled = Arc::clone(&self.pulled);
        Ok(Box::pin(futures::stream::iter(chunks).inspect(move |_| {
            pulled.fetch_add(1, Ordering::SeqCst);
        })))
    }
}

#[derive(Default)]
struct FakeFileStore {
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl FileStore for FakeFileStore {
    async fn execute(&self, operation: &FileOperation) -> anyhow::Result<FileOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow::anyhow!("disk unavailable"));
        }
        Ok(FileOutcome::ok(format!("{} done", operation.tag())))
    }
}

#[derive(Default)]
struct FakeWebSearch {
    queries: Mutex<Vec<String>>,
}

#[async_trait]
impl WebSearch for FakeWebSearch {
    async fn search(&self, query: &str, _count: u32) -> anyhow::Result<SearchOutcome> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(SearchOutcome::found(query, vec![SearchHit {
            title: "Rust 1.80".into(),
            url: "https://blog.rust-lang.org".into(),
            description: "Rust 1.80 released".into(),
        }]))
    }
}

#[derive(Default)]
struct FakeCodeHost {
    calls: AtomicUsize,
}

#[async_trait]
impl CodeHostClient for FakeCodeHost {
    async fn execute(&self, _operation: &CodeHostOperation) -> anyhow::Result<CodeHostOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CodeHostOutcome {
            success: true,
            message: "操作が成功しました".into(),
            data: Some(json!([{"name": "gateway", "html_url": "https://github.com/me/gateway", "private": false}])),
        })
    }
}

struct Harness {
    db: Arc<MemoryDatabase>,
    generator: Arc<FakeGenerator>,
    files: Arc<FakeFileStore>,
    web: Arc<FakeWebSearch>,
    code_host: Arc<FakeCodeHost>,
    orchestrator: TurnOrchestrator,
}

fn harness_with(generator: Arc<FakeGenerator>, files: FakeFileStore) -> Harness {
    let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
    let files = Arc::new(files);
    let web = Arc::new(FakeWebSearch::default());
    let code_host = Arc::new(FakeCodeHost::default());
    let orchestrator = TurnOrchestrator::new(
        Arc::clone(&db),
        generator.clone(),
        files.clone(),
        web.clone(),
        code_host.clone(),
    );
    Harness { db, generator, files, web, code_host, orchestrator }
}

fn harness(generator: Arc<FakeGenerator>) -> Harness {
    harness_with(generator, FakeFileStore::default())
}

async fn say(h: &Harness, session: &str, text: &str) -> String {
    let request = TurnRequest::new(vec![Message::user(text)]).with_session(session);
    h.orchestrator.process_turn(request).await.unwrap().into_complete().unwrap().content
}

// ===== Capability routing =====

#[tokio::test]
async fn test_date_question_without_memory_makes_no_generator_call() {
    let h = harness(FakeGenerator::replying("unused"));
    h.db.settings.set("memory_enabled", "false", None).unwrap();

    let output = h.orchestrator.process_turn(TurnRequest::new(vec![Message::user("今日の日付")])).await.unwrap();
    let response = output.into_complete().unwrap();

    assert!(response.content.starts_with("今日は"));
    assert!(response.content.ends_with("です。"));
    assert_eq!(response.role, Role::Assistant);
    assert_eq!(h.generator.calls(), 0);
    assert!(h.web.queries.lock().unwrap().is_empty());
    assert!(h.db.sessions.list(10, 0).unwrap().is_empty());
}

#[tokio::test]
async fn test_memory_store_then_retrieve() {
    let h = harness(FakeGenerator::replying("了解です"));

    assert_eq!(say(&h, "m1", "好きな色は赤を覚えて").await, "「好きな色」は「赤」だと覚えました。");
    assert_eq!(h.db.memories.get("好きな色").unwrap().unwrap().value, "赤");
    assert_eq!(say(&h, "m1", "好きな色を思い出して").await, "「好きな色」は「赤」です。");
    assert_eq!(h.generator.calls(), 0);
    assert_eq!(h.db.sessions.message_count("m1").unwrap(), 4);

    // stored facts reach the prompt of later plain turns
    say(&h, "m2", "おすすめの服は？").await;
    assert!(h.generator.last_prompt().contains("- 好きな色: 赤\n"));
}

#[tokio::test]
async fn test_web_search_answers_from_results() {
    let h = harness(FakeGenerator::replying("最新版は1.80です。"));

    let content = say(&h, "w1", "Rustの最新バージョンを検索して").await;

    assert_eq!(content, "最新版は1.80です。");
    assert_eq!(*h.web.queries.lock().unwrap(), vec!["Rustの最新バージョン".to_string()]);
    assert_eq!(h.generator.calls(), 1);
    assert!(h.generator.last_prompt().contains("### 1. Rust 1.80"));
}

#[tokio::test]
async fn test_search_answer_uses_turn_sampling_params() {
    let h = harness(FakeGenerator::replying("最新版は1.80です。"));
    let mut request = TurnRequest::new(vec![Message::user("Rustの最新バージョンを検索して")]).with_session("w2");
    request.params = GenerationParams { max_tokens: Some(128), temperature: Some(0.2), ..Default::default() };

    h.orchestrator.process_turn(request).await.unwrap();

    assert_eq!(h.web.queries.lock().unwrap().len(), 1);
    assert_eq!(
        h.generator.last_params(),
        Some(SamplingParams { max_tokens: 128, temperature: 0.2, ..SamplingParams::default() })
    );
}

#[tokio::test]
async fn test_code_host_listing_skips_web_search() {
    let h = harness(FakeGenerator::replying("unused"));

    let content = say(&h, "g1", "GitHubのリポジトリ一覧を表示して").await;

    assert!(content.starts_with("## GitHubリポジトリ一覧"));
    assert!(content.contains("### 1. gateway"));
    assert_eq!(h.code_host.calls.load(Ordering::SeqCst), 1);
    assert!(h.web.queries.lock().unwrap().is_empty());
    assert_eq!(h.generator.calls(), 0);
}

// ===== Failure handling =====

#[tokio::test]
async fn test_capability_error_is_reported_in_band() {
    let generator = FakeGenerator::replying(
        r#"{"is_file_operation": true, "operation_type": "read_file", "parameters": {"path": "notes.txt"}}"#,
    );
    let h = harness_with(generator, FakeFileStore { fail: true, ..Default::default() });

    let content = say(&h, "f1", "notes.txtを読んで").await;

    assert!(content.starts_with("申し訳ありません。ファイル操作の実行中にエラーが発生しました"));
    assert!(content.contains("disk unavailable"));
    assert_eq!(h.files.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.db.sessions.message_count("f1").unwrap(), 2);
}

#[tokio::test]
async fn test_generator_failure_is_reported_in_band() {
    let h = harness(FakeGenerator::failing("connection refused"));

    let content = say(&h, "e1", "こんにちは").await;

    assert!(content.starts_with("申し訳ありません。応答の生成中にエラーが発生しました"));
    // only the user half is persisted
    let messages = h.db.sessions.get_messages("e1", None).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn test_persistence_failure_still_returns_response() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.db");
    let db = Arc::new(MemoryDatabase::new(&path).unwrap());
    let generator = FakeGenerator::replying("こんにちは！");
    let orchestrator = TurnOrchestrator::new(
        Arc::clone(&db),
        generator.clone(),
        Arc::new(FakeFileStore::default()),
        Arc::new(FakeWebSearch::default()),
        Arc::new(FakeCodeHost::default()),
    );
    // every message insert now fails inside the store
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_messages BEFORE INSERT ON messages
             BEGIN SELECT RAISE(ABORT, 'disk is full'); END;",
        )
        .unwrap();
    assert!(db.sessions.append_message("trigger-check", Role::User, "x", None).is_err());

    let generated = orchestrator
        .process_turn(TurnRequest::new(vec![Message::user("こんにちは")]).with_session("p1"))
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(generated.content, "こんにちは！");

    let remembered = orchestrator
        .process_turn(TurnRequest::new(vec![Message::user("好きな色は赤を覚えて")]).with_session("p1"))
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(remembered.content, "「好きな色」は「赤」だと覚えました。");
    assert_eq!(db.memories.get("好きな色").unwrap().unwrap().value, "赤");

    assert!(db.sessions.get("p1").unwrap().is_some());
    assert_eq!(db.sessions.message_count("p1").unwrap(), 0);
}

#[test]
fn test_validation_rejects_before_side_effects() {
    let h = harness(FakeGenerator::replying("unused"));
    tokio_test::block_on(async {
        let empty = h.orchestrator.process_turn(TurnRequest::new(vec![]).with_session("v1")).await;
        assert!(matches!(empty, Err(GatewayError::Validation(_))));

        let not_user = TurnRequest::new(vec![Message::user("hi"), Message::assistant("hello")]).with_session("v1");
        assert!(h.orchestrator.process_turn(not_user).await.unwrap_err().is_validation());
    });
    assert!(h.db.sessions.get("v1").unwrap().is_none());
    assert_eq!(h.generator.calls(), 0);
}

// ===== Sessions and history =====

#[tokio::test]
async fn test_history_is_replayed_from_the_store() {
    let h = harness(FakeGenerator::replying("了解です"));

    say(&h, "s1", "私の名前は太郎です").await;
    say(&h, "s1", "私の名前は？").await;

    let prompt = h.generator.last_prompt();
    assert!(prompt.contains("ユーザー: 私の名前は太郎です\nアシスタント: 了解です\n"));
    assert_eq!(prompt.matches("ユーザー: 私の名前は？").count(), 1);
    assert!(prompt.ends_with("アシスタント: "));
    assert_eq!(h.db.sessions.message_count("s1").unwrap(), 4);
}

#[tokio::test]
async fn test_streamed_turn_persists_only_the_user_message() {
    let h = harness(FakeGenerator::streaming("雑談です", &["こんにちは", "世界"]));

    let request = TurnRequest::new(vec![Message::user("やあ")]).with_session("st1").streaming();
    let output = h.orchestrator.process_turn(request).await.unwrap();
    assert_eq!(output.session_id(), "st1");

    let TurnOutput::Stream { events, .. } = output else {
        panic!("expected a stream");
    };
    let events: Vec<StreamEvent> = events.collect().await;
    assert_eq!(events, vec![
        StreamEvent::Delta("こんにちは".into()),
        StreamEvent::Delta("世界".into()),
        StreamEvent::Done,
    ]);

    let messages = h.db.sessions.get_messages("st1", None).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "やあ");
}

#[tokio::test]
async fn test_stream_dropped_before_done_keeps_only_the_user_message() {
    let h = harness(FakeGenerator::streaming("雑談です", &["一", "二", "三"]));

    let request = TurnRequest::new(vec![Message::user("数えて")]).with_session("cut").streaming();
    let TurnOutput::Stream { mut events, .. } = h.orchestrator.process_turn(request).await.unwrap() else {
        panic!("expected a stream");
    };
    assert_eq!(events.next().await, Some(StreamEvent::Delta("一".into())));
    drop(events);

    assert_eq!(h.generator.pulled(), 1);
    let messages = h.db.sessions.get_messages("cut", None).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "数えて");
}

#[tokio::test]
async fn test_missing_session_id_is_generated() {
    let h = harness(FakeGenerator::replying("unused"));

    let output = h.orchestrator.process_turn(TurnRequest::new(vec![Message::user("記憶の使い方")])).await.unwrap();
    let session_id = output.session_id().to_string();

    assert!(!session_id.is_empty());
    assert!(h.db.sessions.get(&session_id).unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_turns_share_one_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemoryDatabase::new(&dir.path().join("gateway.db")).unwrap());
    let orchestrator = TurnOrchestrator::new(
        Arc::clone(&db),
        FakeGenerator::replying("unused"),
        Arc::new(FakeFileStore::default()),
        Arc::new(FakeWebSearch::default()),
        Arc::new(FakeCodeHost::default()),
    );

    let first = orchestrator.process_turn(TurnRequest::new(vec![Message::user("犬の名前はポチを覚えて")]).with_session("race"));
    let second = orchestrator.process_turn(TurnRequest::new(vec![Message::user("猫の名前はタマを覚えて")]).with_session("race"));
    let (a, b) = futures::future::join(first, second).await;
    assert!(a.is_ok() && b.is_ok());

    let sessions = db.sessions.list(10, 0).unwrap();
    assert_eq!(sessions.iter().filter(|s| s.id == "race").count(), 1);
    assert_eq!(db.sessions.message_count("race").unwrap(), 4);
}
