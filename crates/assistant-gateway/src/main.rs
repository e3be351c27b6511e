// assistant-gateway/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use anyhow::Context;
    use assistant_gateway::capabilities::{
        BraveSearchClient, GitHubClient, Generator, LlamaServerGenerator, LocalFileStore, OllamaGenerator,
    };
    use assistant_gateway::intent::{Detection, IntentDetector, ReasoningIntentDetector};
    use assistant_gateway::reasoning::format_reasoning_result;
    use assistant_gateway::{
        telemetry, Config, DetailLevel, GeneratorBackend, MemoryDatabase, Message, ReasoningEngine, ReasoningTask,
        StreamEvent, TurnOrchestrator, TurnOutput, TurnRequest,
    };
    use clap::{Parser, Subcommand};
    use futures::StreamExt;
    use std::io::Write;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[derive(Parser)]
    #[command(name = "assistant-gateway", about = "Conversational assistant gateway")]
    struct Cli {
        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Interactive chat, one turn per line of stdin
        Chat {
            #[arg(long)]
            session: Option<String>,
            #[arg(long)]
            stream: bool,
        },
        #[command(subcommand)]
        Sessions(SessionCommand),
        #[command(subcommand)]
        Memories(MemoryCommand),
        #[command(subcommand)]
        Settings(SettingsCommand),
        #[command(subcommand)]
        Training(TrainingCommand),
        #[command(subcommand)]
        Reason(ReasonCommand),
    }

    #[derive(Subcommand)]
    enum SessionCommand {
        List {
            #[arg(long, default_value_t = 20)]
            limit: usize,
            #[arg(long, default_value_t = 0)]
            offset: usize,
        },
        Show {
            id: String,
            #[arg(long)]
            limit: Option<usize>,
        },
        Delete { id: String },
        /// Remove a session's messages but keep the session
        Clear { id: String },
    }

    #[derive(Subcommand)]
    enum MemoryCommand {
        List,
        Get { key: String },
        Set { key: String, value: String },
        Delete { key: String },
        Clear,
    }

    #[derive(Subcommand)]
    enum SettingsCommand {
        List,
        Get { key: String },
        Set {
            key: String,
            value: String,
            #[arg(long)]
            description: Option<String>,
        },
    }

    #[derive(Subcommand)]
    enum TrainingCommand {
        Export {
            session: String,
            #[arg(long)]
            quality: Option<u8>,
        },
        List {
            #[arg(long, default_value_t = 20)]
            limit: usize,
            #[arg(long, default_value_t = 0)]
            offset: usize,
            #[arg(long)]
            min_quality: Option<u8>,
        },
        MarkUsed { id: i64 },
    }

    #[derive(Subcommand)]
    enum ReasonCommand {
        /// Detect the kind of reasoning a free-form request asks for, then run it
        Auto { text: String },
        Step {
            question: String,
            #[arg(long)]
            context: Option<String>,
            #[arg(long, default_value = "medium")]
            detail: String,
        },
        Evaluate {
            statement: String,
            #[arg(long)]
            context: Option<String>,
            #[arg(long, default_value = "medium")]
            detail: String,
        },
        Compare {
            question: String,
            #[arg(long = "option", required = true)]
            options: Vec<String>,
            #[arg(long = "criterion")]
            criteria: Vec<String>,
            #[arg(long)]
            context: Option<String>,
            #[arg(long, default_value = "medium")]
            detail: String,
        },
    }

    fn build_generator(config: &Config) -> Arc<dyn Generator> {
        match config.generator_backend {
            GeneratorBackend::Ollama => Arc::new(OllamaGenerator::new(
                config.ollama_base_url.clone(),
                config.ollama_model.clone(),
                config.generate_timeout(),
            )),
            GeneratorBackend::LlamaServer => {
                Arc::new(LlamaServerGenerator::new(config.llama_server_url.clone(), config.generate_timeout()))
            }
        }
    }

    fn build_orchestrator(config: &Config, database: Arc<MemoryDatabase>) -> TurnOrchestrator {
        let generator = build_generator(config);
        let http_timeout = std::time::Duration::from_secs(30);
        TurnOrchestrator::new(
            database,
            generator,
            Arc::new(LocalFileStore::new(config.files_root.clone())),
            Arc::new(BraveSearchClient::new(
                config.brave_search_api_key.clone(),
                config.brave_search_api_url.clone(),
                http_timeout,
            )),
            Arc::new(GitHubClient::new(config.github_token.clone(), config.github_api_url.clone(), http_timeout)),
        )
        .with_defaults(config.generation_defaults())
        .with_search_result_count(config.search_result_count)
    }

    async fn chat(orchestrator: TurnOrchestrator, mut session: Option<String>, stream: bool) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = std::io::stdout();
        print!("> ");
        stdout.flush()?;

        while let Some(line) = lines.next_line().await? {
            let text = line.trim();
            if text.is_empty() {
                print!("> ");
                stdout.flush()?;
                continue;
            }
            if text == "/quit" || text == "/exit" {
                break;
            }

            let mut request = TurnRequest::new(vec![Message::user(text)]);
            request.session_id = session.clone();
            request.stream = stream;

            match orchestrator.process_turn(request).await {
                Ok(TurnOutput::Complete(response)) => {
                    println!("{}\n", response.content);
                    session = Some(response.session_id);
                }
                Ok(TurnOutput::Stream { session_id, mut events }) => {
                    while let Some(event) = events.next().await {
                        match event {
                            StreamEvent::Delta(chunk) => {
                                print!("{}", chunk);
                                stdout.flush()?;
                            }
                            StreamEvent::Error(message) => eprintln!("\n{}", message),
                            StreamEvent::Done => println!("\n"),
                        }
                    }
                    session = Some(session_id);
                }
                Err(e) => eprintln!("error: {}", e),
            }
            print!("> ");
            stdout.flush()?;
        }
        if let Some(id) = session {
            eprintln!("session: {}", id);
        }
        Ok(())
    }

    async fn reason(config: &Config, command: ReasonCommand) -> anyhow::Result<()> {
        let generator = build_generator(config);
        let engine = ReasoningEngine::new(Arc::clone(&generator), config.generation_defaults());
        let task = match command {
            ReasonCommand::Auto { text } => {
                match ReasoningIntentDetector::new(generator).detect(&text).await? {
                    Detection::Match(task) => println!("{}", engine.run_detected(&task, &[]).await?),
                    Detection::NoMatch => println!("推論の意図は検出されませんでした。"),
                }
                return Ok(());
            }
            ReasonCommand::Step { question, context, detail } => ReasoningTask::StepByStep {
                question,
                context,
                detail: DetailLevel::parse_or_default(&detail),
            },
            ReasonCommand::Evaluate { statement, context, detail } => ReasoningTask::Evaluate {
                statement,
                context,
                detail: DetailLevel::parse_or_default(&detail),
            },
            ReasonCommand::Compare { question, options, criteria, context, detail } => ReasoningTask::Compare {
                question,
                options,
                criteria,
                context,
                detail: DetailLevel::parse_or_default(&detail),
            },
        };
        let outcome = engine.run(&task, &[]).await?;
        println!("{}", format_reasoning_result(&outcome));
        Ok(())
    }

    pub async fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        telemetry::init_tracing();
        let config = Config::from_env()?;
        let database = Arc::new(
            MemoryDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database at {}", config.database_path.display()))?,
        );

        match cli.command {
            Command::Chat { session, stream } => {
                chat(build_orchestrator(&config, Arc::clone(&database)), session, stream).await?;
            }
            Command::Sessions(command) => match command {
                SessionCommand::List { limit, offset } => {
                    for session in database.sessions.list(limit, offset)? {
                        let count = database.sessions.message_count(&session.id)?;
                        println!("{}\t{}\t{}\t{} messages", session.id, session.updated_at.to_rfc3339(), session.title, count);
                    }
                }
                SessionCommand::Show { id, limit } => {
                    let session = database
                        .sessions
                        .get(&id)?
                        .ok_or_else(|| anyhow::anyhow!("Session {} not found", id))?;
                    println!("# {} ({})", session.title, session.id);
                    for message in database.sessions.get_messages(&id, limit)? {
                        println!("[{}] {}: {}", message.created_at.to_rfc3339(), message.role, message.content);
                    }
                }
                SessionCommand::Delete { id } => {
                    let deleted = database.sessions.delete(&id)?;
                    println!("{}", if deleted { "deleted" } else { "not found" });
                }
                SessionCommand::Clear { id } => {
                    println!("{} messages deleted", database.sessions.delete_messages(&id)?);
                }
            },
            Command::Memories(command) => match command {
                MemoryCommand::List => {
                    for memory in database.memories.list_all()? {
                        println!("{}: {}", memory.key, memory.value);
                    }
                }
                MemoryCommand::Get { key } => match database.memories.get(&key)? {
                    Some(memory) => println!("{}", memory.value),
                    None => println!("not found"),
                },
                MemoryCommand::Set { key, value } => {
                    let id = database.memories.store(&key, &value, None)?;
                    println!("stored #{}", id);
                }
                MemoryCommand::Delete { key } => {
                    let deleted = database.memories.delete(&key)?;
                    println!("{}", if deleted { "deleted" } else { "not found" });
                }
                MemoryCommand::Clear => println!("{} memories deleted", database.memories.delete_all()?),
            },
            Command::Settings(command) => match command {
                SettingsCommand::List => {
                    for (key, value) in database.settings.list_all()? {
                        println!("{} = {}", key, value);
                    }
                }
                SettingsCommand::Get { key } => match database.settings.get(&key)? {
                    Some(value) => println!("{}", value),
                    None => println!("not set"),
                },
                SettingsCommand::Set { key, value, description } => {
                    database.settings.set(&key, &value, description.as_deref())?;
                    println!("{} = {}", key, value);
                }
            },
            Command::Training(command) => match command {
                TrainingCommand::Export { session, quality } => {
                    let written = database.training.export_session(&session, quality)?;
                    println!("{} training records written", written);
                }
                TrainingCommand::List { limit, offset, min_quality } => {
                    for record in database.training.list(limit, offset, min_quality)? {
                        let quality = record.quality_score.map(|q| q.to_string()).unwrap_or_else(|| "-".into());
                        println!("#{}\tq={}\tused={}\t{}", record.id, quality, record.used, record.prompt);
                    }
                }
                TrainingCommand::MarkUsed { id } => {
                    let updated = database.training.mark_used(id)?;
                    println!("{}", if updated { "marked" } else { "not found" });
                }
            },
            Command::Reason(command) => reason(&config, command).await?,
        }
        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
