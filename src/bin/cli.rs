//! OpenQuery CLI
//!
//! Command-line interface for asking questions, ingesting schemas and
//! managing the database.

use clap::{Parser, Subcommand};
use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Input, MultiSelect};
use openquery::agent::{Answer, AnswerSource, AskOutcome, Orchestrator, Selection};
use openquery::config::Config;
use openquery::database::{init_pool_for_migrations, migrations};
use openquery::memory::SimilarityMatch;
use openquery::{telemetry, App, Error, Result, SchemaSource, VERSION};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "openquery",
    author = "OpenQuery Contributors",
    version = VERSION,
    about = "OpenQuery - Conversational text-to-SQL with memory",
    long_about = None
)]
struct Cli {
    /// Config file (TOML or JSON5); defaults to ~/.config/openquery/config.toml
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat mode (default)
    Chat,

    /// Ask a single question
    Ask {
        /// The question
        question: String,
        /// Continue an existing session
        #[arg(long)]
        session: Option<String>,
        /// Skip the cache and generate a new query
        #[arg(long, conflicts_with = "select")]
        generate_new: bool,
        /// Reuse these cached entries; the first becomes the active query
        #[arg(long, num_args = 1..)]
        select: Vec<Uuid>,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Index schema fields for retrieval
    IngestSchema {
        /// Read the catalog of the configured database
        #[arg(long, conflicts_with = "file")]
        from_db: bool,
        /// Read a JSON array of schema fields
        #[arg(long)]
        file: Option<PathBuf>,
        /// Describe undocumented tables and columns from sampled rows
        #[arg(long, requires = "from_db")]
        describe: bool,
    },

    /// Run database migrations
    Migrate,

    /// Check configuration, storage and corpus
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    telemetry::init_logging(&config.log);

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => interactive_chat(config).await,
        Commands::Ask {
            question,
            session,
            generate_new,
            select,
            json,
        } => ask_once(config, &question, session, generate_new, select, json).await,
        Commands::IngestSchema {
            from_db,
            file,
            describe,
        } => ingest_schema(config, from_db, file, describe).await,
        Commands::Migrate => run_migrations(config).await,
        Commands::Status => check_status(config).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from_path(path)?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Config::load(),
    }
}

// ============================================================================
// Display helpers
// ============================================================================

/// Get the dialoguer theme
fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

fn print_banner(title: &str) {
    println!();
    println!("{}", style("╔══════════════════════════════════════════════════╗").cyan());
    println!("{}", style(format!("║ {:^48} ║", title)).cyan());
    println!("{}", style("╚══════════════════════════════════════════════════╝").cyan());
    println!();
}

fn print_help() {
    println!("   {}", style("Commands:").dim());
    println!("   {}  - Exit chat", style("/quit").yellow());
    println!("   {} - Forget this conversation", style("/clear").yellow());
    println!("   {}  - Show this help", style("/help").yellow());
    println!();
}

fn print_answer(answer: &Answer) {
    let origin = match &answer.source {
        AnswerSource::Generated => style("generated".to_string()).green(),
        AnswerSource::Cached { entry_ids } => {
            style(format!("reused {} cached", entry_ids.len())).blue()
        }
    };
    println!();
    println!("{} [turn {}, {}]", style("SQL").cyan().bold(), answer.turn_id, origin);
    println!("{}", answer.answer_text);
    println!();
}

fn candidate_label(candidate: &SimilarityMatch) -> String {
    let first_line = candidate.answer_text.lines().next().unwrap_or_default();
    format!(
        "{:.2}  {}  {}",
        candidate.score,
        candidate.query_text,
        style(first_line).dim()
    )
}

/// Let the user pick cached answers; picking none means generate a new one
fn choose_candidates(candidates: &[SimilarityMatch]) -> Result<Selection> {
    println!();
    println!(
        "{}",
        style("Similar questions were answered before:").cyan().bold()
    );
    println!(
        "{}",
        style("  Space to toggle, Enter to confirm, nothing selected to generate a new query").dim()
    );

    let items: Vec<String> = candidates.iter().map(candidate_label).collect();
    let picked = MultiSelect::with_theme(&theme())
        .items(&items)
        .interact()
        .map_err(|e| Error::Config(format!("Selection error: {}", e)))?;

    Ok(if picked.is_empty() {
        Selection::GenerateNew
    } else {
        Selection::CacheEntries(picked.into_iter().map(|i| candidates[i].entry_id).collect())
    })
}

// ============================================================================
// Commands
// ============================================================================

/// Interactive chat mode
async fn interactive_chat(config: Config) -> Result<()> {
    let app = App::open(config).await?;
    let orchestrator = app.orchestrator()?;

    print_banner("OpenQuery Interactive Chat");
    println!(
        "   {} Using model: {}",
        style("✓").green(),
        style(&app.config().generation.model).cyan()
    );
    let corpus = app.retriever().corpus_size().await?;
    if corpus == 0 {
        println!(
            "   {} Schema corpus is empty. Run `openquery ingest-schema` first.",
            style("!").yellow()
        );
    }
    println!();
    print_help();

    let mut session_id: Option<String> = None;

    loop {
        let user_input: String = Input::with_theme(&theme())
            .with_prompt(style("You").green().bold().to_string())
            .allow_empty(true)
            .interact_text()
            .map_err(|e| Error::Config(format!("Input error: {}", e)))?;

        let input = user_input.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match input.to_lowercase().as_str() {
                "/quit" | "/exit" | "/q" => {
                    println!("\n{} Goodbye!\n", style("👋").bold());
                    break;
                }
                "/clear" | "/c" => {
                    if let Some(id) = session_id.take() {
                        orchestrator.clear_session(&id).await;
                    }
                    let _ = Term::stdout().clear_screen();
                    println!("\n   {} Conversation cleared.\n", style("✓").green());
                }
                "/help" | "/h" | "/?" => print_help(),
                _ => println!(
                    "   {} Unknown command. Type /help for available commands.",
                    style("?").yellow()
                ),
            }
            continue;
        }

        orchestrator.expire_idle_sessions().await;

        match chat_turn(&orchestrator, session_id.as_deref(), input).await {
            Ok(answer) => {
                print_answer(&answer);
                session_id = Some(answer.session_id);
            }
            Err(e) => println!("\n   {} {}\n", style("✗").red(), e.user_message()),
        }
    }

    Ok(())
}

async fn chat_turn(orchestrator: &Orchestrator, session_id: Option<&str>, question: &str) -> Result<Answer> {
    match orchestrator.ask(session_id, question).await? {
        AskOutcome::Answered(answer) => Ok(answer),
        AskOutcome::Candidates {
            session_id,
            candidates,
        } => {
            let selection = choose_candidates(&candidates)?;
            orchestrator
                .resolve_selection(&session_id, question, selection)
                .await
        }
    }
}

/// Answer one question without prompting
async fn ask_once(
    config: Config,
    question: &str,
    session: Option<String>,
    generate_new: bool,
    select: Vec<Uuid>,
    json: bool,
) -> Result<()> {
    let app = App::open(config).await?;
    let orchestrator = app.orchestrator()?;

    let outcome = if generate_new || !select.is_empty() {
        let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
        let selection = if generate_new {
            Selection::GenerateNew
        } else {
            Selection::CacheEntries(select)
        };
        orchestrator
            .resolve_selection(&session_id, question, selection)
            .await
            .map(AskOutcome::Answered)
    } else {
        orchestrator.ask(session.as_deref(), question).await
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("{} {}", style("✗").red(), e.user_message());
            return Err(e);
        }
    };

    match outcome {
        AskOutcome::Answered(answer) if json => println!("{}", serde_json::to_string_pretty(&answer)?),
        AskOutcome::Answered(answer) => {
            print_answer(&answer);
            println!("Session: {}", style(&answer.session_id).dim());
        }
        AskOutcome::Candidates {
            session_id,
            candidates,
        } if json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session_id": session_id,
                "candidates": candidates,
            }))?
        ),
        AskOutcome::Candidates {
            session_id,
            candidates,
        } => {
            println!("{}", style("Similar questions were answered before:").cyan().bold());
            for candidate in &candidates {
                println!("  {}  {}", style(candidate.entry_id).yellow(), candidate_label(candidate));
            }
            println!();
            println!(
                "Reuse with `--session {} --select <id>...`, or pass `--generate-new`.",
                session_id
            );
        }
    }

    Ok(())
}

/// Index schema fields from the database catalog or a file
async fn ingest_schema(
    mut config: Config,
    from_db: bool,
    file: Option<PathBuf>,
    describe: bool,
) -> Result<()> {
    let source = match (from_db, file) {
        (true, _) => SchemaSource::Database { describe },
        (false, Some(path)) => SchemaSource::File(path),
        (false, None) => {
            return Err(Error::InvalidInput(
                "pass --from-db or --file <path>".to_string(),
            ))
        }
    };

    // Avoid indexing the configured file twice on open
    config.retrieval.schema_file = None;
    let app = App::open(config).await?;
    if !app.is_persistent() {
        println!(
            "{} No database configured; the index lasts only for this process.",
            style("!").yellow()
        );
    }

    println!("Indexing schema fields...");
    let indexed = app.ingest(source).await?;
    let total = app.retriever().corpus_size().await?;

    println!("\n✅ Indexed {} fields ({} in corpus)", indexed, total);
    Ok(())
}

/// Run database migrations
async fn run_migrations(config: Config) -> Result<()> {
    println!("Running database migrations...\n");

    let postgres = config
        .database
        .as_ref()
        .ok_or_else(|| Error::Config("PostgreSQL not configured for migrations".into()))?;
    // Skips the pgvector check; the migrations create the extension
    let pool = init_pool_for_migrations(postgres).await?;

    migrations::run(&pool).await?;

    println!("\n✅ Migrations complete!");
    Ok(())
}

/// Print configuration and storage status
async fn check_status(config: Config) -> Result<()> {
    print_banner("OpenQuery Status");

    println!("   {} Configuration loaded", style("✓").green());
    println!("      └─ Model: {}", style(&config.generation.model).cyan());
    println!("      └─ Embeddings: {}", style(config.embedding.provider).cyan());
    println!(
        "      └─ Cache threshold: {} (top {})",
        style(config.cache.min_score).cyan(),
        config.cache.top_k
    );
    match config.validate_for_generation() {
        Ok(()) => println!("   {} OpenRouter key present", style("✓").green()),
        Err(e) => println!("   {} {}", style("✗").red(), e),
    }

    match App::open(config).await {
        Ok(app) => {
            let storage = if app.is_persistent() {
                "PostgreSQL"
            } else {
                "in memory"
            };
            println!("   {} Storage: {}", style("✓").green(), style(storage).cyan());
            match app.retriever().corpus_size().await {
                Ok(n) => println!("      └─ Schema fields: {}", n),
                Err(e) => println!("      └─ Schema fields: {} {}", style("✗").red(), e),
            }
            match app.cache().entry_count().await {
                Ok(n) => println!("      └─ Cached answers: {}", n),
                Err(e) => println!("      └─ Cached answers: {} {}", style("✗").red(), e),
            }
        }
        Err(e) => println!("   {} Storage: {}", style("✗").red(), e),
    }

    println!();
    Ok(())
}
