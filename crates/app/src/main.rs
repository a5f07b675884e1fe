use anyhow::{bail, Context};
use chrono::Utc;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use textbook_tutor_core::{
    answer_with_textbook, extract_pages, exercise_context, locate_context, page_list,
    parse_textbook_catalog, preprocess_catalog, preprocess_folder, AccessPolicy, CachePolicy,
    GeminiClient, GeminiConfig, Grounding, LopdfExtractor, PreprocessReport, PromptKind,
    PromptOptions, Recipient, RetrievalOptions, Retriever, TelegramClient, TextbookStore,
    TutorConfig, TutorService,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "textbook-tutor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Folder holding `<textbook_id>_index.json` files.
    #[arg(long, env = "TEXTBOOK_INDEX_DIR", default_value = "textbook_index", global = true)]
    index_dir: PathBuf,

    /// Re-read an index when its file changes on disk.
    #[arg(
        long,
        env = "TEXTBOOK_REVALIDATE",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    revalidate: bool,

    /// Known textbooks as `id=Display Name` pairs.
    #[arg(
        long,
        env = "TEXTBOOKS",
        default_value = "economics9=Economics G9,history9=History G9",
        global = true
    )]
    textbooks: String,

    /// Gemini API key; the first of a comma separated list is used.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true, global = true)]
    google_api_key: Option<String>,

    /// Gemini model name.
    #[arg(long, env = "GEMINI_MODEL", default_value = textbook_tutor_core::clients::gemini::DEFAULT_MODEL, global = true)]
    gemini_model: String,

    /// Audience the prompts are written for.
    #[arg(long, env = "TUTOR_AUDIENCE", default_value = "a Grade 9 student", global = true)]
    audience: String,
}

#[derive(Subcommand)]
enum Command {
    /// Extract textbook PDFs into per-page JSON indices.
    Preprocess {
        /// Folder scanned recursively for PDFs when no --textbook is given.
        #[arg(long, env = "TEXTBOOK_PDF_DIR", default_value = "api")]
        pdf_dir: PathBuf,
        /// Explicit `id=path/to/file.pdf` entries.
        #[arg(long = "textbook")]
        entries: Vec<String>,
    },
    /// Print the pages of a textbook that mention a concept.
    Pages {
        #[arg(long)]
        textbook: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "5")]
        max_results: usize,
        /// Print the assembled page text as well.
        #[arg(long, default_value_t = false)]
        show_context: bool,
    },
    /// Print the text window around an exercise heading.
    Exercise {
        #[arg(long)]
        textbook: String,
        #[arg(long)]
        query: String,
    },
    /// Dump the raw page text of a single PDF.
    Extract {
        #[arg(long)]
        pdf: PathBuf,
        /// Maximum number of pages to print.
        #[arg(long, default_value = "2")]
        max_pages: usize,
    },
    /// Ask Gemini a tutoring question grounded in a textbook.
    Ask {
        #[arg(long, value_enum)]
        kind: AskKind,
        #[arg(long)]
        textbook: String,
        #[arg(long)]
        query: String,
        /// Only print the prompt that would be sent.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run the Telegram bot with long polling.
    Bot {
        #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
        bot_token: String,
        #[arg(long, env = "ADMIN_ID")]
        admin_id: Option<i64>,
        /// Channel id or `@name` that approved posts are forwarded to.
        #[arg(long, env = "CHANNEL_ID")]
        channel_id: Option<String>,
        /// Usernames or ids allowed to use the bot.
        #[arg(long, env = "ALLOWED_USERS", default_value = "")]
        allowed_users: String,
        /// Accepts true/false, 1/0, yes/no and on/off from the environment.
        #[arg(long, env = "AUTH_ENABLE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
        auth_enable: bool,
        /// Mirror traffic to the admin as log messages.
        #[arg(long, env = "IS_DEBUG_MODE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
        debug_mode: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AskKind {
    Explain,
    Note,
    Questions,
    Answer,
}

impl From<AskKind> for PromptKind {
    fn from(kind: AskKind) -> Self {
        match kind {
            AskKind::Explain => PromptKind::Explain,
            AskKind::Note => PromptKind::Note,
            AskKind::Questions => PromptKind::Questions,
            AskKind::Answer => PromptKind::AnswerExercise,
        }
    }
}

impl Cli {
    fn retriever(&self) -> Retriever {
        let policy = if self.revalidate {
            CachePolicy::RevalidateOnChange
        } else {
            CachePolicy::ProcessLifetime
        };
        let options = RetrievalOptions {
            cache_policy: policy,
            ..RetrievalOptions::default()
        };
        let store = TextbookStore::with_policy(&self.index_dir, policy);
        Retriever::new(Arc::new(store), options)
    }

    fn prompt_options(&self) -> PromptOptions {
        PromptOptions {
            audience: self.audience.clone(),
        }
    }

    fn gemini(&self) -> anyhow::Result<GeminiClient> {
        let api_key = self
            .google_api_key
            .as_deref()
            .and_then(GeminiConfig::first_key)
            .context("GOOGLE_API_KEY is not set")?;
        let config = GeminiConfig {
            model: self.gemini_model.clone(),
            ..GeminiConfig::new(api_key)
        };
        Ok(GeminiClient::new(config)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index_dir = %cli.index_dir.display(),
        "textbook-tutor boot"
    );

    match &cli.command {
        Command::Preprocess { pdf_dir, entries } => {
            let report = if entries.is_empty() {
                preprocess_folder(pdf_dir, &cli.index_dir)?
            } else {
                let catalog = entries
                    .iter()
                    .map(|entry| parse_catalog_entry(entry))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                preprocess_catalog(&LopdfExtractor, &catalog, &cli.index_dir)
            };
            print_report(&report);
            if report.built.is_empty() {
                bail!("no textbook could be preprocessed");
            }
        }
        Command::Pages {
            textbook,
            query,
            max_results,
            show_context,
        } => {
            let retriever = cli.retriever();
            let pages = retriever.find_pages(textbook, query, *max_results)?;
            if pages.is_empty() {
                println!("no pages of '{textbook}' mention '{query}'");
                return Ok(());
            }

            println!("pages: {}", page_list(&pages));
            if *show_context {
                println!("{}", retriever.assemble(textbook, &pages));
            }
        }
        Command::Exercise { textbook, query } => {
            let retriever = cli.retriever();
            let index = retriever
                .store()
                .load(textbook)
                .with_context(|| format!("textbook '{textbook}' is not indexed"))?;
            let context = exercise_context(&index.full_text(), query, retriever.options())?;
            match context.origin {
                Some(origin) => println!("found via {origin:?}:\n{}", context.text),
                None => println!("{}", context.text),
            }
        }
        Command::Extract { pdf, max_pages } => {
            let pages = extract_pages(pdf)?;
            for page in pages.iter().take(*max_pages) {
                if !page.text.trim().is_empty() {
                    println!("[page {}]\n{}", page.page_number, page.text);
                }
            }
            if pages.len() > *max_pages {
                println!("... output truncated to first {max_pages} page(s)");
            }
        }
        Command::Ask {
            kind,
            textbook,
            query,
            dry_run,
        } => {
            let retriever = cli.retriever();
            let kind = PromptKind::from(*kind);

            if *dry_run {
                let (context, grounding) = locate_context(&retriever, kind, query, textbook)?;
                let request = textbook_tutor_core::PromptRequest {
                    kind,
                    subject: query,
                    textbook_id: textbook,
                    context: &context,
                    grounding,
                };
                println!("{}", textbook_tutor_core::build_prompt(&request, &cli.prompt_options()));
                if request.grounding == Grounding::None {
                    warn!(textbook = %textbook, "no textbook excerpt matched");
                }
                return Ok(());
            }

            let gemini = cli.gemini()?;
            let reply = answer_with_textbook(
                &retriever,
                &gemini,
                &cli.prompt_options(),
                kind,
                query,
                textbook,
            )
            .await;
            println!("{reply}");
        }
        Command::Bot {
            bot_token,
            admin_id,
            channel_id,
            allowed_users,
            auth_enable,
            debug_mode,
        } => {
            let access = AccessPolicy::new(*auth_enable, allowed_users, *admin_id);
            let channel = channel_id
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .and_then(|value| value.parse::<Recipient>().ok());
            if channel.is_some() && admin_id.is_none() {
                warn!("CHANNEL_ID is set without ADMIN_ID; no post will ever be approved");
            }

            let config = TutorConfig {
                textbooks: parse_textbook_catalog(&cli.textbooks),
                channel,
                debug_mode: *debug_mode,
                prompt: cli.prompt_options(),
                ..TutorConfig::default()
            };
            let tutor = TutorService::new(
                cli.retriever(),
                cli.gemini()?,
                TelegramClient::new(bot_token),
                access,
                config,
            );
            run_bot(tutor).await?;
        }
    }

    Ok(())
}

async fn run_bot(mut tutor: TutorService<GeminiClient, TelegramClient>) -> anyhow::Result<()> {
    info!("bot polling started");
    let mut offset = None;

    loop {
        let polled = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            polled = tutor.messenger().get_updates(offset, POLL_TIMEOUT_SECS) => polled,
        };

        let updates = match polled {
            Ok(updates) => updates,
            Err(error) => {
                warn!(%error, "polling failed, retrying");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);
            if let Err(error) = tutor.handle_update(&update).await {
                warn!(update_id = update.update_id, %error, "update handling failed");
            }
        }
    }

    Ok(())
}

fn parse_catalog_entry(entry: &str) -> anyhow::Result<(String, PathBuf)> {
    let Some((textbook_id, path)) = entry.split_once('=') else {
        bail!("expected id=path, got '{entry}'");
    };
    let textbook_id = textbook_id.trim();
    textbook_tutor_core::validate_textbook_id(textbook_id)?;
    Ok((textbook_id.to_string(), PathBuf::from(path.trim())))
}

fn print_report(report: &PreprocessReport) {
    for built in &report.built {
        println!(
            "{} -> {} ({} pages)",
            built.textbook_id,
            built.index_file.display(),
            built.pages
        );
    }
    for skipped in &report.skipped {
        warn!(
            textbook_id = %skipped.textbook_id,
            path = %skipped.path.display(),
            reason = %skipped.reason,
            "skipped pdf"
        );
    }
    println!(
        "{} textbook(s) preprocessed, {} skipped at {}",
        report.built.len(),
        report.skipped.len(),
        Utc::now().to_rfc3339()
    );
}
