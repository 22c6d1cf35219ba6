//! VLM CLI - interactive terminal chat with a local multimodal model

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use vlm_core::backends::Gemma3Loader;
use vlm_core::{EngineConfig, GenerationRequest, VlmService, DONE_SENTINEL, ERROR_MARKER};

mod repl;

use repl::ReplCommand;

/// Chat with a local vision-language model.
///
/// Examples:
///   vlm                                  # interactive session
///   vlm "Summarize PCR in one line"      # single question
///   vlm --image cell.png "What is shown?"
#[derive(Parser)]
#[command(name = "vlm", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Ask a single question and exit
    prompt: Option<String>,

    /// Model id on the Hugging Face hub or a local directory
    #[arg(short, long, env = "VLM_MODEL")]
    model: Option<String>,

    /// Engine configuration file (JSON)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Named system template
    #[arg(short = 't', long = "prompt-template", value_name = "NAME")]
    prompt_template: Option<String>,

    /// Maximum tokens per response
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Image to attach to a single question
    #[arg(long, value_name = "PATH", requires = "prompt")]
    image: Option<PathBuf>,

    /// Audio clip to attach to a single question
    #[arg(long, value_name = "PATH", requires = "prompt")]
    audio: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

struct ChatSession {
    service: VlmService,
    template: Option<String>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
}

impl ChatSession {
    fn request(&self, prompt: String) -> GenerationRequest {
        GenerationRequest {
            prompt,
            prompt_template: self.template.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            ..Default::default()
        }
    }

    /// Stream one reply to stdout. In-band errors go to stderr.
    async fn ask(&self, request: GenerationRequest) -> anyhow::Result<()> {
        let mut tokens = self.service.generate_streaming(request).await?;
        let mut stdout = tokio::io::stdout();

        while let Some(token) = tokens.next().await {
            if token == DONE_SENTINEL {
                break;
            }
            if let Some(message) = token.strip_prefix(ERROR_MARKER) {
                stdout.write_all(b"\n").await?;
                eprintln!("error: {message}");
                continue;
            }
            stdout.write_all(token.as_bytes()).await?;
            stdout.flush().await?;
        }
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn handle(&mut self, command: ReplCommand) -> anyhow::Result<bool> {
        match command {
            ReplCommand::Empty => {}
            ReplCommand::Chat(text) => self.ask(self.request(text)).await?,
            ReplCommand::Image { path, question } => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                self.ask(self.request(question).with_image(bytes)).await?;
            }
            ReplCommand::Audio { path, question } => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                self.ask(self.request(question).with_audio(bytes)).await?;
            }
            ReplCommand::History => {
                let history = self
                    .service
                    .conversation_history(vlm_core::DEFAULT_SESSION)
                    .await;
                println!("{}", serde_json::to_string_pretty(&history)?);
            }
            ReplCommand::Clear => {
                self.service
                    .clear_conversation(vlm_core::DEFAULT_SESSION)
                    .await;
                println!("Conversation cleared.");
            }
            ReplCommand::Prompt(None) => {
                let active = self.template.as_deref().unwrap_or("default");
                for (name, description) in self.service.list_prompts().await {
                    let marker = if name == active { "*" } else { " " };
                    println!("{marker} {name:<28} {description}");
                }
            }
            ReplCommand::Prompt(Some(name)) => {
                if self.service.prompt_info(&name).await.is_some() {
                    println!("Using template '{name}'.");
                    self.template = Some(name);
                } else {
                    eprintln!("Unknown template '{name}'. Type /prompt to list templates.");
                }
            }
            ReplCommand::Help => println!("{}", repl::HELP),
            ReplCommand::Quit => return Ok(false),
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "vlm_core=debug,vlm_cli=debug"
    } else {
        "vlm_core=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(model) = cli.model.clone() {
        config.model_id = model;
    }

    let loader = Arc::new(Gemma3Loader::new(
        config.models_dir.clone(),
        config.use_metal,
    ));
    let model_id = config.model_id.clone();
    let session = ChatSession {
        service: VlmService::new(config, loader),
        template: cli.prompt_template.clone(),
        max_tokens: cli.max_tokens,
        temperature: cli.temperature,
    };

    eprintln!("Loading {model_id}...");
    if !session.service.ensure_ready().await {
        let status = session.service.load_status().await;
        bail!(
            "model failed to load: {}",
            status.last_error.as_deref().unwrap_or("unknown error")
        );
    }

    match cli.prompt.clone() {
        Some(prompt) => run_once(&session, &cli, prompt).await,
        None => run_interactive(session).await,
    }
}

async fn run_once(session: &ChatSession, cli: &Cli, prompt: String) -> anyhow::Result<()> {
    let mut request = session.request(prompt);
    if let Some(path) = &cli.image {
        request.image = Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        );
    }
    if let Some(path) = &cli.audio {
        request.audio = Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        );
    }
    session.ask(request).await?;
    session.service.shutdown().await;
    Ok(())
}

async fn run_interactive(mut session: ChatSession) -> anyhow::Result<()> {
    eprintln!("Ready. Type /help for commands, /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        let command = match repl::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };

        match session.handle(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    session.service.shutdown().await;
    Ok(())
}
