mod logging;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ovocall_agents::{
    CallRequest, CharacterRef, Counterpart, FriendRequest, InterferenceMessage, Notifier,
    PersonaProfile, Session, SessionSelector, Surface, TurnFailure, TurnOptions, TurnOutcome,
    TurnResult, TurnRuntime, TurnSettings, build_provider, interpret,
};
use ovocall_common::{Error, normalize_id};
use ovocall_config::ConfigLoader;
use ovocall_db::{MemoryRecordStore, RecordStore, SqliteRecordStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ovocall")]
#[command(version)]
#[command(about = "Drive roleplay phone calls and SMS threads against a language model")]
struct Cli {
    /// Configuration directory (defaults to ~/.ovocall)
    #[arg(long, global = true, env = "OVOCALL_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Debug logging for the ovocall crates
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Answer with canned replies instead of calling the provider
    #[arg(long, global = true)]
    test_mode: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interpret raw model output and print the turn result as JSON
    Parse {
        /// Surface profile: call or sms
        #[arg(long, default_value = "call")]
        surface: Surface,

        /// Input file (reads stdin if not provided)
        file: Option<PathBuf>,
    },

    /// Phone call with a character or a stranger; Ctrl-D hangs up
    Call {
        #[arg(long)]
        number: String,

        /// Bound character name. Without it the number is looked up in contacts.
        #[arg(long)]
        character: Option<String>,
    },

    /// SMS thread; an empty line lets the other side write first, Ctrl-D ends
    Sms {
        #[arg(long)]
        number: String,

        #[arg(long)]
        character: Option<String>,

        /// Allow the character to send a friend request
        #[arg(long)]
        allow_friend_request: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let Cli {
        config_dir,
        verbose,
        test_mode,
        command,
    } = Cli::parse();
    logging::init(verbose);

    match command {
        Commands::Parse { surface, file } => cmd_parse(surface, file.as_deref()),
        Commands::Call { number, character } => {
            let runtime = load_runtime(config_dir, test_mode)?;
            cmd_call(&runtime, &number, character).await
        }
        Commands::Sms {
            number,
            character,
            allow_friend_request,
        } => {
            let runtime = load_runtime(config_dir, test_mode)?;
            let options = TurnOptions {
                allow_friend_request,
                ..TurnOptions::default()
            };
            cmd_sms(&runtime, &number, character, options).await
        }
    }
}

fn cmd_parse(surface: Surface, file: Option<&Path>) -> anyhow::Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let result = interpret(&raw, surface);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn load_runtime(config_dir: Option<PathBuf>, test_mode: bool) -> anyhow::Result<TurnRuntime> {
    let loader = match config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("failed to load configuration")?;
    config.turn.test_mode |= test_mode;

    let provider = match build_provider(&config.provider) {
        Ok(provider) => Some(provider),
        Err(e) if config.turn.test_mode => {
            info!("test mode without a provider: {e}");
            None
        }
        Err(e) => return Err(e.into()),
    };

    let store: Arc<dyn RecordStore> = match &config.storage.database_path {
        Some(path) => Arc::new(
            SqliteRecordStore::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Arc::new(MemoryRecordStore::new()),
    };

    Ok(
        TurnRuntime::new(provider, TurnSettings::from_config(&config))
            .with_store(store)
            .with_notifier(Arc::new(ConsoleNotifier)),
    )
}

fn character(name: &str) -> Counterpart {
    let id = normalize_id(name);
    Counterpart::Character(CharacterRef {
        id: if id.is_empty() { name.to_string() } else { id },
        name: name.to_string(),
    })
}

/// Display name of whoever is on the other end of `session`.
fn speaker(session: &Session) -> String {
    let snap = session.snapshot();
    snap.persona
        .map(|p| p.name)
        .or_else(|| snap.counterpart.as_ref().and_then(Counterpart::character).map(|c| c.name.clone()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| snap.phone_number.clone())
}

async fn cmd_call(
    runtime: &TurnRuntime,
    number: &str,
    character_name: Option<String>,
) -> anyhow::Result<()> {
    let session = match character_name {
        Some(name) => runtime.start_call(number, character(&name)),
        None => runtime.start_call_from_contacts(number).await,
    };
    println!("calling {} ... (Ctrl-C aborts a reply, Ctrl-D hangs up)", session.snapshot().phone_number);

    let options = TurnOptions::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let outcome = tokio::select! {
            outcome = runtime.send_call_message(&line, &options) => outcome,
            _ = tokio::signal::ctrl_c() => {
                runtime.abort_call();
                println!("(reply aborted)");
                continue;
            }
        };

        match outcome {
            Ok(TurnOutcome::Completed(TurnResult::Call(turn))) => {
                let name = speaker(&session);
                for sentence in &turn.sentences {
                    println!("{name}: {sentence}");
                }
                if turn.wants_hangup() {
                    println!("({name} hung up)");
                    break;
                }
            }
            Ok(TurnOutcome::Completed(other)) => warn!("unexpected turn shape: {other:?}"),
            Ok(TurnOutcome::Cancelled) => {}
            Ok(TurnOutcome::Failed(_)) => {}
            Err(e) => eprintln!("error: {e}"),
        }
    }

    runtime.end_call();
    Ok(())
}

async fn cmd_sms(
    runtime: &TurnRuntime,
    number: &str,
    character_name: Option<String>,
    options: TurnOptions,
) -> anyhow::Result<()> {
    let counterpart = match character_name {
        Some(name) => character(&name),
        None => match runtime.saved_stranger_persona(&normalize_id(number)).await {
            Some(persona) => Counterpart::SavedStranger { persona },
            None => Counterpart::Stranger,
        },
    };
    let session = runtime.open_sms(number, counterpart, false)?;
    let selector = SessionSelector::Handle(session.clone());
    println!("texting {} ... (empty line waits for them, Ctrl-D ends)", session.key());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let turn = async {
            if line.trim().is_empty() {
                runtime.sms_auto_reply(&selector, &options).await
            } else {
                runtime.send_sms_message(&selector, &line, &options).await
            }
        };
        let outcome = tokio::select! {
            outcome = turn => outcome,
            _ = tokio::signal::ctrl_c() => {
                runtime.abort_sms(&selector);
                println!("(reply aborted)");
                continue;
            }
        };

        match outcome {
            Ok(TurnOutcome::Completed(result)) => {
                let name = speaker(&session);
                for message in result.reply_lines() {
                    println!("[{name}] {message}");
                }
            }
            Ok(_) => {}
            Err(e) => eprintln!("error: {e}"),
        }
    }

    runtime.end_sms(&selector, true);
    Ok(())
}

/// Prints side-channel events between reply lines.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn turn_failed(&self, surface: Surface, failure: &TurnFailure) {
        eprintln!("({surface:?} turn failed: {failure})");
    }

    fn provider_failed(&self, _surface: Surface, error: &Error) {
        warn!("provider failed: {error}");
    }

    fn persona_resolved(&self, _surface: Surface, phone_number: &str, persona: &PersonaProfile) {
        println!("(caller identified: {} {phone_number}, {})", persona.name, persona.profession);
    }

    fn interference_received(&self, sender_number: &str, message: &InterferenceMessage) {
        let from = if message.sender_name.is_empty() {
            sender_number.to_string()
        } else {
            format!("{} {sender_number}", message.sender_name)
        };
        println!("(new SMS from {from}: {})", message.content);
    }

    fn friend_request(&self, character: &CharacterRef, request: &FriendRequest) {
        println!("({} sent a friend request: {})", character.name, request.reason);
    }

    fn incoming_call_request(&self, phone_number: &str, request: &CallRequest) {
        println!("(incoming call from {phone_number})");
        for line in &request.opening {
            println!("  {line}");
        }
    }

    fn unblock_user(&self, character: &CharacterRef) {
        println!("({} unblocked you)", character.name);
    }
}
