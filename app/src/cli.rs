use crate::render::{self, TerminalRenderer};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use parley_core::models::{find_model, AVAILABLE_MODELS};
use parley_core::{
    ChatSession, ClientError, ClientSettings, Conversation, CredentialStore, GenerationOutcome,
    Message, MessageRole,
};
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Terminal client for a streaming chat service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Service root, e.g. http://localhost:8000/api
    #[arg(long, global = true, env = "PARLEY_BASE_URL")]
    pub base_url: Option<Url>,
    /// Emit session updates as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Sign in and store the issued tokens.
    Login {
        username: String,
        #[arg(long, env = "PARLEY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Create an account and sign in with it.
    Register {
        username: String,
        email: String,
        #[arg(long, env = "PARLEY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget stored tokens.
    Logout,
    Whoami,
    /// List the models the service offers.
    Models,
    List {
        #[arg(long)]
        search: Option<String>,
    },
    Show {
        id: i64,
    },
    New {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    Rename {
        id: i64,
        #[arg(required = true, num_args = 1..)]
        title: Vec<String>,
    },
    Delete {
        id: i64,
    },
    /// Send one message and stream the reply.
    Send {
        #[arg(long)]
        conversation: Option<i64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Interactive chat. `/stop` cancels a reply, `/new` starts over, `/quit` exits.
    Chat {
        #[arg(long)]
        conversation: Option<i64>,
        #[arg(long)]
        model: Option<String>,
    },
}

impl Command {
    fn needs_sign_in(&self) -> bool {
        !matches!(
            self,
            Self::Login { .. } | Self::Register { .. } | Self::Logout | Self::Models
        )
    }
}

/// One line typed into the interactive chat.
#[derive(Debug, PartialEq, Eq)]
pub enum ChatInput {
    Empty,
    Stop,
    New,
    Quit,
    Message(String),
}

impl ChatInput {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Self::Empty,
            "/stop" => Self::Stop,
            "/new" => Self::New,
            "/quit" | "/exit" => Self::Quit,
            text => Self::Message(text.to_string()),
        }
    }
}

pub fn conversation_line(conversation: &Conversation) -> String {
    let touched = conversation
        .updated_at
        .unwrap_or(conversation.created_at)
        .format("%Y-%m-%d %H:%M");
    format!(
        "{:>6}  {}  {:<16}  {}",
        conversation.id, touched, conversation.model, conversation.title
    )
}

pub fn message_block(message: &Message) -> String {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
    };
    format!("{role}> {}", message.content)
}

fn friendly(err: ClientError) -> anyhow::Error {
    anyhow!(err.user_message())
}

/// Failures the renderer has already shown through a session update.
fn already_reported(err: &ClientError) -> bool {
    matches!(
        err,
        ClientError::StreamOpen(_) | ClientError::StreamRead(_) | ClientError::Generation(_)
    )
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let mut settings = ClientSettings::load().map_err(|err| anyhow!(err.user_message()))?;
    if let Some(base_url) = cli.base_url {
        settings.base_url = base_url;
    }
    debug!(base_url = %settings.base_url, "using service");

    let credentials =
        CredentialStore::persistent(settings.credential_file()).context("loading stored credentials")?;
    let (session, updates) = ChatSession::from_settings(&settings, credentials)?;
    let renderer = tokio::spawn(render::drive(TerminalRenderer::stdout(cli.json), updates));

    let result = execute(&session, cli.command).await;
    drop(session);
    renderer
        .await
        .context("renderer task failed")?
        .context("writing to the terminal")?;
    result
}

async fn execute(session: &ChatSession, command: Command) -> Result<ExitCode> {
    if command.needs_sign_in() && !session.is_signed_in() {
        bail!("Not signed in. Run `parley login <username>` first.");
    }

    match command {
        Command::Login { username, password } => {
            let password = resolve_password(password).await?;
            let user = session.sign_in(&username, &password).await.map_err(friendly)?;
            println!("Signed in as {}", user.username);
        }
        Command::Register {
            username,
            email,
            password,
        } => {
            let password = resolve_password(password).await?;
            let user = session
                .register(&username, &email, &password)
                .await
                .map_err(friendly)?;
            println!("Registered and signed in as {}", user.username);
        }
        Command::Logout => {
            session.sign_out();
            println!("Signed out");
        }
        Command::Whoami => {
            let user = session.current_user().await.map_err(friendly)?;
            println!("{} <{}>", user.username, user.email);
        }
        Command::Models => {
            for model in AVAILABLE_MODELS {
                println!("{:<16}  {:<16}  {:<10}  {}", model.id, model.name, model.provider, model.description);
            }
        }
        Command::List { search } => {
            let conversations = match search {
                Some(query) => {
                    session
                        .search_conversations(&query)
                        .await
                        .map_err(friendly)?
                        .conversations
                }
                None => session.load_conversations().await.map_err(friendly)?,
            };
            if conversations.is_empty() {
                println!("No conversations");
            }
            for conversation in &conversations {
                println!("{}", conversation_line(conversation));
            }
        }
        Command::Show { id } => {
            let conversation = session.open_conversation(id).await.map_err(friendly)?;
            println!("{}", conversation_line(&conversation));
            for message in session.snapshot().messages {
                println!("{}", message_block(&message));
            }
        }
        Command::New { title, model } => {
            let model = checked_model(model)?;
            let conversation = session
                .create_conversation(title, model)
                .await
                .map_err(friendly)?;
            println!("{}", conversation_line(&conversation));
        }
        Command::Rename { id, title } => {
            let conversation = session
                .rename_conversation(id, &title.join(" "))
                .await
                .map_err(friendly)?;
            println!("{}", conversation_line(&conversation));
        }
        Command::Delete { id } => {
            session.delete_conversation(id).await.map_err(friendly)?;
            println!("Deleted conversation {id}");
        }
        Command::Send {
            conversation,
            model,
            message,
        } => {
            let model = checked_model(model)?;
            if let Some(id) = conversation {
                session.open_conversation(id).await.map_err(friendly)?;
            }
            match session.send_message(message.join(" "), model).await {
                Ok(_) => {}
                Err(err) if already_reported(&err) => return Ok(ExitCode::FAILURE),
                Err(err) => return Err(friendly(err)),
            }
        }
        Command::Chat {
            conversation,
            model,
        } => {
            let model = checked_model(model)?;
            return chat(session, conversation, model).await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn checked_model(model: Option<String>) -> Result<Option<String>> {
    match model {
        Some(id) if find_model(&id).is_none() => {
            bail!("Unknown model `{id}`. Run `parley models` to see the choices.")
        }
        other => Ok(other),
    }
}

async fn resolve_password(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    eprint!("Password: ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("no password given"))?;
    Ok(line.trim_end().to_string())
}

type Generation = JoinHandle<Result<Option<GenerationOutcome>, ClientError>>;

async fn chat(session: &ChatSession, conversation: Option<i64>, model: Option<String>) -> Result<ExitCode> {
    if let Some(id) = conversation {
        let opened = session.open_conversation(id).await.map_err(friendly)?;
        println!("{}", conversation_line(&opened));
        for message in session.snapshot().messages {
            println!("{}", message_block(&message));
        }
    }
    eprintln!("Type a message. /stop cancels a reply, /new starts a conversation, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut generation: Option<Generation> = None;
    while let Some(line) = lines.next_line().await? {
        if !reply_in_flight(generation.as_ref()) {
            if let Some(handle) = generation.take() {
                settle(handle).await?;
            }
        }

        match ChatInput::parse(&line) {
            ChatInput::Empty => {}
            ChatInput::Quit => break,
            ChatInput::Stop => {
                if let Err(err) = session.stop_generation().await {
                    eprintln!("{}", err.user_message());
                }
            }
            ChatInput::New => {
                if reply_in_flight(generation.as_ref()) || session.state().is_generating() {
                    eprintln!("{}", ClientError::GenerationActive.user_message());
                } else {
                    session.clear_current_conversation();
                    eprintln!("Started a new conversation");
                }
            }
            ChatInput::Message(text) => {
                if reply_in_flight(generation.as_ref()) || session.state().is_generating() {
                    eprintln!("{}", ClientError::GenerationActive.user_message());
                    continue;
                }
                let session = session.clone();
                let model = model.clone();
                generation = Some(tokio::spawn(async move { session.send_message(text, model).await }));
            }
        }
    }

    if let Some(handle) = generation {
        settle(handle).await?;
    }
    Ok(ExitCode::SUCCESS)
}

/// True while a spawned reply has not returned, including its reconcile step.
fn reply_in_flight(generation: Option<&Generation>) -> bool {
    generation.is_some_and(|handle| !handle.is_finished())
}

async fn settle(handle: Generation) -> Result<()> {
    match handle.await.context("reply task failed")? {
        Ok(_) => {}
        Err(err) if already_reported(&err) => {}
        Err(err) if err.is_session_expired() => bail!(err.user_message()),
        Err(err) => eprintln!("{}", err.user_message()),
    }
    Ok(())
}
