use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use parley_core::{
    telemetry, ChatSession, ClientSettings, Completion, CredentialStore,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Parley")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in, stream a reply, and reconcile it against an in-process mock service.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    runtime.block_on(async {
        let server = mock_service().await;
        let mut settings = ClientSettings::for_base_url(server.uri().parse()?);
        settings.credentials_path = Some(temp_dir.path().join("credentials.json"));
        let credentials = CredentialStore::persistent(settings.credential_file())?;
        let (session, _updates) = ChatSession::from_settings(&settings, credentials)?;

        let user = session.sign_in("smoke", "smoke-password").await?;
        info!(username = %user.username, "signed in");

        let Some(outcome) = session.send_message("ping from xtask", None).await? else {
            bail!("message was not sent");
        };
        if outcome.completion != Completion::Done {
            bail!("reply ended without completion");
        }
        let snapshot = session.snapshot();
        info!(
            conversation_id = ?outcome.conversation_id,
            messages = snapshot.messages.len(),
            reply = %outcome.content,
            "smoke test reply reconciled"
        );
        Ok::<_, anyhow::Error>(())
    })
}

async fn mock_service() -> MockServer {
    let server = MockServer::start().await;
    let created_at = "2024-05-01T10:00:00Z";
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "smoke-access",
            "refresh_token": "smoke-refresh",
            "token_type": "bearer"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "username": "smoke",
            "email": "smoke@example.com",
            "created_at": created_at
        })))
        .mount(&server)
        .await;

    let frames = [
        json!({ "type": "init", "conversation_id": 1 }),
        json!({ "type": "chunk", "content": "pong" }),
        json!({ "type": "chunk", "content": " from mock" }),
        json!({ "type": "done", "conversation_id": 1 }),
    ];
    let body: String = frames.iter().map(|frame| format!("data: {frame}\n\n")).collect();
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let conversation = json!({
        "id": 1,
        "user_id": 1,
        "title": "ping from xtask",
        "model": "gpt-3.5-turbo",
        "created_at": created_at
    });
    Mock::given(method("GET"))
        .and(path("/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 1,
            "conversations": [conversation]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 1, "conversation_id": 1, "role": "user", "content": "ping from xtask", "tokens": 3, "created_at": created_at },
            { "id": 2, "conversation_id": 1, "role": "assistant", "content": "pong from mock", "tokens": 3, "created_at": created_at }
        ])))
        .mount(&server)
        .await;
    server
}
