use std::collections::HashSet;

use chatsync::engine::EngineEvent;
use chatsync::presence::PresenceChange;
use chatsync::{
    ApiClient, ApiError, ConnectionState, Engine, EngineConfig, EngineError, ErrorCode, Message, MessageId, Peer,
    Session, TypingState, UserId,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("connection lost and reconnect gave up; log in again")]
    TransportLost,
}

#[derive(Parser, Debug)]
#[command(name = "chat", about = "One-to-one realtime chat client")]
struct Cli {
    #[arg(long, env = "CHAT_API_URL", default_value = "http://127.0.0.1:3000")]
    api_url: String,

    #[arg(long, env = "CHAT_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "CHAT_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "CHAT_USER_ID")]
    user_id: i64,

    #[arg(long, env = "CHAT_USERNAME", default_value = "me")]
    username: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the user directory.
    Users,
    /// Show one user.
    User { user_id: i64 },
    /// Print the backlog with a peer.
    History { peer_id: i64 },
    /// Interactive chat: stdin lines are sent, `/typing` signals typing,
    /// `/retry` reloads history, `/quit` logs out.
    Chat { peer_id: i64 },
}

impl Cli {
    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.api_url.clone());
        config.ws_url.clone_from(&self.ws_url);
        config
    }

    fn session(&self) -> Option<Session> {
        self.token.as_ref().map(|token| Session::new(UserId(self.user_id), self.username.clone(), token.clone()))
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    let session = cli
        .session()
        .filter(Session::is_authenticated)
        .ok_or(EngineError::AuthenticationMissing)?;

    match cli.command {
        Command::Users => {
            let users = ApiClient::new(&config)?.list_users(&session.auth_token).await?;
            print_json(&serde_json::to_value(users)?)
        }
        Command::User { user_id } => {
            let user = ApiClient::new(&config)?.get_user(UserId(user_id), &session.auth_token).await?;
            print_json(&serde_json::to_value(user)?)
        }
        Command::History { peer_id } => {
            let api = ApiClient::new(&config)?;
            let loader = chatsync::HistoryLoader::new(std::sync::Arc::new(api));
            let messages = loader.fetch(UserId(peer_id), &session.auth_token).await?;
            print_json(&serde_json::to_value(messages)?)
        }
        Command::Chat { peer_id } => run_chat(&config, session, UserId(peer_id)).await,
    }
}

async fn run_chat(config: &EngineConfig, session: Session, peer_id: UserId) -> Result<(), CliError> {
    let peer = ApiClient::new(config)?.get_user(peer_id, &session.auth_token).await?;
    let engine = Engine::from_config(config, Some(session))?;
    let mut events = engine.events();

    let status = engine.select_peer(peer.clone()).await?;
    eprintln!("* chatting with {} ({status}); /typing, /retry reloads history, /quit leaves", peer.username);
    let mut screen = Screen::default();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break Ok(()) };
                match line.trim() {
                    "/quit" => break Ok(()),
                    "/retry" => report(engine.retry_history().await.map(|()| true)),
                    "/typing" => report(engine.typing_activity().map(|()| true)),
                    _ => report(engine.send_message(line).await),
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::TransportLost) => break Err(CliError::TransportLost),
                Ok(event) => screen.render(&engine, &peer, &event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "chat: event stream lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    engine.logout().await;
    outcome
}

fn report(result: Result<bool, EngineError>) {
    if let Err(error) = result {
        eprintln!("! {error} [{}]", error.error_code());
    }
}

/// Terminal output for one chat; each message id is printed once.
#[derive(Default)]
struct Screen {
    printed: HashSet<MessageId>,
}

impl Screen {
    fn render(&mut self, engine: &Engine, peer: &Peer, event: &EngineEvent) {
        match event {
            EngineEvent::MessageAppended(message) => self.print_message(engine, peer, message),
            EngineEvent::HistoryApplied { count, .. } => {
                eprintln!("--- {count} earlier messages ---");
                for message in engine.snapshot().messages {
                    self.print_message(engine, peer, &message);
                }
            }
            EngineEvent::HistoryFailed { message, retryable, .. } => {
                let hint = if *retryable { " (try /retry)" } else { "" };
                eprintln!("! history failed: {message}{hint}");
            }
            EngineEvent::Presence(PresenceChange::Peer { user_id, state }) if *user_id == peer.id => {
                eprintln!("* {} is {state}", peer.username);
            }
            EngineEvent::Presence(PresenceChange::Reset { .. }) => eprintln!("* presence unknown until reconnected"),
            EngineEvent::Typing { user_id, state: TypingState::Typing } if *user_id == peer.id => {
                eprintln!("* {} is typing...", peer.username);
            }
            EngineEvent::Connection(state @ (ConnectionState::Reconnecting | ConnectionState::Connected)) => {
                eprintln!("* {state}");
            }
            _ => {}
        }
    }

    fn print_message(&mut self, engine: &Engine, peer: &Peer, message: &Message) {
        if !self.claim(message) {
            return;
        }
        println!("[{}] {}", author(engine, peer, message), message.content);
    }

    /// `true` the first time `message` is offered.
    fn claim(&mut self, message: &Message) -> bool {
        self.printed.insert(message.id)
    }
}

fn author<'a>(engine: &'a Engine, peer: &'a Peer, message: &Message) -> &'a str {
    if message.sender_id == engine.session().user_id {
        engine.session().username.as_str()
    } else {
        peer.username.as_str()
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
