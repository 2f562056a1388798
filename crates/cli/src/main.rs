use std::sync::Arc;

use agentick_client::{ClientHandle, DriverError, SettingsError, SettingsStore};
use agentick_core::{
    ConnectionState, ConversationId, Message, Sender, SyncError, UserCommand, ViewSnapshot,
    Visibility,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  /switch <id>   view another conversation
  /older         load older history
  /reload        reload the current history from the first page
  /config        reload settings from disk and environment
  /token <value> store a new credential, used by the next connection
  /bg, /fg       simulate moving the app to the background or foreground
  /dismiss       clear the current error
  /connect       open a fresh connection now
  /logout        disconnect and forget the saved session
  /quit          close the connection and exit
anything else is sent as a chat message";

type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed on `{stage}`: {source}"))]
    Driver {
        stage: &'static str,
        source: DriverError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    Input {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Engine(UserCommand),
    Visibility(Visibility),
    ReloadSettings,
    SetToken(String),
    Help,
    Quit,
    Invalid(String),
}

fn parse_line(line: &str) -> Option<CliCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Some(rest) = trimmed.strip_prefix('/') else {
        // Chat text goes out verbatim, untrimmed.
        return Some(CliCommand::Engine(UserCommand::Send(line.to_string())));
    };

    let (name, argument) = rest
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((rest, ""));

    let command = match name {
        "switch" => match ConversationId::parse(argument) {
            Ok(conversation) => CliCommand::Engine(UserCommand::SwitchConversation(conversation)),
            Err(error) => CliCommand::Invalid(error.to_string()),
        },
        "older" => CliCommand::Engine(UserCommand::LoadOlder),
        "reload" => CliCommand::Engine(UserCommand::ReloadHistory),
        "dismiss" => CliCommand::Engine(UserCommand::DismissError),
        "connect" => CliCommand::Engine(UserCommand::Connect),
        "logout" => CliCommand::Engine(UserCommand::Logout),
        "bg" => CliCommand::Visibility(Visibility::Background),
        "fg" => CliCommand::Visibility(Visibility::Foreground),
        "config" => CliCommand::ReloadSettings,
        "token" if !argument.is_empty() => CliCommand::SetToken(argument.to_string()),
        "token" => CliCommand::Invalid("usage: /token <value>".to_string()),
        "help" => CliCommand::Help,
        "quit" | "exit" => CliCommand::Quit,
        other => CliCommand::Invalid(format!("unknown command '/{other}', try /help")),
    };
    Some(command)
}

fn format_message(message: &Message) -> String {
    let time = message.timestamp.format("%H:%M:%S");
    match message.from {
        Sender::User => format!("[{time}] you: {}", message.text),
        Sender::Agent => format!("[{time}] agent: {}", message.text),
        Sender::System => format!("[{time}] ! {}", message.text),
    }
}

fn format_status(snapshot: &ViewSnapshot) -> String {
    let conversation = snapshot
        .active_conversation
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut status = format!("-- conversation {conversation} | {}", snapshot.connection_state);
    if snapshot.connection_state != ConnectionState::Connected && snapshot.reconnect_attempts > 0 {
        status.push_str(&format!(" (retry {})", snapshot.reconnect_attempts));
    }
    if snapshot.connection_state == ConnectionState::Connected && !snapshot.is_live_visible() {
        status.push_str(" | live hidden");
    }
    if snapshot.loading_history {
        status.push_str(" | loading history");
    }
    if snapshot.has_more {
        status.push_str(" | /older available");
    }
    if snapshot.awaiting_reply {
        status.push_str(" | agent is thinking");
    }
    status
}

/// Prints only what changed since the last snapshot.
#[derive(Default)]
struct Transcript {
    printed: Vec<Message>,
    status: String,
    error: Option<SyncError>,
}

impl Transcript {
    fn render(&mut self, snapshot: &ViewSnapshot) {
        let extends = snapshot.displayed.len() >= self.printed.len()
            && snapshot.displayed[..self.printed.len()] == self.printed[..];
        if extends {
            for message in &snapshot.displayed[self.printed.len()..] {
                println!("{}", format_message(message));
            }
        } else {
            println!("----");
            for message in &snapshot.displayed {
                println!("{}", format_message(message));
            }
        }
        self.printed = snapshot.displayed.clone();

        if snapshot.is_empty_conversation() && !extends {
            println!("(no messages yet)");
        }

        let status = format_status(snapshot);
        if status != self.status {
            println!("{status}");
            self.status = status;
        }

        if snapshot.error != self.error {
            if let Some(error) = &snapshot.error {
                println!("error: {error} (/dismiss to clear)");
            }
        }
        self.error = snapshot.error.clone();
    }
}

async fn render_loop(mut view: watch::Receiver<ViewSnapshot>) {
    let mut transcript = Transcript::default();
    loop {
        let snapshot = view.borrow_and_update().clone();
        transcript.render(&snapshot);
        if view.changed().await.is_err() {
            break;
        }
    }
}

async fn run() -> CliResult<()> {
    let settings = Arc::new(SettingsStore::load());
    tracing::info!(path = ?settings.config_path(), "loaded settings");
    if !settings.settings().has_token() {
        println!("no credential configured; set one with /token <value> or AGENTICK_TOKEN");
    }

    let client = ClientHandle::start(settings.clone()).context(DriverSnafu {
        stage: "start-client",
    })?;
    let renderer = tokio::spawn(render_loop(client.subscribe()));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(InputSnafu {
        stage: "read-stdin",
    })? {
        let Some(command) = parse_line(&line) else {
            continue;
        };

        let dispatched = match command {
            CliCommand::Engine(command) => client.command(command),
            CliCommand::Visibility(visibility) => client.set_visibility(visibility),
            CliCommand::ReloadSettings => {
                report_settings(settings.reload().map(|_| ()));
                Ok(())
            }
            CliCommand::SetToken(token) => {
                let mut updated = (*settings.settings()).clone();
                updated.token = token;
                report_settings(settings.update(updated));
                Ok(())
            }
            CliCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            CliCommand::Invalid(details) => {
                println!("{details}");
                Ok(())
            }
            CliCommand::Quit => break,
        };
        dispatched.context(DriverSnafu {
            stage: "dispatch-command",
        })?;
    }

    client.stop().await;
    renderer.abort();
    Ok(())
}

fn report_settings(result: Result<(), SettingsError>) {
    match result {
        Ok(()) => println!("settings updated; the next connection uses them"),
        Err(error) => {
            tracing::warn!(error = %error, "settings change failed");
            println!("settings unchanged: {error}");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "agentick exited with an error");
        std::process::exit(1);
    }
}
