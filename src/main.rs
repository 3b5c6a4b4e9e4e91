//! twirc - IRC bot for Twitch chat
//!
//! Connects, waits for the MOTD, joins the configured channels and prints
//! chat traffic until `!exit` is posted in the bot's own channel or Ctrl-C.

use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use twirc_client::config::normalize_channel;
use twirc_client::{Config, Connection, ConnectionState, Message};
use twirc_protocol::command::PRIVMSG;
use twirc_protocol::irc_lower;

const EXIT_COMMAND: &str = "!exit";

#[derive(Parser)]
#[command(name = "twirc")]
#[command(about = "IRC bot for Twitch chat")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file (defaults to $TWIRC_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra channel to join (repeatable)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Seconds to wait for the server's MOTD
    #[arg(long, default_value_t = 30)]
    login_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let own_channel = irc_lower(&normalize_channel(&config.identity.nickname));

    let conn = Connection::new(config.connection_config()?);
    let exit_channel = own_channel.clone();
    conn.on_message(move |conn, msg| {
        print_message(&msg);
        if is_exit_request(&msg, &exit_channel) {
            tracing::info!("Exit requested by {}", msg.nick().unwrap_or("unknown"));
            conn.shutdown();
        }
        Ok(())
    });

    conn.connect().await?;

    if config.wait_for_motd {
        if let Err(e) = conn
            .wait_for_motd(Duration::from_secs(cli.login_timeout))
            .await
        {
            tracing::error!("Login failed: {}", e);
            conn.disconnect().await?;
            return Err(e.into());
        }
        tracing::info!("Logged in as {}", config.identity.nickname);
    }

    let mut channels = config.channels.clone();
    if !contains_channel(&channels, &own_channel) {
        channels.push(own_channel);
    }
    for channel in &channels {
        conn.join(channel)?;
        tracing::info!("Joining {}", channel);
    }

    tokio::select! {
        _ = closed(conn.subscribe_state()) => {
            tracing::info!("Connection closed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down");
        }
    }

    conn.disconnect().await?;
    Ok(())
}

/// Loads the config and merges `--channel` arguments into it.
fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::load(cli.config.as_deref())?;

    for channel in &cli.channels {
        let channel = normalize_channel(channel);
        if !contains_channel(&config.channels, &channel) {
            config.channels.push(channel);
        }
    }

    config.validate()?;
    Ok(config)
}

fn contains_channel(channels: &[String], channel: &str) -> bool {
    channels.iter().any(|c| c.eq_ignore_ascii_case(channel))
}

fn is_exit_request(msg: &Message, own_channel: &str) -> bool {
    msg.command() == PRIVMSG
        && msg
            .channel()
            .is_some_and(|c| c.eq_ignore_ascii_case(own_channel))
        && msg.content().trim() == EXIT_COMMAND
}

fn print_message(msg: &Message) {
    if msg.command() == PRIVMSG {
        println!(
            "{} {}: {}",
            format!("[{}]", msg.channel().unwrap_or("?")).cyan(),
            msg.nick().unwrap_or("?").green().bold(),
            msg.content()
        );
    } else if msg.is_numeric() {
        println!("{}", msg.raw().dimmed());
    } else {
        println!("{}", msg.raw().yellow());
    }
}

async fn closed(mut state: watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(ConnectionState::is_closing).await;
}
