use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::protocol::{ClientMessage, ServerMessage, SessionMode};

#[derive(Parser, Debug)]
#[command(name = "carousel")]
#[command(about = "Anonymous pairing and WebRTC signaling server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as a probe client: register, search, and print server events
    Probe {
        /// Server URL (e.g., ws://localhost:5001)
        #[arg(short, long, default_value = "ws://localhost:5001")]
        url: String,

        /// Session mode to search in: audio or video
        #[arg(short, long, default_value = "video")]
        mode: String,

        /// Seconds to keep listening for events
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

pub async fn run_probe(url: String, mode: String, listen_seconds: u64) -> Result<()> {
    let mode = match mode.as_str() {
        "audio" => SessionMode::Audio,
        "video" => SessionMode::Video,
        other => {
            return Err(anyhow::anyhow!("unknown mode '{other}', expected audio or video"));
        }
    };

    let ws_url = format!("{url}/ws");
    debug!("connecting to {ws_url}");
    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("connection failed: {e}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the carousel server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let register = serde_json::to_string(&ClientMessage::Register { peer_ref: None })?;
    write.send(Message::Text(register.into())).await?;
    let search = serde_json::to_string(&ClientMessage::Search { mode })?;
    write.send(Message::Text(search.into())).await?;

    let deadline = Instant::now() + Duration::from_secs(listen_seconds);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            println!("probe finished: no more events within {listen_seconds}s");
            break;
        }
        let frame = match timeout(remaining, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                println!("server closed the connection");
                break;
            }
            Err(_) => {
                println!("probe finished: no more events within {listen_seconds}s");
                break;
            }
        };

        if let Message::Text(text) = frame {
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => print_event(&message),
                Err(e) => debug!("unrecognized server message: {e}"),
            }
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

fn print_event(message: &ServerMessage) {
    match message {
        ServerMessage::Registered { connection_id } => {
            println!("registered as {connection_id}");
        }
        ServerMessage::Waiting => println!("waiting for a partner..."),
        ServerMessage::Paired {
            room_id,
            partner_id,
            mode,
            initiator,
        } => {
            println!(
                "paired with {partner_id} in {room_id} ({mode}, {})",
                if *initiator { "initiator" } else { "responder" }
            );
        }
        ServerMessage::PartnerLeft => println!("partner left"),
        ServerMessage::SearchCancelled => println!("search cancelled"),
        ServerMessage::Signal { from, .. } => println!("signal from {from}"),
        ServerMessage::Error { message } => eprintln!("error: {message}"),
        other => println!("{}", serde_json::to_string(other).unwrap_or_default()),
    }
}
