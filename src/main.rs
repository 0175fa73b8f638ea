//! Pulse Call - Konsolen-Client
//!
//! Verbindet sich mit dem Relay aus `SIGNALING_URL` und steuert Anrufe über
//! Zeilenbefehle auf stdin.

use anyhow::{Context, Result};
use call_core::media::WebRtcMedia;
use call_core::transport::{Transport, WebSocketTransport};
use call_core::{CallConfig, CallEngine, CallHandle, CallNotification, CallState, CallType};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "\
Commands:
  call <peer> [audio|video]   start a call (default: audio)
  accept | decline            answer a ringing call
  hangup                      end the current call
  mute | video | share        toggle microphone, camera, screen sharing
  retry | reset               recover from an error / return to idle
  state                       print the current call state
  quit                        hang up and exit";

#[tokio::main]
async fn main() -> Result<()> {
    call_core::init_tracing();

    let config = CallConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        "Starting Pulse Call as {} in room {}",
        config.user_id,
        config.room_id
    );

    let (transport, transport_events) =
        WebSocketTransport::new(config.connect_timeout(), config.keepalive_interval());
    let (media, media_events) = WebRtcMedia::new(&config.ice_servers);

    let handle = CallEngine::start(
        &config,
        transport as Arc<dyn Transport>,
        transport_events,
        media,
        media_events,
    )
    .context("failed to start call engine")?;

    tokio::spawn(print_notifications(handle.notifications()));

    println!("You are '{}' in room '{}'.", config.user_id, config.room_id);
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((command, args)) = parts.split_first() else {
            continue;
        };

        if *command == "quit" {
            break;
        }

        if let Err(e) = run_command(&handle, command, args).await {
            println!("! {}", e);
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn run_command(handle: &CallHandle, command: &str, args: &[&str]) -> Result<()> {
    match command {
        "call" => {
            let peer = args.first().context("usage: call <peer> [audio|video]")?;
            let call_type = match args.get(1).copied() {
                None | Some("audio") => CallType::Audio,
                Some("video") => CallType::Video,
                Some(other) => anyhow::bail!("unknown call type '{}'", other),
            };
            handle.start_call(*peer, None, call_type).await?;
        }
        "accept" => handle.accept().await?,
        "decline" => handle.decline().await?,
        "hangup" => handle.hang_up().await?,
        "mute" => handle.toggle_mute().await?,
        "video" => handle.toggle_video().await?,
        "share" => handle.toggle_screen_share().await?,
        "retry" => handle.retry().await?,
        "reset" => handle.reset().await?,
        "state" => println!("{}", describe(&handle.state())),
        "help" => println!("{HELP}"),
        other => anyhow::bail!("unknown command '{}', try 'help'", other),
    }
    Ok(())
}

async fn print_notifications(mut notifications: broadcast::Receiver<CallNotification>) {
    loop {
        match notifications.recv().await {
            Ok(CallNotification::StateChanged(state)) => println!("* {}", describe(&state)),
            Ok(CallNotification::QualityChanged(grade)) => println!("* quality: {}", grade),
            Ok(CallNotification::QualityIssues(issues)) => println!("* issues: {:?}", issues),
            Ok(CallNotification::Rejected(error)) => println!("! rejected: {}", error),
            Ok(CallNotification::EffectFailed(error)) => println!("! failed: {}", error),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Skipped {} notifications", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(state: &CallState) -> String {
    match state {
        CallState::Idle => "idle".to_string(),
        CallState::Ringing {
            participant,
            call_type,
            ..
        } => format!(
            "ringing: {:?} call from {} (accept / decline)",
            call_type, participant.display_name
        ),
        CallState::Connecting {
            participant,
            is_reconnecting,
            ..
        } => {
            if *is_reconnecting {
                format!("reconnecting to {}", participant.display_name)
            } else {
                format!("connecting to {}", participant.display_name)
            }
        }
        CallState::Connected(active) => format!(
            "connected to {} (muted: {}, video: {}, sharing: {}, quality: {})",
            active.participant.display_name,
            active.is_muted,
            active.is_video_enabled,
            active.is_screen_sharing,
            active
                .quality
                .map(|q| q.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        CallState::Error {
            code,
            message,
            is_recoverable,
        } => format!(
            "error {}: {}{}",
            code,
            message,
            if *is_recoverable { " (retry possible)" } else { "" }
        ),
        CallState::Ended {
            reason,
            duration,
            bytes_transferred,
            ..
        } => format!(
            "ended ({:?}) after {}s, {} bytes",
            reason,
            duration.as_secs(),
            bytes_transferred
        ),
    }
}
