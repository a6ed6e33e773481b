//! Chat command surface
//!
//! Incoming Telegram text is parsed into a tagged `ChatCommand` and
//! dispatched onto store operations. The scheduler core never sees raw chat
//! payloads; everything it reacts to goes through the store.

use crate::error::Result;
use crate::fetch::{music_id_from_input, sound_url};
use crate::notify::{escape_html, format_timestamp, Notifier, TelegramNotifier};
use crate::store::{TargetType, TrackedTarget, WatchDb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

const HELP: &str = "<b>soundwatch</b>\n\n\
    /track_sound &lt;music_url|music_id&gt; — watch a sound for new videos\n\
    /untrack_sound &lt;music_id&gt; — stop watching a sound\n\
    /list — tracked targets\n\
    /track_hashtag &lt;tag&gt; — watch a hashtag for new sounds\n\
    /untrack_hashtag &lt;tag&gt; — stop watching a hashtag\n\
    /set_interval &lt;minutes&gt; — polling interval";

/// A parsed chat command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Start,
    List,
    TrackSound(String),
    UntrackSound(String),
    TrackHashtag(String),
    UntrackHashtag(String),
    SetInterval(u64),
    /// A recognized command with a missing or malformed argument
    Usage(&'static str),
}

/// Parse message text into a command. Returns `None` for anything that is
/// not addressed to the bot.
pub fn parse_command(text: &str) -> Option<ChatCommand> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let head = parts.next()?;
    let arg = parts.next().map(str::trim).unwrap_or("");

    // Group chats address commands as /cmd@botname
    let name = head.split('@').next().unwrap_or(head);

    match name {
        "/start" | "/help" => Some(ChatCommand::Start),
        "/list" => Some(ChatCommand::List),
        "/track_sound" => {
            if arg.is_empty() {
                return Some(ChatCommand::Usage(
                    "Send a music id or a tiktok.com/music link.",
                ));
            }
            match music_id_from_input(arg) {
                Some(id) => Some(ChatCommand::TrackSound(id)),
                None => Some(ChatCommand::Usage("Could not recognize a music id.")),
            }
        }
        "/untrack_sound" => {
            if arg.is_empty() {
                return Some(ChatCommand::Usage("Send the music id to stop watching."));
            }
            let id = music_id_from_input(arg).unwrap_or_else(|| arg.to_string());
            Some(ChatCommand::UntrackSound(id))
        }
        "/track_hashtag" => {
            let tag = arg.trim_start_matches('#');
            if tag.is_empty() {
                return Some(ChatCommand::Usage("Send the hashtag to watch, without #."));
            }
            Some(ChatCommand::TrackHashtag(tag.to_string()))
        }
        "/untrack_hashtag" => {
            let tag = arg.trim_start_matches('#');
            if tag.is_empty() {
                return Some(ChatCommand::Usage("Send the hashtag to stop watching."));
            }
            Some(ChatCommand::UntrackHashtag(tag.to_string()))
        }
        "/set_interval" => match arg.parse::<u64>() {
            Ok(minutes) if minutes > 0 => Some(ChatCommand::SetInterval(minutes)),
            _ => Some(ChatCommand::Usage(
                "Send the interval in minutes, e.g.: /set_interval 3",
            )),
        },
        _ => None,
    }
}

/// Handles the shared state commands operate on
pub struct CommandContext {
    pub db: WatchDb,
    /// Live scheduler interval in seconds, adjusted by /set_interval
    pub interval_secs: Arc<AtomicU64>,
}

/// Execute a command for a chat and produce the reply text
pub async fn handle_command(
    ctx: &CommandContext,
    chat_id: i64,
    command: ChatCommand,
) -> Result<String> {
    match command {
        ChatCommand::Start => Ok(HELP.to_string()),

        ChatCommand::List => {
            let targets = ctx.db.list_targets().await?;
            if targets.is_empty() {
                return Ok("Nothing tracked yet. Add a sound with /track_sound <music_id|url>."
                    .to_string());
            }
            let mut lines = vec!["<b>Tracked targets:</b>".to_string()];
            for target in targets {
                let latest = ctx
                    .db
                    .latest_successful_run(target.get_type()?, &target.target_id)
                    .await?
                    .map(|run| run.started_at[..16].replace('T', " "))
                    .unwrap_or_else(|| "never".to_string());
                match target.get_type()? {
                    TargetType::Sound => lines.push(format!(
                        "• <code>{}</code> — {} (last post: {}, polled: {})",
                        escape_html(&target.target_id),
                        escape_html(target.title.as_deref().unwrap_or("—")),
                        format_timestamp(target.last_ts),
                        latest,
                    )),
                    TargetType::Hashtag => lines.push(format!(
                        "• #{} (polled: {})",
                        escape_html(&target.target_id),
                        latest,
                    )),
                }
            }
            Ok(lines.join("\n"))
        }

        ChatCommand::TrackSound(music_id) => {
            ctx.db
                .upsert_target(&TrackedTarget::new(TargetType::Sound, music_id.clone(), None))
                .await?;
            ctx.db.subscribe(chat_id, TargetType::Sound, &music_id).await?;
            Ok(format!(
                "Subscribed this chat to sound <code>{}</code> — {}",
                escape_html(&music_id),
                sound_url(&music_id)
            ))
        }

        ChatCommand::UntrackSound(music_id) => {
            ctx.db.unsubscribe(chat_id, TargetType::Sound, &music_id).await?;
            Ok(format!(
                "Unsubscribed this chat from <code>{}</code>.",
                escape_html(&music_id)
            ))
        }

        ChatCommand::TrackHashtag(tag) => {
            ctx.db
                .upsert_target(&TrackedTarget::new(
                    TargetType::Hashtag,
                    tag.clone(),
                    Some(format!("#{}", tag)),
                ))
                .await?;
            ctx.db.subscribe(chat_id, TargetType::Hashtag, &tag).await?;
            Ok(format!("Subscribed this chat to hashtag <b>#{}</b>.", escape_html(&tag)))
        }

        ChatCommand::UntrackHashtag(tag) => {
            ctx.db.unsubscribe(chat_id, TargetType::Hashtag, &tag).await?;
            Ok(format!(
                "Unsubscribed this chat from hashtag <b>#{}</b>.",
                escape_html(&tag)
            ))
        }

        ChatCommand::SetInterval(minutes) => {
            ctx.interval_secs.store(minutes * 60, Ordering::Relaxed);
            Ok(format!("Polling interval set to {} min.", minutes))
        }

        ChatCommand::Usage(usage) => Ok(usage.to_string()),
    }
}

/// Long-poll Telegram for commands until shutdown. Errors from a single
/// update batch are logged and retried; they never end the loop.
pub async fn run_command_loop(
    telegram: &TelegramNotifier,
    ctx: &CommandContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut offset = 0i64;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let updates = tokio::select! {
            result = telegram.get_updates(offset, 30) => result,
            _ = shutdown.changed() => return Ok(()),
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!("getUpdates failed: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);

            let Some(message) = update.message else { continue };
            let Some(text) = message.text.as_deref() else { continue };
            let Some(command) = parse_command(text) else { continue };

            debug!(chat_id = message.chat.id, "Handling command: {:?}", command);
            let reply = match handle_command(ctx, message.chat.id, command).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(chat_id = message.chat.id, "Command failed: {}", e);
                    format!("Command failed: {}", e)
                }
            };

            if let Err(e) = telegram.send(message.chat.id, &reply).await {
                warn!(chat_id = message.chat.id, "Failed to reply: {}", e);
            }
        }
    }
}
