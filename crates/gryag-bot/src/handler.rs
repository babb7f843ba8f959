//! Teloxide entry points: message classification and command routing, then
//! hand-off to the conversation pipeline or the admin surface.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use tracing::debug;

use gryag_limits::cooldown::{is_owned_command, parse_command};
use gryag_limits::CooldownVerdict;

use crate::commands;
use crate::pipeline;
use crate::send;
use crate::services::BotServices;
use crate::texts;

pub async fn on_message(
    bot: Bot,
    msg: Message,
    services: Arc<BotServices>,
) -> ResponseResult<()> {
    // Bot-originated and service updates are dropped immediately.
    let Some(from) = msg.from.clone() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    let chat_id = msg.chat.id.0;
    let user_id = from.id.0 as i64;

    if !services.settings.chat_allowed(chat_id) {
        debug!(chat_id, "chat not whitelisted");
        return Ok(());
    }

    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    // Command gate. Commands owned by other bots (or unknown tokens) pass
    // through with no throttle check and no persistence.
    if text.starts_with('/') {
        if let Some((command, target_bot)) = parse_command(&text) {
            if let Some(target) = target_bot {
                if !target.eq_ignore_ascii_case(&services.settings.bot_username) {
                    return Ok(());
                }
            }
            if !is_owned_command(command) {
                return Ok(());
            }

            // Banned users get nothing, commands included.
            if services.turns.is_banned(chat_id, user_id).unwrap_or(false) {
                return Ok(());
            }

            let is_admin = services.settings.is_admin(user_id);
            match services
                .cooldown
                .check(user_id, is_admin, services.now_ts())
            {
                CooldownVerdict::Allowed => {}
                CooldownVerdict::WarnAndDrop { retry_after_secs } => {
                    send::send_reply(
                        &bot,
                        msg.chat.id,
                        msg.thread_id,
                        &texts::cooldown_notice(retry_after_secs),
                    )
                    .await;
                    return Ok(());
                }
                CooldownVerdict::SilentDrop => return Ok(()),
            }

            if command == "gryag" {
                // Force-address the bot; the rest of the text is the message.
                pipeline::process(bot, msg, services, true).await;
                return Ok(());
            }
            commands::handle(bot, msg, services, command.to_string()).await;
            return Ok(());
        }
    }

    if services.turns.is_banned(chat_id, user_id).unwrap_or(false) {
        debug!(chat_id, user_id, "banned user, dropping");
        return Ok(());
    }

    if text.is_empty() && !has_media(&msg) {
        return Ok(());
    }

    pipeline::process(bot, msg, services, false).await;
    Ok(())
}

pub async fn on_callback(
    bot: Bot,
    query: CallbackQuery,
    services: Arc<BotServices>,
) -> ResponseResult<()> {
    commands::handle_callback(bot, query, services).await;
    Ok(())
}

fn has_media(msg: &Message) -> bool {
    msg.photo().is_some()
        || msg.sticker().is_some()
        || msg.voice().is_some()
        || msg.audio().is_some()
        || msg.video().is_some()
        || msg.video_note().is_some()
        || msg.animation().is_some()
        || msg.document().is_some()
}
