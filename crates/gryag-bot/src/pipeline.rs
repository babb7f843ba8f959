//! The conversation pipeline: everything between a classified incoming
//! message and the persisted model reply.
//!
//! Gates run first (ban, trigger, lock, rate limit), then context assembly,
//! prompt resolution, the Gemini call with tools, reply formatting and
//! sending, and finally persistence plus fire-and-forget learners.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{Message, MessageEntityKind};
use tracing::{debug, info, warn};

use gryag_context::{meta::TurnMeta, AssembledContext, MediaPart, NewTurn, Role, Turn};
use gryag_core::GryagError;
use gryag_gemini::{Content, ContentRole, GenerateRequest, Part};
use gryag_tools::ToolDispatcher;

use crate::media;
use crate::send;
use crate::services::BotServices;
use crate::summarizer::GeminiSummarizer;
use crate::texts;
use crate::trigger::{self, TriggerInput};
use crate::typing::TypingHandle;

const DEFAULT_PERSONA: &str = "Ти — гряг, їдкий, але доброзичливий український чат-бот у груповому чаті. \
     Відповідаєш стисло, українською, з легкою іронією. Використовуй інструменти памʼяті, \
     щоб запамʼятовувати і згадувати факти про людей та чат. Не вигадуй факти, яких не знаєш.";

/// How far a reply excerpt travels into the inline snippet.
fn excerpt(text: &str, max_chars: usize) -> String {
    let cut: String = text.chars().take(max_chars).collect();
    if cut.len() < text.len() {
        format!("{cut}…")
    } else {
        cut
    }
}

pub async fn process(bot: Bot, msg: Message, services: Arc<BotServices>, force_addressed: bool) {
    let chat_id = msg.chat.id.0;
    let thread_id = msg.thread_id.map(|t| t.0 .0 as i64);
    let Some(from) = msg.from.clone() else { return };
    let user_id = from.id.0 as i64;
    let now = services.now_ts();

    let text_raw = msg.text().or(msg.caption()).unwrap_or("").to_string();

    // Profile side-effects before anything can fail.
    let display_name = format!(
        "{}{}",
        from.first_name,
        from.last_name
            .as_deref()
            .map(|l| format!(" {l}"))
            .unwrap_or_default()
    );
    if let Err(e) = services
        .profiles
        .touch_user(chat_id, user_id, Some(&display_name), from.username.as_deref())
    {
        warn!(error = %e, "profile touch failed");
    }
    if let Err(e) = services.profiles.touch_chat(chat_id, msg.chat.title()) {
        warn!(error = %e, "chat profile touch failed");
    }

    // Trigger detection.
    let (mentions, text_mention_ids) = mention_entities(&msg);
    let me_username = services.settings.bot_username.clone();
    let reply_to_bot = msg
        .reply_to_message()
        .and_then(|r| r.from.as_ref())
        .map(|u| u.username.as_deref() == Some(me_username.as_str()) || u.is_bot)
        .unwrap_or(false);
    let addressed = force_addressed
        || trigger::is_addressed(&TriggerInput {
            text: &text_raw,
            is_private_chat: msg.chat.is_private(),
            reply_to_bot,
            mentions: &mentions,
            text_mention_ids: &text_mention_ids,
            bot_username: &me_username,
            bot_id: 0,
        });

    // Collect media and reply context, then persist the user turn early so a
    // later failure never loses the message.
    let media_parts = media::extract_media(&bot, &msg).await;
    let reply_snippet = build_reply_snippet(&services, &msg, chat_id);
    let meta = build_meta(
        &msg,
        chat_id,
        thread_id,
        services.settings.compact_format_use_full_ids,
    );

    let mut stored_text = text_raw.clone();
    if let Some(ref snippet) = reply_snippet {
        if services.settings.include_reply_excerpt {
            stored_text = format!("{snippet}\n{stored_text}");
        }
    }
    let stored_text = if services.settings.enable_compact_conversation_format {
        meta.prepend_to(&stored_text)
    } else {
        stored_text
    };

    let user_turn = NewTurn {
        chat_id,
        thread_id,
        message_id: Some(msg.id.0 as i64),
        user_id,
        role: Role::User,
        text: stored_text.clone(),
        media: media_parts.clone(),
        embedding: None,
        ts: now,
        retention_days: services.settings.retention_days as i64,
    };
    let user_turn_id = match services.turns.add_turn(&user_turn) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to persist user turn");
            0
        }
    };

    // Backfill the embedding off the hot path.
    if user_turn_id != 0 && !stored_text.is_empty() {
        let services2 = Arc::clone(&services);
        let text2 = stored_text.clone();
        tokio::spawn(async move {
            if let Some(embedding) = services2.gemini.embed(&text2).await {
                if let Err(e) = services2.turns.set_embedding(user_turn_id, &embedding) {
                    warn!(error = %e, "embedding backfill failed");
                }
            }
        });
    }

    let stored_turn = (user_turn_id != 0).then_some(user_turn_id);

    if !addressed {
        debug!(chat_id, user_id, "message persisted, not addressed");
        nudge_background(&services, chat_id, thread_id, user_id, &text_raw, stored_turn);
        return;
    }

    // Per-chat serialization: one in-flight pipeline per sender triplet.
    let lock = services.locks.acquire(chat_id, thread_id, user_id);
    let _guard = lock.lock().await;

    // Rate gate (admins bypass). One notice per debounce window.
    if !services.settings.is_admin(user_id) {
        let decision = services.user_limiter.check(user_id, now);
        if !decision.allowed {
            let warned_recently = services
                .rate_warned
                .get(&user_id)
                .map(|t| now - *t < 600)
                .unwrap_or(false);
            if !warned_recently {
                services.rate_warned.insert(user_id, now);
                send::send_reply(
                    &bot,
                    msg.chat.id,
                    msg.thread_id,
                    &texts::throttle_notice(decision.retry_after_secs),
                )
                .await;
            }
            return;
        }
    }

    let typing = TypingHandle::start(bot.clone(), msg.chat.id);
    let timeout = std::time::Duration::from_secs(services.settings.pipeline_timeout_seconds);
    let result = tokio::time::timeout(
        timeout,
        respond(
            &bot,
            &msg,
            &services,
            &stored_text,
            &media_parts,
            user_id,
            stored_turn,
            now,
        ),
    )
    .await;
    typing.stop();

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(error = %e, code = e.code(), chat_id, "pipeline failed");
            let reply = match e {
                GryagError::LlmQuota => texts::ERROR_QUOTA,
                GryagError::LlmSafety(_) => texts::ERROR_SAFETY,
                GryagError::Storage(_) => texts::ERROR_STORAGE,
                _ => texts::ERROR_GENERIC,
            };
            send::send_reply(&bot, msg.chat.id, msg.thread_id, reply).await;
        }
        Err(_) => {
            warn!(chat_id, "pipeline timed out");
            send::send_reply(&bot, msg.chat.id, msg.thread_id, texts::ERROR_TIMEOUT).await;
        }
    }

    nudge_background(&services, chat_id, thread_id, user_id, &text_raw, stored_turn);
}

/// Steps 8–14: assembly, prompt, LLM, formatting, send, persistence.
#[allow(clippy::too_many_arguments)]
async fn respond(
    bot: &Bot,
    msg: &Message,
    services: &Arc<BotServices>,
    stored_text: &str,
    current_media: &[MediaPart],
    user_id: i64,
    stored_turn: Option<i64>,
    now: i64,
) -> Result<(), GryagError> {
    let chat_id = msg.chat.id.0;
    let thread_id = msg.thread_id.map(|t| t.0 .0 as i64);

    // Context assembly with fallback.
    let query_embedding = services.gemini.embed(stored_text).await;
    let (_, text_mention_ids) = mention_entities(msg);
    let assembled = if services.settings.enable_multi_level_context {
        let ctx = services.assembler.assemble(
            chat_id,
            thread_id,
            user_id,
            &text_mention_ids,
            stored_text,
            query_embedding.as_deref(),
            now,
        );
        if ctx.history.is_empty() && ctx.relevant.is_empty() {
            AssembledContext {
                history: services
                    .assembler
                    .fallback(chat_id, thread_id, services.settings.max_turns),
                ..AssembledContext::default()
            }
        } else {
            ctx
        }
    } else {
        AssembledContext {
            history: services
                .assembler
                .fallback(chat_id, thread_id, services.settings.max_turns),
            ..AssembledContext::default()
        }
    };

    // System prompt: override chain, current time, profile digest.
    let persona = services
        .prompts
        .resolve(chat_id)?
        .unwrap_or_else(|| DEFAULT_PERSONA.to_string());
    let mut system = persona;
    system.push_str(&format!(
        "\n\nCurrent time: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));
    if !assembled.background.is_empty() {
        system.push_str("\n\nВідомі факти:\n");
        system.push_str(&assembled.background.join("\n"));
    }
    if !assembled.episodic.is_empty() {
        system.push_str("\n\nНедавні епізоди розмови:\n");
        system.push_str(&assembled.episodic.join("\n"));
    }

    // History and the current turn, excluding the just-persisted user turn.
    let current_message_id = msg.id.0 as i64;
    let mut contents = Vec::new();
    if !assembled.relevant.is_empty() {
        let lines: Vec<String> = assembled
            .relevant
            .iter()
            .map(|t| format!("- {}", excerpt(&t.text, 300)))
            .collect();
        contents.push(Content {
            role: ContentRole::User,
            parts: vec![Part::Text(format!(
                "[Релевантні раніші повідомлення]\n{}",
                lines.join("\n")
            ))],
        });
    }
    for turn in assembled
        .history
        .iter()
        .filter(|t| t.message_id != Some(current_message_id))
    {
        contents.push(turn_to_content(turn));
    }
    let mut current_parts = vec![Part::Text(stored_text.to_string())];
    current_parts.extend(current_media.iter().map(Part::from_media));
    contents.push(Content {
        role: ContentRole::User,
        parts: current_parts,
    });

    let dropped_video_description = find_video_description(&assembled.history);

    let request = GenerateRequest {
        system_instruction: system,
        contents,
        temperature: 0.8,
        max_output_tokens: 2048,
        enable_search_grounding: services.settings.enable_search_grounding,
        dropped_video_description,
    };

    let current_images: Vec<(String, String)> = current_media
        .iter()
        .filter(|m| m.mime.starts_with("image/"))
        .filter_map(|m| match &m.data {
            gryag_context::MediaData::Base64(b64) => Some((m.mime.clone(), b64.clone())),
            gryag_context::MediaData::FileUri(_) => None,
        })
        .collect();
    let tool_ctx = services.tool_context(chat_id, thread_id, user_id, current_images, stored_turn);
    let scratch = Arc::clone(&tool_ctx.scratch);
    let dispatcher = ToolDispatcher::new(Arc::clone(&services.registry), tool_ctx);

    let outcome = services.gemini.generate(&request, Some(&dispatcher)).await?;
    info!(
        chat_id,
        user_id,
        tools = ?outcome.tools_used,
        tokens_in = outcome.input_tokens,
        tokens_out = outcome.output_tokens,
        ms = outcome.response_time_ms,
        "reply generated"
    );

    let reply_text = if outcome.text.is_empty() {
        texts::ERROR_GENERIC.to_string()
    } else {
        outcome.text.clone()
    };

    // Send, then persist the model turn regardless of send success.
    send::send_reply(bot, msg.chat.id, msg.thread_id, &reply_text).await;
    let scratch_out = std::mem::take(&mut *scratch.lock().expect("scratch mutex poisoned"));
    if !scratch_out.pending_images.is_empty() || scratch_out.pending_poll.is_some() {
        send::send_scratch(bot, msg.chat.id, msg.thread_id, &scratch_out).await;
    }

    let model_turn = NewTurn {
        chat_id,
        thread_id,
        message_id: None,
        user_id: 0,
        role: Role::Model,
        text: reply_text.clone(),
        media: Vec::new(),
        embedding: services.gemini.embed(&reply_text).await,
        ts: services.now_ts(),
        retention_days: services.settings.retention_days as i64,
    };
    if let Err(e) = services.turns.add_turn(&model_turn) {
        warn!(error = %e, "failed to persist model turn");
    }
    Ok(())
}

/// Fire-and-forget learners after a message is handled.
fn nudge_background(
    services: &Arc<BotServices>,
    chat_id: i64,
    thread_id: Option<i64>,
    user_id: i64,
    text: &str,
    source_turn_id: Option<i64>,
) {
    let services2 = Arc::clone(services);
    let text2 = text.to_string();
    tokio::spawn(async move {
        if services2.gemini.circuit_open() {
            return;
        }
        services2
            .learner
            .learn_from(chat_id, user_id, &text2, source_turn_id, services2.now_ts());

        let summarizer = GeminiSummarizer::new(Arc::clone(&services2.gemini));
        if let Err(e) = services2
            .monitor
            .tick(chat_id, thread_id, services2.now_ts(), &summarizer)
            .await
        {
            warn!(error = %e, chat_id, "episode monitor tick failed");
        }
    });
}

/// `[↩︎ name: excerpt]` for the replied-to message, resolved from the log.
fn build_reply_snippet(services: &Arc<BotServices>, msg: &Message, chat_id: i64) -> Option<String> {
    let replied = msg.reply_to_message()?;
    let max = services.settings.reply_excerpt_max_chars;

    let name = replied
        .from
        .as_ref()
        .map(|u| u.first_name.clone())
        .unwrap_or_else(|| "?".to_string());

    // Prefer the stored turn (it may carry media context); fall back to the
    // platform-provided payload.
    let stored = services
        .turns
        .find_by_message_id(chat_id, replied.id.0 as i64)
        .ok()
        .flatten();
    let source = stored
        .map(|t| strip_meta(&t.text))
        .or_else(|| replied.text().or(replied.caption()).map(String::from))?;
    if source.is_empty() {
        return None;
    }
    Some(format!("[↩︎ {name}: {}]", excerpt(&source, max)))
}

/// Drop the `[meta] …` prefix line from a stored turn's text.
fn strip_meta(text: &str) -> String {
    match text.strip_prefix("[meta]") {
        Some(rest) => rest.split_once('\n').map(|(_, t)| t).unwrap_or("").to_string(),
        None => text.to_string(),
    }
}

fn build_meta(msg: &Message, chat_id: i64, thread_id: Option<i64>, full_ids: bool) -> TurnMeta {
    let replied = msg.reply_to_message();
    TurnMeta {
        // Chat/thread ids are redundant inside the chat's own log; they are
        // carried only in the full-ids format.
        chat_id: full_ids.then_some(chat_id),
        thread_id: if full_ids { thread_id } else { None },
        message_id: Some(msg.id.0 as i64),
        user_id: msg.from.as_ref().map(|u| u.id.0 as i64),
        username: msg.from.as_ref().and_then(|u| u.username.clone()),
        name: msg.from.as_ref().map(|u| u.first_name.clone()),
        reply_to_user_id: replied
            .and_then(|r| r.from.as_ref())
            .map(|u| u.id.0 as i64),
        reply_to_username: replied
            .and_then(|r| r.from.as_ref())
            .and_then(|u| u.username.clone()),
        reply_to_name: replied
            .and_then(|r| r.from.as_ref())
            .map(|u| u.first_name.clone()),
        reply_to_message_id: replied.map(|r| r.id.0 as i64),
    }
}

fn mention_entities(msg: &Message) -> (Vec<String>, Vec<i64>) {
    let mut mentions = Vec::new();
    let mut ids = Vec::new();
    let text = msg.text().or(msg.caption()).unwrap_or("");
    if let Some(entities) = msg.entities() {
        for entity in entities {
            match &entity.kind {
                MessageEntityKind::Mention => {
                    let start = entity.offset;
                    let end = entity.offset + entity.length;
                    let mention: String = text
                        .chars()
                        .skip(start)
                        .take(end - start)
                        .collect::<String>()
                        .trim_start_matches('@')
                        .to_string();
                    if !mention.is_empty() {
                        mentions.push(mention);
                    }
                }
                MessageEntityKind::TextMention { user } => {
                    ids.push(user.id.0 as i64);
                }
                _ => {}
            }
        }
    }
    (mentions, ids)
}

/// The bot's description of the most recent historical video, used when the
/// video cap forces that video out of the request.
fn find_video_description(history: &[Turn]) -> Option<String> {
    let video_pos = history
        .iter()
        .rposition(|t| t.media.iter().any(|m| m.is_video()))?;
    history[video_pos + 1..]
        .iter()
        .find(|t| t.role == Role::Model && !t.text.is_empty())
        .map(|t| excerpt(&t.text, 200))
}

fn turn_to_content(turn: &Turn) -> Content {
    let role = match turn.role {
        Role::Model => ContentRole::Model,
        _ => ContentRole::User,
    };
    let mut parts = Vec::new();
    if !turn.text.is_empty() {
        parts.push(Part::Text(turn.text.clone()));
    }
    parts.extend(turn.media.iter().map(Part::from_media));
    if parts.is_empty() {
        parts.push(Part::Text(String::new()));
    }
    Content { role, parts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gryag_context::MediaKind;

    fn turn(id: i64, role: Role, text: &str, media: Vec<MediaPart>) -> Turn {
        Turn {
            id,
            chat_id: -100,
            thread_id: None,
            message_id: Some(id),
            user_id: if role == Role::Model { 0 } else { 42 },
            role,
            text: text.to_string(),
            media,
            embedding: None,
            importance: None,
            ts: id,
            retention_days: 90,
        }
    }

    #[test]
    fn video_description_found_from_bot_reply() {
        let history = vec![
            turn(1, Role::User, "дивись відео", vec![MediaPart::inline(MediaKind::Video, "video/mp4", "V")]),
            turn(2, Role::Model, "a cat juggling", vec![]),
            turn(3, Role::User, "круто", vec![]),
        ];
        assert_eq!(
            find_video_description(&history).as_deref(),
            Some("a cat juggling")
        );
    }

    #[test]
    fn no_video_no_description() {
        let history = vec![turn(1, Role::User, "text only", vec![])];
        assert_eq!(find_video_description(&history), None);
    }

    #[test]
    fn description_must_follow_the_video() {
        let history = vec![
            turn(1, Role::Model, "earlier reply", vec![]),
            turn(2, Role::User, "відео", vec![MediaPart::inline(MediaKind::Video, "video/mp4", "V")]),
        ];
        assert_eq!(find_video_description(&history), None);
    }

    #[test]
    fn strip_meta_removes_prefix_line() {
        assert_eq!(strip_meta("[meta] chat_id=\"1\"\nhello"), "hello");
        assert_eq!(strip_meta("plain"), "plain");
    }

    #[test]
    fn excerpt_truncates_with_ellipsis() {
        assert_eq!(excerpt("hello", 10), "hello");
        let long = "х".repeat(50);
        let cut = excerpt(&long, 10);
        assert!(cut.ends_with('…'));
        assert_eq!(cut.chars().count(), 11);
    }

    #[test]
    fn turn_to_content_maps_roles_and_media() {
        let t = turn(1, Role::Model, "відповідь", vec![]);
        let c = turn_to_content(&t);
        assert_eq!(c.role, ContentRole::Model);
        let t = turn(
            2,
            Role::User,
            "фото",
            vec![MediaPart::inline(MediaKind::Image, "image/png", "A")],
        );
        let c = turn_to_content(&t);
        assert_eq!(c.role, ContentRole::User);
        assert_eq!(c.parts.len(), 2);
    }
}
