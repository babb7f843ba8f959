//! The `/gryag*` admin and inspection surface.
//!
//! Replies are localized; destructive commands are admin-gated and
//! `/gryagforget` additionally requires an inline confirmation. Fact listings
//! paginate five per page through callback buttons.

use std::sync::Arc;

use serde_json::json;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Message,
};
use tracing::warn;

use gryag_memory::{EntityType, Fact, FactCategory, ForgetReason, ForgetStatus, PromptScope};

use crate::media::download_text_document;
use crate::send::send_reply;
use crate::services::BotServices;
use crate::texts;

const FACTS_PER_PAGE: usize = 5;

/// Dispatch an owned command (cooldown already checked by the caller).
pub async fn handle(bot: Bot, msg: Message, services: Arc<BotServices>, command: String) {
    let chat_id = msg.chat.id.0;
    let Some(from) = msg.from.clone() else { return };
    let caller = from.id.0 as i64;
    let is_admin = services.settings.is_admin(caller);
    let args = command_args(msg.text().or(msg.caption()).unwrap_or(""));

    let reply = match command.as_str() {
        "gryagban" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                match resolve_target(&services, &msg, &args) {
                    Some(target) => {
                        if let Err(e) = services.turns.ban_user(chat_id, target, services.now_ts())
                        {
                            warn!(error = %e, "ban failed");
                            texts::ERROR_STORAGE.to_string()
                        } else {
                            texts::BANNED_REPLY.to_string()
                        }
                    }
                    None => texts::PROFILE_UNKNOWN.to_string(),
                }
            }
        }
        "gryagunban" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                match resolve_target(&services, &msg, &args) {
                    Some(target) => match services.turns.unban_user(chat_id, target) {
                        Ok(_) => texts::UNBANNED_REPLY.to_string(),
                        Err(e) => {
                            warn!(error = %e, "unban failed");
                            texts::ERROR_STORAGE.to_string()
                        }
                    },
                    None => texts::PROFILE_UNKNOWN.to_string(),
                }
            }
        }
        "gryagreset" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                services.user_limiter.reset_all();
                services.cooldown.reset();
                texts::RESET_DONE.to_string()
            }
        }
        "gryagprofile" => {
            let target = resolve_target(&services, &msg, &args).unwrap_or(caller);
            profile_text(&services.profiles, &services.facts, chat_id, target)
        }
        "gryagfacts" => {
            let verbose = args.iter().any(|a| a == "--verbose");
            let category = args
                .iter()
                .find(|a| !a.starts_with("--") && !a.starts_with('@'))
                .and_then(|a| a.parse::<FactCategory>().ok());
            let target = resolve_target(&services, &msg, &args).unwrap_or(caller);
            let (text, keyboard) =
                facts_page(&services.facts, chat_id, target, 0, verbose, category);
            let mut request = bot.send_message(msg.chat.id, text);
            if let Some(kb) = keyboard {
                request = request.reply_markup(kb);
            }
            if let Err(e) = request.await {
                warn!(error = %e, "facts page send failed");
            }
            return;
        }
        "gryagremovefact" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                match args.first().and_then(|a| a.parse::<i64>().ok()) {
                    Some(id) => match services.facts.forget_fact(id, ForgetReason::Incorrect) {
                        Ok(ForgetStatus::Success) => texts::FACT_REMOVED.to_string(),
                        Ok(ForgetStatus::NotFound) => texts::FACT_NOT_FOUND.to_string(),
                        Err(e) => {
                            warn!(error = %e, "removefact failed");
                            texts::ERROR_STORAGE.to_string()
                        }
                    },
                    None => "Використання: /gryagremovefact <id>".to_string(),
                }
            }
        }
        "gryagforget" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                let target = resolve_target(&services, &msg, &args).unwrap_or(caller);
                let keyboard = InlineKeyboardMarkup::new(vec![vec![
                    InlineKeyboardButton::callback(
                        texts::FORGET_CONFIRM_BUTTON,
                        forget_callback_data(chat_id, target),
                    ),
                    InlineKeyboardButton::callback(texts::FORGET_CANCEL_BUTTON, "gfgx".to_string()),
                ]]);
                if let Err(e) = bot
                    .send_message(msg.chat.id, texts::FORGET_CONFIRM)
                    .reply_markup(keyboard)
                    .await
                {
                    warn!(error = %e, "forget confirm send failed");
                }
                return;
            }
        }
        "gryagexport" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                let target = resolve_target(&services, &msg, &args).unwrap_or(caller);
                match export_json(&services.profiles, &services.facts, chat_id, target) {
                    Ok(payload) => {
                        let file = InputFile::memory(payload.into_bytes())
                            .file_name(format!("profile_{target}.json"));
                        if let Err(e) = bot.send_document(msg.chat.id, file).await {
                            warn!(error = %e, "export send failed");
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "export failed");
                        texts::ERROR_STORAGE.to_string()
                    }
                }
            }
        }
        "gryagprompt" => prompt_view(&services, chat_id, args.first().map(String::as_str)),
        "gryagsetprompt" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                let (scope, chat_arg) = prompt_scope(chat_id, args.first().map(String::as_str));
                let inline = args
                    .iter()
                    .skip(if args.first().map(String::as_str) == Some("chat") { 1 } else { 0 })
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ");
                let text = if !inline.trim().is_empty() {
                    Some(inline)
                } else {
                    download_text_document(&bot, &msg).await
                };
                match text {
                    Some(prompt_text) if !prompt_text.trim().is_empty() => {
                        match services.prompts.set_prompt(scope, chat_arg, caller, &prompt_text) {
                            Ok(version) => format!("{} (версія {version})", texts::PROMPT_SET),
                            Err(e) => {
                                warn!(error = %e, "setprompt failed");
                                texts::ERROR_STORAGE.to_string()
                            }
                        }
                    }
                    _ => texts::PROMPT_EMPTY.to_string(),
                }
            }
        }
        "gryagresetprompt" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                let (scope, chat_arg) = prompt_scope(chat_id, args.first().map(String::as_str));
                match services.prompts.reset(scope, chat_arg) {
                    Ok(true) => texts::PROMPT_RESET.to_string(),
                    Ok(false) => texts::PROMPT_NO_OVERRIDE.to_string(),
                    Err(e) => {
                        warn!(error = %e, "resetprompt failed");
                        texts::ERROR_STORAGE.to_string()
                    }
                }
            }
        }
        "gryagprompthistory" => {
            let (scope, chat_arg) = prompt_scope(chat_id, args.first().map(String::as_str));
            match services.prompts.history(scope, chat_arg) {
                Ok(history) if history.is_empty() => texts::PROMPT_NO_OVERRIDE.to_string(),
                Ok(history) => {
                    let mut out = String::from("Версії промпта:\n");
                    for item in history {
                        let marker = if item.is_active { "● " } else { "○ " };
                        let preview: String = item.prompt_text.chars().take(60).collect();
                        out.push_str(&format!("{marker}v{}: {preview}\n", item.version));
                    }
                    out
                }
                Err(e) => {
                    warn!(error = %e, "prompthistory failed");
                    texts::ERROR_STORAGE.to_string()
                }
            }
        }
        "gryagactivateprompt" => {
            if !is_admin {
                texts::NOT_ADMIN.to_string()
            } else {
                let version = args.iter().find_map(|a| a.parse::<i64>().ok());
                let scope_arg = args
                    .iter()
                    .find(|a| a.as_str() == "chat")
                    .map(String::as_str);
                let (scope, chat_arg) = prompt_scope(chat_id, scope_arg);
                match version {
                    Some(v) => match services.prompts.activate_version(scope, chat_arg, v) {
                        Ok(true) => format!("Активовано версію {v}."),
                        Ok(false) => "Немає такої версії.".to_string(),
                        Err(e) => {
                            warn!(error = %e, "activateprompt failed");
                            texts::ERROR_STORAGE.to_string()
                        }
                    },
                    None => "Використання: /gryagactivateprompt <версія>".to_string(),
                }
            }
        }
        "gryagself" | "gryaginsights" => texts::SELF_LEARNING_DISABLED.to_string(),
        _ => return,
    };

    send_reply(&bot, msg.chat.id, msg.thread_id, &reply).await;
}

/// Inline-keyboard callbacks: fact pagination and forget confirmation.
pub async fn handle_callback(bot: Bot, query: CallbackQuery, services: Arc<BotServices>) {
    let Some(data) = query.data.clone() else {
        return;
    };
    let caller = query.from.id.0 as i64;
    let _ = bot.answer_callback_query(query.id.clone()).await;
    let Some(message) = query.message.as_ref() else {
        return;
    };
    let chat = message.chat().id;
    let message_id = message.id();

    match parse_callback(&data) {
        Some(Callback::ForgetCancel) => {
            let _ = bot
                .edit_message_text(chat, message_id, texts::FORGET_CANCELLED)
                .await;
        }
        Some(Callback::ForgetConfirm { chat_id, target }) => {
            if !services.settings.is_admin(caller) {
                return;
            }
            let count = services
                .facts
                .forget_all(
                    EntityType::User,
                    target,
                    &chat_id.to_string(),
                    ForgetReason::UserRequested,
                )
                .unwrap_or(0);
            let _ = bot
                .edit_message_text(chat, message_id, texts::forgotten_count(count))
                .await;
        }
        Some(Callback::FactsPage {
            chat_id,
            target,
            page,
            verbose,
            category,
        }) => {
            let (text, keyboard) =
                facts_page(&services.facts, chat_id, target, page, verbose, category);
            let mut edit = bot.edit_message_text(chat, message_id, text);
            if let Some(kb) = keyboard {
                edit = edit.reply_markup(kb);
            }
            let _ = edit.await;
        }
        None => {}
    }
}

/// Inline-keyboard callback payloads, round-tripped through their data
/// strings (`gfgx`, `gfg|…`, `gf|…`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Callback {
    ForgetCancel,
    ForgetConfirm {
        chat_id: i64,
        target: i64,
    },
    FactsPage {
        chat_id: i64,
        target: i64,
        page: usize,
        verbose: bool,
        category: Option<FactCategory>,
    },
}

fn forget_callback_data(chat_id: i64, target: i64) -> String {
    format!("gfg|{chat_id}|{target}")
}

fn facts_callback_data(
    chat_id: i64,
    target: i64,
    page: usize,
    verbose: bool,
    category: Option<FactCategory>,
) -> String {
    let cat = category.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
    let verbose = if verbose { "1" } else { "0" };
    format!("gf|{chat_id}|{target}|{page}|{verbose}|{cat}")
}

fn parse_callback(data: &str) -> Option<Callback> {
    if data == "gfgx" {
        return Some(Callback::ForgetCancel);
    }
    let fields: Vec<&str> = data.split('|').collect();
    match fields.first().copied() {
        Some("gfg") if fields.len() == 3 => Some(Callback::ForgetConfirm {
            chat_id: fields[1].parse().ok()?,
            target: fields[2].parse().ok()?,
        }),
        Some("gf") if fields.len() == 6 => Some(Callback::FactsPage {
            chat_id: fields[1].parse().ok()?,
            target: fields[2].parse().ok()?,
            page: fields[3].parse().ok()?,
            verbose: fields[4] == "1",
            category: if fields[5] == "-" {
                None
            } else {
                fields[5].parse().ok()
            },
        }),
        _ => None,
    }
}

/// Tokens after the command itself.
fn command_args(text: &str) -> Vec<String> {
    text.split_whitespace().skip(1).map(String::from).collect()
}

/// Resolve `@username` arguments or a reply target to a user id.
fn resolve_target(services: &Arc<BotServices>, msg: &Message, args: &[String]) -> Option<i64> {
    if let Some(replied) = msg.reply_to_message() {
        if let Some(user) = replied.from.as_ref() {
            return Some(user.id.0 as i64);
        }
    }
    let handle = args.iter().find(|a| a.starts_with('@'))?;
    services
        .profiles
        .find_by_username(msg.chat.id.0, handle.trim_start_matches('@'))
        .ok()
        .flatten()
}

fn profile_text(
    profiles: &gryag_memory::ProfileRepository,
    facts: &gryag_memory::FactRepository,
    chat_id: i64,
    user_id: i64,
) -> String {
    match profiles.get_user(chat_id, user_id) {
        Ok(Some(profile)) => {
            let mut out = String::new();
            let name = profile.display_name.as_deref().unwrap_or("невідомо");
            out.push_str(&format!("Профіль {name}"));
            if let Some(username) = &profile.username {
                out.push_str(&format!(" (@{username})"));
            }
            out.push('\n');
            out.push_str(&format!("Повідомлень: {}\n", profile.interaction_count));
            if let Some(summary) = &profile.summary {
                out.push_str(&format!("\n{summary}\n"));
            }
            let fact_count = facts
                .get_facts(EntityType::User, user_id, &chat_id.to_string(), None, 0.0, 100)
                .map(|f| f.len())
                .unwrap_or(0);
            out.push_str(&format!("Фактів у памʼяті: {fact_count}"));
            out
        }
        Ok(None) => texts::PROFILE_UNKNOWN.to_string(),
        Err(e) => {
            warn!(error = %e, "profile read failed");
            texts::ERROR_STORAGE.to_string()
        }
    }
}

/// One page of the fact listing plus prev/next controls.
fn facts_page(
    repo: &gryag_memory::FactRepository,
    chat_id: i64,
    target: i64,
    page: usize,
    verbose: bool,
    category: Option<FactCategory>,
) -> (String, Option<InlineKeyboardMarkup>) {
    let categories = category.map(|c| vec![c]);
    let facts: Vec<Fact> = repo
        .get_facts(
            EntityType::User,
            target,
            &chat_id.to_string(),
            categories.as_deref(),
            0.0,
            500,
        )
        .unwrap_or_default();

    if facts.is_empty() {
        return (texts::NO_FACTS.to_string(), None);
    }

    let pages = facts.len().div_ceil(FACTS_PER_PAGE);
    let page = page.min(pages - 1);
    let start = page * FACTS_PER_PAGE;
    let slice = &facts[start..(start + FACTS_PER_PAGE).min(facts.len())];

    let mut out = format!("Факти ({}), сторінка {}/{}:\n", facts.len(), page + 1, pages);
    for fact in slice {
        if verbose {
            out.push_str(&format!(
                "#{} [{}] {}: {} (впевненість {:.2}, підтверджень {}{})\n",
                fact.id,
                fact.category,
                fact.key,
                fact.value,
                fact.confidence,
                fact.evidence_count,
                if fact.legacy { ", legacy" } else { "" },
            ));
        } else {
            out.push_str(&format!("#{} {}: {}\n", fact.id, fact.key, fact.value));
        }
    }

    let mut row = Vec::new();
    if page > 0 {
        row.push(InlineKeyboardButton::callback(
            "◀",
            facts_callback_data(chat_id, target, page - 1, verbose, category),
        ));
    }
    if page + 1 < pages {
        row.push(InlineKeyboardButton::callback(
            "▶",
            facts_callback_data(chat_id, target, page + 1, verbose, category),
        ));
    }
    let keyboard = if row.is_empty() {
        None
    } else {
        Some(InlineKeyboardMarkup::new(vec![row]))
    };
    (out, keyboard)
}

fn prompt_scope(chat_id: i64, arg: Option<&str>) -> (PromptScope, Option<i64>) {
    match arg {
        Some("chat") => (PromptScope::Chat, Some(chat_id)),
        _ => (PromptScope::Global, None),
    }
}

fn prompt_view(services: &Arc<BotServices>, chat_id: i64, arg: Option<&str>) -> String {
    match arg {
        Some("default") => "Стандартний промпт вбудовано в бота.".to_string(),
        Some("chat") => match services.prompts.active(PromptScope::Chat, Some(chat_id)) {
            Ok(Some(active)) => format!("Промпт чату (v{}):\n{}", active.version, active.prompt_text),
            Ok(None) => texts::PROMPT_NO_OVERRIDE.to_string(),
            Err(_) => texts::ERROR_STORAGE.to_string(),
        },
        _ => match services.prompts.resolve(chat_id) {
            Ok(Some(text)) => format!("Активний промпт:\n{text}"),
            Ok(None) => "Діє стандартний промпт.".to_string(),
            Err(_) => texts::ERROR_STORAGE.to_string(),
        },
    }
}

fn export_json(
    profiles: &gryag_memory::ProfileRepository,
    facts: &gryag_memory::FactRepository,
    chat_id: i64,
    target: i64,
) -> gryag_core::Result<String> {
    let profile = profiles.get_user(chat_id, target)?;
    let facts = facts.get_facts(
        EntityType::User,
        target,
        &chat_id.to_string(),
        None,
        0.0,
        1000,
    )?;
    let payload = json!({
        "user_id": target,
        "chat_id": chat_id,
        "profile": profile,
        "facts": facts,
    });
    Ok(serde_json::to_string_pretty(&payload)?)
}
