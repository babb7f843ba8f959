//! Outbound message helpers.
//!
//! Telegram caps messages at 4096 characters; we split at 4090 for safety,
//! keeping fenced code blocks intact across chunk boundaries. Each chunk is
//! converted to Telegram HTML; when Telegram rejects the parse mode the chunk
//! is re-sent as plain text.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode, ThreadId};
use tracing::warn;

use crate::format::to_telegram_html;

const CHUNK_MAX: usize = 4090;

/// Code-fence-aware splitter. When a split lands inside a fenced block the
/// fence is closed before the boundary and re-opened in the next chunk.
pub fn split_chunks_smart(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in &lines {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > CHUNK_MAX {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(ref lang) = fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current.push('\n');
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after_fence) = trimmed.strip_prefix("```") {
            if fence_lang.is_some() {
                fence_lang = None;
            } else {
                fence_lang = Some(after_fence.trim().to_string());
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    // Safety net: force-split any single line longer than the cap.
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= CHUNK_MAX {
            result.push(chunk);
        } else {
            let mut remaining = chunk.as_str();
            while remaining.len() > CHUNK_MAX {
                let mut split_at = remaining[..CHUNK_MAX]
                    .rfind('\n')
                    .or_else(|| remaining[..CHUNK_MAX].rfind(' '))
                    .unwrap_or(CHUNK_MAX);
                while !remaining.is_char_boundary(split_at) {
                    split_at -= 1;
                }
                result.push(remaining[..split_at].to_string());
                remaining = remaining[split_at..].trim_start();
            }
            if !remaining.is_empty() {
                result.push(remaining.to_string());
            }
        }
    }
    result
}

/// Send a formatted reply, chunked, with plain-text fallback per chunk.
pub async fn send_reply(bot: &Bot, chat_id: ChatId, thread_id: Option<ThreadId>, text: &str) {
    let chunks = split_chunks_smart(text);
    for (i, chunk) in chunks.iter().enumerate() {
        let html = to_telegram_html(chunk);
        let mut request = bot.send_message(chat_id, &html).parse_mode(ParseMode::Html);
        if let Some(tid) = thread_id {
            request = request.message_thread_id(tid);
        }

        if request.await.is_err() {
            // HTML rejected — plain text fallback for this chunk.
            let mut plain = bot.send_message(chat_id, chunk);
            if let Some(tid) = thread_id {
                plain = plain.message_thread_id(tid);
            }
            if let Err(e) = plain.await {
                warn!(error = %e, chunk_index = i, "failed to send plain-text fallback");
            }
        }

        if i + 1 < chunks.len() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Deliver side-channel tool outputs: generated images and polls.
pub async fn send_scratch(
    bot: &Bot,
    chat_id: ChatId,
    thread_id: Option<ThreadId>,
    scratch: &gryag_tools::ScratchState,
) {
    use base64::Engine;

    for (_, b64) in &scratch.pending_images {
        match base64::engine::general_purpose::STANDARD.decode(b64) {
            Ok(bytes) => {
                let mut request = bot.send_photo(chat_id, InputFile::memory(bytes));
                if let Some(tid) = thread_id {
                    request = request.message_thread_id(tid);
                }
                if let Err(e) = request.await {
                    warn!(error = %e, "failed to send generated image");
                }
            }
            Err(e) => warn!(error = %e, "generated image is not valid base64"),
        }
    }

    if let Some(poll) = &scratch.pending_poll {
        let options: Vec<String> = poll.options.iter().cloned().collect();
        let mut request = bot
            .send_poll(chat_id, &poll.question, options)
            .is_anonymous(poll.is_anonymous);
        if let Some(tid) = thread_id {
            request = request.message_thread_id(tid);
        }
        if let Err(e) = request.await {
            warn!(error = %e, "failed to send poll");
        }
    }
}
