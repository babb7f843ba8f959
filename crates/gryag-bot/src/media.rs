//! Inbound media: download Telegram attachments and wrap them as media
//! parts for the turn log and the LLM request.

use base64::Engine;
use teloxide::net::Download;
use teloxide::prelude::*;
use tracing::warn;

use gryag_context::{MediaKind, MediaPart};

/// 20 MB, the Bot API download ceiling.
const MAX_DOWNLOAD_BYTES: u32 = 20 * 1024 * 1024;

/// Extract every supported attachment on a message, ordered as Telegram
/// presents them. Oversized or failed downloads are skipped with a warning.
pub async fn extract_media(bot: &Bot, msg: &Message) -> Vec<MediaPart> {
    let mut parts = Vec::new();

    if let Some(photos) = msg.photo() {
        // Highest resolution is last.
        if let Some(photo) = photos.last() {
            if let Some(part) =
                download(bot, &photo.file.id, MediaKind::Image, "image/jpeg").await
            {
                parts.push(part);
            }
        }
    }
    if let Some(sticker) = msg.sticker() {
        if let Some(part) = download(bot, &sticker.file.id, MediaKind::Image, "image/webp").await {
            parts.push(part);
        }
    }
    if let Some(voice) = msg.voice() {
        let mime = voice
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "audio/ogg".to_string());
        if let Some(part) = download(bot, &voice.file.id, MediaKind::Audio, &mime).await {
            parts.push(part);
        }
    }
    if let Some(audio) = msg.audio() {
        let mime = audio
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "audio/mpeg".to_string());
        if let Some(part) = download(bot, &audio.file.id, MediaKind::Audio, &mime).await {
            parts.push(part);
        }
    }
    if let Some(video) = msg.video() {
        let mime = video
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "video/mp4".to_string());
        if let Some(part) = download(bot, &video.file.id, MediaKind::Video, &mime).await {
            parts.push(part);
        }
    }
    if let Some(note) = msg.video_note() {
        if let Some(part) = download(bot, &note.file.id, MediaKind::Video, "video/mp4").await {
            parts.push(part);
        }
    }
    if let Some(animation) = msg.animation() {
        if let Some(part) = download(bot, &animation.file.id, MediaKind::Video, "video/mp4").await {
            parts.push(part);
        }
    }
    if let Some(doc) = msg.document() {
        let mime = doc
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        if let Some(part) = download(bot, &doc.file.id, MediaKind::Document, &mime).await {
            parts.push(part);
        }
    }

    parts
}

async fn download(bot: &Bot, file_id: &str, kind: MediaKind, mime: &str) -> Option<MediaPart> {
    let file = match bot.get_file(file_id).await {
        Ok(f) => f,
        Err(e) => {
            warn!(file_id, error = %e, "get_file failed");
            return None;
        }
    };
    if file.size > MAX_DOWNLOAD_BYTES {
        warn!(file_id, size = file.size, "attachment exceeds download ceiling, skipping");
        return None;
    }
    let mut buf: Vec<u8> = Vec::new();
    if let Err(e) = bot.download_file(&file.path, &mut buf).await {
        warn!(file_id, error = %e, "download_file failed");
        return None;
    }
    let size = buf.len() as u64;
    let b64 = base64::engine::general_purpose::STANDARD.encode(&buf);
    let mut part = MediaPart::inline(kind, mime, b64);
    part.size = Some(size);
    Some(part)
}

/// Download a text document (used by `/gryagsetprompt` with an attached file).
pub async fn download_text_document(bot: &Bot, msg: &Message) -> Option<String> {
    let doc = msg.document()?;
    let file = bot.get_file(&doc.file.id).await.ok()?;
    if file.size > MAX_DOWNLOAD_BYTES {
        return None;
    }
    let mut buf: Vec<u8> = Vec::new();
    bot.download_file(&file.path, &mut buf).await.ok()?;
    String::from_utf8(buf).ok()
}
