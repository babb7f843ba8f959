//! Media shaping before submission.
//!
//! Three passes over the outgoing `contents`:
//! 1. capability filter — parts the model can't take become a short
//!    `[media: <mime>]` text placeholder;
//! 2. video cap — over-limit videos are dropped, newest kept; when the bot
//!    previously described a dropped video, that description is appended as
//!    `[Previously about video]: …`;
//! 3. count caps — historical media beyond the historical cap and any media
//!    beyond the total cap are dropped, oldest first.

use tracing::info;

use crate::capabilities::ModelCapabilities;
use crate::types::{Content, Part};

#[derive(Debug, Clone, Copy)]
pub struct MediaLimits {
    pub total: usize,
    pub historical: usize,
    pub videos: usize,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            total: 28,
            historical: 5,
            videos: 1,
        }
    }
}

/// Apply all three passes in place. The final entry of `contents` is the
/// current message; everything before it is history.
pub fn shape_contents(
    contents: &mut [Content],
    caps: &ModelCapabilities,
    limits: &MediaLimits,
    dropped_video_description: Option<&str>,
) {
    filter_unsupported(contents, caps);
    cap_videos(contents, limits.videos, dropped_video_description);
    cap_counts(contents, limits);
}

fn filter_unsupported(contents: &mut [Content], caps: &ModelCapabilities) {
    for content in contents.iter_mut() {
        for part in content.parts.iter_mut() {
            let unsupported = (part.is_audio() && !caps.supports_audio())
                || (part.is_video() && !caps.supports_inline_video());
            if unsupported {
                let mime = part.mime().unwrap_or("unknown").to_string();
                info!("Filtered unsupported media: {mime}");
                *part = Part::Text(format!("[media: {mime}]"));
            }
        }
    }
}

/// Keep at most `max_videos` videos, preferring the newest (the current
/// message's video over historical ones). A dropped video leaves behind the
/// bot's remembered description of it, when one exists.
fn cap_videos(contents: &mut [Content], max_videos: usize, description: Option<&str>) {
    let total_videos: usize = contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter(|p| p.is_video())
        .count();
    if total_videos <= max_videos {
        return;
    }
    let mut to_drop = total_videos - max_videos;

    // Oldest first.
    for content in contents.iter_mut() {
        if to_drop == 0 {
            break;
        }
        let mut replaced = Vec::with_capacity(content.parts.len());
        for part in content.parts.drain(..) {
            if part.is_video() && to_drop > 0 {
                to_drop -= 1;
                let mime = part.mime().unwrap_or("video").to_string();
                info!("Dropped over-limit video: {mime}");
                if let Some(desc) = description {
                    replaced.push(Part::Text(format!("[Previously about video]: {desc}")));
                }
            } else {
                replaced.push(part);
            }
        }
        content.parts = replaced;
    }
}

fn cap_counts(contents: &mut [Content], limits: &MediaLimits) {
    let last = contents.len().saturating_sub(1);

    // Historical cap: media in every content but the last, oldest dropped first.
    let historical_count: usize = contents[..last]
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter(|p| p.is_media())
        .count();
    if historical_count > limits.historical {
        let mut to_drop = historical_count - limits.historical;
        for content in contents[..last].iter_mut() {
            if to_drop == 0 {
                break;
            }
            content.parts.retain(|p| {
                if p.is_media() && to_drop > 0 {
                    to_drop -= 1;
                    info!("Dropped over-limit historical media: {}", p.mime().unwrap_or("?"));
                    false
                } else {
                    true
                }
            });
        }
    }

    // Total cap across everything, history dropped before the current message.
    let total: usize = contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter(|p| p.is_media())
        .count();
    if total > limits.total {
        let mut to_drop = total - limits.total;
        for content in contents.iter_mut() {
            if to_drop == 0 {
                break;
            }
            content.parts.retain(|p| {
                if p.is_media() && to_drop > 0 {
                    to_drop -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

/// Count media parts across all contents (used by tests and invariants).
pub fn media_count(contents: &[Content]) -> usize {
    contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter(|p| p.is_media())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentRole;

    fn text(s: &str) -> Part {
        Part::Text(s.into())
    }

    fn image() -> Part {
        Part::InlineData { mime: "image/jpeg".into(), data: "A".into() }
    }

    fn video() -> Part {
        Part::InlineData { mime: "video/mp4".into(), data: "V".into() }
    }

    fn audio() -> Part {
        Part::InlineData { mime: "audio/ogg".into(), data: "O".into() }
    }

    fn content(role: ContentRole, parts: Vec<Part>) -> Content {
        Content { role, parts }
    }

    #[test]
    fn audio_filtered_for_gemma_with_placeholder() {
        let caps = ModelCapabilities::detect("gemma-3-27b-it");
        let mut contents = vec![content(
            ContentRole::User,
            vec![text("transcribe this please"), audio()],
        )];
        shape_contents(&mut contents, &caps, &MediaLimits::default(), None);
        assert_eq!(contents[0].parts.len(), 2);
        match &contents[0].parts[1] {
            Part::Text(t) => assert_eq!(t, "[media: audio/ogg]"),
            other => panic!("expected placeholder, got {other:?}"),
        }
    }

    #[test]
    fn historical_video_dropped_with_description_carryover() {
        // One current image, the reply-target video, and a prior historical
        // video the bot described as "a cat juggling".
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        let limits = MediaLimits { total: 28, historical: 5, videos: 1 };
        let mut contents = vec![
            content(ContentRole::User, vec![text("look"), video()]), // historical
            content(ContentRole::User, vec![text("current"), image(), video()]), // current + reply video
        ];
        shape_contents(&mut contents, &caps, &limits, Some("a cat juggling"));

        // Oldest video dropped; its description remains.
        assert!(contents[0].parts.iter().all(|p| !p.is_video()));
        assert!(contents[0].parts.iter().any(|p| matches!(
            p,
            Part::Text(t) if t == "[Previously about video]: a cat juggling"
        )));
        // Current message keeps its image and the reply-target video.
        assert_eq!(
            contents[1].parts.iter().filter(|p| p.is_video()).count(),
            1
        );
        assert_eq!(
            contents[1].parts.iter().filter(|p| p.is_media()).count(),
            2
        );
    }

    #[test]
    fn historical_cap_drops_oldest_first() {
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        let limits = MediaLimits { total: 28, historical: 2, videos: 5 };
        let mut contents = vec![
            content(ContentRole::User, vec![image(), image()]),
            content(ContentRole::User, vec![image()]),
            content(ContentRole::User, vec![image()]), // current
        ];
        shape_contents(&mut contents, &caps, &limits, None);
        // 3 historical → 2 allowed; the oldest content loses one.
        assert_eq!(contents[0].parts.len(), 1);
        assert_eq!(contents[1].parts.len(), 1);
        assert_eq!(contents[2].parts.len(), 1);
    }

    #[test]
    fn total_cap_enforced() {
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        let limits = MediaLimits { total: 3, historical: 10, videos: 10 };
        let mut contents = vec![
            content(ContentRole::User, vec![image(), image(), image()]),
            content(ContentRole::User, vec![image(), image()]),
        ];
        shape_contents(&mut contents, &caps, &limits, None);
        assert_eq!(media_count(&contents), 3);
        // Current message untouched; history absorbed the drops.
        assert_eq!(contents[1].parts.len(), 2);
    }

    #[test]
    fn within_limits_nothing_changes() {
        let caps = ModelCapabilities::detect("gemini-2.5-flash");
        let mut contents = vec![content(ContentRole::User, vec![text("hi"), image()])];
        shape_contents(&mut contents, &caps, &MediaLimits::default(), None);
        assert_eq!(contents[0].parts.len(), 2);
        assert_eq!(media_count(&contents), 1);
    }
}
