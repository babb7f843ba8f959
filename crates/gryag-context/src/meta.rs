//! Turn metadata formatting.
//!
//! A turn's metadata is rendered as a single bracketed block prepended to the
//! text stream: `[meta] chat_id="-100" user_id="42" name="Taras" …`. Key
//! order is fixed so the reliable numeric identifier always precedes the
//! ambiguous display name.

/// Structured metadata captured per incoming message.
#[derive(Debug, Clone, Default)]
pub struct TurnMeta {
    pub chat_id: Option<i64>,
    pub thread_id: Option<i64>,
    pub message_id: Option<i64>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub reply_to_user_id: Option<i64>,
    pub reply_to_username: Option<String>,
    pub reply_to_name: Option<String>,
    pub reply_to_message_id: Option<i64>,
}

const NAME_MAX: usize = 100;
const VALUE_MAX: usize = 120;

impl TurnMeta {
    /// Render the `[meta] …` block. Returns an empty string when no field is set.
    pub fn format(&self) -> String {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        push_num(&mut pairs, "chat_id", self.chat_id);
        push_num(&mut pairs, "thread_id", self.thread_id);
        push_num(&mut pairs, "message_id", self.message_id);
        push_num(&mut pairs, "user_id", self.user_id);
        push_text(&mut pairs, "username", &self.username, NAME_MAX);
        push_text(&mut pairs, "name", &self.name, NAME_MAX);
        push_num(&mut pairs, "reply_to_user_id", self.reply_to_user_id);
        push_text(&mut pairs, "reply_to_username", &self.reply_to_username, NAME_MAX);
        push_text(&mut pairs, "reply_to_name", &self.reply_to_name, NAME_MAX);
        push_num(&mut pairs, "reply_to_message_id", self.reply_to_message_id);

        if pairs.is_empty() {
            return String::new();
        }
        let body = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("[meta] {body}")
    }

    /// Metadata block plus message text, separated by a newline when both exist.
    pub fn prepend_to(&self, text: &str) -> String {
        let block = self.format();
        match (block.is_empty(), text.is_empty()) {
            (true, _) => text.to_string(),
            (false, true) => block,
            (false, false) => format!("{block}\n{text}"),
        }
    }
}

fn push_num(pairs: &mut Vec<(&'static str, String)>, key: &'static str, value: Option<i64>) {
    if let Some(v) = value {
        pairs.push((key, quote(&v.to_string(), VALUE_MAX)));
    }
}

fn push_text(
    pairs: &mut Vec<(&'static str, String)>,
    key: &'static str,
    value: &Option<String>,
    max: usize,
) {
    if let Some(v) = value {
        if !v.is_empty() {
            pairs.push((key, quote(v, max)));
        }
    }
}

/// Quote a value, escaping embedded `"` and truncating to `max` characters.
fn quote(value: &str, max: usize) -> String {
    let truncated: String = value.chars().take(max).collect();
    let escaped = truncated.replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_is_fixed() {
        let meta = TurnMeta {
            chat_id: Some(-100),
            thread_id: None,
            message_id: Some(7),
            user_id: Some(42),
            username: Some("taras_ua".into()),
            name: Some("Taras".into()),
            reply_to_user_id: Some(9),
            reply_to_username: None,
            reply_to_name: Some("Oksana".into()),
            reply_to_message_id: Some(5),
        };
        let block = meta.format();
        let positions: Vec<usize> = [
            "chat_id=", "message_id=", "user_id=", "username=", "name=",
            "reply_to_user_id=", "reply_to_name=", "reply_to_message_id=",
        ]
        .iter()
        .map(|k| block.find(k).unwrap_or_else(|| panic!("missing {k} in {block}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{block}");
        assert!(block.starts_with("[meta] "));
    }

    #[test]
    fn id_precedes_display_name() {
        let meta = TurnMeta {
            user_id: Some(42),
            name: Some("Someone".into()),
            ..Default::default()
        };
        let block = meta.format();
        assert!(block.find("user_id=").unwrap() < block.find("name=").unwrap());
    }

    #[test]
    fn quotes_are_escaped() {
        let meta = TurnMeta {
            name: Some("say \"hi\"".into()),
            ..Default::default()
        };
        assert!(meta.format().contains(r#"name="say \"hi\"""#));
    }

    #[test]
    fn names_truncate_at_100() {
        let meta = TurnMeta {
            name: Some("x".repeat(150)),
            ..Default::default()
        };
        let block = meta.format();
        // name="<100 chars>"
        let value = block.split("name=\"").nth(1).unwrap();
        assert_eq!(value.trim_end_matches('"').len(), 100);
    }

    #[test]
    fn empty_meta_formats_to_nothing() {
        let meta = TurnMeta::default();
        assert_eq!(meta.format(), "");
        assert_eq!(meta.prepend_to("hello"), "hello");
    }

    #[test]
    fn prepend_joins_with_newline() {
        let meta = TurnMeta {
            chat_id: Some(1),
            ..Default::default()
        };
        let joined = meta.prepend_to("hello");
        assert_eq!(joined, "[meta] chat_id=\"1\"\nhello");
        assert_eq!(meta.prepend_to(""), "[meta] chat_id=\"1\"");
    }
}
