//! Addressability: is this message for the bot?
//!
//! A message is addressed when it replies to the bot, mentions it, matches a
//! keyword pattern, or arrives in a private chat. Everything else is
//! persisted for later retrieval but not answered.

use std::sync::OnceLock;

use regex::Regex;

/// Localised keyword patterns that summon the bot without a mention.
fn keyword_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\bгряг\w*").expect("static pattern"),
            Regex::new(r"(?i)\bgryag\w*").expect("static pattern"),
        ]
    })
}

/// Inputs the detector needs, already extracted from the platform update.
#[derive(Debug, Default)]
pub struct TriggerInput<'a> {
    pub text: &'a str,
    pub is_private_chat: bool,
    pub reply_to_bot: bool,
    /// Usernames from mention entities, without the leading `@`.
    pub mentions: &'a [String],
    /// User ids from text-mention entities.
    pub text_mention_ids: &'a [i64],
    pub bot_username: &'a str,
    pub bot_id: i64,
}

pub fn is_addressed(input: &TriggerInput<'_>) -> bool {
    if input.is_private_chat || input.reply_to_bot {
        return true;
    }
    if input
        .mentions
        .iter()
        .any(|m| m.eq_ignore_ascii_case(input.bot_username))
    {
        return true;
    }
    if input.text_mention_ids.contains(&input.bot_id) {
        return true;
    }
    keyword_patterns().iter().any(|re| re.is_match(input.text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base<'a>(text: &'a str) -> TriggerInput<'a> {
        TriggerInput {
            text,
            is_private_chat: false,
            reply_to_bot: false,
            mentions: &[],
            text_mention_ids: &[],
            bot_username: "gryag_bot",
            bot_id: 777,
        }
    }

    #[test]
    fn keyword_in_ukrainian_addresses_bot() {
        // Group chat, no mention — the localised keyword alone triggers.
        assert!(is_addressed(&base("агов гряг, що там?")));
        assert!(is_addressed(&base("ГРЯГУ, розкажи анекдот")));
        assert!(is_addressed(&base("hey gryag what's up")));
    }

    #[test]
    fn plain_group_chatter_is_not_addressed() {
        assert!(!is_addressed(&base("просто собі розмова")));
        assert!(!is_addressed(&base("nothing to see here")));
    }

    #[test]
    fn private_chat_always_addressed() {
        let mut input = base("будь-що");
        input.is_private_chat = true;
        assert!(is_addressed(&input));
    }

    #[test]
    fn reply_to_bot_addressed() {
        let mut input = base("ok");
        input.reply_to_bot = true;
        assert!(is_addressed(&input));
    }

    #[test]
    fn mention_entity_addressed() {
        let mentions = vec!["Gryag_Bot".to_string()];
        let mut input = base("дивись @Gryag_Bot сюди");
        input.mentions = &mentions;
        assert!(is_addressed(&input));
    }

    #[test]
    fn other_bot_mention_not_addressed() {
        let mentions = vec!["other_bot".to_string()];
        let mut input = base("дивись @other_bot сюди");
        input.mentions = &mentions;
        assert!(!is_addressed(&input));
    }

    #[test]
    fn text_mention_by_id_addressed() {
        let ids = vec![777];
        let mut input = base("той самий");
        input.text_mention_ids = &ids;
        assert!(is_addressed(&input));
    }

    #[test]
    fn keyword_must_be_word_initial() {
        assert!(!is_addressed(&base("ойгряг не рахується")));
        assert!(is_addressed(&base("гряг!")));
    }
}
