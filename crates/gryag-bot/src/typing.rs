//! Typing indicator — refreshes `sendChatAction` every 4 seconds while the
//! pipeline runs (Telegram's status expires after ~5).

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatAction;

pub struct TypingHandle(tokio::task::JoinHandle<()>);

impl TypingHandle {
    pub fn start(bot: Bot, chat_id: ChatId) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
        });
        TypingHandle(handle)
    }

    pub fn stop(self) {
        self.0.abort();
    }
}
