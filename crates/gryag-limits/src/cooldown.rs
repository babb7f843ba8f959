//! Shared cooldown for bot-owned commands, with warning debounce.
//!
//! One cooldown per user across every whitelisted command. On a violation the
//! user sees a notice at most once per rolling debounce window; further
//! violations inside that window are silently dropped.

use dashmap::DashMap;

const WARN_DEBOUNCE_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownVerdict {
    /// Proceed with the command.
    Allowed,
    /// Drop the command and tell the user how long is left.
    WarnAndDrop { retry_after_secs: u64 },
    /// Drop the command silently (a warning was already sent recently).
    SilentDrop,
}

pub struct CommandCooldown {
    cooldown_secs: i64,
    enabled: bool,
    last_used: DashMap<i64, i64>,
    last_warned: DashMap<i64, i64>,
}

impl CommandCooldown {
    pub fn new(cooldown_secs: u64, enabled: bool) -> Self {
        Self {
            cooldown_secs: cooldown_secs as i64,
            enabled,
            last_used: DashMap::new(),
            last_warned: DashMap::new(),
        }
    }

    /// Gate one command invocation. `is_admin` bypasses entirely.
    pub fn check(&self, user_id: i64, is_admin: bool, now_ts: i64) -> CooldownVerdict {
        if !self.enabled || is_admin {
            return CooldownVerdict::Allowed;
        }

        let last = self.last_used.get(&user_id).map(|v| *v);
        match last {
            Some(prev) if now_ts - prev < self.cooldown_secs => {
                let retry_after = (prev + self.cooldown_secs - now_ts).max(1) as u64;
                let warned = self.last_warned.get(&user_id).map(|v| *v);
                match warned {
                    Some(w) if now_ts - w < WARN_DEBOUNCE_SECS => CooldownVerdict::SilentDrop,
                    _ => {
                        self.last_warned.insert(user_id, now_ts);
                        CooldownVerdict::WarnAndDrop {
                            retry_after_secs: retry_after,
                        }
                    }
                }
            }
            _ => {
                self.last_used.insert(user_id, now_ts);
                CooldownVerdict::Allowed
            }
        }
    }

    /// Clear all state (admin reset).
    pub fn reset(&self) {
        self.last_used.clear();
        self.last_warned.clear();
    }
}

/// Commands this bot owns; everything else passes through untouched so
/// commands addressed to other bots in the chat are never throttled.
pub const OWNED_COMMANDS: &[&str] = &[
    "gryag",
    "gryagban",
    "gryagunban",
    "gryagreset",
    "gryagprofile",
    "gryagfacts",
    "gryagremovefact",
    "gryagforget",
    "gryagexport",
    "gryagprompt",
    "gryagsetprompt",
    "gryagresetprompt",
    "gryagprompthistory",
    "gryagactivateprompt",
    "gryagself",
    "gryaginsights",
];

/// Parse a leading `/command[@bot]` token. Returns `(command, target_bot)`.
pub fn parse_command(text: &str) -> Option<(&str, Option<&str>)> {
    let token = text.strip_prefix('/')?.split_whitespace().next()?;
    match token.split_once('@') {
        Some((cmd, bot)) => Some((cmd, Some(bot))),
        None => Some((token, None)),
    }
}

/// Whether a command token belongs to this bot and is subject to cooldown.
pub fn is_owned_command(command: &str) -> bool {
    OWNED_COMMANDS.contains(&command)
}
