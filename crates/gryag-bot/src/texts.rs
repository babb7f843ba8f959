//! User-facing reply strings. The bot speaks Ukrainian.

pub const ERROR_GENERIC: &str = "Ой, щось пішло не так. Спробуй ще раз.";
pub const ERROR_STORAGE: &str = "База даних тимчасово не відповідає, вибач.";
pub const ERROR_QUOTA: &str = "Я сьогодні вже наговорився — спробуй трохи пізніше.";
pub const ERROR_SAFETY: &str = "Не можу відповісти на це повідомлення.";
pub const ERROR_TIMEOUT: &str = "Задумався і не встиг. Спитай ще раз.";
pub const NOT_ADMIN: &str = "Ця команда лише для адмінів.";
pub const BANNED_REPLY: &str = "Користувача заблоковано для гряга.";
pub const UNBANNED_REPLY: &str = "Користувача розблоковано.";
pub const RESET_DONE: &str = "Ліміти для цього чату скинуто.";
pub const FACT_REMOVED: &str = "Факт видалено.";
pub const FACT_NOT_FOUND: &str = "Такого факту немає.";
pub const FORGET_CONFIRM: &str = "Точно видалити всі факти? Це незворотно.";
pub const FORGET_CONFIRM_BUTTON: &str = "Так, видалити";
pub const FORGET_CANCEL_BUTTON: &str = "Скасувати";
pub const FORGET_CANCELLED: &str = "Скасовано.";
pub const PROMPT_RESET: &str = "Системний промпт скинуто до стандартного.";
pub const PROMPT_NO_OVERRIDE: &str = "Активного перекриття промпта немає.";
pub const PROMPT_SET: &str = "Новий системний промпт збережено.";
pub const PROMPT_EMPTY: &str = "Додай текст промпта після команди або файлом.";
pub const SELF_LEARNING_DISABLED: &str = "Самонавчання вимкнено в цій збірці.";
pub const PROFILE_UNKNOWN: &str = "Я ще не знаю цього користувача.";
pub const NO_FACTS: &str = "Фактів поки немає.";
pub const DONATION_REMINDER: &str =
    "Грягу подобається тут сидіти. Якщо хочеш підтримати сервер — /donate 🙏";

pub fn throttle_notice(retry_after_secs: u64) -> String {
    format!("Повільніше. Спробуй через {retry_after_secs} с.")
}

pub fn cooldown_notice(retry_after_secs: u64) -> String {
    format!("Команда на перезарядці, зачекай ще {retry_after_secs} с.")
}

pub fn forgotten_count(count: usize) -> String {
    format!("Видалено фактів: {count}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_embed_wait_time() {
        assert!(throttle_notice(42).contains("42"));
        assert!(cooldown_notice(240).contains("240"));
    }
}
