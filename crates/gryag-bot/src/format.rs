//! Reply formatting: model markdown → Telegram HTML.
//!
//! `**bold**`/`__bold__` → <b>, `*i*`/`_i_` → <i>, `||spoiler||` →
//! <tg-spoiler>, backtick spans → <code>, fenced blocks → <pre>. User-supplied
//! `&`, `<`, `>` are escaped first; `@username` mentions are lifted out into
//! placeholders before emphasis conversion so an underscore inside a handle
//! never turns into italics, and restored afterwards.

use std::sync::OnceLock;

use regex::Regex;

fn res() -> &'static FormatRegexes {
    static RES: OnceLock<FormatRegexes> = OnceLock::new();
    RES.get_or_init(FormatRegexes::new)
}

struct FormatRegexes {
    mention: Regex,
    fence: Regex,
    code: Regex,
    bold_stars: Regex,
    bold_under: Regex,
    spoiler: Regex,
    italic_star: Regex,
    italic_under: Regex,
}

impl FormatRegexes {
    fn new() -> Self {
        Self {
            mention: Regex::new(r"@[A-Za-z0-9_]{5,32}").expect("static pattern"),
            fence: Regex::new(r"(?s)```(?:[a-zA-Z0-9_+-]*\n)?(.*?)```").expect("static pattern"),
            code: Regex::new(r"`([^`\n]+)`").expect("static pattern"),
            bold_stars: Regex::new(r"\*\*([^*]+)\*\*").expect("static pattern"),
            bold_under: Regex::new(r"__([^_]+)__").expect("static pattern"),
            spoiler: Regex::new(r"\|\|([^|]+)\|\|").expect("static pattern"),
            italic_star: Regex::new(r"\*([^*\n]+)\*").expect("static pattern"),
            italic_under: Regex::new(r"\b_([^_\n]+)_\b").expect("static pattern"),
        }
    }
}

const PLACEHOLDER_OPEN: char = '\u{1}';
const PLACEHOLDER_CLOSE: char = '\u{2}';

/// Convert one chunk of model output to Telegram HTML.
pub fn to_telegram_html(text: &str) -> String {
    let re = res();

    // Lift mentions out so emphasis regexes never see their underscores.
    let mut mentions: Vec<String> = Vec::new();
    let protected = re
        .mention
        .replace_all(text, |caps: &regex::Captures<'_>| {
            mentions.push(caps[0].to_string());
            format!("{PLACEHOLDER_OPEN}{}{PLACEHOLDER_CLOSE}", mentions.len() - 1)
        })
        .into_owned();

    // Escape user-supplied HTML specials before any tag is introduced.
    let escaped = protected
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");

    let with_fences = re.fence.replace_all(&escaped, "<pre>$1</pre>").into_owned();
    let with_code = re.code.replace_all(&with_fences, "<code>$1</code>").into_owned();
    let with_bold = re
        .bold_stars
        .replace_all(&with_code, "<b>$1</b>")
        .into_owned();
    let with_bold = re
        .bold_under
        .replace_all(&with_bold, "<b>$1</b>")
        .into_owned();
    let with_spoiler = re
        .spoiler
        .replace_all(&with_bold, "<tg-spoiler>$1</tg-spoiler>")
        .into_owned();
    let with_italic = re
        .italic_star
        .replace_all(&with_spoiler, "<i>$1</i>")
        .into_owned();
    let with_italic = re
        .italic_under
        .replace_all(&with_italic, "<i>$1</i>")
        .into_owned();

    // Restore the mentions verbatim.
    let mut out = with_italic;
    for (i, mention) in mentions.iter().enumerate() {
        out = out.replace(
            &format!("{PLACEHOLDER_OPEN}{i}{PLACEHOLDER_CLOSE}"),
            mention,
        );
    }
    out
}
