//! Value normalisation applied identically on write and on dedup lookup.
//!
//! Two stages: (1) Unicode NFC + case-fold, trim, collapse internal
//! whitespace, strip trailing punctuation; (2) canonical-mapping lookup over
//! a data table of known aliases (locations, language names,
//! programming-language tokens). NFC runs first so composed and decomposed
//! renderings of the same text produce one collision key. Every mapping
//! target is itself a fixed point, which keeps the whole function
//! idempotent.

use unicode_normalization::UnicodeNormalization;

/// Alias → canonical form. Lookup happens after the textual cleanup stage,
/// so entries are written in already-cleaned form.
const CANONICAL: &[(&str, &str)] = &[
    // locations
    ("kiev", "kyiv"),
    ("київ", "kyiv"),
    ("києві", "kyiv"),
    ("kharkov", "kharkiv"),
    ("харків", "kharkiv"),
    ("львів", "lviv"),
    ("lvov", "lviv"),
    ("одеса", "odesa"),
    ("odessa", "odesa"),
    // natural languages
    ("українська", "ukrainian"),
    ("укр", "ukrainian"),
    ("ukr", "ukrainian"),
    ("англійська", "english"),
    ("eng", "english"),
    ("польська", "polish"),
    ("німецька", "german"),
    // programming languages
    ("js", "javascript"),
    ("ts", "typescript"),
    ("py", "python"),
    ("пітон", "python"),
    ("rustlang", "rust"),
    ("golang", "go"),
    ("c sharp", "c#"),
    ("cpp", "c++"),
];

/// Canonicalise a fact key or value for dedup comparison.
pub fn normalise(input: &str) -> String {
    let cleaned = clean(input);
    match CANONICAL.iter().find(|(alias, _)| *alias == cleaned) {
        Some((_, canonical)) => (*canonical).to_string(),
        None => cleaned,
    }
}

fn clean(input: &str) -> String {
    let composed: String = input.nfc().collect();
    let folded = composed.to_lowercase();
    let collapsed: String = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', ',', '!', '?'])
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_case_and_whitespace() {
        assert_eq!(normalise("  Hello   World  "), "hello world");
    }

    #[test]
    fn composed_and_decomposed_agree() {
        // "café" with U+00E9 vs "e" + U+0301 must share one collision key.
        let composed = "caf\u{e9}";
        let decomposed = "cafe\u{301}";
        assert_eq!(normalise(composed), normalise(decomposed));
        assert_eq!(normalise(composed), "caf\u{e9}");
        // Ukrainian ї as і + combining diaeresis.
        assert_eq!(normalise("Ки\u{456}\u{308}в"), normalise("Ки\u{457}в"));
    }

    #[test]
    fn strips_trailing_punctuation() {
        assert_eq!(normalise("loves cats."), "loves cats");
    }

    #[test]
    fn canonicalises_locations() {
        assert_eq!(normalise("Kiev"), "kyiv");
        assert_eq!(normalise("КИЇВ"), "kyiv");
        assert_eq!(normalise("Odessa"), "odesa");
    }

    #[test]
    fn canonicalises_programming_tokens() {
        assert_eq!(normalise("JS"), "javascript");
        assert_eq!(normalise("TS"), "typescript");
        assert_eq!(normalise("Py"), "python");
    }

    #[test]
    fn idempotent_for_all_table_entries() {
        for (alias, canonical) in CANONICAL {
            let once = normalise(alias);
            assert_eq!(once, *canonical);
            assert_eq!(normalise(&once), once, "not a fixed point: {canonical}");
        }
    }

    #[test]
    fn idempotent_for_arbitrary_text() {
        for s in ["  Mixed CASE text! ", "kyiv", "plain", "багато   слів тут"] {
            let once = normalise(s);
            assert_eq!(normalise(&once), once);
        }
    }
}
