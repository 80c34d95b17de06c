use std::sync::LazyLock;

use regex::Regex;

static SAFE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid id pattern"));
static UNSAFE_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("valid char pattern"));

/// Turns a free-text cell into a resource-id token.
///
/// Already-safe input is returned untouched. Otherwise every character outside
/// `[A-Za-z0-9_-]` becomes `_` and leading/trailing `_` runs are dropped, so
/// the result may be empty.
pub fn sanitize_id(value: &str) -> String {
    if SAFE_ID.is_match(value) {
        return value.to_string();
    }
    let replaced = UNSAFE_CHAR.replace_all(value, "_");
    replaced.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_ids_are_unchanged() {
        assert_eq!(sanitize_id("S1"), "S1");
        assert_eq!(sanitize_id("_lead-ok_"), "_lead-ok_");
    }

    #[test]
    fn unsafe_chars_are_replaced_and_trimmed() {
        assert_eq!(sanitize_id("AB 12!"), "AB_12");
        assert_eq!(sanitize_id(" patient #7 "), "patient__7");
        assert_eq!(sanitize_id("été"), "t");
        assert_eq!(sanitize_id("!!!"), "");
        assert_eq!(sanitize_id(""), "");
    }
}
