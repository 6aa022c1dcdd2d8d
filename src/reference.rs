//! Reference normalization.
//!
//! Users type the same passage many ways ("jn 3:16", "John3:16",
//! "john 3 : 16"). `normalize_reference` turns any of them into one lookup
//! key for alias matching; `canonicalize_reference` makes a best-effort
//! display spelling for items created from manual text, when the lookup
//! service is not around to supply the canonical one.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Book abbreviations and spellings mapped to their canonical name.
///
/// Keys are lowercase with no spaces or dots.
pub static BOOK_NAMES: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("gen", "Genesis"),
        ("gn", "Genesis"),
        ("genesis", "Genesis"),
        ("ex", "Exodus"),
        ("exod", "Exodus"),
        ("exodus", "Exodus"),
        ("deut", "Deuteronomy"),
        ("dt", "Deuteronomy"),
        ("deuteronomy", "Deuteronomy"),
        ("josh", "Joshua"),
        ("joshua", "Joshua"),
        ("ps", "Psalm"),
        ("psa", "Psalm"),
        ("psalm", "Psalm"),
        ("psalms", "Psalm"),
        ("prov", "Proverbs"),
        ("pr", "Proverbs"),
        ("proverbs", "Proverbs"),
        ("isa", "Isaiah"),
        ("is", "Isaiah"),
        ("isaiah", "Isaiah"),
        ("jer", "Jeremiah"),
        ("jeremiah", "Jeremiah"),
        ("mic", "Micah"),
        ("micah", "Micah"),
        ("mt", "Matthew"),
        ("matt", "Matthew"),
        ("matthew", "Matthew"),
        ("mk", "Mark"),
        ("mrk", "Mark"),
        ("mark", "Mark"),
        ("lk", "Luke"),
        ("luk", "Luke"),
        ("luke", "Luke"),
        ("jn", "John"),
        ("jhn", "John"),
        ("john", "John"),
        ("acts", "Acts"),
        ("rom", "Romans"),
        ("romans", "Romans"),
        ("1cor", "1 Corinthians"),
        ("1corinthians", "1 Corinthians"),
        ("2cor", "2 Corinthians"),
        ("2corinthians", "2 Corinthians"),
        ("gal", "Galatians"),
        ("galatians", "Galatians"),
        ("eph", "Ephesians"),
        ("ephesians", "Ephesians"),
        ("phil", "Philippians"),
        ("philippians", "Philippians"),
        ("col", "Colossians"),
        ("colossians", "Colossians"),
        ("2tim", "2 Timothy"),
        ("2timothy", "2 Timothy"),
        ("heb", "Hebrews"),
        ("hebrews", "Hebrews"),
        ("jas", "James"),
        ("james", "James"),
        ("1pet", "1 Peter"),
        ("1peter", "1 Peter"),
        ("1jn", "1 John"),
        ("1john", "1 John"),
        ("rev", "Revelation"),
        ("revelation", "Revelation"),
    ]
    .into_iter()
    .collect()
});

/// Normalize a user-typed reference into a lookup key.
///
/// Lowercases, trims, collapses whitespace, separates a book name from a
/// directly attached chapter number, removes whitespace around `:` and `-`,
/// and drops trailing punctuation. Two spellings that differ only in those
/// respects produce the same key.
#[must_use]
pub fn normalize_reference(input: &str) -> String {
    let lower = input.trim().to_lowercase();
    let mut spaced = String::with_capacity(lower.len() + 2);
    let mut prev: Option<char> = None;

    for c in lower.chars() {
        if c == '.' && prev.is_some_and(char::is_alphabetic) {
            // "jn. 3:16" -> "jn 3:16"
            prev = Some(' ');
            spaced.push(' ');
            continue;
        }
        if c.is_ascii_digit() && prev.is_some_and(char::is_alphabetic) {
            spaced.push(' ');
        }
        spaced.push(c);
        prev = Some(c);
    }

    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let tightened = collapsed
        .replace(" :", ":")
        .replace(": ", ":")
        .replace(" -", "-")
        .replace("- ", "-");

    tightened
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';'))
        .to_string()
}

/// Best-effort canonical spelling ("jn 3:16" -> "John 3:16").
///
/// Returns `None` when the book is not recognized or no chapter follows it.
#[must_use]
pub fn canonicalize_reference(input: &str) -> Option<String> {
    let key = normalize_reference(input);
    let mut parts: Vec<&str> = key.split(' ').collect();

    // Leading book number: "1 john 1:9" -> book "1john"
    let book = if parts.len() >= 3 && parts[0].chars().all(|c| c.is_ascii_digit()) {
        let number = parts.remove(0);
        format!("{number}{}", parts.remove(0))
    } else if parts.len() >= 2 {
        parts.remove(0).to_string()
    } else {
        return None;
    };

    let canonical_book = BOOK_NAMES.get(book.as_str())?;
    let location = parts.join("");
    if location.is_empty() || !location.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    Some(format!("{canonical_book} {location}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_variants_share_key() {
        let expected = "jn 3:16";
        assert_eq!(normalize_reference("jn 3:16"), expected);
        assert_eq!(normalize_reference("  JN   3 : 16 "), expected);
        assert_eq!(normalize_reference("Jn3:16"), expected);
        assert_eq!(normalize_reference("Jn. 3:16."), expected);
    }

    #[test]
    fn test_normalize_keeps_ranges() {
        assert_eq!(normalize_reference("Rom 8:28 - 30"), "rom 8:28-30");
    }

    #[test]
    fn test_canonicalize_abbreviation() {
        assert_eq!(canonicalize_reference("jn 3:16").as_deref(), Some("John 3:16"));
        assert_eq!(canonicalize_reference("ps23:1").as_deref(), Some("Psalm 23:1"));
        assert_eq!(
            canonicalize_reference("1 jn 1:9").as_deref(),
            Some("1 John 1:9")
        );
    }

    #[test]
    fn test_canonicalize_unknown_book() {
        assert_eq!(canonicalize_reference("hezekiah 1:1"), None);
        assert_eq!(canonicalize_reference("john"), None);
    }
}
