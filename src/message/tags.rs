//! IRCv3 message tag parsing.

use std::collections::HashMap;

/// Split a raw tag section (without the leading `@`) into key/value pairs.
///
/// A key without `=` maps to an empty string. Later duplicates win.
pub fn parse_tags(raw: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for part in raw.split(';').filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((key, value)) => {
                tags.insert(key.to_string(), unescape_tag_value(value));
            }
            None => {
                tags.insert(part.to_string(), String::new());
            }
        }
    }
    tags
}

/// Unescape a tag value from wire format.
///
/// `\:` `\s` `\r` `\n` `\\` decode to `;`, space, CR, LF and backslash.
/// Unknown escapes and a dangling backslash at the end of the value are
/// kept as written.
pub fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match iter.next() {
            Some(':') => unescaped.push(';'),
            Some('s') => unescaped.push(' '),
            Some('\\') => unescaped.push('\\'),
            Some('r') => unescaped.push('\r'),
            Some('n') => unescaped.push('\n'),
            Some(other) => {
                unescaped.push('\\');
                unescaped.push(other);
            }
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_known_sequences() {
        assert_eq!(unescape_tag_value("a\\:b"), "a;b");
        assert_eq!(unescape_tag_value("hello\\sworld"), "hello world");
        assert_eq!(unescape_tag_value("line\\rend"), "line\rend");
        assert_eq!(unescape_tag_value("line\\nend"), "line\nend");
        assert_eq!(unescape_tag_value("path\\\\file"), "path\\file");
    }

    #[test]
    fn test_unescape_unknown_escape_kept_verbatim() {
        assert_eq!(unescape_tag_value("a\\xb"), "a\\xb");
        assert_eq!(unescape_tag_value("\\t\\:"), "\\t;");
    }

    #[test]
    fn test_unescape_trailing_backslash() {
        assert_eq!(unescape_tag_value("test\\"), "test\\");
    }

    #[test]
    fn test_parse_tags_without_value() {
        let tags = parse_tags("draft/bot;msgid=abc");
        assert_eq!(tags.get("draft/bot").map(String::as_str), Some(""));
        assert_eq!(tags.get("msgid").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_parse_tags_splits_on_first_equals() {
        let tags = parse_tags("+example=a=b;;time=2024-01-01T00:00:00.000Z");
        assert_eq!(tags.get("+example").map(String::as_str), Some("a=b"));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_parse_tags_duplicate_key_last_wins() {
        let tags = parse_tags("k=1;k=2");
        assert_eq!(tags.get("k").map(String::as_str), Some("2"));
    }
}
