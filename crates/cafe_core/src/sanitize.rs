//! Neutralising mass mentions in bot output.

/// Insert a zero-width space after `@` in `@everyone` and `@here`
/// (any case) so Discord renders them as plain text.
pub fn sanitize_mentions(content: &str) -> String {
    let mut out = String::with_capacity(content.len() + 8);
    let mut rest = content;
    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        out.push('@');
        let after = &rest[at + 1..];
        if starts_with_ignore_case(after, "everyone") || starts_with_ignore_case(after, "here") {
            out.push('\u{200B}');
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn starts_with_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .get(..needle.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(needle))
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

/// Truncate to at most `max_units` UTF-16 code units, the measure Discord
/// applies to message and embed lengths. Never splits a character.
pub fn truncate_utf16(content: &str, max_units: usize) -> &str {
    let mut units = 0;
    for (idx, ch) in content.char_indices() {
        units += ch.len_utf16();
        if units > max_units {
            return &content[..idx];
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitizes_mass_mentions() {
        assert_eq!(
            sanitize_mentions("hi @everyone and @here"),
            "hi @\u{200B}everyone and @\u{200B}here"
        );
        assert_eq!(sanitize_mentions("@EveryOne"), "@\u{200B}EveryOne");
    }

    #[test]
    fn test_leaves_other_mentions_alone() {
        assert_eq!(sanitize_mentions("mail me @ home, @bob"), "mail me @ home, @bob");
        assert_eq!(sanitize_mentions("trailing @"), "trailing @");
        assert_eq!(sanitize_mentions("@hé"), "@hé");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("café", 3), "caf");
        assert_eq!(truncate_chars("café", 10), "café");
    }

    #[test]
    fn test_truncate_utf16_counts_surrogate_pairs() {
        // each emoji is one char but two UTF-16 units
        let emojis = "☕🍩🍩";
        assert_eq!(truncate_utf16(emojis, 5), "☕🍩🍩");
        assert_eq!(truncate_utf16(emojis, 4), "☕🍩");
        assert_eq!(truncate_utf16(emojis, 2), "☕");
        assert_eq!(truncate_utf16("café", 3), "caf");

        let long = "🍩".repeat(1500);
        let cut = truncate_utf16(&long, 2000);
        assert_eq!(cut.encode_utf16().count(), 2000);
        assert_eq!(cut.chars().count(), 1000);
    }
}
