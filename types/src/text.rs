//! Small pure text helpers.

/// Keep at most `max` characters of `raw`, without any marker.
///
/// Counts `char`s, not bytes, so multi-byte scalar values are never split.
/// Used for diagnostic excerpts where the cut point itself carries no meaning.
#[must_use]
pub fn take_chars(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

/// Truncate a string to a maximum length, adding `...` if needed.
///
/// - Trims surrounding whitespace before truncating.
/// - The ellipsis counts toward `max`.
/// - Enforces a minimum `max` of 3 so the ellipsis fits.
#[must_use]
pub fn truncate_with_ellipsis(raw: &str, max: usize) -> String {
    let max = max.max(3);
    let trimmed = raw.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    format!("{}...", take_chars(trimmed, max - 3))
}
