//! HTML escaping for values interpolated into rendered markup.
//!
//! Table and tree renderers build markup from API payloads; every value that
//! came over the wire goes through [`escape_html`] first.

use std::borrow::Cow;

/// Escape the five HTML-significant characters.
///
/// Accepts `&str` or `Option<&str>`; a missing value renders as the empty
/// string. Returns `Cow::Borrowed` when nothing needs escaping.
///
/// ```
/// use ngm_types::escape_html;
///
/// assert_eq!(escape_html("<b>A & B</b>"), "&lt;b&gt;A &amp; B&lt;/b&gt;");
/// assert_eq!(escape_html(None), "");
/// ```
#[must_use]
pub fn escape_html<'a>(input: impl Into<Option<&'a str>>) -> Cow<'a, str> {
    let Some(input) = input.into() else {
        return Cow::Borrowed("");
    };

    if !input.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}
