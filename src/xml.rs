//! Shared XML helpers for signing and verification.

use xml_canonicalization::Canonicalizer;

use crate::error::{IdpError, IdpResult};

/// Apply Exclusive XML Canonicalization without comments.
pub fn canonicalize(xml: &str) -> IdpResult<String> {
    let mut output = Vec::new();
    Canonicalizer::read_from_str(xml)
        .write_to_writer(&mut output)
        .canonicalize(false)
        .map_err(|e| IdpError::InternalError(format!("canonicalization failed: {e}")))?;

    String::from_utf8(output)
        .map_err(|e| IdpError::InternalError(format!("canonicalized output not UTF-8: {e}")))
}

/// Escape a string for inclusion in XML text or attribute values.
#[must_use]
pub fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_escape() {
        assert_eq!(
            xml_escape(r#"a<b>&"c"'d'"#),
            "a&lt;b&gt;&amp;&quot;c&quot;&apos;d&apos;"
        );
        assert_eq!(xml_escape("plain"), "plain");
    }
}
