use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// base64 encode a structured payload (usually an XML document).
pub fn encode_payload(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

pub fn decode_payload(payload: &str) -> Result<String, PayloadError> {
    let bytes = STANDARD.decode(payload.trim())?;
    Ok(String::from_utf8(bytes)?)
}

/// Escape a text node for inclusion in an XML payload.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text of the first `<tag>…</tag>` element, still escaped. Flat documents only.
pub fn xml_element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(&xml[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_payload_roundtrip() {
        let xml = "<HOOK_MESSAGE><HOOK_ID>42</HOOK_ID></HOOK_MESSAGE>";
        let encoded = encode_payload(xml);
        assert!(!encoded.contains(' '));
        assert_eq!(decode_payload(&encoded).unwrap(), xml);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(decode_payload("not*base64"), Err(PayloadError::Base64(_))));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(xml_escape("a<b & 'c'"), "a&lt;b &amp; &apos;c&apos;");
        assert_eq!(xml_unescape(&xml_escape("a<b & 'c' &lt;")), "a<b & 'c' &lt;");
    }

    #[test]
    fn finds_flat_elements() {
        let xml = "<R><HOOK_ID>4</HOOK_ID><ARGUMENTS>x y</ARGUMENTS><EMPTY></EMPTY></R>";
        assert_eq!(xml_element(xml, "HOOK_ID"), Some("4"));
        assert_eq!(xml_element(xml, "ARGUMENTS"), Some("x y"));
        assert_eq!(xml_element(xml, "EMPTY"), Some(""));
        assert_eq!(xml_element(xml, "MISSING"), None);
    }
}
