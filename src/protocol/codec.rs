//! Wire codec for SAML front-channel bindings.
//!
//! Inbound messages arrive base64-encoded, deflate-compressed on the
//! redirect binding. Outbound messages are described as delivery
//! instructions so the HTTP layer stays out of this crate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{IdpError, IdpResult};

/// Maximum encoded size on the redirect binding (128 KB)
const MAX_ENCODED_SIZE_REDIRECT: usize = 128 * 1024;

/// Maximum encoded size on the POST binding (512 KB)
const MAX_ENCODED_SIZE_POST: usize = 512 * 1024;

/// Maximum decompressed size (64 KB) to stop deflate bombs
const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024;

/// Root element of a decoded SAML message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamlMessageKind {
    AuthnRequest,
    LogoutRequest,
    LogoutResponse,
}

/// How a response leaves the broker. The transport layer executes these
/// without knowing anything about SAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryInstruction {
    /// Auto-submitting form POST to `url` with the given fields.
    Post {
        url: String,
        fields: Vec<(String, String)>,
    },
    /// 302 redirect to the fully assembled URL.
    Redirect { url: String },
}

impl DeliveryInstruction {
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Post { url, .. } | Self::Redirect { url } => url,
        }
    }
}

/// Decode a message from the redirect binding (base64 then inflate).
///
/// Intermediaries sometimes re-decode `+` in the base64 payload into a
/// space before it reaches us. When the first decode fails, retry once
/// with spaces folded back to `+`.
pub fn decode_redirect_message(encoded: &str) -> IdpResult<String> {
    if encoded.len() > MAX_ENCODED_SIZE_REDIRECT {
        return Err(IdpError::DecodeFailed(format!(
            "encoded message exceeds maximum size ({} > {} bytes)",
            encoded.len(),
            MAX_ENCODED_SIZE_REDIRECT
        )));
    }

    let decoded = match BASE64.decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) if encoded.contains(' ') => BASE64
            .decode(encoded.replace(' ', "+"))
            .map_err(|e| IdpError::DecodeFailed(format!("base64 decode failed: {e}")))?,
        Err(e) => return Err(IdpError::DecodeFailed(format!("base64 decode failed: {e}"))),
    };

    inflate_bounded(&decoded)
}

/// Decode a message from the POST binding (base64 only).
pub fn decode_post_message(encoded: &str) -> IdpResult<String> {
    if encoded.len() > MAX_ENCODED_SIZE_POST {
        return Err(IdpError::DecodeFailed(format!(
            "encoded message exceeds maximum size ({} > {} bytes)",
            encoded.len(),
            MAX_ENCODED_SIZE_POST
        )));
    }
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| IdpError::DecodeFailed(format!("base64 decode failed: {e}")))?;
    String::from_utf8(decoded).map_err(|e| IdpError::DecodeFailed(format!("invalid UTF-8: {e}")))
}

fn inflate_bounded(compressed: &[u8]) -> IdpResult<String> {
    let decoder = DeflateDecoder::new(compressed);
    let mut xml = String::new();
    decoder
        .take(MAX_DECOMPRESSED_SIZE)
        .read_to_string(&mut xml)
        .map_err(|e| IdpError::DecodeFailed(format!("deflate decode failed: {e}")))?;
    if xml.len() as u64 >= MAX_DECOMPRESSED_SIZE {
        return Err(IdpError::DecodeFailed(
            "decompressed message exceeds maximum size (64 KB)".to_string(),
        ));
    }
    Ok(xml)
}

/// Identify which SAML message the XML carries from its root element.
pub fn detect_kind(xml: &str) -> IdpResult<SamlMessageKind> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let local = e.local_name();
                return match std::str::from_utf8(local.as_ref()).unwrap_or("") {
                    "AuthnRequest" => Ok(SamlMessageKind::AuthnRequest),
                    "LogoutRequest" => Ok(SamlMessageKind::LogoutRequest),
                    "LogoutResponse" => Ok(SamlMessageKind::LogoutResponse),
                    other => Err(IdpError::DecodeFailed(format!(
                        "unexpected root element: {other}"
                    ))),
                };
            }
            Ok(Event::Eof) => {
                return Err(IdpError::DecodeFailed("empty document".to_string()));
            }
            Err(e) => {
                return Err(IdpError::DecodeFailed(format!("XML parse error: {e}")));
            }
            _ => {}
        }
    }
}

/// Form-POST delivery of a SAML message.
#[must_use]
pub fn post_delivery(
    url: &str,
    parameter: &str,
    xml: &str,
    relay_state: Option<&str>,
) -> DeliveryInstruction {
    let mut fields = vec![(parameter.to_string(), BASE64.encode(xml.as_bytes()))];
    if let Some(rs) = relay_state {
        fields.push(("RelayState".to_string(), rs.to_string()));
    }
    DeliveryInstruction::Post {
        url: url.to_string(),
        fields,
    }
}

/// Redirect delivery of a SAML message (deflate, base64, url-encode).
pub fn redirect_delivery(
    url: &str,
    parameter: &str,
    xml: &str,
    relay_state: Option<&str>,
) -> IdpResult<DeliveryInstruction> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .and_then(|()| encoder.finish())
        .map_err(|e| IdpError::InternalError(format!("deflate encode failed: {e}")))
        .map(|compressed| {
            let encoded = BASE64.encode(compressed);
            let separator = if url.contains('?') { '&' } else { '?' };
            let mut full = format!(
                "{url}{separator}{parameter}={}",
                urlencoding::encode(&encoded)
            );
            if let Some(rs) = relay_state {
                full.push_str("&RelayState=");
                full.push_str(&urlencoding::encode(rs));
            }
            DeliveryInstruction::Redirect { url: full }
        })
}
