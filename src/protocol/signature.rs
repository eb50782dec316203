//! Inbound SAML message signature validation.
//!
//! Covers both bindings: the detached query-string signature on
//! HTTP-Redirect and the enveloped XML signature on HTTP-POST. A party may
//! publish several certificates during key rollover; validation succeeds if
//! any of them verifies the signature.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::sign::Verifier;
use openssl::x509::X509;

use crate::error::{IdpError, IdpResult};
use crate::xml::canonicalize;

pub struct SignatureValidator;

impl SignatureValidator {
    /// Validate a detached redirect-binding signature.
    ///
    /// The signed data is the query string in transmission order:
    /// `SAMLRequest=..&RelayState=..&SigAlg=..` with url-encoded values.
    pub fn validate_redirect(
        message_param: &str,
        message_value: &str,
        relay_state: Option<&str>,
        sig_alg: &str,
        signature: &str,
        certificates: &[String],
    ) -> IdpResult<()> {
        let mut signed_data = format!("{message_param}={message_value}");
        if let Some(rs) = relay_state {
            if !rs.is_empty() {
                signed_data.push_str("&RelayState=");
                signed_data.push_str(rs);
            }
        }
        signed_data.push_str("&SigAlg=");
        signed_data.push_str(sig_alg);

        let signature_bytes = BASE64.decode(signature).map_err(|e| {
            IdpError::SignatureValidationFailed(format!("invalid signature encoding: {e}"))
        })?;

        let digest = match urlencoding::decode(sig_alg)
            .map_err(|e| {
                IdpError::SignatureValidationFailed(format!("invalid SigAlg encoding: {e}"))
            })?
            .as_ref()
        {
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => MessageDigest::sha256(),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => MessageDigest::sha384(),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => MessageDigest::sha512(),
            alg => {
                return Err(IdpError::SignatureValidationFailed(format!(
                    "unsupported signature algorithm: {alg}"
                )));
            }
        };

        verify_with_any(certificates, digest, signed_data.as_bytes(), &signature_bytes)
    }

    /// Validate an enveloped XML signature: check the reference digest over
    /// the signed content (minus the Signature element), then verify the
    /// signature over the canonicalized SignedInfo.
    pub fn validate_enveloped(xml: &str, certificates: &[String]) -> IdpResult<()> {
        let sig_info = extract_signature_info(xml)?;

        verify_reference_digest(xml, &sig_info)?;

        let canonical_signed_info = canonicalize(&sig_info.signed_info)?;
        let signature_bytes = BASE64
            .decode(sig_info.signature_value.replace(['\n', '\r', ' '], ""))
            .map_err(|e| {
                IdpError::SignatureValidationFailed(format!("invalid signature encoding: {e}"))
            })?;

        verify_with_any(
            certificates,
            MessageDigest::sha256(),
            canonical_signed_info.as_bytes(),
            &signature_bytes,
        )
    }
}

fn verify_with_any(
    certificates: &[String],
    digest: MessageDigest,
    data: &[u8],
    signature: &[u8],
) -> IdpResult<()> {
    if certificates.is_empty() {
        return Err(IdpError::SignatureValidationFailed(
            "no verification certificates configured".to_string(),
        ));
    }
    for cert in certificates {
        if verify_one(cert, digest, data, signature)? {
            return Ok(());
        }
    }
    Err(IdpError::SignatureValidationFailed(
        "signature did not verify against any configured certificate".to_string(),
    ))
}

fn verify_one(
    certificate: &str,
    digest: MessageDigest,
    data: &[u8],
    signature: &[u8],
) -> IdpResult<bool> {
    let cert = parse_certificate(certificate)?;
    let public_key = cert.public_key().map_err(|e| {
        IdpError::SignatureValidationFailed(format!("invalid certificate key: {e}"))
    })?;
    let mut verifier = Verifier::new(digest, &public_key).map_err(|e| {
        IdpError::SignatureValidationFailed(format!("verifier creation failed: {e}"))
    })?;
    verifier.update(data).map_err(|e| {
        IdpError::SignatureValidationFailed(format!("signature update failed: {e}"))
    })?;
    verifier
        .verify(signature)
        .map_err(|e| IdpError::SignatureValidationFailed(format!("verification failed: {e}")))
}

/// Parse a certificate given as PEM or bare base64 DER.
pub fn parse_certificate(input: &str) -> IdpResult<X509> {
    let pem = if input.contains("-----BEGIN CERTIFICATE-----") {
        input.to_string()
    } else {
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----",
            input.trim()
        )
    };
    X509::from_pem(pem.as_bytes())
        .map_err(|e| IdpError::SignatureValidationFailed(format!("invalid certificate: {e}")))
}

struct SignatureInfo {
    signed_info: String,
    signature_value: String,
    reference_uri: String,
    digest_value: String,
}

fn extract_signature_info(xml: &str) -> IdpResult<SignatureInfo> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut in_signed_info = false;
    let mut in_signature_value = false;
    let mut in_digest_value = false;
    let mut signed_info = String::new();
    let mut signature_value = String::new();
    let mut digest_value = String::new();
    let mut reference_uri = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                if name == "SignedInfo" {
                    in_signed_info = true;
                    push_start_tag(&mut signed_info, &e);
                } else if in_signed_info {
                    push_start_tag(&mut signed_info, &e);
                } else if name == "SignatureValue" {
                    in_signature_value = true;
                } else if name == "DigestValue" {
                    in_digest_value = true;
                } else if name == "Reference" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"URI" {
                            reference_uri = attr.unescape_value().unwrap_or_default().to_string();
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                if in_signed_info {
                    signed_info.push('<');
                    signed_info.push_str(std::str::from_utf8(&e).unwrap_or(""));
                    signed_info.push_str("/>");
                }
                if name == "Reference" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"URI" {
                            reference_uri = attr.unescape_value().unwrap_or_default().to_string();
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or("");
                // Closing tags keep their namespace prefix so the rebuilt
                // SignedInfo is well formed for canonicalization.
                let qualified = std::str::from_utf8(e.name().as_ref())
                    .unwrap_or("")
                    .to_string();
                if name == "SignedInfo" && in_signed_info {
                    signed_info.push_str("</");
                    signed_info.push_str(&qualified);
                    signed_info.push('>');
                    in_signed_info = false;
                } else if in_signed_info {
                    signed_info.push_str("</");
                    signed_info.push_str(&qualified);
                    signed_info.push('>');
                } else if name == "SignatureValue" {
                    in_signature_value = false;
                } else if name == "DigestValue" {
                    in_digest_value = false;
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default();
                if in_signed_info {
                    signed_info.push_str(&text);
                } else if in_signature_value {
                    signature_value.push_str(&text);
                } else if in_digest_value {
                    digest_value.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(IdpError::SignatureValidationFailed(format!(
                    "XML parse error: {e}"
                )));
            }
            _ => {}
        }
    }

    if signed_info.is_empty() {
        return Err(IdpError::SignatureValidationFailed(
            "no SignedInfo element found".to_string(),
        ));
    }
    if signature_value.is_empty() {
        return Err(IdpError::SignatureValidationFailed(
            "no SignatureValue element found".to_string(),
        ));
    }

    Ok(SignatureInfo {
        signed_info,
        signature_value,
        reference_uri,
        digest_value,
    })
}

fn push_start_tag(out: &mut String, e: &quick_xml::events::BytesStart<'_>) {
    out.push('<');
    out.push_str(std::str::from_utf8(e).unwrap_or(""));
    out.push('>');
}

fn verify_reference_digest(xml: &str, sig_info: &SignatureInfo) -> IdpResult<()> {
    let element_id = sig_info.reference_uri.trim_start_matches('#');

    let content = if element_id.is_empty() {
        xml.to_string()
    } else {
        let id_pattern = format!("ID=\"{element_id}\"");
        let element_start = xml.find(&id_pattern).ok_or_else(|| {
            IdpError::SignatureValidationFailed(format!(
                "referenced element not found: {element_id}"
            ))
        })?;
        let open_tag_start = xml[..element_start].rfind('<').unwrap_or(0);
        let tag_name = extract_tag_name(&xml[open_tag_start..]);
        let close_tag = format!("</{tag_name}");
        let element_end = xml
            .find(&close_tag)
            .map(|pos| pos + close_tag.len() + 1)
            .ok_or_else(|| {
                IdpError::SignatureValidationFailed("cannot find element end".to_string())
            })?;
        xml[open_tag_start..element_end].to_string()
    };

    // Enveloped signature transform: the digest covers the content with the
    // Signature element removed.
    let without_signature = remove_signature_element(&content);
    let canonical = canonicalize(&without_signature)?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes())
        .map_err(|e| IdpError::SignatureValidationFailed(format!("hash failed: {e}")))?;
    let computed = BASE64.encode(digest);

    let expected = sig_info.digest_value.replace(['\n', '\r', ' '], "");
    if computed != expected {
        return Err(IdpError::SignatureValidationFailed(
            "digest mismatch".to_string(),
        ));
    }
    Ok(())
}

fn extract_tag_name(tag_start: &str) -> String {
    tag_start
        .trim_start_matches('<')
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('>')
        .to_string()
}

fn remove_signature_element(xml: &str) -> String {
    for (open, close) in [
        ("<ds:Signature", "</ds:Signature>"),
        ("<Signature", "</Signature>"),
    ] {
        if let (Some(start), Some(end)) = (xml.find(open), xml.find(close)) {
            let mut result = String::with_capacity(xml.len());
            result.push_str(&xml[..start]);
            result.push_str(&xml[end + close.len()..]);
            return result;
        }
    }
    xml.to_string()
}
