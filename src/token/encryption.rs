//! Assertion encryption for relying parties that require it.
//!
//! The assertion is encrypted with a fresh AES-256-CBC content key; the
//! content key travels inside an inline EncryptedKey under RSA-OAEP to the
//! party's encryption certificate. CipherValue carries IV||ciphertext.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::rand::rand_bytes;
use openssl::rsa::Padding;
use openssl::symm::{encrypt, Cipher};

use crate::error::{IdpError, IdpResult};
use crate::protocol::signature::parse_certificate;

pub fn encrypt_assertion(assertion_xml: &str, party_certificate: &str) -> IdpResult<String> {
    let cert = parse_certificate(party_certificate)
        .map_err(|e| IdpError::EncryptionFailed(e.to_string()))?;
    let public_key = cert
        .public_key()
        .map_err(|e| IdpError::EncryptionFailed(format!("certificate key: {e}")))?;
    let rsa = public_key
        .rsa()
        .map_err(|e| IdpError::EncryptionFailed(format!("not an RSA certificate: {e}")))?;

    let mut content_key = [0u8; 32];
    let mut iv = [0u8; 16];
    rand_bytes(&mut content_key)
        .and_then(|()| rand_bytes(&mut iv))
        .map_err(|e| IdpError::EncryptionFailed(format!("random generation: {e}")))?;

    let ciphertext = encrypt(
        Cipher::aes_256_cbc(),
        &content_key,
        Some(&iv),
        assertion_xml.as_bytes(),
    )
    .map_err(|e| IdpError::EncryptionFailed(format!("content encryption: {e}")))?;

    let mut cipher_value = Vec::with_capacity(iv.len() + ciphertext.len());
    cipher_value.extend_from_slice(&iv);
    cipher_value.extend_from_slice(&ciphertext);

    let mut wrapped_key = vec![0u8; rsa.size() as usize];
    let written = rsa
        .public_encrypt(&content_key, &mut wrapped_key, Padding::PKCS1_OAEP)
        .map_err(|e| IdpError::EncryptionFailed(format!("key transport: {e}")))?;
    wrapped_key.truncate(written);

    let mut xml = String::new();
    xml.push_str("<saml:EncryptedAssertion xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\">");
    xml.push_str("<xenc:EncryptedData xmlns:xenc=\"http://www.w3.org/2001/04/xmlenc#\" Type=\"http://www.w3.org/2001/04/xmlenc#Element\">");
    xml.push_str(
        "<xenc:EncryptionMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#aes256-cbc\"/>",
    );
    xml.push_str("<ds:KeyInfo xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">");
    xml.push_str("<xenc:EncryptedKey>");
    xml.push_str(
        "<xenc:EncryptionMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p\"/>",
    );
    xml.push_str("<xenc:CipherData><xenc:CipherValue>");
    xml.push_str(&BASE64.encode(&wrapped_key));
    xml.push_str("</xenc:CipherValue></xenc:CipherData>");
    xml.push_str("</xenc:EncryptedKey>");
    xml.push_str("</ds:KeyInfo>");
    xml.push_str("<xenc:CipherData><xenc:CipherValue>");
    xml.push_str(&BASE64.encode(&cipher_value));
    xml.push_str("</xenc:CipherValue></xenc:CipherData>");
    xml.push_str("</xenc:EncryptedData>");
    xml.push_str("</saml:EncryptedAssertion>");
    Ok(xml)
}
