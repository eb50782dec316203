//! Broker signing key material and enveloped XML signing.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;

use crate::error::{IdpError, IdpResult};
use crate::xml::canonicalize;

/// The broker's signing key pair and certificate.
#[derive(Clone)]
pub struct SigningCredentials {
    private_key: PKey<Private>,
    certificate: X509,
}

impl SigningCredentials {
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> IdpResult<Self> {
        let certificate = X509::from_pem(certificate_pem.as_bytes())
            .map_err(|e| IdpError::TokenGenerationFailed(format!("invalid certificate: {e}")))?;
        let private_key = PKey::private_key_from_pem(private_key_pem.as_bytes())
            .map_err(|e| IdpError::TokenGenerationFailed(format!("invalid private key: {e}")))?;
        Ok(Self {
            private_key,
            certificate,
        })
    }

    /// RSA-SHA256 signature over the given bytes.
    pub fn sign_sha256(&self, data: &[u8]) -> IdpResult<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.private_key)
            .map_err(|e| IdpError::TokenGenerationFailed(format!("signer creation: {e}")))?;
        signer
            .sign_oneshot_to_vec(data)
            .map_err(|e| IdpError::TokenGenerationFailed(format!("signing failed: {e}")))
    }

    /// Certificate in base64 DER for embedding in KeyInfo.
    pub fn certificate_base64_der(&self) -> IdpResult<String> {
        let der = self
            .certificate
            .to_der()
            .map_err(|e| IdpError::TokenGenerationFailed(format!("certificate DER: {e}")))?;
        Ok(BASE64.encode(der))
    }

    #[must_use]
    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials").finish_non_exhaustive()
    }
}

/// Sign one element of `xml` with an enveloped RSA-SHA256 signature.
///
/// The element is located by its ID attribute, digested after exclusive
/// C14N, and the resulting `ds:Signature` is inserted directly after the
/// element's closing `</saml:Issuer>` tag as SAML processors expect.
pub fn sign_enveloped(
    credentials: &SigningCredentials,
    xml: &str,
    element_id: &str,
) -> IdpResult<String> {
    let id_pattern = format!("ID=\"{element_id}\"");
    let id_pos = xml.find(&id_pattern).ok_or_else(|| {
        IdpError::TokenGenerationFailed(format!("cannot find element {element_id}"))
    })?;

    let element_start = xml[..id_pos].rfind('<').unwrap_or(0);
    let tag_name = xml[element_start..]
        .trim_start_matches('<')
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();
    let close_tag = format!("</{tag_name}>");
    let element_end = xml[element_start..]
        .find(&close_tag)
        .map(|pos| element_start + pos + close_tag.len())
        .ok_or_else(|| {
            IdpError::TokenGenerationFailed(format!("cannot find end of {tag_name}"))
        })?;
    let element = &xml[element_start..element_end];

    let canonical_element = canonicalize(element)?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical_element.as_bytes())
        .map_err(|e| IdpError::TokenGenerationFailed(format!("digest failed: {e}")))?;
    let digest_b64 = BASE64.encode(digest);

    let mut signed_info = String::new();
    signed_info.push_str("<ds:SignedInfo xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">");
    signed_info.push_str(
        "<ds:CanonicalizationMethod Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"/>",
    );
    signed_info.push_str(
        "<ds:SignatureMethod Algorithm=\"http://www.w3.org/2001/04/xmldsig-more#rsa-sha256\"/>",
    );
    signed_info.push_str("<ds:Reference URI=\"#");
    signed_info.push_str(element_id);
    signed_info.push_str("\">");
    signed_info.push_str("<ds:Transforms>");
    signed_info.push_str(
        "<ds:Transform Algorithm=\"http://www.w3.org/2000/09/xmldsig#enveloped-signature\"/>",
    );
    signed_info.push_str("<ds:Transform Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"/>");
    signed_info.push_str("</ds:Transforms>");
    signed_info
        .push_str("<ds:DigestMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#sha256\"/>");
    signed_info.push_str("<ds:DigestValue>");
    signed_info.push_str(&digest_b64);
    signed_info.push_str("</ds:DigestValue>");
    signed_info.push_str("</ds:Reference>");
    signed_info.push_str("</ds:SignedInfo>");

    let canonical_signed_info = canonicalize(&signed_info)?;
    let signature = credentials.sign_sha256(canonical_signed_info.as_bytes())?;
    let signature_b64 = BASE64.encode(&signature);
    let certificate_b64 = credentials.certificate_base64_der()?;

    let mut signature_xml =
        String::from("<ds:Signature xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">");
    signature_xml.push_str(&signed_info);
    signature_xml.push_str("<ds:SignatureValue>");
    signature_xml.push_str(&signature_b64);
    signature_xml.push_str("</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>");
    signature_xml.push_str(&certificate_b64);
    signature_xml.push_str("</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>");

    // Insert after the element's own Issuer, not the outer document's.
    let after_issuer = xml[element_start..]
        .find("</saml:Issuer>")
        .map(|pos| element_start + pos + "</saml:Issuer>".len())
        .ok_or_else(|| {
            IdpError::TokenGenerationFailed("cannot find Issuer in signed element".to_string())
        })?;

    let mut result = String::with_capacity(xml.len() + signature_xml.len());
    result.push_str(&xml[..after_issuer]);
    result.push_str(&signature_xml);
    result.push_str(&xml[after_issuer..]);
    Ok(result)
}
