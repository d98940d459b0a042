//! Creating and verifying HTTP signatures.
//!
//! Outbound requests are signed with RSA-SHA256 over
//! `(request-target) host date digest` (digest omitted for GETs), with
//! `keyId` set to `<user_url>#main-key`. Inbound verification rebuilds the
//! signing string from the headers named in the `Signature` header and checks
//! it against the sender's published key.

use crate::error::AppError;
use crate::protocol::ActorDoc;
use crate::retriever::ActorRetriever;
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use http::{HeaderMap, HeaderValue, Method, Uri};
use regex::Regex;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// `Digest` header value for a request body.
pub fn build_digest_header(body: &[u8]) -> String {
    format!("SHA-256={}", Base64.encode(Sha256::digest(body)))
}

/// Builds the `Signature` header for an outbound request. `digest` is the
/// value of the `Digest` header when the request has a body.
pub fn build_signature_header(
    priv_key: &RsaPrivateKey,
    key_id: &str,
    method: &Method,
    path_and_query: &str,
    host: &str,
    date: &str,
    digest: Option<&str>,
) -> Result<String, AppError> {
    let mut names = vec!["(request-target)", "host", "date"];
    let mut lines = vec![
        format!(
            "(request-target): {} {}",
            method.as_str().to_lowercase(),
            path_and_query
        ),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    if let Some(digest) = digest {
        names.push("digest");
        lines.push(format!("digest: {}", digest));
    }
    let signing_string = lines.join("\n");

    let hashed = Sha256::digest(signing_string.as_bytes());
    let signature = priv_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
        .map_err(AppError::internal)?;

    Ok(format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        names.join(" "),
        Base64.encode(signature)
    ))
}

/// The parsed fields of an inbound `Signature` header.
#[derive(Debug, Clone)]
pub struct SignatureFields {
    pub key_id: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

/// Splits a `Signature` header into its `name="value"` fields. Returns `None`
/// when `keyId` or `signature` is missing or the signature is not base64.
pub fn parse_signature_header(value: &str) -> Option<SignatureFields> {
    let re = Regex::new("([A-Za-z]+)=\"([^\"]*)\"").expect("static regex");
    let mut key_id = None;
    let mut headers = None;
    let mut signature = None;
    for caps in re.captures_iter(value) {
        let val = caps.get(2)?.as_str();
        match caps.get(1)?.as_str() {
            "keyId" => key_id = Some(val.to_owned()),
            "headers" => headers = Some(val.split(' ').map(str::to_owned).collect()),
            "signature" => signature = Some(Base64.decode(val).ok()?),
            _ => {}
        }
    }
    Some(SignatureFields {
        key_id: key_id?,
        // per the signature draft, a missing headers list means just the date
        headers: headers.unwrap_or_else(|| vec!["date".to_owned()]),
        signature: signature?,
    })
}

/// Verifies an inbound request signature against a public key PEM. The `Err`
/// value is a caller-visible problem description.
pub fn verify_request(
    fields: &SignatureFields,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    public_key_pem: &str,
) -> Result<(), String> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");

    let mut lines = Vec::with_capacity(fields.headers.len());
    for name in &fields.headers {
        if name == "(request-target)" {
            lines.push(format!(
                "(request-target): {} {}",
                method.as_str().to_lowercase(),
                path_and_query
            ));
        } else if name.starts_with('(') {
            return Err(format!("Unsupported pseudo-header in signature: {}", name));
        } else {
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| format!("Signed header missing from request: {}", name))?;
            lines.push(format!("{}: {}", name, value));
        }
    }
    let signing_string = lines.join("\n");
    debug!(%signing_string, "verifying signature");

    let public_key = parse_public_key_pem(public_key_pem)?;
    let hashed = Sha256::digest(signing_string.as_bytes());
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &fields.signature)
        .map_err(|e| format!("Incorrect signature: {}", e))
}

/// Accepts both SPKI (`BEGIN PUBLIC KEY`) and PKCS#1 (`BEGIN RSA PUBLIC KEY`)
/// encodings; the fediverse serves both.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, String> {
    if pem.contains("BEGIN RSA PUBLIC KEY") {
        RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| format!("Failed to parse public key: {}", e))
    } else {
        RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| format!("Failed to parse public key: {}", e))
    }
}

/// Verifies the body of an inbox request against the `Digest` header.
pub fn verify_body_digest(
    digest_header: Option<&HeaderValue>,
    body: &[u8],
) -> Result<(), String> {
    let header = digest_header
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| "Missing or invalid 'Digest' header".to_owned())?;
    let expected = Base64.encode(Sha256::digest(body));
    for part in header.split(',') {
        let mut iter = part.splitn(2, '=');
        let (alg, value) = match (iter.next(), iter.next()) {
            (Some(alg), Some(value)) => (alg.trim(), value),
            _ => return Err("Malformed 'Digest' header".to_owned()),
        };
        if !alg.eq_ignore_ascii_case("sha-256") {
            continue;
        }
        if value == expected {
            return Ok(());
        }
        return Err("Body does not match 'Digest' header".to_owned());
    }
    Err("No SHA-256 digest in 'Digest' header".to_owned())
}

/// Outcome of checking an inbound request's signature.
pub enum SigCheckOutcome {
    /// Signature verified; here is the sender's actor document.
    Verified(Box<ActorDoc>),
    /// Caller-visible protocol problem; rejected as 401.
    Problem(String),
}

/// Verifies inbound signatures, binding the signing key to the activity's
/// actor: the `keyId` must start with the actor URL.
pub struct SigChecker {
    retriever: Arc<dyn ActorRetriever>,
}

impl SigChecker {
    pub fn new(retriever: Arc<dyn ActorRetriever>) -> SigChecker {
        SigChecker { retriever }
    }

    pub async fn check(
        &self,
        actor: &str,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<SigCheckOutcome, AppError> {
        let Some(sig_header) = headers.get("signature").and_then(|v| v.to_str().ok()) else {
            return Ok(SigCheckOutcome::Problem(
                "Missing or invalid 'Signature' header".to_owned(),
            ));
        };
        let Some(fields) = parse_signature_header(sig_header) else {
            return Ok(SigCheckOutcome::Problem(
                "Cannot parse 'Signature' header".to_owned(),
            ));
        };

        if !fields.key_id.starts_with(actor) {
            return Ok(SigCheckOutcome::Problem(format!(
                "Actor is not a prefix of keyId; actor: {}, keyId: {}",
                actor, fields.key_id
            )));
        }

        let sender = match self.retriever.retrieve(actor).await {
            Ok(doc) => doc,
            Err(err) => {
                return Ok(SigCheckOutcome::Problem(format!(
                    "Failed to retrieve actor document: {}: {}",
                    actor, err
                )))
            }
        };

        if let Err(problem) = verify_request(
            &fields,
            method,
            uri,
            headers,
            &sender.public_key.public_key_pem,
        ) {
            return Ok(SigCheckOutcome::Problem(problem));
        }
        Ok(SigCheckOutcome::Verified(Box::new(sender)))
    }
}
