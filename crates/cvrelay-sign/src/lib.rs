//! SigV4-style request signing for the relay surface and the upstream.
//!
//! The scheme signs canonical method, path, sorted query, a fixed header
//! subset, and the SHA-256 of the body, bound to a
//! `{short_date}/{region}/{service}/request` scope. Verification is
//! constant-time with respect to the signature comparison.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "HMAC-SHA256";
pub const SERVICE: &str = "cv";
pub const REQUEST_SUFFIX: &str = "request";

/// Default tolerated clock skew between signer and verifier.
pub const DEFAULT_SKEW: Duration = Duration::from_secs(5 * 60);

const SIGNED_HEADERS: &str = "content-type;host;x-content-sha256;x-date";

const X_DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const SHORT_DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year][month][day]");

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("malformed authorization header")]
    MalformedHeader,
    #[error("malformed x-date header: {0}")]
    BadDate(String),
    #[error("signing date outside the allowed skew window")]
    SkewExceeded,
    #[error("credential scope mismatch: {0}")]
    ScopeMismatch(&'static str),
    #[error("signature mismatch")]
    SignatureMismatch,
}

/// A two-part credential: public access key plus secret signing material.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// Everything that goes into one signature.
#[derive(Debug, Clone)]
pub struct SignInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Raw query pairs; canonicalization sorts and encodes them.
    pub query: &'a [(String, String)],
    pub host: &'a str,
    pub content_type: &'a str,
    pub payload: &'a [u8],
}

/// Headers a signed request must carry.
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub x_date: String,
    pub x_content_sha256: String,
    pub authorization: String,
}

/// Parsed form of an incoming `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAuthorization {
    pub access_key: String,
    pub short_date: String,
    pub region: String,
    pub service: String,
    pub signed_headers: String,
    pub signature: String,
}

pub fn format_x_date(at: OffsetDateTime) -> String {
    // The format cannot fail for a UTC instant.
    at.format(&X_DATE_FORMAT)
        .unwrap_or_else(|_| String::from("19700101T000000Z"))
}

pub fn parse_x_date(raw: &str) -> Result<OffsetDateTime, SignError> {
    time::PrimitiveDateTime::parse(raw, &X_DATE_FORMAT)
        .map(|dt| dt.assume_utc())
        .map_err(|_| SignError::BadDate(raw.to_string()))
}

/// Sign a request at `at`, returning the headers the caller must attach.
pub fn sign(
    input: &SignInput<'_>,
    credentials: &Credentials,
    region: &str,
    at: OffsetDateTime,
) -> SignatureHeaders {
    let x_date = format_x_date(at);
    let short_date = at
        .format(&SHORT_DATE_FORMAT)
        .unwrap_or_else(|_| String::from("19700101"));
    let payload_hash = hex(&Sha256::digest(input.payload));

    let canonical = canonical_request(input, &x_date, &payload_hash);
    let scope = format!("{short_date}/{region}/{SERVICE}/{REQUEST_SUFFIX}");
    let string_to_sign = format!(
        "{ALGORITHM}\n{x_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical.as_bytes()))
    );

    let key = signing_key(&credentials.secret_key, &short_date, region, SERVICE);
    let signature = hex(&hmac_bytes(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        credentials.access_key
    );

    SignatureHeaders {
        x_date,
        x_content_sha256: payload_hash,
        authorization,
    }
}

/// Parse an `Authorization` header produced by [`sign`].
pub fn parse_authorization(header: &str) -> Result<ParsedAuthorization, SignError> {
    let rest = header
        .strip_prefix(ALGORITHM)
        .ok_or(SignError::MalformedHeader)?
        .trim();

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("Credential=") {
            credential = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("SignedHeaders=") {
            signed_headers = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("Signature=") {
            signature = Some(value.to_string());
        }
    }

    let credential = credential.ok_or(SignError::MalformedHeader)?;
    let signed_headers = signed_headers.ok_or(SignError::MalformedHeader)?;
    let signature = signature.ok_or(SignError::MalformedHeader)?;

    let segments: Vec<&str> = credential.split('/').collect();
    let [access_key, short_date, region, service, suffix] = segments.as_slice() else {
        return Err(SignError::MalformedHeader);
    };
    if *suffix != REQUEST_SUFFIX || access_key.is_empty() {
        return Err(SignError::MalformedHeader);
    }

    Ok(ParsedAuthorization {
        access_key: access_key.to_string(),
        short_date: short_date.to_string(),
        region: region.to_string(),
        service: service.to_string(),
        signed_headers,
        signature,
    })
}

/// Verify a signed request against the resolved secret.
///
/// Enforces the skew window, the scope region/service binding, and the
/// signature itself; the comparison runs in constant time.
pub fn verify(
    input: &SignInput<'_>,
    auth: &ParsedAuthorization,
    x_date: &str,
    secret_key: &str,
    expected_region: &str,
    now: OffsetDateTime,
    skew: Duration,
) -> Result<(), SignError> {
    let signed_at = parse_x_date(x_date)?;
    let drift = (now - signed_at).abs();
    if drift > time::Duration::seconds_f64(skew.as_secs_f64()) {
        return Err(SignError::SkewExceeded);
    }
    if auth.region != expected_region {
        return Err(SignError::ScopeMismatch("region"));
    }
    if auth.service != SERVICE {
        return Err(SignError::ScopeMismatch("service"));
    }
    if auth.signed_headers != SIGNED_HEADERS {
        return Err(SignError::MalformedHeader);
    }
    let expected_short_date = signed_at
        .format(&SHORT_DATE_FORMAT)
        .map_err(|_| SignError::BadDate(x_date.to_string()))?;
    if auth.short_date != expected_short_date {
        return Err(SignError::ScopeMismatch("date"));
    }

    let payload_hash = hex(&Sha256::digest(input.payload));
    let canonical = canonical_request(input, x_date, &payload_hash);
    let scope = format!(
        "{}/{}/{SERVICE}/{REQUEST_SUFFIX}",
        auth.short_date, auth.region
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{x_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical.as_bytes()))
    );

    let provided = decode_hex(&auth.signature).ok_or(SignError::SignatureMismatch)?;
    let key = signing_key(secret_key, &auth.short_date, &auth.region, &auth.service);
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SignError::SignatureMismatch)?;
    mac.update(string_to_sign.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| SignError::SignatureMismatch)
}

fn canonical_request(input: &SignInput<'_>, x_date: &str, payload_hash: &str) -> String {
    let mut pairs: Vec<(String, String)> = input
        .query
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    pairs.sort();
    let canonical_query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let path = if input.path.is_empty() {
        "/"
    } else {
        input.path
    };

    format!(
        "{}\n{path}\n{canonical_query}\ncontent-type:{}\nhost:{}\nx-content-sha256:{payload_hash}\nx-date:{x_date}\n\n{SIGNED_HEADERS}\n{payload_hash}",
        input.method.to_ascii_uppercase(),
        input.content_type.trim(),
        input.host.trim(),
    )
}

fn signing_key(secret: &str, short_date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_bytes(secret.as_bytes(), short_date.as_bytes());
    let k_region = hmac_bytes(&k_date, region.as_bytes());
    let k_service = hmac_bytes(&k_region, service.as_bytes());
    hmac_bytes(&k_service, REQUEST_SUFFIX.as_bytes())
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(raw.get(i..i + 2)?, 16).ok())
        .collect()
}

fn uri_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
