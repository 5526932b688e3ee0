//! Link identifiers
//!
//! A link carries a message id and a short secret taken from the file's
//! unique id. Two path forms are accepted:
//!
//! ```text
//! /<secret><message_id>[/<slug>]
//! /<message_id>[/<slug>]?hash=<secret>
//! ```

use crate::ApiError;
use linkstream_upstream::FileMeta;

/// Length of the link secret
pub const SECRET_LENGTH: usize = 6;

/// Parsed link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkId {
    pub message_id: u64,
    pub secret: String,
}

impl LinkId {
    /// Parse a request path and its optional `hash` query parameter.
    ///
    /// An all-digit first segment is a bare message id and takes the secret
    /// from `hash`; otherwise the segment must be the secret followed by the
    /// message id. Anything else is rejected as invalid credentials.
    pub fn parse(path: &str, hash: Option<&str>) -> Result<Self, ApiError> {
        let decoded = urlencoding::decode(path).map_err(|_| invalid("undecodable path"))?;
        let clean = decoded.trim_matches('/');
        let segment = clean.split('/').next().unwrap_or_default();

        if segment.is_empty() {
            return Err(invalid("empty link"));
        }

        if segment.bytes().all(|b| b.is_ascii_digit()) {
            let message_id = parse_id(segment)?;
            let secret = hash.unwrap_or_default();
            if secret.chars().count() != SECRET_LENGTH {
                return Err(invalid("secret length mismatch"));
            }
            return Ok(Self {
                message_id,
                secret: secret.to_string(),
            });
        }

        if segment.len() <= SECRET_LENGTH || !segment.is_ascii() {
            return Err(invalid("invalid link structure"));
        }
        let (secret, id) = segment.split_at(SECRET_LENGTH);
        if !secret.bytes().all(|b| b.is_ascii_alphanumeric()) || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("invalid link structure"));
        }
        Ok(Self {
            message_id: parse_id(id)?,
            secret: secret.to_string(),
        })
    }

    /// Link for a stored file
    pub fn for_file(message_id: u64, meta: &FileMeta) -> Self {
        Self {
            message_id,
            secret: meta.secret_prefix(SECRET_LENGTH).to_string(),
        }
    }

    /// Whether the secret matches `meta`
    pub fn matches(&self, meta: &FileMeta) -> bool {
        meta.secret_prefix(SECRET_LENGTH) == self.secret
    }

    /// Path for this link, with the file name as a readable slug.
    ///
    /// Hash-first unless the secret is all digits, which would read back as
    /// a bare message id; those links carry the secret in `?hash=`.
    pub fn to_path(&self, file_name: Option<&str>) -> String {
        let slug = file_name
            .map(|name| format!("/{}", urlencoding::encode(name)))
            .unwrap_or_default();
        if self.secret.bytes().all(|b| b.is_ascii_digit()) {
            format!("/{}{}?hash={}", self.message_id, slug, self.secret)
        } else {
            format!("/{}{}{}", self.secret, self.message_id, slug)
        }
    }
}

fn parse_id(digits: &str) -> Result<u64, ApiError> {
    digits
        .parse::<u64>()
        .map_err(|_| invalid("message id out of range"))
}

fn invalid(reason: &str) -> ApiError {
    tracing::debug!(reason, "rejected link");
    ApiError::forbidden("Invalid security credentials")
}
