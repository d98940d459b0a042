//! Canonical URL builders plus handle and text helpers shared by all
//! components. Every identifier this service mints goes through [`IdBuilder`]
//! so the URL scheme lives in exactly one place.

use crate::error::AppError;
use url::Url;

/// Maximum length of a post description included in a toot.
pub const MAX_DESCRIPTION_LEN: usize = 256;

/// Builds the canonical URLs of local actors, statuses and activities.
#[derive(Debug, Clone)]
pub struct IdBuilder {
    host: String,
}

impl IdBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        IdBuilder { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn site_url(&self) -> String {
        format!("https://{}", self.host)
    }

    pub fn activity_url(&self, id: u64) -> String {
        format!("https://{}/activity/{}", self.host, id)
    }

    pub fn shared_inbox(&self) -> String {
        format!("https://{}/inbox", self.host)
    }

    /// HTML profile page; used when a client does not ask for ActivityPub JSON.
    pub fn user_profile(&self, user: &str) -> String {
        format!("https://{}/web/feeds/{}", self.host, user)
    }

    pub fn user_url(&self, user: &str) -> String {
        format!("https://{}/u/{}", self.host, user)
    }

    pub fn user_key_id(&self, user: &str) -> String {
        format!("https://{}/u/{}#main-key", self.host, user)
    }

    pub fn user_inbox(&self, user: &str) -> String {
        format!("https://{}/u/{}/inbox", self.host, user)
    }

    pub fn user_outbox(&self, user: &str) -> String {
        format!("https://{}/u/{}/outbox", self.host, user)
    }

    pub fn user_following(&self, user: &str) -> String {
        format!("https://{}/u/{}/following", self.host, user)
    }

    pub fn user_followers(&self, user: &str) -> String {
        format!("https://{}/u/{}/followers", self.host, user)
    }

    pub fn user_status(&self, user: &str, id: u64) -> String {
        format!("https://{}/u/{}/status/{}", self.host, user, id)
    }

    pub fn user_status_activity(&self, user: &str, id: u64) -> String {
        format!("https://{}/u/{}/status/{}/activity", self.host, user, id)
    }

    /// Recovers the numeric id embedded in a status URL, if there is one.
    pub fn parse_status_id(status_url: &str) -> Option<u64> {
        let tail = status_url.rsplit("/status/").next()?;
        tail.parse().ok()
    }
}

/// Extracts the host name of an actor or inbox URL.
pub fn host_name(user_url: &str) -> Result<String, AppError> {
    let parsed = Url::parse(user_url)
        .map_err(|e| AppError::BadRequest(format!("failed to parse URL '{}': {}", user_url, e)))?;
    parsed
        .host_str()
        .map(str::to_owned)
        .ok_or_else(|| AppError::BadRequest(format!("URL has no host: {}", user_url)))
}

/// `@handle@host`, the way a fediverse user gets mentioned.
pub fn full_moniker(host: &str, handle: &str) -> String {
    format!("@{}@{}", handle, host)
}

/// Display name of a parrot account.
pub fn name_with_parrot(name: &str) -> String {
    format!("\u{1F99C} {}", name)
}

/// Truncates at the last whitespace before `max_len` characters, appending an
/// ellipsis. Input shorter than the limit is returned unchanged.
pub fn truncate_with_ellipsis(text: &str, max_len: usize) -> String {
    let mut last_space_ix = None;
    for (count, (ix, c)) in text.char_indices().enumerate() {
        if count >= max_len {
            let cut = last_space_ix.unwrap_or(ix);
            return format!("{}\u{2026}", &text[..cut]);
        }
        if c.is_whitespace() {
            last_space_ix = Some(ix);
        }
    }
    text.to_owned()
}

/// Why a string is not an acceptable parrot handle.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HandleError {
    #[error("parrot handle cannot be empty")]
    Empty,
    #[error("parrot handle must have at least one dot")]
    NoDot,
    #[error("parrot handle must have at least two non-dots")]
    TooFewNonDots,
    #[error("parrot handle must not have upper-case letters")]
    UpperCase,
}

/// Checks the invariants of a parrot handle: lowercase, at least one dot,
/// at least two non-dot characters.
pub fn validate_handle(handle: &str) -> Result<(), HandleError> {
    if handle.is_empty() {
        return Err(HandleError::Empty);
    }
    let mut n_dots = 0usize;
    let mut n_non_dots = 0usize;
    for c in handle.chars() {
        if c.is_uppercase() {
            return Err(HandleError::UpperCase);
        }
        if c == '.' {
            n_dots += 1;
        } else {
            n_non_dots += 1;
        }
    }
    if n_dots == 0 {
        return Err(HandleError::NoDot);
    }
    if n_non_dots < 2 {
        return Err(HandleError::TooFewNonDots);
    }
    Ok(())
}

/// Derives a parrot handle from a site URL: scheme stripped, every character
/// outside `[0-9a-zA-Z.-]` replaced with a dot, lowercased, runs of dots
/// collapsed.
pub fn handle_from_url(site_url: &str) -> String {
    let stripped = site_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    let mut buf = String::with_capacity(stripped.len());
    for b in stripped.bytes() {
        match b {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'.' => {
                buf.push(b.to_ascii_lowercase() as char)
            }
            _ => buf.push('.'),
        }
    }
    while buf.contains("..") {
        buf = buf.replace("..", ".");
    }
    buf
}
