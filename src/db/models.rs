use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The reserved moderator account. Seeded once, never deleted.
pub const ADMIN_USERNAME: &str = "admin";

/// Author name recorded on comments left without a session.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRegistration {
    pub username: String,
    pub password_hash: String,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub requested_at: DateTime<Utc>,
}

impl PendingRegistration {
    /// Promote to an approved user, keeping the stored credential.
    pub fn approve(self) -> User {
        User {
            username: self.username,
            password_hash: self.password_hash,
            approved: true,
        }
    }
}

/// Client-local cache of the authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub username: String,
    pub approved: bool,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.username == ADMIN_USERNAME
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub page: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    /// Absent in legacy records; deserializes to an empty list.
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Post {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// True when the post was created on the device and never reached the
    /// remote store.
    pub fn is_local(&self) -> bool {
        self.id().map(is_local_id).unwrap_or(true)
    }
}

pub const LOCAL_ID_PREFIX: &str = "local-";

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Generate an id for a post that only exists in local storage.
pub fn local_post_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::now_v7())
}

/// Current time truncated to the millisecond resolution records are stored at.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Restrict `posts` to one page, newest first.
pub fn feed_order(page: &str, mut posts: Vec<Post>) -> Vec<Post> {
    posts.retain(|p| p.page == page);
    posts.sort_by(|a, b| b.date.cmp(&a.date));
    posts
}
