use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Maximum number of characters of a bio
pub const BIO_MAX_CHARS: usize = 200;

/// A post is active for 24 hours after its creation, and expired afterwards
pub const EXPIRY_THRESHOLD: Duration = Duration::hours(24);

/// The profile of a user, as sent by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(alias = "_id")]
    pub id: String,
    /// The display name
    pub name: String,
    /// The handle, without a leading `@`
    pub username: String,
    /// Url of the avatar image
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub friends_count: usize,
}

impl User {
    /// The handle as shown on the profile, e.g. `@ada`
    pub fn handle(&self) -> String {
        format!("@{}", self.username)
    }
}

/// A post of an image
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(alias = "_id")]
    pub id: String,
    /// The id of the owning [`User`]
    pub user_id: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl PartialEq for Post {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Whether a post is still shown as current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStatus {
    Active,
    Expired,
}

impl Post {

    /// Classifies the post relative to `now`. \
    /// Exactly [`EXPIRY_THRESHOLD`] after creation the post counts as expired already.
    /// Posts created "in the future" (clock skew) are active.
    pub fn status_at(&self, now: DateTime<Utc>) -> PostStatus {
        if now - self.created_at >= EXPIRY_THRESHOLD {
            PostStatus::Expired
        } else {
            PostStatus::Active
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == PostStatus::Expired
    }

}

/// Selects the posts owned by `user_id`, keeping their order
pub fn posts_owned_by<'a>(posts: &'a [Post], user_id: &str) -> Vec<&'a Post> {
    posts.iter()
        .filter(|post| post.user_id == user_id)
        .collect_vec()
}

/// Splits posts into `(active, expired)` relative to `now`, keeping their order in both halves
pub fn partition_by_status<'a>(posts: impl IntoIterator<Item = &'a Post>, now: DateTime<Utc>) -> (Vec<&'a Post>, Vec<&'a Post>) {
    posts.into_iter().partition(|post| post.status_at(now) == PostStatus::Active)
}

/// Trims a bio and checks its length. An empty result clears the bio.
pub fn normalize_bio(bio: &str) -> anyhow::Result<&str> {
    let trimmed = bio.trim();
    let length = trimmed.chars().count();
    if length > BIO_MAX_CHARS {
        bail!("Bio is {} characters long, at most {} are allowed", length, BIO_MAX_CHARS);
    }
    Ok(trimmed)
}
