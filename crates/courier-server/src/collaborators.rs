//! Clients for the services this server depends on but does not own:
//! identity (profiles, friendships) and media (file metadata).
//!
//! Both sit behind traits so the dispatcher can be exercised against
//! in-process doubles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use courier_shared::error::{ChatError, ChatResult};
use courier_shared::types::{UserId, UserProfile};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn profile(&self, user: UserId) -> ChatResult<UserProfile>;

    async fn friend_ids(&self, user: UserId) -> ChatResult<Vec<UserId>>;

    async fn is_friend(&self, user: UserId, other: UserId) -> ChatResult<bool>;
}

/// Metadata of an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve_file(&self, file_id: &str) -> ChatResult<FileMeta>;
}

// ---------------------------------------------------------------------------
// HTTP implementations
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FriendIdsResponse {
    friend_ids: Vec<UserId>,
}

#[derive(Deserialize)]
struct IsFriendResponse {
    is_friend: bool,
}

/// Identity service over HTTP.
///
/// - `GET {base}/users/{id}` -> [`UserProfile`]
/// - `GET {base}/users/{id}/friends` -> `{"friend_ids": [...]}`
/// - `GET {base}/users/{id}/friends/{other}` -> `{"is_friend": bool}`
#[derive(Clone)]
pub struct HttpIdentity {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentity {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ChatResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl IdentityService for HttpIdentity {
    async fn profile(&self, user: UserId) -> ChatResult<UserProfile> {
        let url = format!("{}/users/{}", self.base_url, user);
        get_json(&self.client, &url, || format!("user {user} does not exist")).await
    }

    async fn friend_ids(&self, user: UserId) -> ChatResult<Vec<UserId>> {
        let url = format!("{}/users/{}/friends", self.base_url, user);
        let resp: FriendIdsResponse =
            get_json(&self.client, &url, || format!("user {user} does not exist")).await?;
        Ok(resp.friend_ids)
    }

    async fn is_friend(&self, user: UserId, other: UserId) -> ChatResult<bool> {
        let url = format!("{}/users/{}/friends/{}", self.base_url, user, other);
        let resp: IsFriendResponse =
            get_json(&self.client, &url, || format!("user {user} does not exist")).await?;
        Ok(resp.is_friend)
    }
}

/// Media service over HTTP: `GET {base}/files/{id}` -> [`FileMeta`].
#[derive(Clone)]
pub struct HttpMedia {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMedia {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ChatResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl MediaResolver for HttpMedia {
    async fn resolve_file(&self, file_id: &str) -> ChatResult<FileMeta> {
        let url = format!("{}/files/{}", self.base_url, file_id);
        get_json(&self.client, &url, || "file does not exist".to_string()).await
    }
}

fn build_client(timeout: Duration) -> ChatResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ChatError::upstream(format!("failed to build HTTP client: {e}")))
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    not_found: impl FnOnce() -> String,
) -> ChatResult<T> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| ChatError::upstream(format!("GET {url}: {e}")))?;

    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(ChatError::not_found(not_found()));
    }
    if !resp.status().is_success() {
        return Err(ChatError::upstream(format!("GET {url}: status {}", resp.status())));
    }

    resp.json::<T>()
        .await
        .map_err(|e| ChatError::upstream(format!("GET {url}: invalid body: {e}")))
}

// ---------------------------------------------------------------------------
// Profile cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedProfile {
    profile: UserProfile,
    fetched_at: DateTime<Utc>,
}

/// Caches profiles in front of another [`IdentityService`]. Friendship
/// lookups are always forwarded.
#[derive(Clone)]
pub struct CachedIdentity {
    inner: Arc<dyn IdentityService>,
    ttl: chrono::Duration,
    cache: Arc<RwLock<HashMap<UserId, CachedProfile>>>,
}

impl CachedIdentity {
    pub fn new(inner: Arc<dyn IdentityService>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn is_fresh(&self, entry: &CachedProfile, now: DateTime<Utc>) -> bool {
        now - entry.fetched_at < self.ttl
    }

    /// Drop stale entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| now - entry.fetched_at < self.ttl);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, remaining = cache.len(), "Purged expired profile cache entries");
        }
        removed
    }
}

#[async_trait]
impl IdentityService for CachedIdentity {
    async fn profile(&self, user: UserId) -> ChatResult<UserProfile> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&user) {
                if self.is_fresh(entry, Utc::now()) {
                    return Ok(entry.profile.clone());
                }
            }
        }

        let profile = self.inner.profile(user).await?;
        self.cache.write().await.insert(
            user,
            CachedProfile {
                profile: profile.clone(),
                fetched_at: Utc::now(),
            },
        );
        Ok(profile)
    }

    async fn friend_ids(&self, user: UserId) -> ChatResult<Vec<UserId>> {
        self.inner.friend_ids(user).await
    }

    async fn is_friend(&self, user: UserId, other: UserId) -> ChatResult<bool> {
        self.inner.is_friend(user, other).await
    }
}

// ---------------------------------------------------------------------------
// In-process doubles
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::StaticIdentity;
    use super::*;

    #[tokio::test]
    async fn test_profile_is_cached() {
        let inner = Arc::new(StaticIdentity::new().with_user(1, "ann"));
        let cached = CachedIdentity::new(inner.clone(), Duration::from_secs(3600));

        assert_eq!(cached.profile(UserId(1)).await.unwrap().nickname, "ann");
        assert_eq!(cached.profile(UserId(1)).await.unwrap().nickname, "ann");
        assert_eq!(inner.profile_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_refetches_and_purges() {
        let inner = Arc::new(StaticIdentity::new().with_user(1, "ann"));
        let cached = CachedIdentity::new(inner.clone(), Duration::ZERO);

        cached.profile(UserId(1)).await.unwrap();
        cached.profile(UserId(1)).await.unwrap();
        assert_eq!(inner.profile_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_missing_profile_is_not_cached() {
        let inner = Arc::new(StaticIdentity::new());
        let cached = CachedIdentity::new(inner, Duration::from_secs(60));

        let err = cached.profile(UserId(9)).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(cached.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_identity_is_upstream() {
        // Port 9 (discard) on localhost is closed in test environments.
        let http = HttpIdentity::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = http.profile(UserId(1)).await.unwrap_err();
        assert!(matches!(err, ChatError::Upstream(_)));
    }
}
