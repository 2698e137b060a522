use crate::error::{ClientError, ClientResult};
use crate::store::CredentialFile;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Access/refresh token pair for the signed-in user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Exchanges a refresh token for a new credential pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> ClientResult<Credential>;
}

/// Result of asking the store for a usable token after a 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This caller performed the refresh.
    Refreshed(String),
    /// Another caller refreshed while this one waited; no network call made.
    Reused(String),
    /// No credential was ever involved, so there is nothing to refresh.
    Unavailable,
}

impl RefreshOutcome {
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Refreshed(token) | Self::Reused(token) => Some(token),
            Self::Unavailable => None,
        }
    }
}

/// Process-wide credential holder shared by every transport clone.
///
/// Reads and writes are short synchronous critical sections. Refreshes are
/// serialized through an async gate so concurrent 401s share one refresh.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    current: RwLock<Option<Credential>>,
    refresh_gate: Mutex<()>,
    file: Option<CredentialFile>,
}

impl CredentialStore {
    pub fn in_memory() -> Self {
        Self::build(None, None)
    }

    /// Store backed by a credential file; an existing pair is loaded eagerly.
    pub fn persistent(file: CredentialFile) -> ClientResult<Self> {
        let loaded = file.load()?;
        if loaded.is_some() {
            debug!(path = %file.path().display(), "loaded stored credentials");
        }
        Ok(Self::build(loaded, Some(file)))
    }

    fn build(current: Option<Credential>, file: Option<CredentialFile>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(current),
                refresh_gate: Mutex::new(()),
                file,
            }),
        }
    }

    pub fn get(&self) -> Option<Credential> {
        self.inner.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.current.read().is_some()
    }

    pub fn set(&self, credential: Credential) {
        if let Some(file) = &self.inner.file {
            if let Err(err) = file.save(&credential) {
                warn!(%err, "failed to persist credentials");
            }
        }
        *self.inner.current.write() = Some(credential);
    }

    pub fn clear(&self) {
        *self.inner.current.write() = None;
        if let Some(file) = &self.inner.file {
            if let Err(err) = file.clear() {
                warn!(%err, "failed to remove stored credentials");
            }
        }
    }

    /// Obtain a fresh access token after a request sent with `stale` was
    /// rejected as unauthorized.
    ///
    /// At most one refresh call is in flight at a time. A waiter that finds
    /// the stored token already differs from `stale` reuses it.
    pub async fn refresh_after(
        &self,
        stale: Option<&str>,
        refresher: &dyn TokenRefresher,
    ) -> ClientResult<RefreshOutcome> {
        let _gate = self.inner.refresh_gate.lock().await;

        let current = self.get();
        let refresh_token = match (current, stale) {
            (Some(current), Some(stale)) if current.access_token != stale => {
                debug!("credential refreshed by a concurrent request");
                return Ok(RefreshOutcome::Reused(current.access_token));
            }
            (Some(current), None) => {
                debug!("credential became available while request was in flight");
                return Ok(RefreshOutcome::Reused(current.access_token));
            }
            (None, Some(_)) => {
                return Err(ClientError::session_expired(
                    "credentials were cleared while the request was in flight",
                ));
            }
            (None, None) => return Ok(RefreshOutcome::Unavailable),
            (Some(current), Some(_)) => current.refresh_token,
        };

        match refresher.refresh(&refresh_token).await {
            Ok(credential) => {
                let access = credential.access_token.clone();
                self.set(credential);
                info!("access token refreshed");
                Ok(RefreshOutcome::Refreshed(access))
            }
            Err(err) => {
                warn!(%err, "token refresh failed, clearing credentials");
                self.clear();
                Err(match err {
                    ClientError::SessionExpired { reason } => ClientError::SessionExpired { reason },
                    other => ClientError::session_expired(other.to_string()),
                })
            }
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("signed_in", &self.is_signed_in())
            .field("persistent", &self.inner.file.is_some())
            .finish()
    }
}
