/// Result of a section guarded by [`CoordinationStore::with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was taken, the body ran and the lock was released.
    Acquired(T),
    /// Someone else holds the lock; the body did not run.
    Unavailable,
}

impl<T> LockOutcome<T> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Acquired(value) => Some(value),
            Self::Unavailable => None,
        }
    }
}

/// Typed client over a [`CoordinationBackend`].
///
/// Reads and writes [`ProgressRecord`]s and runs closures under exclusive,
/// auto-expiring locks owned by this node's identity.
#[derive(Clone)]
pub struct CoordinationStore {
    backend: Arc<dyn CoordinationBackend>,
    identity: String,
    lock_ttl: Duration,
}

impl CoordinationStore {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        identity: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            identity: identity.into(),
            lock_ttl,
        }
    }

    pub fn from_config(backend: Arc<dyn CoordinationBackend>, config: &FlowlogConfig) -> Self {
        Self::new(
            backend,
            config.node_identity.clone(),
            config.lock_ttl_duration(),
        )
    }

    /// Identity written into `updated_by` and used as lock holder.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn backend(&self) -> &Arc<dyn CoordinationBackend> {
        &self.backend
    }

    /// Returns the record at `path`, creating it with `default` first if absent.
    ///
    /// Concurrent callers race on creation; exactly one wins and all of them
    /// read back whatever ended up stored.
    pub async fn get_or_create(
        &self,
        path: &str,
        default: &ProgressRecord,
    ) -> Result<ProgressRecord> {
        let bytes = default.to_bytes()?;
        if self.backend.create_if_absent(path, &bytes).await? {
            event!(Level::DEBUG, path, "progress record created");
        }
        match self.backend.read(path).await? {
            Some(stored) => Ok(decode_record(path, &stored)),
            None => Err(FlowlogError::coordination(
                path,
                "record disappeared right after creation",
            )),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Option<ProgressRecord>> {
        Ok(self
            .backend
            .read(path)
            .await?
            .map(|stored| decode_record(path, &stored)))
    }

    /// Overwrites the record at `path`. Last write wins.
    pub async fn set(&self, path: &str, record: &ProgressRecord) -> Result<()> {
        let bytes = record.to_bytes()?;
        self.backend.write(path, &bytes).await
    }

    pub async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.backend.list_children(path).await
    }

    /// Runs `body` while holding the lock at `path`.
    ///
    /// Returns [`LockOutcome::Unavailable`] without calling `body` when the lock
    /// is held elsewhere. Once acquired, the lock is released whether `body`
    /// succeeds or fails; if the returned future is dropped mid-way, release
    /// is handed to the runtime and the TTL covers the rest.
    pub async fn with_lock<F, Fut, T>(&self, path: &str, body: F) -> Result<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(token) = self
            .backend
            .try_lock(path, &self.identity, self.lock_ttl)
            .await?
        else {
            event!(Level::DEBUG, path, "lock unavailable");
            return Ok(LockOutcome::Unavailable);
        };
        event!(Level::DEBUG, path, token = %token.token, "lock acquired");

        let guard = LockGuard {
            backend: self.backend.clone(),
            token: Some(token),
        };
        let result = body().await;
        let released = guard.release().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(LockOutcome::Acquired(value)),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(path, error = %release_err, "lock release failed after body error");
                Err(err)
            }
        }
    }
}

struct LockGuard {
    backend: Arc<dyn CoordinationBackend>,
    token: Option<LockToken>,
}

impl LockGuard {
    async fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => {
                self.backend.unlock(&token).await?;
                event!(Level::DEBUG, path = %token.path, "lock released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let backend = self.backend.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = backend.unlock(&token).await {
                    warn!(path = %token.path, error = %err, "deferred lock release failed");
                }
            });
        }
    }
}

/// Decodes stored bytes; anything unreadable counts as a fresh record.
fn decode_record(path: &str, bytes: &[u8]) -> ProgressRecord {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return ProgressRecord::empty();
    }
    match ProgressRecord::from_bytes(bytes) {
        Ok(record) => record,
        Err(err) => {
            warn!(path, error = %err, "unreadable progress record, treating as empty");
            ProgressRecord::empty()
        }
    }
}
