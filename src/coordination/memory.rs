struct HeldLock {
    holder: String,
    token: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
struct InMemoryCoordinationState {
    records: BTreeMap<String, Vec<u8>>,
    locks: HashMap<String, HeldLock>,
}

/// Process-local coordination backend.
///
/// Shares state between every clone, so several coordinators and workers in
/// one process behave like separate nodes against one service. Lock expiry
/// follows the tokio clock.
#[derive(Clone, Default)]
pub struct InMemoryCoordinationBackend {
    state: Arc<Mutex<InMemoryCoordinationState>>,
}

impl InMemoryCoordinationBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of the lock at `path`, ignoring lapsed locks.
    pub async fn lock_holder(&self, path: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .locks
            .get(path)
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.holder.clone())
    }

    /// Paths of every stored record.
    pub async fn record_paths(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.records.keys().cloned().collect()
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryCoordinationBackend {
    async fn create_if_absent(&self, path: &str, value: &[u8]) -> Result<bool> {
        path_segments(path)?;
        let mut state = self.state.lock().await;
        if state.records.contains_key(path) {
            return Ok(false);
        }
        state.records.insert(path.to_string(), value.to_vec());
        Ok(true)
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        path_segments(path)?;
        let state = self.state.lock().await;
        Ok(state.records.get(path).cloned())
    }

    async fn write(&self, path: &str, value: &[u8]) -> Result<()> {
        path_segments(path)?;
        let mut state = self.state.lock().await;
        state.records.insert(path.to_string(), value.to_vec());
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        path_segments(path)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let state = self.state.lock().await;
        Ok(state
            .records
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn try_lock(
        &self,
        path: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        path_segments(path)?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(held) = state.locks.get(path) {
            if held.expires_at > now {
                return Ok(None);
            }
            event!(Level::INFO, path, previous_holder = %held.holder, "lapsed lock reclaimed");
        }
        let token = LockToken::issue(path, holder);
        state.locks.insert(
            path.to_string(),
            HeldLock {
                holder: holder.to_string(),
                token: token.token,
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let mut state = self.state.lock().await;
        let owned = state
            .locks
            .get(&token.path)
            .is_some_and(|held| held.token == token.token);
        if owned {
            state.locks.remove(&token.path);
        } else {
            event!(Level::WARN, path = %token.path, "lock lapsed before release");
        }
        Ok(())
    }
}
