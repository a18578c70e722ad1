/// Proof of ownership of one coordination lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub path: String,
    pub holder: String,
    pub token: Uuid,
}

impl LockToken {
    fn issue(path: &str, holder: &str) -> Self {
        Self {
            path: path.to_string(),
            holder: holder.to_string(),
            token: Uuid::new_v4(),
        }
    }
}

/// Raw access to a coordination service.
///
/// Implementations must make `create_if_absent` and `try_lock` atomic across
/// every process sharing the service, and must let a lock lapse once its TTL
/// has passed so that a crashed holder never blocks the cluster.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Creates the node with `value` unless it already exists. Returns true if
    /// this call created it.
    async fn create_if_absent(&self, path: &str, value: &[u8]) -> Result<bool>;

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn write(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Names of the direct children of `path` that hold a value.
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// Takes the lock at `path`, or returns `None` while another holder's
    /// lock is still live.
    async fn try_lock(&self, path: &str, holder: &str, ttl: Duration)
    -> Result<Option<LockToken>>;

    /// Releases a lock. Releasing a lock that already lapsed is not an error.
    async fn unlock(&self, token: &LockToken) -> Result<()>;
}
