/// Contents of a lock file in the filesystem backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    holder: String,
    token: Uuid,
    expires_at_ms: i64,
}

impl LockFile {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

const GENERATION_WIDTH: usize = 20;
const RELEASED_SUFFIX: &str = ".released";

fn generation_name(generation: u64) -> String {
    format!("{:020}", generation)
}

fn parse_generation(name: &str) -> Option<u64> {
    if name.len() != GENERATION_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Coordination backend over a directory shared by every node (NFS, a
/// mounted volume, or a local disk for single-host pools).
///
/// Records are `<path>.json` files replaced atomically with a temp file and
/// rename. Create-if-absent hard-links a fully written temp file into place,
/// which fails when the target exists, so a reader never sees a half-written
/// node.
///
/// A lock is a `<path>.lock/` directory of numbered generation files, each
/// carrying holder, token and a wall-clock expiry. The highest generation is
/// the current one. Acquiring means publishing generation `n + 1` with the
/// same create-new hard link once generation `n` has expired or been
/// released, so exactly one contender wins each generation. Release adds a
/// `<n>.released` marker. Nothing that may still be the current generation
/// is ever moved or deleted.
#[derive(Debug, Clone)]
pub struct FsCoordinationBackend {
    root: PathBuf,
}

impl FsCoordinationBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_file(&self, path: &str, extension: &str) -> Result<PathBuf> {
        let segments = path_segments(path)?;
        let mut file = self.root.clone();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| FlowlogError::coordination(path, "empty path"))?;
        for segment in parents {
            file.push(segment);
        }
        file.push(format!("{}.{}", last, extension));
        Ok(file)
    }

    fn record_file(&self, path: &str) -> Result<PathBuf> {
        self.node_file(path, "json")
    }

    fn lock_dir(&self, path: &str) -> Result<PathBuf> {
        self.node_file(path, "lock")
    }

    async fn ensure_parent(path: &str, file: &Path) -> Result<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                FlowlogError::coordination(
                    path,
                    format!("Failed to create directory '{}': {}", parent.display(), err),
                )
            })?;
        }
        Ok(())
    }

    /// Writes `bytes` to a sibling temp file that the caller must move or remove.
    async fn write_temp(path: &str, file: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = file.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await.map_err(|err| {
            FlowlogError::coordination(
                path,
                format!("Failed to write temp file '{}': {}", tmp.display(), err),
            )
        })?;
        Ok(tmp)
    }

    /// Publishes `bytes` at `file` only if nothing is there yet.
    async fn link_new(path: &str, file: &Path, bytes: &[u8]) -> Result<bool> {
        Self::ensure_parent(path, file).await?;
        let tmp = Self::write_temp(path, file, bytes).await?;
        let linked = fs::hard_link(&tmp, file).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(FlowlogError::coordination(
                path,
                format!("Failed to publish '{}': {}", file.display(), err),
            )),
        }
    }

    async fn read_file(path: &str, file: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FlowlogError::coordination(
                path,
                format!("Failed to read '{}': {}", file.display(), err),
            )),
        }
    }

    async fn read_lock(path: &str, file: &Path) -> Result<Option<LockFile>> {
        let Some(bytes) = Self::read_file(path, file).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<LockFile>(&bytes) {
            Ok(lock) => Ok(Some(lock)),
            Err(err) => {
                // Its owner can never release a lock nobody can parse; treat it
                // as expired.
                warn!(path, error = %err, "unreadable lock file");
                Ok(Some(LockFile {
                    holder: String::new(),
                    token: Uuid::nil(),
                    expires_at_ms: i64::MIN,
                }))
            }
        }
    }

    /// Highest lock generation present in `dir`.
    async fn latest_generation(path: &str, dir: &Path) -> Result<Option<u64>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(FlowlogError::coordination(path, err)),
        };
        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| FlowlogError::coordination(path, err))?
        {
            if let Some(generation) = parse_generation(&entry.file_name().to_string_lossy()) {
                latest = latest.max(Some(generation));
            }
        }
        Ok(latest)
    }

    /// Lock record of `generation`, or `None` once it was released or pruned.
    async fn held_by(path: &str, dir: &Path, generation: u64) -> Result<Option<LockFile>> {
        let name = generation_name(generation);
        let released = dir.join(format!("{}{}", name, RELEASED_SUFFIX));
        if Self::read_file(path, &released).await?.is_some() {
            return Ok(None);
        }
        Self::read_lock(path, &dir.join(name)).await
    }

    async fn mark_released(path: &str, dir: &Path, generation: u64) -> Result<()> {
        let released = dir.join(format!("{}{}", generation_name(generation), RELEASED_SUFFIX));
        Self::link_new(path, &released, b"").await?;
        Ok(())
    }

    /// Deletes generations older than the one preceding `current`. Best effort.
    async fn prune(dir: &Path, current: u64) {
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stem = name.strip_suffix(RELEASED_SUFFIX).unwrap_or(&name);
            if parse_generation(stem).is_some_and(|generation| generation.saturating_add(1) < current) {
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }
}

#[async_trait]
impl CoordinationBackend for FsCoordinationBackend {
    async fn create_if_absent(&self, path: &str, value: &[u8]) -> Result<bool> {
        let file = self.record_file(path)?;
        Self::link_new(path, &file, value).await
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file = self.record_file(path)?;
        Self::read_file(path, &file).await
    }

    async fn write(&self, path: &str, value: &[u8]) -> Result<()> {
        let file = self.record_file(path)?;
        Self::ensure_parent(path, &file).await?;
        let tmp = Self::write_temp(path, &file, value).await?;
        if let Err(err) = fs::rename(&tmp, &file).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(FlowlogError::coordination(
                path,
                format!(
                    "Failed to rename temp file '{}' -> '{}': {}",
                    tmp.display(),
                    file.display(),
                    err
                ),
            ));
        }
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let segments = path_segments(path)?;
        let mut dir = self.root.clone();
        for segment in segments {
            dir.push(segment);
        }
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(FlowlogError::coordination(path, err)),
        };
        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| FlowlogError::coordination(path, err))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(child) = name.strip_suffix(".json") {
                children.push(child.to_string());
            }
        }
        children.sort();
        Ok(children)
    }

    async fn try_lock(
        &self,
        path: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        let dir = self.lock_dir(path)?;
        let token = LockToken::issue(path, holder);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        // Losing the publish race only means re-reading the new head.
        for _ in 0..3 {
            let now_ms = Utc::now().timestamp_millis();
            let mut previous_holder = None;
            let next = match Self::latest_generation(path, &dir).await? {
                None => 1,
                Some(generation) => {
                    if let Some(current) = Self::held_by(path, &dir, generation).await? {
                        if current.is_live(now_ms) {
                            return Ok(None);
                        }
                        previous_holder = Some(current.holder);
                    }
                    generation.saturating_add(1)
                }
            };

            let lock = LockFile {
                holder: holder.to_string(),
                token: token.token,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            };
            let bytes = serde_json::to_vec(&lock)?;
            if !Self::link_new(path, &dir.join(generation_name(next)), &bytes).await? {
                continue;
            }

            // A listing read while old generations were being pruned can put
            // us below the head; the head always wins.
            if Self::latest_generation(path, &dir).await? != Some(next) {
                Self::mark_released(path, &dir, next).await?;
                return Ok(None);
            }
            Self::prune(&dir, next).await;
            if let Some(previous_holder) = previous_holder {
                event!(Level::INFO, path, previous_holder = %previous_holder, "lapsed lock reclaimed");
            }
            return Ok(Some(token));
        }
        Ok(None)
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let path = token.path.as_str();
        let dir = self.lock_dir(path)?;
        if let Some(generation) = Self::latest_generation(path, &dir).await? {
            let owned = Self::held_by(path, &dir, generation)
                .await?
                .is_some_and(|current| current.token == token.token);
            if owned {
                return Self::mark_released(path, &dir, generation).await;
            }
        }
        event!(Level::WARN, path, "lock lapsed before release");
        Ok(())
    }
}
