/// Layout of every record and lock path under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationPaths {
    namespace: String,
}

impl CoordinationPaths {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &FlowlogConfig) -> Self {
        Self::new(&config.namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Parent node of every per-account progress record.
    pub fn accounts_root(&self) -> String {
        format!("/{}/accounts", self.namespace)
    }

    pub fn account(&self, account_id: &str) -> String {
        format!("/{}/accounts/{}", self.namespace, account_id)
    }

    /// Progress record of the global collect trigger.
    pub fn collect_trigger(&self) -> String {
        format!("/{}/periodictask", self.namespace)
    }

    /// Progress record of the global purge trigger.
    pub fn purge_trigger(&self) -> String {
        format!("/{}/periodicpurgetask", self.namespace)
    }

    pub fn collect_lock(&self) -> String {
        format!("/{}/locks/global-collect", self.namespace)
    }

    pub fn purge_lock(&self) -> String {
        format!("/{}/locks/global-purge", self.namespace)
    }

    pub fn account_lock(&self, account_id: &str) -> String {
        format!("/{}/locks/account:{}", self.namespace, account_id)
    }
}

/// Splits an absolute coordination path into its segments, rejecting
/// anything that could escape the namespace.
fn path_segments(path: &str) -> Result<Vec<&str>> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(FlowlogError::coordination(path, "path must be absolute"));
    };
    let segments: Vec<&str> = rest.split('/').collect();
    if segments
        .iter()
        .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
    {
        return Err(FlowlogError::coordination(path, "invalid path segment"));
    }
    Ok(segments)
}
