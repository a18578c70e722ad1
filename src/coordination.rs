//! Coordination service client: small persisted records plus ephemeral locks.
//!
//! [`CoordinationStore`] is what the coordinator and the workers talk to. It
//! sits on top of a [`CoordinationBackend`], which only knows about raw bytes
//! at hierarchical paths and TTL-bound lock tokens.

use crate::config::FlowlogConfig;
use crate::core::{FlowlogError, ProgressRecord, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{Level, event, warn};
use uuid::Uuid;

// Coordination support is split by responsibility for easier navigation.
include!("coordination/paths.rs");
include!("coordination/backend.rs");
include!("coordination/store.rs");
include!("coordination/memory.rs");
include!("coordination/fs.rs");
