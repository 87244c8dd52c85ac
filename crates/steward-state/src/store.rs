use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::canonical::checksum_hex;
use crate::error::StateError;

const DEFAULT_BACKUP_RETENTION: usize = 5;
const BACKUP_TS_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

pub type Migration = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub sensitive: bool,
    pub schema: Option<Value>,
    pub version: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub sensitive: bool,
    pub schema: Option<Value>,
    pub target_version: Option<u32>,
    pub allow_recovery: bool,
}

/// On-disk wrapper around every persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    timestamp: DateTime<Utc>,
    data: Value,
    checksum: String,
}

/// Owner of the file tree under the configured store root. Every named
/// document is rewritten atomically (temp file + rename on the same
/// filesystem) and carries a canonical-JSON SHA-256 checksum; the previous
/// content is kept as a timestamped backup, pruned to a bounded count.
pub struct StateStore {
    root: PathBuf,
    backups_dir: PathBuf,
    backup_retention: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    migrations: RwLock<BTreeMap<u32, (u32, Migration)>>,
}

impl StateStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StateError> {
        Self::with_retention(root, DEFAULT_BACKUP_RETENTION).await
    }

    pub async fn with_retention(
        root: impl AsRef<Path>,
        backup_retention: usize,
    ) -> Result<Self, StateError> {
        let root = root.as_ref().to_path_buf();
        let backups_dir = root.join("backups");
        fs::create_dir_all(&backups_dir).await?;
        Ok(Self {
            root,
            backups_dir,
            backup_retention: backup_retention.max(1),
            locks: Mutex::new(HashMap::new()),
            migrations: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a pure payload transform applied when a caller requests a
    /// newer `target_version` than the stored document carries. Only
    /// single-step ascending migrations are accepted.
    pub async fn register_migration(
        &self,
        from_version: u32,
        to_version: u32,
        migration: Migration,
    ) {
        debug_assert!(to_version > from_version);
        self.migrations
            .write()
            .await
            .insert(from_version, (to_version, migration));
    }

    pub async fn save(
        &self,
        name: &str,
        payload: &Value,
        options: SaveOptions,
    ) -> Result<PathBuf, StateError> {
        validate_name(name)?;
        if let Some(schema) = options.schema.as_ref() {
            validate_schema(name, schema, payload)?;
        }

        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let target = self.path_for(name);
        if fs::try_exists(&target).await? {
            if let Err(err) = self.backup_existing(name, &target, options.sensitive).await {
                // Backups are best-effort; the save itself must not fail on them.
                warn!(name, error = %err, "state backup failed, continuing with save");
            }
        }

        let envelope = Envelope {
            version: options.version,
            timestamp: Utc::now(),
            data: payload.clone(),
            checksum: checksum_hex(payload),
        };

        let tmp = self.root.join(format!(".{name}.json.tmp"));
        let raw = serde_json::to_vec_pretty(&envelope)?;
        fs::write(&tmp, &raw).await?;
        if options.sensitive {
            set_owner_only(&tmp).await?;
        }
        fs::rename(&tmp, &target).await?;
        Ok(target)
    }

    pub async fn load(&self, name: &str, options: LoadOptions) -> Result<Option<Value>, StateError> {
        validate_name(name)?;
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let target = self.path_for(name);
        if !fs::try_exists(&target).await? {
            if options.allow_recovery {
                return self.recover_from_backups(name, &options).await;
            }
            return Ok(None);
        }

        if options.sensitive {
            verify_owner_only(&target).await?;
        }

        match self.read_envelope(name, &target).await {
            Ok(envelope) => {
                let data = self.finish_load(name, envelope, &options).await?;
                Ok(Some(data))
            }
            Err(err) if err.is_corruption() && options.allow_recovery => {
                warn!(name, error = %err, "state file corrupted, trying backups");
                self.recover_from_backups(name, &options).await
            }
            Err(err) => Err(err),
        }
    }

    /// Removes a document, archiving its current content as a backup first.
    pub async fn delete(&self, name: &str) -> Result<(), StateError> {
        validate_name(name)?;
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let target = self.path_for(name);
        if !fs::try_exists(&target).await? {
            return Ok(());
        }
        self.backup_existing(name, &target, false).await?;
        fs::remove_file(&target).await?;
        Ok(())
    }

    /// Backups for `name`, most recent first.
    pub async fn list_backups(&self, name: &str) -> Result<Vec<PathBuf>, StateError> {
        validate_name(name)?;
        let prefix = format!("{name}.");
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.backups_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with(&prefix) && file_name.ends_with(".backup") {
                found.push(path);
            }
        }
        // Timestamps are zero-padded, so the lexicographic order is the
        // chronological order.
        found.sort();
        found.reverse();
        Ok(found)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn backup_existing(
        &self,
        name: &str,
        target: &Path,
        sensitive: bool,
    ) -> Result<(), StateError> {
        let ts = Utc::now().format(BACKUP_TS_FORMAT);
        let backup = self.backups_dir.join(format!("{name}.{ts}.backup"));
        fs::copy(target, &backup).await?;
        if sensitive {
            set_owner_only(&backup).await?;
        }
        self.prune_backups(name).await?;
        Ok(())
    }

    async fn prune_backups(&self, name: &str) -> Result<(), StateError> {
        let backups = self.list_backups(name).await?;
        for stale in backups.iter().skip(self.backup_retention) {
            let _ = fs::remove_file(stale).await;
        }
        Ok(())
    }

    async fn read_envelope(&self, name: &str, path: &Path) -> Result<Envelope, StateError> {
        let raw = fs::read(path).await?;
        let envelope: Envelope =
            serde_json::from_slice(&raw).map_err(|err| StateError::Corruption {
                name: name.to_string(),
                detail: format!("malformed envelope: {err}"),
            })?;
        let computed = checksum_hex(&envelope.data);
        if computed != envelope.checksum {
            return Err(StateError::Corruption {
                name: name.to_string(),
                detail: format!(
                    "checksum mismatch (stored {}, computed {})",
                    envelope.checksum, computed
                ),
            });
        }
        Ok(envelope)
    }

    async fn finish_load(
        &self,
        name: &str,
        envelope: Envelope,
        options: &LoadOptions,
    ) -> Result<Value, StateError> {
        let mut version = envelope.version;
        let mut data = envelope.data;

        if let Some(target_version) = options.target_version {
            let migrations = self.migrations.read().await;
            while version < target_version {
                let Some((to, migration)) = migrations.get(&version) else {
                    return Err(StateError::MissingMigration {
                        name: name.to_string(),
                        from: version,
                        target: target_version,
                    });
                };
                data = migration(data).map_err(|detail| StateError::Migration {
                    name: name.to_string(),
                    from: version,
                    to: *to,
                    detail,
                })?;
                version = *to;
            }
        }

        if let Some(schema) = options.schema.as_ref() {
            validate_schema(name, schema, &data)?;
        }
        Ok(data)
    }

    async fn recover_from_backups(
        &self,
        name: &str,
        options: &LoadOptions,
    ) -> Result<Option<Value>, StateError> {
        for backup in self.list_backups(name).await? {
            match self.read_envelope(name, &backup).await {
                Ok(envelope) => {
                    warn!(name, backup = %backup.display(), "recovered state from backup");
                    let data = self.finish_load(name, envelope, options).await?;
                    return Ok(Some(data));
                }
                Err(err) => {
                    warn!(name, backup = %backup.display(), error = %err, "backup unusable");
                }
            }
        }
        Ok(None)
    }
}

fn validate_name(name: &str) -> Result<(), StateError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidName(name.to_string()))
    }
}

fn validate_schema(name: &str, schema: &Value, payload: &Value) -> Result<(), StateError> {
    let validator = jsonschema::validator_for(schema).map_err(|err| StateError::Schema {
        name: name.to_string(),
        detail: format!("invalid schema: {err}"),
    })?;
    if let Err(err) = validator.validate(payload) {
        return Err(StateError::Schema {
            name: name.to_string(),
            detail: err.to_string(),
        });
    }
    Ok(())
}

#[cfg(unix)]
async fn set_owner_only(path: &Path) -> Result<(), StateError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) -> Result<(), StateError> {
    Ok(())
}

#[cfg(unix)]
async fn verify_owner_only(path: &Path) -> Result<(), StateError> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path).await?;
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(StateError::Permission(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
async fn verify_owner_only(_path: &Path) -> Result<(), StateError> {
    Ok(())
}
