// Credential storage
// Durable key-value persistence plus the process-wide credential store

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, RwLock};

use super::types::{Credential, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::RelayError;

/// Durable key-value storage for plain string entries
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read several keys as one consistent snapshot
    fn read(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Apply a batch atomically; `None` removes the key
    fn write(&self, entries: &[(&str, Option<&str>)]) -> Result<()>;
}

/// SQLite-backed store using an `auth_kv` table
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    /// Open (and create if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create credential directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Credential database lock poisoned"))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to read {} from SQLite", key))
    }

    fn read(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let conn = self.lock()?;
        // Another process may share the file; read inside one transaction
        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin read transaction")?;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let value = tx
                .query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                    row.get(0)
                })
                .optional()
                .with_context(|| format!("Failed to read {} from SQLite", key))?;
            values.push(value);
        }

        Ok(values)
    }

    fn write(&self, entries: &[(&str, Option<&str>)]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("Failed to begin write transaction")?;
        let now = Utc::now().to_rfc3339();

        for (key, value) in entries {
            match value {
                Some(value) => tx.execute(
                    "INSERT INTO auth_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, value, now],
                ),
                None => tx.execute("DELETE FROM auth_kv WHERE key = ?1", params![key]),
            }
            .with_context(|| format!("Failed to write {} to SQLite", key))?;
        }

        tx.commit().context("Failed to commit credential write")
    }
}

/// Process-local store, for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate credentials left by a previous run
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn read(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let entries = self.lock()?;
        Ok(keys.iter().map(|key| entries.get(*key).cloned()).collect())
    }

    fn write(&self, batch: &[(&str, Option<&str>)]) -> Result<()> {
        let mut entries = self.lock()?;
        for (key, value) in batch {
            match value {
                Some(value) => entries.insert(key.to_string(), value.to_string()),
                None => entries.remove(*key),
            };
        }
        Ok(())
    }
}

/// Read-only view of the current credentials
///
/// Handed to components that need the token but must never mutate it.
#[async_trait]
pub trait CredentialReader: Send + Sync {
    async fn credential(&self) -> Credential;

    async fn access_token(&self) -> Option<String> {
        self.credential().await.access_token
    }

    async fn refresh_token(&self) -> Option<String> {
        self.credential().await.refresh_token
    }

    /// Watch access token changes (login, refresh, logout)
    fn subscribe(&self) -> watch::Receiver<Option<String>>;
}

/// Single source of truth for the credential pair
///
/// Reads always go to the durable store so a lagging in-memory copy is never
/// served. Writes hold the lock across the durable batch and the snapshot
/// update, so readers never see a half-updated pair.
pub struct CredentialStore {
    durable: Arc<dyn KeyValueStore>,
    snapshot: RwLock<Credential>,
    changes: watch::Sender<Option<String>>,
}

impl CredentialStore {
    /// Open the store; the durable copy is authoritative on start
    pub fn open(durable: Arc<dyn KeyValueStore>) -> Result<Self> {
        let initial = load(durable.as_ref()).context("Failed to load stored credentials")?;

        tracing::info!(
            has_access_token = initial.access_token.is_some(),
            has_refresh_token = initial.refresh_token.is_some(),
            "Credential store opened"
        );

        let (changes, _) = watch::channel(initial.access_token.clone());

        Ok(Self {
            durable,
            snapshot: RwLock::new(initial),
            changes,
        })
    }

    /// Most recently persisted credential pair
    pub async fn get(&self) -> Credential {
        let snapshot = self.snapshot.read().await;
        match load(self.durable.as_ref()) {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!("Durable credential read failed, using in-memory copy: {:#}", e);
                snapshot.clone()
            }
        }
    }

    pub(crate) async fn set(&self, credential: Credential) -> crate::error::Result<()> {
        let mut snapshot = self.snapshot.write().await;

        self.durable
            .write(&[
                (ACCESS_TOKEN_KEY, credential.access_token.as_deref()),
                (REFRESH_TOKEN_KEY, credential.refresh_token.as_deref()),
            ])
            .map_err(RelayError::Storage)?;

        self.publish(credential.access_token.clone());
        *snapshot = credential;
        Ok(())
    }

    /// Remove both tokens; the in-memory copy is cleared even if the disk write fails
    pub(crate) async fn clear(&self) {
        let mut snapshot = self.snapshot.write().await;

        if let Err(e) = self
            .durable
            .write(&[(ACCESS_TOKEN_KEY, None), (REFRESH_TOKEN_KEY, None)])
        {
            tracing::error!("Failed to clear durable credentials: {:#}", e);
        }

        *snapshot = Credential::default();
        self.publish(None);
    }

    fn publish(&self, access_token: Option<String>) {
        self.changes.send_if_modified(|current| {
            if *current != access_token {
                *current = access_token;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl CredentialReader for CredentialStore {
    async fn credential(&self) -> Credential {
        self.get().await
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.changes.subscribe()
    }
}

fn load(store: &dyn KeyValueStore) -> Result<Credential> {
    let mut values = store
        .read(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])?
        .into_iter()
        .map(|value| value.filter(|v| !v.is_empty()));

    Ok(Credential {
        access_token: values.next().flatten(),
        refresh_token: values.next().flatten(),
    })
}
