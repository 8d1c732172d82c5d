use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(feature = "sqlite-registry")]
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
#[cfg(feature = "sqlite-registry")]
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::RegistryError;

pub const IN_MEMORY_REGISTRY: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEntry {
    pub connection_handle: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub connected_at_ms: u64,
}

/// Durable table of live connections keyed by `(channel, connection_handle)`.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Registering an existing `(channel, handle)` pair replaces that row.
    async fn register(
        &self,
        channel: &str,
        connection_handle: &str,
        subject_id: Option<&str>,
    ) -> Result<(), RegistryError>;

    /// Removing an absent pair is not an error.
    async fn unregister(&self, channel: &str, connection_handle: &str)
        -> Result<(), RegistryError>;

    async fn list_by_channel(
        &self,
        channel: &str,
        subject_filter: Option<&str>,
    ) -> Result<Vec<ConnectionEntry>, RegistryError>;
}

/// Channel index: channel -> handle -> entry.
type ChannelTable = HashMap<String, BTreeMap<String, ConnectionEntry>>;

pub struct RegistryStore {
    backend: RegistryBackend,
}

enum RegistryBackend {
    Memory {
        table: RwLock<ChannelTable>,
    },
    Json {
        path: PathBuf,
        table: RwLock<ChannelTable>,
    },
    #[cfg(feature = "sqlite-registry")]
    Sqlite { path: PathBuf, lock: Mutex<()> },
}

impl RegistryStore {
    pub fn in_memory() -> Self {
        Self {
            backend: RegistryBackend::Memory {
                table: RwLock::new(ChannelTable::new()),
            },
        }
    }

    pub async fn open(path: PathBuf) -> Result<Self> {
        if path.as_os_str() == IN_MEMORY_REGISTRY {
            return Ok(Self::in_memory());
        }
        if is_sqlite_path(&path) {
            #[cfg(feature = "sqlite-registry")]
            {
                init_sqlite(path.clone()).await?;
                return Ok(Self {
                    backend: RegistryBackend::Sqlite {
                        path,
                        lock: Mutex::new(()),
                    },
                });
            }

            #[cfg(not(feature = "sqlite-registry"))]
            {
                anyhow::bail!(
                    "sqlite registry requested for {} but binary was built without \
                     `sqlite-registry` feature",
                    path.display()
                );
            }
        }

        let table = load_json_table(&path).await?;
        Ok(Self {
            backend: RegistryBackend::Json {
                path,
                table: RwLock::new(table),
            },
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            RegistryBackend::Memory { .. } => "memory",
            RegistryBackend::Json { .. } => "json",
            #[cfg(feature = "sqlite-registry")]
            RegistryBackend::Sqlite { .. } => "sqlite",
        }
    }

    async fn put(&self, entry: ConnectionEntry) -> Result<()> {
        match &self.backend {
            RegistryBackend::Memory { table } => {
                insert_entry(&mut *table.write().await, entry);
            }
            RegistryBackend::Json { path, table } => {
                let mut guard = table.write().await;
                let previous = insert_entry(&mut guard, entry.clone());
                if let Err(err) = persist_json(path, &guard).await {
                    match previous {
                        Some(previous) => {
                            insert_entry(&mut guard, previous);
                        }
                        None => {
                            remove_entry(&mut guard, &entry.channel, &entry.connection_handle);
                        }
                    }
                    return Err(err);
                }
            }
            #[cfg(feature = "sqlite-registry")]
            RegistryBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                with_sqlite(path, "register", move |conn| {
                    conn.execute(
                        "INSERT INTO connections (
                            connection_handle,
                            channel,
                            subject_id,
                            connected_at_ms
                        ) VALUES (?1, ?2, ?3, ?4)
                        ON CONFLICT(connection_handle, channel) DO UPDATE SET
                            subject_id=excluded.subject_id,
                            connected_at_ms=excluded.connected_at_ms",
                        params![
                            entry.connection_handle,
                            entry.channel,
                            entry.subject_id,
                            entry.connected_at_ms as i64
                        ],
                    )
                    .map(|_| ())
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, channel: &str, connection_handle: &str) -> Result<bool> {
        match &self.backend {
            RegistryBackend::Memory { table } => {
                Ok(remove_entry(&mut *table.write().await, channel, connection_handle).is_some())
            }
            RegistryBackend::Json { path, table } => {
                let mut guard = table.write().await;
                let Some(removed) = remove_entry(&mut guard, channel, connection_handle) else {
                    return Ok(false);
                };
                if let Err(err) = persist_json(path, &guard).await {
                    insert_entry(&mut guard, removed);
                    return Err(err);
                }
                Ok(true)
            }
            #[cfg(feature = "sqlite-registry")]
            RegistryBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let channel = channel.to_owned();
                let handle = connection_handle.to_owned();
                let removed = with_sqlite(path, "unregister", move |conn| {
                    conn.execute(
                        "DELETE FROM connections WHERE connection_handle = ?1 AND channel = ?2",
                        params![handle, channel],
                    )
                })
                .await?;
                Ok(removed > 0)
            }
        }
    }

    async fn select(
        &self,
        channel: &str,
        subject_filter: Option<&str>,
    ) -> Result<Vec<ConnectionEntry>> {
        match &self.backend {
            RegistryBackend::Memory { table } | RegistryBackend::Json { table, .. } => {
                let guard = table.read().await;
                Ok(guard
                    .get(channel)
                    .map(|rows| {
                        rows.values()
                            .filter(|entry| subject_matches(entry, subject_filter))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default())
            }
            #[cfg(feature = "sqlite-registry")]
            RegistryBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let channel = channel.to_owned();
                let subject = subject_filter.map(ToOwned::to_owned);
                with_sqlite(path, "list_by_channel", move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT connection_handle, channel, subject_id, connected_at_ms
                         FROM connections
                         WHERE channel = ?1 AND (?2 IS NULL OR subject_id = ?2)
                         ORDER BY connection_handle",
                    )?;
                    let rows = stmt.query_map(params![channel, subject], |row| {
                        Ok(ConnectionEntry {
                            connection_handle: row.get(0)?,
                            channel: row.get(1)?,
                            subject_id: row.get(2)?,
                            connected_at_ms: row.get::<_, i64>(3)? as u64,
                        })
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                })
                .await
            }
        }
    }
}

#[async_trait]
impl ConnectionRegistry for RegistryStore {
    async fn register(
        &self,
        channel: &str,
        connection_handle: &str,
        subject_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let entry = ConnectionEntry {
            connection_handle: connection_handle.to_owned(),
            channel: channel.to_owned(),
            subject_id: subject_id.map(ToOwned::to_owned),
            connected_at_ms: now_ms(),
        };
        self.put(entry).await.map_err(RegistryError::from_anyhow)?;
        debug!("registered {connection_handle} on {channel}");
        Ok(())
    }

    async fn unregister(
        &self,
        channel: &str,
        connection_handle: &str,
    ) -> Result<(), RegistryError> {
        let removed = self
            .delete(channel, connection_handle)
            .await
            .map_err(RegistryError::from_anyhow)?;
        if removed {
            debug!("unregistered {connection_handle} from {channel}");
        }
        Ok(())
    }

    async fn list_by_channel(
        &self,
        channel: &str,
        subject_filter: Option<&str>,
    ) -> Result<Vec<ConnectionEntry>, RegistryError> {
        self.select(channel, subject_filter)
            .await
            .map_err(RegistryError::from_anyhow)
    }
}

/// An entry without a subject never matches an explicit filter.
fn subject_matches(entry: &ConnectionEntry, subject_filter: Option<&str>) -> bool {
    match subject_filter {
        None => true,
        Some(filter) => entry.subject_id.as_deref() == Some(filter),
    }
}

fn insert_entry(table: &mut ChannelTable, entry: ConnectionEntry) -> Option<ConnectionEntry> {
    table
        .entry(entry.channel.clone())
        .or_default()
        .insert(entry.connection_handle.clone(), entry)
}

fn remove_entry(
    table: &mut ChannelTable,
    channel: &str,
    connection_handle: &str,
) -> Option<ConnectionEntry> {
    let rows = table.get_mut(channel)?;
    let removed = rows.remove(connection_handle);
    if rows.is_empty() {
        table.remove(channel);
    }
    removed
}

async fn load_json_table(path: &Path) -> Result<ChannelTable> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ChannelTable::new())
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading registry {}", path.display()))
        }
    };
    let entries = match serde_json::from_str::<Vec<ConnectionEntry>>(&text) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                "registry {} is unreadable, starting empty: {err}",
                path.display()
            );
            Vec::new()
        }
    };
    let mut table = ChannelTable::new();
    for entry in entries {
        insert_entry(&mut table, entry);
    }
    Ok(table)
}

async fn persist_json(path: &Path, table: &ChannelTable) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut rows = table
        .values()
        .flat_map(|rows| rows.values())
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        (a.channel.as_str(), a.connection_handle.as_str())
            .cmp(&(b.channel.as_str(), b.connection_handle.as_str()))
    });
    let snapshot = serde_json::to_vec_pretty(&rows)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, snapshot)
        .await
        .with_context(|| format!("failed writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

#[cfg(feature = "sqlite-registry")]
const CONNECTIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    connection_handle TEXT NOT NULL,
    channel TEXT NOT NULL,
    subject_id TEXT,
    connected_at_ms INTEGER NOT NULL,
    PRIMARY KEY (connection_handle, channel)
);
CREATE INDEX IF NOT EXISTS connections_by_channel ON connections (channel, subject_id);
"#;

#[cfg(feature = "sqlite-registry")]
fn open_sqlite(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .with_context(|| "set WAL mode")?;
    conn.execute_batch(CONNECTIONS_SCHEMA)
        .with_context(|| "ensure connections schema")?;
    Ok(conn)
}

#[cfg(feature = "sqlite-registry")]
async fn init_sqlite(path: PathBuf) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::task::spawn_blocking(move || open_sqlite(&path).map(|_| ()))
        .await
        .with_context(|| "sqlite init join error")??;
    Ok(())
}

#[cfg(feature = "sqlite-registry")]
async fn with_sqlite<T, F>(path: &Path, op: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
{
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<T> {
        let conn = open_sqlite(&path)?;
        f(&conn).with_context(|| format!("sqlite {op}"))
    })
    .await
    .with_context(|| format!("sqlite {op} join error"))?
}

fn is_sqlite_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).map(|s| s.to_ascii_lowercase()),
        Some(ext) if ext == "db" || ext == "sqlite" || ext == "sqlite3"
    )
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
