use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionAssignment {
    pub position_id: String,
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventRoster {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub position_assignments: Vec<PositionAssignment>,
}

impl EventRoster {
    pub fn assigns(&self, subject_id: &str, position_id: &str) -> bool {
        self.position_assignments
            .iter()
            .any(|entry| entry.position_id == position_id && entry.subject_id == subject_id)
    }
}

/// Read-only access to the event store, bounded to one record per call.
#[async_trait]
pub trait RosterLookup: Send + Sync {
    async fn get_event_roster(&self, event_id: &str) -> Result<Option<EventRoster>>;
}

/// One JSON document per event under `dir`, named `<eventId>.json`.
pub struct FileRosterLookup {
    dir: PathBuf,
}

impl FileRosterLookup {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl RosterLookup for FileRosterLookup {
    async fn get_event_roster(&self, event_id: &str) -> Result<Option<EventRoster>> {
        if !is_safe_record_id(event_id) {
            return Ok(None);
        }
        let path = self.dir.join(format!("{event_id}.json"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading roster {}", path.display()))
            }
        };
        let roster = serde_json::from_str::<EventRoster>(&text)
            .with_context(|| format!("invalid roster record {}", path.display()))?;
        Ok(Some(roster))
    }
}

fn is_safe_record_id(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
        && !value.contains("..")
}

#[cfg(test)]
pub struct InMemoryRosterLookup {
    rosters: std::collections::HashMap<String, EventRoster>,
    lookups: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl InMemoryRosterLookup {
    pub fn new() -> Self {
        Self {
            rosters: std::collections::HashMap::new(),
            lookups: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_event(mut self, event_id: &str, assignments: &[(&str, &str)]) -> Self {
        self.rosters.insert(
            event_id.to_owned(),
            EventRoster {
                event_id: Some(event_id.to_owned()),
                position_assignments: assignments
                    .iter()
                    .map(|(position_id, subject_id)| PositionAssignment {
                        position_id: (*position_id).to_owned(),
                        subject_id: (*subject_id).to_owned(),
                    })
                    .collect(),
            },
        );
        self
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl RosterLookup for InMemoryRosterLookup {
    async fn get_event_roster(&self, event_id: &str) -> Result<Option<EventRoster>> {
        self.lookups
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.rosters.get(event_id).cloned())
    }
}
