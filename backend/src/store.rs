use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use draw_core::{names_match, Group, GroupId, InvariantViolation, Participant};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub doc: T,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("group {0} not found")]
    NotFound(GroupId),
    #[error("a group named {0} already exists")]
    DuplicateName(String),
    #[error("group changed since read: expected version {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("rejected invalid group: {0}")]
    Invalid(#[from] InvariantViolation),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn insert(&self, group: Group) -> Result<Versioned<Group>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Versioned<Group>>, StoreError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Versioned<Group>>, StoreError>;

    // Newest first; ties broken by name.
    async fn list(&self) -> Result<Vec<Versioned<Group>>, StoreError>;

    /// Replaces the group only if it is still at `expected_version`.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        group: Group,
    ) -> Result<Versioned<Group>, StoreError>;

    async fn subscribe(&self, id: &str)
        -> Result<broadcast::Receiver<Versioned<Group>>, StoreError>;
}

// Every field is optional so old or hand-edited records still parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupDocument {
    pub version: u64,
    pub id: String,
    pub name: String,
    pub participants: Vec<ParticipantDocument>,
    pub draw_completed: bool,
    pub created_at: u64,
    pub draw_completed_at: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantDocument {
    pub id: String,
    pub name: String,
    pub wishlist: String,
    pub joined_at: u64,
    pub assigned_to: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("group record has no id")]
    MissingGroupId,
    #[error("participant record in group {0} has no id")]
    MissingParticipantId(GroupId),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl GroupDocument {
    pub fn from_versioned(record: &Versioned<Group>) -> Self {
        let group = &record.doc;
        Self {
            version: record.version,
            id: group.id.clone(),
            name: group.name.clone(),
            participants: group
                .participants
                .iter()
                .map(|p| ParticipantDocument {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    wishlist: p.wishlist.clone(),
                    joined_at: p.joined_at,
                    assigned_to: p.assigned_to.clone(),
                })
                .collect(),
            draw_completed: group.draw_completed,
            created_at: group.created_at,
            draw_completed_at: group.draw_completed_at,
        }
    }

    pub fn into_group(self) -> Result<Versioned<Group>, RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::MissingGroupId);
        }

        let participants = self
            .participants
            .into_iter()
            .map(|p| {
                if p.id.trim().is_empty() {
                    return Err(RecordError::MissingParticipantId(self.id.clone()));
                }
                Ok(Participant {
                    id: p.id,
                    name: p.name.trim().to_string(),
                    wishlist: p.wishlist,
                    joined_at: p.joined_at,
                    assigned_to: p.assigned_to.filter(|to| !to.trim().is_empty()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let group = Group {
            id: self.id,
            name: self.name.trim().to_string(),
            participants,
            draw_completed: self.draw_completed,
            created_at: self.created_at,
            draw_completed_at: self.draw_completed_at,
        };
        group.check_invariants()?;

        Ok(Versioned {
            version: self.version.max(1),
            doc: group,
        })
    }
}

#[derive(Default)]
struct Inner {
    groups: RwLock<HashMap<GroupId, Versioned<Group>>>,
    channels: RwLock<HashMap<GroupId, broadcast::Sender<Versioned<Group>>>>,
    persist_path: Option<PathBuf>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_persistence(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut groups = HashMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let records: Vec<serde_json::Value> = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt store file: {e}")))?;
                for value in records {
                    match parse_record(value) {
                        Ok(record) => {
                            // First record wins; a later clash would make the
                            // earlier group unwritable.
                            if groups.contains_key(&record.doc.id)
                                || name_taken(&groups, &record.doc.name, &record.doc.id)
                            {
                                warn!(
                                    group_id = %record.doc.id,
                                    name = %record.doc.name,
                                    "skipping group record with a duplicate id or name"
                                );
                                continue;
                            }
                            groups.insert(record.doc.id.clone(), record);
                        }
                        Err(reason) => warn!(%reason, "skipping malformed group record"),
                    }
                }
                info!(path = %path.display(), groups = groups.len(), "loaded groups");
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no store file yet, starting empty");
            }
            Err(err) => return Err(StoreError::Unavailable(err.to_string())),
        }

        Ok(Self {
            inner: Arc::new(Inner {
                groups: RwLock::new(groups),
                channels: RwLock::new(HashMap::new()),
                persist_path: Some(path),
            }),
        })
    }

    async fn write_through(
        &self,
        groups: &HashMap<GroupId, Versioned<Group>>,
    ) -> Result<(), StoreError> {
        let Some(path) = &self.inner.persist_path else {
            return Ok(());
        };

        let mut records: Vec<GroupDocument> =
            groups.values().map(GroupDocument::from_versioned).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let json = serde_json::to_vec_pretty(&records)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn commit(
        &self,
        groups: &mut HashMap<GroupId, Versioned<Group>>,
        record: Versioned<Group>,
    ) -> Result<(), StoreError> {
        let id = record.doc.id.clone();
        let previous = groups.insert(id.clone(), record);
        if let Err(err) = self.write_through(groups).await {
            match previous {
                Some(previous) => groups.insert(id.clone(), previous),
                None => groups.remove(&id),
            };
            warn!(group_id = %id, error = %err, "persist failed, write rolled back");
            return Err(err);
        }
        Ok(())
    }

    async fn publish(&self, record: &Versioned<Group>) {
        if let Some(tx) = self.inner.channels.read().await.get(&record.doc.id) {
            // No receivers is fine.
            let _ = tx.send(record.clone());
        }
    }
}

fn parse_record(value: serde_json::Value) -> Result<Versioned<Group>, String> {
    let document: GroupDocument = serde_json::from_value(value).map_err(|e| e.to_string())?;
    document.into_group().map_err(|e| e.to_string())
}

fn name_taken(
    groups: &HashMap<GroupId, Versioned<Group>>,
    name: &str,
    except_id: &str,
) -> bool {
    groups
        .values()
        .any(|g| g.doc.id != except_id && names_match(&g.doc.name, name))
}

#[async_trait]
impl GroupStore for InMemoryStore {
    async fn insert(&self, group: Group) -> Result<Versioned<Group>, StoreError> {
        group.check_invariants()?;

        let mut groups = self.inner.groups.write().await;
        if name_taken(&groups, &group.name, &group.id) || groups.contains_key(&group.id) {
            return Err(StoreError::DuplicateName(group.name));
        }

        let record = Versioned {
            version: 1,
            doc: group,
        };
        self.commit(&mut groups, record.clone()).await?;
        drop(groups);

        debug!(group_id = %record.doc.id, "group inserted");
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<Versioned<Group>>, StoreError> {
        Ok(self.inner.groups.read().await.get(id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Versioned<Group>>, StoreError> {
        let groups = self.inner.groups.read().await;
        Ok(groups
            .values()
            .find(|g| names_match(&g.doc.name, name))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Versioned<Group>>, StoreError> {
        let mut all: Vec<_> = self.inner.groups.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            b.doc
                .created_at
                .cmp(&a.doc.created_at)
                .then_with(|| a.doc.name.cmp(&b.doc.name))
        });
        Ok(all)
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        group: Group,
    ) -> Result<Versioned<Group>, StoreError> {
        if group.id != id {
            return Err(StoreError::NotFound(id.to_string()));
        }
        group.check_invariants()?;

        let mut groups = self.inner.groups.write().await;
        let current = groups
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        if name_taken(&groups, &group.name, id) {
            return Err(StoreError::DuplicateName(group.name));
        }

        let record = Versioned {
            version: expected_version + 1,
            doc: group,
        };
        self.commit(&mut groups, record.clone()).await?;
        drop(groups);

        debug!(group_id = %id, version = record.version, "group committed");
        self.publish(&record).await;
        Ok(record)
    }

    async fn subscribe(
        &self,
        id: &str,
    ) -> Result<broadcast::Receiver<Versioned<Group>>, StoreError> {
        if !self.inner.groups.read().await.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let mut channels = self.inner.channels.write().await;
        let rx = channels
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(rx)
    }
}
