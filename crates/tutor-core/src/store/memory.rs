//! In-memory store with an optional append-only journal
//!
//! Every committed write is appended to a JSON-lines journal before it
//! becomes visible, and [`MemoryStore::open`] rebuilds the key space by
//! replaying that journal.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::{
    ChangeEvent, ContinuationToken, ListFilter, Mutator, Page, ResourceStore, Revision, Versioned,
};
use crate::key::ResourceKey;
use crate::resource::Resource;
use crate::{Result, TutorError};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    revision: Revision,
    resource: Resource,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    revision: Revision,
    key: ResourceKey,
    resource: Resource,
}

struct Journal {
    path: PathBuf,
    file: File,
    sync_writes: bool,
}

impl Journal {
    async fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        if self.sync_writes {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct State {
    entries: BTreeMap<ResourceKey, Entry>,
    last_revision: u64,
    journal: Option<Journal>,
    closed: bool,
}

impl State {
    fn check_write(&self, key: &ResourceKey, resource: &Resource) -> Result<()> {
        if self.closed {
            return Err(TutorError::InvalidState("store is closed".into()));
        }
        key.validate()?;
        if resource.kind() != key.kind() {
            return Err(TutorError::InvalidArgument(format!(
                "cannot store {} under {key}",
                resource.kind()
            )));
        }
        if let Some(parent) = key.parent() {
            if !self.entries.contains_key(&parent) {
                return Err(TutorError::NotFound(parent.to_string()));
            }
        }
        Ok(())
    }

    fn apply(&mut self, record: JournalRecord) {
        self.last_revision = self.last_revision.max(record.revision.0);
        self.entries.insert(
            record.key,
            Entry {
                revision: record.revision,
                resource: record.resource,
            },
        );
    }
}

/// Ordered in-memory key space, optionally backed by a journal file
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    /// Create a store that lives only as long as the process
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            events,
        }
    }

    /// Open a journaled store, replaying any existing journal at `path`
    ///
    /// A torn final line left by a crash is cut off; corruption anywhere
    /// else is an error.
    pub async fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let mut state = State::default();
        let mut records = 0usize;
        if fs::try_exists(&path).await? {
            let contents = fs::read_to_string(&path).await?;
            let mut valid_len = 0usize;
            let lines: Vec<&str> = contents.split_inclusive('\n').collect();
            for (index, line) in lines.iter().enumerate() {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    match serde_json::from_str::<JournalRecord>(trimmed) {
                        Ok(record) => state.apply(record),
                        Err(e) if index + 1 == lines.len() => {
                            warn!("Discarding torn journal tail in {}: {e}", path.display());
                            break;
                        }
                        Err(e) => {
                            return Err(TutorError::InvalidState(format!(
                                "corrupt journal {} at line {}: {e}",
                                path.display(),
                                index + 1
                            )))
                        }
                    }
                    records += 1;
                }
                valid_len += line.len();
            }

            if valid_len < contents.len() {
                let file = OpenOptions::new().write(true).open(&path).await?;
                file.set_len(valid_len as u64).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(
            "Opened store journal {} ({} records, revision {})",
            path.display(),
            records,
            state.last_revision
        );
        state.journal = Some(Journal {
            path,
            file,
            sync_writes,
        });

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            state: RwLock::new(state),
            events,
        })
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Whether no key is stored
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Revision of the most recent write
    pub async fn revision(&self) -> Revision {
        Revision(self.state.read().await.last_revision)
    }

    async fn commit(
        &self,
        state: &mut State,
        key: &ResourceKey,
        resource: Resource,
    ) -> Result<Revision> {
        let revision = Revision(state.last_revision + 1);
        let record = JournalRecord {
            revision,
            key: key.clone(),
            resource,
        };
        if let Some(journal) = state.journal.as_mut() {
            journal.append(&record).await?;
        }
        state.apply(record);
        debug!("Committed {key} at revision {revision}");

        // No subscribers is fine
        let _ = self.events.send(ChangeEvent {
            key: key.clone(),
            revision,
        });
        Ok(revision)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create(&self, key: &ResourceKey, resource: Resource) -> Result<Revision> {
        let mut state = self.state.write().await;
        state.check_write(key, &resource)?;
        if state.entries.contains_key(key) {
            return Err(TutorError::AlreadyExists(key.to_string()));
        }
        self.commit(&mut state, key, resource).await
    }

    async fn put(&self, key: &ResourceKey, resource: Resource) -> Result<Revision> {
        let mut state = self.state.write().await;
        state.check_write(key, &resource)?;
        self.commit(&mut state, key, resource).await
    }

    async fn get(&self, key: &ResourceKey) -> Result<Versioned<Resource>> {
        let state = self.state.read().await;
        state
            .entries
            .get(key)
            .map(|entry| Versioned {
                key: key.clone(),
                revision: entry.revision,
                resource: entry.resource.clone(),
            })
            .ok_or_else(|| TutorError::NotFound(key.to_string()))
    }

    async fn list_page(
        &self,
        prefix: Option<&ResourceKey>,
        filter: &ListFilter,
        after: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page> {
        let start = match (after, prefix) {
            (Some(token), _) => Bound::Excluded(token.resume_key()?),
            (None, Some(prefix)) => Bound::Included(prefix.clone()),
            (None, None) => Bound::Unbounded,
        };

        let state = self.state.read().await;
        let mut matching = state
            .entries
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| prefix.map_or(true, |prefix| key.starts_with(prefix)))
            .filter(|(key, _)| prefix != Some(*key))
            .filter(|(key, entry)| filter.matches(prefix, key, entry.revision));

        let mut items = Vec::new();
        for (key, entry) in matching.by_ref().take(limit.max(1)) {
            items.push(Versioned {
                key: key.clone(),
                revision: entry.revision,
                resource: entry.resource.clone(),
            });
        }

        let next = match (matching.next(), items.last()) {
            (Some(_), Some(last)) => Some(ContinuationToken::after(&last.key)),
            _ => None,
        };
        Ok(Page { items, next })
    }

    async fn compare_and_update(
        &self,
        key: &ResourceKey,
        expected: Revision,
        mutator: Mutator,
    ) -> Result<Revision> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(TutorError::InvalidState("store is closed".into()));
        }
        let entry = state
            .entries
            .get(key)
            .ok_or_else(|| TutorError::NotFound(key.to_string()))?;
        if entry.revision != expected {
            return Err(TutorError::Conflict {
                key: key.to_string(),
                expected: expected.0,
                actual: entry.revision.0,
            });
        }

        let updated = mutator(entry.resource.clone())?;
        if updated.kind() != key.kind() {
            return Err(TutorError::InvalidArgument(format!(
                "update would change {key} into a {}",
                updated.kind()
            )));
        }
        self.commit(&mut state, key, updated).await
    }

    async fn last_modified(&self, key: &ResourceKey) -> Option<Revision> {
        self.state
            .read()
            .await
            .entries
            .get(key)
            .map(|entry| entry.revision)
    }

    async fn head_revision(&self) -> Revision {
        self.revision().await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(journal) = state.journal.take() {
            journal.file.sync_all().await?;
            info!("Closed store journal {}", journal.path.display());
        }
        state.closed = true;
        Ok(())
    }
}
