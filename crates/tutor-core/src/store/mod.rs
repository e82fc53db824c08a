//! Versioned resource store
//!
//! The store is the only shared mutable state of the coordinator. Every
//! write gets a revision from a single increasing counter; updates after
//! creation go through [`ResourceStore::compare_and_update`], so two
//! writers racing on the same key cannot both win.

mod memory;
mod retry;

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::key::{ResourceKey, ResourceKind};
use crate::resource::{Entity, Resource};
use crate::{Result, TutorError};

pub use memory::MemoryStore;
pub use retry::{update, update_if, RetryPolicy};

/// Default number of items fetched per page by [`Lister`]
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// Store-wide write counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A value together with the revision it was read at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Where the value lives
    pub key: ResourceKey,
    /// Revision of the last write to the key
    pub revision: Revision,
    /// The value
    pub resource: T,
}

impl Versioned<Resource> {
    /// Narrow to a concrete entity type
    pub fn into_entity<T: Entity>(self) -> Result<Versioned<T>> {
        Ok(Versioned {
            key: self.key,
            revision: self.revision,
            resource: T::try_from(self.resource)?,
        })
    }
}

/// Transformation applied to the current value inside a compare-and-update
pub type Mutator = Box<dyn FnOnce(Resource) -> Result<Resource> + Send>;

/// Notification of a committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Written key
    pub key: ResourceKey,
    /// Revision of the write
    pub revision: Revision,
}

/// Selects which keys under a prefix a listing returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only entities of this kind
    pub kind: Option<ResourceKind>,
    /// Only keys exactly one segment below the prefix
    pub direct_children: bool,
    /// Only keys written after this revision
    pub modified_after: Option<Revision>,
}

impl ListFilter {
    /// Match entities of one kind at any depth
    #[must_use]
    pub fn kind(kind: ResourceKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Match entities of one kind directly under the prefix
    #[must_use]
    pub fn children(kind: ResourceKind) -> Self {
        Self {
            kind: Some(kind),
            direct_children: true,
            modified_after: None,
        }
    }

    /// Whether a key and revision pass the filter
    #[must_use]
    pub fn matches(&self, prefix: Option<&ResourceKey>, key: &ResourceKey, revision: Revision) -> bool {
        if self.kind.is_some_and(|kind| key.kind() != kind) {
            return false;
        }
        if self.direct_children {
            let expected_depth = prefix.map_or(1, |prefix| prefix.depth() + 1);
            if key.depth() != expected_depth {
                return false;
            }
        }
        self.modified_after.map_or(true, |after| revision > after)
    }
}

/// Opaque restart point of a listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Token that resumes after `key`
    #[must_use]
    pub fn after(key: &ResourceKey) -> Self {
        Self(key.to_string())
    }

    /// Key the listing resumes after
    pub fn resume_key(&self) -> Result<ResourceKey> {
        self.0.parse().map_err(|_| {
            TutorError::InvalidArgument(format!("malformed continuation token {:?}", self.0))
        })
    }

    /// Raw token text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContinuationToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Matching entries ordered by key
    pub items: Vec<Versioned<Resource>>,
    /// Set when more entries may follow
    pub next: Option<ContinuationToken>,
}

/// Hierarchical, strongly keyed persistent store
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Write a new key; fails with `AlreadyExists` if present
    async fn create(&self, key: &ResourceKey, resource: Resource) -> Result<Revision>;

    /// Write a key unconditionally
    async fn put(&self, key: &ResourceKey, resource: Resource) -> Result<Revision>;

    /// Read a key
    async fn get(&self, key: &ResourceKey) -> Result<Versioned<Resource>>;

    /// Read one page of keys under `prefix` (all keys when `None`), ordered by key
    async fn list_page(
        &self,
        prefix: Option<&ResourceKey>,
        filter: &ListFilter,
        after: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page>;

    /// Replace the value at `key` if it is still at `expected`
    ///
    /// The mutator receives the current value and returns its replacement;
    /// an error from the mutator aborts the update unchanged.
    async fn compare_and_update(
        &self,
        key: &ResourceKey,
        expected: Revision,
        mutator: Mutator,
    ) -> Result<Revision>;

    /// Revision of the last write to `key`
    async fn last_modified(&self, key: &ResourceKey) -> Option<Revision>;

    /// Revision of the most recent write to any key
    async fn head_revision(&self) -> Revision;

    /// Receive an event for every committed write
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Flush durable state and refuse further writes
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Typed conveniences over any [`ResourceStore`]
#[async_trait]
pub trait StoreExt: ResourceStore {
    /// Read a key as a concrete entity
    async fn get_entity<T: Entity>(&self, key: &ResourceKey) -> Result<Versioned<T>> {
        self.get(key).await?.into_entity()
    }

    /// Create a key holding a concrete entity
    async fn create_entity<T: Entity>(&self, key: &ResourceKey, entity: T) -> Result<Revision> {
        if key.kind() != T::KIND {
            return Err(TutorError::InvalidArgument(format!(
                "cannot store {} under {key}",
                T::KIND
            )));
        }
        self.create(key, entity.into()).await
    }

    /// Whether a key is present
    async fn exists(&self, key: &ResourceKey) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(TutorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every entity of type `T` directly under `parent`
    async fn list_children<T: Entity>(&self, parent: &ResourceKey) -> Result<Vec<Versioned<T>>> {
        let mut lister = Lister::new(self, Some(parent.clone()), ListFilter::children(T::KIND));
        let mut entities = Vec::new();
        while let Some(item) = lister.next().await? {
            entities.push(item.into_entity()?);
        }
        Ok(entities)
    }
}

#[async_trait]
impl<S: ResourceStore + ?Sized> StoreExt for S {}

/// Lazy, restartable walk over a listing
///
/// Pages are fetched on demand; [`Lister::token`] yields a token that
/// resumes right after the last entry handed out.
pub struct Lister<'a, S: ?Sized> {
    store: &'a S,
    prefix: Option<ResourceKey>,
    filter: ListFilter,
    page_size: usize,
    next_page: Option<ContinuationToken>,
    buffer: VecDeque<Versioned<Resource>>,
    last_yielded: Option<ResourceKey>,
    exhausted: bool,
}

impl<'a, S: ResourceStore + ?Sized> Lister<'a, S> {
    /// Start a listing from the beginning
    pub fn new(store: &'a S, prefix: Option<ResourceKey>, filter: ListFilter) -> Self {
        Self {
            store,
            prefix,
            filter,
            page_size: DEFAULT_PAGE_SIZE,
            next_page: None,
            buffer: VecDeque::new(),
            last_yielded: None,
            exhausted: false,
        }
    }

    /// Resume a listing from a token previously returned by [`Lister::token`]
    pub fn resume(
        store: &'a S,
        prefix: Option<ResourceKey>,
        filter: ListFilter,
        token: ContinuationToken,
    ) -> Self {
        let mut lister = Self::new(store, prefix, filter);
        lister.next_page = Some(token);
        lister
    }

    /// Set the number of entries fetched per round trip
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Next entry, or `None` at the end of the listing
    pub async fn next(&mut self) -> Result<Option<Versioned<Resource>>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .list_page(
                    self.prefix.as_ref(),
                    &self.filter,
                    self.next_page.as_ref(),
                    self.page_size,
                )
                .await?;
            self.exhausted = page.next.is_none();
            self.next_page = page.next;
            self.buffer.extend(page.items);
        }

        let item = self.buffer.pop_front();
        if let Some(item) = &item {
            self.last_yielded = Some(item.key.clone());
        }
        Ok(item)
    }

    /// Token resuming after the last entry returned by [`Lister::next`]
    #[must_use]
    pub fn token(&self) -> Option<ContinuationToken> {
        self.last_yielded
            .as_ref()
            .map(ContinuationToken::after)
            .or_else(|| self.next_page.clone())
    }

    /// Drain the remaining entries
    pub async fn collect_all(mut self) -> Result<Vec<Versioned<Resource>>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}
