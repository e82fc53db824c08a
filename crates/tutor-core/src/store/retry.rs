//! Bounded read-modify-write retries on revision conflicts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ResourceStore, StoreExt, Versioned};
use crate::key::ResourceKey;
use crate::resource::Entity;
use crate::{Result, TutorError};

/// How hard to retry a conflicting compare-and-update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub base_delay_ms: u64,
    /// Backoff cap
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 1,
            max_delay_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Same backoff, but conflicts are retried until the write lands
    ///
    /// For follow-up writes that must not be abandoned once an earlier
    /// write has taken effect.
    #[must_use]
    pub fn persistent(&self) -> Self {
        Self {
            max_attempts: u32::MAX,
            ..self.clone()
        }
    }

    /// Jittered exponential delay before attempt `attempt + 1`
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Read `key`, apply `apply` to a copy and write it back, retrying on conflict
///
/// Errors returned by `apply` abort immediately. Returns the written value
/// and whatever `apply` returned on the successful attempt.
pub async fn update<S, T, R, F>(
    store: &S,
    key: &ResourceKey,
    policy: &RetryPolicy,
    mut apply: F,
) -> Result<(Versioned<T>, R)>
where
    S: ResourceStore + ?Sized,
    T: Entity,
    F: FnMut(&mut T) -> Result<R> + Send,
    R: Send,
{
    let updated = update_if(store, key, policy, |entity| apply(entity).map(Some)).await?;
    // `apply` never declines, so a write always happened
    updated.ok_or_else(|| unreachable_decline(key))
}

/// Like [`update`], but `apply` may decline with `Ok(None)`, in which case
/// nothing is written and `Ok(None)` is returned
pub async fn update_if<S, T, R, F>(
    store: &S,
    key: &ResourceKey,
    policy: &RetryPolicy,
    mut apply: F,
) -> Result<Option<(Versioned<T>, R)>>
where
    S: ResourceStore + ?Sized,
    T: Entity,
    F: FnMut(&mut T) -> Result<Option<R>> + Send,
    R: Send,
{
    let mut attempt = 0;
    loop {
        let current: Versioned<T> = store.get_entity(key).await?;
        let mut next = current.resource.clone();
        let Some(output) = apply(&mut next)? else {
            return Ok(None);
        };

        let written = next.clone();
        match store
            .compare_and_update(key, current.revision, Box::new(move |_| Ok(written.into())))
            .await
        {
            Ok(revision) => {
                return Ok(Some((
                    Versioned {
                        key: key.clone(),
                        revision,
                        resource: next,
                    },
                    output,
                )))
            }
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                debug!("Conflict updating {key}, retry {attempt}");
                tokio::time::sleep(policy.delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn unreachable_decline(key: &ResourceKey) -> TutorError {
    TutorError::InvalidState(format!("update of {key} was declined"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::project::Project;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_concurrent_updates_all_land() {
        let store = Arc::new(MemoryStore::new());
        let key = ResourceKey::project("p");
        let project = Project {
            project_id: "p".into(),
            name: String::new(),
            api_key: "k".into(),
            created_micros: 0,
        };
        store.create_entity(&key, project).await.unwrap();

        let policy = RetryPolicy {
            max_attempts: 100,
            ..RetryPolicy::default()
        };
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            let key = key.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                update(store.as_ref(), &key, &policy, |p: &mut Project| {
                    p.name.push_str(&i.to_string());
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let project: Versioned<Project> = store.get_entity(&key).await.unwrap();
        assert_eq!(project.resource.name.len(), 10);
    }

    #[tokio::test]
    async fn test_apply_error_aborts_without_write() {
        let store = MemoryStore::new();
        let key = ResourceKey::project("p");
        let project = Project {
            project_id: "p".into(),
            name: "n".into(),
            api_key: "k".into(),
            created_micros: 0,
        };
        let revision = store.create_entity(&key, project).await.unwrap();

        let result: Result<(Versioned<Project>, ())> =
            update(&store, &key, &RetryPolicy::default(), |_| {
                Err(TutorError::InvalidState("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.last_modified(&key).await, Some(revision));
    }

    #[tokio::test]
    async fn test_declined_update_writes_nothing() {
        let store = MemoryStore::new();
        let key = ResourceKey::project("p");
        let project = Project {
            project_id: "p".into(),
            name: "n".into(),
            api_key: "k".into(),
            created_micros: 0,
        };
        let revision = store.create_entity(&key, project).await.unwrap();

        let outcome = update_if(&store, &key, &RetryPolicy::default(), |_: &mut Project| {
            Ok(None::<()>)
        })
        .await
        .unwrap();
        assert!(outcome.is_none());
        assert_eq!(store.last_modified(&key).await, Some(revision));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 25,
        };
        for attempt in 0..20 {
            assert!(policy.delay(attempt) <= Duration::from_millis(25));
        }
    }
}
