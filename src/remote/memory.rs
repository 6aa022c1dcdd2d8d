//! In-process remote store and passage lookup.
//!
//! Behaves like the HTTP remote: it assigns its own ids, locates rows by
//! `(owner, ItemKey)`, and reports `Error::Connectivity` for every call
//! while set offline. Individual references can be made to fail so batch
//! partial failures can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::model::{Item, ItemKey, Operation, Progress, ProgressPatch, ReviewEvent};
use crate::reference::{canonicalize_reference, normalize_reference};

use super::{
    BatchCounts, BatchRequest, BatchResponse, BatchResult, LookupOperation, LookupRequest,
    LookupResponse, PassageLookup, RemoteProgress, RemoteStore,
};

#[derive(Debug, Default)]
struct State {
    online: bool,
    items: Vec<Item>,
    progress: Vec<RemoteProgress>,
    reviews: Vec<(ItemKey, ReviewEvent)>,
    /// normalized spelling -> (canonical reference, translation, text)
    catalog: HashMap<String, (String, String, String)>,
    failing_references: HashSet<String>,
    /// Apply writes, then report a timeout as if the reply never arrived.
    lose_replies: bool,
    calls: CallCounts,
}

/// Number of calls the remote has served, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub upserts: usize,
    pub review_inserts: usize,
    pub batches: usize,
    pub lookups: usize,
}

/// In-memory remote replica.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                online: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.lock();
        if state.online {
            Ok(state)
        } else {
            Err(Error::Connectivity("remote is offline".to_string()))
        }
    }

    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Make every write touching `canonical_reference` fail.
    pub fn fail_reference(&self, canonical_reference: &str) {
        self.lock()
            .failing_references
            .insert(canonical_reference.to_string());
    }

    /// Apply review writes but answer with a connectivity error, the way a
    /// request that times out after the server committed it looks.
    pub fn lose_replies(&self, lose: bool) {
        self.lock().lose_replies = lose;
    }

    pub fn clear_failures(&self) {
        self.lock().failing_references.clear();
    }

    /// Register a passage the lookup collaborator can resolve.
    pub fn add_passage(&self, canonical_reference: &str, translation: &str, text: &str) {
        self.lock().catalog.insert(
            normalize_reference(canonical_reference),
            (
                canonical_reference.to_string(),
                translation.to_string(),
                text.to_string(),
            ),
        );
    }

    /// Seed a progress row directly, as if another device had pushed it.
    pub fn seed_progress(&self, item: &Item, progress: &Progress) -> RemoteProgress {
        let mut state = self.lock();
        let item = state.ensure_item(item);
        state.write_progress(&item, progress)
    }

    /// Seed a review event directly.
    pub fn seed_review(&self, item: &ItemKey, event: &ReviewEvent) {
        self.lock().reviews.push((item.clone(), event.clone()));
    }

    #[must_use]
    pub fn progress_rows(&self) -> Vec<RemoteProgress> {
        self.lock().progress.clone()
    }

    #[must_use]
    pub fn review_events(&self, item: &ItemKey) -> Vec<ReviewEvent> {
        self.lock()
            .reviews
            .iter()
            .filter(|(key, _)| key == item)
            .map(|(_, event)| event.clone())
            .collect()
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }
}

impl State {
    fn find_item(&self, key: &ItemKey) -> Option<&Item> {
        self.items.iter().find(|i| i.key() == *key)
    }

    fn ensure_item(&mut self, item: &Item) -> Item {
        if let Some(existing) = self.find_item(&item.key()) {
            return existing.clone();
        }
        let stored = Item {
            id: format!("ritem_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            ..item.clone()
        };
        self.items.push(stored.clone());
        stored
    }

    /// Index of the owner's row for `key`: active first, else newest archived.
    fn find_progress_index(&self, owner_id: &str, key: &ItemKey) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, row) in self.progress.iter().enumerate() {
            if row.progress.owner_id != owner_id || row.item != *key {
                continue;
            }
            best = match best {
                None => Some(idx),
                Some(current) => {
                    let cur = &self.progress[current].progress;
                    let better = (!row.progress.archived && cur.archived)
                        || (row.progress.archived == cur.archived
                            && row.progress.updated_at > cur.updated_at);
                    Some(if better { idx } else { current })
                }
            };
        }
        best
    }

    fn write_progress(&mut self, item: &Item, progress: &Progress) -> RemoteProgress {
        let key = item.key();
        match self.find_progress_index(&progress.owner_id, &key) {
            Some(idx) => {
                let row = &mut self.progress[idx];
                let id = row.progress.id.clone();
                let created_at = row.progress.created_at;
                row.progress = Progress {
                    id,
                    item_id: item.id.clone(),
                    created_at,
                    ..progress.clone()
                };
                row.clone()
            }
            None => {
                let row = RemoteProgress {
                    item: key,
                    progress: Progress {
                        id: format!("rprog_{}", &uuid::Uuid::new_v4().to_string()[..12]),
                        item_id: item.id.clone(),
                        ..progress.clone()
                    },
                };
                self.progress.push(row.clone());
                row
            }
        }
    }

    fn reply<T>(&self, value: T) -> Result<T> {
        if self.lose_replies {
            return Err(Error::Connectivity("reply lost after write".to_string()));
        }
        Ok(value)
    }

    fn check_failing(&self, key: &ItemKey) -> Result<()> {
        if self.failing_references.contains(&key.canonical_reference) {
            return Err(Error::Remote(format!("rejected write for {key}")));
        }
        Ok(())
    }

    fn upsert(&mut self, owner_id: &str, item: &Item, progress: &Progress) -> Result<RemoteProgress> {
        self.check_failing(&item.key())?;
        self.calls.upserts += 1;
        let stored_item = self.ensure_item(item);
        let progress = Progress {
            owner_id: owner_id.to_string(),
            ..progress.clone()
        };
        Ok(self.write_progress(&stored_item, &progress))
    }

    fn insert_review(&mut self, owner_id: &str, key: &ItemKey, event: &ReviewEvent) -> Result<String> {
        self.check_failing(key)?;
        let idx = self
            .find_progress_index(owner_id, key)
            .ok_or_else(|| Error::Remote(format!("no progress for {key}")))?;
        self.calls.review_inserts += 1;
        let event = ReviewEvent {
            id: format!("rrev_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            owner_id: owner_id.to_string(),
            progress_id: self.progress[idx].progress.id.clone(),
            ..event.clone()
        };
        let remote_id = event.id.clone();
        self.reviews.push((key.clone(), event));
        Ok(remote_id)
    }
}

impl RemoteStore for MemoryRemote {
    async fn is_available(&self) -> bool {
        self.lock().online
    }

    async fn pull_progress_since(&self, owner_id: &str, since: i64) -> Result<Vec<RemoteProgress>> {
        let state = self.online()?;
        let mut rows: Vec<RemoteProgress> = state
            .progress
            .iter()
            .filter(|r| r.progress.owner_id == owner_id && r.progress.updated_at > since)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.progress.updated_at);
        Ok(rows)
    }

    async fn find_progress(&self, owner_id: &str, item: &ItemKey) -> Result<Option<RemoteProgress>> {
        let state = self.online()?;
        Ok(state
            .find_progress_index(owner_id, item)
            .map(|idx| state.progress[idx].clone()))
    }

    async fn fetch_item(&self, item: &ItemKey) -> Result<Option<Item>> {
        let state = self.online()?;
        Ok(state.find_item(item).cloned())
    }

    async fn upsert_progress(&self, owner_id: &str, item: &Item, progress: &Progress) -> Result<RemoteProgress> {
        self.online()?.upsert(owner_id, item, progress)
    }

    async fn review_events_between(
        &self,
        owner_id: &str,
        item: &ItemKey,
        from: i64,
        to: i64,
    ) -> Result<Vec<ReviewEvent>> {
        let state = self.online()?;
        Ok(state
            .reviews
            .iter()
            .filter(|(key, e)| {
                key == item && e.owner_id == owner_id && e.created_at >= from && e.created_at <= to
            })
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn insert_review_event(&self, owner_id: &str, item: &ItemKey, event: &ReviewEvent) -> Result<()> {
        let mut state = self.online()?;
        state.insert_review(owner_id, item, event)?;
        state.reply(())
    }

    async fn execute_batch(&self, request: &BatchRequest) -> Result<BatchResponse> {
        let mut state = self.online()?;
        state.calls.batches += 1;

        let mut results = Vec::with_capacity(request.operations.len());
        for op in &request.operations {
            let Operation::RecordReview { item, event } = &op.operation;
            let outcome = state
                .insert_review(&request.owner_id, item, event)
                .map(|remote_id| serde_json::json!({ "remote_id": remote_id }));
            results.push(match outcome {
                Ok(data) => BatchResult {
                    id: op.id.clone(),
                    success: true,
                    data: Some(data),
                    error: None,
                },
                Err(e) => BatchResult {
                    id: op.id.clone(),
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                },
            });
        }

        let successful = results.iter().filter(|r| r.success).count();
        let summary = BatchCounts {
            successful,
            failed: results.len() - successful,
        };
        state.reply(BatchResponse { results, summary })
    }
}

impl PassageLookup for MemoryRemote {
    async fn lookup(&self, request: &LookupRequest) -> Result<LookupResponse> {
        let mut state = self.online()?;
        state.calls.lookups += 1;

        let canonical_key = canonicalize_reference(&request.reference)
            .map(|c| normalize_reference(&c))
            .unwrap_or_default();
        let entry = state
            .catalog
            .get(&request.normalized_reference)
            .or_else(|| state.catalog.get(&canonical_key))
            .filter(|(_, translation, _)| *translation == request.translation)
            .cloned();

        let Some((reference, translation, text)) = entry else {
            return Err(Error::Validation {
                reference: request.reference.clone(),
                message: "not a recognized passage".to_string(),
            });
        };

        let now = Utc::now().timestamp_millis();
        let candidate = Item {
            id: String::new(),
            canonical_reference: reference,
            body_text: text,
            source_translation: translation,
            verified: true,
            created_at: now,
            updated_at: now,
        };
        let item = state.ensure_item(&candidate);

        if request.operation == LookupOperation::Lookup {
            return Ok(LookupResponse {
                item: Some(item),
                existing_progress: None,
            });
        }

        let key = item.key();
        let today = Utc::now().date_naive();
        let progress = match state.find_progress_index(&request.owner_id, &key) {
            Some(idx) if !state.progress[idx].progress.archived => {
                return Err(Error::Duplicate {
                    existing: Box::new(state.progress[idx].progress.clone()),
                    on_remote: true,
                });
            }
            Some(idx) => {
                let row = &mut state.progress[idx];
                row.progress.apply(&ProgressPatch::reactivation(today, now));
                row.progress.clone()
            }
            None => {
                let fresh = Progress::new(&request.owner_id, &item.id, today);
                state.write_progress(&item, &fresh).progress
            }
        };

        Ok(LookupResponse {
            item: Some(item),
            existing_progress: Some(progress),
        })
    }
}
