use crate::entity::{EntityType, FoilHoleManifest, MicrographManifest};
use crate::event::ClassifiedEvent;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// What an orphan carries until its parent shows up.
#[derive(Debug, Clone, PartialEq)]
pub enum OrphanPayload {
    /// Nothing parsed yet; the event is replayed in full on release.
    RawEvent(ClassifiedEvent),
    /// Manifest already parsed; only persistence is pending.
    PartialFoilHole {
        event: ClassifiedEvent,
        manifest: FoilHoleManifest,
    },
    PartialMicrograph {
        event: ClassifiedEvent,
        manifest: MicrographManifest,
    },
}

impl OrphanPayload {
    pub fn event(&self) -> &ClassifiedEvent {
        match self {
            OrphanPayload::RawEvent(event)
            | OrphanPayload::PartialFoilHole { event, .. }
            | OrphanPayload::PartialMicrograph { event, .. } => event,
        }
    }
}

/// Entity blocked on a parent that has not been observed locally.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanRecord {
    pub entity_data: OrphanPayload,
    pub entity_type: EntityType,
    pub required_parent_natural_id: String,
    pub file_path: PathBuf,
    pub registered_at: Instant,
}

impl OrphanRecord {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.registered_at)
    }
}

/// Rejection raised by [`OrphanManager::register_orphan`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum OrphanError {
    #[error("entity type {0} cannot wait on a parent")]
    UnsupportedType(EntityType),
}

/// Pending orphans per child type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrphansByType {
    pub gridsquare: usize,
    pub foilhole: usize,
    pub micrograph: usize,
    pub atlas: usize,
}

impl OrphansByType {
    fn bump(&mut self, entity_type: EntityType, count: usize) {
        match entity_type {
            EntityType::GridSquare => self.gridsquare += count,
            EntityType::FoilHole => self.foilhole += count,
            EntityType::Micrograph => self.micrograph += count,
            EntityType::Atlas => self.atlas += count,
            EntityType::Grid | EntityType::Unknown => {}
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrphanStats {
    pub total_orphans: usize,
    pub by_type: OrphansByType,
    pub total_resolved: u64,
    pub total_timed_out: u64,
}

type OrphanKey = (EntityType, String);

#[derive(Debug, Default)]
struct OrphanState {
    buckets: HashMap<OrphanKey, VecDeque<OrphanRecord>>,
    total_resolved: u64,
    total_timed_out: u64,
}

/// Holds entities waiting on a parent, keyed by (parent type, parent natural id).
///
/// Each bucket keeps registration order; resolution removes a whole bucket
/// under the lock so a record is handed to exactly one caller.
#[derive(Debug, Default)]
pub struct OrphanManager {
    state: Mutex<OrphanState>,
}

impl OrphanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_orphan(
        &self,
        entity_data: OrphanPayload,
        entity_type: EntityType,
        required_parent_natural_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Result<(), OrphanError> {
        self.register_orphan_at(
            entity_data,
            entity_type,
            required_parent_natural_id,
            file_path,
            Instant::now(),
        )
    }

    /// Same as [`register_orphan`](Self::register_orphan) with an explicit registration time.
    pub fn register_orphan_at(
        &self,
        entity_data: OrphanPayload,
        entity_type: EntityType,
        required_parent_natural_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        registered_at: Instant,
    ) -> Result<(), OrphanError> {
        let parent_type = entity_type
            .orphan_anchor()
            .ok_or(OrphanError::UnsupportedType(entity_type))?;
        let required_parent_natural_id = required_parent_natural_id.into();
        let record = OrphanRecord {
            entity_data,
            entity_type,
            required_parent_natural_id: required_parent_natural_id.clone(),
            file_path: file_path.into(),
            registered_at,
        };
        self.lock()
            .buckets
            .entry((parent_type, required_parent_natural_id))
            .or_default()
            .push_back(record);
        Ok(())
    }

    /// Removes and returns every orphan waiting on this exact parent, oldest first.
    pub fn resolve_orphans_for(
        &self,
        parent_entity_type: EntityType,
        parent_natural_id: &str,
    ) -> Vec<OrphanRecord> {
        let mut state = self.lock();
        let key = (parent_entity_type, parent_natural_id.to_string());
        let Some(bucket) = state.buckets.remove(&key) else {
            return Vec::new();
        };
        state.total_resolved = state.total_resolved.saturating_add(bucket.len() as u64);
        bucket.into_iter().collect()
    }

    pub fn check_timeouts(&self, max_age: Duration) -> Vec<OrphanRecord> {
        self.check_timeouts_at(Instant::now(), max_age)
    }

    /// Removes and returns orphans whose age at `now` is at least `max_age`,
    /// ordered by registration time.
    pub fn check_timeouts_at(&self, now: Instant, max_age: Duration) -> Vec<OrphanRecord> {
        let mut state = self.lock();
        let mut expired = Vec::new();
        state.buckets.retain(|_, bucket| {
            let mut kept = VecDeque::with_capacity(bucket.len());
            for record in bucket.drain(..) {
                if record.age(now) >= max_age {
                    expired.push(record);
                } else {
                    kept.push_back(record);
                }
            }
            *bucket = kept;
            !bucket.is_empty()
        });
        state.total_timed_out = state.total_timed_out.saturating_add(expired.len() as u64);
        expired.sort_by_key(|record| record.registered_at);
        expired
    }

    /// Number of orphans currently waiting on the given parent.
    pub fn pending_for(&self, parent_entity_type: EntityType, parent_natural_id: &str) -> usize {
        self.lock()
            .buckets
            .get(&(parent_entity_type, parent_natural_id.to_string()))
            .map_or(0, VecDeque::len)
    }

    pub fn get_orphan_stats(&self) -> OrphanStats {
        let state = self.lock();
        let mut by_type = OrphansByType::default();
        let mut total_orphans = 0usize;
        for bucket in state.buckets.values() {
            total_orphans += bucket.len();
            for record in bucket {
                by_type.bump(record.entity_type, 1);
            }
        }
        OrphanStats {
            total_orphans,
            by_type,
            total_resolved: state.total_resolved,
            total_timed_out: state.total_timed_out,
        }
    }

    /// Drops every pending orphan and resets the counters.
    pub fn clear(&self) {
        *self.lock() = OrphanState::default();
    }

    fn lock(&self) -> MutexGuard<'_, OrphanState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
