use crate::collaborators::{Datastore, ManifestParser};
use crate::entity::{
    Atlas, EntityType, FoilHole, FoilHoleManifest, FoilHolePosition, Grid, GridSquare, Micrograph,
    MicrographManifest,
};
use crate::error_handler::{ErrorHandler, ErrorStats, ProcessingError};
use crate::event::{ClassifiedEvent, FileShape};
use crate::observability::logging::PipelineLog;
use crate::observability::metrics::{MetricsSummary, ProcessingMetrics};
use crate::observability::StatusSnapshot;
use crate::orphan::{OrphanManager, OrphanPayload, OrphanRecord, OrphanStats};
use crate::runtime::queue::QueueTelemetry;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const MODULE: &str = "epu_ingest::processor";

/// Terminal state of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    Success,
    Orphaned,
    Failed,
}

/// Outcome counters for a batch, or cumulative since the last reset.
///
/// Every unit of work counts once: each submitted event and each orphan a
/// cascade releases. `total_processed == successful + orphaned + failed`
/// always holds, and `orphans_resolved` counts the released orphans that are
/// also part of `successful`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub successful: u64,
    pub orphaned: u64,
    pub failed: u64,
    /// Released orphans persisted during a cascade.
    pub orphans_resolved: u64,
}

impl ProcessingStats {
    fn record(&mut self, outcome: ProcessOutcome) {
        self.total_processed += 1;
        match outcome {
            ProcessOutcome::Success => self.successful += 1,
            ProcessOutcome::Orphaned => self.orphaned += 1,
            ProcessOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: &ProcessingStats) {
        self.total_processed += other.total_processed;
        self.successful += other.successful;
        self.orphaned += other.orphaned;
        self.failed += other.failed;
        self.orphans_resolved += other.orphans_resolved;
    }
}

/// Behavior switches that can change while the pipeline runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Park micrographs whose foil-hole is unknown so the foil-hole releases them.
    pub register_micrograph_orphans: bool,
    /// Hand retryable failures to the error handler's delayed requeue.
    pub requeue_retries: bool,
}

#[derive(Debug, Default)]
struct EntityCache {
    grids: BTreeMap<String, Grid>,
    gridsquares: HashMap<String, GridSquare>,
    foilholes: HashMap<String, FoilHole>,
    micrographs: HashMap<String, Micrograph>,
}

enum WorkItem {
    Event(ClassifiedEvent),
    Released(OrphanRecord),
}

impl WorkItem {
    fn event(&self) -> &ClassifiedEvent {
        match self {
            WorkItem::Event(event) => event,
            WorkItem::Released(record) => record.entity_data.event(),
        }
    }
}

type StepResult = Result<ProcessOutcome, ProcessingError>;

/// Turns classified events into persisted entities, parking children whose
/// parent has not been seen and releasing them when it arrives.
pub struct EventProcessor {
    parser: Arc<dyn ManifestParser>,
    datastore: Arc<dyn Datastore>,
    orphans: Arc<OrphanManager>,
    errors: Arc<ErrorHandler>,
    metrics: Arc<ProcessingMetrics>,
    log: PipelineLog,
    options: Mutex<ProcessorOptions>,
    cache: Mutex<EntityCache>,
    stats: Mutex<ProcessingStats>,
}

/// Builder wiring shared components into an [`EventProcessor`].
pub struct EventProcessorBuilder {
    parser: Arc<dyn ManifestParser>,
    datastore: Arc<dyn Datastore>,
    orphans: Option<Arc<OrphanManager>>,
    errors: Option<Arc<ErrorHandler>>,
    metrics: Option<Arc<ProcessingMetrics>>,
    log: Option<PipelineLog>,
    options: ProcessorOptions,
}

impl EventProcessorBuilder {
    pub fn orphans(mut self, orphans: Arc<OrphanManager>) -> Self {
        self.orphans = Some(orphans);
        self
    }

    pub fn error_handler(mut self, errors: Arc<ErrorHandler>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ProcessingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn log(mut self, log: PipelineLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> EventProcessor {
        EventProcessor {
            parser: self.parser,
            datastore: self.datastore,
            orphans: self.orphans.unwrap_or_default(),
            errors: self.errors.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
            log: self.log.unwrap_or_default(),
            options: Mutex::new(self.options),
            cache: Mutex::new(EntityCache::default()),
            stats: Mutex::new(ProcessingStats::default()),
        }
    }
}

impl EventProcessor {
    pub fn new(parser: Arc<dyn ManifestParser>, datastore: Arc<dyn Datastore>) -> Self {
        Self::builder(parser, datastore).build()
    }

    pub fn builder(
        parser: Arc<dyn ManifestParser>,
        datastore: Arc<dyn Datastore>,
    ) -> EventProcessorBuilder {
        EventProcessorBuilder {
            parser,
            datastore,
            orphans: None,
            errors: None,
            metrics: None,
            log: None,
            options: ProcessorOptions::default(),
        }
    }

    pub fn orphans(&self) -> &Arc<OrphanManager> {
        &self.orphans
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn metrics(&self) -> &Arc<ProcessingMetrics> {
        &self.metrics
    }

    pub fn log(&self) -> &PipelineLog {
        &self.log
    }

    pub fn options(&self) -> ProcessorOptions {
        *lock(&self.options)
    }

    pub fn set_options(&self, options: ProcessorOptions) {
        *lock(&self.options) = options;
    }

    /// Processes one event and every orphan it releases.
    pub fn process_event(&self, event: ClassifiedEvent) -> ProcessOutcome {
        let mut batch = ProcessingStats::default();
        let outcome = self.run(event, &mut batch);
        lock(&self.stats).merge(&batch);
        outcome
    }

    /// Processes events in order and folds the batch counters into the totals.
    pub fn process_batch(&self, events: Vec<ClassifiedEvent>) -> ProcessingStats {
        let mut batch = ProcessingStats::default();
        for event in events {
            self.run(event, &mut batch);
        }
        lock(&self.stats).merge(&batch);
        batch
    }

    pub fn get_stats(&self) -> ProcessingStats {
        *lock(&self.stats)
    }

    /// Zeroes the cumulative counters. Cached entities and orphans are kept.
    pub fn reset_stats(&self) {
        *lock(&self.stats) = ProcessingStats::default();
    }

    pub fn get_orphan_stats(&self) -> OrphanStats {
        self.orphans.get_orphan_stats()
    }

    pub fn get_error_stats(&self) -> ErrorStats {
        self.errors.get_error_stats()
    }

    pub fn get_summary(&self) -> MetricsSummary {
        self.metrics.get_summary()
    }

    pub fn status_snapshot(&self, queue: Option<QueueTelemetry>) -> StatusSnapshot {
        StatusSnapshot {
            stats: self.get_stats(),
            orphans: self.get_orphan_stats(),
            errors: self.get_error_stats(),
            metrics: self.get_summary(),
            queue,
        }
    }

    /// Drops orphans older than `max_age`, logging each one at ERROR.
    pub fn expire_orphans(&self, max_age: Duration) -> Vec<OrphanRecord> {
        let expired = self.orphans.check_timeouts(max_age);
        for record in &expired {
            self.log.error(
                MODULE,
                Some(&record.file_path.to_string_lossy()),
                &format!(
                    "{} gave up waiting on {} after {}s",
                    record.entity_type,
                    record.required_parent_natural_id,
                    record.age(Instant::now()).as_secs()
                ),
            );
        }
        expired
    }

    /// Grid cached for this data directory, if any.
    pub fn known_grid(&self, data_dir: &str) -> Option<Grid> {
        self.cache().grids.get(data_dir).cloned()
    }

    pub fn known_gridsquare(&self, natural_id: &str) -> Option<GridSquare> {
        self.cache().gridsquares.get(natural_id).cloned()
    }

    pub fn known_foilhole(&self, natural_id: &str) -> Option<FoilHole> {
        self.cache().foilholes.get(natural_id).cloned()
    }

    pub fn known_micrograph(&self, natural_id: &str) -> Option<Micrograph> {
        self.cache().micrographs.get(natural_id).cloned()
    }

    fn run(&self, event: ClassifiedEvent, batch: &mut ProcessingStats) -> ProcessOutcome {
        let started = Instant::now();
        let mut work = VecDeque::new();
        let outcome = self.step_guarded(WorkItem::Event(event), &mut work);
        batch.record(outcome);
        while let Some(item) = work.pop_front() {
            let released = self.step_guarded(item, &mut work);
            batch.record(released);
            if released == ProcessOutcome::Success {
                batch.orphans_resolved += 1;
            }
        }
        self.metrics
            .record_latency(started.elapsed().as_secs_f64() * 1_000.0);
        outcome
    }

    /// Runs one work item, turning a handler panic into a failed outcome so the
    /// rest of the worklist and batch still run.
    fn step_guarded(&self, item: WorkItem, work: &mut VecDeque<WorkItem>) -> ProcessOutcome {
        let path = item.event().path_key();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.step(item, work)));
        result.unwrap_or_else(|cause| {
            let reason = cause
                .downcast_ref::<&str>()
                .map(|text| (*text).to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            self.log.error(
                MODULE,
                Some(&path),
                &format!("event handler panicked: {reason}"),
            );
            self.metrics.record_failure();
            ProcessOutcome::Failed
        })
    }

    fn step(&self, item: WorkItem, work: &mut VecDeque<WorkItem>) -> ProcessOutcome {
        let (event, result) = match item {
            WorkItem::Event(event) => {
                let result = self.dispatch(&event, work);
                (event, result)
            }
            WorkItem::Released(record) => match record.entity_data {
                OrphanPayload::RawEvent(event) => {
                    let result = self.dispatch(&event, work);
                    (event, result)
                }
                OrphanPayload::PartialFoilHole { event, manifest } => {
                    let result = self.persist_foilhole(&event, manifest, work);
                    (event, result)
                }
                OrphanPayload::PartialMicrograph { event, manifest } => {
                    let result = self.persist_micrograph(&event, manifest);
                    (event, result)
                }
            },
        };
        match result {
            Ok(ProcessOutcome::Success) => {
                self.errors.record_success(&event.path_key());
                self.metrics.record_success();
                ProcessOutcome::Success
            }
            Ok(outcome) => outcome,
            Err(err) => self.fail(&event, err),
        }
    }

    fn dispatch(&self, event: &ClassifiedEvent, work: &mut VecDeque<WorkItem>) -> StepResult {
        match event.entity_type {
            EntityType::Grid => self.process_grid(event, work),
            EntityType::Atlas => self.process_atlas(event, work),
            EntityType::GridSquare => self.process_gridsquare(event, work),
            EntityType::FoilHole => {
                let manifest = self.parser.parse_foilhole_manifest(&event.file_path)?;
                self.persist_foilhole(event, manifest, work)
            }
            EntityType::Micrograph => {
                let manifest = self.parser.parse_micrograph_manifest(&event.file_path)?;
                self.persist_micrograph(event, manifest)
            }
            EntityType::Unknown => {
                self.log.debug(
                    MODULE,
                    Some(&event.path_key()),
                    "ignoring file that matches no EPU shape",
                );
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    fn process_grid(&self, event: &ClassifiedEvent, work: &mut VecDeque<WorkItem>) -> StepResult {
        let data_dir = natural_id(event)?;
        let manifest = self.parser.parse_session_manifest(&event.file_path)?;
        let existing = self.known_grid(&data_dir);
        let grid = Grid {
            data_dir: data_dir.clone(),
            name: manifest.name,
            acquisition_start: manifest.acquisition_start,
            atlas: existing.as_ref().and_then(|grid| grid.atlas.clone()),
        };
        if existing.is_some() {
            self.datastore.update_grid(&grid)?;
        } else {
            self.datastore.create_grid(&grid)?;
        }
        self.cache().grids.insert(data_dir.clone(), grid);
        self.release(EntityType::Grid, &data_dir, work);
        Ok(ProcessOutcome::Success)
    }

    fn process_atlas(&self, event: &ClassifiedEvent, work: &mut VecDeque<WorkItem>) -> StepResult {
        let Some(mut grid) = self.grid_for(event) else {
            return self.park(
                event,
                OrphanPayload::RawEvent(event.clone()),
                event.parent_natural_id.clone(),
            );
        };
        let manifest = self.parser.parse_atlas_manifest(&event.file_path)?;
        grid.atlas = Some(Atlas {
            grid_dir: grid.data_dir.clone(),
            atlas_id: manifest.atlas_id,
            name: manifest.name,
            file_path: event.path_key(),
        });
        self.datastore.update_grid(&grid)?;
        self.cache().grids.insert(grid.data_dir.clone(), grid.clone());

        for position in manifest.gridsquare_positions {
            let square_id = position.gridsquare_id.clone();
            match self.known_gridsquare(&square_id) {
                Some(mut square) => {
                    square.position = Some(position);
                    self.datastore.update_gridsquare(&square)?;
                    self.cache().gridsquares.insert(square_id, square);
                }
                None => {
                    let square = GridSquare {
                        natural_id: square_id.clone(),
                        grid_dir: grid.data_dir.clone(),
                        position: Some(position),
                        metadata: None,
                        manifest: None,
                        placeholder: true,
                    };
                    self.datastore.create_gridsquare(&square)?;
                    self.cache().gridsquares.insert(square_id.clone(), square);
                    self.release(EntityType::GridSquare, &square_id, work);
                }
            }
        }
        self.datastore.grid_registered(&grid)?;
        Ok(ProcessOutcome::Success)
    }

    fn process_gridsquare(
        &self,
        event: &ClassifiedEvent,
        work: &mut VecDeque<WorkItem>,
    ) -> StepResult {
        let square_id = natural_id(event)?;
        let Some(grid) = self.grid_for(event) else {
            return self.park(
                event,
                OrphanPayload::RawEvent(event.clone()),
                event.parent_natural_id.clone(),
            );
        };
        let existing = self.known_gridsquare(&square_id);
        let is_new = existing.is_none();
        let mut square = existing.unwrap_or_else(|| GridSquare {
            natural_id: square_id.clone(),
            grid_dir: grid.data_dir.clone(),
            ..GridSquare::default()
        });

        let mut declared_holes = Vec::new();
        if event.shape == FileShape::GridSquareManifest {
            square.manifest = Some(self.parser.parse_gridsquare_manifest(&event.file_path)?);
        } else {
            let metadata = self.parser.parse_gridsquare_metadata(&event.file_path)?;
            let cache = self.cache();
            declared_holes = metadata
                .foilhole_positions
                .iter()
                .filter(|position| !cache.foilholes.contains_key(&position.foilhole_id))
                .map(|position| FoilHole {
                    natural_id: position.foilhole_id.clone(),
                    gridsquare_id: square_id.clone(),
                    position: Some(position.clone()),
                    manifest: None,
                    placeholder: true,
                })
                .collect();
            drop(cache);
            square.metadata = Some(metadata);
        }
        square.placeholder = false;

        if is_new {
            self.datastore.create_gridsquare(&square)?;
        } else {
            self.datastore.update_gridsquare(&square)?;
        }
        self.cache().gridsquares.insert(square_id.clone(), square);
        // Once cached, the square is a visible parent; its waiters go now even
        // if the bulk create below fails.
        self.release(EntityType::GridSquare, &square_id, work);

        if !declared_holes.is_empty() {
            self.datastore.create_foilholes(&square_id, &declared_holes)?;
            let mut cache = self.cache();
            for hole in &declared_holes {
                cache.foilholes.insert(hole.natural_id.clone(), hole.clone());
            }
        }
        for hole in &declared_holes {
            self.release(EntityType::FoilHole, &hole.natural_id, work);
        }
        Ok(ProcessOutcome::Success)
    }

    fn persist_foilhole(
        &self,
        event: &ClassifiedEvent,
        manifest: FoilHoleManifest,
        work: &mut VecDeque<WorkItem>,
    ) -> StepResult {
        let hole_id = natural_id(event)?;
        let parent = event
            .parent_natural_id
            .clone()
            .or_else(|| manifest.gridsquare_id.clone());
        let known = parent
            .as_ref()
            .is_some_and(|id| self.cache().gridsquares.contains_key(id));
        let square_id = match parent {
            Some(id) if known => id,
            other => {
                return self.park(
                    event,
                    OrphanPayload::PartialFoilHole {
                        event: event.clone(),
                        manifest,
                    },
                    other,
                )
            }
        };

        let existing = self.known_foilhole(&hole_id);
        let position = match (manifest.x, manifest.y) {
            (Some(x), Some(y)) => Some(FoilHolePosition {
                foilhole_id: hole_id.clone(),
                x,
                y,
                diameter: manifest.diameter.unwrap_or_default(),
            }),
            _ => existing.as_ref().and_then(|hole| hole.position.clone()),
        };
        let hole = FoilHole {
            natural_id: hole_id.clone(),
            gridsquare_id: square_id,
            position,
            manifest: Some(manifest),
            placeholder: false,
        };
        if existing.is_some() {
            self.datastore.update_foilhole(&hole)?;
        } else {
            self.datastore.create_foilhole(&hole)?;
        }
        self.cache().foilholes.insert(hole_id.clone(), hole);
        self.release(EntityType::FoilHole, &hole_id, work);
        Ok(ProcessOutcome::Success)
    }

    fn persist_micrograph(&self, event: &ClassifiedEvent, manifest: MicrographManifest) -> StepResult {
        let micrograph_id = natural_id(event)?;
        let parent = event
            .parent_natural_id
            .clone()
            .or_else(|| manifest.foilhole_id.clone());
        let known = parent
            .as_ref()
            .is_some_and(|id| self.cache().foilholes.contains_key(id));
        let foilhole_id = match parent {
            Some(id) if known => id,
            other if self.options().register_micrograph_orphans => {
                return self.park(
                    event,
                    OrphanPayload::PartialMicrograph {
                        event: event.clone(),
                        manifest,
                    },
                    other,
                )
            }
            Some(id) => {
                self.log.warn(
                    MODULE,
                    Some(&event.path_key()),
                    &format!("micrograph {micrograph_id} skipped: foil-hole {id} not seen yet"),
                );
                return Ok(ProcessOutcome::Orphaned);
            }
            None => return Err(missing_parent(event)),
        };

        let is_new = !self.cache().micrographs.contains_key(&micrograph_id);
        let micrograph = Micrograph {
            natural_id: micrograph_id.clone(),
            foilhole_id,
            file_path: event.path_key(),
            manifest,
        };
        if is_new {
            self.datastore.create_micrograph(&micrograph)?;
        } else {
            self.datastore.update_micrograph(&micrograph)?;
        }
        self.cache().micrographs.insert(micrograph_id, micrograph);
        Ok(ProcessOutcome::Success)
    }

    /// Registers the payload against its parent and reports the event as orphaned.
    fn park(
        &self,
        event: &ClassifiedEvent,
        payload: OrphanPayload,
        parent_id: Option<String>,
    ) -> StepResult {
        let parent_id = parent_id.ok_or_else(|| missing_parent(event))?;
        self.orphans
            .register_orphan(
                payload,
                event.entity_type,
                parent_id.clone(),
                event.file_path.clone(),
            )
            .map_err(|err| ProcessingError::Other(err.to_string()))?;
        let parent_type = event
            .entity_type
            .orphan_anchor()
            .map_or("parent", EntityType::as_str);
        self.log.warn(
            MODULE,
            Some(&event.path_key()),
            &format!(
                "{} orphaned until {parent_type} {parent_id} is seen",
                event.entity_type
            ),
        );
        Ok(ProcessOutcome::Orphaned)
    }

    fn release(&self, parent_type: EntityType, parent_id: &str, work: &mut VecDeque<WorkItem>) {
        let released = self.orphans.resolve_orphans_for(parent_type, parent_id);
        if released.is_empty() {
            return;
        }
        self.log.info(
            MODULE,
            None,
            &format!(
                "{parent_type} {parent_id} released {} orphan(s)",
                released.len()
            ),
        );
        work.extend(released.into_iter().map(WorkItem::Released));
    }

    fn fail(&self, event: &ClassifiedEvent, err: ProcessingError) -> ProcessOutcome {
        let path = event.path_key();
        let category = self.errors.categorize_error(&err, &path);
        if self.errors.should_retry(&err, &path) {
            let retry = self.errors.record_retry(&path, category);
            self.metrics.record_retry(category.as_str());
            self.log.warn(
                MODULE,
                Some(&path),
                &format!(
                    "{} failed ({category}), attempt {} of {}: {err}",
                    event.entity_type,
                    retry.attempt_count,
                    self.errors.policy().max_retries
                ),
            );
            if self.options().requeue_retries {
                self.errors.schedule_retry(event.clone(), Instant::now());
            }
        } else {
            self.errors.record_permanent_failure(&err, &path);
            let reason = if category.is_retryable() {
                "retries exhausted"
            } else {
                "permanent failure"
            };
            self.log.error(
                MODULE,
                Some(&path),
                &format!("{} {reason} ({category}): {err}", event.entity_type),
            );
        }
        self.metrics.record_failure();
        ProcessOutcome::Failed
    }

    /// Longest cached data directory containing the event path, else the
    /// directory named by the classifier.
    fn grid_for(&self, event: &ClassifiedEvent) -> Option<Grid> {
        let cache = self.cache();
        let by_path = cache
            .grids
            .values()
            .filter(|grid| event.file_path.starts_with(Path::new(&grid.data_dir)))
            .max_by_key(|grid| grid.data_dir.len())
            .cloned();
        by_path.or_else(|| {
            event
                .parent_natural_id
                .as_ref()
                .and_then(|dir| cache.grids.get(dir).cloned())
        })
    }

    fn cache(&self) -> MutexGuard<'_, EntityCache> {
        lock(&self.cache)
    }
}

fn natural_id(event: &ClassifiedEvent) -> Result<String, ProcessingError> {
    event
        .natural_id
        .clone()
        .ok_or_else(|| ProcessingError::MissingIdentity {
            entity: event.entity_type,
            path: event.path_key(),
        })
}

fn missing_parent(event: &ClassifiedEvent) -> ProcessingError {
    ProcessingError::MissingParent {
        entity: event.entity_type,
        path: event.path_key(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
