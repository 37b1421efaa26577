#![allow(dead_code)]

use epu_ingest::{
    classify, AtlasManifest, ChangeKind, ClassifiedEvent, Datastore, DatastoreError, FoilHole,
    FoilHoleManifest, Grid, GridSquare, GridSquareManifest, GridSquareMetadata, ManifestParser,
    Micrograph, MicrographManifest, ParseError, SessionManifest,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

pub const SESSION: &str = "/data/session1";

pub fn event(path: &str) -> ClassifiedEvent {
    classify(path, ChangeKind::Created, SystemTime::UNIX_EPOCH)
}

pub fn session_path() -> String {
    format!("{SESSION}/EpuSession.dm")
}

pub fn atlas_path() -> String {
    format!("{SESSION}/Atlas/Atlas.dm")
}

pub fn gridsquare_metadata_path(square: &str) -> String {
    format!("{SESSION}/Metadata/GridSquare_{square}.dm")
}

pub fn gridsquare_manifest_path(square: &str) -> String {
    format!("{SESSION}/Images-Disc1/GridSquare_{square}/GridSquare_20240101_101500.xml")
}

pub fn foilhole_path(square: &str, hole: &str) -> String {
    format!("{SESSION}/Images-Disc1/GridSquare_{square}/FoilHoles/FoilHole_{hole}_1_1.xml")
}

pub fn micrograph_path(square: &str, hole: &str, data: &str) -> String {
    format!("{SESSION}/Images-Disc1/GridSquare_{square}/Data/FoilHole_{hole}_Data_{data}.xml")
}

pub fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

/// Parser returning canned manifests, with scripted failures per path.
#[derive(Default)]
pub struct FakeParser {
    atlases: Mutex<HashMap<String, AtlasManifest>>,
    metadata: Mutex<HashMap<String, GridSquareMetadata>>,
    failures: Mutex<HashMap<String, VecDeque<ParseError>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_atlas(&self, path: &str, manifest: AtlasManifest) {
        self.atlases
            .lock()
            .unwrap()
            .insert(path.to_string(), manifest);
    }

    pub fn with_metadata(&self, path: &str, metadata: GridSquareMetadata) {
        self.metadata
            .lock()
            .unwrap()
            .insert(path.to_string(), metadata);
    }

    pub fn fail_next(&self, path: &str, error: ParseError) {
        self.failures
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn enter(&self, path: &Path) -> Result<String, ParseError> {
        let key = path.to_string_lossy().into_owned();
        self.calls.lock().unwrap().push(key.clone());
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(key)
    }
}

impl ManifestParser for FakeParser {
    fn parse_session_manifest(&self, path: &Path) -> Result<SessionManifest, ParseError> {
        self.enter(path)?;
        Ok(SessionManifest {
            name: "session1".into(),
            acquisition_start: Some("2024-01-01T10:00:00".into()),
            atlas_path: None,
        })
    }

    fn parse_atlas_manifest(&self, path: &Path) -> Result<AtlasManifest, ParseError> {
        let key = self.enter(path)?;
        Ok(self
            .atlases
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn parse_gridsquare_metadata(&self, path: &Path) -> Result<GridSquareMetadata, ParseError> {
        let key = self.enter(path)?;
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn parse_gridsquare_manifest(&self, path: &Path) -> Result<GridSquareManifest, ParseError> {
        self.enter(path)?;
        Ok(GridSquareManifest {
            acquired_at: Some("2024-01-01T10:15:00".into()),
            pixel_size: Some(1.2),
            image_path: None,
        })
    }

    fn parse_foilhole_manifest(&self, path: &Path) -> Result<FoilHoleManifest, ParseError> {
        self.enter(path)?;
        Ok(FoilHoleManifest {
            gridsquare_id: None,
            acquired_at: Some("2024-01-01T10:20:00".into()),
            x: Some(10.0),
            y: Some(20.0),
            diameter: Some(1.5),
        })
    }

    fn parse_micrograph_manifest(&self, path: &Path) -> Result<MicrographManifest, ParseError> {
        self.enter(path)?;
        Ok(MicrographManifest {
            foilhole_id: None,
            acquired_at: Some("2024-01-01T10:21:00".into()),
            defocus: Some(-1.5),
            dose: Some(40.0),
            image_path: None,
        })
    }
}

/// Datastore recording every call as `op:key`, with scripted failures per op.
#[derive(Default)]
pub struct RecordingDatastore {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<DatastoreError>>>,
}

impl RecordingDatastore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, op: &str, error: DatastoreError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op}:");
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(&prefix))
            .collect()
    }

    fn record(&self, op: &str, key: &str) -> Result<(), DatastoreError> {
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        self.calls.lock().unwrap().push(format!("{op}:{key}"));
        Ok(())
    }
}

impl Datastore for RecordingDatastore {
    fn create_grid(&self, grid: &Grid) -> Result<(), DatastoreError> {
        self.record("create_grid", &grid.data_dir)
    }

    fn update_grid(&self, grid: &Grid) -> Result<(), DatastoreError> {
        self.record("update_grid", &grid.data_dir)
    }

    fn grid_registered(&self, grid: &Grid) -> Result<(), DatastoreError> {
        self.record("grid_registered", &grid.data_dir)
    }

    fn create_gridsquare(&self, square: &GridSquare) -> Result<(), DatastoreError> {
        self.record("create_gridsquare", &square.natural_id)
    }

    fn update_gridsquare(&self, square: &GridSquare) -> Result<(), DatastoreError> {
        self.record("update_gridsquare", &square.natural_id)
    }

    fn create_foilholes(
        &self,
        gridsquare_id: &str,
        holes: &[FoilHole],
    ) -> Result<(), DatastoreError> {
        let ids: Vec<&str> = holes.iter().map(|hole| hole.natural_id.as_str()).collect();
        self.record(
            "create_foilholes",
            &format!("{gridsquare_id}:{}", ids.join(",")),
        )
    }

    fn create_foilhole(&self, hole: &FoilHole) -> Result<(), DatastoreError> {
        self.record("create_foilhole", &hole.natural_id)
    }

    fn update_foilhole(&self, hole: &FoilHole) -> Result<(), DatastoreError> {
        self.record("update_foilhole", &hole.natural_id)
    }

    fn create_micrograph(&self, micrograph: &Micrograph) -> Result<(), DatastoreError> {
        self.record("create_micrograph", &micrograph.natural_id)
    }

    fn update_micrograph(&self, micrograph: &Micrograph) -> Result<(), DatastoreError> {
        self.record("update_micrograph", &micrograph.natural_id)
    }
}
