use crate::entity::EntityType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const SESSION_MANIFEST: &str = "EpuSession.dm";
const ATLAS_MANIFEST: &str = "Atlas.dm";
const GRIDSQUARE_PREFIX: &str = "GridSquare_";
const FOILHOLE_PREFIX: &str = "FoilHole_";
const METADATA_DIR: &str = "Metadata";
const DATA_MARKER: &str = "_Data_";

/// Change reported by the filesystem watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
}

/// EPU file shape recognized from the path alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileShape {
    SessionManifest,
    AtlasManifest,
    GridSquareMetadata,
    GridSquareManifest,
    FoilHoleManifest,
    MicrographManifest,
    Unrecognized,
}

impl FileShape {
    pub fn entity_type(self) -> EntityType {
        match self {
            FileShape::SessionManifest => EntityType::Grid,
            FileShape::AtlasManifest => EntityType::Atlas,
            FileShape::GridSquareMetadata | FileShape::GridSquareManifest => {
                EntityType::GridSquare
            }
            FileShape::FoilHoleManifest => EntityType::FoilHole,
            FileShape::MicrographManifest => EntityType::Micrograph,
            FileShape::Unrecognized => EntityType::Unknown,
        }
    }
}

/// Immutable result of classifying one filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedEvent {
    pub file_path: PathBuf,
    pub entity_type: EntityType,
    pub shape: FileShape,
    pub natural_id: Option<String>,
    /// Parent natural id when the path alone reveals it.
    pub parent_natural_id: Option<String>,
    pub change_kind: ChangeKind,
    pub observed_at: SystemTime,
}

impl ClassifiedEvent {
    fn new(
        path: &Path,
        shape: FileShape,
        natural_id: Option<String>,
        parent_natural_id: Option<String>,
        change_kind: ChangeKind,
        observed_at: SystemTime,
    ) -> Self {
        Self {
            file_path: path.to_path_buf(),
            entity_type: shape.entity_type(),
            shape,
            natural_id,
            parent_natural_id,
            change_kind,
            observed_at,
        }
    }

    fn unrecognized(path: &Path, change_kind: ChangeKind, observed_at: SystemTime) -> Self {
        Self::new(
            path,
            FileShape::Unrecognized,
            None,
            None,
            change_kind,
            observed_at,
        )
    }

    pub fn is_unknown(&self) -> bool {
        self.entity_type == EntityType::Unknown
    }

    /// Path rendered for logs and retry bookkeeping.
    pub fn path_key(&self) -> String {
        self.file_path.to_string_lossy().into_owned()
    }
}

/// Classifies a path into an acquisition event. Total: unmatched paths are UNKNOWN.
pub fn classify(
    path: impl AsRef<Path>,
    change_kind: ChangeKind,
    observed_at: SystemTime,
) -> ClassifiedEvent {
    let path = path.as_ref();
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return ClassifiedEvent::unrecognized(path, change_kind, observed_at);
    };

    if file_name == SESSION_MANIFEST {
        let data_dir = ancestor_dir(path, 1).unwrap_or_else(|| ".".to_string());
        return ClassifiedEvent::new(
            path,
            FileShape::SessionManifest,
            Some(data_dir),
            None,
            change_kind,
            observed_at,
        );
    }

    if file_name == ATLAS_MANIFEST {
        return ClassifiedEvent::new(
            path,
            FileShape::AtlasManifest,
            ancestor_dir(path, 1),
            ancestor_dir(path, 2),
            change_kind,
            observed_at,
        );
    }

    if let Some(rest) = file_name.strip_prefix(GRIDSQUARE_PREFIX) {
        if let Some(id) = rest.strip_suffix(".dm").filter(|id| is_numeric(id)) {
            let parent = if ancestor_name(path, 1) == Some(METADATA_DIR) {
                ancestor_dir(path, 2)
            } else {
                ancestor_dir(path, 1)
            };
            return ClassifiedEvent::new(
                path,
                FileShape::GridSquareMetadata,
                Some(id.to_string()),
                parent,
                change_kind,
                observed_at,
            );
        }
        if rest.ends_with(".xml") {
            let enclosing = ancestor_name(path, 1).and_then(gridsquare_dir_id);
            if let Some(id) = enclosing {
                return ClassifiedEvent::new(
                    path,
                    FileShape::GridSquareManifest,
                    Some(id.to_string()),
                    ancestor_dir(path, 3),
                    change_kind,
                    observed_at,
                );
            }
        }
        return ClassifiedEvent::unrecognized(path, change_kind, observed_at);
    }

    if let Some(stem) = file_name
        .strip_prefix(FOILHOLE_PREFIX)
        .and_then(|rest| rest.strip_suffix(".xml"))
    {
        let foilhole_id = stem.split('_').next().filter(|id| is_numeric(id));
        let Some(foilhole_id) = foilhole_id else {
            return ClassifiedEvent::unrecognized(path, change_kind, observed_at);
        };
        let after_id = &stem[foilhole_id.len()..];
        if let Some(micrograph_id) = after_id.strip_prefix(DATA_MARKER) {
            if micrograph_id.is_empty() {
                return ClassifiedEvent::unrecognized(path, change_kind, observed_at);
            }
            return ClassifiedEvent::new(
                path,
                FileShape::MicrographManifest,
                Some(micrograph_id.to_string()),
                Some(foilhole_id.to_string()),
                change_kind,
                observed_at,
            );
        }
        if !after_id.is_empty() && !after_id.starts_with('_') {
            return ClassifiedEvent::unrecognized(path, change_kind, observed_at);
        }
        let gridsquare_id = path
            .ancestors()
            .skip(1)
            .filter_map(|dir| dir.file_name().and_then(|name| name.to_str()))
            .find_map(gridsquare_dir_id)
            .map(str::to_string);
        return ClassifiedEvent::new(
            path,
            FileShape::FoilHoleManifest,
            Some(foilhole_id.to_string()),
            gridsquare_id,
            change_kind,
            observed_at,
        );
    }

    ClassifiedEvent::unrecognized(path, change_kind, observed_at)
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// `GridSquare_<digits>` directory names yield the grid-square id.
fn gridsquare_dir_id(name: &str) -> Option<&str> {
    name.strip_prefix(GRIDSQUARE_PREFIX)
        .filter(|id| is_numeric(id))
}

fn ancestor_dir(path: &Path, depth: usize) -> Option<String> {
    path.ancestors()
        .nth(depth)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.to_string_lossy().into_owned())
}

fn ancestor_name(path: &Path, depth: usize) -> Option<&str> {
    path.ancestors()
        .nth(depth)
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
}
