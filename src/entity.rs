use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kinds produced by an EPU acquisition, plus the catch-all for files we ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Grid,
    Atlas,
    GridSquare,
    FoilHole,
    Micrograph,
    Unknown,
}

/// Child → parent edges of the acquisition hierarchy. ATLAS and GRID have no entry.
pub const PARENT_TYPE_MAP: [(EntityType, EntityType); 3] = [
    (EntityType::GridSquare, EntityType::Grid),
    (EntityType::FoilHole, EntityType::GridSquare),
    (EntityType::Micrograph, EntityType::FoilHole),
];

impl EntityType {
    /// Canonical lowercase label used in logs, stats, and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Grid => "grid",
            EntityType::Atlas => "atlas",
            EntityType::GridSquare => "gridsquare",
            EntityType::FoilHole => "foilhole",
            EntityType::Micrograph => "micrograph",
            EntityType::Unknown => "unknown",
        }
    }

    /// Parent type according to [`PARENT_TYPE_MAP`].
    pub fn parent(self) -> Option<EntityType> {
        PARENT_TYPE_MAP
            .iter()
            .find(|(child, _)| *child == self)
            .map(|(_, parent)| *parent)
    }

    /// Type whose arrival releases an orphan of this type.
    ///
    /// Atlases are not part of the parent map but still wait on their grid.
    pub fn orphan_anchor(self) -> Option<EntityType> {
        match self {
            EntityType::Atlas => Some(EntityType::Grid),
            other => other.parent(),
        }
    }

    pub fn is_root(self) -> bool {
        matches!(self, EntityType::Grid)
    }

    pub fn all() -> [EntityType; 6] {
        [
            EntityType::Grid,
            EntityType::Atlas,
            EntityType::GridSquare,
            EntityType::FoilHole,
            EntityType::Micrograph,
            EntityType::Unknown,
        ]
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields read from an `EpuSession.dm` manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub name: String,
    pub acquisition_start: Option<String>,
    pub atlas_path: Option<String>,
}

/// Placement of a grid-square on the atlas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridSquarePosition {
    pub gridsquare_id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Fields read from an `Atlas.dm` manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtlasManifest {
    pub atlas_id: String,
    pub name: String,
    pub gridsquare_positions: Vec<GridSquarePosition>,
}

/// Placement of a foil-hole inside a grid-square image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoilHolePosition {
    pub foilhole_id: String,
    pub x: f64,
    pub y: f64,
    pub diameter: f64,
}

/// Fields read from a `Metadata/GridSquare_<n>.dm` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridSquareMetadata {
    pub atlas_node_id: Option<String>,
    pub stage_x: Option<f64>,
    pub stage_y: Option<f64>,
    pub foilhole_positions: Vec<FoilHolePosition>,
}

/// Fields read from a grid-square image manifest (`GridSquare_<ts>.xml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridSquareManifest {
    pub acquired_at: Option<String>,
    pub pixel_size: Option<f64>,
    pub image_path: Option<String>,
}

/// Fields read from a foil-hole manifest (`FoilHole_<n>_<ts>.xml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoilHoleManifest {
    pub gridsquare_id: Option<String>,
    pub acquired_at: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub diameter: Option<f64>,
}

/// Fields read from a micrograph manifest (`FoilHole_<n>_Data_<...>.xml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicrographManifest {
    pub foilhole_id: Option<String>,
    pub acquired_at: Option<String>,
    pub defocus: Option<f64>,
    pub dose: Option<f64>,
    pub image_path: Option<String>,
}

/// Root of the hierarchy, identified by its data directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub data_dir: String,
    pub name: String,
    pub acquisition_start: Option<String>,
    pub atlas: Option<Atlas>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Atlas {
    pub grid_dir: String,
    pub atlas_id: String,
    pub name: String,
    pub file_path: String,
}

/// Grid-square assembled from whichever of metadata/manifest/atlas position is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridSquare {
    pub natural_id: String,
    pub grid_dir: String,
    pub position: Option<GridSquarePosition>,
    pub metadata: Option<GridSquareMetadata>,
    pub manifest: Option<GridSquareManifest>,
    /// True while only the low-magnification atlas placement is known.
    pub placeholder: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoilHole {
    pub natural_id: String,
    pub gridsquare_id: String,
    pub position: Option<FoilHolePosition>,
    pub manifest: Option<FoilHoleManifest>,
    /// True while only the position declared by grid-square metadata is known.
    pub placeholder: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Micrograph {
    pub natural_id: String,
    pub foilhole_id: String,
    pub file_path: String,
    pub manifest: MicrographManifest,
}
