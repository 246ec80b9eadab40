//! Queue item data types.
//!
//! Items are pure data: they hold no references to the services acting on
//! them. All mutation goes through the [`Queue`](super::Queue) API.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapters::FileSnapshot;
use crate::metadata::{Metadata, MetadataStub};

/// Monotonic identifier assigned at admission, stable across reorderings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coarse progress milestone for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Import,
    Title,
    Metadata,
    Persist,
    Transcode,
    Completed,
}

impl Stage {
    /// The stage following this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Import => Some(Stage::Title),
            Stage::Title => Some(Stage::Metadata),
            Stage::Metadata => Some(Stage::Persist),
            Stage::Persist => Some(Stage::Transcode),
            Stage::Transcode => Some(Stage::Completed),
            Stage::Completed => None,
        }
    }
}

/// Fine-grained runtime state within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Paused,
    NeedsAttention,
    NeedsResolving,
    Cancelling,
    Cancelled,
    Completed,
}

impl Status {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Cancelled | Status::Completed)
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition(&self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (Pending, Processing) => true,
            (Pending, Cancelled) => true,
            (Processing, Pending) => true,
            (Processing, Paused) => true,
            (Processing, NeedsAttention) => true,
            (Processing, NeedsResolving) => true,
            (Processing, Cancelling) => true,
            (Processing, Completed) => true,
            (Paused, Processing) => true,
            (Paused, Cancelling) => true,
            (NeedsResolving, Pending) => true,
            (NeedsResolving, Cancelled) => true,
            (NeedsAttention, Pending) => true,
            (NeedsAttention, Cancelling) => true,
            (NeedsAttention, Cancelled) => true,
            (Cancelling, Cancelled) => true,
            _ => false,
        }
    }
}

/// Parsed identity of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TitleInfo {
    /// An episode of a series.
    Episode {
        title: String,
        season: u32,
        episode: u32,
    },
    /// A standalone movie tagged with its release year.
    Movie { title: String, year: u32 },
}

impl TitleInfo {
    pub fn title(&self) -> &str {
        match self {
            TitleInfo::Episode { title, .. } => title,
            TitleInfo::Movie { title, .. } => title,
        }
    }

    pub fn is_episodic(&self) -> bool {
        matches!(self, TitleInfo::Episode { .. })
    }

    pub fn season(&self) -> Option<u32> {
        match self {
            TitleInfo::Episode { season, .. } => Some(*season),
            TitleInfo::Movie { .. } => None,
        }
    }

    pub fn episode(&self) -> Option<u32> {
        match self {
            TitleInfo::Episode { episode, .. } => Some(*episode),
            TitleInfo::Movie { .. } => None,
        }
    }

    pub fn year(&self) -> Option<u32> {
        match self {
            TitleInfo::Episode { .. } => None,
            TitleInfo::Movie { year, .. } => Some(*year),
        }
    }
}

/// Title parse state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TitleState {
    #[default]
    Unknown,
    Parsed(TitleInfo),
}

impl TitleState {
    pub fn info(&self) -> Option<&TitleInfo> {
        match self {
            TitleState::Unknown => None,
            TitleState::Parsed(info) => Some(info),
        }
    }
}

/// Metadata lookup state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MetadataState {
    #[default]
    Unknown,
    /// The fetcher returned several candidates; an external resolution must
    /// choose one.
    Ambiguous { stubs: Vec<MetadataStub> },
    /// A stub was chosen externally; the next metadata pass looks it up by id.
    Resolved { stub_id: String },
    Known(Metadata),
}

impl MetadataState {
    pub fn known(&self) -> Option<&Metadata> {
        match self {
            MetadataState::Known(meta) => Some(meta),
            _ => None,
        }
    }
}

/// A recoverable, human-resolvable condition attached to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trouble {
    /// The filename could not be parsed into a title.
    UnparsableTitle,
    /// Several metadata candidates matched; one must be chosen.
    MetadataAmbiguous { stubs: Vec<MetadataStub> },
    /// The metadata provider found nothing for this title.
    MetadataMiss,
    /// The metadata provider stayed unreachable past the retry cap.
    MetadataUnavailable { attempts: u32 },
    /// An encoder exited non-zero.
    TranscodeFailed { target_label: String, detail: String },
    /// The store rejected the media graph.
    PersistFailed { detail: String },
}

impl Trouble {
    /// The status this trouble parks the item in.
    pub fn parks_in(&self) -> Status {
        match self {
            Trouble::MetadataAmbiguous { .. } => Status::NeedsResolving,
            Trouble::UnparsableTitle
            | Trouble::MetadataMiss
            | Trouble::MetadataUnavailable { .. }
            | Trouble::TranscodeFailed { .. }
            | Trouble::PersistFailed { .. } => Status::NeedsAttention,
        }
    }
}

/// One source file tracked through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Absolute path of the source file; stable for the item's lifetime.
    pub path: PathBuf,
    /// File name, for display and title parsing.
    pub name: String,
    /// File attributes captured at admission.
    pub file: FileSnapshot,
    pub stage: Stage,
    pub status: Status,
    pub title: TitleState,
    pub metadata: MetadataState,
    pub trouble: Option<Trouble>,
    /// Persisted media identity, set once the persist stage has run.
    pub media_id: Option<Uuid>,
}

impl Item {
    pub(crate) fn new(id: ItemId, path: PathBuf, file: FileSnapshot) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self {
            id,
            path,
            name,
            file,
            stage: Stage::Import,
            status: Status::Pending,
            title: TitleState::Unknown,
            metadata: MetadataState::Unknown,
            trouble: None,
            media_id: None,
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
