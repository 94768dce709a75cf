use std::fmt;
use std::str::FromStr;

use postgres::reindex::shared_entity::{self, SharedEntityDescriptor};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, ReindexError};

pub use postgres::reindex::shared_entity::{EntityCapabilities, WriteTarget};

/// Entity types tracked by merge ranges, upload ranges and the status ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReindexEntityType {
    Instance,
    Holding,
    Item,
    Classification,
    Contributor,
    Subject,
    CallNumber,
}

impl ReindexEntityType {
    pub const ALL: [ReindexEntityType; 7] = [
        Self::Instance,
        Self::Holding,
        Self::Item,
        Self::Classification,
        Self::Contributor,
        Self::Subject,
        Self::CallNumber,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Holding => "holding",
            Self::Item => "item",
            Self::Classification => "classification",
            Self::Contributor => "contributor",
            Self::Subject => "subject",
            Self::CallNumber => "call_number",
        }
    }

    /// Whether the type is consolidated during the merge phase.
    pub fn is_merge_target(&self) -> bool {
        matches!(self, Self::Instance | Self::Holding | Self::Item)
    }

    /// The shared entity backing this type, if any.
    pub fn sub_resource(&self) -> Option<SubResourceType> {
        match self {
            Self::Classification => Some(SubResourceType::Classification),
            Self::Contributor => Some(SubResourceType::Contributor),
            Self::Subject => Some(SubResourceType::Subject),
            Self::CallNumber => Some(SubResourceType::CallNumber),
            Self::Instance | Self::Holding | Self::Item => None,
        }
    }
}

impl fmt::Display for ReindexEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReindexEntityType {
    type Err = ReindexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match Self::ALL.into_iter().find(|t| t.as_str() == value) {
            Some(entity_type) => Ok(entity_type),
            None => bail!(
                ErrorKind::InvalidData,
                "Unknown reindex entity type",
                value.to_string()
            ),
        }
    }
}

/// Shared entity types aggregated by the sub-resources pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResourceType {
    Classification,
    Contributor,
    Subject,
    CallNumber,
}

impl SubResourceType {
    pub const ALL: [SubResourceType; 4] = [
        Self::Classification,
        Self::Contributor,
        Self::Subject,
        Self::CallNumber,
    ];

    pub fn descriptor(&self) -> &'static SharedEntityDescriptor {
        match self {
            Self::Classification => &shared_entity::CLASSIFICATION,
            Self::Contributor => &shared_entity::CONTRIBUTOR,
            Self::Subject => &shared_entity::SUBJECT,
            Self::CallNumber => &shared_entity::CALL_NUMBER,
        }
    }

    pub fn capabilities(&self) -> EntityCapabilities {
        self.descriptor().capabilities()
    }

    pub fn as_str(&self) -> &'static str {
        self.descriptor().entity_type
    }

    pub fn entity_type(&self) -> ReindexEntityType {
        match self {
            Self::Classification => ReindexEntityType::Classification,
            Self::Contributor => ReindexEntityType::Contributor,
            Self::Subject => ReindexEntityType::Subject,
            Self::CallNumber => ReindexEntityType::CallNumber,
        }
    }
}

impl fmt::Display for SubResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a merge range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeRangeStatus {
    New,
    InProgress,
    Success,
    Fail,
}

impl MergeRangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
        }
    }
}

impl fmt::Display for MergeRangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeRangeStatus {
    type Err = ReindexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NEW" => Ok(Self::New),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown merge range status",
                other.to_string()
            ),
        }
    }
}

/// Status of an entity type in the reindex ledger.
///
/// The completed variants are only ever written by the orchestrator through
/// [`crate::store::reindex_status::ReindexStatusRepository::save_reindex_status_records`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReindexStatusKind {
    MergeInProgress,
    MergeCompleted,
    MergeFailed,
    UploadInProgress,
    UploadCompleted,
    UploadFailed,
}

impl ReindexStatusKind {
    const ALL: [ReindexStatusKind; 6] = [
        Self::MergeInProgress,
        Self::MergeCompleted,
        Self::MergeFailed,
        Self::UploadInProgress,
        Self::UploadCompleted,
        Self::UploadFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeInProgress => "MERGE_IN_PROGRESS",
            Self::MergeCompleted => "MERGE_COMPLETED",
            Self::MergeFailed => "MERGE_FAILED",
            Self::UploadInProgress => "UPLOAD_IN_PROGRESS",
            Self::UploadCompleted => "UPLOAD_COMPLETED",
            Self::UploadFailed => "UPLOAD_FAILED",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::MergeFailed | Self::UploadFailed)
    }
}

impl fmt::Display for ReindexStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReindexStatusKind {
    type Err = ReindexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match Self::ALL.into_iter().find(|s| s.as_str() == value) {
            Some(status) => Ok(status),
            None => bail!(
                ErrorKind::InvalidData,
                "Unknown reindex status",
                value.to_string()
            ),
        }
    }
}
