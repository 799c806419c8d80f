use gscsync_adapters::RecordStore;
use gscsync_core::{AnalyticsRow, RecordId, RowKey, RowProperties};
use serde::Serialize;
use tracing::warn;

use crate::writer::RateLimitedWriter;
use crate::{DestinationWriteError, WriteOperation};

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertAction {
    Create {
        properties: RowProperties,
    },
    Update {
        id: RecordId,
        properties: RowProperties,
    },
}

impl UpsertAction {
    pub fn operation(&self) -> WriteOperation {
        match self {
            UpsertAction::Create { .. } => WriteOperation::Create,
            UpsertAction::Update { .. } => WriteOperation::Update,
        }
    }

    pub fn properties(&self) -> &RowProperties {
        match self {
            UpsertAction::Create { properties } | UpsertAction::Update { properties, .. } => {
                properties
            }
        }
    }
}

/// More than one destination record carries the same key. The first one in
/// store order is updated; the others are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupAmbiguity {
    pub key: RowKey,
    pub matches: usize,
    pub chosen: RecordId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertDecision {
    pub action: UpsertAction,
    pub ambiguity: Option<LookupAmbiguity>,
}

/// Create when nothing matches the key, otherwise overwrite the first match.
pub fn decide(row: &AnalyticsRow, key: RowKey, existing: Vec<RecordId>) -> UpsertDecision {
    let matches = existing.len();
    let properties = RowProperties::from_row(key.clone(), row);
    let Some(first) = existing.into_iter().next() else {
        return UpsertDecision {
            action: UpsertAction::Create { properties },
            ambiguity: None,
        };
    };

    let ambiguity = (matches > 1).then(|| {
        warn!(%key, matches, chosen = %first, "several destination records share one key");
        LookupAmbiguity {
            key,
            matches,
            chosen: first.clone(),
        }
    });

    UpsertDecision {
        action: UpsertAction::Update {
            id: first,
            properties,
        },
        ambiguity,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UpsertPlanner;

impl UpsertPlanner {
    /// Look the key up through the writer's pacing and decide. Nothing is
    /// cached between rows.
    pub async fn plan<S: RecordStore + ?Sized>(
        &self,
        writer: &mut RateLimitedWriter<'_, S>,
        row: &AnalyticsRow,
        key: RowKey,
    ) -> Result<UpsertDecision, DestinationWriteError> {
        let existing = writer.find_by_key(&key).await?;
        Ok(decide(row, key, existing))
    }
}
