//! Partitioning of the merge and upload keyspaces into units of work.

use chrono::Utc;
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, ReindexResult};
use crate::store::merge_range::MergeRange;
use crate::store::upload_range::UploadRange;
use crate::types::{MergeRangeStatus, ReindexEntityType};

/// Splits the 128 bit id space of `entity_type` in `tenant_id` into `count` contiguous ranges.
///
/// The first range starts at the nil uuid, the last one ends at the max uuid and every range
/// starts right after the end of the previous one.
pub fn build_merge_ranges(
    entity_type: ReindexEntityType,
    tenant_id: &str,
    count: u32,
) -> ReindexResult<Vec<MergeRange>> {
    if count == 0 {
        bail!(
            ErrorKind::InvalidData,
            "Merge range count must be greater than 0"
        );
    }

    let created_at = Utc::now();
    let step = u128::MAX / u128::from(count);

    let ranges = (0..u128::from(count))
        .map(|i| {
            let lower = i * step;
            let upper = if i + 1 == u128::from(count) {
                u128::MAX
            } else {
                (i + 1) * step - 1
            };

            MergeRange {
                id: Uuid::new_v4(),
                entity_type,
                tenant_id: tenant_id.to_string(),
                lower: Uuid::from_u128(lower),
                upper: Uuid::from_u128(upper),
                created_at,
                finished_at: None,
                status: MergeRangeStatus::New,
                fail_cause: None,
            }
        })
        .collect();

    Ok(ranges)
}

/// Splits `total` entities into `ceil(total / range_size)` pages.
///
/// Range ids are UUIDv5 values derived from entity type and offset.
pub fn build_upload_ranges(
    entity_type: ReindexEntityType,
    total: u64,
    range_size: u32,
) -> ReindexResult<Vec<UploadRange>> {
    if range_size == 0 {
        bail!(
            ErrorKind::InvalidData,
            "Upload range size must be greater than 0"
        );
    }

    let created_at = Utc::now();
    let range_count = total.div_ceil(u64::from(range_size));

    (0..range_count)
        .map(|i| -> ReindexResult<UploadRange> {
            let offset = u32::try_from(i * u64::from(range_size))?;
            Ok(UploadRange {
                id: upload_range_id(entity_type, offset),
                entity_type,
                limit: range_size,
                offset,
                created_at,
                finished_at: None,
            })
        })
        .collect()
}

fn upload_range_id(entity_type: ReindexEntityType, offset: u32) -> Uuid {
    let name = format!("{entity_type}:{offset}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}
