use reindex::error::ReindexResult;
use reindex::store::shared_entity::SharedEntityRecord;
use reindex::types::SubResourceType;
use reindex::workers::sub_resources::SubResourceConsumer;
use tracing::info;

/// Reports aggregated pages through tracing.
///
/// Used when no index client is wired in, so aggregation progress can still be followed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingConsumer;

impl SubResourceConsumer for TracingConsumer {
    async fn consume(
        &self,
        entity_type: SubResourceType,
        tenant_id: &str,
        records: &[SharedEntityRecord],
    ) -> ReindexResult<()> {
        let instance_links: usize = records.iter().map(|r| r.instances.len()).sum();
        info!(
            %entity_type,
            tenant_id,
            records = records.len(),
            instance_links,
            "aggregated sub-resource page"
        );

        Ok(())
    }
}
