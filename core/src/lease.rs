//! Per-execution lease: an optimistic lock in the metadata store so exactly
//! one orchestrator instance drives a given execution.

use std::sync::Arc;

use chrono::Duration;
use chrono::Utc;
use tracing::debug;

use rlm_protocol::ExecutionRecord;
use rlm_protocol::LeaseInfo;

use crate::error::Result;
use crate::error::RlmErr;
use crate::storage::Expected;
use crate::storage::MetadataStore;
use crate::storage::execution_sk;
use crate::storage::tenant_pk;

pub struct LeaseController {
    metadata: Arc<dyn MetadataStore>,
    owner: String,
    ttl_seconds: u64,
}

impl LeaseController {
    pub fn new(metadata: Arc<dyn MetadataStore>, owner: String, ttl_seconds: u64) -> Self {
        Self {
            metadata,
            owner,
            ttl_seconds,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn next_lease(&self, current: &LeaseInfo) -> LeaseInfo {
        LeaseInfo {
            owner: Some(self.owner.clone()),
            version: current.version + 1,
            expires_at: Some(Utc::now() + Duration::seconds(self.ttl_seconds as i64)),
        }
    }

    /// Claim the lease with an expected-version conditional write. Fails with
    /// [`RlmErr::LeaseConflict`] when another live instance holds it or when
    /// the conditional write loses a race.
    pub async fn acquire(&self, record: &ExecutionRecord) -> Result<ExecutionRecord> {
        let held_elsewhere = record.lease.owner.as_deref().is_some_and(|owner| {
            owner != self.owner
                && record
                    .lease
                    .expires_at
                    .is_none_or(|expires| expires > Utc::now())
        });
        if held_elsewhere {
            return Err(RlmErr::LeaseConflict(record.execution_id));
        }
        self.write_with_lease(record, self.next_lease(&record.lease))
            .await
    }

    /// Refresh the expiry; also carries any record mutations made by the
    /// caller (consumed budgets, status) in the same conditional write.
    pub async fn renew(&self, record: &ExecutionRecord) -> Result<ExecutionRecord> {
        self.write_with_lease(record, self.next_lease(&record.lease))
            .await
    }

    /// Drop ownership. Terminal transitions call this last.
    pub async fn release(&self, record: &ExecutionRecord) -> Result<ExecutionRecord> {
        let lease = LeaseInfo {
            owner: None,
            version: record.lease.version + 1,
            expires_at: None,
        };
        self.write_with_lease(record, lease).await
    }

    async fn write_with_lease(
        &self,
        record: &ExecutionRecord,
        lease: LeaseInfo,
    ) -> Result<ExecutionRecord> {
        let mut next = record.clone();
        next.lease = lease;
        next.updated_at = Utc::now();
        let item = serde_json::to_value(&next)?;
        let won = self
            .metadata
            .update_if(
                &tenant_pk(&record.tenant),
                &execution_sk(record.execution_id),
                Expected::field_equals("lease.version", record.lease.version.into()),
                item,
            )
            .await?;
        if !won {
            debug!(execution_id = %record.execution_id, "lost lease race");
            return Err(RlmErr::LeaseConflict(record.execution_id));
        }
        Ok(next)
    }
}
