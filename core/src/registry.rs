//! Session, execution, turn and audit records over the metadata store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use rlm_protocol::AuditRecord;
use rlm_protocol::ExecutionRecord;
use rlm_protocol::ExecutionStatus;
use rlm_protocol::Session;
use rlm_protocol::SessionStatus;
use rlm_protocol::StateEnvelope;
use rlm_protocol::TurnRecord;

use crate::error::Result;
use crate::error::RlmErr;
use crate::storage::Expected;
use crate::storage::MetadataStore;
use crate::storage::STATE_SK;
use crate::storage::TURN_SK_PREFIX;
use crate::storage::audit_sk;
use crate::storage::execution_pk;
use crate::storage::execution_sk;
use crate::storage::session_sk;
use crate::storage::tenant_pk;
use crate::storage::turn_sk;

/// Item stored at `(EXEC#{id}, STATE)`: the latest state envelope plus the
/// turn index that produced it, used to guard conditional updates.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateItem {
    pub turn_index: u32,
    pub envelope: StateEnvelope,
}

#[derive(Clone)]
pub struct Registry {
    metadata: Arc<dyn MetadataStore>,
}

impl Registry {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        Arc::clone(&self.metadata)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn put_session(&self, session: &Session) -> Result<()> {
        self.metadata
            .put_item(
                &tenant_pk(&session.tenant),
                &session_sk(session.session_id),
                serde_json::to_value(session)?,
            )
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, tenant: &str, session_id: Uuid) -> Result<Session> {
        let item = self
            .metadata
            .get_item(&tenant_pk(tenant), &session_sk(session_id))
            .await?
            .ok_or(RlmErr::SessionNotFound(session_id))?;
        Ok(serde_json::from_value(item)?)
    }

    /// Load a session and require it to be usable for new executions: status
    /// `READY`, TTL not expired, readiness predicate still satisfied. A
    /// pending session whose documents have all become ready is promoted on
    /// the way through.
    pub async fn ready_session(&self, tenant: &str, session_id: Uuid) -> Result<Session> {
        let mut session = self.get_session(tenant, session_id).await?;
        if session
            .ttl_expires_at
            .is_some_and(|expires| expires <= Utc::now())
        {
            if session.status != SessionStatus::Expired {
                session.status = SessionStatus::Expired;
                self.put_session(&session).await?;
            }
            return Err(RlmErr::SessionNotReady(session_id));
        }
        if session.status == SessionStatus::Pending && session.documents_ready() {
            info!(%session_id, "session readiness predicate satisfied, promoting");
            session.status = SessionStatus::Ready;
            self.put_session(&session).await?;
        }
        if session.status != SessionStatus::Ready || !session.documents_ready() {
            return Err(RlmErr::SessionNotReady(session_id));
        }
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Create an execution record; fails if the id already exists.
    pub async fn create_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let created = self
            .metadata
            .update_if(
                &tenant_pk(&record.tenant),
                &execution_sk(record.execution_id),
                Expected::absent("execution_id"),
                serde_json::to_value(record)?,
            )
            .await?;
        if !created {
            return Err(RlmErr::Validation(format!(
                "execution {} already exists",
                record.execution_id
            )));
        }
        Ok(())
    }

    pub async fn get_execution(&self, tenant: &str, execution_id: Uuid) -> Result<ExecutionRecord> {
        let item = self
            .metadata
            .get_item(&tenant_pk(tenant), &execution_sk(execution_id))
            .await?
            .ok_or(RlmErr::ExecutionNotFound(execution_id))?;
        Ok(serde_json::from_value(item)?)
    }

    pub async fn list_executions(&self, tenant: &str) -> Result<Vec<ExecutionRecord>> {
        let items = self.metadata.query(&tenant_pk(tenant), "EXEC#").await?;
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            records.push(serde_json::from_value(item)?);
        }
        Ok(records)
    }

    /// Status transition guarded on the current status. Terminal states
    /// absorb: transitioning an already-terminal execution returns the
    /// stored record unchanged, which is what makes cancellation idempotent.
    pub async fn transition(
        &self,
        record: &ExecutionRecord,
        to: ExecutionStatus,
        reason: Option<String>,
    ) -> Result<ExecutionRecord> {
        let current = self
            .get_execution(&record.tenant, record.execution_id)
            .await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        let mut next = record.clone();
        let from = current.status;
        next.status = to;
        next.lease = current.lease.clone();
        if to.is_terminal() {
            next.lease.owner = None;
            next.lease.version = current.lease.version + 1;
            next.lease.expires_at = None;
        }
        next.updated_at = Utc::now();
        let won = self
            .metadata
            .update_if(
                &tenant_pk(&record.tenant),
                &execution_sk(record.execution_id),
                Expected::field_equals("status", serde_json::to_value(from)?),
                serde_json::to_value(&next)?,
            )
            .await?;
        if !won {
            // Raced with another transition; re-read and respect the winner.
            let settled = self
                .get_execution(&record.tenant, record.execution_id)
                .await?;
            if settled.status.is_terminal() {
                return Ok(settled);
            }
            warn!(execution_id = %record.execution_id, "status transition race");
            return Err(RlmErr::LeaseConflict(record.execution_id));
        }
        self.append_audit(&AuditRecord {
            tenant: record.tenant.clone(),
            execution_id: record.execution_id,
            from: Some(from),
            to,
            reason,
            at: Utc::now(),
        })
        .await;
        Ok(next)
    }

    async fn append_audit(&self, audit: &AuditRecord) {
        let seq = match self
            .metadata
            .query(
                &tenant_pk(&audit.tenant),
                &format!("AUDIT#{}#", audit.execution_id),
            )
            .await
        {
            Ok(existing) => existing.len() as u64,
            Err(_) => 0,
        };
        let item = match serde_json::to_value(audit) {
            Ok(item) => item,
            Err(e) => {
                warn!("failed to serialize audit record: {e}");
                return;
            }
        };
        // Audit writes are best-effort; they never fail the execution.
        if let Err(e) = self
            .metadata
            .put_item(
                &tenant_pk(&audit.tenant),
                &audit_sk(audit.execution_id, seq),
                item,
            )
            .await
        {
            warn!("failed to append audit record: {e}");
        }
    }

    pub async fn list_audit(&self, tenant: &str, execution_id: Uuid) -> Result<Vec<AuditRecord>> {
        let items = self
            .metadata
            .query(&tenant_pk(tenant), &format!("AUDIT#{execution_id}#"))
            .await?;
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            records.push(serde_json::from_value(item)?);
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Turns and state
    // ------------------------------------------------------------------

    pub async fn save_turn(&self, turn: &TurnRecord) -> Result<()> {
        self.metadata
            .put_item(
                &execution_pk(turn.execution_id),
                &turn_sk(turn.turn_index),
                serde_json::to_value(turn)?,
            )
            .await?;
        Ok(())
    }

    pub async fn list_turns(&self, execution_id: Uuid) -> Result<Vec<TurnRecord>> {
        let items = self
            .metadata
            .query(&execution_pk(execution_id), TURN_SK_PREFIX)
            .await?;
        let mut turns = Vec::with_capacity(items.len());
        for item in items {
            turns.push(serde_json::from_value(item)?);
        }
        Ok(turns)
    }

    /// Write the latest state envelope, guarded by the turn index so a stale
    /// writer can never clobber a newer state.
    pub async fn save_state(
        &self,
        execution_id: Uuid,
        turn_index: u32,
        envelope: &StateEnvelope,
    ) -> Result<()> {
        let item = serde_json::to_value(StateItem {
            turn_index,
            envelope: envelope.clone(),
        })?;
        let pk = execution_pk(execution_id);
        let expected = match self.load_state(execution_id).await? {
            None => Expected::absent("turn_index"),
            Some(current) => {
                if current.turn_index > turn_index {
                    return Err(RlmErr::internal(format!(
                        "stale state write for turn {turn_index} (current {})",
                        current.turn_index
                    )));
                }
                Expected::field_equals("turn_index", current.turn_index.into())
            }
        };
        let won = self.metadata.update_if(&pk, STATE_SK, expected, item).await?;
        if !won {
            return Err(RlmErr::internal(format!(
                "state write race for execution {execution_id}"
            )));
        }
        Ok(())
    }

    pub async fn load_state(&self, execution_id: Uuid) -> Result<Option<StateItem>> {
        let item = self
            .metadata
            .get_item(&execution_pk(execution_id), STATE_SK)
            .await?;
        match item {
            None | Some(Value::Null) => Ok(None),
            Some(item) => Ok(Some(serde_json::from_value(item)?)),
        }
    }

    /// Remove per-execution state items when the execution is pruned; traces
    /// and caches outlive the execution.
    pub async fn prune_execution_state(&self, execution_id: Uuid) -> Result<()> {
        // Turn records and the state item share the execution partition. The
        // memory driver has no batch delete; overwrite with tombstones is
        // unnecessary, deletion happens at the storage lifecycle layer for
        // cloud drivers. Here we only drop the state pointer.
        self.metadata
            .put_item(&execution_pk(execution_id), STATE_SK, Value::Null)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::storage::MemMetadataStore;
    use pretty_assertions::assert_eq;
    use rlm_protocol::BudgetSnapshot;
    use rlm_protocol::ConsumedBudget;
    use rlm_protocol::ExecutionDefaults;
    use rlm_protocol::ExecutionMode;
    use rlm_protocol::LeaseInfo;
    use rlm_protocol::OutputMode;
    use rlm_protocol::ReadinessMode;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemMetadataStore::new()))
    }

    fn execution(tenant: &str) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            mode: ExecutionMode::Answerer,
            output_mode: OutputMode::Answer,
            question: "q".to_string(),
            model: "root".to_string(),
            subcalls_enabled: true,
            budgets: BudgetSnapshot::default(),
            consumed: ConsumedBudget::default(),
            status: ExecutionStatus::Pending,
            answer: None,
            citations: None,
            trace_key: None,
            lease: LeaseInfo::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn session() -> Session {
        Session {
            session_id: Uuid::new_v4(),
            tenant: "t".to_string(),
            documents: Vec::new(),
            readiness: ReadinessMode::Lax,
            status: SessionStatus::Ready,
            defaults: ExecutionDefaults {
                model: "root".to_string(),
                subcalls_enabled: true,
                output_mode: OutputMode::Answer,
                budgets: BudgetSnapshot::default(),
            },
            created_at: Utc::now(),
            ttl_expires_at: None,
        }
    }

    #[tokio::test]
    async fn missing_session_and_execution_are_distinct_errors() {
        let registry = registry();
        assert!(matches!(
            registry.get_session("t", Uuid::nil()).await.unwrap_err(),
            RlmErr::SessionNotFound(_)
        ));
        assert!(matches!(
            registry.get_execution("t", Uuid::nil()).await.unwrap_err(),
            RlmErr::ExecutionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn expired_session_is_not_ready() {
        let registry = registry();
        let mut session = session();
        session.ttl_expires_at = Some(Utc::now() - chrono::Duration::seconds(10));
        registry.put_session(&session).await.unwrap();
        let err = registry
            .ready_session("t", session.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, RlmErr::SessionNotReady(_)));
        // And the stored status was flipped to EXPIRED.
        let stored = registry.get_session("t", session.session_id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn terminal_transitions_absorb_later_signals() {
        let registry = registry();
        let record = execution("t");
        registry.create_execution(&record).await.unwrap();

        let running = registry
            .transition(&record, ExecutionStatus::Running, None)
            .await
            .unwrap();
        let cancelled = registry
            .transition(&running, ExecutionStatus::Cancelled, Some("user".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.lease.owner, None);

        // A second cancel (or any other transition) is a no-op.
        let again = registry
            .transition(&cancelled, ExecutionStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(again.status, ExecutionStatus::Cancelled);

        let audit = registry
            .list_audit("t", record.execution_id)
            .await
            .unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].to, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn duplicate_execution_creation_fails() {
        let registry = registry();
        let record = execution("t");
        registry.create_execution(&record).await.unwrap();
        assert!(registry.create_execution(&record).await.is_err());
    }

    #[tokio::test]
    async fn state_writes_are_guarded_by_turn_index() {
        let registry = registry();
        let execution_id = Uuid::new_v4();
        let envelope = |n: u32| StateEnvelope::Inline {
            state: serde_json::json!({ "turn": n }),
            checksum: format!("sha256:{n}"),
        };
        registry.save_state(execution_id, 0, &envelope(0)).await.unwrap();
        registry.save_state(execution_id, 1, &envelope(1)).await.unwrap();
        // Writing an older turn is rejected.
        assert!(registry.save_state(execution_id, 0, &envelope(0)).await.is_err());
        let current = registry.load_state(execution_id).await.unwrap().unwrap();
        assert_eq!(current.turn_index, 1);
    }

    #[tokio::test]
    async fn turns_list_in_index_order() {
        let registry = registry();
        let execution_id = Uuid::new_v4();
        for i in [0u32, 1, 2] {
            let turn = TurnRecord {
                execution_id,
                turn_index: i,
                code: Some(format!("step {i}")),
                stdout: String::new(),
                state: rlm_protocol::StatePointer::Inline {
                    checksum: "sha256:x".to_string(),
                },
                span_log: Vec::new(),
                tool_requests: Default::default(),
                is_final: false,
                answer: None,
                error: None,
                timings: Default::default(),
                created_at: Utc::now(),
            };
            registry.save_turn(&turn).await.unwrap();
        }
        let turns = registry.list_turns(execution_id).await.unwrap();
        let indexes: Vec<u32> = turns.iter().map(|t| t.turn_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }
}
