//! In-memory reference implementation of the approval storage traits.
//!
//! Requests and confirmations live behind one lock so a confirmation write
//! and a status compare-and-swap on the same request can never interleave.
//! Production deployments should use the PostgreSQL adapter.

use crate::traits::{ApprovalStorage, ConfirmationStore, QueryWindow, RequestStore, StatusUpdate};
use crate::{StorageError, StorageResult};
use approval_types::{
    ApprovalRequest, ApprovalStatus, Confirmation, DomainKind, RecordedConfirmation, RequestId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct Tables {
    requests: HashMap<RequestId, ApprovalRequest>,
    confirmations: HashMap<RequestId, Vec<Confirmation>>,
}

/// In-memory approval storage adapter.
#[derive(Default)]
pub struct InMemoryApprovalStorage {
    tables: RwLock<Tables>,
}

impl InMemoryApprovalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StorageError::Backend("approval tables lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StorageError::Backend("approval tables lock poisoned".to_string()))
    }
}

#[async_trait]
impl RequestStore for InMemoryApprovalStorage {
    async fn create_request(&self, request: ApprovalRequest) -> StorageResult<RequestId> {
        let mut guard = self.write()?;
        if guard.requests.contains_key(&request.id) {
            return Err(StorageError::Duplicate(format!(
                "request {} already exists",
                request.id
            )));
        }
        let id = request.id.clone();
        guard.requests.insert(id.clone(), request);
        guard.confirmations.entry(id.clone()).or_default();
        Ok(id)
    }

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<ApprovalRequest>> {
        let guard = self.read()?;
        Ok(guard.requests.get(request_id).cloned())
    }

    async fn update_status(
        &self,
        request_id: &RequestId,
        expected: ApprovalStatus,
        new: ApprovalStatus,
        update: StatusUpdate,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<ApprovalRequest> {
        let mut guard = self.write()?;
        let record = guard
            .requests
            .get_mut(request_id)
            .ok_or_else(|| StorageError::NotFound(request_id.to_string()))?;

        if record.status != expected {
            return Err(StorageError::Conflict {
                request_id: request_id.clone(),
                expected,
                found: record.status,
            });
        }
        if let Some(attempt) = update.expected_attempt {
            if record.execution_attempts != attempt {
                return Err(StorageError::StaleAttempt {
                    request_id: request_id.clone(),
                    expected: attempt,
                    found: record.execution_attempts,
                });
            }
        }

        record.status = new;
        record.updated_at = updated_at;
        update.apply(record);
        Ok(record.clone())
    }

    async fn list_pending(
        &self,
        domain: DomainKind,
        window: QueryWindow,
    ) -> StorageResult<Vec<ApprovalRequest>> {
        let guard = self.read()?;
        let mut values = guard
            .requests
            .values()
            .filter(|request| request.kind() == domain && !request.is_terminal())
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl ConfirmationStore for InMemoryApprovalStorage {
    async fn record_confirmation(
        &self,
        confirmation: Confirmation,
    ) -> StorageResult<RecordedConfirmation> {
        let mut guard = self.write()?;
        let status = guard
            .requests
            .get(&confirmation.request_id)
            .map(|request| request.status)
            .ok_or_else(|| StorageError::NotFound(confirmation.request_id.to_string()))?;

        if !status.accepts_decisions() {
            return Err(StorageError::Closed {
                request_id: confirmation.request_id.clone(),
                status,
            });
        }

        let records = guard
            .confirmations
            .entry(confirmation.request_id.clone())
            .or_default();

        let mut superseded = None;
        for existing in records.iter_mut() {
            if existing.approver_id == confirmation.approver_id && existing.is_active() {
                existing.supersede(&confirmation.id, confirmation.timestamp);
                superseded = Some(existing.clone());
            }
        }

        records.push(confirmation.clone());
        Ok(RecordedConfirmation {
            confirmation,
            superseded,
        })
    }

    async fn active_confirmations(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<Confirmation>> {
        let guard = self.read()?;
        Ok(guard
            .confirmations
            .get(request_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn confirmation_history(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<Confirmation>> {
        let guard = self.read()?;
        Ok(guard
            .confirmations
            .get(request_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl ApprovalStorage for InMemoryApprovalStorage {
    fn backend_label(&self) -> &'static str {
        "memory"
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
