//! In-memory session store.
//!
//! One table per service type, each behind its own `RwLock`. Every check and
//! write that must be atomic (slot uniqueness, pending-request uniqueness,
//! compare-and-set, confirm) happens inside a single write-lock section.

use super::{
    BookingRepository, CreateOutcome, RequestLedger, SessionQuery, SessionStore, StoreError,
    StoreFuture, apply_order_and_page,
};
use crate::types::{
    EntityId, RequestId, RequestStatus, ServiceType, Session, SessionId, SessionRequest,
    SessionStatus, SlotKey, UserId,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Table {
    sessions: HashMap<SessionId, Session>,
    slots: HashMap<SlotKey, SessionId>,
    requests: HashMap<RequestId, SessionRequest>,
}

impl Table {
    fn requests_for(&self, session_id: SessionId) -> Vec<SessionRequest> {
        let mut requests: Vec<SessionRequest> = self
            .requests
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }
}

/// In-memory [`BookingRepository`] for tests, demos and single-process use.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    tables: [RwLock<Table>; 4],
}

impl InMemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn table(&self, service_type: ServiceType) -> &RwLock<Table> {
        &self.tables[service_type.index()]
    }

    /// Number of sessions stored for a service type
    pub async fn session_count(&self, service_type: ServiceType) -> usize {
        self.table(service_type).read().await.sessions.len()
    }
}

impl SessionStore for InMemorySessionStore {
    fn find_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> StoreFuture<'_, Option<Session>> {
        Box::pin(async move {
            Ok(self
                .table(service_type)
                .read()
                .await
                .sessions
                .get(&session_id)
                .cloned())
        })
    }

    fn find_by_slot<'a>(
        &'a self,
        service_type: ServiceType,
        entity_id: &'a EntityId,
        date: NaiveDate,
        start: NaiveTime,
    ) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let key = SlotKey {
                entity_id: entity_id.clone(),
                date,
                start,
            };
            let table = self.table(service_type).read().await;
            Ok(table
                .slots
                .get(&key)
                .and_then(|id| table.sessions.get(id))
                .cloned())
        })
    }

    fn create_session(&self, session: Session) -> StoreFuture<'_, CreateOutcome> {
        Box::pin(async move {
            let mut table = self.table(session.service_type).write().await;
            let key = session.slot_key();
            if table.slots.contains_key(&key) {
                return Ok(CreateOutcome::Duplicate);
            }
            table.slots.insert(key, session.session_id);
            table.sessions.insert(session.session_id, session.clone());
            Ok(CreateOutcome::Created(session))
        })
    }

    fn save_session<'a>(
        &'a self,
        session: &'a Session,
        expected: &'a SessionStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut table = self.table(session.service_type).write().await;
            let stored = table.sessions.get_mut(&session.session_id).ok_or_else(|| {
                StoreError::Conflict(format!("session {} no longer exists", session.session_id))
            })?;

            if &stored.status != expected {
                return Err(StoreError::Conflict(format!(
                    "session {} is {}, expected {}",
                    session.session_id,
                    stored.status.state_name(),
                    expected.state_name()
                )));
            }

            stored.status = session.status.clone();
            stored.cancellation_reason.clone_from(&session.cancellation_reason);
            stored.feedback.clone_from(&session.feedback);
            stored.rating = session.rating;
            stored.booking_id = session.booking_id;
            Ok(())
        })
    }

    fn query_sessions<'a>(
        &'a self,
        service_type: ServiceType,
        query: &'a SessionQuery,
    ) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(async move {
            let matching = self
                .table(service_type)
                .read()
                .await
                .sessions
                .values()
                .filter(|s| query.matches(s))
                .cloned()
                .collect();
            Ok(apply_order_and_page(matching, query))
        })
    }
}

impl RequestLedger for InMemorySessionStore {
    fn insert_request<'a>(
        &'a self,
        service_type: ServiceType,
        request: &'a SessionRequest,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut table = self.table(service_type).write().await;
            let session_open = table
                .sessions
                .get(&request.session_id)
                .is_some_and(|s| s.status.is_open());
            if !session_open {
                return Err(StoreError::Conflict(format!(
                    "session {} is no longer open",
                    request.session_id
                )));
            }
            let duplicate = table.requests.values().any(|r| {
                r.session_id == request.session_id && r.user_id == request.user_id && r.is_pending()
            });
            if duplicate {
                return Err(StoreError::DuplicatePending {
                    session_id: request.session_id,
                    user_id: request.user_id.clone(),
                });
            }
            table.requests.insert(request.request_id, request.clone());
            Ok(())
        })
    }

    fn requests_for_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> StoreFuture<'_, Vec<SessionRequest>> {
        Box::pin(async move {
            Ok(self
                .table(service_type)
                .read()
                .await
                .requests_for(session_id))
        })
    }

    fn reject_request<'a>(
        &'a self,
        service_type: ServiceType,
        request_id: RequestId,
        reason: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, SessionRequest> {
        Box::pin(async move {
            let mut table = self.table(service_type).write().await;
            let request = table
                .requests
                .get_mut(&request_id)
                .filter(|r| r.is_pending())
                .ok_or_else(|| {
                    StoreError::Conflict(format!("request {request_id} is no longer pending"))
                })?;

            request.status = RequestStatus::Rejected;
            request.rejection_reason = Some(reason.to_string());
            request.decided_at = Some(at);
            Ok(request.clone())
        })
    }
}

impl BookingRepository for InMemorySessionStore {
    fn confirm_booking<'a>(
        &'a self,
        service_type: ServiceType,
        session_id: SessionId,
        request_id: RequestId,
        user_id: &'a UserId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, (Session, SessionRequest)> {
        Box::pin(async move {
            let mut table = self.table(service_type).write().await;

            // Validate both rows before touching either.
            let session_open = table
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.status.is_open());
            if !session_open {
                return Err(StoreError::Conflict(format!(
                    "session {session_id} is no longer open"
                )));
            }
            let request_pending = table
                .requests
                .get(&request_id)
                .is_some_and(|r| r.is_pending() && r.session_id == session_id);
            if !request_pending {
                return Err(StoreError::Conflict(format!(
                    "request {request_id} is no longer pending"
                )));
            }

            let mut session = None;
            if let Some(stored) = table.sessions.get_mut(&session_id) {
                stored.status = SessionStatus::Booked {
                    user_id: user_id.clone(),
                };
                stored.booking_id = Some(request_id);
                session = Some(stored.clone());
            }
            let mut request = None;
            if let Some(stored) = table.requests.get_mut(&request_id) {
                stored.status = RequestStatus::Approved;
                stored.decided_at = Some(at);
                request = Some(stored.clone());
            }

            session.zip(request).ok_or_else(|| {
                StoreError::Conflict(format!("session {session_id} changed during confirm"))
            })
        })
    }
}
