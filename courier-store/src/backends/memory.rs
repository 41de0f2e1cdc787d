use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::{
    Attachment, Event, EventType, Message, MessageId, MessageView, NewEvent, NewMessage,
    ProcessingMessage, StatusUpdate, SuppressionEntry, Tenant, TenantId, TenantRef,
};
use dashmap::DashMap;

use crate::{
    Result, StoreError,
    repository::{
        EventRepository, MessageFilter, MessageRepository, Page, SuppressionRepository,
        TenantRepository,
    },
};

#[derive(Debug, Default)]
struct State {
    messages: HashMap<MessageId, Message>,
    idempotency: HashMap<(TenantId, String), MessageId>,
    attachments: HashMap<MessageId, Vec<Attachment>>,
    events: HashMap<MessageId, Vec<Event>>,
    tenants: HashMap<TenantId, Tenant>,
    next_sequence: u64,
}

impl State {
    fn append_event(&mut self, message_id: MessageId, event: NewEvent) -> Event {
        self.next_sequence += 1;
        let event = Event {
            sequence: self.next_sequence,
            message_id,
            event_type: event.event_type,
            payload: event.payload,
            created_at: Utc::now(),
        };
        self.events
            .entry(message_id)
            .or_default()
            .push(event.clone());
        event
    }

    /// Validate and apply an update, leaving the record untouched on error
    fn apply_update(&mut self, id: &MessageId, update: &StatusUpdate) -> Result<Message> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or(StoreError::MessageNotFound(*id))?;

        if !message.status.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: message.status,
                to: update.status,
            });
        }

        if let Some(requested) = update.attempt_count
            && requested < message.attempt_count
        {
            return Err(StoreError::AttemptCountRegression {
                id: *id,
                current: message.attempt_count,
                requested,
            });
        }

        message.apply(update, Utc::now());
        Ok(message.clone())
    }
}

/// In-memory implementation of every repository
///
/// Messages, events, attachments and tenants share one `RwLock` so that
/// [`MessageRepository::transition`] publishes the status change and its
/// event in a single critical section. Suppression entries are looked up on
/// every send and live in a `DashMap` so those reads never contend with
/// status writes.
///
/// Email addresses on the suppression list are compared case-insensitively.
///
/// # Capacity Management
/// An optional capacity bounds the number of stored messages; `create`
/// fails with [`StoreError::CapacityExceeded`] once it is reached.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    suppressions: Arc<DashMap<(TenantId, String), SuppressionEntry>>,
    /// Maximum number of messages to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            suppressions: Arc::default(),
            capacity: None,
        }
    }

    /// Create a new store that holds at most `capacity` messages
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Number of stored messages
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .messages
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the configured capacity (None = unlimited)
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn suppression_key(tenant_id: &TenantId, email: &str) -> (TenantId, String) {
        (tenant_id.clone(), email.trim().to_ascii_lowercase())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, mut message: NewMessage, event: NewEvent) -> Result<Message> {
        let mut state = self.state.write()?;

        if !state.tenants.contains_key(&message.tenant_id) {
            return Err(StoreError::TenantNotFound(message.tenant_id));
        }

        let key = (message.tenant_id.clone(), message.idempotency_key.clone());
        if let Some(existing) = state.idempotency.get(&key) {
            return Err(StoreError::Conflict {
                existing: *existing,
            });
        }

        if let Some(cap) = self.capacity
            && state.messages.len() >= cap
        {
            return Err(StoreError::CapacityExceeded(cap));
        }

        let id = MessageId::generate();
        let attachments = std::mem::take(&mut message.attachments);
        let message = Message::from_new(id, message, Utc::now());

        state.idempotency.insert(key, id);
        state.attachments.insert(id, attachments);
        state.messages.insert(id, message.clone());
        state.append_event(id, event);

        Ok(message)
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Message>> {
        let state = self.state.read()?;
        Ok(state
            .idempotency
            .get(&(tenant_id.clone(), key.to_string()))
            .and_then(|id| state.messages.get(id))
            .cloned())
    }

    async fn find_by_id(
        &self,
        id: &MessageId,
        tenant_id: &TenantId,
    ) -> Result<Option<MessageView>> {
        let state = self.state.read()?;
        Ok(state
            .messages
            .get(id)
            .filter(|message| &message.tenant_id == tenant_id)
            .map(|message| MessageView {
                message: message.clone(),
                events: state.events.get(id).cloned().unwrap_or_default(),
            }))
    }

    async fn find_by_id_internal(&self, id: &MessageId) -> Result<Option<ProcessingMessage>> {
        let state = self.state.read()?;
        let Some(message) = state.messages.get(id) else {
            return Ok(None);
        };

        let tenant = state
            .tenants
            .get(&message.tenant_id)
            .map(TenantRef::from)
            .ok_or_else(|| StoreError::TenantNotFound(message.tenant_id.clone()))?;

        Ok(Some(ProcessingMessage {
            message: message.clone(),
            attachments: state.attachments.get(id).cloned().unwrap_or_default(),
            tenant,
        }))
    }

    async fn update_status(&self, id: &MessageId, update: StatusUpdate) -> Result<Message> {
        self.state.write()?.apply_update(id, &update)
    }

    async fn transition(
        &self,
        id: &MessageId,
        update: StatusUpdate,
        event: NewEvent,
    ) -> Result<Message> {
        let mut state = self.state.write()?;
        let message = state.apply_update(id, &update)?;
        state.append_event(*id, event);
        Ok(message)
    }

    async fn find_many(
        &self,
        tenant_id: &TenantId,
        filter: MessageFilter,
    ) -> Result<Page<Message>> {
        let state = self.state.read()?;

        let mut matching: Vec<&Message> = state
            .messages
            .values()
            .filter(|m| &m.tenant_id == tenant_id)
            .filter(|m| filter.status.is_none_or(|status| m.status == status))
            .collect();

        // ULIDs sort by creation time
        matching.sort_by(|a, b| b.id.cmp(&a.id));

        let page = filter.page.max(1);
        let limit = filter.limit.max(1);
        let total = matching.len();
        let skip = (page as usize - 1).saturating_mul(limit as usize);

        Ok(Page {
            items: matching
                .into_iter()
                .skip(skip)
                .take(limit as usize)
                .cloned()
                .collect(),
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit as usize),
        })
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn create(
        &self,
        message_id: &MessageId,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let mut state = self.state.write()?;
        if !state.messages.contains_key(message_id) {
            return Err(StoreError::MessageNotFound(*message_id));
        }
        Ok(state.append_event(*message_id, NewEvent::new(event_type, payload)))
    }

    async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Vec<Event>> {
        Ok(self
            .state
            .read()?
            .events
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SuppressionRepository for MemoryStore {
    async fn is_suppressed(&self, tenant_id: &TenantId, email: &str) -> Result<bool> {
        Ok(self
            .suppressions
            .contains_key(&Self::suppression_key(tenant_id, email)))
    }

    async fn add(
        &self,
        tenant_id: &TenantId,
        email: &str,
        reason: &str,
    ) -> Result<SuppressionEntry> {
        let key = Self::suppression_key(tenant_id, email);
        let mut entry = self
            .suppressions
            .entry(key.clone())
            .or_insert_with(|| SuppressionEntry {
                tenant_id: tenant_id.clone(),
                email: key.1,
                reason: reason.to_string(),
                created_at: Utc::now(),
            });
        reason.clone_into(&mut entry.reason);
        Ok(entry.clone())
    }

    async fn remove(&self, tenant_id: &TenantId, email: &str) -> Result<bool> {
        Ok(self
            .suppressions
            .remove(&Self::suppression_key(tenant_id, email))
            .is_some())
    }
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn create(&self, tenant: Tenant) -> Result<Tenant> {
        self.state
            .write()?
            .tenants
            .insert(tenant.id.clone(), tenant.clone());
        Ok(tenant)
    }

    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.state.read()?.tenants.get(id).cloned())
    }

    async fn find_by_api_key_hash(&self, api_key_hash: &str) -> Result<Option<Tenant>> {
        Ok(self
            .state
            .read()?
            .tenants
            .values()
            .find(|tenant| tenant.api_key_hash == api_key_hash)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use courier_common::{EmailAddress, MessageStatus, Priority, Recipient};

    use super::*;

    fn tenant(id: &str) -> Tenant {
        Tenant {
            id: TenantId::new(id),
            name: format!("Tenant {id}"),
            api_key_hash: format!("hash-{id}"),
            rate_limit_per_sec: 100,
            active: true,
        }
    }

    fn new_message(tenant_id: &str, key: &str) -> NewMessage {
        NewMessage {
            tenant_id: TenantId::new(tenant_id),
            idempotency_key: key.to_string(),
            priority: Priority::Normal,
            from: EmailAddress::new("noreply@example.com"),
            subject: "Subject".to_string(),
            html_body: "<p>Body</p>".to_string(),
            text_body: None,
            variables: None,
            recipients: vec![Recipient::to("a@x.com")],
            attachments: vec![Attachment {
                filename: "invoice.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                size_bytes: 1024,
                storage_key: "tenant-a/invoice.pdf".to_string(),
            }],
        }
    }

    async fn store_with_tenant() -> MemoryStore {
        let store = MemoryStore::new();
        TenantRepository::create(&store, tenant("tenant-a"))
            .await
            .expect("create tenant");
        store
    }

    fn queued_event() -> NewEvent {
        NewEvent::queued(&TenantId::new("tenant-a"), Priority::Normal)
    }

    #[tokio::test]
    async fn test_create_and_internal_view() {
        let store = store_with_tenant().await;
        let message = MessageRepository::create(&store, new_message("tenant-a", "k1"), queued_event())
            .await
            .expect("create");

        assert_eq!(message.status, MessageStatus::Queued);
        assert_eq!(message.attempt_count, 0);

        let view = store
            .find_by_id_internal(&message.id)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(view.tenant.name, "Tenant tenant-a");
        assert_eq!(view.attachments.len(), 1);
        assert_eq!(view.message.recipients, vec![Recipient::to("a@x.com")]);
    }

    #[tokio::test]
    async fn test_create_requires_tenant() {
        let store = MemoryStore::new();
        let err = MessageRepository::create(&store, new_message("ghost", "k1"), queued_event())
            .await
            .expect_err("unknown tenant");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let store = MemoryStore::with_capacity(1);
        TenantRepository::create(&store, tenant("tenant-a"))
            .await
            .expect("create tenant");

        MessageRepository::create(&store, new_message("tenant-a", "k1"), queued_event())
            .await
            .expect("first fits");
        let err = MessageRepository::create(&store, new_message("tenant-a", "k2"), queued_event())
            .await
            .expect_err("second exceeds capacity");
        assert!(matches!(err, StoreError::CapacityExceeded(1)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_transition_stores_nothing() {
        let store = store_with_tenant().await;
        let message = MessageRepository::create(&store, new_message("tenant-a", "k1"), queued_event())
            .await
            .expect("create");

        let err = store
            .transition(
                &message.id,
                StatusUpdate::to(MessageStatus::Sent),
                NewEvent::sent("smtp", None),
            )
            .await
            .expect_err("queued -> sent is not an edge");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let events = store
            .find_by_message_id(&message.id)
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Queued);
    }

    #[tokio::test]
    async fn test_suppression_is_case_insensitive() {
        let store = MemoryStore::new();
        let tenant_id = TenantId::new("tenant-a");

        store
            .add(&tenant_id, "Blocked@X.com", "hard bounce")
            .await
            .expect("add");
        let updated = store
            .add(&tenant_id, "blocked@x.com", "complaint")
            .await
            .expect("upsert");
        assert_eq!(updated.reason, "complaint");

        assert!(store.is_suppressed(&tenant_id, "BLOCKED@x.com").await.expect("lookup"));
        assert!(
            !store
                .is_suppressed(&TenantId::new("tenant-b"), "blocked@x.com")
                .await
                .expect("lookup")
        );

        assert!(store.remove(&tenant_id, "blocked@x.com").await.expect("remove"));
        assert!(!store.remove(&tenant_id, "blocked@x.com").await.expect("remove"));
    }
}
