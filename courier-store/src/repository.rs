//! Repository traits implemented by every backing store

use async_trait::async_trait;
use courier_common::{
    Event, EventType, Message, MessageId, MessageStatus, MessageView, NewEvent, NewMessage,
    ProcessingMessage, StatusUpdate, SuppressionEntry, Tenant, TenantId,
};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Listing filter for [`MessageRepository::find_many`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    #[serde(default)]
    pub status: Option<MessageStatus>,
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

const fn default_page() -> u32 {
    1
}

const fn default_limit() -> u32 {
    20
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            status: None,
            page: default_page(),
            limit: default_limit(),
        }
    }
}

/// One page of results plus the totals needed to page further
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: usize,
    pub total_pages: usize,
}

/// Durable record store for messages and their recipients
#[async_trait]
pub trait MessageRepository: Send + Sync + std::fmt::Debug {
    /// Create a message in `queued` status together with its first audit event.
    ///
    /// # Errors
    /// `Conflict` carrying the existing ID if the tenant already used the
    /// idempotency key; `TenantNotFound` if the tenant does not exist.
    async fn create(&self, message: NewMessage, event: NewEvent) -> Result<Message>;

    /// Look up a message by its tenant-scoped idempotency key.
    ///
    /// # Errors
    /// If the store cannot be read
    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Message>>;

    /// Tenant-scoped view with recipients and the audit trail.
    ///
    /// # Errors
    /// If the store cannot be read
    async fn find_by_id(&self, id: &MessageId, tenant_id: &TenantId)
    -> Result<Option<MessageView>>;

    /// Unscoped view used by the processing pipeline.
    ///
    /// # Errors
    /// If the store cannot be read
    async fn find_by_id_internal(&self, id: &MessageId) -> Result<Option<ProcessingMessage>>;

    /// Apply a partial update that is not a status transition of its own
    /// (for example persisting rendered content while `processing`).
    ///
    /// # Errors
    /// `MessageNotFound`, `InvalidTransition` or `AttemptCountRegression`
    async fn update_status(&self, id: &MessageId, update: StatusUpdate) -> Result<Message>;

    /// Apply a status transition and append its audit event atomically.
    ///
    /// Readers never observe the new status without the event.
    ///
    /// # Errors
    /// `MessageNotFound`, `InvalidTransition` or `AttemptCountRegression`;
    /// on error neither the update nor the event is stored.
    async fn transition(
        &self,
        id: &MessageId,
        update: StatusUpdate,
        event: NewEvent,
    ) -> Result<Message>;

    /// List a tenant's messages, newest first.
    ///
    /// # Errors
    /// If the store cannot be read
    async fn find_many(&self, tenant_id: &TenantId, filter: MessageFilter)
    -> Result<Page<Message>>;
}

/// Append-only audit log
#[async_trait]
pub trait EventRepository: Send + Sync + std::fmt::Debug {
    /// Append an event to a message's trail.
    ///
    /// # Errors
    /// `MessageNotFound` if the message does not exist
    async fn create(
        &self,
        message_id: &MessageId,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Event>;

    /// All events for a message in creation order.
    ///
    /// # Errors
    /// If the store cannot be read
    async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Vec<Event>>;
}

/// Per-tenant do-not-send list
#[async_trait]
pub trait SuppressionRepository: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// If the store cannot be read
    async fn is_suppressed(&self, tenant_id: &TenantId, email: &str) -> Result<bool>;

    /// Insert an entry, or replace the reason on an existing one.
    ///
    /// # Errors
    /// If the store cannot be written
    async fn add(&self, tenant_id: &TenantId, email: &str, reason: &str)
    -> Result<SuppressionEntry>;

    /// Remove an entry. Returns whether one existed.
    ///
    /// # Errors
    /// If the store cannot be written
    async fn remove(&self, tenant_id: &TenantId, email: &str) -> Result<bool>;
}

/// Tenant records, provisioned outside the pipeline
#[async_trait]
pub trait TenantRepository: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// If the store cannot be written
    async fn create(&self, tenant: Tenant) -> Result<Tenant>;

    /// # Errors
    /// If the store cannot be read
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>>;

    /// # Errors
    /// If the store cannot be read
    async fn find_by_api_key_hash(&self, api_key_hash: &str) -> Result<Option<Tenant>>;
}
