//! Fakes and fixtures shared by the delivery integration tests
#![allow(dead_code)] // Not every test file uses every helper

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_common::{
    EmailAddress, Event, EventType, Message, MessageId, SuppressionEntry, Tenant, TenantId,
};
use courier_delivery::{
    EmailProvider, IntakeService, Pipeline, ProviderError, SendOptions, SendRequest, SendResult,
    TemplateRenderer,
};
use courier_queue::{
    Broker, Declaration, MemoryBroker, OutboundJob, Publisher, QueueError, RetryRung,
    Subscription, Topology,
};
use courier_store::{
    EventRepository, MemoryStore, MessageRepository, StoreError, Stores, SuppressionRepository,
    TenantRepository,
};
use tokio::{sync::Semaphore, time::Instant};

pub const TENANT: &str = "tenant-a";
pub const FIRST_RUNG_MS: u32 = 2_000;

/// Records every send and answers from a script, then with success
#[derive(Debug, Default)]
pub struct RecordingProvider {
    script: Mutex<VecDeque<Result<SendResult, ProviderError>>>,
    sent: Mutex<Vec<(Instant, SendOptions)>>,
    started: AtomicUsize,
    /// When set, every send waits for a permit first
    gate: Option<Arc<Semaphore>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(
        script: impl IntoIterator<Item = Result<SendResult, ProviderError>>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Sends entered, including any still waiting at the gate
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<SendOptions> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, options)| options.clone())
            .collect()
    }

    pub fn sent_at(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl EmailProvider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, options: SendOptions) -> Result<SendResult, ProviderError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }

        self.sent.lock().unwrap().push((Instant::now(), options));

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(SendResult::sent(Some(format!(
                "<{}@recording>",
                MessageId::generate()
            ))))
        })
    }

    async fn validate_connection(&self) -> bool {
        true
    }
}

/// A memory broker whose publishes are always refused
#[derive(Debug, Clone, Default)]
pub struct RefusingBroker {
    pub inner: MemoryBroker,
}

#[async_trait]
impl Broker for RefusingBroker {
    async fn apply(&self, declaration: &Declaration) -> courier_queue::Result<()> {
        self.inner.apply(declaration).await
    }

    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        job: OutboundJob,
    ) -> courier_queue::Result<()> {
        Err(QueueError::Nacked {
            message_id: job.message_id,
        })
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> courier_queue::Result<Box<dyn Subscription>> {
        self.inner.subscribe(queue, prefetch).await
    }
}

/// The suppression list of a store that can be taken offline
#[derive(Debug)]
pub struct FlakySuppressions {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakySuppressions {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> courier_store::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "suppression list offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SuppressionRepository for FlakySuppressions {
    async fn is_suppressed(&self, tenant_id: &TenantId, email: &str) -> courier_store::Result<bool> {
        self.check()?;
        SuppressionRepository::is_suppressed(&self.inner, tenant_id, email).await
    }

    async fn add(
        &self,
        tenant_id: &TenantId,
        email: &str,
        reason: &str,
    ) -> courier_store::Result<SuppressionEntry> {
        self.check()?;
        SuppressionRepository::add(&self.inner, tenant_id, email, reason).await
    }

    async fn remove(&self, tenant_id: &TenantId, email: &str) -> courier_store::Result<bool> {
        self.check()?;
        SuppressionRepository::remove(&self.inner, tenant_id, email).await
    }
}

/// The default topology with a short entry rung
pub fn topology() -> Topology {
    Topology {
        retry: vec![
            RetryRung::new("email.retry.1", FIRST_RUNG_MS),
            RetryRung::new("email.retry.2", 60_000),
        ],
        ..Topology::default()
    }
}

pub fn tenant_id() -> TenantId {
    TenantId::new(TENANT)
}

pub fn request(key: &str) -> SendRequest {
    SendRequest {
        idempotency_key: key.to_string(),
        priority: None,
        from: EmailAddress::named("noreply@example.com", "Example"),
        to: vec![EmailAddress::new("a@x.com")],
        cc: Vec::new(),
        bcc: Vec::new(),
        subject: "Hello {{name}}".to_string(),
        html_body: "<p>Hello {{name}}</p>".to_string(),
        text_body: Some("Hello {{name}}".to_string()),
        variables: serde_json::json!({ "name": "Ada" }).as_object().cloned(),
        attachments: Vec::new(),
    }
}

/// One store, one memory broker and every service wired together
pub struct Harness {
    pub store: MemoryStore,
    pub stores: Stores,
    pub broker: MemoryBroker,
    pub topology: Topology,
    pub provider: Arc<RecordingProvider>,
    pub suppressions: Arc<FlakySuppressions>,
    pub pipeline: Pipeline,
    pub intake: IntakeService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_provider(RecordingProvider::new()).await
    }

    pub async fn with_provider(provider: RecordingProvider) -> Self {
        let broker = MemoryBroker::new();
        Self::build(provider, broker.clone(), Arc::new(broker)).await
    }

    /// Intake publishes through a broker that refuses every job
    pub async fn refusing_publishes() -> Self {
        let refusing = RefusingBroker::default();
        Self::build(
            RecordingProvider::new(),
            refusing.inner.clone(),
            Arc::new(refusing),
        )
        .await
    }

    async fn build(
        provider: RecordingProvider,
        broker: MemoryBroker,
        publish_through: Arc<dyn Broker>,
    ) -> Self {
        let topology = topology();
        broker.declare(&topology).await.expect("declare topology");

        let store = MemoryStore::new();
        TenantRepository::create(
            &store,
            Tenant {
                id: tenant_id(),
                name: "Tenant A".to_string(),
                api_key_hash: "hash".to_string(),
                rate_limit_per_sec: 50,
                active: true,
            },
        )
        .await
        .expect("create tenant");

        let suppressions = Arc::new(FlakySuppressions::new(store.clone()));
        let mut stores = Stores::from_store(store.clone());
        stores.suppressions = suppressions.clone();
        let provider = Arc::new(provider);
        let pipeline = Pipeline::from_stores(
            &stores,
            Arc::new(TemplateRenderer::default()),
            provider.clone(),
        );
        let intake = IntakeService::new(
            stores.messages.clone(),
            Publisher::new(publish_through, &topology),
        );

        Self {
            store,
            stores,
            broker,
            topology,
            provider,
            suppressions,
            pipeline,
            intake,
        }
    }

    pub async fn submit(&self, request: SendRequest) -> MessageId {
        self.intake
            .submit(&tenant_id(), request)
            .await
            .expect("accepted")
            .id
    }

    pub async fn message(&self, id: &MessageId) -> Message {
        self.stores
            .messages
            .find_by_id_internal(id)
            .await
            .expect("read")
            .expect("message exists")
            .message
    }

    pub async fn events(&self, id: &MessageId) -> Vec<Event> {
        self.stores
            .events
            .find_by_message_id(id)
            .await
            .expect("read events")
    }

    pub async fn event_types(&self, id: &MessageId) -> Vec<EventType> {
        self.events(id)
            .await
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }

    pub async fn suppress(&self, email: &str) {
        self.stores
            .suppressions
            .add(&tenant_id(), email, "hard bounce")
            .await
            .expect("suppress");
    }

    /// Poll until `condition` holds, letting paused time advance meanwhile
    pub async fn wait_for(&self, mut condition: impl FnMut(&Self) -> bool) {
        for _ in 0..10_000 {
            if condition(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }
}
