use std::{
	collections::{BTreeMap, VecDeque},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Map;
use tokio::sync::Notify;

use common::{
	capability::Capability,
	connection::ConnectionStatus,
	errors::{codes, ServiceError, ToServiceError},
	grants::GrantEventType,
	ids::{ConnectionId, ProviderId},
	provider::{
		AuthGrant, AuthKind, BeginAuth, BeginAuthRequest, CompleteAuthRequest, Provider,
		ProviderRegistry, RefreshRequest, Signer, Transport, TransportRequest,
		TransportResponse,
	},
	ratelimit::RateLimitKey,
	scope::{ScopeRef, ScopeType},
	store::{
		ClaimDelivery, ConnectionStore, CredentialStore, GrantStore, RuntimeStores, StoreError,
		SubscriptionStore, WebhookDeliveryLedger,
	},
	subscription::{
		RemoteSubscription, SubscribeRequest, Subscription, SubscriptionOperations,
		SubscriptionStatus,
	},
	sync::{AdvanceCursor, SyncJobMode, SyncJobStatus, UpsertCursor},
	webhook::{
		DeliveryClaim, InboundRequest, InboundSurface, WebhookDeliveryStatus, WebhookTemplate,
	},
};
use tether_secrets::TetherSecrets;

use crate::{
	connection::{ConnectRequest, ConnectionService, ConnectionServiceOptions},
	inmem::InMemStores,
	invoke::{InvokeOutcome, InvokeRequest, ProviderInvoker},
	ratelimit::{RateLimitPolicy, RateLimitPolicyOptions},
	sync::{BootstrapRequest, SyncOrchestrator},
	webhook::{InboundHandler, WebhookProcessor, WebhookProcessorOptions},
};

const SIGNATURE_HEADER: &str = "x-test-signature";
const SHARED_SECRET: &str = "s3cret";

struct TestTemplate;

impl WebhookTemplate for TestTemplate {
	fn verify(&self, request: &InboundRequest) -> Result<(), ServiceError> {
		match request.header(SIGNATURE_HEADER) {
			Some(signature) if signature == SHARED_SECRET => Ok(()),
			_ => Err(ServiceError::auth(
				codes::WEBHOOK_SIGNATURE_INVALID,
				"signature mismatch",
			)),
		}
	}
}

struct TestProvider {
	id: ProviderId,
	complete_results: Mutex<VecDeque<AuthGrant>>,
	refresh_results: Mutex<VecDeque<Result<AuthGrant, ServiceError>>>,
	refresh_entered: Arc<Notify>,
	refresh_release: Arc<Notify>,
	gated: std::sync::atomic::AtomicBool,
	subscription_ops: Arc<TestSubscriptionOps>,
}

impl TestProvider {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			id: ProviderId::from("github"),
			complete_results: Mutex::new(VecDeque::new()),
			refresh_results: Mutex::new(VecDeque::new()),
			refresh_entered: Arc::new(Notify::new()),
			refresh_release: Arc::new(Notify::new()),
			gated: std::sync::atomic::AtomicBool::new(false),
			subscription_ops: Arc::new(TestSubscriptionOps {
				renews: AtomicUsize::new(0),
				cancels: AtomicUsize::new(0),
			}),
		})
	}

	fn grant(account: &str, token: &str, scopes: &[&str]) -> AuthGrant {
		AuthGrant {
			external_account_id: account.to_owned(),
			payload: format!("{{\"access_token\":\"{token}\",\"refresh_token\":\"r1\"}}")
				.into_bytes(),
			payload_format: "oauth2_token".to_owned(),
			token_type: "bearer".to_owned(),
			granted_scopes: scopes.iter().map(|s| (*s).to_owned()).collect(),
			expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
			rotates_at: None,
			refreshable: true,
			metadata: Map::new(),
		}
	}

	fn push_complete(&self, grant: AuthGrant) {
		self.complete_results.lock().push_back(grant);
	}

	fn push_refresh(&self, result: Result<AuthGrant, ServiceError>) {
		self.refresh_results.lock().push_back(result);
	}

	/// Hold the next refresh call open until released, so tests can overlap
	/// a competing refresh deterministically
	fn gate_refresh(&self) -> (Arc<Notify>, Arc<Notify>) {
		self.gated.store(true, Ordering::SeqCst);
		(self.refresh_entered.clone(), self.refresh_release.clone())
	}
}

#[async_trait::async_trait]
impl Provider for TestProvider {
	fn id(&self) -> ProviderId {
		self.id.clone()
	}

	fn auth_kind(&self) -> AuthKind {
		AuthKind::OAuth2AuthCode
	}

	fn supported_scope_types(&self) -> Vec<ScopeType> {
		vec![ScopeType::from("user")]
	}

	fn capabilities(&self) -> Vec<Capability> {
		vec![
			Capability::blocking("repo.read", vec!["repo:read".to_owned()]),
			Capability::blocking("repo.write", vec!["repo:write".to_owned()]),
		]
	}

	async fn begin_auth(&self, request: BeginAuthRequest) -> Result<BeginAuth, ServiceError> {
		Ok(BeginAuth {
			authorize_url: format!(
				"https://github.example/login/oauth/authorize?state={}",
				request.state
			),
			metadata: Map::new(),
		})
	}

	async fn complete_auth(
		&self,
		_request: CompleteAuthRequest,
	) -> Result<AuthGrant, ServiceError> {
		self.complete_results
			.lock()
			.pop_front()
			.ok_or_else(|| ServiceError::auth(codes::PROVIDER_AUTH_FAILED, "no scripted grant"))
	}

	async fn refresh(&self, _request: RefreshRequest) -> Result<AuthGrant, ServiceError> {
		if self.gated.swap(false, Ordering::SeqCst) {
			self.refresh_entered.notify_one();
			self.refresh_release.notified().await;
		}
		self.refresh_results
			.lock()
			.pop_front()
			.unwrap_or_else(|| Err(ServiceError::external("provider_unavailable", "no script")))
	}

	fn webhook(&self) -> Option<Arc<dyn WebhookTemplate>> {
		Some(Arc::new(TestTemplate))
	}

	fn signer(&self) -> Option<Arc<dyn Signer>> {
		Some(Arc::new(BearerSigner))
	}

	fn subscriptions(&self) -> Option<Arc<dyn SubscriptionOperations>> {
		Some(self.subscription_ops.clone())
	}
}

struct TestSubscriptionOps {
	renews: AtomicUsize,
	cancels: AtomicUsize,
}

#[async_trait::async_trait]
impl SubscriptionOperations for TestSubscriptionOps {
	async fn subscribe(
		&self,
		request: SubscribeRequest,
	) -> Result<RemoteSubscription, ServiceError> {
		Ok(RemoteSubscription {
			remote_subscription_id: format!("remote-{}", request.resource_id),
			channel_id: Some(format!("chan-{}", request.resource_id)),
			expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
			metadata: Map::new(),
		})
	}

	async fn renew(
		&self,
		subscription: &Subscription,
	) -> Result<RemoteSubscription, ServiceError> {
		self.renews.fetch_add(1, Ordering::SeqCst);
		Ok(RemoteSubscription {
			remote_subscription_id: subscription
				.remote_subscription_id
				.clone()
				.unwrap_or_default(),
			channel_id: Some(subscription.channel_id.clone()),
			expires_at: Some(Utc::now() + chrono::Duration::days(7)),
			metadata: Map::new(),
		})
	}

	async fn cancel(&self, _subscription: &Subscription) -> Result<(), ServiceError> {
		self.cancels.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

struct BearerSigner;

impl Signer for BearerSigner {
	fn sign(&self, request: &mut TransportRequest, payload: &[u8]) -> Result<(), ServiceError> {
		let parsed: serde_json::Value = serde_json::from_slice(payload)
			.map_err(|e| ServiceError::internal(e.to_string()))?;
		let token = parsed["access_token"]
			.as_str()
			.ok_or_else(|| ServiceError::internal("payload carries no access token"))?;
		request.set_header("authorization", format!("Bearer {token}"));
		Ok(())
	}
}

struct FakeTransport {
	responses: Mutex<VecDeque<TransportResponse>>,
	seen: Mutex<Vec<TransportRequest>>,
}

impl FakeTransport {
	fn new(responses: Vec<TransportResponse>) -> Arc<Self> {
		Arc::new(Self { responses: Mutex::new(responses.into()), seen: Mutex::new(vec![]) })
	}

	fn response(status: u16, remaining: &str) -> TransportResponse {
		let mut headers = BTreeMap::new();
		headers.insert("X-RateLimit-Limit".to_owned(), "5000".to_owned());
		headers.insert("X-RateLimit-Remaining".to_owned(), remaining.to_owned());
		TransportResponse { status, headers, body: b"{}".to_vec() }
	}
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
	async fn execute(
		&self,
		request: TransportRequest,
	) -> Result<TransportResponse, ServiceError> {
		self.seen.lock().push(request);
		self.responses
			.lock()
			.pop_front()
			.ok_or_else(|| ServiceError::external("transport_empty", "no scripted response"))
	}
}

struct ScriptedHandler {
	results: Mutex<VecDeque<Result<(), ServiceError>>>,
	invocations: AtomicUsize,
}

impl ScriptedHandler {
	fn new(results: Vec<Result<(), ServiceError>>) -> Arc<Self> {
		Arc::new(Self {
			results: Mutex::new(results.into()),
			invocations: AtomicUsize::new(0),
		})
	}
}

#[async_trait::async_trait]
impl InboundHandler for ScriptedHandler {
	async fn handle(
		&self,
		_request: &InboundRequest,
		_claim: &DeliveryClaim,
	) -> Result<(), ServiceError> {
		self.invocations.fetch_add(1, Ordering::SeqCst);
		self.results.lock().pop_front().unwrap_or(Ok(()))
	}
}

struct TestApi {
	stores: InMemStores,
	runtime: RuntimeStores,
	provider: Arc<TestProvider>,
	connections: Arc<ConnectionService>,
	sync: Arc<SyncOrchestrator>,
	secrets: Arc<TetherSecrets>,
}

async fn test_api() -> TestApi {
	let stores = InMemStores::new();
	let runtime = stores.stores();

	let registry = Arc::new(ProviderRegistry::new());
	let provider = TestProvider::new();
	registry.register(provider.clone()).unwrap();

	let secrets = Arc::new(TetherSecrets::embedded().await.unwrap());
	let connections = ConnectionService::new(
		registry.clone(),
		runtime.clone(),
		secrets.clone(),
		ConnectionServiceOptions::default(),
	);
	let sync = SyncOrchestrator::new(runtime.clone());

	TestApi { stores, runtime, provider, connections, sync, secrets }
}

impl TestApi {
	async fn connect_github(&self, scopes: &[&str]) -> ConnectionId {
		let started = self
			.connections
			.connect(ConnectRequest {
				provider_id: ProviderId::from("github"),
				scope: ScopeRef::new("user", "u1").unwrap(),
				requested_grants: scopes.iter().map(|s| (*s).to_owned()).collect(),
				redirect_uri: None,
				metadata: Map::new(),
			})
			.await
			.unwrap();

		assert!(started.authorize_url.contains(&started.state));

		self.provider.push_complete(TestProvider::grant("acct_1", "a1", scopes));
		let (connection, credential) =
			self.connections.complete_callback("c1", &started.state).await.unwrap();

		assert_eq!(credential.version, 1);
		connection.id
	}

	fn webhook_processor(&self, handler: Arc<dyn InboundHandler>) -> Arc<WebhookProcessor> {
		let registry = Arc::new(ProviderRegistry::new());
		registry.register(self.provider.clone()).unwrap();
		let processor = WebhookProcessor::new(
			registry,
			self.runtime.clone(),
			WebhookProcessorOptions {
				lease: Duration::from_secs(30),
				max_attempts: 8,
				retry_backoff_base: Duration::from_secs(60),
			},
		);
		processor.register_handler(ProviderId::from("github"), handler);
		processor
	}
}

fn webhook_request(delivery_id: &str) -> InboundRequest {
	let mut headers = BTreeMap::new();
	headers.insert(SIGNATURE_HEADER.to_owned(), SHARED_SECRET.to_owned());
	let mut metadata = Map::new();
	metadata.insert(
		"delivery_id".to_owned(),
		serde_json::Value::String(delivery_id.to_owned()),
	);
	InboundRequest {
		provider_id: ProviderId::from("github"),
		surface: InboundSurface::Webhook,
		headers,
		body: b"{\"action\":\"push\"}".to_vec(),
		metadata,
	}
}

// Scenario: connect, then invoke a capability covered by the granted set
#[tokio::test]
async fn connect_then_invoke_capability() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read", "repo:write"]).await;

	let snapshot =
		api.runtime.grants.latest_snapshot(&connection_id).await.unwrap().unwrap();
	assert_eq!(snapshot.version, 1);
	assert_eq!(snapshot.granted, vec!["repo:read".to_owned(), "repo:write".to_owned()]);

	let decision =
		api.connections.invoke_capability(&connection_id, "repo.write").await.unwrap();
	assert!(decision.allowed);
	assert!(decision.missing_grants.is_empty());
}

// Scenario: a refresh that loses a scope downgrades grants and blocks the
// dependent capability
#[tokio::test]
async fn refresh_downgrades_grants() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read", "repo:write"]).await;

	api.provider
		.push_refresh(Ok(TestProvider::grant("acct_1", "a2", &["repo:read"])));
	let outcome = api.connections.refresh(&connection_id).await.unwrap();
	assert_eq!(outcome.credential_version, 2);
	assert_eq!(outcome.grant_event, GrantEventType::Downgraded);

	// v1 revoked, v2 active, exactly one active credential
	let history = api.runtime.credentials.credential_history(&connection_id).await.unwrap();
	assert_eq!(history.len(), 2);
	let active: Vec<_> = history
		.iter()
		.filter(|c| c.status == common::connection::CredentialStatus::Active)
		.collect();
	assert_eq!(active.len(), 1);
	assert_eq!(active[0].version, 2);

	let snapshot =
		api.runtime.grants.latest_snapshot(&connection_id).await.unwrap().unwrap();
	assert_eq!(snapshot.version, 2);
	assert_eq!(snapshot.granted, vec!["repo:read".to_owned()]);

	let events = api.runtime.grants.grant_events(&connection_id).await.unwrap();
	let downgrade = events
		.iter()
		.find(|e| e.event_type == GrantEventType::Downgraded)
		.expect("downgrade event");
	assert_eq!(downgrade.removed, vec!["repo:write".to_owned()]);

	let decision =
		api.connections.invoke_capability(&connection_id, "repo.write").await.unwrap();
	assert!(!decision.allowed);
	assert_eq!(decision.mode, Some(common::capability::CapabilityMode::Block));
	assert_eq!(decision.missing_grants, vec!["repo:write".to_owned()]);
}

// Scenario: two parallel refreshes resolve to exactly one rotation
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_refresh_rotates_once() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	let (entered, release) = api.provider.gate_refresh();
	api.provider
		.push_refresh(Ok(TestProvider::grant("acct_1", "a2", &["repo:read"])));

	let winner = {
		let service = api.connections.clone();
		let connection_id = connection_id.clone();
		tokio::spawn(async move { service.refresh(&connection_id).await })
	};

	// The winner is now parked inside the provider call, holding the lock
	entered.notified().await;

	let loser = api.connections.refresh(&connection_id).await.unwrap_err();
	assert!(loser.has_code(codes::REFRESH_LOCKED));
	assert!(loser.to_string().contains("service_refresh_locked"));

	release.notify_one();
	let outcome = winner.await.unwrap().unwrap();
	assert_eq!(outcome.credential_version, 2);

	let active = api.runtime.credentials.active_credential(&connection_id).await.unwrap();
	assert_eq!(active.unwrap().version, 2);
}

// Scenario: webhook dedupe inside the retry window, retry after it
#[tokio::test]
async fn webhook_dedupe_and_retry() {
	let api = test_api().await;

	let handler = ScriptedHandler::new(vec![
		Err(ServiceError::external("handler_boom", "first attempt fails")),
		Ok(()),
	]);
	let processor = api.webhook_processor(handler.clone());

	let t0 = Utc::now();
	let request = webhook_request("d1");

	// First attempt claims and fails; the ledger schedules a retry
	processor.process_at(request.clone(), t0).await.unwrap_err();
	let delivery = api
		.runtime
		.webhook_deliveries
		.delivery(&ProviderId::from("github"), "d1")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(delivery.status, WebhookDeliveryStatus::RetryReady);
	assert_eq!(delivery.attempts, 1);
	let next_attempt_at = delivery.next_attempt_at.unwrap();
	assert!(next_attempt_at > t0);

	// Duplicate redelivery before the retry is due: deduped, handler not
	// invoked again
	let result = processor.process_at(request.clone(), t0 + chrono::Duration::seconds(1))
		.await
		.unwrap();
	assert!(result.accepted);
	assert!(result.deduped);
	assert_eq!(handler.invocations.load(Ordering::SeqCst), 1);

	// After the scheduled retry instant the redelivery is processed
	let result = processor
		.process_at(request, next_attempt_at + chrono::Duration::seconds(1))
		.await
		.unwrap();
	assert!(result.accepted);
	assert!(!result.deduped);
	assert_eq!(handler.invocations.load(Ordering::SeqCst), 2);

	let delivery = api
		.runtime
		.webhook_deliveries
		.delivery(&ProviderId::from("github"), "d1")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(delivery.status, WebhookDeliveryStatus::Processed);
	assert_eq!(delivery.attempts, 2);
}

#[tokio::test]
async fn webhook_signature_failure_leaves_no_ledger_row() {
	let api = test_api().await;
	let processor = api.webhook_processor(ScriptedHandler::new(vec![]));

	let mut request = webhook_request("d9");
	request.headers.insert(SIGNATURE_HEADER.to_owned(), "wrong".to_owned());

	let err = processor.process(request).await.unwrap_err();
	assert!(err.has_code(codes::WEBHOOK_SIGNATURE_INVALID));

	let delivery = api
		.runtime
		.webhook_deliveries
		.delivery(&ProviderId::from("github"), "d9")
		.await
		.unwrap();
	assert!(delivery.is_none());
}

#[tokio::test]
async fn webhook_missing_delivery_id_is_rejected() {
	let api = test_api().await;
	let processor = api.webhook_processor(ScriptedHandler::new(vec![]));

	let mut request = webhook_request("unused");
	request.metadata.clear();

	let err = processor.process(request).await.unwrap_err();
	assert!(err.has_code(codes::WEBHOOK_MISSING_DELIVERY_ID));
}

// A crashed processor's delivery becomes re-claimable once the lease lapses,
// with a strictly greater attempt number
#[tokio::test]
async fn webhook_lease_expiry_reclaims() {
	let api = test_api().await;
	let ledger = api.runtime.webhook_deliveries.clone();
	let t0 = Utc::now();

	let claim = |now| ClaimDelivery {
		provider_id: ProviderId::from("github"),
		delivery_id: "d2".to_owned(),
		payload: vec![],
		lease: Duration::from_secs(30),
		now,
	};

	let first = ledger.claim_delivery(claim(t0)).await.unwrap().unwrap();
	assert_eq!(first.attempts, 1);

	// Within the lease the delivery is not claimable
	assert!(ledger
		.claim_delivery(claim(t0 + chrono::Duration::seconds(5)))
		.await
		.unwrap()
		.is_none());

	// After the lease a new claim wins with attempts = 2; the crashed
	// attempt's completion is stale
	let second = ledger
		.claim_delivery(claim(t0 + chrono::Duration::seconds(31)))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(second.attempts, 2);

	assert!(!ledger.complete_delivery(&first).await.unwrap());
	assert!(ledger.complete_delivery(&second).await.unwrap());
}

#[tokio::test]
async fn webhook_zero_lease_coerces_to_default() {
	let api = test_api().await;
	let ledger = api.runtime.webhook_deliveries.clone();
	let t0 = Utc::now();

	ledger
		.claim_delivery(ClaimDelivery {
			provider_id: ProviderId::from("github"),
			delivery_id: "d3".to_owned(),
			payload: vec![],
			lease: Duration::ZERO,
			now: t0,
		})
		.await
		.unwrap()
		.unwrap();

	let delivery = api
		.runtime
		.webhook_deliveries
		.delivery(&ProviderId::from("github"), "d3")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(delivery.next_attempt_at.unwrap(), t0 + chrono::Duration::seconds(30));
}

#[tokio::test]
async fn stale_fail_is_a_noop_and_unknown_claim_errors() {
	let api = test_api().await;
	let ledger = api.runtime.webhook_deliveries.clone();
	let t0 = Utc::now();

	let claim = ledger
		.claim_delivery(ClaimDelivery {
			provider_id: ProviderId::from("github"),
			delivery_id: "d4".to_owned(),
			payload: vec![],
			lease: Duration::from_secs(30),
			now: t0,
		})
		.await
		.unwrap()
		.unwrap();
	assert!(ledger.complete_delivery(&claim).await.unwrap());

	// The attempt already completed; failing it now is a no-op
	let stale = ledger
		.fail_delivery(&claim, "late failure", t0 + chrono::Duration::seconds(60), 8)
		.await
		.unwrap();
	assert!(stale.is_none());

	// A claim for a delivery that never existed is an error
	let unknown = DeliveryClaim {
		provider_id: ProviderId::from("github"),
		delivery_id: "never-seen".to_owned(),
		attempts: 1,
	};
	assert!(matches!(
		ledger.fail_delivery(&unknown, "boom", t0, 8).await,
		Err(StoreError::RecordNotFound)
	));
}

// Scenario: CAS cursor advance; a conflicting advance leaves state untouched
#[tokio::test]
async fn sync_cursor_cas() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	let advance = |expected: &str, next: &str| AdvanceCursor {
		connection_id: connection_id.clone(),
		provider_id: ProviderId::from("github"),
		resource_type: "repo".to_owned(),
		resource_id: "r1".to_owned(),
		expected_cursor: expected.to_owned(),
		cursor: next.to_owned(),
		status: None,
		last_synced_at: Some(Utc::now()),
		metadata: None,
	};

	// Empty expectation on a missing resource creates it
	api.sync.advance_cursor(advance("", "c1")).await.unwrap();

	// Expected compare is case-insensitive
	api.sync.advance_cursor(advance("C1", "c2")).await.unwrap();

	let err = api.sync.advance_cursor(advance("c1", "c3")).await.unwrap_err();
	assert!(err.has_code(codes::SYNC_CURSOR_CONFLICT));

	let cursor =
		api.sync.cursor(&connection_id, "repo", "r1").await.unwrap().unwrap();
	assert_eq!(cursor.cursor, "c2");
}

#[tokio::test]
async fn cursor_advance_on_missing_resource_with_expectation_conflicts() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	let err = api
		.sync
		.advance_cursor(AdvanceCursor {
			connection_id: connection_id.clone(),
			provider_id: ProviderId::from("github"),
			resource_type: "repo".to_owned(),
			resource_id: "missing".to_owned(),
			expected_cursor: "c1".to_owned(),
			cursor: "c2".to_owned(),
			status: None,
			last_synced_at: None,
			metadata: None,
		})
		.await
		.unwrap_err();
	assert!(err.has_code(codes::SYNC_CURSOR_CONFLICT));
	assert!(api.sync.cursor(&connection_id, "repo", "missing").await.unwrap().is_none());
}

#[tokio::test]
async fn cursor_invalidation_recovery_resumes_progress() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	let recovered = api
		.sync
		.recover_cursor(UpsertCursor {
			connection_id: connection_id.clone(),
			provider_id: ProviderId::from("github"),
			resource_type: "repo".to_owned(),
			resource_id: "r1".to_owned(),
			cursor: "baseline".to_owned(),
			status: None,
			last_synced_at: None,
			metadata: None,
		})
		.await
		.unwrap();

	assert_eq!(
		recovered.metadata.get("recovery"),
		Some(&serde_json::Value::String("invalidation".to_owned()))
	);

	api.sync
		.advance_cursor(AdvanceCursor {
			connection_id,
			provider_id: ProviderId::from("github"),
			resource_type: "repo".to_owned(),
			resource_id: "r1".to_owned(),
			expected_cursor: "baseline".to_owned(),
			cursor: "next".to_owned(),
			status: None,
			last_synced_at: None,
			metadata: None,
		})
		.await
		.unwrap();
}

// Scenario: sixteen concurrent creations with one idempotency key
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idempotent_sync_job_creation() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	let mut handles = vec![];
	for _ in 0..16 {
		let sync = api.sync.clone();
		let connection_id = connection_id.clone();
		handles.push(tokio::spawn(async move {
			sync.start(&connection_id, SyncJobMode::Full, Some("k1".to_owned()), Map::new())
				.await
				.unwrap()
		}));
	}

	let mut created = 0;
	let mut job_ids = vec![];
	for handle in handles {
		let result = handle.await.unwrap();
		if result.created {
			created += 1;
		}
		job_ids.push(result.job.id);
	}

	assert_eq!(created, 1);
	assert_eq!(job_ids.iter().collect::<std::collections::BTreeSet<_>>().len(), 1);
}

#[tokio::test]
async fn bootstrap_inherits_checkpoint_and_jobs_resume() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	api.sync
		.advance_cursor(AdvanceCursor {
			connection_id: connection_id.clone(),
			provider_id: ProviderId::from("github"),
			resource_type: "repo".to_owned(),
			resource_id: "r1".to_owned(),
			expected_cursor: String::new(),
			cursor: "c41".to_owned(),
			status: None,
			last_synced_at: None,
			metadata: None,
		})
		.await
		.unwrap();

	let created = api
		.sync
		.start_bootstrap(BootstrapRequest {
			connection_id: connection_id.clone(),
			resource_type: Some("repo".to_owned()),
			resource_id: Some("r1".to_owned()),
			idempotency_key: None,
			requested_by: None,
			metadata: Map::new(),
		})
		.await
		.unwrap();

	assert!(created.created);
	assert_eq!(created.job.checkpoint.as_deref(), Some("c41"));

	// fail with no next attempt leaves the job terminally failed yet
	// resumable, checkpoint intact
	let job = api.sync.fail(&created.job.id, "provider 500", None).await.unwrap();
	assert_eq!(job.status, SyncJobStatus::Failed);
	assert_eq!(job.attempts, 1);

	let resumed = api.sync.resume(&created.job.id).await.unwrap();
	assert_eq!(resumed.status, SyncJobStatus::Queued);
	assert_eq!(resumed.checkpoint.as_deref(), Some("c41"));
}

#[tokio::test]
async fn refresh_without_active_credential_is_not_found() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	api.runtime.credentials.revoke_active(&connection_id, "test teardown").await.unwrap();

	let err = api.connections.refresh(&connection_id).await.unwrap_err();
	assert!(err.has_code(codes::CREDENTIAL_NOT_FOUND));
	assert_eq!(
		err.to_service_error().category,
		common::errors::ErrorCategory::NotFound
	);
}

#[tokio::test]
async fn refresh_auth_failure_demotes_to_needs_reconsent() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	api.provider.push_refresh(Err(ServiceError::auth(
		codes::PROVIDER_AUTH_FAILED,
		"token revoked upstream",
	)));
	api.connections.refresh(&connection_id).await.unwrap_err();

	let connection = api.runtime.connections.connection(&connection_id).await.unwrap();
	assert_eq!(connection.status, ConnectionStatus::NeedsReconsent);
	assert!(connection.last_error.unwrap().contains("token revoked"));

	let refresh_failed = api
		.stores
		.outbox_entries()
		.into_iter()
		.find(|entry| entry.event.name == "connection.refresh_failed");
	assert!(refresh_failed.is_some());

	// A successful reconnect through the callback path reinstates the
	// connection
	let started = api
		.connections
		.connect(ConnectRequest {
			provider_id: ProviderId::from("github"),
			scope: ScopeRef::new("user", "u1").unwrap(),
			requested_grants: vec!["repo:read".to_owned()],
			redirect_uri: None,
			metadata: Map::new(),
		})
		.await
		.unwrap();
	api.provider.push_complete(TestProvider::grant("acct_1", "a3", &["repo:read"]));
	let (connection, credential) =
		api.connections.complete_callback("c2", &started.state).await.unwrap();
	assert_eq!(connection.status, ConnectionStatus::Active);
	assert_eq!(credential.version, 2);
}

#[tokio::test]
async fn revoke_is_terminal_and_audited() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	api.connections.revoke(&connection_id, "user request").await.unwrap();

	let connection = api.runtime.connections.connection(&connection_id).await.unwrap();
	assert_eq!(connection.status, ConnectionStatus::Revoked);

	let history = api.runtime.credentials.credential_history(&connection_id).await.unwrap();
	assert_eq!(history[0].status, common::connection::CredentialStatus::Revoked);
	assert_eq!(history[0].revocation_reason.as_deref(), Some("user request"));

	let err = api.connections.refresh(&connection_id).await.unwrap_err();
	assert!(err.has_code(codes::CONNECTION_NOT_ACTIVE));

	let actions: Vec<String> =
		api.stores.activity_entries().into_iter().map(|a| a.action).collect();
	assert!(actions.contains(&"connection.revoke".to_owned()));
}

#[tokio::test]
async fn oauth_state_is_single_use() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;
	assert!(!connection_id.as_str().is_empty());

	// connect_github consumed its state; replaying an arbitrary one fails
	let err = api.connections.complete_callback("c1", "bogus-state").await.unwrap_err();
	assert!(err.has_code(codes::OAUTH_STATE_INVALID));
}

fn invoker(api: &TestApi) -> (std::sync::Arc<ProviderInvoker>, std::sync::Arc<RateLimitPolicy>) {
	let registry = Arc::new(ProviderRegistry::new());
	registry.register(api.provider.clone()).unwrap();
	let policy =
		RateLimitPolicy::new(api.runtime.rate_limits.clone(), RateLimitPolicyOptions::default());
	let invoker = ProviderInvoker::new(
		registry,
		api.runtime.clone(),
		api.secrets.clone(),
		api.connections.clone(),
		policy.clone(),
	);
	(invoker, policy)
}

// The outbound pipeline signs with the decrypted credential and folds the
// response headers into the persisted bucket state
#[tokio::test]
async fn invoke_pipeline_signs_and_updates_rate_limit() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read", "repo:write"]).await;
	let (invoker, _) = invoker(&api);

	let transport = FakeTransport::new(vec![FakeTransport::response(200, "4999")]);
	let outcome = invoker
		.invoke(
			transport.as_ref(),
			InvokeRequest {
				connection_id,
				capability: "repo.write".to_owned(),
				request: TransportRequest::new("POST", "https://api.github.example/repos"),
				bucket_key: "core".to_owned(),
			},
		)
		.await
		.unwrap();

	let InvokeOutcome::Executed { decision, response, rate_limit } = outcome else {
		panic!("expected an executed call");
	};
	assert!(decision.allowed);
	assert_eq!(response.status, 200);
	assert_eq!(rate_limit.remaining, Some(4999));

	// The signer saw the decrypted payload, not ciphertext
	let seen = transport.seen.lock();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].headers.get("authorization").map(String::as_str), Some("Bearer a1"));
}

#[tokio::test]
async fn invoke_denied_without_grants_never_reaches_transport() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;
	let (invoker, _) = invoker(&api);

	let transport = FakeTransport::new(vec![]);
	let outcome = invoker
		.invoke(
			transport.as_ref(),
			InvokeRequest {
				connection_id,
				capability: "repo.write".to_owned(),
				request: TransportRequest::new("POST", "https://api.github.example/repos"),
				bucket_key: "core".to_owned(),
			},
		)
		.await
		.unwrap();

	let InvokeOutcome::Denied(decision) = outcome else {
		panic!("expected a denial");
	};
	assert!(!decision.allowed);
	assert_eq!(decision.missing_grants, vec!["repo:write".to_owned()]);
	assert!(transport.seen.lock().is_empty());
}

#[tokio::test]
async fn invoke_throttled_bucket_blocks_before_transport() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;
	let (invoker, policy) = invoker(&api);

	// A 429 observation arms the bucket's prohibition
	let key = RateLimitKey::new("github", "user", "u1", "core");
	let throttled = FakeTransport::response(429, "0");
	let meta = common::ratelimit::RateLimitMeta::from_response(&throttled);
	policy.after_call(&key, &meta, Some(chrono::Duration::seconds(120))).await.unwrap();

	let transport = FakeTransport::new(vec![]);
	let err = invoker
		.invoke(
			transport.as_ref(),
			InvokeRequest {
				connection_id,
				capability: "repo.read".to_owned(),
				request: TransportRequest::new("GET", "https://api.github.example/repos"),
				bucket_key: "core".to_owned(),
			},
		)
		.await
		.unwrap_err();

	assert!(err.has_code(codes::RATE_LIMIT_THROTTLED));
	assert!(transport.seen.lock().is_empty());
}

fn subscription_service(api: &TestApi) -> Arc<crate::subscription::SubscriptionService> {
	let registry = Arc::new(ProviderRegistry::new());
	registry.register(api.provider.clone()).unwrap();
	crate::subscription::SubscriptionService::new(registry, api.runtime.clone())
}

#[tokio::test]
async fn subscribe_then_route_by_channel() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;
	let service = subscription_service(&api);

	let subscription = service
		.subscribe(crate::subscription::CreateSubscription {
			connection_id: connection_id.clone(),
			resource_type: "repo".to_owned(),
			resource_id: "r1".to_owned(),
			callback_url: "https://app.example/webhooks/github".to_owned(),
			metadata: Map::new(),
		})
		.await
		.unwrap();

	assert_eq!(subscription.channel_id, "chan-r1");
	assert_eq!(subscription.remote_subscription_id.as_deref(), Some("remote-r1"));
	assert_eq!(subscription.status, SubscriptionStatus::Active);

	// Inbound routing resolves the channel back to the connection and
	// stamps the notification time
	let routed = service
		.route_channel(&ProviderId::from("github"), "chan-r1")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(routed.connection_id, connection_id);

	let stamped = api.runtime.subscriptions.subscription(&subscription.id).await.unwrap();
	assert!(stamped.last_notified_at.is_some());

	// The channel tuple is unique among live rows
	let err = api
		.runtime
		.subscriptions
		.insert_subscription(common::subscription::NewSubscription {
			connection_id,
			provider_id: ProviderId::from("github"),
			resource_type: "repo".to_owned(),
			resource_id: "r2".to_owned(),
			channel_id: "chan-r1".to_owned(),
			remote_subscription_id: None,
			callback_url: "https://app.example/webhooks/github".to_owned(),
			verification_token_ref: None,
			expires_at: None,
			metadata: Map::new(),
		})
		.await
		.unwrap_err();
	assert!(matches!(err, StoreError::UniqueViolation(_)));
}

#[tokio::test]
async fn renewal_sweep_renews_expiring_subscriptions() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;
	let service = subscription_service(&api);

	let subscription = service
		.subscribe(crate::subscription::CreateSubscription {
			connection_id,
			resource_type: "repo".to_owned(),
			resource_id: "r1".to_owned(),
			callback_url: "https://app.example/webhooks/github".to_owned(),
			metadata: Map::new(),
		})
		.await
		.unwrap();

	// Expires within the two-hour window set by the scripted ops
	let renewed = service.renew_expiring(Duration::from_secs(2 * 3600)).await.unwrap();
	assert_eq!(renewed, 1);
	assert_eq!(api.provider.subscription_ops.renews.load(Ordering::SeqCst), 1);

	let refreshed = api.runtime.subscriptions.subscription(&subscription.id).await.unwrap();
	assert!(refreshed.expires_at.unwrap() > Utc::now() + chrono::Duration::days(6));

	let renewed_event = api
		.stores
		.outbox_entries()
		.into_iter()
		.any(|entry| entry.event.name == "subscription.renewed");
	assert!(renewed_event);
}

#[tokio::test]
async fn cancel_updates_status_and_calls_remote() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;
	let service = subscription_service(&api);

	let subscription = service
		.subscribe(crate::subscription::CreateSubscription {
			connection_id,
			resource_type: "repo".to_owned(),
			resource_id: "r1".to_owned(),
			callback_url: "https://app.example/webhooks/github".to_owned(),
			metadata: Map::new(),
		})
		.await
		.unwrap();

	let cancelled = service.cancel(&subscription.id).await.unwrap();
	assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
	assert_eq!(api.provider.subscription_ops.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn installation_upsert_alone_reinstates_suspended() {
	let api = test_api().await;
	let service = crate::installation::InstallationService::new(api.runtime.clone());
	let provider_id = ProviderId::from("github");
	let scope = ScopeRef::new("org", "o1").unwrap();

	let upsert = |status| common::installation::UpsertInstallation {
		provider_id: provider_id.clone(),
		scope: scope.clone(),
		install_type: "org_app".to_owned(),
		status,
		granted_at: Some(Utc::now()),
		metadata: Map::new(),
	};

	let installation = service.upsert(upsert(common::installation::InstallationStatus::Active))
		.await
		.unwrap();
	assert_eq!(installation.status, common::installation::InstallationStatus::Active);

	service
		.update_status(
			&provider_id,
			&scope,
			common::installation::InstallationStatus::Suspended,
		)
		.await
		.unwrap();

	// update_status may not reinstate a suspended install
	let err = service
		.update_status(&provider_id, &scope, common::installation::InstallationStatus::Active)
		.await
		.unwrap_err();
	assert!(err.has_code(codes::INVALID_STATE_TRANSITION));

	// An explicit upsert is the sanctioned reinstatement path
	let reinstated =
		service.upsert(upsert(common::installation::InstallationStatus::Active)).await.unwrap();
	assert_eq!(reinstated.status, common::installation::InstallationStatus::Active);
	assert_eq!(reinstated.id, installation.id);

	let status_events = api
		.stores
		.outbox_entries()
		.into_iter()
		.filter(|entry| entry.event.name == "installation.status_changed")
		.count();
	assert_eq!(status_events, 3);
}

// Drive the whole flow through the command loop, the way an embedding
// application consumes the runtime
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_drives_connect_callback_and_capability() {
	use crate::commands::{ApiResponse, ConnectionCommand, SyncCommand};
	use crate::{Api, ApiOptions};

	let stores = InMemStores::new();
	let runtime = stores.stores();
	let registry = Arc::new(ProviderRegistry::new());
	let provider = TestProvider::new();
	registry.register(provider.clone()).unwrap();
	let secrets = Arc::new(TetherSecrets::embedded().await.unwrap());

	let (dispatch, _api) =
		Api::new(registry, runtime, secrets, ApiOptions::default()).await.unwrap();

	let started = dispatch
		.connection(ConnectionCommand::Connect {
			provider_id: ProviderId::from("github"),
			scope: ScopeRef::new("user", "u1").unwrap(),
			requested_grants: vec!["repo:read".to_owned(), "repo:write".to_owned()],
			redirect_uri: None,
			metadata: Map::new(),
		})
		.await
		.unwrap();
	let ApiResponse::ConnectStarted { state, .. } = started else {
		panic!("expected connect redirect");
	};

	provider.push_complete(TestProvider::grant("acct_1", "a1", &["repo:read", "repo:write"]));
	let connected = dispatch
		.connection(ConnectionCommand::CompleteCallback { code: "c1".to_owned(), state })
		.await
		.unwrap();
	let ApiResponse::Connected { connection, credential_version } = connected else {
		panic!("expected a connection");
	};
	assert_eq!(credential_version, 1);

	let decision = dispatch
		.connection(ConnectionCommand::InvokeCapability {
			connection_id: connection.id.clone(),
			capability: "repo.write".to_owned(),
		})
		.await
		.unwrap();
	let ApiResponse::Capability { decision } = decision else {
		panic!("expected a decision");
	};
	assert!(decision.allowed);

	let job = dispatch
		.sync(SyncCommand::StartIncremental {
			connection_id: connection.id,
			idempotency_key: Some("inc-1".to_owned()),
			requested_by: None,
			metadata: Map::new(),
		})
		.await
		.unwrap();
	let ApiResponse::SyncJob { created, .. } = job else {
		panic!("expected a sync job");
	};
	assert!(created);
}

#[tokio::test]
async fn exhausted_webhook_attempts_dead_letter_and_emit() {
	let api = test_api().await;
	let connection_id = api.connect_github(&["repo:read"]).await;

	let handler = ScriptedHandler::new(vec![Err(ServiceError::external(
		"handler_boom",
		"permanently broken",
	))]);
	let registry = Arc::new(ProviderRegistry::new());
	registry.register(api.provider.clone()).unwrap();
	let processor = WebhookProcessor::new(
		registry,
		api.runtime.clone(),
		WebhookProcessorOptions {
			lease: Duration::from_secs(30),
			max_attempts: 1,
			retry_backoff_base: Duration::from_secs(60),
		},
	);
	processor.register_handler(ProviderId::from("github"), handler);

	let mut request = webhook_request("d-dead");
	request.metadata.insert(
		"connection_id".to_owned(),
		serde_json::Value::String(connection_id.to_string()),
	);

	processor.process(request).await.unwrap_err();

	let delivery = api
		.runtime
		.webhook_deliveries
		.delivery(&ProviderId::from("github"), "d-dead")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(delivery.status, WebhookDeliveryStatus::Dead);
	assert!(delivery.next_attempt_at.is_none());

	let dead_letter = api
		.stores
		.outbox_entries()
		.into_iter()
		.find(|entry| entry.event.name == "webhook.dead_lettered")
		.expect("dead letter event");
	assert_eq!(dead_letter.event.connection_id, Some(connection_id));
	assert_eq!(dead_letter.event.payload["deliveryId"], "d-dead");
}
