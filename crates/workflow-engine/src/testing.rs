//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::billing::{
    BillingClient, GetOrganizationCreditsRequest, GetOrganizationCreditsResponse, GetWorkflowExecutionRatesRequest,
    GetWorkflowExecutionRatesResponse, ReserveCreditsRequest, ReserveCreditsResponse, ResourceRate,
    SubmitWorkflowReceiptRequest, SubmitWorkflowReceiptResponse,
};
use crate::capabilities::{
    CapabilitiesRegistry, CapabilityConfiguration, CapabilityInfo, CapabilityRequest, CapabilityResponse,
    CapabilityType, Don, ExecutableCapability, MeteringNodeDetail, Node, TriggerCapability, TriggerEvent,
    TriggerRegistrationRequest, TriggerResponse,
};
use crate::clock::Clock;
use crate::events::{EngineEvent, EventEmitter, EventSink};
use crate::module::{CapabilityCall, ExecuteRequest, ExecutionHelper, ExecutionResult, Module, RequestKind, TriggerSubscription};
use crate::secrets::{SecretRequest, VaultResponse};

pub(crate) const OWNER: &str = "1111111111111111111111111111111111111111";
pub(crate) const WORKFLOW_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Emitter over a recording sink with millisecond retries.
pub(crate) fn test_emitter() -> EventEmitter {
    EventEmitter::with_retry(
        Arc::new(RecordingSink::new()),
        "wf",
        1,
        Duration::from_millis(1),
        Duration::from_millis(1),
    )
}

/// Sink that records events, optionally failing the first few publishes.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
    fail_first: usize,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub(crate) fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn events_of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            bail!("sink unavailable (attempt {})", attempt + 1);
        }
        self.events.lock().push(event);
        Ok(())
    }
}

/// Billing backend with canned answers.
pub(crate) struct MockBilling {
    reachable: bool,
    grant: bool,
    credits: f64,
    rates: Vec<ResourceRate>,
    rate_card: Vec<ResourceRate>,
    org_credits: f64,
    receipts: Mutex<Vec<SubmitWorkflowReceiptRequest>>,
}

impl MockBilling {
    pub(crate) fn granting(credits: f64, rates: Vec<ResourceRate>) -> Self {
        Self {
            reachable: true,
            grant: true,
            credits,
            rates,
            rate_card: Vec::new(),
            org_credits: 0.0,
            receipts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn denying() -> Self {
        Self {
            grant: false,
            ..Self::granting(0.0, Vec::new())
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::granting(0.0, Vec::new())
        }
    }

    /// Rates returned by the separate rate card lookup.
    pub(crate) fn with_rate_card(mut self, rates: Vec<ResourceRate>) -> Self {
        self.rate_card = rates;
        self
    }

    pub(crate) fn with_org_credits(mut self, credits: f64) -> Self {
        self.org_credits = credits;
        self
    }

    pub(crate) fn receipts(&self) -> Vec<SubmitWorkflowReceiptRequest> {
        self.receipts.lock().clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if !self.reachable {
            bail!("billing service unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl BillingClient for MockBilling {
    async fn get_organization_credits_by_workflow(
        &self,
        _request: GetOrganizationCreditsRequest,
    ) -> Result<GetOrganizationCreditsResponse> {
        self.check_reachable()?;
        Ok(GetOrganizationCreditsResponse {
            credits: self.org_credits,
        })
    }

    async fn get_workflow_execution_rates(
        &self,
        _request: GetWorkflowExecutionRatesRequest,
    ) -> Result<GetWorkflowExecutionRatesResponse> {
        self.check_reachable()?;
        Ok(GetWorkflowExecutionRatesResponse {
            rates: self.rate_card.clone(),
        })
    }

    async fn reserve_credits(&self, _request: ReserveCreditsRequest) -> Result<ReserveCreditsResponse> {
        self.check_reachable()?;
        Ok(ReserveCreditsResponse {
            success: self.grant,
            credits: if self.grant { self.credits } else { 0.0 },
            rates: if self.grant { self.rates.clone() } else { Vec::new() },
        })
    }

    async fn submit_workflow_receipt(
        &self,
        request: SubmitWorkflowReceiptRequest,
    ) -> Result<SubmitWorkflowReceiptResponse> {
        self.check_reachable()?;
        self.receipts.lock().push(request);
        Ok(SubmitWorkflowReceiptResponse { success: true })
    }
}

/// Registry over fixed maps. The local node belongs to DON 1.
#[derive(Default)]
pub(crate) struct MockRegistry {
    triggers: HashMap<String, Arc<dyn TriggerCapability>>,
    executables: HashMap<String, Arc<dyn ExecutableCapability>>,
    configs: HashMap<String, serde_json::Value>,
    members: Vec<String>,
    keys: HashMap<String, String>,
}

impl MockRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_trigger(mut self, id: &str, trigger: Arc<dyn TriggerCapability>) -> Self {
        self.triggers.insert(id.to_string(), trigger);
        self
    }

    pub(crate) fn with_executable(mut self, id: &str, capability: Arc<dyn ExecutableCapability>) -> Self {
        self.executables.insert(id.to_string(), capability);
        self
    }

    pub(crate) fn with_capability_config(mut self, id: &str, config: serde_json::Value) -> Self {
        self.configs.insert(id.to_string(), config);
        self
    }

    /// Workflow DON members and their encryption keys.
    pub(crate) fn with_don_keys(mut self, keys: &[(&str, &str)]) -> Self {
        for (peer, key) in keys {
            self.members.push(peer.to_string());
            self.keys.insert(peer.to_string(), key.to_string());
        }
        self
    }
}

#[async_trait]
impl CapabilitiesRegistry for MockRegistry {
    async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>> {
        self.triggers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("trigger capability {} not registered", id))
    }

    async fn get_executable(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>> {
        self.executables
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("executable capability {} not registered", id))
    }

    async fn config_for_capability(&self, capability_id: &str, _don_id: u32) -> Result<CapabilityConfiguration> {
        self.configs
            .get(capability_id)
            .map(|config| CapabilityConfiguration { config: config.clone() })
            .ok_or_else(|| anyhow!("no config for {}", capability_id))
    }

    async fn local_node(&self) -> Result<Node> {
        Ok(Node {
            peer_id: "local-peer".to_string(),
            encryption_public_key: String::new(),
            workflow_don: Don {
                id: 1,
                members: self.members.clone(),
            },
        })
    }

    async fn node_by_peer_id(&self, peer_id: &str) -> Result<Node> {
        let key = self
            .keys
            .get(peer_id)
            .ok_or_else(|| anyhow!("unknown peer {}", peer_id))?;
        Ok(Node {
            peer_id: peer_id.to_string(),
            encryption_public_key: key.clone(),
            workflow_don: Don::default(),
        })
    }
}

/// Vault capability with a canned response.
pub(crate) struct MockVault {
    response: std::result::Result<VaultResponse, String>,
    requests: Mutex<Vec<CapabilityRequest>>,
}

impl MockVault {
    pub(crate) fn responding(response: VaultResponse) -> Self {
        Self {
            response: Ok(response),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<CapabilityRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ExecutableCapability for MockVault {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            id: crate::secrets::VAULT_CAPABILITY_ID.to_string(),
            capability_type: CapabilityType::Action,
            description: "mock vault".to_string(),
            spend_types: Vec::new(),
        }
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse> {
        self.requests.lock().push(request);
        match &self.response {
            Ok(response) => Ok(CapabilityResponse {
                payload: serde_json::to_value(response)?,
                metering: Vec::new(),
            }),
            Err(message) => bail!("{}", message),
        }
    }
}

/// Executable capability that echoes its payload and reports fixed spends.
pub(crate) struct MockCapability {
    info: CapabilityInfo,
    metering: Vec<MeteringNodeDetail>,
    requests: Mutex<Vec<CapabilityRequest>>,
}

impl MockCapability {
    pub(crate) fn new(id: &str, spend_types: &[&str]) -> Self {
        Self {
            info: CapabilityInfo {
                id: id.to_string(),
                capability_type: CapabilityType::Target,
                description: String::new(),
                spend_types: spend_types.iter().map(|s| s.to_string()).collect(),
            },
            metering: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_metering(mut self, spends: &[(&str, &str, &str)]) -> Self {
        self.metering = spends
            .iter()
            .map(|(peer, unit, value)| MeteringNodeDetail {
                peer_id: peer.to_string(),
                spend_unit: unit.to_string(),
                spend_value: value.to_string(),
            })
            .collect();
        self
    }

    pub(crate) fn requests(&self) -> Vec<CapabilityRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ExecutableCapability for MockCapability {
    fn info(&self) -> CapabilityInfo {
        self.info.clone()
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse> {
        let payload = request.payload.clone();
        self.requests.lock().push(request);
        Ok(CapabilityResponse {
            payload,
            metering: self.metering.clone(),
        })
    }
}

/// Trigger capability driven by the test through [`MockTrigger::send`].
pub(crate) struct MockTrigger {
    id: String,
    fail_registration: bool,
    register_delay: Option<Duration>,
    sender: Mutex<Option<mpsc::Sender<TriggerResponse>>>,
    registered: Mutex<Vec<String>>,
    unregistered: Mutex<Vec<String>>,
}

impl MockTrigger {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fail_registration: false,
            register_delay: None,
            sender: Mutex::new(None),
            registered: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(id: &str) -> Self {
        Self {
            fail_registration: true,
            ..Self::new(id)
        }
    }

    /// Registration takes `delay` before it is recorded.
    pub(crate) fn with_register_delay(mut self, delay: Duration) -> Self {
        self.register_delay = Some(delay);
        self
    }

    pub(crate) async fn send(&self, response: TriggerResponse) {
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            sender.send(response).await.unwrap();
        }
    }

    pub(crate) async fn fire(&self, event_id: &str, payload: serde_json::Value) {
        self.send(Ok(TriggerEvent {
            id: event_id.to_string(),
            trigger_type: self.id.clone(),
            payload,
        }))
        .await
    }

    pub(crate) fn registered(&self) -> Vec<String> {
        self.registered.lock().clone()
    }

    pub(crate) fn unregistered(&self) -> Vec<String> {
        self.unregistered.lock().clone()
    }
}

#[async_trait]
impl TriggerCapability for MockTrigger {
    fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            id: self.id.clone(),
            capability_type: CapabilityType::Trigger,
            description: String::new(),
            spend_types: Vec::new(),
        }
    }

    async fn register_trigger(&self, request: TriggerRegistrationRequest) -> Result<mpsc::Receiver<TriggerResponse>> {
        if self.fail_registration {
            bail!("registration refused by {}", self.id);
        }
        if let Some(delay) = self.register_delay {
            tokio::time::sleep(delay).await;
        }
        let (tx, rx) = mpsc::channel(32);
        *self.sender.lock() = Some(tx);
        self.registered.lock().push(request.trigger_id);
        Ok(rx)
    }

    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<()> {
        self.unregistered.lock().push(request.trigger_id);
        Ok(())
    }
}

/// Module whose trigger behaviour is driven by the event payload:
///
/// - `{"sleep_ms": n}` sleeps before answering
/// - `{"fail": "msg"}` returns an error
/// - `{"call": "id", "spend_limit": x}` calls a capability once
/// - `{"secrets": ["id", ..]}` fetches secrets from namespace `main`
/// - `{"logs": n, "line": "text"}` emits `n` user logs
///
/// Anything else is echoed back.
#[derive(Default)]
pub(crate) struct MockModule {
    subscriptions: Vec<TriggerSubscription>,
    subscribe_delay: Option<Duration>,
    started: AtomicBool,
    closed: AtomicBool,
    executions: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl MockModule {
    pub(crate) fn new(subscriptions: Vec<TriggerSubscription>) -> Self {
        Self {
            subscriptions,
            ..Self::default()
        }
    }

    pub(crate) fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Trigger requests received so far.
    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Most trigger requests observed running at the same time.
    pub(crate) fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    async fn run(&self, payload: serde_json::Value, helper: Arc<dyn ExecutionHelper>) -> Result<serde_json::Value> {
        if let Some(ms) = payload["sleep_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = payload["fail"].as_str() {
            bail!("{}", message);
        }
        if let Some(id) = payload["call"].as_str() {
            let response = helper
                .call_capability(CapabilityCall {
                    id: id.to_string(),
                    call_id: 1,
                    method: "write".to_string(),
                    payload: json!({"value": 42}),
                    config: serde_json::Value::Null,
                    spend_limit: payload["spend_limit"].as_f64(),
                })
                .await?;
            return Ok(response.payload);
        }
        if let Some(ids) = payload["secrets"].as_array() {
            let requests = ids
                .iter()
                .filter_map(|id| id.as_str())
                .map(|id| SecretRequest {
                    id: id.to_string(),
                    namespace: "main".to_string(),
                })
                .collect();
            let responses = helper.get_secrets(requests).await?;
            return Ok(serde_json::to_value(responses)?);
        }
        if let Some(n) = payload["logs"].as_u64() {
            let line = payload["line"].as_str().unwrap_or("log line");
            for _ in 0..n {
                helper.emit_user_log(line);
            }
        }
        Ok(json!({
            "execution_id": helper.workflow_execution_id(),
            "echo": payload,
        }))
    }
}

#[async_trait]
impl Module for MockModule {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn execute(&self, request: ExecuteRequest, helper: Arc<dyn ExecutionHelper>) -> Result<ExecutionResult> {
        match request.kind {
            RequestKind::Subscribe => {
                if let Some(delay) = self.subscribe_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(ExecutionResult::Subscriptions(self.subscriptions.clone()))
            }
            RequestKind::Trigger { payload, .. } => {
                self.executions.fetch_add(1, Ordering::SeqCst);
                let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_running.fetch_max(running, Ordering::SeqCst);
                let result = self.run(payload, helper).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                result.map(ExecutionResult::Value)
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn subscription(id: &str) -> TriggerSubscription {
    TriggerSubscription {
        id: id.to_string(),
        method: "subscribe".to_string(),
        payload: json!({}),
    }
}

/// Clock that advances by a fixed step on every read.
pub(crate) struct SteppingClock {
    now: Mutex<DateTime<Utc>>,
    step: chrono::Duration,
}

impl SteppingClock {
    pub(crate) fn new(step: chrono::Duration) -> Self {
        Self {
            now: Mutex::new(Utc::now()),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock();
        let current = *now;
        *now = current + self.step;
        current
    }
}
