//! In-memory platform harness for end-to-end session scenarios.

use edgelink_gateway::config::{ActivityPersistence, EventStoreKind, GatewayConfig};
use edgelink_gateway::dispatch::{RecordingUplinkProcessor, UplinkDispatcher};
use edgelink_gateway::edge::{CustomerId, Edge, EdgeId, EdgeVersion, TenantId};
use edgelink_gateway::provider::{
    EntityFetchProvider, InMemoryEdgeDirectory, RecordingActivityLog, RecordingRuleNotifier,
    StaticEntityFetcher,
};
use edgelink_gateway::registry::SessionRegistry;
use edgelink_gateway::server::GatewayServer;
use edgelink_gateway::session::EdgeSession;
use edgelink_gateway::store::EdgeEventService;
use edgelink_proto::link::{link_pair, ClientLink};
use edgelink_proto::msg::{
    ConnectRequestMsg, ConnectResponseCode, DownlinkMsg, DownlinkResponseMsg, RequestMsg,
    ResponseMsg, UplinkKind, UplinkMsg, UplinkPayload, UplinkResponseMsg,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Install a compact tracing subscriber for debugging scenario runs.
/// Safe to call from multiple tests; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .try_init();
}

/// A gateway configuration with intervals short enough for tests.
pub fn fast_config(backend: EventStoreKind) -> GatewayConfig {
    GatewayConfig {
        events_batch_size: 50,
        no_records_sleep_ms: 30,
        sleep_between_batches_ms: 5,
        send_ack_timeout_ms: 300,
        sync_request_timeout_ms: 150,
        zombie_cleanup_interval_ms: 25,
        max_high_priority_queue_size: 100,
        backend,
        ..Default::default()
    }
}

/// One in-memory platform: directory, event stores, registry, server and
/// recording collaborators.
pub struct TestPlatform {
    /// The configuration every session runs with.
    pub config: GatewayConfig,
    /// The durable event service.
    pub events: Arc<EdgeEventService>,
    /// The connection registry.
    pub registry: Arc<SessionRegistry>,
    /// The connection acceptor.
    pub server: Arc<GatewayServer>,
    /// Edge directory used by handshakes.
    pub directory: Arc<InMemoryEdgeDirectory>,
    /// Recorded connectivity transitions.
    pub activity: Arc<RecordingActivityLog>,
    /// Recorded rule-engine triggers.
    pub rules: Arc<RecordingRuleNotifier>,
    /// Seedable sync fetch provider.
    pub fetch: Arc<StaticEntityFetcher>,
    /// Processor receiving device/asset/telemetry uplinks.
    pub devices: Arc<RecordingUplinkProcessor>,
    /// Processor receiving user and user-credentials uplinks.
    pub users: Arc<RecordingUplinkProcessor>,
}

impl TestPlatform {
    /// Build a platform on the given backend with the fast test config.
    pub fn new(backend: EventStoreKind) -> Self {
        let fetch = Arc::new(StaticEntityFetcher::new());
        Self::with_fetch(backend, Arc::clone(&fetch) as _, fetch)
    }

    /// Build a platform with a custom fetch provider (the seedable one is
    /// still kept for tests that want it).
    pub fn with_fetch(
        backend: EventStoreKind,
        fetch_provider: Arc<dyn EntityFetchProvider>,
        fetch: Arc<StaticEntityFetcher>,
    ) -> Self {
        let config = fast_config(backend);
        let events = Arc::new(EdgeEventService::new(backend));
        let activity = Arc::new(RecordingActivityLog::new(ActivityPersistence::Attribute));
        let rules = Arc::new(RecordingRuleNotifier::new());
        let registry = SessionRegistry::new(
            config.clone(),
            Arc::clone(&events),
            Arc::clone(&activity) as _,
            Arc::clone(&rules) as _,
            fetch_provider,
        );
        let directory = Arc::new(InMemoryEdgeDirectory::new());
        let devices = Arc::new(RecordingUplinkProcessor::new());
        // the user path is deliberately slow so ordering violations would
        // surface as reordered applications
        let users = Arc::new(RecordingUplinkProcessor::with_delay(20));
        let mut dispatcher = UplinkDispatcher::new();
        dispatcher.register_all(
            &[
                UplinkKind::Device,
                UplinkKind::Asset,
                UplinkKind::Telemetry,
                UplinkKind::Attributes,
                UplinkKind::Alarm,
            ],
            Arc::clone(&devices) as _,
        );
        dispatcher.register_all(
            &[UplinkKind::User, UplinkKind::UserCredentials],
            Arc::clone(&users) as _,
        );
        let server = GatewayServer::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&directory) as _,
            Arc::new(dispatcher),
            events.store_factory(),
        );
        Self {
            config,
            events,
            registry,
            server,
            directory,
            activity,
            rules,
            fetch,
            devices,
            users,
        }
    }

    /// Register a fresh edge under the given routing key and secret.
    pub fn register_edge(&self, routing_key: &str, secret: &str) -> Edge {
        let edge = Edge {
            tenant_id: TenantId::random(),
            id: EdgeId::random(),
            customer_id: Some(CustomerId::random()),
            routing_key: routing_key.to_string(),
            secret: secret.to_string(),
            version: EdgeVersion::V3,
            name: format!("edge-{routing_key}"),
            edge_type: "default".to_string(),
        };
        self.directory.insert(edge.clone());
        edge
    }

    /// Open a connection and run the handshake. On acceptance the returned
    /// client pumps downlinks (acknowledging them when `auto_ack` is set).
    pub async fn connect(
        &self,
        routing_key: &str,
        secret: &str,
        auto_ack: bool,
    ) -> (ConnectResponseCode, Option<ConnectedEdge>) {
        let (server_link, client_link) = link_pair(256);
        let (session, _handle) = self.server.accept_connection(server_link);
        client_link
            .send(RequestMsg::Connect(ConnectRequestMsg {
                routing_key: routing_key.to_string(),
                secret: secret.to_string(),
            }))
            .await
            .expect("connect send");
        let code = match client_link.recv().await {
            Some(ResponseMsg::ConnectResponse(response)) => response.code,
            other => panic!("expected connect response, got {:?}", other),
        };
        tracing::debug!(routing_key, ?code, "handshake finished");
        if code != ConnectResponseCode::Accepted {
            return (code, None);
        }
        let connected = ConnectedEdge::start(session, client_link, auto_ack);
        (code, Some(connected))
    }
}

/// The client half of one accepted session, with a pump task recording and
/// (optionally) acknowledging downlinks.
pub struct ConnectedEdge {
    /// The server-side session.
    pub session: Arc<EdgeSession>,
    client: Arc<ClientLink>,
    downlinks: Arc<Mutex<Vec<DownlinkMsg>>>,
    uplink_responses: Mutex<mpsc::UnboundedReceiver<UplinkResponseMsg>>,
    auto_ack: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl ConnectedEdge {
    fn start(session: Arc<EdgeSession>, client: ClientLink, auto_ack: bool) -> Self {
        let client = Arc::new(client);
        let downlinks = Arc::new(Mutex::new(Vec::new()));
        let auto_ack = Arc::new(AtomicBool::new(auto_ack));
        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();
        let pump = {
            let client = Arc::clone(&client);
            let downlinks = Arc::clone(&downlinks);
            let auto_ack = Arc::clone(&auto_ack);
            tokio::spawn(async move {
                while let Some(msg) = client.recv().await {
                    match msg {
                        ResponseMsg::Downlink(downlink) => {
                            downlinks.lock().await.push(downlink.clone());
                            if auto_ack.load(Ordering::SeqCst) {
                                let _ = client
                                    .send(RequestMsg::DownlinkAck(DownlinkResponseMsg {
                                        msg_id: downlink.msg_id,
                                        success: true,
                                        error_msg: String::new(),
                                    }))
                                    .await;
                            }
                        }
                        ResponseMsg::UplinkResponse(response) => {
                            let _ = uplink_tx.send(response);
                        }
                        ResponseMsg::ConnectResponse(_) => {}
                    }
                }
            })
        };
        Self {
            session,
            client,
            downlinks,
            uplink_responses: Mutex::new(uplink_rx),
            auto_ack,
            pump,
        }
    }

    /// Toggle downlink auto-acknowledgement.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// All downlinks received so far.
    pub async fn downlinks(&self) -> Vec<DownlinkMsg> {
        self.downlinks.lock().await.clone()
    }

    /// Wait until at least `n` downlinks have arrived.
    pub async fn wait_for_downlinks(&self, n: usize, timeout: Duration) -> Vec<DownlinkMsg> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let downlinks = self.downlinks.lock().await;
                if downlinks.len() >= n {
                    return downlinks.clone();
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let downlinks = self.downlinks.lock().await;
                panic!(
                    "expected {} downlinks within {:?}, got {}",
                    n,
                    timeout,
                    downlinks.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Send one uplink batch and await the whole-batch response.
    pub async fn send_uplink(&self, msgs: Vec<UplinkPayload>) -> UplinkResponseMsg {
        self.client
            .send(RequestMsg::Uplink(UplinkMsg { msgs }))
            .await
            .expect("uplink send");
        self.uplink_responses
            .lock()
            .await
            .recv()
            .await
            .expect("uplink response")
    }

    /// Close the connection from the client side.
    pub fn disconnect(&self) {
        self.client.shutdown();
    }
}

impl Drop for ConnectedEdge {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
