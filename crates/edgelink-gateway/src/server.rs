//! Accepts transport connections and drives each session's inbound loop.
//!
//! The first frame of a connection must be the connect handshake; a rejected
//! handshake closes the link. After acceptance, uplink batches are dispatched
//! and answered, downlink acknowledgements feed the pending map, and a closed
//! link unregisters the session.

use crate::config::GatewayConfig;
use crate::dispatch::UplinkDispatcher;
use crate::provider::EdgeProvider;
use crate::registry::SessionRegistry;
use crate::session::EdgeSession;
use crate::store::EventStoreFactory;
use edgelink_proto::link::ServerLink;
use edgelink_proto::msg::{
    ConnectResponseCode, RequestMsg, ResponseMsg, UplinkMsg, UplinkResponseMsg,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The gateway's connection acceptor.
pub struct GatewayServer {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    edges: Arc<dyn EdgeProvider>,
    dispatcher: Arc<UplinkDispatcher>,
    factory: Arc<dyn EventStoreFactory>,
}

impl GatewayServer {
    /// Create a server over the registry, the edge directory, the uplink
    /// dispatcher and the backend factory selected at startup.
    pub fn new(
        config: GatewayConfig,
        registry: Arc<SessionRegistry>,
        edges: Arc<dyn EdgeProvider>,
        dispatcher: Arc<UplinkDispatcher>,
        factory: Arc<dyn EventStoreFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            edges,
            dispatcher,
            factory,
        })
    }

    /// Bind a new session to the configured backend and spawn its inbound
    /// loop. Returns the session and the loop's task handle.
    pub fn accept_connection(
        self: &Arc<Self>,
        link: ServerLink,
    ) -> (Arc<EdgeSession>, JoinHandle<()>) {
        let session = EdgeSession::new(link, self.config.clone(), self.factory.as_ref());
        let server = Arc::clone(self);
        let spawned = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            server.run_session(spawned).await;
        });
        (session, handle)
    }

    async fn run_session(&self, session: Arc<EdgeSession>) {
        while let Some(msg) = session.core().recv().await {
            match msg {
                RequestMsg::Connect(request) => {
                    let response = session.process_connect(&request, self.edges.as_ref()).await;
                    let accepted = response.code == ConnectResponseCode::Accepted;
                    if session
                        .core()
                        .send_response(ResponseMsg::ConnectResponse(response))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if accepted {
                        self.registry.on_connect(Arc::clone(&session)).await;
                    } else {
                        session.core().shutdown_link();
                        break;
                    }
                }
                RequestMsg::Uplink(batch) => {
                    let response = self.handle_uplink(&session, batch).await;
                    if session
                        .core()
                        .send_response(ResponseMsg::UplinkResponse(response))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                RequestMsg::DownlinkAck(ack) => {
                    session.core().handle_downlink_ack(&ack).await;
                }
            }
        }
        debug!(session_id = %session.session_id(), "inbound loop ended");
        if let Some(edge) = session.edge().await {
            self.registry
                .on_disconnect(edge.id, session.session_id())
                .await;
        }
    }

    async fn handle_uplink(&self, session: &Arc<EdgeSession>, batch: UplinkMsg) -> UplinkResponseMsg {
        let Some(edge) = session.edge().await else {
            return UplinkResponseMsg {
                success: false,
                error_msg: "session is not connected".to_string(),
            };
        };
        match self.dispatcher.dispatch(session.core(), batch).await {
            Ok(()) => UplinkResponseMsg {
                success: true,
                error_msg: String::new(),
            },
            Err(e) => {
                warn!(edge_id = %edge.id, error = %e, "uplink batch failed");
                self.registry
                    .notify_comm_failure(edge.tenant_id, edge.id, &e.to_string())
                    .await;
                UplinkResponseMsg {
                    success: false,
                    error_msg: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActivityPersistence, EventStoreKind};
    use crate::dispatch::RecordingUplinkProcessor;
    use crate::edge::{CustomerId, Edge, EdgeId, EdgeVersion, TenantId};
    use crate::provider::{
        InMemoryEdgeDirectory, RecordingActivityLog, RecordingRuleNotifier, StaticEntityFetcher,
    };
    use crate::store::EdgeEventService;
    use edgelink_proto::link::{link_pair, ClientLink};
    use edgelink_proto::msg::{ConnectRequestMsg, UplinkKind, UplinkPayload};
    use std::time::Duration;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            events_batch_size: 10,
            no_records_sleep_ms: 50,
            sleep_between_batches_ms: 5,
            send_ack_timeout_ms: 300,
            ..Default::default()
        }
    }

    struct ServerHarness {
        server: Arc<GatewayServer>,
        registry: Arc<SessionRegistry>,
        directory: Arc<InMemoryEdgeDirectory>,
        devices: Arc<RecordingUplinkProcessor>,
        rules: Arc<RecordingRuleNotifier>,
    }

    fn server_harness() -> ServerHarness {
        let events = Arc::new(EdgeEventService::new(EventStoreKind::Polled));
        let activity = Arc::new(RecordingActivityLog::new(ActivityPersistence::Attribute));
        let rules = Arc::new(RecordingRuleNotifier::new());
        let fetch = Arc::new(StaticEntityFetcher::new());
        let registry = SessionRegistry::new(
            test_config(),
            Arc::clone(&events),
            Arc::clone(&activity) as _,
            Arc::clone(&rules) as _,
            fetch as _,
        );
        let directory = Arc::new(InMemoryEdgeDirectory::new());
        let devices = Arc::new(RecordingUplinkProcessor::new());
        let mut dispatcher = UplinkDispatcher::new();
        dispatcher.register(UplinkKind::Device, Arc::clone(&devices) as _);
        let server = GatewayServer::new(
            test_config(),
            Arc::clone(&registry),
            Arc::clone(&directory) as _,
            Arc::new(dispatcher),
            events.store_factory(),
        );
        ServerHarness {
            server,
            registry,
            directory,
            devices,
            rules,
        }
    }

    fn test_edge(routing_key: &str) -> Edge {
        Edge {
            tenant_id: TenantId::random(),
            id: EdgeId::random(),
            customer_id: Some(CustomerId::random()),
            routing_key: routing_key.to_string(),
            secret: "s3cret".to_string(),
            version: EdgeVersion::V3,
            name: "e".to_string(),
            edge_type: "default".to_string(),
        }
    }

    async fn connect(client: &ClientLink, routing_key: &str, secret: &str) -> ConnectResponseCode {
        client
            .send(RequestMsg::Connect(ConnectRequestMsg {
                routing_key: routing_key.to_string(),
                secret: secret.to_string(),
            }))
            .await
            .unwrap();
        match client.recv().await {
            Some(ResponseMsg::ConnectResponse(response)) => response.code,
            other => panic!("expected connect response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_accepted_registers_session() {
        let h = server_harness();
        let edge = test_edge("rk-1");
        h.directory.insert(edge.clone());

        let (server_link, client) = link_pair(64);
        let (_session, _handle) = h.server.accept_connection(server_link);

        let code = connect(&client, "rk-1", "s3cret").await;
        assert_eq!(code, ConnectResponseCode::Accepted);
        assert!(h.registry.is_connected(edge.id));
    }

    #[tokio::test]
    async fn test_handshake_rejected_closes_link_and_registers_nothing() {
        let h = server_harness();
        let edge = test_edge("rk-1");
        h.directory.insert(edge.clone());

        let (server_link, client) = link_pair(64);
        let (_session, handle) = h.server.accept_connection(server_link);

        let code = connect(&client, "rk-1", "wrong").await;
        assert_eq!(code, ConnectResponseCode::BadCredentials);

        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(!h.registry.is_connected(edge.id));
        assert_eq!(h.registry.connected_count(), 0);
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_uplink_is_dispatched_and_answered() {
        let h = server_harness();
        let edge = test_edge("rk-1");
        h.directory.insert(edge.clone());

        let (server_link, client) = link_pair(64);
        let (_session, _handle) = h.server.accept_connection(server_link);
        connect(&client, "rk-1", "s3cret").await;

        client
            .send(RequestMsg::Uplink(UplinkMsg {
                msgs: vec![UplinkPayload::DeviceUpdate {
                    entity_id: uuid::Uuid::new_v4(),
                    body: serde_json::json!({"name": "d"}),
                }],
            }))
            .await
            .unwrap();
        // the event-check loop shares the link; skip downlinks until the
        // uplink response arrives
        let response = loop {
            match client.recv().await {
                Some(ResponseMsg::UplinkResponse(response)) => break response,
                Some(_) => continue,
                None => panic!("link closed before uplink response"),
            }
        };
        assert!(response.success);
        assert_eq!(h.devices.applied().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_uplink_emits_comm_failure() {
        let h = server_harness();
        let edge = test_edge("rk-1");
        h.directory.insert(edge.clone());
        h.devices.fail_all();

        let (server_link, client) = link_pair(64);
        let (_session, _handle) = h.server.accept_connection(server_link);
        connect(&client, "rk-1", "s3cret").await;

        client
            .send(RequestMsg::Uplink(UplinkMsg {
                msgs: vec![UplinkPayload::DeviceUpdate {
                    entity_id: uuid::Uuid::new_v4(),
                    body: serde_json::json!({}),
                }],
            }))
            .await
            .unwrap();
        let response = loop {
            match client.recv().await {
                Some(ResponseMsg::UplinkResponse(response)) => break response,
                Some(_) => continue,
                None => panic!("link closed before uplink response"),
            }
        };
        assert!(!response.success);

        let triggers = h.rules.events().await;
        assert!(triggers
            .iter()
            .any(|(id, t)| *id == edge.id
                && *t == crate::provider::ConnectivityTrigger::CommunicationFailure));
    }

    #[tokio::test]
    async fn test_uplink_before_connect_is_rejected() {
        let h = server_harness();
        let (server_link, client) = link_pair(64);
        let (_session, _handle) = h.server.accept_connection(server_link);

        client
            .send(RequestMsg::Uplink(UplinkMsg { msgs: vec![] }))
            .await
            .unwrap();
        match client.recv().await {
            Some(ResponseMsg::UplinkResponse(response)) => {
                assert!(!response.success);
            }
            other => panic!("expected uplink response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_shutdown_unregisters_session() {
        let h = server_harness();
        let edge = test_edge("rk-1");
        h.directory.insert(edge.clone());

        let (server_link, client) = link_pair(64);
        let (_session, handle) = h.server.accept_connection(server_link);
        connect(&client, "rk-1", "s3cret").await;
        assert!(h.registry.is_connected(edge.id));

        client.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(!h.registry.is_connected(edge.id));
    }
}
