//! Boundary to the external SFU media engine.
//!
//! The engine performs the actual media routing (ICE/DTLS/SRTP, codecs,
//! forwarding); this crate only brokers the control plane: create a router,
//! create/connect transports, produce, consume, close. All negotiation
//! payloads cross this boundary as opaque `serde_json::Value`s and are
//! relayed verbatim between the engine and the client.

use crate::protocol::MediaKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// One entry of the router's media codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Network and bitrate parameters applied to every transport the engine
/// creates. Treated as configuration; the pairing core never inspects them.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub minimum_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub max_sctp_message_size: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            initial_available_outgoing_bitrate: 1_000_000,
            minimum_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
            max_sctp_message_size: 262_144,
        }
    }
}

/// Failure surfaced by the engine on a specific request.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("media engine error: {0}")]
    Collaborator(String),
    #[error("media worker exhausted")]
    Fatal,
}

/// Engine lifecycle state, published on a watch channel. `Fatal` means the
/// media worker is gone for good and the server must stop accepting new
/// sessions and drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Running,
    Fatal,
}

/// Handle to a producer created on a send transport.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerHandle {
    pub id: String,
    pub kind: MediaKind,
}

/// Handle to a consumer created on a receive transport.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerHandle {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self, codecs: &[MediaCodec]) -> Result<Arc<dyn MediaRouter>, EngineError>;

    /// Lifecycle events; receivers learn about worker exhaustion here.
    fn events(&self) -> watch::Receiver<EngineEvent>;
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    /// RTP capabilities a client needs to initialize its device, verbatim.
    fn rtp_capabilities(&self) -> serde_json::Value;

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    /// ICE/DTLS parameters the client needs to connect, verbatim.
    fn connection_parameters(&self) -> serde_json::Value;

    async fn connect(&self, remote_parameters: serde_json::Value) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerHandle, EngineError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerHandle, EngineError>;

    /// Close the transport. Closing an already-closed transport is a no-op.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
pub mod mock {
    //! Deterministic in-memory engine used by the unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    pub struct MockEngine {
        events_tx: watch::Sender<EngineEvent>,
        events_rx: watch::Receiver<EngineEvent>,
        pub fail_transport_create: Arc<AtomicBool>,
        /// Every router handed out, for test inspection.
        pub routers: Mutex<Vec<Arc<MockRouter>>>,
    }

    impl MockEngine {
        pub fn new() -> Self {
            let (events_tx, events_rx) = watch::channel(EngineEvent::Running);
            Self {
                events_tx,
                events_rx,
                fail_transport_create: Arc::new(AtomicBool::new(false)),
                routers: Mutex::new(Vec::new()),
            }
        }

        pub fn trigger_fatal(&self) {
            let _ = self.events_tx.send(EngineEvent::Fatal);
        }

        /// Concretely-typed handle to the most recently created router.
        pub fn last_router(&self) -> Arc<MockRouter> {
            Arc::clone(self.routers.lock().last().expect("no router created yet"))
        }
    }

    #[async_trait]
    impl MediaEngine for MockEngine {
        async fn create_router(
            &self,
            codecs: &[MediaCodec],
        ) -> Result<Arc<dyn MediaRouter>, EngineError> {
            let router = Arc::new(MockRouter {
                capabilities: serde_json::json!({ "codecs": codecs }),
                fail_transport_create: Arc::clone(&self.fail_transport_create),
                next_id: AtomicU64::new(0),
                created: Mutex::new(Vec::new()),
            });
            self.routers.lock().push(Arc::clone(&router));
            Ok(router)
        }

        fn events(&self) -> watch::Receiver<EngineEvent> {
            self.events_rx.clone()
        }
    }

    pub struct MockRouter {
        capabilities: serde_json::Value,
        fail_transport_create: Arc<AtomicBool>,
        next_id: AtomicU64,
        /// Every transport handed out, in creation order, for test inspection.
        pub created: Mutex<Vec<Arc<MockTransport>>>,
    }

    #[async_trait]
    impl MediaRouter for MockRouter {
        fn rtp_capabilities(&self) -> serde_json::Value {
            self.capabilities.clone()
        }

        async fn create_transport(
            &self,
            _options: &TransportOptions,
        ) -> Result<Arc<dyn MediaTransport>, EngineError> {
            if self.fail_transport_create.load(Ordering::SeqCst) {
                return Err(EngineError::Collaborator("transport rejected".into()));
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let transport = Arc::new(MockTransport {
                id: format!("transport-{n}"),
                closed: AtomicBool::new(false),
                close_count: AtomicU64::new(0),
                remote_parameters: Mutex::new(None),
                next_id: AtomicU64::new(0),
            });
            self.created.lock().push(Arc::clone(&transport));
            Ok(transport)
        }
    }

    pub struct MockTransport {
        id: String,
        closed: AtomicBool,
        pub close_count: AtomicU64,
        pub remote_parameters: Mutex<Option<serde_json::Value>>,
        next_id: AtomicU64,
    }

    #[async_trait]
    impl MediaTransport for MockTransport {
        fn id(&self) -> &str {
            &self.id
        }

        fn connection_parameters(&self) -> serde_json::Value {
            serde_json::json!({ "iceParameters": {}, "dtlsParameters": {}, "id": self.id })
        }

        async fn connect(&self, remote_parameters: serde_json::Value) -> Result<(), EngineError> {
            if self.is_closed() {
                return Err(EngineError::Collaborator("transport closed".into()));
            }
            *self.remote_parameters.lock() = Some(remote_parameters);
            Ok(())
        }

        async fn produce(
            &self,
            kind: MediaKind,
            _rtp_parameters: serde_json::Value,
        ) -> Result<ProducerHandle, EngineError> {
            if self.is_closed() {
                return Err(EngineError::Collaborator("transport closed".into()));
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(ProducerHandle {
                id: format!("{}-producer-{n}", self.id),
                kind,
            })
        }

        async fn consume(
            &self,
            producer_id: &str,
            rtp_capabilities: serde_json::Value,
        ) -> Result<ConsumerHandle, EngineError> {
            if self.is_closed() {
                return Err(EngineError::Collaborator("transport closed".into()));
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(ConsumerHandle {
                id: format!("{}-consumer-{n}", self.id),
                producer_id: producer_id.to_string(),
                kind: MediaKind::Video,
                rtp_parameters: rtp_capabilities,
            })
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.close_count.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
