//! Per-connection ownership of media transport handles.
//!
//! Every handle obtained from the media engine is owned by exactly one
//! connection and one direction. The manager guarantees closure on every
//! exit path and tolerates double closes; engine calls never happen while a
//! map guard is held.

use crate::media::{
    ConsumerHandle, EngineError, MediaRouter, MediaTransport, ProducerHandle, TransportOptions,
};
use crate::protocol::{Direction, MediaKind};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no media engine configured")]
    EngineUnavailable,
    #[error("no {0} transport for this connection")]
    NotFound(Direction),
    #[error("transport create failed: {0}")]
    CreateFailed(#[source] EngineError),
    #[error(transparent)]
    Collaborator(#[from] EngineError),
}

#[derive(Default)]
struct ConnectionMedia {
    send: Option<Arc<dyn MediaTransport>>,
    recv: Option<Arc<dyn MediaTransport>>,
}

pub struct TransportManager {
    router: Option<Arc<dyn MediaRouter>>,
    options: TransportOptions,
    connections: DashMap<String, ConnectionMedia>,
}

impl TransportManager {
    pub fn new(router: Option<Arc<dyn MediaRouter>>, options: TransportOptions) -> Self {
        Self {
            router,
            options,
            connections: DashMap::new(),
        }
    }

    pub fn has_engine(&self) -> bool {
        self.router.is_some()
    }

    pub fn router_capabilities(&self) -> Result<serde_json::Value, TransportError> {
        self.router
            .as_ref()
            .map(|router| router.rtp_capabilities())
            .ok_or(TransportError::EngineUnavailable)
    }

    /// Create a transport for one direction and record ownership. A second
    /// handle for the same direction replaces the first, which is closed so
    /// it cannot leak under the engine.
    pub async fn create_transport(
        &self,
        connection_id: &str,
        direction: Direction,
    ) -> Result<serde_json::Value, TransportError> {
        let router = self
            .router
            .as_ref()
            .ok_or(TransportError::EngineUnavailable)?
            .clone();

        let transport = router
            .create_transport(&self.options)
            .await
            .map_err(TransportError::CreateFailed)?;

        let previous = {
            let mut entry = self
                .connections
                .entry(connection_id.to_string())
                .or_default();
            let slot = match direction {
                Direction::Send => &mut entry.send,
                Direction::Recv => &mut entry.recv,
            };
            slot.replace(Arc::clone(&transport))
        };
        if let Some(old) = previous {
            debug!(connection_id = %connection_id, %direction, transport_id = %old.id(), "closing replaced transport");
            old.close().await;
        }

        Ok(json!({
            "id": transport.id(),
            "parameters": transport.connection_parameters(),
        }))
    }

    pub async fn connect_transport(
        &self,
        connection_id: &str,
        direction: Direction,
        remote_parameters: serde_json::Value,
    ) -> Result<(), TransportError> {
        let transport = self
            .get(connection_id, direction)
            .ok_or(TransportError::NotFound(direction))?;
        transport.connect(remote_parameters).await?;
        Ok(())
    }

    /// Start producing on the connection's send transport.
    pub async fn produce(
        &self,
        connection_id: &str,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerHandle, TransportError> {
        let transport = self
            .get(connection_id, Direction::Send)
            .ok_or(TransportError::NotFound(Direction::Send))?;
        Ok(transport.produce(kind, rtp_parameters).await?)
    }

    /// Start consuming a partner's producer on the receive transport.
    pub async fn consume(
        &self,
        connection_id: &str,
        producer_id: &str,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerHandle, TransportError> {
        let transport = self
            .get(connection_id, Direction::Recv)
            .ok_or(TransportError::NotFound(Direction::Recv))?;
        Ok(transport.consume(producer_id, rtp_capabilities).await?)
    }

    /// Close every handle the connection owns. Safe to call on connections
    /// that own nothing and on handles that are already closed.
    pub async fn close_all(&self, connection_id: &str) {
        if let Some((_, media)) = self.connections.remove(connection_id) {
            if let Some(transport) = media.send {
                transport.close().await;
            }
            if let Some(transport) = media.recv {
                transport.close().await;
            }
        }
    }

    fn get(&self, connection_id: &str, direction: Direction) -> Option<Arc<dyn MediaTransport>> {
        self.connections.get(connection_id).and_then(|entry| {
            match direction {
                Direction::Send => entry.send.clone(),
                Direction::Recv => entry.recv.clone(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockEngine;
    use crate::media::MediaEngine;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn create_connect_produce_consume_roundtrip() {
        let engine = MockEngine::new();
        let router = engine.create_router(&[]).await.unwrap();
        let manager = TransportManager::new(Some(router), TransportOptions::default());

        let descriptor = manager
            .create_transport("c1", Direction::Send)
            .await
            .unwrap();
        assert!(descriptor["id"].is_string());

        manager
            .create_transport("c1", Direction::Recv)
            .await
            .unwrap();
        manager
            .connect_transport("c1", Direction::Send, json!({ "dtlsParameters": {} }))
            .await
            .unwrap();

        let producer = manager
            .produce("c1", MediaKind::Video, json!({}))
            .await
            .unwrap();
        let consumer = manager
            .consume("c1", &producer.id, json!({}))
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer.id);
    }

    #[tokio::test]
    async fn duplicate_direction_closes_the_replaced_transport_once() {
        let engine = MockEngine::new();
        let router = engine.create_router(&[]).await.unwrap();
        let mock = engine.last_router();
        let manager = TransportManager::new(Some(router), TransportOptions::default());

        manager
            .create_transport("c1", Direction::Send)
            .await
            .unwrap();
        manager
            .create_transport("c1", Direction::Send)
            .await
            .unwrap();

        let created = mock.created.lock();
        assert_eq!(created.len(), 2);
        assert!(created[0].is_closed());
        assert_eq!(created[0].close_count.load(Ordering::SeqCst), 1);
        assert!(!created[1].is_closed());
    }

    #[tokio::test]
    async fn connect_without_transport_is_not_found() {
        let engine = MockEngine::new();
        let router = engine.create_router(&[]).await.unwrap();
        let manager = TransportManager::new(Some(router), TransportOptions::default());

        let result = manager
            .connect_transport("c1", Direction::Send, json!({}))
            .await;
        assert!(matches!(result, Err(TransportError::NotFound(Direction::Send))));
    }

    #[tokio::test]
    async fn close_all_is_idempotent_and_closes_each_handle_once() {
        let engine = MockEngine::new();
        let router = engine.create_router(&[]).await.unwrap();
        let mock = engine.last_router();
        let manager = TransportManager::new(Some(router), TransportOptions::default());

        manager
            .create_transport("c1", Direction::Send)
            .await
            .unwrap();
        manager
            .create_transport("c1", Direction::Recv)
            .await
            .unwrap();

        manager.close_all("c1").await;
        manager.close_all("c1").await;
        manager.close_all("never-seen").await;

        let created = mock.created.lock();
        assert_eq!(created.len(), 2);
        for transport in created.iter() {
            assert!(transport.is_closed());
            assert_eq!(transport.close_count.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn engine_failures_surface_and_record_nothing() {
        let engine = MockEngine::new();
        let router = engine.create_router(&[]).await.unwrap();
        engine.fail_transport_create.store(true, Ordering::SeqCst);
        let manager = TransportManager::new(Some(router), TransportOptions::default());

        let result = manager.create_transport("c1", Direction::Send).await;
        assert!(matches!(result, Err(TransportError::CreateFailed(_))));
        assert!(manager
            .connect_transport("c1", Direction::Send, json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn without_engine_every_operation_is_unavailable() {
        let manager = TransportManager::new(None, TransportOptions::default());
        assert!(!manager.has_engine());
        assert!(matches!(
            manager.router_capabilities(),
            Err(TransportError::EngineUnavailable)
        ));
        assert!(matches!(
            manager.create_transport("c1", Direction::Send).await,
            Err(TransportError::EngineUnavailable)
        ));
    }
}
