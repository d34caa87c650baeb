use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::protocol::SessionMode;
use crate::websocket::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    media_engine: bool,
}

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub connections: usize,
    pub waiting_audio: usize,
    pub waiting_video: usize,
    pub active_sessions: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        media_engine: state.transports.has_engine(),
    })
}

pub async fn service_stats(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(ServiceStats {
        connections: state.registry.len(),
        waiting_audio: state.matchmaker.waiting_count(SessionMode::Audio),
        waiting_video: state.matchmaker.waiting_count(SessionMode::Video),
        active_sessions: state.matchmaker.session_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ConnectionHandle;
    use crate::server;

    #[tokio::test]
    async fn stats_reflect_registry_and_matchmaker_state() {
        let state = server::build_state(Config::default(), None).await.unwrap();

        let Json(health) = health_check(State(state.clone())).await;
        assert_eq!(health.status, "ok");
        assert!(!health.media_engine);

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state
            .registry
            .register(ConnectionHandle::new("c1".to_string(), tx));
        state
            .matchmaker
            .enqueue("c1", SessionMode::Video)
            .expect("enqueue should succeed");

        let Json(stats) = service_stats(State(state)).await;
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.waiting_video, 1);
        assert_eq!(stats.waiting_audio, 0);
        assert_eq!(stats.active_sessions, 0);
    }
}
