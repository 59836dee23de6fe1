//! HTTP API handlers

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use super::server::AppState;
use crate::audio::device::{list_devices, AudioDeviceInfo};
use crate::session::Diagnostics;
use crate::sync::precision::{AlignmentReport, DeviceSyncProfile};

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// System status
#[derive(Serialize)]
pub struct SystemStatus {
    pub mode: String,
    pub session_id: String,
    pub local_addr: String,
    pub peers: Vec<String>,
    pub closed: bool,
    pub uptime_seconds: u64,
}

/// Device profiles with the last alignment result
#[derive(Serialize)]
pub struct SyncProfiles {
    pub profiles: Vec<DeviceSyncProfile>,
    pub last_alignment: Option<AlignmentReport>,
}

/// Get system status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let session = &state.session;
    let status = SystemStatus {
        mode: state.mode.clone(),
        session_id: session.id().to_string(),
        local_addr: session.local_addr().to_string(),
        peers: session.peers().iter().map(|p| p.to_string()).collect(),
        closed: session.is_closed(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };
    Json(ApiResponse::ok(status))
}

/// Get drift, buffer health and counters
pub async fn get_diagnostics(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Diagnostics>> {
    if state.session.is_closed() {
        return Json(ApiResponse::error("session closed"));
    }
    Json(ApiResponse::ok(state.session.diagnostics()))
}

/// Get available audio devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    match tokio::task::spawn_blocking(list_devices).await {
        Ok(devices) => Json(ApiResponse::ok(devices)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

/// Get per-device sync profiles
pub async fn get_profiles(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SyncProfiles>> {
    Json(ApiResponse::ok(SyncProfiles {
        profiles: state.session.engine().profiles(),
        last_alignment: state.session.last_alignment(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, SessionConfig, SyncConfig};
    use crate::session::Session;

    async fn state() -> Arc<AppState> {
        let network = NetworkConfig {
            bind_address: "127.0.0.1".into(),
            udp_port: 0,
            peers: vec!["127.0.0.1:9".parse().unwrap()],
            ..Default::default()
        };
        let session = Session::open(SessionConfig::default(), network, SyncConfig::default())
            .await
            .unwrap();
        Arc::new(AppState::new(Arc::new(session), "receiver"))
    }

    #[tokio::test]
    async fn test_status_and_profiles() {
        let state = state().await;

        let Json(status) = get_status(State(state.clone())).await;
        let status = status.data.unwrap();
        assert_eq!(status.mode, "receiver");
        assert_eq!(status.peers, vec!["127.0.0.1:9".to_string()]);
        assert!(!status.closed);

        let Json(profiles) = get_profiles(State(state.clone())).await;
        let profiles = profiles.data.unwrap();
        assert_eq!(profiles.profiles.len(), 1);
        assert!(profiles.last_alignment.is_none());
    }

    #[tokio::test]
    async fn test_diagnostics_serialize() {
        let state = state().await;
        let Json(response) = get_diagnostics(State(state.clone())).await;
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["buffer_health"], "UNDERFLOW_RISK");
        assert_eq!(json["data"]["current_sample_rate"], 48000.0);

        state.session.close().await;
        let Json(response) = get_diagnostics(State(state)).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("session closed"));
    }
}
