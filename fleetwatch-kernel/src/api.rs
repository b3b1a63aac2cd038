//! Fleet management API client
//!
//! The upstream robot-management service is addressed through a small fixed
//! vocabulary of named operations. Every call is a POST of
//! `{"robot_name": <name>}` to `API_BASE_URL + route`.

use crate::incidents::IncidentStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8090/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    StartCharge,
    IsOnline,
    ReleaseStop,
    DeviceStatus,
    BackToDock,
    RemainingGoals,
    GetStatus,
    Battery,
    CleaningStats,
    CurrentMap,
}

impl ApiOperation {
    pub const ALL: [ApiOperation; 10] = [
        ApiOperation::StartCharge,
        ApiOperation::IsOnline,
        ApiOperation::ReleaseStop,
        ApiOperation::DeviceStatus,
        ApiOperation::BackToDock,
        ApiOperation::RemainingGoals,
        ApiOperation::GetStatus,
        ApiOperation::Battery,
        ApiOperation::CleaningStats,
        ApiOperation::CurrentMap,
    ];

    pub fn route(self) -> &'static str {
        match self {
            ApiOperation::StartCharge => "start_charging",
            ApiOperation::IsOnline => "Online",
            ApiOperation::ReleaseStop => "reset_soft_estop",
            ApiOperation::DeviceStatus => "cleaning_device_status",
            ApiOperation::BackToDock => "navigate_back_to_dock",
            ApiOperation::RemainingGoals => "goal_queue_size",
            ApiOperation::GetStatus => "get_robot_info_rm",
            ApiOperation::Battery => "battery_soc",
            ApiOperation::CleaningStats => "cleaning_stats",
            ApiOperation::CurrentMap => "current_map",
        }
    }

    /// Operator-facing name, as accepted by `FromStr`.
    pub fn name(self) -> &'static str {
        match self {
            ApiOperation::StartCharge => "start charge",
            ApiOperation::IsOnline => "is online",
            ApiOperation::ReleaseStop => "release stop",
            ApiOperation::DeviceStatus => "device status",
            ApiOperation::BackToDock => "back to dock",
            ApiOperation::RemainingGoals => "remaining goals",
            ApiOperation::GetStatus => "get status",
            ApiOperation::Battery => "battery",
            ApiOperation::CleaningStats => "cleaning stats",
            ApiOperation::CurrentMap => "current map",
        }
    }
}

impl fmt::Display for ApiOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ApiOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ApiOperation::ALL
            .into_iter()
            .find(|op| op.name() == wanted || op.route().to_lowercase() == wanted)
            .ok_or_else(|| format!("unknown API operation: {}", s))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{route}: request timed out")]
    Timeout { route: &'static str },

    #[error("{route}: transport error: {source}")]
    Transport {
        route: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{route}: upstream returned HTTP {status}")]
    Upstream { route: &'static str, status: u16 },

    #[error("{route}: undecodable response: {source}")]
    Decode {
        route: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{route}: response has no `{field}`")]
    MissingField {
        route: &'static str,
        field: &'static str,
    },
}

impl ApiError {
    /// Bad-gateway class errors go to the incident log's API error bucket.
    pub fn is_gateway_error(&self) -> bool {
        matches!(self, ApiError::Upstream { status: 502..=504, .. })
    }
}

/// Named-operation access to the fleet management service.
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn call(&self, op: ApiOperation, unit_name: &str) -> Result<Value, ApiError>;
}

/// Base URL and key, read from `API_BASE_URL` and `API_AUTH_KEY`.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub auth_key: String,
}

impl ApiSettings {
    pub fn from_env() -> Self {
        let base_url = std::env::var("API_BASE_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let auth_key = std::env::var("API_AUTH_KEY").unwrap_or_default();
        if auth_key.is_empty() {
            warn!("API_AUTH_KEY not set, fleet API calls are unauthenticated");
        }
        Self { base_url, auth_key }
    }

    pub fn url_for(&self, op: ApiOperation) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{}/{}", base, op.route())
    }
}

pub struct HttpFleetApi {
    client: reqwest::Client,
    settings: ApiSettings,
    incidents: Option<Arc<IncidentStore>>,
}

impl HttpFleetApi {
    pub fn new(settings: ApiSettings, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleetwatch/", env!("CARGO_PKG_VERSION")))
            // the fleet service sits on the robot LAN
            .no_proxy()
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            client,
            settings,
            incidents: None,
        })
    }

    /// Gateway errors get recorded in this store.
    pub fn with_incident_log(mut self, incidents: Arc<IncidentStore>) -> Self {
        self.incidents = Some(incidents);
        self
    }
}

#[async_trait]
impl FleetApi for HttpFleetApi {
    async fn call(&self, op: ApiOperation, unit_name: &str) -> Result<Value, ApiError> {
        let route = op.route();
        let url = self.settings.url_for(op);
        debug!(%url, unit = unit_name, "fleet api call");

        let response = self
            .client
            .post(&url)
            .header("Authorization", &self.settings.auth_key)
            .json(&json!({ "robot_name": unit_name }))
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    ApiError::Timeout { route }
                } else {
                    ApiError::Transport { route, source }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let err = ApiError::Upstream {
                route,
                status: status.as_u16(),
            };
            if err.is_gateway_error() {
                warn!(route, unit = unit_name, status = status.as_u16(), "fleet api gateway error");
                if let Some(store) = &self.incidents {
                    if let Err(e) = store.record_api_error(status.as_u16()).await {
                        warn!(error = %e, "failed to record api error");
                    }
                }
            }
            return Err(err);
        }

        response
            .json::<Value>()
            .await
            .map_err(|source| ApiError::Decode { route, source })
    }
}

/// `result` member of a response, the envelope every status route uses.
pub fn result_of(route: &'static str, body: &Value) -> Result<Value, ApiError> {
    body.get("result")
        .cloned()
        .ok_or(ApiError::MissingField {
            route,
            field: "result",
        })
}
