use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::{FunctionConfig, InstanceId, InstanceSummary};
use orchestrator::InvocationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}"))
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        } else {
            warn!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<InvocationError> for ApiError {
    fn from(e: InvocationError) -> Self {
        let status_code = match &e {
            InvocationError::FunctionNotFound(_) => StatusCode::NOT_FOUND,
            InvocationError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            InvocationError::ProvisioningFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InvocationError::InvocationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            InvocationError::HandlerError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            InvocationError::BackendUnhealthy { .. } => StatusCode::BAD_GATEWAY,
        };
        let message = match &e {
            InvocationError::HandlerError { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self::new(status_code, &message)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionList {
    pub functions: Vec<FunctionConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceList {
    pub instances: Vec<InstanceSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopInstanceResponse {
    pub instance_id: InstanceId,
    pub message: String,
}
