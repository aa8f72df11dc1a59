//! `/validate` endpoint for BookkeeperCluster admission reviews
//!
//! The supported-version graph is read from disk on every request so an
//! updated ConfigMap mount takes effect without a restart. The live bookie
//! ConfigMap is read through the client handed to [`run_webhook_server`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::policies::{ValidationContext, ValidationResult, validate_create, validate_update};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::controller::validation::SupportedVersions;
use crate::crd::BookkeeperCluster;
use crate::resources::common::config_map_name;

pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
pub const WEBHOOK_PORT: u16 = 8443;

/// Failure to start or keep serving the webhook
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("webhook server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Incoming `admission.k8s.io/v1` AdmissionReview; only the fields we read
#[derive(Debug, Deserialize)]
pub struct AdmissionReview {
    pub request: Option<AdmissionRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub object: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub response: AdmissionResponse,
}

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
pub struct AdmissionStatus {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionResponse {
    fn allow(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            allowed: true,
            status: None,
        }
    }

    fn deny(uid: &str, reason: Option<String>, message: String) -> Self {
        Self {
            uid: uid.to_string(),
            allowed: false,
            status: Some(AdmissionStatus {
                code: 403,
                message,
                reason,
            }),
        }
    }

    fn from_result(uid: &str, result: ValidationResult) -> Self {
        if result.allowed {
            return Self::allow(uid);
        }
        Self::deny(
            uid,
            result.reason,
            result.message.unwrap_or_else(|| "validation failed".to_string()),
        )
    }

    fn into_review(self) -> AdmissionReviewResponse {
        AdmissionReviewResponse {
            api_version: "admission.k8s.io/v1",
            kind: "AdmissionReview",
            response: self,
        }
    }
}

struct WebhookState {
    client: Client,
    config: Arc<OperatorConfig>,
}

fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate", post(validate))
        .with_state(state)
}

async fn validate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReviewResponse> {
    let response = match review.request {
        Some(request) => admit(&state, request).await,
        None => AdmissionResponse::deny("", None, "AdmissionReview has no request".to_string()),
    };
    Json(response.into_review())
}

async fn admit(state: &WebhookState, request: AdmissionRequest) -> AdmissionResponse {
    let uid = request.uid.as_str();
    info!(uid, operation = %request.operation, name = ?request.name, namespace = ?request.namespace, "admission request");

    let cluster = match decode_cluster(&request) {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return AdmissionResponse::allow(uid),
        Err(message) => return AdmissionResponse::deny(uid, None, message),
    };

    let result = match review_cluster(state, &cluster, &request.operation).await {
        Ok(result) => result,
        Err(e) => ValidationResult::from_error("ValidationUnavailable", &e),
    };
    if !result.allowed {
        warn!(uid, reason = ?result.reason, message = ?result.message, "admission denied");
    }
    AdmissionResponse::from_result(uid, result)
}

/// The cluster under review, or `None` when the request needs no checks.
///
/// Deletes pass, and so do objects already being deleted so their finalizer
/// can always be released.
fn decode_cluster(request: &AdmissionRequest) -> std::result::Result<Option<BookkeeperCluster>, String> {
    if request.operation == "DELETE" {
        return Ok(None);
    }
    let object = request
        .object
        .clone()
        .ok_or_else(|| "admission request has no object".to_string())?;
    let mut cluster: BookkeeperCluster = serde_json::from_value(object)
        .map_err(|e| format!("failed to decode BookkeeperCluster: {}", e))?;
    if cluster.metadata.deletion_timestamp.is_some() {
        return Ok(None);
    }
    if cluster.metadata.namespace.is_none() {
        cluster.metadata.namespace = request.namespace.clone();
    }
    Ok(Some(cluster))
}

async fn review_cluster(
    state: &WebhookState,
    cluster: &BookkeeperCluster,
    operation: &str,
) -> Result<ValidationResult> {
    let versions = SupportedVersions::load(&state.config.supported_versions_path)?;
    match operation {
        "CREATE" => Ok(validate_create(&ValidationContext::new(cluster, &versions, None))),
        "UPDATE" => {
            let live = fetch_live_config_map(&state.client, cluster).await?;
            Ok(validate_update(&ValidationContext::new(
                cluster,
                &versions,
                live.as_ref(),
            )))
        }
        _ => Ok(ValidationResult::allowed()),
    }
}

/// The bookie ConfigMap of a cluster as stored, if it exists yet
async fn fetch_live_config_map(
    client: &Client,
    cluster: &BookkeeperCluster,
) -> Result<Option<ConfigMap>> {
    let name = config_map_name(&cluster.name_any());
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &cluster.namespace().unwrap_or_default());
    api.get_opt(&name).await.map_err(|e| {
        Error::TransientError(format!("failed to get configmap ({}): {}", name, e))
    })
}

/// Serve `/validate` over TLS on [`WEBHOOK_PORT`]
pub async fn run_webhook_server(
    client: Client,
    config: Arc<OperatorConfig>,
    cert_path: &str,
    key_path: &str,
) -> std::result::Result<(), WebhookError> {
    let tls = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(%addr, "webhook server listening");

    let app = router(Arc::new(WebhookState { client, config }));
    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
