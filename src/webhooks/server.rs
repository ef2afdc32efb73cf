//! Webhook HTTP server handlers
//!
//! Implements the ValidatingAdmissionWebhook HTTP endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::webhooks::validators::{
    allow, AdmissionVerdict, NamespaceValidator, ObjectReview, ObjectValidator, Operation,
};

/// Serving path for namespace admission (fails closed).
pub const NAMESPACE_SERVING_PATH: &str = "/validate-v1-namespace";
/// Serving path for hierarchy-configuration admission (fails closed).
pub const HIERARCHY_SERVING_PATH: &str = "/validate-hierarchy";
/// Serving path for propagated-object admission (fails open).
pub const OBJECTS_SERVING_PATH: &str = "/validate-objects";

/// Kubernetes AdmissionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub user_info: Option<UserInfo>,
    pub object: Option<serde_json::Value>,
    pub old_object: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: Option<String>,
}

/// AdmissionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The decoded shape of a HierarchyConfiguration admission object.
#[derive(Debug, Deserialize)]
struct HierarchyConfiguration {
    #[serde(default)]
    metadata: HierarchyMeta,
    #[serde(default)]
    spec: HierarchySpec,
}

#[derive(Debug, Default, Deserialize)]
struct HierarchyMeta {
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HierarchySpec {
    #[serde(default)]
    parent: Option<String>,
}

/// Shared state for webhook handlers
pub struct WebhookState {
    pub client: Option<Client>,
    pub namespace_validator: NamespaceValidator,
    pub object_validator: ObjectValidator,
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(NAMESPACE_SERVING_PATH, post(validate_namespace))
        .route(HIERARCHY_SERVING_PATH, post(validate_hierarchy))
        .route(OBJECTS_SERVING_PATH, post(validate_object))
        .with_state(state)
}

fn verdict_response(uid: &str, verdict: AdmissionVerdict) -> AdmissionReviewResponse {
    let status = if verdict.allowed {
        None
    } else {
        Some(AdmissionStatus {
            code: verdict.code,
            message: verdict.message,
            reason: verdict.reason,
        })
    };
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed: verdict.allowed,
            status,
        },
    }
}

fn bad_request(uid: &str, message: &str) -> AdmissionReviewResponse {
    verdict_response(
        uid,
        AdmissionVerdict {
            allowed: false,
            reason: Some("BadRequest".to_string()),
            code: 400,
            message: message.to_string(),
        },
    )
}

fn username(request: &AdmissionRequest) -> String {
    request
        .user_info
        .as_ref()
        .and_then(|u| u.username.clone())
        .unwrap_or_default()
}

/// Namespace admission handler. Fails closed: malformed requests are denied.
async fn validate_namespace(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let Some(request) = review.request else {
        error!("Admission review missing request");
        return (
            StatusCode::BAD_REQUEST,
            Json(bad_request("", "Missing request in AdmissionReview")),
        );
    };
    let uid = request.uid.clone();
    info!(uid = %uid, operation = %request.operation, name = ?request.name,
        "Processing namespace admission request");

    let verdict = match Operation::parse(&request.operation) {
        Some(Operation::Delete) => {
            // DELETE carries the object in oldObject.
            let name = request
                .old_object
                .as_ref()
                .and_then(|o| serde_json::from_value::<Namespace>(o.clone()).ok())
                .and_then(|ns| ns.metadata.name)
                .or_else(|| request.name.clone());
            match name {
                Some(name) => state
                    .namespace_validator
                    .validate_delete(&username(&request), &name),
                None => {
                    return (
                        StatusCode::OK,
                        Json(bad_request(&uid, "Cannot decode namespace")),
                    )
                }
            }
        }
        Some(_) => allow(""),
        None => {
            return (
                StatusCode::OK,
                Json(bad_request(&uid, "Unknown operation")),
            )
        }
    };

    log_verdict("namespace", &verdict);
    (StatusCode::OK, Json(verdict_response(&uid, verdict)))
}

/// Hierarchy admission handler: validates parent changes. Fails closed.
async fn validate_hierarchy(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let Some(request) = review.request else {
        error!("Admission review missing request");
        return (
            StatusCode::BAD_REQUEST,
            Json(bad_request("", "Missing request in AdmissionReview")),
        );
    };
    let uid = request.uid.clone();

    let hierarchy: HierarchyConfiguration = match request
        .object
        .clone()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(h)) => h,
        Ok(None) => return (StatusCode::OK, Json(bad_request(&uid, "Missing object"))),
        Err(e) => {
            error!(error = %e, "Failed to parse HierarchyConfiguration");
            return (
                StatusCode::OK,
                Json(bad_request(&uid, &format!("Failed to parse object: {}", e))),
            );
        }
    };

    let namespace = hierarchy
        .metadata
        .namespace
        .or_else(|| request.namespace.clone())
        .unwrap_or_default();
    let verdict = state.namespace_validator.validate_parent_change(
        &username(&request),
        &namespace,
        hierarchy.spec.parent.as_deref(),
    );

    log_verdict("hierarchy", &verdict);
    (StatusCode::OK, Json(verdict_response(&uid, verdict)))
}

/// Object admission handler. Fails open: undecodable requests are allowed.
async fn validate_object(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let Some(request) = review.request else {
        warn!("Admission review missing request, allowing");
        return (
            StatusCode::OK,
            Json(verdict_response("", allow("fail open"))),
        );
    };
    let uid = request.uid.clone();

    let Some(operation) = Operation::parse(&request.operation) else {
        return (
            StatusCode::OK,
            Json(verdict_response(&uid, allow("fail open"))),
        );
    };
    let namespace = request.namespace.clone().unwrap_or_default();
    let namespace_terminating = is_namespace_terminating(&state.client, &namespace).await;

    let labels_of = |value: &Option<serde_json::Value>| -> Option<BTreeMap<String, String>> {
        value
            .as_ref()
            .and_then(|v| v.pointer("/metadata/labels"))
            .and_then(|l| serde_json::from_value(l.clone()).ok())
    };
    let old_labels = labels_of(&request.old_object);
    let new_labels = labels_of(&request.object);

    let user = username(&request);
    let object_review = ObjectReview {
        operation,
        namespace: &namespace,
        username: &user,
        group: &request.resource.group,
        resource: &request.resource.resource,
        old_labels: old_labels.as_ref(),
        new_labels: new_labels.as_ref(),
        namespace_terminating,
    };
    let verdict = state.object_validator.validate(&object_review);

    log_verdict("object", &verdict);
    (StatusCode::OK, Json(verdict_response(&uid, verdict)))
}

/// Best-effort check whether a namespace is terminating. Errors lean open,
/// matching the endpoint's failure policy.
async fn is_namespace_terminating(client: &Option<Client>, namespace: &str) -> bool {
    let Some(client) = client else {
        return false;
    };
    let api: Api<Namespace> = Api::all(client.clone());
    match api.get_opt(namespace).await {
        Ok(Some(ns)) => ns
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Terminating"),
        _ => false,
    }
}

fn log_verdict(endpoint: &str, verdict: &AdmissionVerdict) {
    if verdict.allowed {
        tracing::debug!(endpoint, message = %verdict.message, "Allowed");
    } else {
        info!(endpoint, code = verdict.code, reason = ?verdict.reason,
            message = %verdict.message, "Denied");
    }
}

/// Default path to the TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to the TLS key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:8443 and serves the admission endpoints.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::Tls(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))
}

/// Errors that can occur when running the webhook server
#[derive(Debug)]
pub enum WebhookError {
    Tls(String),
    Server(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::Tls(msg) => write!(f, "Webhook TLS error: {}", msg),
            WebhookError::Server(msg) => write!(f, "Webhook server error: {}", msg),
        }
    }
}

impl std::error::Error for WebhookError {}
