//! REST API Handlers
//!
//! Exposes the orchestrator's upward surface. Every `/v1` call carries the
//! caller's provider credential in `Authorization` and, optionally, the
//! provider in `X-Provider` (default `PACKET`).
//!
//! `GET /v1/instances` streams newline-delimited JSON, one instance per line.

use crate::controlplane::orchestrator::{CreateInstanceRequest, Orchestrator};
use crate::domain::model::{Credential, Provider};
use crate::error::{ClientStatus, Error};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Json, Path, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// Header naming the credential's provider
pub const PROVIDER_HEADER: &str = "x-provider";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Service creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddServiceRequest {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub config: Value,
}

/// Application creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApplicationRequest {
    #[serde(rename = "type")]
    pub app_type: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// Errors
// =============================================================================

/// Handler error; collapses to a disclosed status
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self.0.client_status() {
            ClientStatus::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ClientStatus::AlreadyExists => (StatusCode::CONFLICT, "already_exists"),
            ClientStatus::InvalidArgument => (StatusCode::BAD_REQUEST, "invalid_argument"),
            ClientStatus::FailedPrecondition => {
                (StatusCode::PRECONDITION_FAILED, "failed_precondition")
            }
            ClientStatus::PermissionDenied => (StatusCode::FORBIDDEN, "permission_denied"),
            ClientStatus::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }

        (
            status,
            Json(ApiErrorResponse {
                error: code.to_string(),
                message: self.0.client_message(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// Credential Extraction
// =============================================================================

/// Provider credential presented with the request
#[derive(Debug, Clone)]
pub struct CallerCredential(pub Credential);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerCredential {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        let payload = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim())
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::PermissionDenied("missing credential".into()))?;

        let provider = match parts.headers.get(PROVIDER_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| Error::InvalidArgument("unreadable provider header".into()))?
                .parse::<Provider>()?,
            None => Provider::Packet,
        };

        Ok(CallerCredential(Credential::new(provider, payload)))
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        Router::new()
            // Instance endpoints
            .route("/v1/instances", get(list_instances).post(create_instance))
            .route(
                "/v1/instances/:id",
                get(get_instance).delete(destroy_instance),
            )
            .route("/v1/instances/:id/services", post(add_service))
            .route(
                "/v1/instances/:id/services/:service_type",
                get(get_service)
                    .put(configure_service)
                    .delete(remove_service),
            )
            // Application endpoints
            .route("/v1/applications", post(create_application))
            .route(
                "/v1/applications/:id",
                get(get_application).delete(destroy_application),
            )
            .route(
                "/v1/applications/:id/services",
                post(add_application_service),
            )
            .route(
                "/v1/applications/:id/services/:service_type",
                get(get_application_service)
                    .put(configure_application_service)
                    .delete(remove_application_service),
            )
            .route(
                "/v1/applications/:id/instances/:instance_id",
                put(add_instance).delete(remove_instance),
            )
            // Health endpoint
            .route("/health", get(health_check))
            .with_state(self.orchestrator)
    }
}

type AppState = State<Arc<Orchestrator>>;

// =============================================================================
// Instance Handlers
// =============================================================================

async fn create_instance(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Json(request): Json<CreateInstanceRequest>,
) -> ApiResult<Response> {
    let instance = orchestrator.create_instance(&credential, &request).await?;
    Ok((StatusCode::CREATED, Json(instance)).into_response())
}

async fn get_instance(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let instance = orchestrator.get_instance(&credential, &id).await?;
    Ok(Json(instance).into_response())
}

async fn destroy_instance(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let report = orchestrator.destroy_instance(&credential, &id).await?;
    Ok(Json(report).into_response())
}

/// Newline-delimited JSON; an error mid-stream ends the body
async fn list_instances(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
) -> ApiResult<Response> {
    let instances = orchestrator.list_instances(&credential).await?;

    let lines = instances.map(|item| -> std::result::Result<Vec<u8>, Error> {
        let instance = item.map_err(|e| {
            error!("Instance listing aborted: {}", e);
            e
        })?;
        let mut line = serde_json::to_vec(&instance)?;
        line.push(b'\n');
        Ok(line)
    });

    let mut response = Response::new(Body::from_stream(lines));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}

async fn add_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path(id): Path<String>,
    Json(request): Json<AddServiceRequest>,
) -> ApiResult<Response> {
    let instance = orchestrator
        .add_service(&credential, &id, &request.service_type, &request.config)
        .await?;
    Ok((StatusCode::CREATED, Json(instance)).into_response())
}

async fn get_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, service_type)): Path<(String, String)>,
) -> ApiResult<Response> {
    let service = orchestrator
        .get_service(&credential, &id, &service_type)
        .await?;
    Ok(Json(service).into_response())
}

async fn configure_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, service_type)): Path<(String, String)>,
    Json(config): Json<Value>,
) -> ApiResult<Response> {
    let service = orchestrator
        .configure_service(&credential, &id, &service_type, &config)
        .await?;
    Ok(Json(service).into_response())
}

async fn remove_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, service_type)): Path<(String, String)>,
) -> ApiResult<Response> {
    let instance = orchestrator
        .remove_service(&credential, &id, &service_type)
        .await?;
    Ok(Json(instance).into_response())
}

// =============================================================================
// Application Handlers
// =============================================================================

async fn create_application(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Json(request): Json<CreateApplicationRequest>,
) -> ApiResult<Response> {
    let application = orchestrator
        .create_application(&credential, &request.app_type)
        .await?;
    Ok((StatusCode::CREATED, Json(application)).into_response())
}

async fn get_application(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let application = orchestrator.get_application(&credential, &id).await?;
    Ok(Json(application).into_response())
}

async fn destroy_application(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    orchestrator.destroy_application(&credential, &id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn add_instance(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, instance_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let application = orchestrator
        .add_instance(&credential, &id, &instance_id)
        .await?;
    Ok(Json(application).into_response())
}

async fn remove_instance(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, instance_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let application = orchestrator
        .remove_instance(&credential, &id, &instance_id)
        .await?;
    Ok(Json(application).into_response())
}

async fn add_application_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path(id): Path<String>,
    Json(request): Json<AddServiceRequest>,
) -> ApiResult<Response> {
    let application = orchestrator
        .add_application_service(&credential, &id, &request.service_type, &request.config)
        .await?;
    Ok((StatusCode::CREATED, Json(application)).into_response())
}

async fn get_application_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, service_type)): Path<(String, String)>,
) -> ApiResult<Response> {
    let service = orchestrator
        .get_application_service(&credential, &id, &service_type)
        .await?;
    Ok(Json(service).into_response())
}

async fn configure_application_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, service_type)): Path<(String, String)>,
    Json(config): Json<Value>,
) -> ApiResult<Response> {
    let service = orchestrator
        .configure_application_service(&credential, &id, &service_type, &config)
        .await?;
    Ok(Json(service).into_response())
}

async fn remove_application_service(
    State(orchestrator): AppState,
    CallerCredential(credential): CallerCredential,
    Path((id, service_type)): Path<(String, String)>,
) -> ApiResult<Response> {
    let application = orchestrator
        .remove_application_service(&credential, &id, &service_type)
        .await?;
    Ok(Json(application).into_response())
}

// =============================================================================
// Health
// =============================================================================

async fn health_check(State(orchestrator): AppState) -> impl IntoResponse {
    match orchestrator.health_check().await {
        Ok(true) => (StatusCode::OK, "ok"),
        Ok(false) => (StatusCode::SERVICE_UNAVAILABLE, "store unavailable"),
        Err(e) => {
            error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::orchestrator::tests::harness;
    use crate::domain::model::{Application, Instance};
    use axum::body::to_bytes;
    use axum::http::{Method, Request};
    use serde_json::json;
    use tower::ServiceExt;

    fn request(method: Method, uri: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, key);
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(router: &Router, key: &str) -> Instance {
        let response = router
            .clone()
            .oneshot(request(
                Method::POST,
                "/v1/instances",
                Some(key),
                Some(json!({"region": "ewr1", "plan": "baremetal_0"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        read_json(response).await
    }

    #[test]
    fn test_status_mapping() {
        let cases = vec![
            (Error::not_found("instance", "x"), StatusCode::NOT_FOUND),
            (Error::already_exists("service", "web"), StatusCode::CONFLICT),
            (Error::InvalidArgument("bad".into()), StatusCode::BAD_REQUEST),
            (
                Error::FailedPrecondition("provisioning".into()),
                StatusCode::PRECONDITION_FAILED,
            ),
            (Error::InvalidCredential, StatusCode::FORBIDDEN),
            (
                Error::StoreUnavailable("down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_missing_credential_rejected() {
        let h = harness();
        let router = RestRouter::new(h.orchestrator).build();
        let response = router
            .oneshot(request(Method::GET, "/v1/instances/abc", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_provider_header() {
        let h = harness();
        let router = RestRouter::new(h.orchestrator).build();
        let mut req = request(Method::GET, "/v1/instances/abc", Some("key-a"), None);
        req.headers_mut()
            .insert(PROVIDER_HEADER, HeaderValue::from_static("DIGITALOCEAN"));
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_service_round_trip_over_http() {
        let h = harness();
        let router = RestRouter::new(h.orchestrator).build();
        let instance = create(&router, "key-a").await;
        let services = format!("/v1/instances/{}/services", instance.id);

        let add = || {
            request(
                Method::POST,
                &services,
                Some("key-a"),
                Some(json!({"type": "web", "config": {"port": 80}})),
            )
        };
        let response = router.clone().oneshot(add()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router.clone().oneshot(add()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = router
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("{}/web", services),
                Some("key-a"),
                Some(json!({"port": 8080})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let service: Value = read_json(response).await;
        assert_eq!(service, json!({"type": "web", "config": {"port": 8080}}));

        let response = router
            .clone()
            .oneshot(request(
                Method::DELETE,
                &format!("{}/web", services),
                Some("key-a"),
                None,
            ))
            .await
            .unwrap();
        let instance: Instance = read_json(response).await;
        assert!(instance.services.is_empty());

        let response = router
            .oneshot(request(
                Method::GET,
                &format!("{}/web", services),
                Some("key-a"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_other_account_is_forbidden() {
        let h = harness();
        let router = RestRouter::new(h.orchestrator).build();
        let instance = create(&router, "key-a").await;

        let response = router
            .oneshot(request(
                Method::GET,
                &format!("/v1/instances/{}", instance.id),
                Some("key-b"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: ApiErrorResponse = read_json(response).await;
        assert_eq!(body.message, "permission denied");
    }

    #[tokio::test]
    async fn test_list_streams_ndjson() {
        let h = harness();
        let router = RestRouter::new(h.orchestrator).build();

        let response = router
            .clone()
            .oneshot(request(Method::GET, "/v1/instances", Some("key-a"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());

        let a = create(&router, "key-a").await;
        let b = create(&router, "key-a").await;

        let response = router
            .oneshot(request(Method::GET, "/v1/instances", Some("key-a"), None))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut ids: Vec<String> = String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<Instance>(line).unwrap().id)
            .collect();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_application_endpoints() {
        let h = harness();
        let router = RestRouter::new(h.orchestrator).build();
        let instance = create(&router, "key-a").await;

        let response = router
            .clone()
            .oneshot(request(
                Method::POST,
                "/v1/applications",
                Some("key-a"),
                Some(json!({"type": "kubernetes"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let app: Application = read_json(response).await;

        let member = format!("/v1/applications/{}/instances/{}", app.id, instance.id);
        let response = router
            .clone()
            .oneshot(request(Method::PUT, &member, Some("key-a"), None))
            .await
            .unwrap();
        let app: Application = read_json(response).await;
        assert!(app.instances.contains(&instance.id));

        let response = router
            .clone()
            .oneshot(request(
                Method::DELETE,
                &format!("/v1/applications/{}", app.id),
                Some("key-a"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let router = RestRouter::new(h.orchestrator.clone()).build();
        let response = router
            .clone()
            .oneshot(request(Method::GET, "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        h.kv.set_unavailable(true);
        let response = router
            .oneshot(request(Method::GET, "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
