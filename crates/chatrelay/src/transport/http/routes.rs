//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::Serialize;

use crate::chat::{ChatCompletionRequest, ChatResponse, ChunkStream};
use crate::connection::{ClientLink, DisconnectGuard};
use crate::error::RelayError;
use crate::service::{ChatService, HealthSnapshot};

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

fn generate_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..7].to_string()
}

/// The client's own `x-request-id`, kept only as a log correlation id.
/// Queue ids are always generated here so one client cannot reuse another's.
fn client_request_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
}

fn with_request_id(mut response: Response, req_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(req_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn error_response(req_id: &str, error: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "detail": format!("[{}] {}", req_id, error) });
    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = error.retry_after_secs() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    with_request_id(response, req_id)
}

async fn health_check(State(service): State<Arc<ChatService>>) -> impl IntoResponse {
    let snapshot = service.health().await;
    let status = if snapshot.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let reasons = snapshot.reasons();
    (status, Json(HealthCheckResponse { snapshot, reasons }))
}

async fn list_models(State(service): State<Arc<ChatService>>) -> impl IntoResponse {
    Json(service.models())
}

async fn chat_completions(
    State(service): State<Arc<ChatService>>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let req_id = generate_request_id();
    let client_id = client_request_id(&headers);
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::warn!(req_id = %req_id, client_request_id = ?client_id, error = %rejection.body_text(), "Rejecting malformed chat request");
            return error_response(&req_id, &RelayError::bad_request(rejection.body_text()));
        }
    };
    tracing::info!(
        req_id = %req_id,
        client_request_id = ?client_id,
        stream = request.stream,
        model = ?request.model,
        messages = request.messages.len(),
        "Chat completion request received"
    );

    // If the client goes away, axum drops this future and the guard marks
    // the link disconnected for the queue and the worker.
    let link = ClientLink::new();
    let mut guard = link.guard();

    match service.submit(req_id.clone(), request, link.checker()).await {
        Ok(ChatResponse::Completion(body)) => {
            guard.disarm();
            with_request_id((StatusCode::OK, Json(body)).into_response(), &req_id)
        }
        Ok(ChatResponse::Stream(stream)) => sse_response(stream, guard, &req_id),
        Err(e) => {
            guard.disarm();
            if e.is_client_gone() {
                tracing::info!(req_id = %req_id, error = %e, "Chat request ended by client");
            } else {
                tracing::warn!(req_id = %req_id, error = %e, status = e.status_code(), "Chat request failed");
            }
            error_response(&req_id, &e)
        }
    }
}

/// Forward chunks as SSE `data:` events, ending with `[DONE]`.
///
/// The guard travels with the body: dropping the body before `[DONE]` means
/// the client disconnected mid-stream.
fn sse_response(stream: ChunkStream, guard: DisconnectGuard, req_id: &str) -> Response {
    let events = futures::stream::unfold(Some((stream, guard)), |state| async move {
        let (mut stream, mut guard) = state?;
        match stream.next_chunk().await {
            Some(chunk) => Some((
                Ok::<_, Infallible>(Event::default().data(chunk.to_string())),
                Some((stream, guard)),
            )),
            None => {
                guard.disarm();
                Some((Ok(Event::default().data("[DONE]")), None))
            }
        }
    });
    let response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    with_request_id(response, req_id)
}

async fn cancel_request(
    State(service): State<Arc<ChatService>>,
    Path(req_id): Path<String>,
) -> impl IntoResponse {
    tracing::info!(req_id = %req_id, "Cancel requested");
    if service.cancel(&req_id) {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "message": format!("Request {} marked as cancelled.", req_id)
            })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "message": format!("Request {} not found in queue (it may be processing or already finished).", req_id)
            })),
        )
    }
}

async fn queue_status(State(service): State<Arc<ChatService>>) -> impl IntoResponse {
    Json(service.queue_status())
}

async fn shutdown(State(service): State<Arc<ChatService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<ChatService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat", post(chat_completions))
        .route("/v1/cancel/{req_id}", post(cancel_request))
        .route("/cancel/{req_id}", post(cancel_request))
        .route("/v1/queue", get(queue_status))
        .route("/queue/status", get(queue_status))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::CoordinatorConfig;
    use crate::coordinator::Coordinator;
    use crate::health::Health;
    use crate::model::ModelCatalog;
    use crate::slot::ResultSlot;
    use crate::test_support::{Behavior, MockBackend, collaborators};

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_service() -> (Arc<ChatService>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            collaborators(Arc::clone(&backend)),
            Arc::new(ModelCatalog::default()),
            None,
        ));
        (Arc::new(ChatService::new(coordinator)), backend)
    }

    async fn create_ready_service() -> (Arc<ChatService>, Arc<MockBackend>) {
        let (service, backend) = create_service();
        service.coordinator().spawn_workers();
        service.set_health(Health::Ready).await;
        (service, backend)
    }

    fn assigned_id(response: &Response) -> String {
        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        assert_eq!(id.len(), 7);
        assert_ne!(id, "abc1234");
        id
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .header(REQUEST_ID_HEADER, "abc1234")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_503_with_reasons_when_not_ready() {
        let (service, _backend) = create_service();
        let response = routes(service)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = response_json(response).await;
        assert_eq!(json["status"], "UNKNOWN");
        assert_eq!(json["workers_running"], 0);
        assert!(json["version"]["chatrelay"].is_string());
        assert!(json["reasons"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn health_returns_ok_when_ready() {
        let (service, _backend) = create_ready_service().await;
        let response = routes(service)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert_eq!(json["workers_running"], 1);
        assert!(json.get("reasons").is_none());
    }

    #[tokio::test]
    async fn chat_returns_503_with_retry_after_when_not_ready() {
        let (service, _backend) = create_service();
        let response = routes(service)
            .oneshot(chat_request(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
        let id = assigned_id(&response);
        let json = response_json(response).await;
        assert!(
            json["detail"]
                .as_str()
                .unwrap()
                .starts_with(&format!("[{id}] Service is currently unavailable"))
        );
    }

    #[tokio::test]
    async fn chat_non_stream_returns_backend_body() {
        let (service, _backend) = create_ready_service().await;
        let response = routes(service)
            .oneshot(chat_request(r#"{"messages":[{"role":"user","content":"hello"}]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assigned_id(&response);
        let json = response_json(response).await;
        assert_eq!(json["echo"], "hello");
    }

    #[tokio::test]
    async fn chat_malformed_body_is_bad_request() {
        let (service, _backend) = create_ready_service().await;
        let response = routes(service)
            .oneshot(chat_request(r#"{"messages": "nope"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let id = assigned_id(&response);
        let json = response_json(response).await;
        assert!(
            json["detail"]
                .as_str()
                .unwrap()
                .starts_with(&format!("[{id}] Invalid request"))
        );
    }

    #[tokio::test]
    async fn chat_validation_error_surfaces_as_400() {
        let (service, _backend) = create_ready_service().await;
        let response = routes(service)
            .oneshot(chat_request(r#"{"messages":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_stream_emits_sse_and_done() {
        let (service, backend) = create_ready_service().await;
        backend.script_default(Behavior::Stream {
            chunks: 2,
            interval: Duration::from_millis(5),
        });
        let response = routes(service)
            .oneshot(chat_request(
                r#"{"stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let data: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        assert_eq!(data, vec![r#"{"index":0}"#, r#"{"index":1}"#, "[DONE]"]);
    }

    #[tokio::test]
    async fn repeated_client_request_id_gets_distinct_queue_ids() {
        let (service, backend) = create_ready_service().await;
        backend.script_default(Behavior::Hang);
        let app = routes(Arc::clone(&service));

        let first = tokio::spawn(app.clone().oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"one"}]}"#,
        )));
        let second = tokio::spawn(app.oneshot(chat_request(
            r#"{"messages":[{"role":"user","content":"two"}]}"#,
        )));

        let mut queued = Vec::new();
        for _ in 0..100 {
            let status = service.queue_status();
            if status.queue_length == 1 && backend.runs().len() == 1 {
                queued = status.items;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queued.len(), 1, "second request never queued");
        let running = backend.runs()[0].req_id.clone();
        let waiting = queued[0].req_id.clone();
        assert_ne!(running, waiting);
        assert_ne!(waiting, "abc1234");

        // Cancelling by the client's header value touches nothing.
        assert!(!service.cancel("abc1234"));
        assert!(service.cancel(&waiting));
        let response = second.await.unwrap().unwrap();
        assert_eq!(response.status().as_u16(), 499);
        assert_eq!(assigned_id(&response), waiting);

        service.shutdown().await;
        let response = first.await.unwrap().unwrap();
        assert_eq!(assigned_id(&response), running);
    }

    #[tokio::test]
    async fn cancel_queued_request() {
        let (service, _backend) = create_service();
        let slot = ResultSlot::new();
        service
            .coordinator()
            .enqueue(
                "queued1",
                ChatCompletionRequest::user("x"),
                ClientLink::new().checker(),
                slot.clone(),
            )
            .unwrap();
        let app = routes(Arc::clone(&service));

        let response = app
            .clone()
            .oneshot(Request::post("/v1/cancel/queued1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["success"], true);
        assert_eq!(slot.error(), Some(RelayError::ClientCancelled));

        let response = app
            .oneshot(Request::post("/cancel/queued1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn queue_status_lists_items() {
        let (service, _backend) = create_service();
        for id in ["q1", "q2"] {
            service
                .coordinator()
                .enqueue(
                    id,
                    ChatCompletionRequest::user("x").streaming(id == "q2"),
                    ClientLink::new().checker(),
                    ResultSlot::new(),
                )
                .unwrap();
        }

        let response = routes(service)
            .oneshot(Request::get("/queue/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["queue_length"], 2);
        assert_eq!(json["is_processing_locked"], false);
        let items: Vec<_> = json["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| (i["req_id"].clone(), i["is_streaming"].clone(), i["cancelled"].clone()))
            .collect();
        insta::assert_json_snapshot!(items, @r#"
        [
          [
            "q1",
            false,
            false
          ],
          [
            "q2",
            true,
            false
          ]
        ]
        "#);
    }

    #[tokio::test]
    async fn models_lists_fallback_when_catalog_empty() {
        let (service, _backend) = create_service();
        let response = routes(service)
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "no model list");
    }

    #[tokio::test]
    async fn shutdown_triggers_service_shutdown() {
        let (service, _backend) = create_service();
        let mut rx = service.shutdown_rx();
        let response = routes(Arc::clone(&service))
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }
}
