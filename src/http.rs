//! HTTP surface (component F, §4.6).
//!
//! Grounded on the source `HTTPServer`'s `wrap()` response-encoding pattern
//! and the per-resource handler split across `tasks_endpoint.go` /
//! `instance_endpoint.go`. Built on `hyper` 0.14 directly (as the rest of
//! this codebase's HTTP surfaces are), not a higher-level framework.
//!
//! Route table (method, path) -> action, exactly as in §4.6:
//!   GET    /v1/tasks                -> list definitions
//!   POST/PUT /v1/tasks              -> define (tag 0)
//!   POST   /v1/task/{name}/run      -> run (tag 1)
//!   GET    /v1/task/{name}/ps       -> list instances for task
//!   POST   /v1/instance/{id}/event  -> apply event (tag 2)
//!   GET    /v1/status/leader        -> leader info
//!   GET    /health                  -> liveness

use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::errors::OpenStateError;
use crate::raft::OpenStateRequest;
use crate::server::OpenStateServer;
use crate::store::Definition;

// ── Request/response bodies (§6) ───────────────────────────────────────────

#[derive(Deserialize)]
struct TaskDefineRequest {
    definition: Definition,
}

#[derive(Serialize)]
struct TaskDefineResponse {
    definition: Arc<Definition>,
}

#[derive(Serialize)]
struct TaskListResponse {
    definitions: Vec<Arc<Definition>>,
}

#[derive(Serialize)]
struct TaskRunResponse {
    instance: Arc<crate::store::Instance>,
}

#[derive(Serialize)]
struct TaskPsResponse {
    instances: Vec<Arc<crate::store::Instance>>,
}

#[derive(Deserialize)]
struct InstanceEventRequest {
    event_name: String,
}

#[derive(Serialize)]
struct InstanceEventResponse {
    instance: Arc<crate::store::Instance>,
}

#[derive(Serialize)]
struct StatusLeaderResponse {
    is_leader: bool,
    leader_http_addr: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    state: String,
    node_id: String,
    peers: usize,
}

// ── Dispatch ────────────────────────────────────────────────────────────────

async fn route(req: Request<Body>, server: Arc<OpenStateServer>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();

    let result = dispatch(req, &server).await;

    debug!(%method, %path, elapsed_ms = start.elapsed().as_millis() as u64, "request complete");

    match result {
        Ok(response) => response,
        Err(RouteOutcome::Error(e)) => {
            error!(%method, %path, error = %e, code = e.status_code(), "request failed");
            json_error(e)
        }
        Err(RouteOutcome::Redirect(location)) => Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header("Location", location)
            .body(Body::empty())
            .unwrap(),
        Err(RouteOutcome::NotFound) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .unwrap(),
    }
}

enum RouteOutcome {
    Error(OpenStateError),
    Redirect(String),
    NotFound,
}

impl From<OpenStateError> for RouteOutcome {
    fn from(e: OpenStateError) -> Self {
        RouteOutcome::Error(e)
    }
}

/// If this node is not the leader, returns the 308 redirect outcome instead
/// of running the write — step 1 of §4.6's write pipeline.
fn forward_if_not_leader(server: &OpenStateServer) -> std::result::Result<(), RouteOutcome> {
    if server.raft.is_leader() {
        return Ok(());
    }
    match server.leader_http_addr() {
        Some(addr) => Err(RouteOutcome::Redirect(format!("http://{addr}"))),
        None => Err(RouteOutcome::Error(OpenStateError::Membership(
            "no known leader".into(),
        ))),
    }
}

async fn dispatch(
    req: Request<Body>,
    server: &Arc<OpenStateServer>,
) -> std::result::Result<Response<Body>, RouteOutcome> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["v1", "tasks"]) => tasks_list(server),
        (&Method::POST, ["v1", "tasks"]) | (&Method::PUT, ["v1", "tasks"]) => {
            tasks_define(req, server).await
        }
        (&Method::POST, ["v1", "task", name, "run"]) => task_run(server, name).await,
        (&Method::GET, ["v1", "task", name, "ps"]) => task_ps(server, name),
        (&Method::POST, ["v1", "instance", id, "event"]) => {
            instance_event(req, server, id).await
        }
        (&Method::GET, ["v1", "status", "leader"]) => status_leader(server),
        (&Method::GET, ["health"]) => health(server),
        _ => Err(RouteOutcome::NotFound),
    }
}

fn json_response<T: Serialize>(body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(bytes))
        .unwrap()
}

fn json_error(e: OpenStateError) -> Response<Body> {
    let code = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(code)
        .header("Content-Type", "application/json")
        .body(Body::from(format!("{{\"error\":\"{}\"}}", e)))
        .unwrap()
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Body>,
) -> std::result::Result<T, RouteOutcome> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| RouteOutcome::Error(OpenStateError::Decode(e.to_string())))?;
    serde_json::from_slice(&bytes).map_err(|e| RouteOutcome::Error(OpenStateError::Decode(e.to_string())))
}

// ── Handlers ──────────────────────────────────────────────────────────────

fn tasks_list(server: &Arc<OpenStateServer>) -> std::result::Result<Response<Body>, RouteOutcome> {
    let definitions = server.store.get_definitions();
    Ok(json_response(&TaskListResponse { definitions }))
}

async fn tasks_define(
    req: Request<Body>,
    server: &Arc<OpenStateServer>,
) -> std::result::Result<Response<Body>, RouteOutcome> {
    forward_if_not_leader(server)?;
    let body: TaskDefineRequest = read_json_body(req).await?;

    server
        .raft
        .propose(OpenStateRequest::TaskDefine {
            name: body.definition.name.clone(),
            attributes: body.definition.attributes.clone(),
            initial: body.definition.machine.initial.clone(),
            events: body.definition.machine.events.clone(),
        })
        .await
        .map_err(RouteOutcome::Error)?;

    let definition = server
        .store
        .get_definition_by_name(&body.definition.name)
        .ok_or_else(|| RouteOutcome::Error(OpenStateError::DefinitionNotFound(body.definition.name.clone())))?;

    Ok(json_response(&TaskDefineResponse { definition }))
}

async fn task_run(
    server: &Arc<OpenStateServer>,
    name: &str,
) -> std::result::Result<Response<Body>, RouteOutcome> {
    forward_if_not_leader(server)?;

    server
        .store
        .get_definition_by_name(name)
        .ok_or_else(|| RouteOutcome::Error(OpenStateError::DefinitionNotFound(name.to_string())))?;

    let instance_id = format!("{name}-{}", Uuid::new_v4());

    server
        .raft
        .propose(OpenStateRequest::TaskRun {
            definition_name: name.to_string(),
            instance_id: instance_id.clone(),
        })
        .await
        .map_err(RouteOutcome::Error)?;

    let instance = server
        .store
        .get_instance_by_id(&instance_id)
        .ok_or_else(|| RouteOutcome::Error(OpenStateError::InstanceNotFound(instance_id.clone())))?;

    Ok(json_response(&TaskRunResponse { instance }))
}

fn task_ps(
    server: &Arc<OpenStateServer>,
    name: &str,
) -> std::result::Result<Response<Body>, RouteOutcome> {
    let instances = server.store.get_instances_for_task(name);
    Ok(json_response(&TaskPsResponse { instances }))
}

async fn instance_event(
    req: Request<Body>,
    server: &Arc<OpenStateServer>,
    id: &str,
) -> std::result::Result<Response<Body>, RouteOutcome> {
    forward_if_not_leader(server)?;
    let body: InstanceEventRequest = read_json_body(req).await?;

    server
        .raft
        .propose(OpenStateRequest::InstanceEvent {
            instance_id: id.to_string(),
            event_name: body.event_name,
        })
        .await
        .map_err(RouteOutcome::Error)?;

    let instance = server
        .store
        .get_instance_by_id(id)
        .ok_or_else(|| RouteOutcome::Error(OpenStateError::InstanceNotFound(id.to_string())))?;

    Ok(json_response(&InstanceEventResponse { instance }))
}

fn status_leader(
    server: &Arc<OpenStateServer>,
) -> std::result::Result<Response<Body>, RouteOutcome> {
    Ok(json_response(&StatusLeaderResponse {
        is_leader: server.raft.is_leader(),
        leader_http_addr: server.leader_http_addr(),
    }))
}

fn health(server: &Arc<OpenStateServer>) -> std::result::Result<Response<Body>, RouteOutcome> {
    Ok(json_response(&HealthResponse {
        state: server.cluster.state().as_str().to_string(),
        node_id: server.cluster.config().node_id.clone(),
        peers: server.cluster.peer_count(),
    }))
}

/// Binds and serves the HTTP surface on `bind_addr` until the process is
/// signalled to shut down.
pub fn start_http_server(
    server: Arc<OpenStateServer>,
    bind_addr: std::net::SocketAddr,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_conn| {
            let server = server.clone();
            async move { Ok::<_, hyper::Error>(service_fn(move |req| {
                let server = server.clone();
                async move { Ok::<_, hyper::Error>(route(req, server).await) }
            })) }
        });

        info!(%bind_addr, "HTTP surface listening");
        if let Err(e) = Server::bind(&bind_addr).serve(make_svc).await {
            error!(error = %e, "HTTP server exited");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_maps_status_code() {
        let resp = json_error(OpenStateError::DefinitionNotFound("traffic".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn json_response_sets_content_type() {
        let resp = json_response(&TaskListResponse { definitions: vec![] });
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
