//! HTTP API for the control plane.
//!
//! POST is an UPSERT on the desired-state store plus an immediate attach
//! attempt; DELETE removes the desired entry and detaches. The API maps the
//! core's typed errors onto status codes: 202 pending, 400 bad input,
//! 404 missing, 503 transient.

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Error;
use crate::metrics;
use crate::pool::PoolManager;
use crate::spec::VmSpec;

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Request to declare a job and attach a VM to it.
#[derive(Debug, Deserialize)]
struct CreateVmRequest {
    job_id: Option<String>,
    vm_id: Option<String>,
    tenant: Option<String>,
    spec: VmSpec,
}

impl CreateVmRequest {
    /// Id precedence: job_id, then vm_id, then tenant; a fresh one is
    /// generated when all are absent.
    fn resolve_job_id(&self) -> String {
        self.job_id
            .clone()
            .or_else(|| self.vm_id.clone())
            .or_else(|| self.tenant.clone())
            .unwrap_or_else(|| format!("job-{}", &uuid::Uuid::new_v4().to_string()[..8]))
    }
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    job_id: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .expect("static response parts are valid")
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response<BoxBody> {
    json_response(status, &ErrorResponse { error: msg.into() })
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "failed to read body"))?
        .to_bytes();

    serde_json::from_slice(&body_bytes)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))
}

async fn handle_request(
    req: Request<Incoming>,
    pool: PoolManager,
) -> Result<Response<BoxBody>, hyper::Error> {
    metrics::global().http_requests.fetch_add(1, Ordering::Relaxed);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["healthz"]) => json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})),
        (Method::POST, ["vms"]) => handle_create_vm(req, pool).await,
        (Method::GET, ["vms", id]) => handle_get_vm(id, pool).await,
        (Method::DELETE, ["vms", id]) => handle_delete_vm(id, pool).await,
        (Method::GET, ["stats"]) => json_response(StatusCode::OK, &pool.stats().await),
        (Method::GET, ["metrics"]) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(full(metrics::global().render()))
            .expect("static response parts are valid"),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn handle_create_vm(req: Request<Incoming>, pool: PoolManager) -> Response<BoxBody> {
    let body: CreateVmRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    if let Err(e) = body.spec.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }
    let job_id = body.resolve_job_id();
    if job_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "job_id must not be empty");
    }
    let tenant = body
        .tenant
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| job_id.clone());

    if let Err(e) = pool.store().put(&job_id, &tenant, &body.spec).await {
        error!(job_id = %job_id, error = %e, "desired-state write failed");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
    }

    match pool.attach(&job_id, &body.spec).await {
        Ok(info) => json_response(StatusCode::CREATED, &info),
        Err(Error::NoWarmVmAvailable(_)) => json_response(
            StatusCode::ACCEPTED,
            &AcceptedResponse {
                job_id,
                status: "accepted",
            },
        ),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn handle_get_vm(job_id: &str, pool: PoolManager) -> Response<BoxBody> {
    match pool.lookup(job_id).await {
        Some(info) => json_response(StatusCode::OK, &info),
        None => error_response(StatusCode::NOT_FOUND, format!("no vm for job {}", job_id)),
    }
}

async fn handle_delete_vm(job_id: &str, pool: PoolManager) -> Response<BoxBody> {
    if let Err(e) = pool.store().delete(job_id).await {
        error!(job_id = %job_id, error = %e, "desired-state delete failed");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
    }
    pool.detach(job_id).await;

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(full(""))
        .expect("static response parts are valid")
}

/// Run the API server until the process exits.
pub async fn run_server(addr: SocketAddr, pool: PoolManager) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "control-plane api listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let pool = pool.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, pool.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = ?err, "error serving connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_precedence() {
        let body: CreateVmRequest = serde_json::from_str(
            r#"{"job_id": "a", "vm_id": "b", "tenant": "c",
                "spec": {"kernel": "/k", "rootfs": "/r"}}"#,
        )
        .unwrap();
        assert_eq!(body.resolve_job_id(), "a");

        let body: CreateVmRequest = serde_json::from_str(
            r#"{"vm_id": "b", "tenant": "c", "spec": {"kernel": "/k", "rootfs": "/r"}}"#,
        )
        .unwrap();
        assert_eq!(body.resolve_job_id(), "b");

        let body: CreateVmRequest = serde_json::from_str(
            r#"{"tenant": "c", "spec": {"kernel": "/k", "rootfs": "/r"}}"#,
        )
        .unwrap();
        assert_eq!(body.resolve_job_id(), "c");
    }

    #[test]
    fn test_job_id_generated_when_absent() {
        let body: CreateVmRequest =
            serde_json::from_str(r#"{"spec": {"kernel": "/k", "rootfs": "/r"}}"#).unwrap();
        let id = body.resolve_job_id();
        assert!(id.starts_with("job-"));
        assert_eq!(id.len(), "job-".len() + 8);
    }

    #[test]
    fn test_request_requires_spec() {
        let parsed: Result<CreateVmRequest, _> = serde_json::from_str(r#"{"job_id": "a"}"#);
        assert!(parsed.is_err());
    }
}
