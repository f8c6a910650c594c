//! Guest readiness polling and warm-up triggering over plain HTTP.
//!
//! Every guest image ships a tiny agent serving `GET /health` and
//! `POST /warm` on the workload port. Boot is gated on `/health` returning
//! 200; warm-up intensity depends on the lifecycle class.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::time::{Duration, Instant, sleep};
use tracing::debug;

use crate::error::{Error, FailStage, Result};
use crate::spec::Lifecycle;

/// Interval between health probes.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize)]
struct WarmRequest {
    level: &'static str,
}

/// HTTP client for one guest's agent endpoint.
pub struct GuestClient {
    base: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl GuestClient {
    pub fn new(guest_ip: &str, port: u16) -> Self {
        Self {
            base: format!("http://{}:{}", guest_ip, port),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Poll `GET /health` until it returns 200 or the deadline passes.
    ///
    /// Connection errors and 5xx responses are the normal "still booting"
    /// signals and are retried; any other status retries with the same
    /// backoff.
    pub async fn wait_healthy(&self, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        let uri = format!("{}/health", self.base);

        loop {
            match self.get(&uri).await {
                Ok(StatusCode::OK) => return Ok(()),
                Ok(status) => {
                    debug!(uri = %uri, status = %status, "health probe not ready");
                }
                Err(e) => {
                    debug!(uri = %uri, error = %e, "health probe connection failed");
                }
            }
            if started.elapsed() >= deadline {
                return Err(Error::boot(
                    FailStage::HealthCheck,
                    format!("guest {} not healthy after {:?}", self.base, deadline),
                ));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Run lifecycle-class-specific priming inside the booted guest.
    ///
    /// `service` seeds a database replica and subscribes to the change feed
    /// (the heaviest path), `daemon` does a light prime, `job` skips the
    /// round-trip entirely.
    pub async fn prime(&self, lifecycle: Lifecycle) -> Result<()> {
        let level = match lifecycle {
            Lifecycle::Service => "replica",
            Lifecycle::Daemon => "light",
            Lifecycle::Job => return Ok(()),
        };

        let uri = format!("{}/warm", self.base);
        let body = serde_json::to_vec(&WarmRequest { level })
            .map_err(|e| Error::warm_up(FailStage::Priming, e.to_string()))?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::warm_up(FailStage::Priming, e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::warm_up(FailStage::Priming, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response
                .into_body()
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            return Err(Error::warm_up(
                FailStage::Priming,
                format!("{} from {}: {}", status, uri, String::from_utf8_lossy(&bytes)),
            ));
        }
        Ok(())
    }

    async fn get(&self, uri: &str) -> std::result::Result<StatusCode, hyper_util::client::legacy::Error> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .expect("static request parts are valid");
        let response = self.client.request(req).await?;
        Ok(response.status())
    }
}
