//! Transport adapter over the server's HTTP API and event stream.
//!
//! Wraps request/response calls and the server-pushed SSE stream behind a
//! cancellation token and per-call timeouts. Explicit cancellation is
//! reported as `SyncErrorKind::Cancelled` and never treated as a network
//! failure.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

use tether_types::event::HealthResponse;
use tether_types::ServerEvent;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncErrorKind, SyncResult};

/// Server-pushed events as an owned async sequence.
pub type EventStream = BoxStream<'static, SyncResult<ServerEvent>>;

/// HTTP + event-stream client for one server endpoint.
pub struct ServerClient {
    http: reqwest::Client,
    base: Url,
    cancel: CancellationToken,
}

impl ServerClient {
    /// Builds a client for the configured endpoint.
    ///
    /// Loopback endpoints get a proxy-free client; routing local calls
    /// through a system proxy breaks some environments.
    ///
    /// # Errors
    /// Returns an error if the endpoint URL is invalid or the HTTP client
    /// cannot be constructed.
    pub fn new(config: &SyncConfig, cancel: CancellationToken) -> SyncResult<Self> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| SyncError::transport(format!("invalid endpoint {}: {e}", config.endpoint)))?;

        let mut builder = reqwest::Client::builder();
        if is_loopback(&base) {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| SyncError::transport(format!("failed to build http client: {e}")))?;

        Ok(Self { http, base, cancel })
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fetches `path` and decodes the JSON body, within `timeout`.
    /// Scope-tagged requests carry the directory as a query parameter.
    ///
    /// # Errors
    /// `Cancelled` on token cancellation, `Timeout`/`Transport` on network
    /// failure, `HttpStatus` on a non-success response, `Parse` on a bad
    /// body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        directory: Option<&str>,
        timeout: Duration,
    ) -> SyncResult<T> {
        let mut url = self.join(path)?;
        if let Some(dir) = directory {
            url.query_pairs_mut().append_pair("directory", dir);
        }

        let request = async {
            let response = self
                .http
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| request_error(path, &e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::http_status(status.as_u16(), &body));
            }

            let body = response
                .text()
                .await
                .map_err(|e| request_error(path, &e))?;
            serde_json::from_str::<T>(&body).map_err(|e| {
                SyncError::new(SyncErrorKind::Parse, format!("failed to decode {path}: {e}"))
                    .with_details(body)
            })
        };

        tokio::select! {
            () = self.cancel.cancelled() => Err(SyncError::cancelled(path)),
            result = request => result,
        }
    }

    /// Probes the liveness endpoint. A reachable server that reports
    /// `healthy: false` is `Ok(false)`, not an error.
    ///
    /// # Errors
    /// Same taxonomy as [`ServerClient::get_json`].
    pub async fn health(&self, timeout: Duration) -> SyncResult<bool> {
        let response: HealthResponse = self.get_json("/global/health", None, timeout).await?;
        Ok(response.healthy)
    }

    /// Connects the server event stream.
    ///
    /// The returned stream ends when the server closes it; consumers are
    /// expected to select against the cancellation token themselves so a
    /// shutdown mid-read stays silent.
    ///
    /// # Errors
    /// `Cancelled` if the token fires while connecting, otherwise an error
    /// if the stream connection cannot be established.
    pub async fn events(&self) -> SyncResult<EventStream> {
        let url = self.join("/global/event")?;
        let connect = async {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| request_error("/global/event", &e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::http_status(status.as_u16(), &body));
            }
            Ok(response)
        };
        let response = tokio::select! {
            () = self.cancel.cancelled() => return Err(SyncError::cancelled("/global/event")),
            result = connect => result?,
        };

        let stream = response.bytes_stream().eventsource().map(|item| match item {
            Ok(event) => ServerEvent::parse(&event.data).map_err(|e| {
                SyncError::new(
                    SyncErrorKind::Parse,
                    format!("failed to decode event: {e}"),
                )
                .with_details(event.data)
            }),
            Err(e) => Err(SyncError::transport(format!("event stream error: {e}"))),
        });
        Ok(stream.boxed())
    }

    fn join(&self, path: &str) -> SyncResult<Url> {
        self.base
            .join(path)
            .map_err(|e| SyncError::transport(format!("invalid path {path}: {e}")))
    }
}

fn request_error(path: &str, err: &reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::timeout(format!("{path} timed out"))
    } else {
        SyncError::transport(format!("{path} failed: {err}"))
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}
