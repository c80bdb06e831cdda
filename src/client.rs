//! Frame-processor-side transport: long-poll loop and response sender.
//!
//! The client cannot accept inbound connections, so it polls the broker
//! for work (`GET base/{fp_id}?timeout=N`) and returns results through a
//! separate multipart POST. Poll-loop errors are recoverable: log, drop
//! and rebuild the HTTP client, back off one second, continue. They
//! never reach the application.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::FpcpError;
use crate::protocol::{Req, Resp};
use crate::ReqListener;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// FP-side transport provider over HTTP long-polling.
pub struct FrameClient {
    config: ClientConfig,
    http: tokio::sync::Mutex<reqwest::Client>,
    shutdown: CancellationToken,
}

enum PollOutcome {
    /// A request was delivered to the listener.
    Delivered,
    /// The long poll came back empty (204); poll again immediately.
    Idle,
    /// Transport or decode trouble; wait a beat before retrying.
    Backoff,
}

impl FrameClient {
    /// Creates the client and starts its poll loop.
    ///
    /// Every request the broker queues for `config.fp_id` is handed to
    /// `listener`; the loop runs until [`FrameClient::close`].
    ///
    /// # Errors
    ///
    /// Returns `FpcpError::Transport` if the HTTP client cannot be built.
    pub fn new(
        config: ClientConfig,
        listener: Arc<dyn ReqListener>,
    ) -> Result<Arc<Self>, FpcpError> {
        let http = build_http(config.effective_http_timeout())?;
        let client = Arc::new(Self {
            config,
            http: tokio::sync::Mutex::new(http),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(poll_loop(client.clone(), listener));
        Ok(client)
    }

    /// Stops the poll loop. An in-flight GET ends on its own timeout.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Posts one response back to the broker.
    ///
    /// Image bytes travel as a raw `image` file part; the JSON envelope
    /// in the `resp` field carries metadata only. The caller's value is
    /// never mutated.
    ///
    /// # Errors
    ///
    /// `FpcpError::Closed` after [`FrameClient::close`];
    /// `FpcpError::Transport` on network failure or a non-2xx status.
    pub async fn send_resp(&self, resp: &Resp) -> Result<(), FpcpError> {
        if self.shutdown.is_cancelled() {
            return Err(FpcpError::Closed);
        }

        let (envelope, image_bytes) = split_image_bytes(resp);
        let json = serde_json::to_string(&envelope).map_err(FpcpError::codec)?;

        let mut form = reqwest::multipart::Form::new().text("resp", json);
        if let Some(data) = image_bytes {
            debug!(bytes = data.len(), "attaching image part");
            form = form.part(
                "image",
                reqwest::multipart::Part::bytes(data).file_name("image"),
            );
        }

        let response = self
            .http()
            .await
            .post(self.endpoint())
            .multipart(form)
            .send()
            .await
            .map_err(FpcpError::transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FpcpError::Transport {
                reason: format!("broker returned HTTP {status}"),
            });
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.fp_id
        )
    }

    fn poll_url(&self) -> String {
        let endpoint = self.endpoint();
        if self.config.poll_timeout_secs > 0 {
            format!("{endpoint}?timeout={}", self.config.poll_timeout_secs)
        } else {
            endpoint
        }
    }

    async fn http(&self) -> reqwest::Client {
        self.http.lock().await.clone()
    }

    /// Drops the HTTP client and builds a fresh one, abandoning any
    /// poisoned pooled connections.
    async fn rebuild_http(&self) {
        match build_http(self.config.effective_http_timeout()) {
            Ok(client) => *self.http.lock().await = client,
            Err(err) => warn!(error = %err, "could not rebuild HTTP client, keeping old one"),
        }
    }

    async fn poll_once(&self, url: &str, listener: &Arc<dyn ReqListener>) -> PollOutcome {
        let response = match self.http().await.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "poll failed, rebuilding HTTP client");
                self.rebuild_http().await;
                return PollOutcome::Backoff;
            }
        };

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return PollOutcome::Idle;
        }
        if status != StatusCode::OK {
            warn!(status = %status, "unexpected poll status");
            return PollOutcome::Backoff;
        }

        match response.json::<Req>().await {
            Ok(req) => {
                debug!(req_id = %req.req_id, "received request");
                listener.on_req(req).await;
                PollOutcome::Delivered
            }
            Err(err) => {
                warn!(error = %err, "undecodable request body");
                PollOutcome::Backoff
            }
        }
    }
}

fn build_http(timeout: Duration) -> Result<reqwest::Client, FpcpError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .tcp_nodelay(true)
        .build()
        .map_err(FpcpError::transport)
}

/// Separates image bytes from the envelope so the JSON stays
/// metadata-only. Returns a clone; the input is left untouched.
fn split_image_bytes(resp: &Resp) -> (Resp, Option<Vec<u8>>) {
    match resp.image.as_ref() {
        Some(image) if !image.data.is_empty() => {
            let mut envelope = resp.clone();
            let data = match envelope.image.as_mut() {
                Some(image) => std::mem::take(&mut image.data),
                None => Vec::new(),
            };
            (envelope, Some(data))
        }
        _ => (resp.clone(), None),
    }
}

async fn poll_loop(client: Arc<FrameClient>, listener: Arc<dyn ReqListener>) {
    let url = client.poll_url();
    info!(fp_id = %client.config.fp_id, url = %url, "poll loop started");

    loop {
        let outcome = tokio::select! {
            biased;

            _ = client.shutdown.cancelled() => break,
            outcome = client.poll_once(&url, &listener) => outcome,
        };

        if let PollOutcome::Backoff = outcome {
            tokio::select! {
                biased;

                _ = client.shutdown.cancelled() => break,
                _ = tokio::time::sleep(ERROR_BACKOFF) => {}
            }
        }
    }

    info!(fp_id = %client.config.fp_id, "poll loop stopped");
}
