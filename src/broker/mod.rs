//! Scene-processor-side request broker.
//!
//! The broker owns one [`Mailbox`] per frame processor, created lazily on
//! first reference. Two HTTP routes make up the whole surface:
//!
//! - `GET /{fp_id}?timeout=N` drains one queued request, holding the
//!   connection open up to the timeout (200 with a JSON `Req`, or 204).
//! - `POST /{fp_id}` accepts a `multipart/form-data` body carrying a
//!   JSON `Resp` in the `resp` field and optionally raw image bytes in
//!   an `image` file part.
//!
//! A background sweeper evicts mailboxes whose owner has not polled or
//! posted for three poll windows. Eviction is safe while a poll is
//! parked: the sweeper only touches the table, so the parked waiter
//! times out normally and the next poll recreates the mailbox.

mod mailbox;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::FpcpError;
use crate::protocol::{Req, Resp};
use crate::{RespListener, SceneProcEnd};

use mailbox::Mailbox;

/// SP-side transport provider over HTTP long-polling.
pub struct Broker {
    mailboxes: DashMap<String, Arc<Mailbox>>,
    listener: RwLock<Option<Arc<dyn RespListener>>>,
    config: BrokerConfig,
    shutdown: CancellationToken,
}

impl Broker {
    /// Creates a broker and starts its sweeper.
    ///
    /// The sweeper runs until [`Broker::close`] is called.
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let broker = Arc::new(Self {
            mailboxes: DashMap::new(),
            listener: RwLock::new(None),
            config,
            shutdown: CancellationToken::new(),
        });
        Self::spawn_sweeper(&broker);
        broker
    }

    /// The axum router for the broker's two routes.
    ///
    /// The caller mounts it under an operator-chosen prefix:
    ///
    /// ```ignore
    /// let app = Router::new().nest("/fpcp", broker.router());
    /// ```
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/{fp_id}", get(poll_handler).post(resp_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .with_state(Arc::clone(self))
    }

    /// Stops the sweeper. Parked polls drain on their own deadlines.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Number of live mailboxes; test and introspection aid.
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }

    fn mailbox(&self, fp_id: &str) -> Arc<Mailbox> {
        if let Some(mailbox) = self.mailboxes.get(fp_id) {
            return mailbox.clone();
        }
        debug!(fp_id = %fp_id, "creating mailbox");
        self.mailboxes
            .entry(fp_id.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }

    fn spawn_sweeper(broker: &Arc<Self>) {
        let broker = Arc::clone(broker);
        tokio::spawn(async move {
            let window = broker.config.effective_poll_window();
            let mut ticker = tokio::time::interval(window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of an interval completes immediately.
            ticker.tick().await;

            info!("mailbox sweeper started");
            loop {
                tokio::select! {
                    biased;

                    _ = broker.shutdown.cancelled() => break,
                    _ = ticker.tick() => broker.sweep(),
                }
            }
            info!("mailbox sweeper stopped");
        });
    }

    /// Evicts mailboxes idle past three poll windows.
    fn sweep(&self) {
        let cutoff = 3 * self.config.effective_poll_window();

        // Collect first; removing while iterating would hold shard
        // guards across the mutation.
        let stale: Vec<String> = self
            .mailboxes
            .iter()
            .filter(|entry| entry.value().idle() > cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        for fp_id in stale {
            self.mailboxes.remove(&fp_id);
            info!(fp_id = %fp_id, "swept idle mailbox");
        }
    }
}

#[async_trait::async_trait]
impl SceneProcEnd for Broker {
    async fn set_resp_listener(&self, listener: Arc<dyn RespListener>) {
        *self.listener.write().await = Some(listener);
    }

    async fn send_req(&self, fp_id: &str, req: Req) -> Result<(), FpcpError> {
        debug!(fp_id = %fp_id, req_id = %req.req_id, "queueing request");
        self.mailbox(fp_id).push(req).await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PollParams {
    /// Hold time in whole seconds. Kept as a string so that an
    /// unparsable value falls back to the configured window instead of
    /// rejecting the poll.
    timeout: Option<String>,
}

impl PollParams {
    fn wait_or(&self, default: Duration) -> Duration {
        let Some(raw) = self.timeout.as_deref() else {
            return default;
        };
        match raw.parse::<i64>() {
            Ok(secs) if secs >= 0 => Duration::from_secs(secs as u64),
            _ => {
                warn!(timeout = %raw, "unparsable poll timeout, using configured window");
                default
            }
        }
    }
}

/// `GET /{fp_id}` — drain one request, long-polling up to the deadline.
async fn poll_handler(
    State(broker): State<Arc<Broker>>,
    Path(fp_id): Path<String>,
    Query(params): Query<PollParams>,
) -> Response {
    if fp_id.trim().is_empty() {
        warn!("poll with empty fpId");
        return bad_request("expecting fpId");
    }

    let wait = params.wait_or(broker.config.effective_poll_window());
    let mailbox = broker.mailbox(&fp_id);
    mailbox.touch();

    match mailbox.pop(wait).await {
        Some(req) => {
            debug!(fp_id = %fp_id, req_id = %req.req_id, "delivering request to poll");
            (StatusCode::OK, Json(req)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// `POST /{fp_id}` — accept one multipart-framed response.
async fn resp_handler(
    State(broker): State<Arc<Broker>>,
    Path(fp_id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    if fp_id.trim().is_empty() {
        warn!("response with empty fpId");
        return bad_request("expecting fpId");
    }
    broker.mailbox(&fp_id).touch();

    let mut envelope: Option<String> = None;
    let mut image_bytes: Option<bytes::Bytes> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(fp_id = %fp_id, error = %err, "unreadable multipart form");
                return bad_request("could not read form");
            }
        };

        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("resp") => {
                if envelope.is_some() {
                    warn!(fp_id = %fp_id, "duplicate resp field");
                    return bad_request("expecting exactly one resp value");
                }
                match field.text().await {
                    Ok(text) => envelope = Some(text),
                    Err(err) => {
                        warn!(fp_id = %fp_id, error = %err, "unreadable resp field");
                        return bad_request("could not read resp value");
                    }
                }
            }
            Some("image") => match field.bytes().await {
                Ok(data) => image_bytes = Some(data),
                Err(err) => {
                    warn!(fp_id = %fp_id, error = %err, "unreadable image part");
                    return bad_request("could not read image data");
                }
            },
            _ => {
                // Unknown parts are drained and ignored; a read failure
                // still poisons the whole form.
                if let Err(err) = field.bytes().await {
                    warn!(fp_id = %fp_id, error = %err, "unreadable form part");
                    return bad_request("could not read form");
                }
            }
        }
    }

    let Some(envelope) = envelope else {
        warn!(fp_id = %fp_id, "form without resp field");
        return bad_request("expecting resp JSON value");
    };

    let mut resp: Resp = match serde_json::from_str(&envelope) {
        Ok(resp) => resp,
        Err(err) => {
            warn!(fp_id = %fp_id, error = %err, "undecodable resp envelope");
            return bad_request("could not unmarshal response");
        }
    };

    if let Some(data) = image_bytes {
        match resp.image.as_mut() {
            Some(image) => image.data = data.to_vec(),
            // An image part with no image envelope has nowhere to go.
            None => debug!(fp_id = %fp_id, "image part without image envelope, dropping bytes"),
        }
    }

    let listener = broker.listener.read().await.clone();
    match listener {
        Some(listener) => listener.on_resp(&fp_id, resp).await,
        None => warn!(fp_id = %fp_id, "no response listener, nobody will be notified"),
    }

    (StatusCode::OK, Json("")).into_response()
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, Json(message)).into_response()
}
