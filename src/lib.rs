//! FPCP — Frame Processor Control Protocol bridge.
//!
//! A bidirectional request/response bridge between a central scene
//! processor (SP) and many remote frame processors (FPs) that sit behind
//! NAT and cannot accept inbound connections. The SP issues logical
//! requests (fetch an image, fetch a person record, deliver a scene
//! snapshot) and receives replies or unsolicited scene pushes; because
//! FPs can only call out, the transport inverts direction over HTTP
//! long-polling.
//!
//! # Architecture
//!
//! - [`broker::Broker`] — SP-side HTTP surface: per-FP mailboxes drained
//!   by long polls, multipart response intake, idle-mailbox sweeping.
//! - [`client::FrameClient`] — FP-side poll loop and multipart response
//!   sender.
//! - [`correlator::SceneProcessor`] — turns the asynchronous response
//!   stream back into synchronous calls with timeouts.
//! - [`protocol`] — the JSON envelope and its types.
//!
//! # Wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fpcp::{Broker, BrokerConfig, Scene, SceneListener, SceneProcessor, SceneProcessorConfig};
//!
//! struct PrintScenes;
//!
//! #[async_trait::async_trait]
//! impl SceneListener for PrintScenes {
//!     async fn on_scene(&self, fp_id: &str, scene: Scene) {
//!         println!("{fp_id}: scene at {}", scene.timestamp);
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new(BrokerConfig::default());
//! let processor = SceneProcessor::new(
//!     broker.clone(),
//!     Arc::new(PrintScenes),
//!     SceneProcessorConfig { call_timeout: Duration::from_secs(5) },
//! )
//! .await;
//!
//! let app = axum::Router::new().nest("/fpcp", broker.router());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:5555").await?;
//! tokio::spawn(async move { axum::serve(listener, app).await });
//!
//! let image = processor.get_image("fp1", "img42").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

pub mod broker;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod protocol;

pub use broker::Broker;
pub use client::FrameClient;
pub use config::{BrokerConfig, ClientConfig, SceneProcessorConfig};
pub use correlator::SceneProcessor;
pub use error::FpcpError;
pub use protocol::{Face, Image, Person, Rect, RectSize, Req, Resp, Scene, Timestamp};

/// SP-side sink, notified for every response a frame processor returns.
#[async_trait]
pub trait RespListener: Send + Sync {
    async fn on_resp(&self, fp_id: &str, resp: Resp);
}

/// FP-side handler, invoked for every request the poll loop receives.
#[async_trait]
pub trait ReqListener: Send + Sync {
    async fn on_req(&self, req: Req);
}

/// SP-side consumer of scene snapshots, both requested and unsolicited.
#[async_trait]
pub trait SceneListener: Send + Sync {
    async fn on_scene(&self, fp_id: &str, scene: Scene);
}

/// Downstream transport seam on the SP side.
///
/// [`Broker`] is the HTTP implementation; tests substitute in-process
/// fakes. The response listener is installed after construction so the
/// consumer can close over a fully built correlator.
#[async_trait]
pub trait SceneProcEnd: Send + Sync {
    /// Registers the sink for responses arriving from frame processors.
    async fn set_resp_listener(&self, listener: Arc<dyn RespListener>);

    /// Queues a request for one frame processor. Enqueueing never fails
    /// synchronously; delivery waits for the FP's next poll.
    async fn send_req(&self, fp_id: &str, req: Req) -> Result<(), FpcpError>;
}
