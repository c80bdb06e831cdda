//! Shared fixtures: an ephemeral-port broker server and a scripted
//! frame-processor application.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::sync::Mutex;

use fpcp::{
    Broker, BrokerConfig, ClientConfig, FpcpError, FrameClient, Image, Person, Req, ReqListener,
    Resp, Scene, SceneListener,
};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A broker served on an ephemeral port, mounted under `/fpcp`.
pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub base_url: String,
}

pub async fn spawn_broker(config: BrokerConfig) -> TestBroker {
    init_tracing();

    let broker = Broker::new(config);
    let app = Router::new().nest("/fpcp", broker.router());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind ephemeral port");
    let addr = listener.local_addr().expect("should have local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });

    TestBroker {
        broker,
        base_url: format!("http://{addr}/fpcp"),
    }
}

/// Collects scene deliveries on the SP side.
#[derive(Default)]
pub struct RecordingScenes {
    pub scenes: Mutex<Vec<(String, Scene)>>,
}

#[async_trait]
impl SceneListener for RecordingScenes {
    async fn on_scene(&self, fp_id: &str, scene: Scene) {
        self.scenes.lock().await.push((fp_id.to_string(), scene));
    }
}

impl RecordingScenes {
    /// Waits until `count` scenes have arrived, or panics after 5s.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, Scene)> {
        for _ in 0..250 {
            {
                let scenes = self.scenes.lock().await;
                if scenes.len() >= count {
                    return scenes.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} scenes, got {}", self.scenes.lock().await.len());
    }
}

/// A scripted FP application: serves canned images, persons, and a
/// scene; records every request it receives. While muted it records but
/// never replies.
pub struct FrameApp {
    images: HashMap<String, Image>,
    persons: HashMap<String, Person>,
    scene: Scene,
    muted: AtomicBool,
    client: OnceLock<Arc<FrameClient>>,
    pub seen_reqs: Mutex<Vec<Req>>,
}

impl FrameApp {
    pub fn connect(
        base_url: &str,
        fp_id: &str,
        images: Vec<Image>,
        persons: Vec<Person>,
        scene: Scene,
    ) -> (Arc<FrameApp>, Arc<FrameClient>) {
        let app = Arc::new(FrameApp {
            images: images.into_iter().map(|i| (i.id.clone(), i)).collect(),
            persons: persons.into_iter().map(|p| (p.id.clone(), p)).collect(),
            scene,
            muted: AtomicBool::new(false),
            client: OnceLock::new(),
            seen_reqs: Mutex::new(Vec::new()),
        });

        let mut config = ClientConfig::new(fp_id, base_url);
        config.poll_timeout_secs = 1;
        config.http_timeout = Duration::from_secs(5);

        let client = FrameClient::new(config, app.clone()).expect("should build client");
        app.client
            .set(client.clone())
            .unwrap_or_else(|_| panic!("client already set"));
        (app, client)
    }

    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    /// Waits until `count` requests have been seen, or panics after 5s.
    pub async fn wait_for_reqs(&self, count: usize) -> Vec<Req> {
        for _ in 0..250 {
            {
                let reqs = self.seen_reqs.lock().await;
                if reqs.len() >= count {
                    return reqs.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {count} requests, got {}",
            self.seen_reqs.lock().await.len()
        );
    }

    fn answer(&self, req: &Req) -> Resp {
        if req.scene {
            return Resp::scene_push(req.req_id.clone(), self.scene.clone());
        }
        if !req.img_id.is_empty() {
            return match self.images.get(&req.img_id) {
                Some(image) => Resp::reply_image(req.req_id.clone(), image.clone()),
                None => Resp::error_reply(req.req_id.clone(), FpcpError::NotFound),
            };
        }
        match self.persons.get(&req.person_id) {
            Some(person) => Resp::reply_person(req.req_id.clone(), person.clone()),
            None => Resp::error_reply(req.req_id.clone(), FpcpError::NotFound),
        }
    }
}

#[async_trait]
impl ReqListener for FrameApp {
    async fn on_req(&self, req: Req) {
        self.seen_reqs.lock().await.push(req.clone());
        if self.muted.load(Ordering::SeqCst) {
            return;
        }

        let resp = self.answer(&req);
        let client = self.client.get().expect("client should be connected");
        if let Err(err) = client.send_resp(&resp).await {
            panic!("send_resp failed: {err}");
        }
    }
}
