//! Correlated-RPC façade for the scene processor.
//!
//! [`SceneProcessor`] turns the asynchronous response stream back into
//! synchronous calls: each outbound request gets a fresh id and a
//! single-shot delivery slot in the waiter table; the matching response
//! fulfils the slot, and a missed deadline removes it so late replies
//! are discarded. Scene payloads bypass the table entirely and go to the
//! scene listener, whether requested or unsolicited.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info};

use crate::config::SceneProcessorConfig;
use crate::error::FpcpError;
use crate::protocol::{Image, Person, Req, Resp};
use crate::{RespListener, SceneListener, SceneProcEnd};

struct CorrelatorState {
    /// Monotonic request id counter, rendered base-10 on the wire.
    /// Seeded from wall-clock seconds so ids stay unique across quick
    /// process restarts.
    next_req_id: i64,
    waiters: HashMap<String, oneshot::Sender<Resp>>,
}

/// SP application façade over a [`SceneProcEnd`] transport.
pub struct SceneProcessor {
    end: Arc<dyn SceneProcEnd>,
    scenes: Arc<dyn SceneListener>,
    state: Mutex<CorrelatorState>,
    config: SceneProcessorConfig,
}

impl SceneProcessor {
    /// Builds the processor and installs it as the transport's response
    /// listener.
    ///
    /// Installation happens after construction so the callback closes
    /// over a fully built value.
    pub async fn new(
        end: Arc<dyn SceneProcEnd>,
        scenes: Arc<dyn SceneListener>,
        config: SceneProcessorConfig,
    ) -> Arc<Self> {
        let processor = Arc::new(Self {
            end: end.clone(),
            scenes,
            state: Mutex::new(CorrelatorState {
                next_req_id: chrono::Utc::now().timestamp(),
                waiters: HashMap::new(),
            }),
            config,
        });
        end.set_resp_listener(processor.clone()).await;
        processor
    }

    /// Fetches the image `img_id` from frame processor `fp_id`, blocking
    /// up to the call timeout.
    pub async fn get_image(&self, fp_id: &str, img_id: &str) -> Result<Image, FpcpError> {
        let (req_id, slot) = self.new_request().await;
        if let Err(err) = self
            .end
            .send_req(fp_id, Req::image(req_id.clone(), img_id))
            .await
        {
            self.state.lock().await.waiters.remove(&req_id);
            return Err(err);
        }
        let resp = self.wait_response(&req_id, slot).await?;
        resp.image.ok_or_else(|| FpcpError::Codec {
            details: "response without image payload".to_string(),
        })
    }

    /// Fetches the person record `person_id` from frame processor
    /// `fp_id`, blocking up to the call timeout.
    pub async fn get_person(&self, fp_id: &str, person_id: &str) -> Result<Person, FpcpError> {
        let (req_id, slot) = self.new_request().await;
        if let Err(err) = self
            .end
            .send_req(fp_id, Req::person(req_id.clone(), person_id))
            .await
        {
            self.state.lock().await.waiters.remove(&req_id);
            return Err(err);
        }
        let resp = self.wait_response(&req_id, slot).await?;
        resp.person.ok_or_else(|| FpcpError::Codec {
            details: "response without person payload".to_string(),
        })
    }

    /// Asks `fp_id` for a scene snapshot. Fire-and-forget: the scene
    /// arrives later through the scene listener.
    pub async fn request_scene(&self, fp_id: &str) -> Result<(), FpcpError> {
        let req_id = self.next_id().await;
        self.end.send_req(fp_id, Req::scene(req_id)).await
    }

    /// Fails every blocked caller with `Closed` and forgets the waiters.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let drained = state.waiters.len();
        // Dropping the senders wakes the receivers, which surface Closed.
        state.waiters.clear();
        if drained > 0 {
            info!(drained, "dropped pending waiters on close");
        }
    }

    async fn next_id(&self) -> String {
        let mut state = self.state.lock().await;
        state.next_req_id += 1;
        state.next_req_id.to_string()
    }

    /// Allocates a request id and its single-shot delivery slot.
    async fn new_request(&self) -> (String, oneshot::Receiver<Resp>) {
        let mut state = self.state.lock().await;
        state.next_req_id += 1;
        let req_id = state.next_req_id.to_string();
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(req_id.clone(), tx);
        (req_id, rx)
    }

    async fn wait_response(
        &self,
        req_id: &str,
        slot: oneshot::Receiver<Resp>,
    ) -> Result<Resp, FpcpError> {
        let resp = match tokio::time::timeout(self.config.call_timeout, slot).await {
            Ok(Ok(resp)) => resp,
            // Sender dropped without a value: the processor was closed.
            Ok(Err(_)) => return Err(FpcpError::Closed),
            Err(_) => {
                // Remove the slot so a late reply is discarded instead
                // of fulfilling a call that already failed.
                self.state.lock().await.waiters.remove(req_id);
                return Err(FpcpError::Timeout);
            }
        };

        match FpcpError::from_wire_code(resp.error) {
            Some(err) => Err(err),
            None => Ok(resp),
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_waiters(&self) -> usize {
        self.state.lock().await.waiters.len()
    }
}

#[async_trait]
impl RespListener for SceneProcessor {
    async fn on_resp(&self, fp_id: &str, resp: Resp) {
        // Scene payloads bypass the waiter table even when their id
        // collides with an outstanding call.
        if let Some(scene) = resp.scene {
            self.scenes.on_scene(fp_id, scene).await;
            return;
        }

        let waiter = self.state.lock().await.waiters.remove(&resp.req_id);
        match waiter {
            Some(slot) => {
                let req_id = resp.req_id.clone();
                if slot.send(resp).is_err() {
                    debug!(req_id = %req_id, "waiter gone before delivery");
                }
            }
            None => debug!(req_id = %resp.req_id, "dropping unmatched response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::protocol::{RectSize, Scene};

    type Responder = Box<dyn Fn(&Req) -> Option<Resp> + Send + Sync>;

    /// Transport fake: records sends and optionally answers them inline,
    /// the way the broker would after an FP round-trip.
    struct MockEnd {
        listener: Mutex<Option<Arc<dyn RespListener>>>,
        sent: Mutex<Vec<(String, Req)>>,
        responder: Responder,
    }

    impl MockEnd {
        fn new(responder: Responder) -> Arc<Self> {
            Arc::new(Self {
                listener: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                responder,
            })
        }

        fn silent() -> Arc<Self> {
            Self::new(Box::new(|_| None))
        }

        async fn sent_reqs(&self) -> Vec<(String, Req)> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl SceneProcEnd for MockEnd {
        async fn set_resp_listener(&self, listener: Arc<dyn RespListener>) {
            *self.listener.lock().await = Some(listener);
        }

        async fn send_req(&self, fp_id: &str, req: Req) -> Result<(), FpcpError> {
            self.sent.lock().await.push((fp_id.to_string(), req.clone()));
            if let Some(resp) = (self.responder)(&req) {
                let listener = self.listener.lock().await.clone();
                if let Some(listener) = listener {
                    listener.on_resp(fp_id, resp).await;
                }
            }
            Ok(())
        }
    }

    /// Records scene deliveries.
    #[derive(Default)]
    struct RecordingScenes {
        scenes: Mutex<Vec<(String, Scene)>>,
    }

    #[async_trait]
    impl SceneListener for RecordingScenes {
        async fn on_scene(&self, fp_id: &str, scene: Scene) {
            self.scenes.lock().await.push((fp_id.to_string(), scene));
        }
    }

    fn short_config() -> SceneProcessorConfig {
        SceneProcessorConfig {
            call_timeout: Duration::from_millis(200),
        }
    }

    async fn processor(
        end: Arc<MockEnd>,
    ) -> (Arc<SceneProcessor>, Arc<RecordingScenes>) {
        let scenes = Arc::new(RecordingScenes::default());
        let processor = SceneProcessor::new(end, scenes.clone(), short_config()).await;
        (processor, scenes)
    }

    #[tokio::test]
    async fn test_get_image_happy_path() {
        let end = MockEnd::new(Box::new(|req| {
            Some(Resp::reply_image(
                req.req_id.clone(),
                Image {
                    id: req.img_id.clone(),
                    size: RectSize { w: 10, h: 20 },
                    timestamp: 0,
                    data: b"HELLO".to_vec(),
                },
            ))
        }));
        let (processor, _) = processor(end.clone()).await;

        let image = processor.get_image("fp1", "img42").await.unwrap();
        assert_eq!(image.id, "img42");
        assert_eq!(image.size, RectSize { w: 10, h: 20 });
        assert_eq!(image.data, b"HELLO");

        let sent = end.sent_reqs().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "fp1");
        assert_eq!(sent[0].1.img_id, "img42");
        assert_eq!(processor.pending_waiters().await, 0);
    }

    #[tokio::test]
    async fn test_get_person_not_found() {
        let end = MockEnd::new(Box::new(|req| {
            Some(Resp::error_reply(req.req_id.clone(), FpcpError::NotFound))
        }));
        let (processor, _) = processor(end).await;

        let err = processor.get_person("fp1", "p9").await.unwrap_err();
        assert_eq!(err, FpcpError::NotFound);
        assert_eq!(processor.pending_waiters().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_wire_code_preserved() {
        let end = MockEnd::new(Box::new(|req| {
            Some(Resp {
                req_id: req.req_id.clone(),
                error: 42,
                ..Resp::default()
            })
        }));
        let (processor, _) = processor(end).await;

        let err = processor.get_image("fp1", "x").await.unwrap_err();
        assert_eq!(err, FpcpError::Wire { code: 42 });
    }

    #[tokio::test]
    async fn test_success_without_payload_is_error() {
        let end = MockEnd::new(Box::new(|req| {
            Some(Resp {
                req_id: req.req_id.clone(),
                ..Resp::default()
            })
        }));
        let (processor, _) = processor(end).await;

        assert!(matches!(
            processor.get_image("fp1", "x").await,
            Err(FpcpError::Codec { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_dropped() {
        let end = MockEnd::silent();
        let (processor, _) = processor(end.clone()).await;

        let err = processor.get_image("fp1", "imgX").await.unwrap_err();
        assert_eq!(err, FpcpError::Timeout);
        // The deadline removed the waiter before returning.
        assert_eq!(processor.pending_waiters().await, 0);

        // A late reply finds no waiter and vanishes without effect.
        let req_id = end.sent_reqs().await[0].1.req_id.clone();
        processor
            .on_resp("fp1", Resp::reply_image(req_id, Image::default()))
            .await;
        assert_eq!(processor.pending_waiters().await, 0);
    }

    #[tokio::test]
    async fn test_scene_push_bypasses_waiters() {
        let end = MockEnd::silent();
        let (processor, scenes) = processor(end.clone()).await;

        let pending = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.get_image("fp1", "a").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.pending_waiters().await, 1);

        // Push a scene whose id collides with the outstanding call; the
        // waiter must survive untouched.
        let req_id = end.sent_reqs().await[0].1.req_id.clone();
        let scene = Scene {
            timestamp: 1000,
            persons: Vec::new(),
        };
        processor
            .on_resp("fp1", Resp::scene_push(req_id, scene.clone()))
            .await;

        assert_eq!(
            scenes.scenes.lock().await.as_slice(),
            &[("fp1".to_string(), scene)]
        );
        assert_eq!(processor.pending_waiters().await, 1);

        // The untouched waiter runs out its deadline as usual.
        assert_eq!(pending.await.unwrap(), Err(FpcpError::Timeout));
    }

    #[tokio::test]
    async fn test_unsolicited_scene_push() {
        let end = MockEnd::silent();
        let (processor, scenes) = processor(end).await;

        let scene = Scene {
            timestamp: 1000,
            persons: Vec::new(),
        };
        processor
            .on_resp("fp1", Resp::scene_push("", scene.clone()))
            .await;

        assert_eq!(
            scenes.scenes.lock().await.as_slice(),
            &[("fp1".to_string(), scene)]
        );
        assert_eq!(processor.pending_waiters().await, 0);
    }

    #[tokio::test]
    async fn test_req_ids_strictly_increasing() {
        let end = MockEnd::silent();
        let (processor, _) = processor(end.clone()).await;

        for _ in 0..5 {
            processor.request_scene("fp1").await.unwrap();
        }

        let ids: Vec<i64> = end
            .sent_reqs()
            .await
            .iter()
            .map(|(_, req)| req.req_id.parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[tokio::test]
    async fn test_request_scene_leaves_no_waiter() {
        let end = MockEnd::silent();
        let (processor, _) = processor(end.clone()).await;

        processor.request_scene("fp1").await.unwrap();
        assert_eq!(processor.pending_waiters().await, 0);

        let sent = end.sent_reqs().await;
        assert!(sent[0].1.scene);
    }

    #[tokio::test]
    async fn test_close_fails_blocked_callers() {
        let end = MockEnd::silent();
        let (processor, _) = processor(end).await;

        let pending = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.get_person("fp1", "p1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        processor.close().await;
        assert_eq!(pending.await.unwrap(), Err(FpcpError::Closed));
        assert_eq!(processor.pending_waiters().await, 0);
    }
}
