//! FPCP wire data model.
//!
//! Everything here travels as JSON with fixed field names; the only
//! exception is `Image.data`, which the designed path carries as a raw
//! multipart file part instead of the envelope (see the broker and client
//! modules). The codec is stateless: absent optional fields decode to
//! their zero values, and zero values are tolerated on input everywhere.

mod base64_bytes;

use serde::{Deserialize, Serialize};

/// Millisecond epoch timestamp, signed 64-bit.
pub type Timestamp = i64;

/// Current wall-clock time as a wire [`Timestamp`].
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectSize {
    pub w: i32,
    pub h: i32,
}

/// Pixel rectangle, left/top/right/bottom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rect {
    pub l: i32,
    pub t: i32,
    pub r: i32,
    pub b: i32,
}

/// A captured frame. `data` may be empty when only metadata travels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    pub id: String,
    pub size: RectSize,
    pub timestamp: Timestamp,
    #[serde(with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

/// A face observation, back-referencing its source image by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Face {
    pub img_id: String,
    pub region: Rect,
}

/// A tracked person. `lost_at == 0` means still present in the scene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Person {
    pub id: String,
    pub first_seen_at: Timestamp,
    pub lost_at: Timestamp,
    pub faces: Vec<Face>,
}

/// A scene snapshot (not a diff).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scene {
    pub timestamp: Timestamp,
    pub persons: Vec<Person>,
}

/// A downstream request from the scene processor to one frame processor.
///
/// Exactly one of `scene == true`, `img_id`, `person_id` is the active
/// field; the others stay at their zero values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Req {
    pub req_id: String,
    pub scene: bool,
    pub img_id: String,
    pub person_id: String,
}

impl Req {
    /// Request a scene snapshot.
    pub fn scene(req_id: impl Into<String>) -> Self {
        Self {
            req_id: req_id.into(),
            scene: true,
            ..Self::default()
        }
    }

    /// Request the image with the given id.
    pub fn image(req_id: impl Into<String>, img_id: impl Into<String>) -> Self {
        Self {
            req_id: req_id.into(),
            img_id: img_id.into(),
            ..Self::default()
        }
    }

    /// Request the person record with the given id.
    pub fn person(req_id: impl Into<String>, person_id: impl Into<String>) -> Self {
        Self {
            req_id: req_id.into(),
            person_id: person_id.into(),
            ..Self::default()
        }
    }
}

/// An upstream response from a frame processor.
///
/// `error != 0` means the payload fields are absent. An empty `req_id`
/// with a present `scene` is an unsolicited scene push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resp {
    pub req_id: String,
    pub error: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<Scene>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<Person>,
}

impl Resp {
    /// Successful reply carrying an image.
    pub fn reply_image(req_id: impl Into<String>, image: Image) -> Self {
        Self {
            req_id: req_id.into(),
            image: Some(image),
            ..Self::default()
        }
    }

    /// Successful reply carrying a person record.
    pub fn reply_person(req_id: impl Into<String>, person: Person) -> Self {
        Self {
            req_id: req_id.into(),
            person: Some(person),
            ..Self::default()
        }
    }

    /// Reply to a scene request, or an unsolicited push when `req_id`
    /// is empty.
    pub fn scene_push(req_id: impl Into<String>, scene: Scene) -> Self {
        Self {
            req_id: req_id.into(),
            scene: Some(scene),
            ..Self::default()
        }
    }

    /// Failed reply carrying only a wire error code.
    pub fn error_reply(req_id: impl Into<String>, error: crate::error::FpcpError) -> Self {
        Self {
            req_id: req_id.into(),
            error: error.wire_code().unwrap_or(0),
            ..Self::default()
        }
    }

    /// True for a response carrying a scene payload; these bypass the
    /// correlator entirely.
    pub fn is_scene_push(&self) -> bool {
        self.scene.is_some()
    }
}
