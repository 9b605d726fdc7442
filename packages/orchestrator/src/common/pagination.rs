//! Opaque cursor for keyset pagination of admin listings.
//!
//! A cursor pins the `(sort key, id)` position of the last row on the
//! previous page. The id is always part of the key so pagination stays
//! stable when many rows share the same sort value.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::OrchestratorError;

/// The sort-key half of a cursor position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum CursorKey {
    Timestamp(DateTime<Utc>),
    Int(i64),
}

/// Position of the last row seen, encoded opaquely for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub key: CursorKey,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(key: CursorKey, id: Uuid) -> Self {
        Self { key, id }
    }

    /// Encode as a URL-safe base64 string.
    pub fn encode(&self) -> String {
        // serde_json on a two-field struct cannot fail
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).expect("cursor serializes"))
    }

    pub fn decode(s: &str) -> Result<Self, OrchestratorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| OrchestratorError::Validation("cursor is not valid base64".into()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| OrchestratorError::Validation("cursor is malformed".into()))
    }
}
