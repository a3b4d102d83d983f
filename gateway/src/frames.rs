//! The Gateway's multiplexed WebSocket wire format: one `type`-tagged JSON
//! frame shape carrying a `sessionId` field, shared by every session a
//! browser has subscribed to over its single socket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        preview: bool,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Input {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    Resize {
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: u16,
        rows: u16,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Data {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    Resized {
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Error {
        #[serde(rename = "sessionId")]
        session_id: String,
        code: u16,
        error: String,
    },
}
