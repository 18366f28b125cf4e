//! Outgoing message payloads.

use serde::{Deserialize, Serialize};

const OCTET_STREAM: &str = "application/octet-stream";

/// A message handed to a client for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OutgoingMessage {
    /// Plain text.
    Text { body: String },

    /// An attachment. `data` is the base64 payload exactly as received.
    #[serde(rename_all = "camelCase")]
    Media {
        mimetype: String,
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Wrap an attachment, inferring its content type from `filename`.
    pub fn attachment(filename: Option<String>, data: String, caption: Option<String>) -> Self {
        Self::Media {
            mimetype: infer_mime_type(filename.as_deref()),
            data,
            filename,
            caption,
        }
    }
}

/// Content type for a file name, `application/octet-stream` when unknown.
pub fn infer_mime_type(filename: Option<&str>) -> String {
    filename
        .map(|name| {
            mime_guess::from_path(name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}
