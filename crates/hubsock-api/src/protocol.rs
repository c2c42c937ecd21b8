// Frame codec for the admin socket protocol.
//
// Every frame is a JSON array whose first element is the frame type:
//
//   [0, id, name, args]   message (id 0 = no acknowledgement wanted)
//   [1]                   ping
//   [2]                   pong
//   [3, id, name, args]   callback, i.e. the acknowledgement of message `id`
//
// Inbound messages from the server carry push events (`stateChange`,
// `objectChange`, ...). Callbacks settle requests issued with an ack.

use serde_json::{Value, json};

use crate::error::Error;

const TYPE_MESSAGE: u64 = 0;
const TYPE_PING: u64 = 1;
const TYPE_PONG: u64 = 2;
const TYPE_CALLBACK: u64 = 3;

/// A single decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Named event. `id` is non-zero when the sender expects a callback.
    Message {
        id: u64,
        name: String,
        args: Vec<Value>,
    },
    Ping,
    Pong,
    /// Acknowledgement for a previously sent message.
    Callback {
        id: u64,
        name: String,
        args: Vec<Value>,
    },
}

impl Frame {
    /// Encode the frame into its JSON text form.
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Message { id, name, args } => json!([TYPE_MESSAGE, id, name, args]),
            Self::Ping => json!([TYPE_PING]),
            Self::Pong => json!([TYPE_PONG]),
            Self::Callback { id, name, args } => json!([TYPE_CALLBACK, id, name, args]),
        };
        value.to_string()
    }

    /// Decode a text frame.
    ///
    /// A missing `args` slot decodes as an empty list and a non-array
    /// `args` slot is wrapped into a one-element list, which is what the
    /// server does for single-argument events.
    pub fn decode(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text.to_owned(),
        })?;

        let Value::Array(mut parts) = value else {
            return Err(malformed("frame is not an array", text));
        };
        if parts.is_empty() {
            return Err(malformed("empty frame", text));
        }

        let kind = parts[0]
            .as_u64()
            .ok_or_else(|| malformed("frame type is not a number", text))?;

        match kind {
            TYPE_PING => Ok(Self::Ping),
            TYPE_PONG => Ok(Self::Pong),
            TYPE_MESSAGE | TYPE_CALLBACK => {
                let id = parts.get(1).and_then(Value::as_u64).unwrap_or(0);
                let name = parts
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let args = match parts.get_mut(3).map(Value::take) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                };

                if kind == TYPE_CALLBACK {
                    if id == 0 {
                        return Err(malformed("callback without id", text));
                    }
                    Ok(Self::Callback { id, name, args })
                } else {
                    if name.is_empty() {
                        return Err(malformed("message without name", text));
                    }
                    Ok(Self::Message { id, name, args })
                }
            }
            other => Err(malformed(&format!("unknown frame type {other}"), text)),
        }
    }
}

fn malformed(message: &str, body: &str) -> Error {
    Error::Deserialization {
        message: message.to_owned(),
        body: body.to_owned(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
