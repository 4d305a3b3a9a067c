use crate::config::SocketConfig;
use serde_json::Value;

/// One inbound frame that survived filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub raw: String,
    /// Parsed body, when the frame is JSON.
    pub json: Option<Value>,
}

impl InboundMessage {
    pub fn parse(raw: String) -> Self {
        let json = serde_json::from_str::<Value>(&raw).ok();
        Self { raw, json }
    }

    /// The `type` field of a JSON object frame.
    pub fn message_type(&self) -> Option<&str> {
        self.json.as_ref()?.get("type")?.as_str()
    }
}

/// Drops frames that belong to the transport's own protocol.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    ack_sentinel: String,
    login_type: String,
}

impl MessageFilter {
    pub fn new(ack_sentinel: &str, login_type: &str) -> Self {
        Self {
            ack_sentinel: ack_sentinel.to_string(),
            login_type: login_type.to_string(),
        }
    }

    pub fn from_config(config: &SocketConfig) -> Self {
        Self::new(&config.ack_sentinel, &config.login_message_type)
    }

    /// `None` for the acknowledgement sentinel and login-handshake frames.
    pub fn accept(&self, raw: String) -> Option<InboundMessage> {
        if raw == self.ack_sentinel {
            return None;
        }
        let message = InboundMessage::parse(raw);
        if message.message_type() == Some(self.login_type.as_str()) {
            return None;
        }
        Some(message)
    }
}
