//! Webhook notification bodies sent by the provider.
//!
//! Two shapes are in circulation:
//!
//! - `{"type": "payment", "data": {"id": "123"}}` (current webhooks)
//! - `{"topic": "payment", "resource": "123"}` (legacy IPN, where `resource`
//!   may also be a full `.../payments/123` URL)
//!
//! Only the payment id is extracted; the record itself is always fetched
//! with `get_payment`, never trusted from the callback body.

use crate::error::{CheckoutError, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Payment { payment_id: String },
    Other { topic: String },
}

#[derive(Deserialize)]
struct RawNotification {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<RawData>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    resource: Option<String>,
}

#[derive(Deserialize)]
struct RawData {
    id: Value,
}

impl Notification {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let raw: RawNotification = serde_json::from_slice(body)
            .map_err(|e| CheckoutError::Validation(format!("malformed notification: {e}")))?;

        let topic = raw
            .kind
            .or(raw.topic)
            .ok_or_else(|| CheckoutError::Validation("notification has no type or topic".into()))?;
        if topic != "payment" {
            return Ok(Self::Other { topic });
        }

        let payment_id = match (raw.data, raw.resource) {
            (Some(data), _) => id_from_value(data.id),
            (None, Some(resource)) => resource
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(str::to_string),
            (None, None) => None,
        }
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CheckoutError::Validation("payment notification without an id".into()))?;

        Ok(Self::Payment { payment_id })
    }
}

fn id_from_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
