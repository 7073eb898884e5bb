use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CoreError, CoreResult};

/// Trace id used when an upstream producer did not supply one.
pub const UNKNOWN_TRACE_ID: &str = "unknown";

fn unknown_trace_id() -> String {
    UNKNOWN_TRACE_ID.to_string()
}

/// An event emitted to a topic.
///
/// `data` is opaque to the delivery layer. Events carrying a `message_group_id`
/// are delivered strictly in emit order per subscriber queue; events without one
/// have no ordering guarantee.
///
/// The wire shape is camelCase and omits `flows` / `messageGroupId` entirely
/// when they are absent, so downstream consumers always see the same keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event<T = JsonValue> {
    pub topic: String,
    pub data: T,
    #[serde(default = "unknown_trace_id")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flows: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_group_id: Option<String>,
}

impl<T> Event<T> {
    pub fn new(topic: impl Into<String>, data: T, trace_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data,
            trace_id: trace_id.into(),
            flows: None,
            message_group_id: None,
        }
    }

    pub fn with_flows<I, S>(mut self, flows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flows = Some(flows.into_iter().map(Into::into).collect());
        self
    }

    /// Pin this event to sequential, single-consumer processing with every
    /// other event carrying the same group id.
    pub fn with_message_group_id(mut self, group: impl Into<String>) -> Self {
        self.message_group_id = Some(group.into());
        self
    }

    /// Replace a missing or blank trace id with [`UNKNOWN_TRACE_ID`].
    pub fn with_default_trace_id(mut self) -> Self {
        if self.trace_id.trim().is_empty() {
            self.trace_id = unknown_trace_id();
        }
        self
    }
}

impl<T: Serialize> Event<T> {
    /// Convert the payload into its JSON form for transport.
    pub fn into_json(self) -> CoreResult<Event<JsonValue>> {
        let data = serde_json::to_value(&self.data).map_err(|e| CoreError::payload(e.to_string()))?;
        Ok(Event {
            topic: self.topic,
            data,
            trace_id: self.trace_id,
            flows: self.flows,
            message_group_id: self.message_group_id,
        })
    }
}

impl Event<JsonValue> {
    /// Decode the JSON payload into a typed event.
    pub fn decode<T: DeserializeOwned>(self) -> CoreResult<Event<T>> {
        let data = serde_json::from_value(self.data).map_err(|e| CoreError::payload(e.to_string()))?;
        Ok(Event {
            topic: self.topic,
            data,
            trace_id: self.trace_id,
            flows: self.flows,
            message_group_id: self.message_group_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn absent_optionals_are_omitted_from_the_wire_shape() {
        let event = Event::new("orders.created", json!({"id": 1}), "t1");
        let value = serde_json::to_value(&event).unwrap();

        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["traceId"], "t1");
        assert!(!obj.contains_key("flows"));
        assert!(!obj.contains_key("messageGroupId"));
    }

    #[test]
    fn present_optionals_use_camel_case_keys() {
        let event = Event::new("orders.created", json!(null), "t1")
            .with_flows(["checkout"])
            .with_message_group_id("customer-9");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["flows"], json!(["checkout"]));
        assert_eq!(value["messageGroupId"], "customer-9");
    }

    #[test]
    fn missing_trace_id_defaults_to_unknown() {
        let event: Event = serde_json::from_value(json!({"topic": "a", "data": 1})).unwrap();
        assert_eq!(event.trace_id, UNKNOWN_TRACE_ID);

        let blank = Event::new("a", 1, "  ").with_default_trace_id();
        assert_eq!(blank.trace_id, UNKNOWN_TRACE_ID);
    }

    #[test]
    fn typed_payload_survives_json_conversion() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Order {
            id: u32,
        }

        let event = Event::new("orders.created", Order { id: 7 }, "t1").with_message_group_id("g");
        let decoded = event.into_json().unwrap().decode::<Order>().unwrap();

        assert_eq!(decoded.data, Order { id: 7 });
        assert_eq!(decoded.message_group_id.as_deref(), Some("g"));
    }

    #[test]
    fn decode_reports_payload_mismatch() {
        let event = Event::new("a", json!("text"), "t1");
        let err = event.decode::<u64>().unwrap_err();
        assert!(matches!(err, CoreError::Payload(_)));
    }

    proptest! {
        #[test]
        fn non_blank_trace_ids_are_kept(trace in "[a-z0-9-]{1,24}") {
            let event = Event::new("a", 1, trace.clone()).with_default_trace_id();
            prop_assert_eq!(event.trace_id, trace);
        }
    }
}
