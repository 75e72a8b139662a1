use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::service::{QueueIdentity, Service};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("undecodable action chain: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("action is missing its {0} attribute")]
    MissingRouting(&'static str),
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("malformed queue name '{0}'")]
    MalformedQueueName(String),
}

/// One unit of work addressed to a service queue. Fields other than `type`,
/// `queue` and `actions` are carried through untouched.
///
/// Decoding never fails on a single bad action: a non-string `type` or
/// `queue` decodes as empty and a non-object entry as an empty action, so the
/// worker can skip it as unroutable and still run its siblings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub service_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub queue: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// Follow-on actions enqueued once this one has been executed.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "lenient_actions"
    )]
    pub actions: Vec<Action>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => value,
        _ => String::new(),
    })
}

fn lenient_actions<'de, D>(deserializer: D) -> Result<Vec<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = match Value::deserialize(deserializer)? {
        Value::Array(entries) => entries,
        _ => Vec::new(),
    };
    Ok(entries
        .into_iter()
        .map(|entry| serde_json::from_value(entry).unwrap_or_default())
        .collect())
}

impl Action {
    pub fn new(service: Service, queue: impl Into<String>) -> Self {
        Self {
            service_type: service.name().to_string(),
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_follow_on(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn string_attr(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Resolves the queue this action has to be delivered to.
    pub fn target(&self) -> Result<QueueIdentity, ChainError> {
        if self.service_type.is_empty() {
            return Err(ChainError::MissingRouting("type"));
        }
        if self.queue.is_empty() {
            return Err(ChainError::MissingRouting("queue"));
        }
        Ok(QueueIdentity::new(
            self.service_type.parse()?,
            self.queue.clone(),
        ))
    }
}

/// Ordered actions sharing one data payload; the body of every broker message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionChain {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_actions")]
    pub actions: Vec<Action>,
}

impl ActionChain {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            data: Vec::new(),
            actions,
        }
    }

    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.data = data;
        self
    }

    /// The chain sent to the next hop: one action plus the data gathered so far.
    pub fn next_hop(action: Action, data: &[Value]) -> Self {
        Self {
            data: data.to_vec(),
            actions: vec![action],
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, ChainError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_wire_format_with_free_fields_and_follow_ons() {
        let payload = json!({
            "data": [{"url": "https://example.org"}],
            "actions": [{
                "type": "loader",
                "queue": "default",
                "id": "crawl-1",
                "depth": 2,
                "actions": [{"type": "parser", "queue": "default"}]
            }]
        });
        let chain = ActionChain::from_bytes(payload.to_string().as_bytes()).unwrap();

        assert_eq!(chain.data.len(), 1);
        let action = &chain.actions[0];
        assert_eq!(action.service_type, "loader");
        assert_eq!(action.string_attr("id"), Some("crawl-1"));
        assert_eq!(action.fields.get("depth"), Some(&json!(2)));
        assert_eq!(action.actions.len(), 1);
        assert_eq!(
            action.actions[0].target().unwrap(),
            QueueIdentity::new(Service::Parser, "default")
        );
    }

    #[test]
    fn encode_then_decode_preserves_actions_and_data() {
        let chain = ActionChain::new(vec![
            Action::new(Service::Parser, "default")
                .with_field("id", "a")
                .with_follow_on(Action::new(Service::Indexer, "default")),
            Action::new(Service::Indexer, "bulk"),
        ])
        .with_data(vec![json!({"title": "t"}), json!(["x", 1])]);

        let decoded = ActionChain::from_bytes(&chain.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, chain);
        let again = ActionChain::from_bytes(&decoded.to_bytes().unwrap()).unwrap();
        assert_eq!(again, chain);
    }

    #[test]
    fn target_requires_type_and_queue() {
        let missing_type = Action {
            queue: "default".into(),
            ..Action::default()
        };
        assert!(matches!(
            missing_type.target(),
            Err(ChainError::MissingRouting("type"))
        ));

        let missing_queue = Action {
            service_type: "parser".into(),
            ..Action::default()
        };
        assert!(matches!(
            missing_queue.target(),
            Err(ChainError::MissingRouting("queue"))
        ));

        let unknown = Action {
            service_type: "search".into(),
            queue: "default".into(),
            ..Action::default()
        };
        assert!(matches!(unknown.target(), Err(ChainError::UnknownService(_))));
    }

    #[test]
    fn free_field_order_is_kept() {
        let raw = r#"{"type":"parser","queue":"default","zeta":1,"alpha":2}"#;
        let action: Action = serde_json::from_str(raw).unwrap();
        let keys: Vec<&str> = action.fields.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        assert_eq!(serde_json::to_string(&action).unwrap(), raw);
    }

    #[test]
    fn one_bad_action_does_not_spoil_the_chain() {
        let raw = json!({
            "actions": [
                {"type": null, "queue": "default"},
                {"type": "parser", "queue": 7},
                "not an action",
                {"type": "parser", "queue": "default", "id": "ok",
                 "actions": [42, {"type": "indexer", "queue": "default"}]}
            ]
        });
        let chain = ActionChain::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(chain.actions.len(), 4);

        assert!(matches!(
            chain.actions[0].target(),
            Err(ChainError::MissingRouting("type"))
        ));
        assert!(matches!(
            chain.actions[1].target(),
            Err(ChainError::MissingRouting("queue"))
        ));
        assert!(matches!(
            chain.actions[2].target(),
            Err(ChainError::MissingRouting("type"))
        ));

        let valid = &chain.actions[3];
        assert_eq!(valid.string_attr("id"), Some("ok"));
        assert!(valid.actions[0].target().is_err());
        assert_eq!(
            valid.actions[1].target().unwrap(),
            QueueIdentity::new(Service::Indexer, "default")
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            ActionChain::from_bytes(b"not json"),
            Err(ChainError::Decode(_))
        ));
    }
}
