use serde::{Deserialize, Serialize};

/// One materialized stream event.
///
/// Wire format: `{"kind":"N","value":…}`, `{"kind":"E","error":"…"}` or
/// `{"kind":"C"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Notification<T> {
    /// A value.
    #[serde(rename = "N")]
    Next { value: T },
    /// Terminal error, carried as its message.
    #[serde(rename = "E")]
    Error { error: String },
    /// Terminal completion.
    #[serde(rename = "C")]
    Complete,
}

impl<T> Notification<T> {
    pub fn next(value: T) -> Self {
        Self::Next { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_format_matches_kind_letters() {
        assert_eq!(
            serde_json::to_value(Notification::next("S 0")).unwrap(),
            json!({"kind": "N", "value": "S 0"})
        );
        assert_eq!(
            serde_json::to_value(Notification::<String>::error("AbortChannel")).unwrap(),
            json!({"kind": "E", "error": "AbortChannel"})
        );
        assert_eq!(
            serde_json::to_value(Notification::<String>::Complete).unwrap(),
            json!({"kind": "C"})
        );
    }

    #[test]
    fn decodes_typed_values() {
        let parsed: Notification<u32> =
            serde_json::from_value(json!({"kind": "N", "value": 3})).unwrap();
        assert_eq!(parsed, Notification::next(3));

        let done: Notification<u32> = serde_json::from_value(json!({"kind": "C"})).unwrap();
        assert_eq!(done, Notification::Complete);

        assert!(serde_json::from_value::<Notification<u32>>(json!({"kind": "X"})).is_err());
        assert!(serde_json::from_value::<Notification<u32>>(json!({"kind": "N", "value": "x"})).is_err());
    }
}
