//! Request/response types shared by the IPC server and client.

use serde::{Deserialize, Serialize};

/// Panel-scope request action.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Start a prism, or swap it to the foreground if already running.
    Start,
    /// Terminate a prism.
    Kill,
    /// Foreground/background/prism snapshot.
    Status,
    /// Names in MRU order.
    List,
    /// Graceful controller shutdown.
    Stop,
}

/// A request as sent on the wire.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Request {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prism: Option<String>,
}

impl Request {
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            prism: None,
        }
    }

    #[must_use]
    pub fn with_prism(action: Action, prism: &str) -> Self {
        Self {
            action,
            prism: Some(prism.to_string()),
        }
    }
}

/// A response as sent on the wire.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn ok_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Payload of a successful `status` response.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StatusData {
    /// Foreground prism name, empty when the MRU is empty.
    pub foreground: String,
    /// Background prism names in MRU order.
    pub background: Vec<String>,
    /// All live prisms.
    pub prisms: Vec<PrismStatus>,
}

/// One prism in a `status` payload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PrismStatus {
    pub name: String,
    pub pid: i32,
    /// `"foreground"` or `"background"`.
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = Request::with_prism(Action::Start, "clock");
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"action":"start","prism":"clock"}"#);
    }

    #[test]
    fn test_request_without_prism_omits_field() {
        let req = Request::new(Action::Status);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"action":"status"}"#);
    }

    #[test]
    fn test_request_parse_all_actions() {
        for (text, action) in [
            ("start", Action::Start),
            ("kill", Action::Kill),
            ("status", Action::Status),
            ("list", Action::List),
            ("stop", Action::Stop),
        ] {
            let req: Request =
                serde_json::from_str(&format!(r#"{{"action":"{text}"}}"#)).unwrap();
            assert_eq!(req.action, action);
        }
    }

    #[test]
    fn test_status_data_roundtrip() {
        let data = StatusData {
            foreground: "clock".into(),
            background: vec!["bar".into()],
            prisms: vec![
                PrismStatus {
                    name: "clock".into(),
                    pid: 10,
                    state: "foreground".into(),
                },
                PrismStatus {
                    name: "bar".into(),
                    pid: 11,
                    state: "background".into(),
                },
            ],
        };
        let value = serde_json::to_value(&data).unwrap();
        let back: StatusData = serde_json::from_value(value).unwrap();
        assert_eq!(back.foreground, "clock");
        assert_eq!(back.background, vec!["bar".to_string()]);
        assert_eq!(back.prisms.len(), 2);
    }
}
