//! Pending popup approval requests.
//!
//! An [`AppRequestData`] exists in the cache only while its approval flow is
//! in progress. The popup finds it by id and renders it; its answer comes
//! back as a `popup_data` response carrying the same id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{RequestId, SessionId};

/// Pointer position of the click that triggered a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Mouse {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppRequestData {
    pub id: RequestId,
    pub origin: String,
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
}

impl AppRequestData {
    pub fn new(origin: impl Into<String>, method: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            id: RequestId::new(),
            origin: origin.into(),
            method: method.into(),
            params,
            session: None,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Popup route: `/{method}?id={id}` plus the query-encoded params.
    ///
    /// String params are written as-is, other values as JSON. Null params
    /// are left out.
    pub fn popup_path(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("id", &self.id.to_string());
        for (key, value) in &self.params {
            match value {
                Value::Null => {}
                Value::String(s) => {
                    query.append_pair(key, s);
                }
                other => {
                    query.append_pair(key, &other.to_string());
                }
            }
        }
        format!("/{}?{}", self.method, query.finish())
    }
}

/// Cache key of a pending request.
pub fn app_request_key(id: RequestId) -> String {
    format!("request/{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_popup_path_encodes_method_id_and_params() {
        let params = json!({ "chainId": "0x89", "gas": null })
            .as_object()
            .cloned()
            .unwrap();
        let request = AppRequestData::new("https://dapp.example", "wallet_switchEthereumChain", params);
        let path = request.popup_path();
        assert!(path.starts_with(&format!("/wallet_switchEthereumChain?id={}", request.id)));
        assert!(path.contains("chainId=0x89"));
        assert!(!path.contains("gas"));
    }

    #[test]
    fn test_popup_path_escapes_values() {
        let params = json!({ "message": "hello world&more" }).as_object().cloned().unwrap();
        let request = AppRequestData::new("https://a.example", "personal_sign", params);
        assert!(request.popup_path().contains("message=hello+world%26more"));
    }

    #[test]
    fn test_session_is_optional_on_wire() {
        let request = AppRequestData::new("https://a.example", "eth_requestAccounts", Map::new());
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("session").is_none());
    }
}
