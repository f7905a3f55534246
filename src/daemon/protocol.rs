//! Control-plane wire format (§4.G/§6): one JSON object per request/response,
//! each frame prefixed by a 4-byte big-endian length via
//! `tokio_util::codec::LengthDelimitedCodec`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::forwarding::TunnelSummary;
use crate::model::TunnelDesc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Request {
    Nop,
    Open { tunnel: TunnelDesc },
    Close { name: String },
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    /// Populated by `List`; empty for every other request.
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelSummary>,
}

impl Response {
    pub fn ok() -> Self {
        Self { success: true, error: String::new(), tunnels: HashMap::new() }
    }

    pub fn ok_with_tunnels(tunnels: Vec<TunnelSummary>) -> Self {
        Self {
            success: true,
            error: String::new(),
            tunnels: tunnels.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn err(message: impl std::fmt::Display) -> Self {
        Self { success: false, error: message.to_string(), tunnels: HashMap::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_kinds_round_trip_through_json() {
        let requests = vec![
            Request::Nop,
            Request::Close { name: "dev".into() },
            Request::List,
            Request::Open {
                tunnel: TunnelDesc {
                    name: "dev".into(),
                    mode: crate::model::TunnelMode::Local,
                    local: Some("9000".into()),
                    remote: Some("localhost:9000".into()),
                    host: "dev-server".into(),
                    user: None,
                    identity: None,
                },
            },
        ];

        for request in requests {
            let encoded = serde_json::to_string(&request).unwrap();
            let decoded: Request = serde_json::from_str(&encoded).unwrap();
            assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
        }
    }

    #[test]
    fn ok_response_has_no_error_text() {
        let response = Response::ok();
        assert!(response.success);
        assert!(response.error.is_empty());
    }
}
