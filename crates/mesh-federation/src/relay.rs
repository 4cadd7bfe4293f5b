//! Relay wire types
//!
//! A relay request names a service and is fanned out to stars; each star
//! answers with a relay response. Parameter order is preserved so relayed
//! URLs are reproducible.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::Result;

/// Pseudo star name resolving to the first active star
pub const FIRST_AVAILABLE_STAR: &str = "first-available-star";

/// Pseudo star name resolving to the local star
pub const LOCAL_STAR: &str = "LOCAL";

/// A request to call a service on one or more stars
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    /// HTTP method of the relayed call
    pub method: String,
    /// Target star name, a pseudo name, or `None` for all active stars
    #[serde(default)]
    pub star: Option<String>,
    /// Name of the service to call, optionally `group/name`
    pub service_name: String,
    /// Path within the service
    #[serde(default)]
    pub service_path: String,
    /// Query parameters, order preserved
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// JSON payload of the call
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Whether the local star participates in a fan-out
    #[serde(default = "default_true")]
    pub include_local: bool,
    /// User token forwarded to the called service
    #[serde(default)]
    pub user_token: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RelayRequest {
    /// A GET relay to the named service
    pub fn get(service_name: impl Into<String>) -> Self {
        Self::with_method("GET", service_name)
    }

    /// A POST relay to the named service
    pub fn post(service_name: impl Into<String>) -> Self {
        Self::with_method("POST", service_name)
    }

    fn with_method(method: &str, service_name: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            star: None,
            service_name: service_name.into(),
            service_path: String::new(),
            params: IndexMap::new(),
            payload: None,
            include_local: true,
            user_token: None,
        }
    }

    /// Target a single star by name, or one of the pseudo names
    pub fn on_star(mut self, star: impl Into<String>) -> Self {
        self.star = Some(star.into());
        self
    }

    /// Set the path within the service
    pub fn path(mut self, service_path: impl Into<String>) -> Self {
        self.service_path = service_path.into();
        self
    }

    /// Add a query parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Attach a JSON payload
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Leave the local star out of a fan-out
    pub fn exclude_local(mut self) -> Self {
        self.include_local = false;
        self
    }

    /// Forward a user token to the called service
    pub fn user_token(mut self, token: impl Into<String>) -> Self {
        self.user_token = Some(token.into());
        self
    }
}

/// Answer of one star to a relayed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    /// Name of the answering star
    pub star_name: String,
    /// Base URL of the answering star
    pub star_url: String,
    /// HTTP status of the call on that star
    pub status: u16,
    /// JSON content of the answer
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

impl RelayResponse {
    /// A successful response with content
    pub fn ok(
        star_name: impl Into<String>,
        star_url: impl Into<String>,
        content: Option<serde_json::Value>,
    ) -> Self {
        Self {
            star_name: star_name.into(),
            star_url: star_url.into(),
            status: 200,
            content,
        }
    }

    /// The response used when a star cannot be reached
    pub fn failed(star_name: impl Into<String>, star_url: impl Into<String>) -> Self {
        Self {
            star_name: star_name.into(),
            star_url: star_url.into(),
            status: 503,
            content: None,
        }
    }

    /// Whether the star answered successfully
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the content
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.content
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()).map_err(Into::into))
            .transpose()
    }
}

/// One concrete call to one star, ready for a transport
#[derive(Debug, Clone, PartialEq)]
pub struct RelayCall {
    /// HTTP method
    pub method: String,
    /// Full URL on the target star
    pub url: String,
    /// Query parameters, order preserved
    pub params: IndexMap<String, String>,
    /// Headers to send, relay bookkeeping included
    pub headers: Vec<(String, String)>,
    /// JSON payload
    pub payload: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_as_camel_case_json() {
        let request = RelayRequest::post("metrics")
            .path("/values")
            .param("from", "today")
            .on_star("star-b")
            .exclude_local();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["serviceName"], "metrics");
        assert_eq!(json["servicePath"], "/values");
        assert_eq!(json["includeLocal"], false);
        assert_eq!(json["star"], "star-b");

        let back: RelayRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let request: RelayRequest =
            serde_json::from_str(r#"{"method":"GET","serviceName":"metrics"}"#).unwrap();
        assert!(request.include_local);
        assert!(request.star.is_none());
        assert!(request.params.is_empty());
    }

    #[test]
    fn param_order_is_preserved() {
        let request = RelayRequest::get("metrics")
            .param("b", "2")
            .param("a", "1")
            .param("c", "3");
        let keys: Vec<&String> = request.params.keys().collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn failed_response_is_unavailable() {
        let response = RelayResponse::failed("star-b", "http://star-b:9000");
        assert_eq!(response.status, 503);
        assert!(!response.is_success());
    }

    #[test]
    fn response_serializes_as_camel_case_json() {
        let response = RelayResponse::ok(
            "star-b",
            "http://star-b:9000",
            Some(serde_json::json!({"count": 3})),
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["starName"], "star-b");
        assert_eq!(json["starUrl"], "http://star-b:9000");
        assert_eq!(json["content"]["count"], 3);
    }

    #[test]
    fn user_token_round_trips() {
        let request = RelayRequest::get("metrics").user_token("token-1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["userToken"], "token-1");
        let back: RelayRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.user_token.as_deref(), Some("token-1"));
    }
}
