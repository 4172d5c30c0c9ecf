//! Connectors available on every node.
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{Value, json};
use url::Url;

use super::task::{ConnectorError, ConnectorOutputs, ConnectorParameters, ConnectorTask};

pub const ECHO: &str = "echo";
pub const HTTP: &str = "http";

/// Returns its inputs as outputs.
#[derive(Debug, Default, Clone)]
pub struct EchoConnector {
    inputs: ConnectorParameters,
}

#[async_trait]
impl ConnectorTask for EchoConnector {
    fn set_input_parameters(&mut self, parameters: ConnectorParameters) {
        self.inputs = parameters;
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<ConnectorOutputs, ConnectorError> {
        Ok(self.inputs.clone())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Calls an HTTP endpoint.
///
/// Inputs: `url` (required), `method` (GET or POST, default GET), `body` (json, POST only),
/// `headers` (object of strings), `timeout_ms` (default 30000).
/// Outputs: `status` and `body`, the latter parsed as json when possible.
#[derive(Debug, Default)]
pub struct HttpConnector {
    inputs: ConnectorParameters,
    client: Option<Client>,
}

impl HttpConnector {
    const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    fn url(&self) -> Result<Url, ConnectorError> {
        let raw = self
            .inputs
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::Validation("input `url` is required".into()))?;
        let url = Url::parse(raw).map_err(|e| ConnectorError::Validation(format!("invalid url `{}`: {}", raw, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConnectorError::Validation(format!("unsupported url scheme `{}`", other))),
        }
    }

    fn method(&self) -> Result<Method, ConnectorError> {
        let raw = self.inputs.get("method").and_then(Value::as_str).unwrap_or("GET");
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            other => Err(ConnectorError::Validation(format!("unsupported method `{}`", other))),
        }
    }

    fn headers(&self) -> Result<HeaderMap, ConnectorError> {
        let mut headers = HeaderMap::new();
        let Some(raw) = self.inputs.get("headers") else {
            return Ok(headers);
        };
        let object = raw
            .as_object()
            .ok_or_else(|| ConnectorError::Validation("input `headers` must be an object".into()))?;
        for (name, value) in object {
            let value = value
                .as_str()
                .ok_or_else(|| ConnectorError::Validation(format!("header `{}` must be a string", name)))?;
            let name = HeaderName::from_str(name)
                .map_err(|e| ConnectorError::Validation(format!("invalid header name `{}`: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConnectorError::Validation(format!("invalid value for header `{}`: {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn timeout(&self) -> Duration {
        let millis = self
            .inputs
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(Self::DEFAULT_TIMEOUT_MS);
        Duration::from_millis(millis)
    }
}

#[async_trait]
impl ConnectorTask for HttpConnector {
    fn set_input_parameters(&mut self, parameters: ConnectorParameters) {
        self.inputs = parameters;
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        self.url()?;
        self.method()?;
        self.headers()?;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        let client = Client::builder()
            .default_headers(self.headers()?)
            .timeout(self.timeout())
            .build()
            .map_err(|e| ConnectorError::Connection(format!("reqwest client: {e}")))?;
        self.client = Some(client);
        Ok(())
    }

    async fn execute(&mut self) -> Result<ConnectorOutputs, ConnectorError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectorError::Execution("http connector is not connected".into()))?;
        let mut request = client.request(self.method()?, self.url()?);
        if let Some(body) = self.inputs.get("body") {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Execution(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::Execution(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(HashMap::from([
            ("status".to_string(), json!(status.as_u16())),
            ("body".to_string(), body),
        ]))
    }

    async fn disconnect(&mut self) -> Result<(), ConnectorError> {
        self.client = None;
        Ok(())
    }
}
