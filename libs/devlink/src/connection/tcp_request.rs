//! Request/Response TCP connection
//!
//! Stateless HTTP exchange per `send()`: the payload is the full request URL,
//! the reply body is returned as text. Nothing is kept open between calls.

use reqwest::blocking::{multipart, Client, RequestBuilder};
use reqwest::header::COOKIE;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::callbacks::DataCallback;
use crate::connection::core::ConnectionCore;
use crate::connection::traits::{Connection, LinkStats, Payload, RequestMethod, SendRequest};
use crate::error::{LinkError, Result};
use crate::params::ConnectionParams;

/// Blocking HTTP client shared by the request/response variants
#[derive(Debug, Clone)]
pub struct HttpRequester {
    client: Client,
    name: String,
}

impl HttpRequester {
    pub fn new(name: impl Into<String>, params: &ConnectionParams) -> Result<Self> {
        let client = Client::builder().timeout(params.read_deadline()).build()?;
        Ok(Self {
            client,
            name: name.into(),
        })
    }

    /// Issue one request; 2xx/3xx bodies are returned as text
    pub fn execute(&self, request: &SendRequest) -> Result<Option<Payload>> {
        let url = request
            .payload
            .as_text()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                LinkError::InvalidPayload(format!(
                    "{}: payload must be a request URL",
                    self.name
                ))
            })?;

        let builder = self.build(url, request)?;
        debug!(
            "[{}] {:?} {} (headers: {}, data: {})",
            self.name,
            request.method,
            url,
            request.headers.len(),
            request.data.len()
        );

        let response = builder.send()?;
        let status = response.status();
        let body = response.text()?;
        debug!(
            "[{}] received response with code {}: {}",
            self.name,
            status.as_u16(),
            body
        );

        if status.is_success() || status.is_redirection() {
            Ok(Some(Payload::Text(body)))
        } else {
            warn!("[{}] request to {} returned {}", self.name, url, status);
            Err(LinkError::Http {
                status: status.as_u16(),
                message: format!(
                    "TCP request returned code {}, error was: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or(body.as_str())
                ),
            })
        }
    }

    fn build(&self, url: &str, request: &SendRequest) -> Result<RequestBuilder> {
        let method = match request.method {
            RequestMethod::Get => Method::GET,
            RequestMethod::Post => Method::POST,
        };
        let mut builder = self.client.request(method, url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if !request.cookies.is_empty() {
            let cookies = request
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(COOKIE, cookies);
        }

        if request.method == RequestMethod::Get && !request.data.is_empty() {
            let query: Vec<(String, String)> = request
                .data
                .iter()
                .map(|(key, value)| (key.clone(), value_to_param(value)))
                .collect();
            builder = builder.query(&query);
        }

        if !request.files.is_empty() {
            let mut form = multipart::Form::new();
            if request.method == RequestMethod::Post {
                for (key, value) in &request.data {
                    form = form.text(key.clone(), value_to_param(value));
                }
            }
            for (field, path) in &request.files {
                form = form.file(field.clone(), path)?;
            }
            builder = builder.multipart(form);
        } else if request.method == RequestMethod::Post {
            builder = builder.json(&request.data);
        }

        Ok(builder)
    }
}

fn value_to_param(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// HTTP request/response transport
#[derive(Debug)]
pub struct TcpRequestConnection {
    core: Arc<ConnectionCore>,
    http: HttpRequester,
}

impl TcpRequestConnection {
    pub fn new(params: ConnectionParams, data_callback: Option<DataCallback>) -> Result<Self> {
        let core = Arc::new(ConnectionCore::new(
            "net_tcp_request",
            params,
            data_callback,
        ));
        let http = HttpRequester::new(core.name(), core.params())?;
        Ok(Self { core, http })
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

impl Connection for TcpRequestConnection {
    fn kind(&self) -> &str {
        self.core.kind()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn open(&self) -> bool {
        self.core.open_with(|| true)
    }

    fn close(&self) {
        self.core.close_with(|| {});
    }

    fn send(&self, request: &SendRequest) -> Result<Option<Payload>> {
        self.core
            .send_with(request, || true, |request| self.http.execute(request))
    }

    fn connected(&self) -> bool {
        self.core.is_connected()
    }

    fn stats(&self) -> LinkStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_params_are_plain_strings() {
        assert_eq!(value_to_param(&json!("abc")), "abc");
        assert_eq!(value_to_param(&json!(5)), "5");
        assert_eq!(value_to_param(&json!(true)), "true");
    }

    #[test]
    fn test_binary_payload_that_is_not_a_url_is_rejected() {
        let conn = TcpRequestConnection::new(ConnectionParams::default(), None).unwrap();
        let result = conn.send(&SendRequest::new(vec![0xffu8, 0xfe]));
        assert!(matches!(result, Err(LinkError::InvalidPayload(_))));
    }

    #[test]
    fn test_open_close_need_no_network() {
        let conn = TcpRequestConnection::new(
            ConnectionParams::default().with_name("web"),
            None,
        )
        .unwrap();
        assert!(conn.open());
        assert_eq!(conn.name(), "web");
        assert_eq!(conn.kind(), "net_tcp_request");
        conn.close();
        assert!(!conn.connected());
    }
}
