use std::time::Duration;

use async_trait::async_trait;
use ballotbox_shared::Error;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::trace;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Who a transport speaks for. A transport is bound to exactly one role and
/// its static API key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Voter,
}

#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub path: &'static str,
    pub query: Vec<(&'static str, String)>,
    pub body: Option<Value>,
    pub bearer: Option<String>,
}

impl ApiRequest {
    pub fn get(path: &'static str) -> Self {
        ApiRequest {
            method: Method::Get,
            path,
            query: vec![],
            body: None,
            bearer: None,
        }
    }

    pub fn post(path: &'static str, body: Value) -> Self {
        ApiRequest {
            method: Method::Post,
            path,
            query: vec![],
            body: Some(body),
            bearer: None,
        }
    }

    pub fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    pub(crate) fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }
}

#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The wire to the election authority.
///
/// Implementations only move bytes: they return `Err` for transport failures
/// and hand every HTTP status back to the caller untouched.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, Error>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    host: String,
    role: Role,
}

impl HttpTransport {
    pub fn new(
        host: impl AsRef<str>,
        role: Role,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key)
            .map_err(|_| Error::Config("API key is not a valid header value".into()))?;
        key.set_sensitive(true);
        headers.insert(API_KEY_HEADER, key);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            host: host.as_ref().trim_end_matches('/').to_string(),
            role,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        let url = format!("{}{}", self.host, request.path);
        trace!("{:?} {:?} {}", self.role, request.method, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        let res = builder.send().await?;
        let status = res.status().as_u16();
        let text = res.text().await?;
        // Error pages are not always JSON; keep them as a bare message.
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ApiResponse { status, body })
    }
}
