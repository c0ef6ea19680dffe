use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::error::LyoError;
use crate::retry::RetryPolicy;

const BODY_SNIPPET_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            params: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully read response. The body is buffered so a truncated transfer
/// surfaces as a network failure instead of a parse failure downstream.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, LyoError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| LyoError::parse(format!("JSON from {}", self.url), err))
    }
}

#[derive(Clone)]
pub struct RequestClient {
    client: Client,
    timeout: Duration,
    policy: RetryPolicy,
}

impl RequestClient {
    pub fn new(timeout: Duration) -> Result<Self, LyoError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("lyohub/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| LyoError::HttpSetup(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| LyoError::HttpSetup(err.to_string()))?;
        Ok(Self {
            client,
            timeout,
            policy: RetryPolicy::http(),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn get(&self, url: &str) -> Result<HttpResponse, LyoError> {
        self.request(&RequestSpec::get(url))
    }

    /// Sends the request, repeating only on 5xx responses. Client errors and
    /// network failures go straight back to the caller.
    pub fn request(&self, spec: &RequestSpec) -> Result<HttpResponse, LyoError> {
        self.policy
            .run(|| self.attempt(spec), LyoError::is_server_error)
            .inspect_err(|err| error!(url = %spec.url, error = %err, "HTTP request failed"))
    }

    fn attempt(&self, spec: &RequestSpec) -> Result<HttpResponse, LyoError> {
        let mut builder = self
            .client
            .request(spec.method.clone(), &spec.url)
            .headers(spec.headers.clone())
            .timeout(spec.timeout.unwrap_or(self.timeout));
        if !spec.params.is_empty() {
            builder = builder.query(&spec.params);
        }
        if let Some(body) = &spec.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .map_err(|err| network_failure(&spec.url, &err))?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response
            .bytes()
            .map_err(|err| network_failure(&spec.url, &err))?
            .to_vec();
        debug!(%url, status, bytes = body.len(), "HTTP response");

        check_status(HttpResponse { url, status, body })
    }
}

pub fn check_status(response: HttpResponse) -> Result<HttpResponse, LyoError> {
    if (200..400).contains(&response.status) {
        return Ok(response);
    }
    Err(LyoError::HttpStatus {
        url: response.url.clone(),
        status: response.status,
        body: body_snippet(&response.body),
    })
}

pub fn body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(BODY_SNIPPET_CHARS)
        .collect()
}

fn network_failure(url: &str, err: &reqwest::Error) -> LyoError {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection"
    } else if err.is_body() || err.is_decode() {
        "truncated transfer"
    } else {
        "request"
    };
    LyoError::TransientNetwork {
        url: url.to_string(),
        message: format!("{kind}: {err}"),
    }
}
