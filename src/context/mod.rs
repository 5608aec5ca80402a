//! Per-request context — the mutable record flowing through the pipeline.
//!
//! A [`Context`] is created fresh for every operation, dispatched through the
//! handler chain, and discarded once the chain settles; its final shape (body,
//! status) becomes the operation's result. Handlers reach back into the owning
//! coordinator through [`Context::coordinator`], which is how the in-memory
//! cache adapter serves reads out of the coordinator's own map.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::Recache;

/// Status sentinel meaning "value unchanged" — a read settling with this
/// status reuses the cached value instead of overwriting it.
pub const NOT_MODIFIED: u16 = 304;

/// Request verb, mapped onto HTTP-like semantics.
///
/// Reads go through the in-flight table and refresh the cache; writes
/// invalidate the written key (and everything it prefixes) instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Read a resource.
    Get,
    /// Update a resource (write).
    Put,
    /// Create a resource (write).
    Post,
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
        }
    }

    /// Returns `true` for the read verb.
    pub fn is_read(self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized method string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown method `{0}`")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            other => Err(UnknownMethod(other.to_owned())),
        }
    }
}

/// Route parameters extracted from the matched pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    map: HashMap<String, String>,
}

impl Params {
    /// Create an empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a captured parameter.
    pub fn insert(&mut self, name: String, value: String) {
        self.map.insert(name, value);
    }

    /// Look up a captured parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Remove a captured parameter.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.map.remove(name)
    }

    /// Number of captured parameters.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Header-like option bag carried by a request.
///
/// The conditional-fetch marker is typed; anything else rides in the free-form
/// header map for adapters to interpret. The marker is advisory only — the
/// core never cancels or retries based on it.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Conditional-fetch bound: adapters may answer [`NOT_MODIFIED`] when the
    /// resource has not changed since this instant.
    pub if_modified_since: Option<DateTime<Utc>>,
    /// Free-form header-like entries for adapters.
    pub headers: HashMap<String, String>,
}

impl RequestOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the conditional-fetch marker, mirroring it into the
    /// `If-Modified-Since` header for adapters that only read headers.
    pub fn if_modified_since(mut self, instant: DateTime<Utc>) -> Self {
        self.headers
            .insert("If-Modified-Since".to_owned(), instant.to_rfc2822());
        self.if_modified_since = Some(instant);
        self
    }

    /// Add a free-form header entry.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Raw request data handed to the context builder.
#[derive(Debug, Clone)]
pub struct RequestData {
    /// Request verb.
    pub method: Method,
    /// Canonical resource identifier.
    pub url: String,
    /// Request body for writes.
    pub input: Option<Value>,
    /// Header-like options.
    pub options: RequestOptions,
}

impl RequestData {
    /// A read request.
    pub fn read(url: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            input: None,
            options,
        }
    }

    /// A write request carrying `input`.
    pub fn write(
        method: Method,
        url: impl Into<String>,
        input: Value,
        options: RequestOptions,
    ) -> Self {
        Self {
            method,
            url: url.into(),
            input: Some(input),
            options,
        }
    }
}

/// Mutable request record dispatched through the pipeline.
///
/// Created fresh per request by the owning [`Recache`], discarded after the
/// pipeline settles.
pub struct Context {
    coordinator: Recache,
    method: Method,
    url: String,
    pathname: String,
    params: Params,
    input: Option<Value>,
    body: Option<Value>,
    status: Option<u16>,
    options: RequestOptions,
}

impl Context {
    /// Build a context from raw request data, attaching the owning
    /// coordinator.
    pub fn new(coordinator: Recache, data: RequestData) -> Self {
        let pathname = data
            .url
            .split_once('?')
            .map_or(data.url.as_str(), |(path, _)| path)
            .to_owned();
        Self {
            coordinator,
            method: data.method,
            url: data.url,
            pathname,
            params: Params::new(),
            input: data.input,
            body: None,
            status: None,
            options: data.options,
        }
    }

    /// The coordinator this request belongs to.
    pub fn coordinator(&self) -> &Recache {
        &self.coordinator
    }

    /// Request verb.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Canonical url (pathname plus serialized query).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pathname portion of the url (everything before `?`), the part route
    /// patterns match against.
    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// Parameters captured by the matched route, empty until a route matches.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Replace the captured parameters (done by the pipeline on route match).
    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// Request body for writes.
    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    /// Take ownership of the request body.
    pub fn take_input(&mut self) -> Option<Value> {
        self.input.take()
    }

    /// Response body, set by a terminal handler.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Set the response body.
    pub fn set_body(&mut self, body: Value) {
        self.body = Some(body);
    }

    /// Take ownership of the response body.
    pub fn take_body(&mut self) -> Option<Value> {
        self.body.take()
    }

    /// Response status, if a handler set one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Set the response status ([`NOT_MODIFIED`] short-circuits cache
    /// overwrite on reads).
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Header-like options carried by this request.
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("status", &self.status)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}
