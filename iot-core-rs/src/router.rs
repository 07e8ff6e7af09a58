//! Local request router
//!
//! Routes live under a base path (`/api/v1/` by default). Routes registered
//! as [`Access::Authenticated`] require the `x-api-key` header to match the
//! configured key; without a configured key every route is open.
//!
//! Request bodies arrive as a stream of byte chunks so the update pipeline
//! can write an image without buffering it.

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::LifecycleContext;
use crate::error::CoreError;

pub const DEFAULT_BASE_PATH: &str = "/api/v1/";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const REBOOT_ROUTE: &str = "reboot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// Whether a route sits behind the API key gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
}

/// Failure while receiving a request body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("Peer disconnected")]
    Disconnected,

    #[error("Receive timed out")]
    Timeout,

    #[error("Body exceeds {0} bytes")]
    TooLarge(usize),
}

pub type Body = BoxStream<'static, Result<Vec<u8>, BodyError>>;

/// Incoming request
pub struct Request {
    pub method: Method,
    pub path: String,
    headers: HashMap<String, String>,
    pub content_length: Option<usize>,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HashMap::new(),
            content_length: None,
            body: stream::empty().boxed(),
        }
    }

    /// Header names are case-insensitive
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Complete body delivered in `chunk` sized pieces
    pub fn with_body(mut self, body: Vec<u8>, chunk: usize) -> Self {
        self.content_length = Some(body.len());
        let chunks: Vec<Result<Vec<u8>, BodyError>> = body
            .chunks(chunk.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        self.body = stream::iter(chunks).boxed();
        self
    }

    /// Streamed body with a declared length
    pub fn with_stream(mut self, body: Body, content_length: Option<usize>) -> Self {
        self.body = body;
        self.content_length = content_length;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Collect the body, failing past `limit` bytes
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, BodyError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            if out.len() + chunk.len() > limit {
                return Err(BodyError::TooLarge(limit));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// JSON response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::ok(json!({ "status": "Success", "message": message.into() }))
    }

    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "status": "Failure", "message": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Route registration, as offered to subsystems
pub trait Router {
    fn register_route(
        &mut self,
        path: &str,
        method: Method,
        access: Access,
        handler: Handler,
    ) -> Result<(), CoreError>;
}

struct Route {
    access: Access,
    handler: Handler,
}

/// In-process route table
pub struct RouteTable {
    base: String,
    api_key: Option<String>,
    routes: HashMap<(Method, String), Route>,
}

impl RouteTable {
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self {
            base,
            api_key: None,
            routes: HashMap::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full path for a route name
    pub fn full_path(&self, path: &str) -> String {
        format!("{}{}", self.base, path.trim_start_matches('/'))
    }

    /// Registered routes as `(method, full path)`, sorted
    pub fn routes(&self) -> Vec<(Method, String)> {
        let mut routes: Vec<_> = self.routes.keys().cloned().collect();
        routes.sort_by(|a, b| a.1.cmp(&b.1).then((a.0 as u8).cmp(&(b.0 as u8))));
        routes
    }

    fn authorized(&self, request: &Request) -> bool {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER) == Some(key.as_str()),
            None => true,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let key = (request.method, request.path.clone());
        let Some(route) = self.routes.get(&key) else {
            debug!("Router: No route for {} {}", request.method, request.path);
            return Response::failure(404, "not found");
        };

        if route.access == Access::Authenticated && !self.authorized(&request) {
            warn!("Router: Rejected {} {} (bad api key)", request.method, request.path);
            return Response::failure(401, "unauthorized");
        }

        debug!("Router: {} {}", request.method, request.path);
        (route.handler)(request).await
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PATH)
    }
}

impl Router for RouteTable {
    fn register_route(
        &mut self,
        path: &str,
        method: Method,
        access: Access,
        handler: Handler,
    ) -> Result<(), CoreError> {
        let full = self.full_path(path);
        let key = (method, full.clone());
        if self.routes.contains_key(&key) {
            return Err(CoreError::DuplicateRoute(format!("{} {}", method, full)));
        }
        info!("Router: Registered {} {}", method, full);
        self.routes.insert(key, Route { access, handler });
        Ok(())
    }
}

/// `GET reboot`: answer, then restart after `delay`
pub fn register_reboot(
    router: &mut dyn Router,
    ctx: Arc<LifecycleContext>,
    delay: Duration,
) -> Result<(), CoreError> {
    router.register_route(
        REBOOT_ROUTE,
        Method::Get,
        Access::Authenticated,
        handler(move |_request| {
            let ctx = ctx.clone();
            async move {
                ctx.request_restart(delay);
                Response::ok(json!({ "status": "Success" }))
            }
        }),
    )
}
