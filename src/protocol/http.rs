//! HTTP dispatch surface.
//!
//! Routing, TLS, and connection handling live outside this crate; what
//! arrives here is request metadata plus the body bytes, and what leaves is a
//! status, headers, optional trailers, and a body stream. `GitServer::handle`
//! classifies the URL into one of the five operations (pull advertisement,
//! push advertisement, upload-pack, receive-pack, browse), runs the
//! authorization callback, checks the repository handle out of the cache, and
//! delegates to the protocol handlers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::{
    browse,
    config::{AuthorizationLevel, GitOperation, RequestContext, ServerConfig, ServerHooks},
    errors::GitError,
    lockfile::LockfileManager,
    protocol::{
        discovery::{discover_references, render_advertisement},
        receive::receive_pack,
        types::ServiceType,
        upload::upload_pack,
    },
    repository::{RepositoryCache, RepositoryHandle, RepositoryOpener},
};

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CACHE_CONTROL: &str = "Cache-Control";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

/// Request metadata plus body, as handed over by the embedding HTTP stack.
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub context: RequestContext,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Self {
        let (path, query) = url.split_once('?').unwrap_or((url, ""));
        Self {
            method,
            path: path.to_string(),
            query: query.to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
            context: RequestContext::new(),
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// Response body, either fully materialized or streaming.
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    Stream(BoxStream<'static, Result<Bytes, GitError>>),
}

impl ResponseBody {
    /// Drain the body into one buffer (tests and small responses).
    pub async fn collect(self) -> Result<Bytes, GitError> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub trailers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl Response {
    fn ok(content_type: &str, body: ResponseBody) -> Self {
        Self {
            status: 200,
            headers: vec![(CONTENT_TYPE.to_string(), content_type.to_string())],
            trailers: Vec::new(),
            body,
        }
    }

    fn no_cache(mut self) -> Self {
        self.headers
            .push((CACHE_CONTROL.to_string(), "no-cache".to_string()));
        self
    }

    /// Error rendering drops any accumulated headers so a failure body never
    /// rides on success metadata.
    fn from_error(error: &GitError) -> Self {
        Self {
            status: error.http_status(),
            headers: vec![(CONTENT_TYPE.to_string(), "text/plain".to_string())],
            trailers: Vec::new(),
            body: ResponseBody::Bytes(Bytes::from(format!("{error}\n"))),
        }
    }
}

/// What a URL classified into.
enum Route {
    InfoRefs(ServiceType),
    UploadPack,
    ReceivePack,
    Browse(browse::BrowseRoute),
}

/// The server: configuration, hook surface, and the shared handle/lock pools.
pub struct GitServer {
    config: ServerConfig,
    hooks: Arc<dyn ServerHooks>,
    repositories: RepositoryCache,
}

impl GitServer {
    pub fn new(
        config: ServerConfig,
        hooks: Arc<dyn ServerHooks>,
        opener: Arc<dyn RepositoryOpener>,
    ) -> Self {
        let locks = Arc::new(LockfileManager::new());
        Self {
            config,
            hooks,
            repositories: RepositoryCache::new(opener, locks),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Test teardown for the handle cache.
    pub fn clear_cache(&self) {
        self.repositories.clear();
    }

    /// Handle one request end to end. Never fails: errors become status
    /// responses.
    pub async fn handle(&self, request: Request) -> Response {
        let ctx = self.hooks.request_context(request.context.clone());
        match self.dispatch(&request, &ctx).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    method = ?request.method,
                    path = %request.path,
                    error = %error,
                    "request failed"
                );
                Response::from_error(&error)
            }
        }
    }

    async fn dispatch(
        &self,
        request: &Request,
        ctx: &RequestContext,
    ) -> Result<Response, GitError> {
        let (repo_name, route) = self.classify(request)?;
        let operation = match route {
            Route::InfoRefs(ServiceType::UploadPack) | Route::UploadPack => GitOperation::Pull,
            Route::InfoRefs(ServiceType::ReceivePack) | Route::ReceivePack => GitOperation::Push,
            Route::Browse(_) => GitOperation::Browse,
        };

        let level = self.hooks.authorize(ctx, &repo_name, operation).await;
        match operation {
            GitOperation::Pull | GitOperation::Browse if !level.can_pull() => {
                return Err(GitError::Forbidden);
            }
            GitOperation::Push if !level.can_push() => {
                return Err(GitError::Forbidden);
            }
            _ => {}
        }

        let repo_path = self.physical_path(&repo_name);
        tracing::debug!(repo = %repo_path.display(), ?operation, "dispatching");
        let mut handle = self.repositories.open(&repo_path).await?;
        let result = self
            .run_route(request, ctx, route, level, &mut handle)
            .await;
        let pushed = matches!(&result, Ok((_, true)));
        self.repositories.release(handle)?;
        if pushed {
            self.repositories.evict(&repo_path);
        }

        let mut response = result?.0;
        if request.method == Method::Head {
            response.body = ResponseBody::Empty;
        }
        Ok(response)
    }

    async fn run_route(
        &self,
        request: &Request,
        ctx: &RequestContext,
        route: Route,
        level: AuthorizationLevel,
        handle: &mut RepositoryHandle,
    ) -> Result<(Response, bool), GitError> {
        match route {
            Route::InfoRefs(service) => {
                let result = discover_references(handle, self.hooks.as_ref(), level).await?;
                let body = render_advertisement(&result, service)?;
                let content_type = match service {
                    ServiceType::UploadPack => "application/x-git-upload-pack-advertisement",
                    ServiceType::ReceivePack => "application/x-git-receive-pack-advertisement",
                };
                Ok((
                    Response::ok(content_type, ResponseBody::Bytes(body)).no_cache(),
                    false,
                ))
            }
            Route::UploadPack => {
                let result = upload_pack(handle.odb_arc(), ctx, request.body.clone()).await?;
                let head = futures::stream::iter([Ok(result.head)]);
                let body: BoxStream<'static, Result<Bytes, GitError>> = match result.pack {
                    Some(pack) => head.chain(pack.map(|chunk| Ok(Bytes::from(chunk)))).boxed(),
                    None => head.boxed(),
                };
                Ok((
                    Response::ok(
                        "application/x-git-upload-pack-result",
                        ResponseBody::Stream(body),
                    )
                    .no_cache(),
                    false,
                ))
            }
            Route::ReceivePack => {
                let outcome = receive_pack(
                    handle,
                    ctx,
                    self.hooks.as_ref(),
                    &self.config,
                    level,
                    request.body.clone(),
                )
                .await?;
                let body = match outcome.report {
                    Some(report) => ResponseBody::Bytes(report),
                    None => ResponseBody::Empty,
                };
                Ok((
                    Response::ok("application/x-git-receive-pack-result", body).no_cache(),
                    true,
                ))
            }
            Route::Browse(route) => {
                let accept_octet = request
                    .header("accept")
                    .is_some_and(|accept| accept.contains("application/octet-stream"));
                let rendered =
                    browse::render(handle, ctx, self.hooks.as_ref(), level, route, accept_octet)
                        .await?;
                let mut response = Response::ok(rendered.content_type, ResponseBody::Bytes(rendered.body));
                response.trailers = rendered.trailers;
                Ok((response, false))
            }
        }
    }

    fn classify(&self, request: &Request) -> Result<(String, Route), GitError> {
        let path = request.path.trim_start_matches('/');
        let segments: Vec<&str> = path.split('/').collect();
        let repo = *segments
            .first()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GitError::not_found(request.path.clone()))?;
        if repo.starts_with('.') {
            return Err(GitError::not_found(request.path.clone()));
        }
        let rest = &segments[1..];

        let route = match (request.method, rest) {
            (Method::Get, ["info", "refs"]) => {
                let service = query_param(&request.query, "service")
                    .ok_or_else(|| GitError::bad_request("missing service parameter"))?;
                Route::InfoRefs(ServiceType::from_str(&service)?)
            }
            (Method::Post, ["git-upload-pack"]) => Route::UploadPack,
            (Method::Post, ["git-receive-pack"]) => Route::ReceivePack,
            (Method::Get | Method::Head, _) if !rest.is_empty() && rest[0].starts_with('+') => {
                if !self.config.enable_browse {
                    return Err(GitError::not_found(request.path.clone()));
                }
                Route::Browse(browse::BrowseRoute::parse(rest)?)
            }
            _ => return Err(GitError::not_found(request.path.clone())),
        };
        Ok((repo.to_string(), route))
    }

    fn physical_path(&self, repo: &str) -> PathBuf {
        self.config
            .root_path
            .join(format!("{repo}{}", self.config.repository_suffix))
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
