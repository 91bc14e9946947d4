//! Invalidation request handling.
//!
//! A handler turns one incoming request into a set of revalidations:
//!
//! 1. resolve the request to raw tags
//! 2. hash each tag and extract its paths from the registry
//! 3. dispatch one revalidation per path on its own task
//! 4. report the result through the hooks
//!
//! Dispatch is fire-and-forget unless `wait` is set, in which case the
//! handler awaits every revalidation before answering. Failed revalidations
//! are logged and counted, never reported as a request failure.

use async_trait::async_trait;
use cachetags_core::error::{CacheTagsError, Result};
use cachetags_core::hash::TagHasher;
use cachetags_core::traits::Registry;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// ==============================================================================
// Host Seams
// ==============================================================================

/// Extracts the tags to invalidate from a request.
#[async_trait]
pub trait TagResolver<Req: Sync>: Send + Sync {
    async fn resolve(&self, request: &Req) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
impl<Req, F> TagResolver<Req> for F
where
    Req: Sync,
    F: Fn(&Req) -> anyhow::Result<Vec<String>> + Send + Sync,
{
    async fn resolve(&self, request: &Req) -> anyhow::Result<Vec<String>> {
        self(request)
    }
}

/// Regenerates the cached output of one path.
#[async_trait]
pub trait Revalidator: Send + Sync {
    async fn revalidate(&self, path: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> Revalidator for F
where
    F: Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    async fn revalidate(&self, path: &str) -> anyhow::Result<()> {
        self(path.to_string()).await
    }
}

/// Wrap an async closure as a [`Revalidator`].
pub fn revalidate_with<F, Fut>(f: F) -> impl Revalidator
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    move |path: String| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(path)) }
}

/// Error payload sent by the default error hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The host's response for one invalidation request.
pub trait InvalidationResponse: Send {
    /// Acknowledge a completed invalidation
    fn send_ok(&mut self);

    /// Answer with an error status and body
    fn send_error(&mut self, status: u16, body: ErrorBody);
}

/// Callbacks run once per request after the invalidation settles.
#[async_trait]
pub trait InvalidationHooks<Req, Res>: Send + Sync
where
    Req: Sync,
    Res: InvalidationResponse,
{
    /// Called after every tag was extracted and dispatched
    async fn on_success(&self, request: &Req, response: &mut Res, tags: &[String]) {
        let _ = (request, tags);
        response.send_ok();
    }

    /// Called when resolving tags or extracting paths failed.
    ///
    /// `tags` is `None` when the resolver itself failed.
    async fn on_error(
        &self,
        error: &CacheTagsError,
        request: &Req,
        response: &mut Res,
        tags: Option<&[String]>,
    ) {
        let _ = request;
        error!(error = %error, tags = ?tags, "Cache invalidation failed");
        response.send_error(500, ErrorBody::new(error.to_string()));
    }
}

/// Hooks answering `ok` on success and 500 on failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl<Req: Sync, Res: InvalidationResponse> InvalidationHooks<Req, Res> for DefaultHooks {}

// ==============================================================================
// Configuration
// ==============================================================================

/// Settings of one invalidation handler.
pub struct InvalidatorConfig<Req: Sync, Res: InvalidationResponse> {
    /// Await revalidations before answering. `None` uses the orchestrator default.
    pub wait: Option<bool>,
    pub resolver: Arc<dyn TagResolver<Req>>,
    pub revalidator: Arc<dyn Revalidator>,
    pub hooks: Arc<dyn InvalidationHooks<Req, Res>>,
}

impl<Req, Res> InvalidatorConfig<Req, Res>
where
    Req: Sync + 'static,
    Res: InvalidationResponse + 'static,
{
    /// Create a config with default hooks
    pub fn new(
        resolver: impl TagResolver<Req> + 'static,
        revalidator: impl Revalidator + 'static,
    ) -> Self {
        Self {
            wait: None,
            resolver: Arc::new(resolver),
            revalidator: Arc::new(revalidator),
            hooks: Arc::new(DefaultHooks),
        }
    }

    /// Set wait mode
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Replace the hooks
    pub fn with_hooks(mut self, hooks: impl InvalidationHooks<Req, Res> + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }
}

// ==============================================================================
// Handler
// ==============================================================================

/// What happened while handling one request.
#[derive(Debug, Default)]
pub struct InvalidationOutcome {
    /// Raw tags returned by the resolver
    pub tags: Option<Vec<String>>,
    /// Paths a revalidation was dispatched for, in dispatch order
    pub dispatched: Vec<String>,
    /// Revalidations that failed; only observed in wait mode
    pub failed: usize,
    pub error: Option<CacheTagsError>,
}

impl InvalidationOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Handles invalidation requests against one registry.
pub struct InvalidationHandler<R: ?Sized, Req: Sync, Res: InvalidationResponse> {
    registry: Arc<R>,
    hasher: TagHasher,
    log: bool,
    wait: bool,
    resolver: Arc<dyn TagResolver<Req>>,
    revalidator: Arc<dyn Revalidator>,
    hooks: Arc<dyn InvalidationHooks<Req, Res>>,
}

impl<R, Req, Res> InvalidationHandler<R, Req, Res>
where
    R: Registry + ?Sized,
    Req: Sync,
    Res: InvalidationResponse,
{
    pub(crate) fn new(
        registry: Arc<R>,
        hasher: TagHasher,
        log: bool,
        default_wait: bool,
        config: InvalidatorConfig<Req, Res>,
    ) -> Self {
        Self {
            registry,
            hasher,
            log,
            wait: config.wait.unwrap_or(default_wait),
            resolver: config.resolver,
            revalidator: config.revalidator,
            hooks: config.hooks,
        }
    }

    /// Whether revalidations are awaited before answering
    pub fn waits(&self) -> bool {
        self.wait
    }

    /// Handle one invalidation request, answering through `response`.
    pub async fn handle(&self, request: &Req, response: &mut Res) -> InvalidationOutcome {
        let tags = match self.resolver.resolve(request).await {
            Ok(tags) => tags,
            Err(e) => {
                let error = CacheTagsError::resolution(e);
                self.hooks.on_error(&error, request, response, None).await;
                return InvalidationOutcome {
                    error: Some(error),
                    ..Default::default()
                };
            }
        };

        let mut dispatched = Vec::new();
        let mut handles = Vec::new();

        if let Err(error) = self.invalidate(&tags, &mut dispatched, &mut handles).await {
            self.hooks
                .on_error(&error, request, response, Some(tags.as_slice()))
                .await;
            return InvalidationOutcome {
                tags: Some(tags),
                dispatched,
                failed: 0,
                error: Some(error),
            };
        }

        let failed = if self.wait { settle(handles).await } else { 0 };

        self.hooks.on_success(request, response, &tags).await;

        InvalidationOutcome {
            tags: Some(tags),
            dispatched,
            failed,
            error: None,
        }
    }

    /// Extract every tag in order and dispatch its paths.
    async fn invalidate(
        &self,
        tags: &[String],
        dispatched: &mut Vec<String>,
        handles: &mut Vec<JoinHandle<bool>>,
    ) -> Result<()> {
        for tag in tags {
            let hashed = self.hasher.hash(tag);
            let paths = self.registry.extract(&hashed).await?;

            if self.log {
                info!(tag = %tag, hashed = %hashed, paths = paths.len(), "Invalidating tag");
            }

            for path in paths {
                if self.log {
                    info!(tag = %tag, path = %path, "Revalidating path");
                }
                handles.push(self.dispatch(path.clone()));
                dispatched.push(path);
            }
        }

        Ok(())
    }

    fn dispatch(&self, path: String) -> JoinHandle<bool> {
        let revalidator = Arc::clone(&self.revalidator);
        tokio::spawn(async move {
            match revalidator.revalidate(&path).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(path = %path, error = %e, "Revalidation failed");
                    false
                }
            }
        })
    }
}

/// Await every dispatched revalidation, returning how many failed.
async fn settle(handles: Vec<JoinHandle<bool>>) -> usize {
    join_all(handles)
        .await
        .into_iter()
        .filter(|joined| match joined {
            Ok(succeeded) => !succeeded,
            Err(e) => {
                warn!(error = %e, "Revalidation task aborted");
                true
            }
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorded {
        ok: bool,
        error: Option<(u16, ErrorBody)>,
    }

    impl InvalidationResponse for Recorded {
        fn send_ok(&mut self) {
            self.ok = true;
        }

        fn send_error(&mut self, status: u16, body: ErrorBody) {
            self.error = Some((status, body));
        }
    }

    #[tokio::test]
    async fn test_default_hooks_success() {
        let mut response = Recorded::default();
        DefaultHooks
            .on_success(&(), &mut response, &["t".to_string()])
            .await;
        assert!(response.ok);
    }

    #[tokio::test]
    async fn test_default_hooks_error() {
        let mut response = Recorded::default();
        let error = CacheTagsError::resolution(anyhow::anyhow!("boom"));

        DefaultHooks.on_error(&error, &(), &mut response, None).await;

        assert!(!response.ok);
        assert_eq!(response.error, Some((500, ErrorBody::new("boom"))));
    }

    #[tokio::test]
    async fn test_closure_resolver() {
        let resolver = |request: &String| -> anyhow::Result<Vec<String>> {
            Ok(request.split(',').map(str::to_string).collect())
        };
        let tags = resolver.resolve(&"a,b".to_string()).await.unwrap();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_settle_counts_failures() {
        let handles = vec![
            tokio::spawn(async { true }),
            tokio::spawn(async { false }),
            tokio::spawn(async { true }),
        ];
        assert_eq!(settle(handles).await, 1);
    }

    #[test]
    fn test_error_body_serializes_message() {
        let value = serde_json::to_value(ErrorBody::new("boom")).unwrap();
        assert_eq!(value, serde_json::json!({ "message": "boom" }));
    }
}
