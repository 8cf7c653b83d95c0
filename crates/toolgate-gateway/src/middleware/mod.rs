//! Tool-call middleware chain
//!
//! Every `tools/call` dispatched to a backend passes through this chain:
//! telemetry/logging, secret blocking, the OAuth refresh interceptor, and
//! any user-supplied interceptors, in that order. Non-tool-call requests
//! never enter the chain; the protocol handler forwards them directly.
//!
//! An interceptor can short-circuit the call before dispatch (returning
//! an error-flagged tool result the client sees as a normal, recoverable
//! failure) or rewrite the result after dispatch.

mod logging;
mod oauth_refresh;
mod secrets;

pub use logging::LoggingInterceptor;
pub use oauth_refresh::{OAuthRefreshInterceptor, TokenCoordinator, TokenStatusCoordinator};
pub use secrets::SecretBlockingInterceptor;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Content};
use serde_json::Value;

/// What the chain knows about one tool invocation
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub tool_name: String,
    /// Backend the call routes to; `None` when no association exists
    pub server_name: Option<String>,
    /// Whether that backend carries an OAuth sub-spec
    pub server_has_oauth: bool,
    pub arguments: Option<serde_json::Map<String, Value>>,
}

impl ToolCallContext {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            server_name: None,
            server_has_oauth: false,
            arguments: None,
        }
    }

    pub fn with_server(mut self, server_name: impl Into<String>, has_oauth: bool) -> Self {
        self.server_name = Some(server_name.into());
        self.server_has_oauth = has_oauth;
        self
    }

    pub fn with_arguments(mut self, arguments: Option<serde_json::Map<String, Value>>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// One link in the tool-call chain
#[async_trait]
pub trait ToolInterceptor: Send + Sync {
    /// Runs before dispatch. Returning `Some` short-circuits the call.
    async fn before(&self, _ctx: &ToolCallContext) -> Option<CallToolResult> {
        None
    }

    /// Runs after dispatch (innermost interceptor last).
    async fn after(&self, _ctx: &ToolCallContext, result: CallToolResult) -> CallToolResult {
        result
    }
}

/// Ordered set of interceptors applied around every backend tool call
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ToolInterceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn ToolInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the chain around `dispatch`.
    pub async fn run<F, Fut>(&self, ctx: ToolCallContext, dispatch: F) -> CallToolResult
    where
        F: FnOnce(ToolCallContext) -> Fut,
        Fut: Future<Output = CallToolResult> + Send,
    {
        for interceptor in &self.interceptors {
            if let Some(result) = interceptor.before(&ctx).await {
                return result;
            }
        }

        let mut result = dispatch(ctx.clone()).await;

        for interceptor in self.interceptors.iter().rev() {
            result = interceptor.after(&ctx, result).await;
        }
        result
    }
}

/// Error-flagged tool result: a normal, recoverable, user-visible failure.
pub fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(message.into())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

/// Plain-text success result (used by tests and short-circuit paths).
pub fn text_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(message.into())],
        structured_content: None,
        is_error: Some(false),
        meta: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingInterceptor {
        before_calls: AtomicUsize,
        after_calls: AtomicUsize,
        block: bool,
    }

    impl CountingInterceptor {
        fn new(block: bool) -> Arc<Self> {
            Arc::new(Self {
                before_calls: AtomicUsize::new(0),
                after_calls: AtomicUsize::new(0),
                block,
            })
        }
    }

    #[async_trait]
    impl ToolInterceptor for CountingInterceptor {
        async fn before(&self, _ctx: &ToolCallContext) -> Option<CallToolResult> {
            self.before_calls.fetch_add(1, Ordering::SeqCst);
            self.block.then(|| error_result("blocked"))
        }

        async fn after(&self, _ctx: &ToolCallContext, result: CallToolResult) -> CallToolResult {
            self.after_calls.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn test_chain_passes_through() {
        let first = CountingInterceptor::new(false);
        let second = CountingInterceptor::new(false);
        let chain = InterceptorChain::new(vec![first.clone(), second.clone()]);

        let result = chain
            .run(ToolCallContext::new("echo"), |_| async { text_result("ok") })
            .await;

        assert_eq!(result.is_error, Some(false));
        assert_eq!(first.before_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.after_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_dispatch_and_later_links() {
        let blocker = CountingInterceptor::new(true);
        let downstream = CountingInterceptor::new(false);
        let chain = InterceptorChain::new(vec![blocker.clone(), downstream.clone()]);

        let result = chain
            .run(ToolCallContext::new("echo"), |_| async {
                panic!("dispatch must not run")
            })
            .await;

        assert_eq!(result.is_error, Some(true));
        assert_eq!(downstream.before_calls.load(Ordering::SeqCst), 0);
        assert_eq!(downstream.after_calls.load(Ordering::SeqCst), 0);
    }
}
