//! Tool-call logging and telemetry interceptor

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::CallToolResult;
use tracing::{debug, info};

use crate::metrics::MetricsRegistry;

use super::{ToolCallContext, ToolInterceptor};

/// Logs every tool call and feeds the telemetry counters
pub struct LoggingInterceptor {
    metrics: Arc<MetricsRegistry>,
}

impl LoggingInterceptor {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl ToolInterceptor for LoggingInterceptor {
    async fn before(&self, ctx: &ToolCallContext) -> Option<CallToolResult> {
        self.metrics.record_tool_call();
        info!(
            tool = %ctx.tool_name,
            server = ctx.server_name.as_deref().unwrap_or("-"),
            "call_tool"
        );
        None
    }

    async fn after(&self, ctx: &ToolCallContext, result: CallToolResult) -> CallToolResult {
        let is_error = result.is_error.unwrap_or(false);
        if is_error {
            self.metrics.record_tool_error();
        }
        debug!(
            tool = %ctx.tool_name,
            is_error = is_error,
            content_blocks = result.content.len(),
            "call_tool result"
        );
        result
    }
}
