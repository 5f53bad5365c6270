// SPDX-License-Identifier: MIT
//! Span attribute names and size rules.
//!
//! Every attribute the enrichment subscribers write lives in the `mcp.*`
//! namespace; complex payloads are stored as compact JSON strings under
//! `*_json` keys, bounded at [`MAX_ATTRIBUTE_SIZE`] bytes with a companion
//! `{key}_truncated` flag when cut.

use std::borrow::Cow;

use crate::span::ActiveSpan;

/// Maximum UTF-8 byte length of a single attribute value.
pub const MAX_ATTRIBUTE_SIZE: usize = 30 * 1024;

// Session correlation
pub const SESSION_ID: &str = "session.id";

// Agent
pub const AGENT_CLASS: &str = "mcp.agent.class";
pub const AGENT_NAME: &str = "mcp.agent.name";
pub const AGENT_RESULT_JSON: &str = "mcp.agent.result_json";

// Workflow
pub const WORKFLOW_TYPE: &str = "mcp.workflow.type";
pub const WORKFLOW_INPUT_JSON: &str = "mcp.workflow.input_json";
pub const WORKFLOW_OUTPUT_JSON: &str = "mcp.workflow.output_json";

// Tool
pub const TOOL_NAME: &str = "mcp.tool.name";
pub const TOOL_INPUT_JSON: &str = "mcp.tool.input_json";
pub const TOOL_OUTPUT_JSON: &str = "mcp.tool.output_json";

// LLM
pub const LLM_PROVIDER: &str = "mcp.llm.provider";
pub const LLM_MODEL: &str = "mcp.llm.model";
pub const LLM_PROMPT_JSON: &str = "mcp.llm.prompt_json";
pub const LLM_RESPONSE_JSON: &str = "mcp.llm.response_json";
pub const LLM_INPUT_TOKENS: &str = "mcp.llm.input_tokens";
pub const LLM_OUTPUT_TOKENS: &str = "mcp.llm.output_tokens";

// RPC
pub const RPC_METHOD: &str = "mcp.rpc.method";
pub const RPC_ID: &str = "mcp.rpc.id";
pub const RPC_TRANSPORT: &str = "mcp.rpc.transport";
pub const RPC_DURATION_MS: &str = "mcp.rpc.duration_ms";
pub const RPC_REQUEST_JSON: &str = "mcp.rpc.request_json";
pub const RPC_RESPONSE_JSON: &str = "mcp.rpc.response_json";

// Transport
pub const TRANSPORT_STATUS: &str = "mcp.transport.status";

// Resource
pub const RESOURCE_URI: &str = "mcp.resource.uri";
pub const RESOURCE_MIME_TYPE: &str = "mcp.resource.mime_type";
pub const RESOURCE_CONTENT_JSON: &str = "mcp.resource.content_json";

// Prompt
pub const PROMPT_TEMPLATE_ID: &str = "mcp.prompt.template_id";
pub const PROMPT_PARAMETERS_JSON: &str = "mcp.prompt.parameters_json";
pub const PROMPT_RENDERED: &str = "mcp.prompt.rendered";

// Engine / session metadata (read back by the session scan)
pub const ENGINE_TYPE: &str = "mcp.engine.type";
pub const SESSION_TITLE: &str = "mcp.session.title";

// Error
pub const STATUS_CODE: &str = "mcp.status.code";
pub const ERROR_CODE: &str = "mcp.error.code";
pub const ERROR_MESSAGE: &str = "mcp.error.message";

// Dynamic namespaces: mcp.state.<name>_json / mcp.result.<name>_json
pub const STATE_PREFIX: &str = "mcp.state.";
pub const RESULT_PREFIX: &str = "mcp.result.";

/// Bound `value` to at most [`MAX_ATTRIBUTE_SIZE`] UTF-8 bytes.
///
/// Returns the (possibly cut) value and whether a cut happened. The cut
/// lands on a char boundary, so the result is always valid UTF-8 and never
/// longer than the limit. The truncated text is not re-parsed.
pub fn truncate_attribute(value: &str) -> (Cow<'_, str>, bool) {
    if value.len() <= MAX_ATTRIBUTE_SIZE {
        return (Cow::Borrowed(value), false);
    }
    let mut cut = MAX_ATTRIBUTE_SIZE;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    (Cow::Borrowed(&value[..cut]), true)
}

/// Set a `*_json` attribute on `span`, enforcing the size bound.
///
/// When the value is cut, a companion `{key}_truncated = true` attribute is
/// set so consumers know the stored string may not be valid JSON.
pub fn safe_json_attribute(span: &ActiveSpan, key: &str, value: &str) {
    let (bounded, truncated) = truncate_attribute(value);
    if truncated {
        span.set_attribute(format!("{key}_truncated"), true);
    }
    span.set_attribute(key.to_string(), bounded.into_owned());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_values_pass_through() {
        let (v, cut) = truncate_attribute("small");
        assert_eq!(v, "small");
        assert!(!cut);
    }

    #[test]
    fn exactly_at_limit_is_not_truncated() {
        let value = "x".repeat(MAX_ATTRIBUTE_SIZE);
        let (v, cut) = truncate_attribute(&value);
        assert_eq!(v.len(), MAX_ATTRIBUTE_SIZE);
        assert!(!cut);
    }

    #[test]
    fn one_past_limit_is_truncated() {
        let value = "x".repeat(MAX_ATTRIBUTE_SIZE + 1);
        let (v, cut) = truncate_attribute(&value);
        assert_eq!(v.len(), MAX_ATTRIBUTE_SIZE);
        assert!(cut);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 3-byte chars straddling the limit must not split mid-char.
        let value = "€".repeat(MAX_ATTRIBUTE_SIZE / 3 + 10);
        let (v, cut) = truncate_attribute(&value);
        assert!(cut);
        assert!(v.len() <= MAX_ATTRIBUTE_SIZE);
        assert!(std::str::from_utf8(v.as_bytes()).is_ok());
    }
}
