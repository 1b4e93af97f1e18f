//! Compliance Normalizer (C3): repairs handshake results and tool catalogs so every
//! message crossing the public boundary conforms to the target MCP revision,
//! regardless of backend quirks. Grounded on the inline normalization the teacher
//! performs ad hoc inside `mcp/proxy.rs::handle_mcp_post`'s `initialize` arm; pulled
//! out here into pure functions per the idempotence law (§8).

use serde_json::{json, Value};
use tracing::warn;

use crate::mcp::types::{HandshakeResult, RawToolDef, ServerCapabilities, ServerInfo, ToolDef};

/// Rule 1: relocate `instructions` to the top level if a backend nested it inside
/// `serverInfo`; omit the field entirely if empty or absent. Idempotent — the
/// transports hand the nested value in separately from the clean `ServerInfo` they
/// build, so running this twice on its own output is a no-op (there is nothing left
/// nested to relocate the second time).
pub fn normalize_handshake_result(
    protocol_version: String,
    mut capabilities: ServerCapabilities,
    server_info: ServerInfo,
    instructions_from_top_level: Option<String>,
    instructions_from_server_info: Option<String>,
) -> HandshakeResult {
    let instructions = instructions_from_top_level
        .filter(|s| !s.is_empty())
        .or_else(|| instructions_from_server_info.filter(|s| !s.is_empty()));

    normalize_capabilities(&mut capabilities);

    HandshakeResult {
        protocol_version,
        capabilities,
        server_info,
        instructions,
    }
}

/// Rule 2: null capability sub-fields that denote presence are coerced to `{}`;
/// capability sub-fields are otherwise left as the backend declared them.
fn normalize_capabilities(capabilities: &mut ServerCapabilities) {
    fn coerce(value: &mut Option<Value>) {
        if matches!(value, Some(Value::Null)) {
            *value = Some(json!({}));
        }
    }
    coerce(&mut capabilities.tools);
    coerce(&mut capabilities.resources);
    coerce(&mut capabilities.prompts);
    coerce(&mut capabilities.logging);
}

/// Rule 3: parse a backend's raw tool definition defensively, dropping (and logging)
/// tools with no name, defaulting `inputSchema` and `description`.
pub fn normalize_tool(raw: RawToolDef, backend_name: &str) -> Option<ToolDef> {
    let name = match raw.name {
        Some(n) if !n.is_empty() => n,
        _ => {
            warn!(backend = backend_name, "dropping tool with no name");
            return None;
        }
    };

    let input_schema = match raw.input_schema {
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(_) | None => json!({ "type": "object" }),
    };

    Some(ToolDef {
        name,
        description: raw.description.unwrap_or_default(),
        input_schema,
    })
}

/// Rule 4: echo the client's requested protocol version if the gateway recognizes
/// it, else fall back to the gateway's primary revision.
pub fn negotiate_protocol_version(requested: &str) -> String {
    use crate::mcp::types::{PROTOCOL_FALLBACK, PROTOCOL_PRIMARY};
    if requested == PROTOCOL_PRIMARY || requested == PROTOCOL_FALLBACK {
        requested.to_string()
    } else {
        PROTOCOL_PRIMARY.to_string()
    }
}

/// Rule 5: map an HTTP status code from an HTTP-transport backend onto the
/// `-32000..-32099` JSON-RPC server-error range.
pub fn http_status_to_json_rpc_code(status: u16) -> i64 {
    if (400..600).contains(&status) {
        -32000 - (status as i64 % 100)
    } else {
        -32000
    }
}

/// Rule 6: synthesize an empty-but-schema-valid result for `resources/list` and
/// `resources/templates/list`, unless the backend's handshake advertised a
/// `resources` capability — in which case the caller should forward the method
/// instead of calling this (the REDESIGN FLAG adopted in §9).
pub fn synthesize_resources_result(method: &str) -> Option<Value> {
    match method {
        "resources/list" => Some(json!({ "resources": [] })),
        "resources/templates/list" => Some(json!({ "resourceTemplates": [] })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::ServerCapabilities;

    #[test]
    fn drops_empty_instructions() {
        let result = normalize_handshake_result(
            "2025-03-26".to_string(),
            ServerCapabilities::default(),
            ServerInfo {
                name: "x".to_string(),
                version: "1".to_string(),
            },
            Some(String::new()),
            None,
        );
        assert!(result.instructions.is_none());
    }

    #[test]
    fn keeps_nonempty_top_level_instructions() {
        let result = normalize_handshake_result(
            "2025-03-26".to_string(),
            ServerCapabilities::default(),
            ServerInfo {
                name: "x".to_string(),
                version: "1".to_string(),
            },
            Some("be nice".to_string()),
            None,
        );
        assert_eq!(result.instructions.as_deref(), Some("be nice"));
    }

    #[test]
    fn falls_back_to_nested_server_info_instructions() {
        let result = normalize_handshake_result(
            "2025-03-26".to_string(),
            ServerCapabilities::default(),
            ServerInfo {
                name: "x".to_string(),
                version: "1".to_string(),
            },
            None,
            Some("nested be nice".to_string()),
        );
        assert_eq!(result.instructions.as_deref(), Some("nested be nice"));
    }

    #[test]
    fn top_level_instructions_win_over_nested() {
        let result = normalize_handshake_result(
            "2025-03-26".to_string(),
            ServerCapabilities::default(),
            ServerInfo {
                name: "x".to_string(),
                version: "1".to_string(),
            },
            Some("top level".to_string()),
            Some("nested".to_string()),
        );
        assert_eq!(result.instructions.as_deref(), Some("top level"));
    }

    #[test]
    fn normalize_is_idempotent_on_capabilities() {
        let mut caps = ServerCapabilities {
            tools: Some(Value::Null),
            resources: None,
            prompts: None,
            logging: None,
        };
        normalize_capabilities(&mut caps);
        let once = caps.tools.clone();
        normalize_capabilities(&mut caps);
        assert_eq!(caps.tools, once);
        assert_eq!(caps.tools, Some(json!({})));
    }

    #[test]
    fn drops_unnamed_tool() {
        let raw = RawToolDef {
            name: None,
            description: Some("no name".to_string()),
            input_schema: None,
        };
        assert!(normalize_tool(raw, "b").is_none());
    }

    #[test]
    fn defaults_schema_and_description() {
        let raw = RawToolDef {
            name: Some("search".to_string()),
            description: None,
            input_schema: None,
        };
        let tool = normalize_tool(raw, "b").unwrap();
        assert_eq!(tool.description, "");
        assert_eq!(tool.input_schema, json!({ "type": "object" }));
    }

    #[test]
    fn negotiate_echoes_supported_version() {
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_protocol_version("1999-01-01"), "2025-03-26");
    }

    #[test]
    fn http_status_maps_into_server_error_range() {
        let code = http_status_to_json_rpc_code(404);
        assert!((-32099..=-32000).contains(&code));
    }
}
