//! Naming rules for the merged namespace.
//!
//! Tools are keyed by `backend--tool`. Overrides may rename or re-describe a
//! tool at the routing boundary; the qualified name stays the internal key.
//! Resources, prompts and templates keep their own keys and only get a
//! `[backend]` marker in their human-readable text.

use rmcp::model::Tool;

use crate::config::ToolOverride;

/// Separator between backend name and local tool name.
pub const SEPARATOR: &str = "--";

/// Build the qualified name for a backend's tool.
/// E.g., backend="files", tool="read_file" -> "files--read_file"
pub fn qualify(backend: &str, local_name: &str) -> String {
    format!("{backend}{SEPARATOR}{local_name}")
}

/// Split a qualified name into (backend, local_name) at the first separator.
/// Backend names never contain the separator, so the first one is the boundary.
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(SEPARATOR)
}

/// The name a client sees for a tool.
pub fn exposed_name<'a>(qualified: &'a str, policy: Option<&'a ToolOverride>) -> &'a str {
    policy
        .and_then(|p| p.name.as_deref())
        .unwrap_or(qualified)
}

/// Present a backend tool the way clients see it: exposed name, exposed or
/// original description, schema untouched.
pub fn expose_tool(qualified: &str, mut tool: Tool, policy: Option<&ToolOverride>) -> Tool {
    tool.name = exposed_name(qualified, policy).to_string().into();
    if let Some(description) = policy.and_then(|p| p.description.as_deref()) {
        tool.description = Some(description.to_string().into());
    }
    tool
}

/// Prefix human-readable text with the owning backend.
pub fn tag_with_backend(backend: &str, text: &str) -> String {
    format!("[{backend}] {text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn make_tool(name: &str, description: Option<&str>) -> Tool {
        let schema = Arc::new(
            json!({"type": "object", "properties": {"path": {"type": "string"}}})
                .as_object()
                .unwrap()
                .clone(),
        );
        Tool {
            name: name.to_string().into(),
            title: None,
            description: description.map(|d| d.to_string().into()),
            input_schema: schema,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("files", "read_file"), "files--read_file");
    }

    #[test]
    fn test_qualified_names_distinct_for_distinct_backends() {
        assert_ne!(qualify("a", "t"), qualify("b", "t"));
    }

    #[test]
    fn test_split_roundtrip() {
        let qualified = qualify("files", "read--file");
        assert_eq!(split_qualified(&qualified), Some(("files", "read--file")));
    }

    #[test]
    fn test_split_no_separator() {
        assert!(split_qualified("read_file").is_none());
    }

    #[test]
    fn test_expose_without_override_keeps_description() {
        let tool = make_tool("read_file", Some("Read a file"));
        let exposed = expose_tool("files--read_file", tool, None);
        assert_eq!(exposed.name.as_ref(), "files--read_file");
        assert_eq!(exposed.description.as_deref(), Some("Read a file"));
    }

    #[test]
    fn test_expose_with_override() {
        let tool = make_tool("read_file", Some("Read a file"));
        let schema_before = tool.input_schema.clone();
        let policy = ToolOverride {
            enabled: true,
            name: Some("read".into()),
            description: Some("Read anything".into()),
        };
        let exposed = expose_tool("files--read_file", tool, Some(&policy));
        assert_eq!(exposed.name.as_ref(), "read");
        assert_eq!(exposed.description.as_deref(), Some("Read anything"));
        assert_eq!(exposed.input_schema, schema_before);
    }

    #[test]
    fn test_override_without_name_keeps_qualified_name() {
        let policy = ToolOverride {
            description: Some("d".into()),
            ..ToolOverride::default()
        };
        assert_eq!(exposed_name("files--read_file", Some(&policy)), "files--read_file");
    }

    #[test]
    fn test_tag_with_backend() {
        assert_eq!(tag_with_backend("docs", "Guides"), "[docs] Guides");
    }
}
