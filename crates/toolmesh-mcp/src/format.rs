//! Conversion between MCP tool descriptors and LLM function-calling schemas.
//!
//! Tools are exposed to the model as `{plugin}_{tool}`. Names coming back from
//! the model (or from other callers) may also use `{plugin}.{tool}`.

use std::fmt::Write as _;

use serde_json::{json, Value};

use crate::batch::BatchCallResult;
use crate::error::McpError;
use crate::invoker::ToolOutput;
use crate::protocol::McpToolDefinition;

/// Separator used when building combined names.
pub const NAME_SEPARATOR: char = '_';

/// Alternative separator accepted when parsing.
const ALT_SEPARATOR: char = '.';

/// Rendering style for [`build_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextFormat {
    #[default]
    Markdown,
    Plain,
}

pub fn format_combined_name(plugin: &str, tool: &str) -> String {
    format!("{}{}{}", plugin, NAME_SEPARATOR, tool)
}

/// Convert a plugin's tools into OpenAI-style function definitions.
pub fn format_for_function_calling(tools: &[McpToolDefinition], plugin: &str) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let parameters = match &tool.input_schema {
                schema @ Value::Object(_) => schema.clone(),
                _ => json!({ "type": "object", "properties": {} }),
            };
            json!({
                "type": "function",
                "function": {
                    "name": format_combined_name(plugin, &tool.name),
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": parameters,
                }
            })
        })
        .collect()
}

/// Split a combined name into `(plugin, tool)`.
///
/// Splits at the first `_`; names without one split at the first `.`.
/// Plugin names that themselves contain `_` need a registry lookup, see
/// `McpSessionManager::resolve_combined_name`.
pub fn parse_combined_name(name: &str) -> Result<(String, String), McpError> {
    let split = name
        .split_once(NAME_SEPARATOR)
        .or_else(|| name.split_once(ALT_SEPARATOR));
    match split {
        Some((plugin, tool)) if !plugin.is_empty() && !tool.is_empty() => {
            Ok((plugin.to_string(), tool.to_string()))
        }
        _ => Err(McpError::InvalidToolName(name.to_string())),
    }
}

/// Split a combined name, preferring the longest known plugin name it starts with.
pub fn resolve_combined_name(
    name: &str,
    plugins: &[String],
) -> Result<(String, String), McpError> {
    let matched = plugins
        .iter()
        .filter_map(|plugin| {
            let rest = name.strip_prefix(plugin.as_str())?;
            let tool = rest
                .strip_prefix(NAME_SEPARATOR)
                .or_else(|| rest.strip_prefix(ALT_SEPARATOR))?;
            (!tool.is_empty()).then_some((plugin, tool))
        })
        .max_by_key(|(plugin, _)| plugin.len());

    match matched {
        Some((plugin, tool)) => Ok((plugin.clone(), tool.to_string())),
        None => parse_combined_name(name),
    }
}

/// Render call results as a block of text for embedding in a prompt.
pub fn build_context(results: &[BatchCallResult], format: ContextFormat) -> String {
    let mut out = String::new();
    for result in results {
        match format {
            ContextFormat::Markdown => write_markdown(&mut out, result),
            ContextFormat::Plain => write_plain(&mut out, result),
        }
    }
    out.trim_end().to_string()
}

fn write_markdown(out: &mut String, result: &BatchCallResult) {
    if result.success {
        let _ = writeln!(out, "### ✅ {}\n", result.name);
        match &result.result {
            Some(output) => {
                let _ = writeln!(out, "```json\n{}\n```\n", pretty_output(output));
            }
            None => out.push_str("_(no output)_\n\n"),
        }
    } else {
        let _ = writeln!(out, "### ❌ {}\n", result.name);
        let _ = writeln!(
            out,
            "Error: {}\n",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn write_plain(out: &mut String, result: &BatchCallResult) {
    if result.success {
        let body = result
            .result
            .as_ref()
            .map(compact_output)
            .unwrap_or_default();
        let _ = writeln!(out, "[OK] {}: {}", result.name, body);
    } else {
        let _ = writeln!(
            out,
            "[FAILED] {}: {}",
            result.name,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn output_value(output: &ToolOutput) -> Value {
    match output {
        // Tools often return JSON as text; show it structured when it parses.
        ToolOutput::Text { text } => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        ToolOutput::Image { data, mime_type } => json!({
            "image": mime_type,
            "bytes_base64": data.len(),
        }),
        ToolOutput::Structured { content } => content.clone(),
    }
}

fn pretty_output(output: &ToolOutput) -> String {
    let value = output_value(output);
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

fn compact_output(output: &ToolOutput) -> String {
    match output {
        ToolOutput::Text { text } => text.clone(),
        _ => output_value(output).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_calling_shape() {
        let tools = vec![
            McpToolDefinition::new("search")
                .with_description("Search notes")
                .with_input_schema(json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                })),
            McpToolDefinition::new("list").with_input_schema(Value::Null),
        ];

        let functions = format_for_function_calling(&tools, "notes");
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0]["type"], "function");
        assert_eq!(functions[0]["function"]["name"], "notes_search");
        assert_eq!(functions[0]["function"]["description"], "Search notes");
        assert_eq!(functions[0]["function"]["parameters"]["required"][0], "query");

        assert_eq!(functions[1]["function"]["name"], "notes_list");
        assert_eq!(functions[1]["function"]["description"], "");
        assert_eq!(functions[1]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_parse_combined_name() {
        assert_eq!(
            parse_combined_name("search_web_query").unwrap(),
            ("search".to_string(), "web_query".to_string())
        );
        assert_eq!(
            parse_combined_name("search.web").unwrap(),
            ("search".to_string(), "web".to_string())
        );
        // The underscore takes precedence over the dot.
        assert_eq!(
            parse_combined_name("search.web_query").unwrap(),
            ("search.web".to_string(), "query".to_string())
        );
    }

    #[test]
    fn test_parse_combined_name_rejects_bare_names() {
        let err = parse_combined_name("search").unwrap_err();
        assert!(matches!(err, McpError::InvalidToolName(_)));
        assert!(err.to_string().contains("search"));

        assert!(parse_combined_name("_tool").is_err());
        assert!(parse_combined_name("plugin_").is_err());
    }

    #[test]
    fn test_resolve_prefers_longest_plugin() {
        let plugins = vec!["web".to_string(), "web_search".to_string()];
        assert_eq!(
            resolve_combined_name("web_search_query", &plugins).unwrap(),
            ("web_search".to_string(), "query".to_string())
        );
        assert_eq!(
            resolve_combined_name("web.fetch", &plugins).unwrap(),
            ("web".to_string(), "fetch".to_string())
        );
        // Unknown plugins fall back to plain splitting.
        assert_eq!(
            resolve_combined_name("notes_list", &plugins).unwrap(),
            ("notes".to_string(), "list".to_string())
        );
        assert!(resolve_combined_name("web", &plugins).is_err());
    }

    fn ok(name: &str, output: ToolOutput) -> BatchCallResult {
        BatchCallResult::success("1", name, Some(output))
    }

    #[test]
    fn test_markdown_context() {
        let results = vec![
            ok(
                "notes_search",
                ToolOutput::Text {
                    text: r#"{"hits":1}"#.to_string(),
                },
            ),
            BatchCallResult::failure("2", "notes_delete", "permission denied"),
        ];

        let context = build_context(&results, ContextFormat::Markdown);
        assert!(context.contains("### ✅ notes_search"));
        assert!(context.contains("\"hits\": 1"));
        assert!(context.contains("### ❌ notes_delete"));
        assert!(context.contains("Error: permission denied"));
    }

    #[test]
    fn test_plain_context() {
        let results = vec![
            ok(
                "notes_search",
                ToolOutput::Text {
                    text: "two notes".to_string(),
                },
            ),
            ok(
                "notes_stats",
                ToolOutput::Structured {
                    content: json!({"count": 2}),
                },
            ),
            BatchCallResult::failure("3", "notes_delete", "permission denied"),
        ];

        let context = build_context(&results, ContextFormat::Plain);
        assert_eq!(
            context,
            "[OK] notes_search: two notes\n\
             [OK] notes_stats: {\"count\":2}\n\
             [FAILED] notes_delete: permission denied"
        );
    }
}
