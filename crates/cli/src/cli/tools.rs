//! `toolmesh tools`: print the merged catalog.

use tokio_util::sync::CancellationToken;

use tm_domain::config::Config;
use tm_mcp_client::{CompositeClient, ToolDefinition};

pub async fn run(config: Config, json: bool) -> anyhow::Result<()> {
    let client = CompositeClient::from_config(config.mcp);
    let cancel = CancellationToken::new();
    client.initialize_all(&cancel).await;

    let result = client.list_tools(&cancel).await;
    let owners: Vec<Option<String>> = match &result {
        Ok(tools) => tools.iter().map(|t| client.tool_owner(&t.name)).collect(),
        Err(_) => Vec::new(),
    };
    client.shutdown().await;
    let tools = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&*tools)?);
        return Ok(());
    }
    for (tool, owner) in tools.iter().zip(owners) {
        println!("{}", format_tool(tool, owner.as_deref()));
    }
    Ok(())
}

fn format_tool(tool: &ToolDefinition, owner: Option<&str>) -> String {
    let params: Vec<String> = tool
        .parameters
        .iter()
        .map(|(name, p)| {
            if p.required {
                format!("{name}: {}", p.param_type)
            } else {
                format!("{name}?: {}", p.param_type)
            }
        })
        .collect();
    let mut line = format!("{}({})", tool.name, params.join(", "));
    if let Some(owner) = owner {
        line.push_str(&format!("  [{owner}]"));
    }
    if !tool.description.is_empty() {
        line.push_str(&format!("  {}", tool.description));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tm_mcp_client::McpToolDef;

    #[test]
    fn signature_marks_optional_parameters() {
        let def: McpToolDef = serde_json::from_value(json!({
            "name": "search",
            "description": "Full-text search",
            "inputSchema": {
                "type": "object",
                "properties": { "q": { "type": "string" }, "limit": { "type": "integer" } },
                "required": ["q"]
            }
        }))
        .unwrap();
        let tool = ToolDefinition::from(def);
        assert_eq!(
            format_tool(&tool, Some("web")),
            "search(limit?: integer, q: string)  [web]  Full-text search"
        );
    }
}
