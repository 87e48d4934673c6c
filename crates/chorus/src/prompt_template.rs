use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tera::{Context, Error as TeraError, Tera};

use crate::models::tool::Tool;

const LOCAL_TOOLS_TEMPLATE: &str = include_str!("prompts/local_tools.md");

/// Get the path to the prompts directory
fn prompts_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir).join("src").join("prompts")
}

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

pub fn load_prompt_file<T: Serialize>(
    template_file: impl Into<PathBuf>,
    context_data: &T,
) -> Result<String, TeraError> {
    let template_path = template_file.into();
    // if the template_file doesn't exist, try to load it from the prompts directory
    let file_path = if !template_path.exists() {
        prompts_dir().join(template_path)
    } else {
        template_path
    };

    let template_content = fs::read_to_string(file_path)
        .map_err(|e| TeraError::chain("Failed to read template file", e))?;
    load_prompt(&template_content, context_data)
}

#[derive(Serialize)]
struct LocalToolsContext<'a> {
    system_prompt: &'a str,
    tools: &'a [Tool],
    example_tool: &'a str,
}

/// System prompt for a backend without native tool calling, describing the
/// available tools and the textual convention for invoking one.
///
/// `template_file` replaces the bundled template when given.
pub fn local_tools_prompt(
    system_prompt: &str,
    tools: &[Tool],
    template_file: Option<&PathBuf>,
) -> Result<String, TeraError> {
    let context = LocalToolsContext {
        system_prompt,
        tools,
        example_tool: tools
            .first()
            .map(|t| t.name.as_str())
            .unwrap_or("brave_web_search"),
    };
    match template_file {
        Some(path) => load_prompt_file(path.clone(), &context),
        None => load_prompt(LOCAL_TOOLS_TEMPLATE, &context),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_load_prompt() {
        let template = "Hello, {{ name }}! You are {{ age }} years old.";
        let mut context = HashMap::new();
        context.insert("name".to_string(), "Alice".to_string());
        context.insert("age".to_string(), 30.to_string());

        let result = load_prompt(template, &context).unwrap();
        assert_eq!(result, "Hello, Alice! You are 30 years old.");
    }

    #[test]
    fn test_load_prompt_missing_variable() {
        let template = "Hello, {{ name }}! You are {{ age }} years old.";
        let mut context = HashMap::new();
        context.insert("name".to_string(), "Alice".to_string());
        let result = load_prompt(template, &context);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_prompt_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test_template.txt");
        fs::write(&file_path, "Hello, {{ name }}!").unwrap();

        let mut context = HashMap::new();
        context.insert("name".to_string(), "Bob".to_string());

        let result = load_prompt_file(file_path, &context).unwrap();
        assert_eq!(result, "Hello, Bob!");
    }

    #[test]
    fn test_load_prompt_file_missing_file() {
        let context: HashMap<String, String> = HashMap::new();
        let result = load_prompt_file(PathBuf::from("non_existent_template.txt"), &context);
        assert!(result.is_err());
    }

    #[test]
    fn test_local_tools_prompt() {
        let tools = vec![Tool::new(
            "brave_web_search",
            "Search the web",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        )];

        let prompt = local_tools_prompt("You are terse.", &tools, None).unwrap();

        assert!(prompt.starts_with("You are terse."));
        assert!(prompt.contains("- brave_web_search: Search the web\n"));
        assert!(prompt.contains("I need to use <TOOL_NAME> with these parameters: <PARAMETERS_AS_JSON>"));
        assert!(prompt.contains(r#"I need to use brave_web_search with these parameters: {"query": "latest AI news"}"#));
    }

    #[test]
    fn test_local_tools_prompt_custom_template() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("tools.md");
        fs::write(&file_path, "{{ system_prompt }}|{% for tool in tools %}{{ tool.name }}{% endfor %}").unwrap();

        let tools = vec![Tool::new("echo", "Echo", json!({}))];
        let prompt = local_tools_prompt("base", &tools, Some(&file_path)).unwrap();
        assert_eq!(prompt, "base|echo");
    }
}
