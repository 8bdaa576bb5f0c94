//! `parley tools`: List the built-in tool catalog.

use parley_config::AppConfig;
use parley_core::tool::ToolRegistry;

pub fn run(config: &AppConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let registry = parley_tools::default_registry(&config.tools.output_dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&registry.definitions())?);
    } else {
        print!("{}", render(&registry));
    }
    Ok(())
}

pub fn render(registry: &ToolRegistry) -> String {
    let mut out = String::new();
    for name in registry.names() {
        let Some(tool) = registry.get(name) else {
            continue;
        };
        let mut flags = Vec::new();
        if tool.is_terminal() {
            flags.push("ends turn");
        }
        if tool.is_optional() {
            flags.push("optional");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        out.push_str(&format!("  {name}{flags}\n      {}\n", tool.description()));
    }
    out
}
