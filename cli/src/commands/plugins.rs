use colored::*;

use crate::app::App;
use crate::terminal::print;

pub fn plugins(app: &mut App) -> anyhow::Result<()> {
    let registry = app.registry()?;
    let plugins = registry.plugin_info();

    if plugins.is_empty() {
        print::header("no plugins loaded");
        print::no_results("plugins");
        return Ok(());
    }

    print::header("plugins");
    for (idx, info) in plugins.iter().enumerate() {
        let stages: Vec<&str> = info.stages.iter().map(|s| s.as_str()).collect();
        let enabled = if info.enabled { "yes".green() } else { "no".yellow() };
        print::tree_head(idx, &info.metadata.name);
        print::as_tree_one_level(vec![
            ("Version".to_string(), info.metadata.version.normal()),
            ("Author".to_string(), info.metadata.author.normal()),
            ("About".to_string(), info.metadata.description.normal()),
            ("Stages".to_string(), stages.join(", ").normal()),
            ("State".to_string(), info.state.to_string().normal()),
            ("Enabled".to_string(), enabled),
            ("Source".to_string(), info.source.to_string().dimmed()),
        ]);
    }
    Ok(())
}
