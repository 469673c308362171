use courier_capabilities::CapabilityRegistry;
use courier_core::Config;
use std::path::Path;

pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let paths = config.paths();

    println!("courier status");
    println!("==============");
    println!();
    println!("Config:  {}", config_path.display());
    println!(
        "Storage: {} {}",
        paths.base.display(),
        if paths.base.exists() { "✓" } else { "(created on first run)" }
    );
    println!();

    println!("Backends:");
    let mut names: Vec<&String> = config.backends.keys().collect();
    names.sort();
    for name in names {
        let backend = &config.backends[name];
        let mut roles = Vec::new();
        if config.roles.brain == *name {
            roles.push("brain");
        }
        if config.roles.cerebellum() == name.as_str() {
            roles.push("cerebellum");
        }
        println!(
            "  {:<12} {:<28} {} {}",
            name,
            backend.model,
            backend.api_base.as_deref().unwrap_or("(default base)"),
            if roles.is_empty() {
                String::new()
            } else {
                format!("[{}]", roles.join(", "))
            }
        );
    }
    println!();

    let builtins = CapabilityRegistry::with_builtins();
    let micro_finish = config.runtime.micro_finish_capability.as_str();
    println!("Agents:");
    if config.agents.is_empty() {
        println!("  (none configured)");
    }
    for agent in &config.agents {
        let capabilities = if agent.capabilities.is_empty() {
            builtins.without(&[micro_finish]).names()
        } else {
            agent.capabilities.clone()
        };
        println!("  {:<12} {}", agent.name, agent.description);
        println!("  {:<12} capabilities: {}", "", capabilities.join(", "));
    }

    let snapshot = paths.snapshot_file();
    if snapshot.exists() {
        println!();
        println!("Snapshot: {} (use `courier run --restore`)", snapshot.display());
    }
    Ok(())
}
