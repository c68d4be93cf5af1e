//! `steward status`: Show system status.

use std::sync::Arc;

use steward_config::AppConfig;
use steward_core::KnowledgeStore;
use steward_tools::{DirectoryKnowledgeStore, default_registry};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let knowledge = Arc::new(DirectoryKnowledgeStore::new(config.knowledge_dir()));
    let registry = default_registry(knowledge.clone());

    println!("Steward Status");
    println!("==============");
    println!("  Config dir:      {}", AppConfig::config_dir().display());
    println!("  Knowledge dir:   {}", config.knowledge_dir().display());
    println!("  Max iterations:  {}", config.agent.max_iterations);
    println!("  Parallel steps:  {}", config.agent.max_parallel_steps);
    println!("  Approval wait:   {}s", config.agent.approval_timeout_secs);
    println!("  Principal:       {}", config.agent.principal);
    match config.agent.max_tool_tier {
        Some(tier) => println!("  Tool tier cap:   {tier}"),
        None => println!("  Tool tier cap:   none"),
    }
    println!("  Token ceiling:   {}", config.budget.total_tokens);
    println!(
        "  Verifier:        confidence >= {}, quality >= {}",
        config.verifier.confidence_threshold, config.verifier.quality_threshold
    );
    println!("  Safety rules:    {}", config.base_context.safety_rules.len());
    println!("  Allowed tools:   {}", config.security.allowed_tools.join(", "));

    println!("\n  Tools:");
    for d in registry.descriptors() {
        println!(
            "    {:<18} tier {}  {}{}",
            d.id,
            d.risk_tier.level(),
            if d.read_only { "read-only" } else { "writes" },
            if d.cacheable { ", cacheable" } else { "" }
        );
    }

    match knowledge.domains().await {
        Ok(domains) if domains.is_empty() => println!("\n  Knowledge:       no domains"),
        Ok(domains) => println!("\n  Knowledge:       {}", domains.join(", ")),
        Err(e) => println!("\n  Knowledge:       unreadable ({e})"),
    }

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file — run `steward onboard` first");
    }

    Ok(())
}
