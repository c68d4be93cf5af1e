//! `steward doctor`: Diagnose configuration and knowledge files.

use steward_agent::{ContextBudgetManager, SelfVerifier};
use steward_config::AppConfig;
use steward_core::KnowledgeStore;
use steward_tools::DirectoryKnowledgeStore;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Steward Doctor — System Diagnostics");
    println!("======================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    let config = if config_path.exists() {
        match AppConfig::load() {
            Ok(config) => {
                println!("  ✅ Config file valid");
                config
            }
            Err(e) => {
                println!("  ❌ Config file invalid: {e}");
                issues += 1;
                AppConfig::default()
            }
        }
    } else {
        println!("  ⚠️  No config file — run `steward onboard` (using defaults)");
        issues += 1;
        AppConfig::default()
    };

    match ContextBudgetManager::from_config(&config.budget) {
        Ok(_) => println!("  ✅ Budget allocations fit the {} token ceiling", config.budget.total_tokens),
        Err(e) => {
            println!("  ❌ Budget: {e}");
            issues += 1;
        }
    }

    match SelfVerifier::from_config(&config.verifier) {
        Ok(_) => println!(
            "  ✅ {} blocked pattern(s) compile",
            config.verifier.blocked_patterns.len()
        ),
        Err(e) => {
            println!("  ❌ Verifier: {e}");
            issues += 1;
        }
    }

    let knowledge_dir = config.knowledge_dir();
    if knowledge_dir.is_dir() {
        let store = DirectoryKnowledgeStore::new(&knowledge_dir);
        match store.domains().await {
            Ok(domains) => {
                for domain in domains {
                    match store.load(&domain).await {
                        Ok(c) => println!(
                            "  ✅ Knowledge '{domain}': {} document(s)",
                            c.documents.len()
                        ),
                        Err(e) => {
                            println!("  ❌ Knowledge '{domain}': {e}");
                            issues += 1;
                        }
                    }
                }
            }
            Err(e) => {
                println!("  ❌ Knowledge directory unreadable: {e}");
                issues += 1;
            }
        }
    } else {
        println!("  ⚠️  No knowledge directory at {}", knowledge_dir.display());
        issues += 1;
    }

    if config.security.allowed_tools.is_empty() {
        println!("  ⚠️  security.allowed_tools is empty — every tool call will be refused");
        issues += 1;
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
