//! `steward onboard`: First-time setup.

use steward_config::AppConfig;

const SAMPLE_KNOWLEDGE: &str = r#"# Guidance for tasks tagged `domain = "general"`.
# kind: policy | guideline | procedure    level: must | should | may

[[documents]]
name = "no-restricted-data"
kind = "policy"
level = "must"
text = "Never include restricted personal data such as national identifiers in task output."

[[documents]]
name = "summary-style"
kind = "guideline"
text = "Summaries lead with the decision, then the supporting facts."
"#;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Steward — First-Time Setup");
    println!("==========================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    let config = if config_path.exists() {
        AppConfig::load_from(&config_path)?
    } else {
        AppConfig::default()
    };

    let knowledge_dir = config.knowledge_dir();
    if !knowledge_dir.exists() {
        std::fs::create_dir_all(&knowledge_dir)?;
        println!("✅ Created knowledge directory: {}", knowledge_dir.display());
    }

    let sample = knowledge_dir.join("general.toml");
    if !sample.exists() {
        std::fs::write(&sample, SAMPLE_KNOWLEDGE)?;
        println!("✅ Created sample knowledge: {}", sample.display());
    }

    if config_path.exists() {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or delete and re-run onboard.\n");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created config.toml at: {}", config_path.display());
        println!("\n📝 Next steps:");
        println!("   1. Review budget and verifier thresholds in {}", config_path.display());
        println!("   2. Add <domain>.toml guidance to {}", knowledge_dir.display());
        println!("   3. Run: steward run task.json\n");
    }

    Ok(())
}
