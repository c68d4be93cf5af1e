//! `steward budget`: Show how the context budget is split.

use steward_agent::ContextBudgetManager;
use steward_config::AppConfig;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let budget = ContextBudgetManager::from_config(&config.budget)?;
    let snapshot = budget.snapshot();

    println!("Context Budget");
    println!("==============");
    println!("  {:<16} {:>10} {:>8}", "category", "tokens", "share");
    for usage in &snapshot.categories {
        println!(
            "  {:<16} {:>10} {:>7.1}%",
            usage.category.as_str(),
            usage.allocated,
            percent(usage.allocated, snapshot.ceiling)
        );
    }
    println!("  {:<16} {:>10}", "ceiling", snapshot.ceiling);
    println!();
    println!(
        "  Compaction at {:.0}% ({} tokens), down to {:.0}% ({} tokens)",
        config.budget.compaction_threshold * 100.0,
        (snapshot.ceiling as f64 * config.budget.compaction_threshold as f64) as usize,
        config.budget.compaction_target * 100.0,
        (snapshot.ceiling as f64 * config.budget.compaction_target as f64) as usize,
    );
    println!(
        "  Summaries at {:.0}% of the original, keeping the last {} turns verbatim",
        config.budget.compression_ratio * 100.0,
        config.budget.keep_recent_turns
    );
    Ok(())
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}
