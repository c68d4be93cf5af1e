//! `steward classify`: Show the tier for a set of risk attributes.

use steward_agent::classify_attributes;
use steward_core::{DataSensitivity, Impact, Reversibility};

pub fn run(
    impact: Impact,
    reversibility: Reversibility,
    sensitivity: DataSensitivity,
) -> Result<(), Box<dyn std::error::Error>> {
    let tier = classify_attributes(impact, reversibility, sensitivity);
    println!("  Impact:         {impact:?}");
    println!("  Reversibility:  {reversibility:?}");
    println!("  Sensitivity:    {sensitivity:?}");
    println!("  Tier:           {tier}");
    println!(
        "  Approval:       {}",
        if tier.requires_approval() {
            "required before release"
        } else if tier.requires_audit() {
            "not required (released, then audited)"
        } else {
            "not required"
        }
    );
    Ok(())
}
