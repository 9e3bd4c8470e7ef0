#![forbid(unsafe_code)]

use anyhow::Result;
use nlfs_harness::run_smoke;

fn main() -> Result<()> {
    let report = run_smoke()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.invariants_ok {
        anyhow::bail!("invariant check failed");
    }
    Ok(())
}
