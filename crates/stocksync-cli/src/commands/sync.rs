//! One-shot reconciliation.

use stocksync_core::PassOutcome;

use crate::context::Context;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::bootstrap_passive().await?;

    match ctx.engine.force_sync().await {
        PassOutcome::Completed(report) => {
            println!(
                "applied {}, failed {}, dead {}, upserted {}, removed {}",
                report.applied,
                report.failed,
                report.dead,
                report.merged.upserted,
                report.merged.removed
            );
            for error in &report.errors {
                eprintln!("  {error}");
            }
            let pending = ctx.engine.stats().pending_operations;
            if pending > 0 {
                println!("{pending} operation(s) still queued");
            }
            Ok(())
        }
        PassOutcome::Skipped(reason) => {
            let reason = serde_json::to_value(reason)?;
            Err(format!("sync skipped: {}", reason.as_str().unwrap_or("unknown")).into())
        }
    }
}
