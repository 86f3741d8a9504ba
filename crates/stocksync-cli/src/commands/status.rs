use clap::Args;

use crate::context::Context;

#[derive(Args)]
pub struct StatusArgs {
    /// Print as JSON
    #[arg(long)]
    json: bool,
}

pub async fn run(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::bootstrap_passive().await?;
    let stats = ctx.access.stats();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Connectivity: {}", if stats.online { "online" } else { "offline" });
    println!("Mode:         {}", stats.mode);
    println!("Pending:      {}", stats.pending_operations);
    println!("Dead:         {}", stats.dead_operations);
    match stats.last_sync {
        Some(at) => println!("Last sync:    {}", at.to_rfc3339()),
        None => println!("Last sync:    never"),
    }
    Ok(())
}
