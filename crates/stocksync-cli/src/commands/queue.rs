use clap::Subcommand;
use stocksync_core::QueuedOperation;

use crate::context::Context;

#[derive(Subcommand)]
pub enum QueueAction {
    /// List pending operations in delivery order
    List {
        #[arg(long)]
        json: bool,
    },
    /// List operations that exhausted their retries
    Dead {
        #[arg(long)]
        json: bool,
    },
    /// Put a dead operation back in line
    Requeue { id: String },
    /// Show one operation
    Show { id: String },
}

fn print_operations(ops: &[QueuedOperation], json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(ops)?);
        return Ok(());
    }
    if ops.is_empty() {
        println!("(empty)");
    }
    for op in ops {
        let error = op.last_error.as_deref().unwrap_or("-");
        println!(
            "{:>5}  {}  {:<6} {}/{}  attempts={}  last_error={}",
            op.seq, op.id, op.kind.as_str(), op.entity_type, op.entity_key, op.attempts, error
        );
    }
    Ok(())
}

pub async fn run(action: QueueAction) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::bootstrap_passive().await?;
    let queue = ctx.engine.queue();

    match action {
        QueueAction::List { json } => print_operations(&queue.pending_operations()?, json)?,
        QueueAction::Dead { json } => print_operations(&queue.dead_operations()?, json)?,
        QueueAction::Requeue { id } => {
            if !queue.requeue(&id)? {
                return Err(format!("no dead operation with id {id}").into());
            }
            println!("requeued {id}");
        }
        QueueAction::Show { id } => match queue.get(&id)? {
            Some(op) => println!("{}", serde_json::to_string_pretty(&op)?),
            None => return Err(format!("no operation with id {id}").into()),
        },
    }
    Ok(())
}
