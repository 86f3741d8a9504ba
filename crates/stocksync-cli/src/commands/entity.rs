use clap::Subcommand;
use serde_json::Value;
use stocksync_core::{EntityType, WriteOutcome};

use crate::context::Context;

#[derive(Subcommand)]
pub enum EntityAction {
    /// Show one entity
    Get {
        /// Entity type (material, product, batch, customer, sale)
        entity_type: EntityType,
        key: String,
    },
    /// List entities of a type
    List { entity_type: EntityType },
    /// Create an entity
    Create {
        entity_type: EntityType,
        key: String,
        /// JSON object payload
        payload: String,
    },
    /// Replace an entity's payload
    Update {
        entity_type: EntityType,
        key: String,
        /// JSON object payload
        payload: String,
    },
    /// Delete an entity
    Delete { entity_type: EntityType, key: String },
}

fn parse_payload(raw: &str) -> Result<Value, Box<dyn std::error::Error>> {
    serde_json::from_str(raw).map_err(|e| format!("invalid payload JSON: {e}").into())
}

fn report(outcome: &WriteOutcome) {
    let op = outcome.operation();
    if outcome.is_queued() {
        println!("queued {} {}/{} ({})", op.kind, op.entity_type, op.entity_key, op.id);
    } else {
        println!("applied {} {}/{}", op.kind, op.entity_type, op.entity_key);
    }
}

pub async fn run(action: EntityAction) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::bootstrap_passive().await?;
    let access = &ctx.access;

    match action {
        EntityAction::Get { entity_type, key } => match access.get(entity_type, &key).await? {
            Some(entity) => println!("{}", serde_json::to_string_pretty(&entity)?),
            None => return Err(format!("{entity_type}/{key} not found").into()),
        },
        EntityAction::List { entity_type } => {
            let entities = access.list(entity_type).await?;
            println!("{}", serde_json::to_string_pretty(&entities)?);
        }
        EntityAction::Create {
            entity_type,
            key,
            payload,
        } => {
            let outcome = access.create(entity_type, &key, parse_payload(&payload)?).await?;
            report(&outcome);
        }
        EntityAction::Update {
            entity_type,
            key,
            payload,
        } => {
            let outcome = access.update(entity_type, &key, parse_payload(&payload)?).await?;
            report(&outcome);
        }
        EntityAction::Delete { entity_type, key } => {
            let outcome = access.delete(entity_type, &key).await?;
            report(&outcome);
        }
    }
    Ok(())
}
