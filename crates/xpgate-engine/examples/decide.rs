//! Reads one request as JSON from stdin and prints the decision.
//!
//! `echo '{"transaction_id":"t1","user_id":"u1","merchant_id":"m1","amount":"1000","transaction_type":"purchase"}' | cargo run --example decide`

use std::io::{self, Read};
use std::sync::Arc;

use xpgate_core::{PersonaDirectory, Policy, PolicyDocument, PolicyStore, RewardRequest};
use xpgate_engine::DecisionEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    let request: RewardRequest = serde_json::from_str(input.trim())?;

    let policy = Policy::from_document(&PolicyDocument::default())?;
    let engine = DecisionEngine::builder(
        Arc::new(PolicyStore::new(policy)),
        Arc::new(PersonaDirectory::default()),
    )
    .build();

    let decision = engine.decide(&request).await?;
    serde_json::to_writer_pretty(io::stdout(), &decision.to_response())?;
    println!();

    Ok(())
}
