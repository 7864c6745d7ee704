use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use xpgate_core::{
    PersonaDirectory, Policy, PolicyDocument, PolicyStore, RewardRequest, TransactionType,
};
use xpgate_engine::DecisionEngine;

fn request(i: usize) -> RewardRequest {
    RewardRequest {
        transaction_id: format!("txn_{i}"),
        user_id: format!("user_{}", i % 500),
        merchant_id: "merchant_bench".into(),
        amount: Decimal::new(1000 + (i % 97) as i64, 0),
        transaction_type: TransactionType::Purchase,
        ts: None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let policy = Policy::from_document(&PolicyDocument::default())?;
    let engine = DecisionEngine::builder(
        Arc::new(PolicyStore::new(policy)),
        Arc::new(PersonaDirectory::default()),
    )
    .build();

    let iterations = 100_000;

    // Warmup
    for i in 0..1000 {
        engine.decide(&request(i)).await?;
    }

    let start = Instant::now();
    for i in 1000..1000 + iterations {
        engine.decide(&request(i)).await?;
    }
    let duration = start.elapsed();
    println!("Fresh decisions took: {:?}", duration);
    println!("Average per call: {:?}", duration / iterations as u32);

    // Replays hit the idempotency cache.
    let start = Instant::now();
    for i in 1000..1000 + iterations {
        engine.decide(&request(i)).await?;
    }
    let duration = start.elapsed();
    println!("Replayed decisions took: {:?}", duration);
    println!("Average per call: {:?}", duration / iterations as u32);

    // Concurrent replays of one transaction.
    let start = Instant::now();
    let mut handles = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.decide(&request(0)).await }));
    }
    for handle in handles {
        handle.await??;
    }
    println!("1000 concurrent replays took: {:?}", start.elapsed());

    Ok(())
}
