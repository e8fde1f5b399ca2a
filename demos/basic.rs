//! Basic example of using ha-router with SQLite handles.

use ha_router::{
    BalanceAlgorithm, FallbackPolicy, Handle, Router, RouterOptions, SqliteHandle, SqliteOptions,
    Value,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("app.db");

    // The master creates the schema; replicas read the same file
    let master = Arc::new(SqliteHandle::open(SqliteOptions::read_write(&path))?);
    master.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")?;

    let replicas = vec![
        Arc::new(SqliteHandle::new(SqliteOptions::read_only(&path))),
        Arc::new(SqliteHandle::new(SqliteOptions::read_only(&path))),
    ];

    let db = Router::new(
        Some(master),
        replicas.clone(),
        RouterOptions {
            health_check_interval: Duration::from_millis(200),
            balance_algorithm: BalanceAlgorithm::RoundRobin,
            fallback: FallbackPolicy::UseMaster,
        },
    )
    .await;

    // Writes go to the master
    let summary = db
        .exec(
            "INSERT INTO users (name) VALUES (?)",
            &[Value::String("Alice".to_string())],
        )
        .await?;
    println!("Rows affected: {}", summary.rows_affected);

    // Reads go to a replica
    let result = db.query("SELECT id, name FROM users", &[]).await?;
    println!("Columns: {:?}", result.columns);
    for row in &result.rows {
        println!("Row: {:?}", row);
    }

    // Transaction example
    let tx = db.begin().await?;
    tx.exec(
        "INSERT INTO users (name) VALUES (?)",
        &[Value::String("Bob".to_string())],
    )
    .await?;
    tx.commit().await?;

    // Take every replica down; reads fall back to the master
    for replica in &replicas {
        replica.close().await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("Replicas alive: {}", db.is_replica_alive());

    let row = db.query_row("SELECT COUNT(*) FROM users", &[]).await?;
    println!("User count (served by master): {:?}", row);

    // Close the router and every handle
    db.close().await?;

    Ok(())
}
