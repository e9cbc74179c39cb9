//! Example of dispatching concurrent operations through the client pool

use std::sync::Arc;
use std::time::Instant;

use opalkv_client::{
    GetRequest, KvClientConfig, KvClientPool, KvClientPoolConfig, OpsCrud, PasswordAuthenticator,
    SetRequest,
};
use tokio::task;

const NUM_TASKS: usize = 10;
const OPS_PER_TASK: usize = 100;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Create a pool of four connections to the node
    let pool = Arc::new(KvClientPool::connect(KvClientPoolConfig {
        num_connections: 4,
        client_config: KvClientConfig {
            address: "127.0.0.1:11210".to_string(),
            selected_bucket: Some("default".to_string()),
            authenticator: Some(PasswordAuthenticator {
                username: "Administrator".to_string(),
                password: "password".to_string(),
            }),
            ..Default::default()
        },
    })?);

    println!(
        "Starting benchmark with {} tasks and {} operations per task",
        NUM_TASKS, OPS_PER_TASK
    );

    let start = Instant::now();
    let mut handles = vec![];

    // Spawn multiple tasks to simulate concurrent producers
    for task_id in 0..NUM_TASKS {
        let pool = pool.clone();
        let handle = task::spawn(async move {
            let ops = OpsCrud::default();
            for i in 0..OPS_PER_TASK {
                let key = format!("task_{}_{}", task_id, i);
                let value = format!("value_{}_{}", task_id, i);

                let client = match pool.get_client().await {
                    Ok(client) => client,
                    Err(e) => {
                        eprintln!("Task {}: failed to get client: {}", task_id, e);
                        continue;
                    }
                };

                // Store a value
                if let Err(e) = ops
                    .set(
                        &*client,
                        SetRequest {
                            key: key.as_bytes(),
                            value: value.as_bytes(),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    eprintln!("Task {}: failed to set {}: {}", task_id, key, e);
                    continue;
                }

                // Fetch it back
                match ops
                    .get(
                        &*client,
                        GetRequest {
                            key: key.as_bytes(),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    Ok(resp) => {
                        if resp.value != value.as_bytes() {
                            eprintln!("Value mismatch for {}: {:?} != {}", key, resp.value, value);
                        }
                    }
                    Err(e) => {
                        eprintln!("Task {}: failed to get {}: {}", task_id, key, e);
                    }
                }
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await?;
    }

    let elapsed = start.elapsed();
    let total_ops = NUM_TASKS * OPS_PER_TASK * 2;
    println!(
        "Completed {} operations in {:?} ({:.0} ops/sec)",
        total_ops,
        elapsed,
        total_ops as f64 / elapsed.as_secs_f64()
    );

    pool.close().await?;
    Ok(())
}
