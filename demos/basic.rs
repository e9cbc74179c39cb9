//! Basic example of using the OpalKV client core

use opalkv_client::{
    DeleteRequest, GetRequest, KvClientConfig, KvClientPool, KvClientPoolConfig, OpsCrud,
    PasswordAuthenticator, SetRequest,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Create a pool with a single connection to the node
    let pool = KvClientPool::connect(KvClientPoolConfig {
        num_connections: 1,
        client_config: KvClientConfig {
            address: "127.0.0.1:11210".to_string(),
            selected_bucket: Some("default".to_string()),
            authenticator: Some(PasswordAuthenticator {
                username: "Administrator".to_string(),
                password: "password".to_string(),
            }),
            ..Default::default()
        },
    })?;

    let ops = OpsCrud::default();
    let client = pool.get_client().await?;
    println!("Successfully connected to OpalKV node!");

    // Store a document
    ops.set(
        &*client,
        SetRequest {
            key: b"greeting",
            value: b"Hello, OpalKV!",
            ..Default::default()
        },
    )
    .await?;
    println!("Set 'greeting' to 'Hello, OpalKV!'");

    // Fetch it back
    let resp = ops
        .get(
            &*client,
            GetRequest {
                key: b"greeting",
                ..Default::default()
            },
        )
        .await?;
    println!("Got 'greeting': {}", String::from_utf8_lossy(&resp.value));

    // Remove it
    ops.delete(
        &*client,
        DeleteRequest {
            key: b"greeting",
            ..Default::default()
        },
    )
    .await?;
    println!("Deleted 'greeting'");

    // Fetching the deleted document surfaces DocNotFound
    match ops
        .get(
            &*client,
            GetRequest {
                key: b"greeting",
                ..Default::default()
            },
        )
        .await
    {
        Ok(_) => println!("Unexpectedly found 'greeting'"),
        Err(e) => println!("As expected, 'greeting' is gone: {}", e),
    }

    pool.close().await?;
    Ok(())
}
