//! KvClient round-trips against an in-process server speaking the wire
//! format.

use std::time::Duration;

use opalkv_client::bytes::{BufMut, Bytes, BytesMut};
use opalkv_client::{
    decode_request, Dispatcher, Error, GetRequest, KvClient, KvClientConfig, OpCode, OpsCrud,
    PasswordAuthenticator, RequestFrame, Status, HEADER_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_frame(stream: &mut TcpStream) -> RequestFrame {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body_len);
    frame.extend_from_slice(&header);
    frame.resize(HEADER_SIZE + body_len, 0);
    stream.read_exact(&mut frame[HEADER_SIZE..]).await.unwrap();

    decode_request(Bytes::from(frame)).unwrap()
}

async fn write_response(
    stream: &mut TcpStream,
    op_code: OpCode,
    status: Status,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    value: &[u8],
) {
    let mut buf = BytesMut::new();
    buf.put_u8(0x81);
    buf.put_u8(op_code.to_u8());
    buf.put_u16(0); // key length
    buf.put_u8(extras.len() as u8);
    buf.put_u8(0); // datatype
    buf.put_u16(status.to_u16());
    buf.put_u32((extras.len() + value.len()) as u32);
    buf.put_u32(opaque);
    buf.put_u64(cas);
    buf.put_slice(extras);
    buf.put_slice(value);
    stream.write_all(&buf).await.unwrap();
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

#[tokio::test]
async fn test_get_round_trip() {
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let frame = read_frame(&mut stream).await;
        assert_eq!(frame.op_code, OpCode::Get);
        assert_eq!(&frame.key[..], b"hello");
        assert_eq!(frame.vbucket_id, 7);

        write_response(
            &mut stream,
            OpCode::Get,
            Status::Success,
            frame.opaque,
            42,
            &9u32.to_be_bytes(),
            b"world",
        )
        .await;
    });

    let client = KvClient::connect(KvClientConfig {
        address: addr,
        ..Default::default()
    })
    .await
    .unwrap();

    let ops = OpsCrud::default();
    let resp = ops
        .get(
            &client,
            GetRequest {
                key: b"hello",
                vbucket_id: 7,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(resp.cas, 42);
    assert_eq!(resp.flags, 9);
    assert_eq!(&resp.value[..], b"world");

    server.await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_dispatches_pair_by_opaque() {
    let (listener, addr) = listen().await;

    // The server reads both requests, then answers them in reverse order;
    // each response's value is its own request's key.
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let first = read_frame(&mut stream).await;
        let second = read_frame(&mut stream).await;

        for frame in [&second, &first] {
            write_response(
                &mut stream,
                OpCode::Get,
                Status::Success,
                frame.opaque,
                1,
                &0u32.to_be_bytes(),
                &frame.key,
            )
            .await;
        }
    });

    let client = KvClient::connect(KvClientConfig {
        address: addr,
        ..Default::default()
    })
    .await
    .unwrap();

    let ops = OpsCrud::default();
    let (a, b) = tokio::join!(
        ops.get(&client, GetRequest { key: b"alpha", ..Default::default() }),
        ops.get(&client, GetRequest { key: b"bravo", ..Default::default() }),
    );

    assert_eq!(&a.unwrap().value[..], b"alpha");
    assert_eq!(&b.unwrap().value[..], b"bravo");

    server.await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_authenticates_and_selects_bucket() {
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let auth = read_frame(&mut stream).await;
        assert_eq!(auth.op_code, OpCode::SaslAuth);
        assert_eq!(&auth.key[..], b"PLAIN");
        assert_eq!(&auth.value[..], b"\0user\0pass");
        write_response(&mut stream, OpCode::SaslAuth, Status::Success, auth.opaque, 0, &[], &[])
            .await;

        let select = read_frame(&mut stream).await;
        assert_eq!(select.op_code, OpCode::SelectBucket);
        assert_eq!(&select.key[..], b"default");
        write_response(
            &mut stream,
            OpCode::SelectBucket,
            Status::Success,
            select.opaque,
            0,
            &[],
            &[],
        )
        .await;
    });

    let client = KvClient::connect(KvClientConfig {
        address: addr,
        selected_bucket: Some("default".to_string()),
        authenticator: Some(PasswordAuthenticator {
            username: "user".to_string(),
            password: "pass".to_string(),
        }),
        ..Default::default()
    })
    .await
    .unwrap();

    server.await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_auth_failure() {
    let (listener, addr) = listen().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let auth = read_frame(&mut stream).await;
        write_response(&mut stream, OpCode::SaslAuth, Status::AuthError, auth.opaque, 0, &[], &[])
            .await;
    });

    let err = KvClient::connect(KvClientConfig {
        address: addr,
        authenticator: Some(PasswordAuthenticator {
            username: "user".to_string(),
            password: "wrong".to_string(),
        }),
        ..Default::default()
    })
    .await
    .unwrap_err();

    assert!(matches!(err, Error::AuthenticationFailed));
}

#[tokio::test]
async fn test_reconfigure_selects_new_bucket() {
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let select = read_frame(&mut stream).await;
        assert_eq!(select.op_code, OpCode::SelectBucket);
        assert_eq!(&select.key[..], b"fresh");
        write_response(
            &mut stream,
            OpCode::SelectBucket,
            Status::Success,
            select.opaque,
            0,
            &[],
            &[],
        )
        .await;
    });

    let client = KvClient::connect(KvClientConfig {
        address: addr.clone(),
        ..Default::default()
    })
    .await
    .unwrap();

    client
        .reconfigure(KvClientConfig {
            address: addr.clone(),
            selected_bucket: Some("fresh".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    // Changing the endpoint is not allowed on a live connection.
    let err = client
        .reconfigure(KvClientConfig {
            address: "10.9.9.9:11210".to_string(),
            selected_bucket: Some("fresh".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    server.await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_dispatch_after_close_fails() {
    let (listener, addr) = listen().await;

    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });

    let client = KvClient::connect(KvClientConfig {
        address: addr,
        ..Default::default()
    })
    .await
    .unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();

    let ops = OpsCrud::default();
    let err = ops
        .get(&client, GetRequest { key: b"k", ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Closed));
}

#[tokio::test]
async fn test_server_disconnect_fails_pending_ops() {
    let (listener, addr) = listen().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Read one request, then drop the connection without replying.
        let _ = read_frame(&mut stream).await;
        drop(stream);
    });

    let client = KvClient::connect(KvClientConfig {
        address: addr,
        ..Default::default()
    })
    .await
    .unwrap();

    let ops = OpsCrud::default();
    let err = ops
        .get(&client, GetRequest { key: b"k", ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)));

    // The client reports remote and local addresses for error context.
    assert!(!client.remote_addr().is_empty());
    assert!(!client.local_addr().is_empty());
}
