//! Engine behavior against a scripted server on a loopback socket.

use serde_json::{json, Value};
use std::time::Duration;
use thingsdb_client::{
    Client, ClientError, ConnectionConfig, ConnectionState, ErrorCode, Event, ListenTimeout,
    ResponseType,
};
use thingsdb_protocol::{Decoder, Encoder, Frame, MsgPack, ProtocolError, RequestType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};

struct FakeServer {
    stream: TcpStream,
    decoder: Decoder,
}

impl FakeServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            decoder: Decoder::new(),
        }
    }

    async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.decoder.decode_frame().unwrap() {
                return frame;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up");
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn send(&mut self, id: u16, kind: ResponseType, data: Option<Value>) {
        let bytes = Encoder::encode_response(id, kind, data.as_ref()).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }
}

async fn bind() -> (TcpListener, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ConnectionConfig::new("127.0.0.1", port).with_io_timeout(Duration::from_secs(2));
    (listener, config)
}

fn payload(frame: &Frame) -> Value {
    MsgPack::decode(&frame.payload).unwrap()
}

#[tokio::test]
async fn test_ping() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let req = server.recv().await;
        assert_eq!(req.frame_type, RequestType::Ping.as_i8());
        assert_eq!(req.id, 1);
        assert!(req.payload.is_empty());
        server.send(req.id, ResponseType::Pong, None).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);
    assert!(client.is_connected());
    assert_ok!(client.ping().await);

    server.await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_response_is_shelved() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let req = server.recv().await;
        server.send(7, ResponseType::Data, Some(json!("seven"))).await;
        server.send(req.id, ResponseType::Data, Some(json!("mine"))).await;
        // Keep the socket open until the client is done.
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let value = assert_ok!(client.query("@:stuff", "'mine';", None).await);
    assert_eq!(value, json!("mine"));
    assert_eq!(client.connection().shelved_count(), 1);

    let stray = assert_ok!(client.listen(ListenTimeout::After(Duration::from_secs(1))).await);
    let stray = stray.unwrap();
    assert_eq!(stray.id, 7);
    assert_eq!(stray.data, Some(json!("seven")));

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_answered_in_reverse() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let first = server.recv().await;
        let second = server.recv().await;
        for req in [second, first] {
            let code = payload(&req)[1].clone();
            server.send(req.id, ResponseType::Data, Some(code)).await;
        }
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let (a, b) = tokio::join!(
        client.query("@:stuff", "a", None),
        client.query("@:stuff", "b", None)
    );
    assert_eq!(assert_ok!(a), json!("a"));
    assert_eq!(assert_ok!(b), json!("b"));
    assert_eq!(client.connection().pending_count(), 0);
    assert_eq!(client.connection().shelved_count(), 0);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_timeout_does_not_corrupt_next_request() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let slow = server.recv().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        server.send(slow.id, ResponseType::Data, Some(json!("stale"))).await;

        let next = server.recv().await;
        server.send(next.id, ResponseType::Data, Some(json!("fresh"))).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let conn = client.connection();
    let err = assert_err!(
        conn.request_with_timeout(
            RequestType::Query,
            Some(&json!(["@:stuff", "slow"])),
            Duration::from_millis(50),
        )
        .await
    );
    assert!(matches!(err, ClientError::RequestTimeout { id: 1 }));
    assert!(client.is_connected());

    let value = assert_ok!(client.query("@:stuff", "fast", None).await);
    assert_eq!(value, json!("fresh"));
    assert_eq!(conn.shelved_count(), 0);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_listen_alongside_ping() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.send(0, ResponseType::OnJoin, Some(json!({"id": 42}))).await;
        let req = server.recv().await;
        server.send(req.id, ResponseType::Pong, None).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let (event, pong) = tokio::join!(
        client.listen_event(ListenTimeout::After(Duration::from_secs(2))),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.ping().await
        }
    );
    assert_eq!(assert_ok!(event), Some(Event::Join { room_id: 42 }));
    assert_ok!(pong);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_auth_error() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let req = server.recv().await;
        assert_eq!(req.frame_type, RequestType::Auth.as_i8());
        assert_eq!(payload(&req), json!(["admin", "wrong"]));
        server
            .send(
                req.id,
                ResponseType::Error,
                Some(json!({"error_code": -56, "error_msg": "user not found"})),
            )
            .await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config.with_auth("admin", "wrong"));
    let err = assert_err!(client.connect().await);
    match err {
        ClientError::ServerError { code, message } => {
            assert_eq!(code, ErrorCode::AuthError);
            assert_eq!(code.code(), -56);
            assert_eq!(message, "user not found");
        }
        other => panic!("unexpected error: {other}"),
    }
    // A server error leaves the socket usable.
    assert!(client.is_connected());

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_token_auth_and_room_calls() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;

        let auth = server.recv().await;
        assert_eq!(payload(&auth), json!("s3cret"));
        server.send(auth.id, ResponseType::Ok, None).await;

        let query = server.recv().await;
        assert_eq!(payload(&query), json!(["//stuff", "x + 1;", {"x": 1}]));
        server.send(query.id, ResponseType::Data, Some(json!(2))).await;

        let run = server.recv().await;
        assert_eq!(run.frame_type, RequestType::Run.as_i8());
        assert_eq!(payload(&run), json!(["//stuff", "add", [1, 2]]));
        server.send(run.id, ResponseType::Data, Some(json!(3))).await;

        let join = server.recv().await;
        assert_eq!(join.frame_type, RequestType::Join.as_i8());
        assert_eq!(payload(&join), json!(["//stuff", 17, 99]));
        server.send(join.id, ResponseType::Data, Some(json!([17, null]))).await;

        let emit = server.recv().await;
        assert_eq!(emit.frame_type, RequestType::Emit.as_i8());
        assert_eq!(payload(&emit), json!(["//stuff", 17, "msg", "hi", 5]));
        server.send(emit.id, ResponseType::Ok, None).await;

        let leave = server.recv().await;
        assert_eq!(leave.frame_type, RequestType::Leave.as_i8());
        server.send(leave.id, ResponseType::Data, Some(json!([17]))).await;

        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config.with_auth_token("s3cret"));
    assert_ok!(client.connect().await);

    let sum: i64 = assert_ok!(
        client
            .query_as("//stuff", "x + 1;", Some(json!({"x": 1})))
            .await
    );
    assert_eq!(sum, 2);

    let value = assert_ok!(client.run("//stuff", "add", vec![json!(1), json!(2)]).await);
    assert_eq!(value, json!(3));

    let joined = assert_ok!(client.join("//stuff", &[17, 99]).await);
    assert_eq!(joined, vec![Some(17), None]);

    assert_ok!(
        client
            .emit("//stuff", 17, "msg", vec![json!("hi"), json!(5)])
            .await
    );

    let left = assert_ok!(client.leave("//stuff", &[17]).await);
    assert_eq!(left, vec![Some(17)]);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_unexpected_response_type() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let req = server.recv().await;
        server.send(req.id, ResponseType::Data, Some(json!(1))).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let err = assert_err!(client.ping().await);
    assert!(matches!(
        err,
        ClientError::UnexpectedResponse {
            expected: ResponseType::Pong,
            actual: ResponseType::Data,
        }
    ));
    assert!(client.is_connected());

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_eof_fails_fast_afterwards() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let _ = server.recv().await;
        drop(server);
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let err = assert_err!(client.ping().await);
    assert!(err.is_connection_error(), "got {err}");
    assert_eq!(client.connection().state(), ConnectionState::Errored);

    let err = assert_err!(client.ping().await);
    assert!(matches!(err, ClientError::ConnectionClosed));
    let err = assert_err!(client.listen(ListenTimeout::Never).await);
    assert!(matches!(err, ClientError::ConnectionClosed));

    server.await.unwrap();
}

#[tokio::test]
async fn test_malformed_header_breaks_connection() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let req = server.recv().await;
        let id = req.id.to_le_bytes();
        // Check byte 0x00 is not the complement of 0x10 (PONG).
        let raw = [0, 0, 0, 0, id[0], id[1], 0x10, 0x00];
        server.stream.write_all(&raw).await.unwrap();
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let err = assert_err!(client.ping().await);
    assert!(err.is_connection_error());
    assert_eq!(client.connection().state(), ConnectionState::Errored);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_corrupt_frame_fails_queued_request() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let first = server.recv().await;
        let second = server.recv().await;
        let id = first.id.to_le_bytes();
        server
            .stream
            .write_all(&[0, 0, 0, 0, id[0], id[1], 0x10, 0x00])
            .await
            .unwrap();
        // Looks valid, but follows a corrupt header.
        server.send(second.id, ResponseType::Pong, None).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let (a, b) = tokio::join!(client.ping(), client.ping());
    let a = assert_err!(a);
    let b = assert_err!(b);
    assert!(a.is_connection_error(), "got {a}");
    assert!(b.is_connection_error(), "got {b}");
    assert_eq!(client.connection().state(), ConnectionState::Errored);

    let err = assert_err!(client.listen(ListenTimeout::Never).await);
    assert!(matches!(err, ClientError::ConnectionClosed));

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_unknown_type_fails_its_request() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let req = server.recv().await;
        let id = req.id.to_le_bytes();
        // Type 1 has a valid check byte but no meaning.
        server
            .stream
            .write_all(&[0, 0, 0, 0, id[0], id[1], 0x01, 0xFE])
            .await
            .unwrap();

        let next = server.recv().await;
        server.send(next.id, ResponseType::Pong, None).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let started = std::time::Instant::now();
    let err = assert_err!(client.ping().await);
    assert!(matches!(
        err,
        ClientError::Protocol(ProtocolError::UnknownResponseType(1))
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(client.is_connected());
    assert_eq!(client.connection().pending_count(), 0);

    assert_ok!(client.ping().await);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_abandoned_listen_keeps_partial_frame() {
    let (listener, config) = bind().await;
    let (resume, resumed) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let data = json!({"id": 1, "event": "big", "args": ["x".repeat(40_000)]});
        let bytes = Encoder::encode_response(0, ResponseType::OnEmit, Some(&data)).unwrap();
        let (head, tail) = bytes.split_at(20_000);
        server.stream.write_all(head).await.unwrap();
        resumed.await.unwrap();
        server.stream.write_all(tail).await.unwrap();

        let req = server.recv().await;
        server.send(req.id, ResponseType::Pong, None).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let gave_up = tokio::time::timeout(
        Duration::from_millis(50),
        client.listen(ListenTimeout::Never),
    )
    .await;
    assert!(gave_up.is_err());
    resume.send(()).unwrap();

    assert_ok!(client.ping().await);
    let event = assert_ok!(client.listen_event(ListenTimeout::After(Duration::from_secs(1))).await);
    match event {
        Some(Event::Emit {
            room_id,
            event,
            args,
        }) => {
            assert_eq!(room_id, 1);
            assert_eq!(event, "big");
            assert_eq!(args, vec![json!("x".repeat(40_000))]);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_listen_timeout_returns_none() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let req = server.recv().await;
        server.send(req.id, ResponseType::Pong, None).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let nothing = assert_ok!(client.listen(ListenTimeout::After(Duration::from_millis(50))).await);
    assert!(nothing.is_none());

    // Giving up on listen leaves the stream aligned.
    assert_ok!(client.ping().await);

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_close_interrupts_listen() {
    let (listener, config) = bind().await;
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let _ = server.stream.read(&mut [0u8; 1]).await;
    });

    let client = Client::new(config);
    assert_ok!(client.connect().await);

    let listener_client = client.clone();
    let listening =
        tokio::spawn(async move { listener_client.listen(ListenTimeout::Never).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    client.close().await;
    client.close().await;
    assert_eq!(client.connection().state(), ConnectionState::Closed);

    let result = listening.await.unwrap();
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));

    let err = assert_err!(client.ping().await);
    assert!(matches!(err, ClientError::ConnectionClosed));

    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused() {
    let (listener, config) = bind().await;
    drop(listener);

    let client = Client::new(config.with_connect_timeout(Duration::from_millis(500)));
    let err = assert_err!(client.connect().await);
    assert!(matches!(err, ClientError::Io(_) | ClientError::Timeout));
    assert_eq!(client.connection().state(), ConnectionState::Errored);
}
