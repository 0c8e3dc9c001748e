use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use voxlink::net::ws::frame::{self, Frame, FrameDecoder, Opcode};
use voxlink::ControlServer;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

async fn spawn_server() -> Option<std::net::SocketAddr> {
    match ControlServer::new().spawn("127.0.0.1:0").await {
        Ok(addr) => Some(addr),
        Err(err) => {
            eprintln!("Skipping websocket server test: {err}");
            None
        }
    }
}

async fn upgrade(stream: &mut TcpStream) -> String {
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("handshake timed out")
            .unwrap();
        assert!(n > 0, "connection closed during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn next_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Frame {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next().unwrap() {
            return frame;
        }
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("frame read timed out")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for a frame");
        decoder.feed(&chunk[..n]);
    }
}

async fn send_client_frame(stream: &mut TcpStream, frame: &Frame) {
    let wire = frame::encode(frame, Some(rand::random()));
    stream.write_all(&wire).await.unwrap();
}

#[tokio::test]
async fn handshake_returns_rfc_accept_value() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let response = upgrade(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 101"), "{response}");
    assert!(
        response.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}")),
        "{response}"
    );
}

#[tokio::test]
async fn handshake_without_key_is_rejected_with_400() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}

#[tokio::test]
async fn ping_is_answered_with_matching_pong() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    upgrade(&mut stream).await;

    let mut decoder = FrameDecoder::new();
    send_client_frame(&mut stream, &Frame::ping(b"stamp-1234".to_vec())).await;
    loop {
        let frame = next_frame(&mut stream, &mut decoder).await;
        match frame.opcode {
            Opcode::Pong => {
                assert_eq!(frame.payload, b"stamp-1234");
                break;
            }
            // The server's own keepalive pings may interleave.
            Opcode::Ping => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn server_sends_keepalive_ping_within_three_seconds() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    upgrade(&mut stream).await;

    let mut decoder = FrameDecoder::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let frame = tokio::time::timeout_at(deadline, next_frame(&mut stream, &mut decoder))
            .await
            .expect("no keepalive ping within 3 s");
        if frame.opcode == Opcode::Ping {
            break;
        }
    }
}

#[tokio::test]
async fn protoo_echo_request_is_answered_ok() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    upgrade(&mut stream).await;

    let request = json!({
        "request": true,
        "id": 42,
        "method": "echo",
        "data": {"ts": 1234},
    })
    .to_string();
    send_client_frame(&mut stream, &Frame::text(request)).await;

    let mut decoder = FrameDecoder::new();
    loop {
        let frame = next_frame(&mut stream, &mut decoder).await;
        match frame.opcode {
            Opcode::Text => {
                let v: serde_json::Value =
                    serde_json::from_str(std::str::from_utf8(&frame.payload).unwrap()).unwrap();
                assert_eq!(v["response"], json!(true));
                assert_eq!(v["id"], json!(42));
                assert_eq!(v["ok"], json!(true));
                assert_eq!(v["data"]["ts"], json!(1234));
                break;
            }
            Opcode::Ping => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn fragmented_text_is_reassembled() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    upgrade(&mut stream).await;

    // A protoo request split across three frames: text + two continuations.
    let request = json!({
        "request": true,
        "id": 7,
        "method": "echo",
        "data": {},
    })
    .to_string();
    let bytes = request.as_bytes();
    let (a, rest) = bytes.split_at(bytes.len() / 3);
    let (b, c) = rest.split_at(rest.len() / 2);
    let parts = [
        Frame {
            fin: false,
            opcode: Opcode::Text,
            payload: a.to_vec(),
        },
        Frame {
            fin: false,
            opcode: Opcode::Continuation,
            payload: b.to_vec(),
        },
        Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: c.to_vec(),
        },
    ];
    for part in &parts {
        send_client_frame(&mut stream, part).await;
    }

    let mut decoder = FrameDecoder::new();
    loop {
        let frame = next_frame(&mut stream, &mut decoder).await;
        match frame.opcode {
            Opcode::Text => {
                let v: serde_json::Value =
                    serde_json::from_str(std::str::from_utf8(&frame.payload).unwrap()).unwrap();
                assert_eq!(v["id"], json!(7));
                assert_eq!(v["ok"], json!(true));
                break;
            }
            Opcode::Ping => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn valid_close_is_echoed() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    upgrade(&mut stream).await;

    send_client_frame(&mut stream, &Frame::close(1000, "done")).await;
    let mut decoder = FrameDecoder::new();
    loop {
        let frame = next_frame(&mut stream, &mut decoder).await;
        match frame.opcode {
            Opcode::Close => {
                assert_eq!(frame.close_code(), Some(1000));
                break;
            }
            Opcode::Ping => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn invalid_close_code_is_answered_with_1002() {
    let Some(addr) = spawn_server().await else {
        return;
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    upgrade(&mut stream).await;

    // 1005 must never appear on the wire.
    send_client_frame(&mut stream, &Frame::close(1005, "")).await;
    let mut decoder = FrameDecoder::new();
    loop {
        let frame = next_frame(&mut stream, &mut decoder).await;
        match frame.opcode {
            Opcode::Close => {
                assert_eq!(frame.close_code(), Some(1002));
                break;
            }
            Opcode::Ping => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
