//! End-to-end transfer tests: a real server and client over localhost, plus
//! scripted peers (raw UDP sockets) where the packet trace itself is the
//! thing under test.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tftp::packet::Request;
use tftp::{
    ErrorCode, OptionRequest, OptionSet, Packet, ServerConfig, ServerLimits, Shutdown, TftpServer,
    TransferError, TransferMode,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

struct TestServer {
    addr: SocketAddr,
    root: TempDir,
}

async fn start_server(adjust: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let root = tempdir().unwrap();
    let mut config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        root_dir: root.path().to_path_buf(),
        ..Default::default()
    };
    adjust(&mut config);

    let server = TftpServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.serve(Shutdown::new()).await });

    TestServer { addr, root }
}

async fn fetch(
    server: SocketAddr,
    remote: &str,
    request: &OptionRequest,
    out: &Path,
) -> Result<(OptionSet, u64), TransferError> {
    let sink = tokio::fs::File::create(out).await.unwrap();
    tftp::download(
        server,
        remote,
        TransferMode::Octet,
        request,
        sink,
        Shutdown::new(),
    )
    .await
}

async fn recv_packet_from(sock: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = vec![0u8; 65536];
    let (len, from) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet")
        .unwrap();
    (Packet::from_bytes(&buf[..len]).unwrap(), from)
}

async fn send_packet(sock: &UdpSocket, to: SocketAddr, packet: &Packet) {
    sock.send_to(&packet.to_bytes(), to).await.unwrap();
}

#[track_caller]
fn assert_remote_error(result: Result<(OptionSet, u64), TransferError>, expected: ErrorCode) {
    match result {
        Err(TransferError::Remote { code, .. }) => assert_eq!(code, expected),
        other => panic!("expected remote error {:?}, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn minimal_rrq_roundtrip() {
    let server = start_server(|_| {}).await;
    std::fs::write(server.root.path().join("hello.txt"), b"hi\n").unwrap();

    let out = server.root.path().join("out");
    let (set, bytes) = fetch(server.addr, "hello.txt", &OptionRequest::default(), &out)
        .await
        .unwrap();

    assert_eq!(set, OptionSet::default());
    assert_eq!(bytes, 3);
    assert_eq!(std::fs::read(&out).unwrap(), b"hi\n");
}

#[tokio::test]
async fn zero_byte_file_downloads_empty() {
    let server = start_server(|_| {}).await;
    std::fs::write(server.root.path().join("empty"), b"").unwrap();

    let out = server.root.path().join("out");
    let (_, bytes) = fetch(server.addr, "empty", &OptionRequest::default(), &out)
        .await
        .unwrap();

    assert_eq!(bytes, 0);
    assert_eq!(std::fs::read(&out).unwrap(), b"");
}

#[tokio::test]
async fn exact_blksize_multiple_terminates_with_empty_block() {
    let server = start_server(|_| {}).await;
    let content: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(server.root.path().join("even.bin"), &content).unwrap();

    let out = server.root.path().join("out");
    let (_, bytes) = fetch(server.addr, "even.bin", &OptionRequest::default(), &out)
        .await
        .unwrap();

    assert_eq!(bytes, 1024);
    assert_eq!(std::fs::read(&out).unwrap(), content);
}

#[tokio::test]
async fn tsize_request_reports_file_size() {
    let server = start_server(|_| {}).await;
    std::fs::write(server.root.path().join("sized.bin"), vec![1u8; 700]).unwrap();

    let request = OptionRequest {
        transfer_size: Some(0),
        ..Default::default()
    };
    let out = server.root.path().join("out");
    let (set, bytes) = fetch(server.addr, "sized.bin", &request, &out)
        .await
        .unwrap();

    assert_eq!(set.transfer_size, Some(700));
    assert_eq!(bytes, 700);
}

#[tokio::test]
async fn server_lowers_oversized_blksize() {
    let server = start_server(|_| {}).await;
    let content: Vec<u8> = (0..3000).map(|i| (i % 241) as u8).collect();
    std::fs::write(server.root.path().join("big.bin"), &content).unwrap();

    let request = OptionRequest {
        block_size: Some(9000),
        ..Default::default()
    };
    let out = server.root.path().join("out");
    let (set, bytes) = fetch(server.addr, "big.bin", &request, &out).await.unwrap();

    assert_eq!(set.block_size, 1428);
    assert!(set.block_size_negotiated);
    assert_eq!(bytes, 3000);
    assert_eq!(std::fs::read(&out).unwrap(), content);
}

#[tokio::test]
async fn rejected_timeout_option_reverts_to_default() {
    let server = start_server(|_| {}).await;
    std::fs::write(server.root.path().join("plain"), b"payload").unwrap();

    let request = OptionRequest {
        timeout_secs: Some(0),
        ..Default::default()
    };
    let out = server.root.path().join("out");
    let (set, _) = fetch(server.addr, "plain", &request, &out).await.unwrap();

    // Nothing was accepted, so the session ran the classic handshake on
    // default values.
    assert_eq!(set, OptionSet::default());
}

#[tokio::test]
async fn maximum_blksize_transfers_in_two_blocks() {
    let server = start_server(|config| {
        config.limits = ServerLimits {
            block_size_cap: 65464,
            ..Default::default()
        };
    })
    .await;
    let content: Vec<u8> = (0..70_000).map(|i| (i % 239) as u8).collect();
    std::fs::write(server.root.path().join("huge.bin"), &content).unwrap();

    let request = OptionRequest {
        block_size: Some(65464),
        ..Default::default()
    };
    let out = server.root.path().join("out");
    let (set, bytes) = fetch(server.addr, "huge.bin", &request, &out)
        .await
        .unwrap();

    assert_eq!(set.block_size, 65464);
    assert_eq!(bytes, 70_000);
    assert_eq!(std::fs::read(&out).unwrap(), content);
}

#[tokio::test]
async fn minimum_blksize_download() {
    let server = start_server(|_| {}).await;
    std::fs::write(server.root.path().join("tiny.bin"), b"ABCDEFGHIJKLMNOPQRST").unwrap();

    let request = OptionRequest {
        block_size: Some(8),
        ..Default::default()
    };
    let out = server.root.path().join("out");
    let (set, bytes) = fetch(server.addr, "tiny.bin", &request, &out).await.unwrap();

    assert_eq!(set.block_size, 8);
    assert_eq!(bytes, 20);
    assert_eq!(std::fs::read(&out).unwrap(), b"ABCDEFGHIJKLMNOPQRST");
}

#[tokio::test]
async fn classic_upload_lands_in_the_root() {
    let server = start_server(|_| {}).await;

    let (set, sent) = tftp::upload(
        server.addr,
        "upload.bin",
        TransferMode::Octet,
        &OptionRequest::default(),
        &b"classic upload"[..],
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert_eq!(set, OptionSet::default());
    assert_eq!(sent, 14);
    assert_eq!(
        std::fs::read(server.root.path().join("upload.bin")).unwrap(),
        b"classic upload"
    );
}

#[tokio::test]
async fn negotiated_upload_lands_in_the_root() {
    let server = start_server(|_| {}).await;

    let request = OptionRequest {
        block_size: Some(8),
        ..Default::default()
    };
    let (set, sent) = tftp::upload(
        server.addr,
        "chunked.bin",
        TransferMode::Octet,
        &request,
        &b"ABCDEFGHIJKLMNOPQRST"[..],
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert_eq!(set.block_size, 8);
    assert_eq!(sent, 20);
    assert_eq!(
        std::fs::read(server.root.path().join("chunked.bin")).unwrap(),
        b"ABCDEFGHIJKLMNOPQRST"
    );
}

#[tokio::test]
async fn no_overwrite_policy_refuses_existing_file() {
    let server = start_server(|config| config.overwrite = false).await;
    std::fs::write(server.root.path().join("taken"), b"original").unwrap();

    let result = tftp::upload(
        server.addr,
        "taken",
        TransferMode::Octet,
        &OptionRequest::default(),
        &b"replacement"[..],
        Shutdown::new(),
    )
    .await;

    assert_remote_error(result, ErrorCode::FileAlreadyExists);
    assert_eq!(
        std::fs::read(server.root.path().join("taken")).unwrap(),
        b"original"
    );
}

#[tokio::test]
async fn announced_size_over_limit_is_refused_as_disk_full() {
    let server = start_server(|config| {
        config.limits = ServerLimits {
            max_write_size: Some(10),
            ..Default::default()
        };
    })
    .await;

    let request = OptionRequest {
        transfer_size: Some(100),
        ..Default::default()
    };
    let result = tftp::upload(
        server.addr,
        "toobig.bin",
        TransferMode::Octet,
        &request,
        &vec![0u8; 100][..],
        Shutdown::new(),
    )
    .await;

    assert_remote_error(result, ErrorCode::DiskFull);
}

#[tokio::test]
async fn missing_file_is_file_not_found() {
    let server = start_server(|_| {}).await;
    let out = server.root.path().join("out");
    let result = fetch(server.addr, "nowhere.bin", &OptionRequest::default(), &out).await;
    assert_remote_error(result, ErrorCode::FileNotFound);
}

#[tokio::test]
async fn path_escape_is_access_violation() {
    let server = start_server(|_| {}).await;
    let out = server.root.path().join("out");

    let result = fetch(server.addr, "../escape", &OptionRequest::default(), &out).await;
    assert_remote_error(result, ErrorCode::AccessViolation);

    let result = fetch(server.addr, "/etc/passwd", &OptionRequest::default(), &out).await;
    assert_remote_error(result, ErrorCode::AccessViolation);
}

#[tokio::test]
async fn non_request_on_wellknown_port_draws_error_4() {
    let server = start_server(|_| {}).await;
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send_packet(&sock, server.addr, &Packet::Ack { block: 1 }).await;

    let (reply, from) = recv_packet_from(&sock).await;
    assert_eq!(from, server.addr);
    let Packet::Error { code, .. } = reply else {
        panic!("expected ERROR, got {:?}", reply);
    };
    assert_eq!(code, ErrorCode::IllegalOperation);
}

/// Spec scenario: a stranger interjects mid-session, is answered with
/// ERROR 5, and the real transfer is unaffected.
#[tokio::test]
async fn stranger_mid_session_draws_error_5() {
    let server = start_server(|_| {}).await;
    let content = vec![7u8; 600];
    std::fs::write(server.root.path().join("guarded.bin"), &content).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    send_packet(
        &client,
        server.addr,
        &Packet::Rrq(Request {
            filename: "guarded.bin".to_string(),
            mode: TransferMode::Octet,
            options: Vec::new(),
        }),
    )
    .await;

    // The first DATA comes from a fresh session port, not the request port.
    let (data1, session_addr) = recv_packet_from(&client).await;
    assert_ne!(session_addr, server.addr);
    assert_eq!(
        data1,
        Packet::Data {
            block: 1,
            payload: content[..512].to_vec(),
        }
    );

    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    send_packet(&stranger, session_addr, &Packet::Ack { block: 1 }).await;
    let (intruder_reply, _) = recv_packet_from(&stranger).await;
    let Packet::Error { code, .. } = intruder_reply else {
        panic!("stranger expected ERROR, got {:?}", intruder_reply);
    };
    assert_eq!(code, ErrorCode::UnknownTransferId);

    // The legitimate exchange picks up where it left off.
    send_packet(&client, session_addr, &Packet::Ack { block: 1 }).await;
    let (data2, _) = recv_packet_from(&client).await;
    assert_eq!(
        data2,
        Packet::Data {
            block: 2,
            payload: content[512..].to_vec(),
        }
    );
    send_packet(&client, session_addr, &Packet::Ack { block: 2 }).await;
}

/// Spec scenario: upload with blksize=8. The OACK substitutes for ACK 0;
/// the client moves straight to DATA 1 and chunks at the negotiated size.
#[tokio::test]
async fn upload_trace_with_blksize_8() {
    let wellknown = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = wellknown.local_addr().unwrap();

    let request = OptionRequest {
        block_size: Some(8),
        ..Default::default()
    };
    let client = tokio::spawn(async move {
        tftp::upload(
            server_addr,
            "trace.bin",
            TransferMode::Octet,
            &request,
            &b"ABCDEFGHIJKLMNOPQRST"[..],
            Shutdown::new(),
        )
        .await
    });

    let (wrq, client_addr) = recv_packet_from(&wellknown).await;
    let Packet::Wrq(request) = wrq else {
        panic!("expected WRQ, got {:?}", wrq);
    };
    assert_eq!(request.filename, "trace.bin");
    assert!(
        request
            .options
            .contains(&("blksize".to_string(), "8".to_string()))
    );

    // Answer from a fresh session socket, as a real server would.
    let session = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    send_packet(
        &session,
        client_addr,
        &Packet::Oack {
            options: vec![("blksize".to_string(), "8".to_string())],
        },
    )
    .await;

    for (block, chunk) in [(1u16, &b"ABCDEFGH"[..]), (2, b"IJKLMNOP"), (3, b"QRST")] {
        let (data, _) = recv_packet_from(&session).await;
        assert_eq!(
            data,
            Packet::Data {
                block,
                payload: chunk.to_vec(),
            }
        );
        send_packet(&session, client_addr, &Packet::Ack { block }).await;
    }

    let (set, sent) = client.await.unwrap().unwrap();
    assert_eq!(set.block_size, 8);
    assert_eq!(sent, 20);
}

/// A server may lower blksize but never raise it; a raised value fails the
/// session with ERROR 8.
#[tokio::test]
async fn raised_blksize_in_oack_fails_with_error_8() {
    let wellknown = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = wellknown.local_addr().unwrap();

    let request = OptionRequest {
        block_size: Some(512),
        ..Default::default()
    };
    let client = tokio::spawn(async move {
        tftp::download(
            server_addr,
            "raised.bin",
            TransferMode::Octet,
            &request,
            tokio::io::sink(),
            Shutdown::new(),
        )
        .await
    });

    let (_rrq, client_addr) = recv_packet_from(&wellknown).await;

    let session = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    send_packet(
        &session,
        client_addr,
        &Packet::Oack {
            options: vec![("blksize".to_string(), "1024".to_string())],
        },
    )
    .await;

    let result = client.await.unwrap();
    assert!(matches!(result, Err(TransferError::OptionNegotiation(_))));

    let (reply, _) = recv_packet_from(&session).await;
    let Packet::Error { code, .. } = reply else {
        panic!("expected ERROR, got {:?}", reply);
    };
    assert_eq!(code, ErrorCode::OptionNegotiation);
}

/// Spec scenario: DATA block 2 is dropped twice. The client re-ACKs block 1
/// on each timeout; the transfer still completes on the third attempt.
#[tokio::test]
async fn client_reacks_through_dropped_data() {
    let wellknown = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = wellknown.local_addr().unwrap();

    let root = tempdir().unwrap();
    let out = root.path().join("out");
    let sink = tokio::fs::File::create(&out).await.unwrap();

    let request = OptionRequest {
        timeout_secs: Some(1),
        ..Default::default()
    };
    let client = tokio::spawn(async move {
        tftp::download(
            server_addr,
            "droppy.bin",
            TransferMode::Octet,
            &request,
            sink,
            Shutdown::new(),
        )
        .await
    });

    let (rrq, client_addr) = recv_packet_from(&wellknown).await;
    let Packet::Rrq(request) = rrq else {
        panic!("expected RRQ, got {:?}", rrq);
    };
    assert!(
        request
            .options
            .contains(&("timeout".to_string(), "1".to_string()))
    );

    let session = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    send_packet(
        &session,
        client_addr,
        &Packet::Oack {
            options: vec![("timeout".to_string(), "1".to_string())],
        },
    )
    .await;

    let (ack0, _) = recv_packet_from(&session).await;
    assert_eq!(ack0, Packet::Ack { block: 0 });

    let block1 = Packet::Data {
        block: 1,
        payload: vec![0xab; 512],
    };
    send_packet(&session, client_addr, &block1).await;
    let (ack1, _) = recv_packet_from(&session).await;
    assert_eq!(ack1, Packet::Ack { block: 1 });

    // "Drop" DATA 2 twice by staying silent; each client timeout repeats
    // the last ACK.
    for _ in 0..2 {
        let (repeat, _) = recv_packet_from(&session).await;
        assert_eq!(repeat, Packet::Ack { block: 1 });
    }

    send_packet(
        &session,
        client_addr,
        &Packet::Data {
            block: 2,
            payload: b"end".to_vec(),
        },
    )
    .await;
    let (ack2, _) = recv_packet_from(&session).await;
    assert_eq!(ack2, Packet::Ack { block: 2 });

    let (set, bytes) = client.await.unwrap().unwrap();
    assert_eq!(set.timeout, Duration::from_secs(1));
    assert_eq!(bytes, 515);

    let written = std::fs::read(&out).unwrap();
    assert_eq!(written.len(), 515);
    assert_eq!(&written[512..], b"end");
}

#[tokio::test]
async fn serve_returns_cleanly_on_shutdown() {
    let root = tempdir().unwrap();
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        root_dir: root.path().to_path_buf(),
        ..Default::default()
    };
    let server = TftpServer::bind(config).await.unwrap();

    let shutdown = Shutdown::new();
    let serve_shutdown = shutdown.clone();
    let task = tokio::spawn(async move { server.serve(serve_shutdown).await });

    shutdown.trigger();
    let result = timeout(Duration::from_secs(2), task).await.unwrap();
    assert!(result.unwrap().is_ok());
}
