//! End-to-end upload/download against a live server on a loopback port.

use evio::{EventLoopThread, PollerKind};
use fileserver::config::ServerConfig;
use fileserver::protocol::{MsgType, NetType, StreamReader, StreamWriter, TransferCode};
use fileserver::FileServer;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

struct Response {
    msg_type: i32,
    seq: i32,
    code: i32,
    md5: String,
    offset: i64,
    file_size: i64,
    data: Vec<u8>,
}

fn send_upload(stream: &mut TcpStream, seq: i32, md5: &str, offset: i64, size: i64, data: &[u8]) {
    let mut writer = StreamWriter::new();
    writer
        .write_i32(MsgType::UploadReq as i32)
        .write_i32(seq)
        .write_bytes(md5.as_bytes())
        .write_i64(offset)
        .write_i64(size)
        .write_bytes(data);
    stream.write_all(&writer.into_frame()).unwrap();
}

fn send_download(stream: &mut TcpStream, seq: i32, md5: &str, net_type: NetType) {
    let mut writer = StreamWriter::new();
    writer
        .write_i32(MsgType::DownloadReq as i32)
        .write_i32(seq)
        .write_bytes(md5.as_bytes())
        .write_i64(0)
        .write_i64(0)
        .write_bytes(&[])
        .write_i32(net_type as i32);
    stream.write_all(&writer.into_frame()).unwrap();
}

fn read_response(stream: &mut TcpStream) -> Response {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).unwrap();
    let body_len = i64::from_le_bytes(header) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).unwrap();

    let mut reader = StreamReader::new(&body);
    Response {
        msg_type: reader.read_i32().unwrap(),
        seq: reader.read_i32().unwrap(),
        code: reader.read_i32().unwrap(),
        md5: String::from_utf8(reader.read_bytes(64).unwrap()).unwrap(),
        offset: reader.read_i64().unwrap(),
        file_size: reader.read_i64().unwrap(),
        data: reader.read_bytes(0).unwrap(),
    }
}

struct Fixture {
    _base: EventLoopThread,
    server: FileServer,
    _cache: tempfile::TempDir,
    addr: std::net::SocketAddr,
}

fn start_server() -> Fixture {
    let cache = tempfile::tempdir().unwrap();
    let mut base = EventLoopThread::new("transfer-base".into(), PollerKind::default(), None);
    let handle = base.start_loop();

    let config = ServerConfig {
        listen_ip: "127.0.0.1".to_string(),
        listen_port: 0,
        worker_threads: 1,
        poller: PollerKind::default(),
        reuse_port: false,
    };
    let server = FileServer::new(handle, &config, cache.path()).unwrap();
    server.start();
    let addr = server.listen_address().unwrap().to_socket_addr();

    Fixture {
        _base: base,
        server,
        _cache: cache,
        addr,
    }
}

fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                return stream;
            }
            Err(e) => {
                if std::time::Instant::now() >= deadline {
                    panic!("connect failed: {e}");
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_upload_then_download_round_trip() {
    let fixture = start_server();
    let mut stream = connect(fixture.addr);

    let md5 = "9f86d081884c7d659a2feaa0c55ad015";
    let payload = patterned_payload(3 * 512 * 1024 / 2); // 1.5 chunk sizes
    let total = payload.len() as i64;

    // Upload in 512 KiB chunks.
    let mut offset = 0i64;
    let mut seq = 0;
    while offset < total {
        let end = std::cmp::min(offset + 512 * 1024, total);
        send_upload(
            &mut stream,
            seq,
            md5,
            offset,
            total,
            &payload[offset as usize..end as usize],
        );
        let resp = read_response(&mut stream);
        assert_eq!(resp.msg_type, MsgType::UploadResp as i32);
        assert_eq!(resp.seq, seq);
        assert_eq!(resp.md5, md5);
        assert_eq!(resp.file_size, total);
        if end == total {
            assert_eq!(resp.code, TransferCode::Complete as i32);
            assert_eq!(resp.offset, total);
        } else {
            assert_eq!(resp.code, TransferCode::InProgress as i32);
        }
        offset = end;
        seq += 1;
    }

    // Download on a cellular link: 64 KiB chunks.
    let mut fetched = Vec::with_capacity(payload.len());
    loop {
        send_download(&mut stream, seq, md5, NetType::Cellular);
        let resp = read_response(&mut stream);
        assert_eq!(resp.msg_type, MsgType::DownloadResp as i32);
        assert_eq!(resp.md5, md5);
        assert_eq!(resp.file_size, total);
        assert_eq!(resp.offset as usize, fetched.len());
        assert!(resp.data.len() <= 64 * 1024);
        fetched.extend_from_slice(&resp.data);
        seq += 1;
        if resp.code == TransferCode::Complete as i32 {
            break;
        }
        assert_eq!(resp.code, TransferCode::InProgress as i32);
    }
    assert_eq!(fetched, payload);

    fixture.server.stop();
}

#[test]
fn test_duplicate_upload_short_circuits_to_complete() {
    let fixture = start_server();
    let mut stream = connect(fixture.addr);

    let md5 = "0cc175b9c0f1b6a831c399e269772661";
    let payload = b"one-chunk file";

    send_upload(&mut stream, 0, md5, 0, payload.len() as i64, payload);
    let resp = read_response(&mut stream);
    assert_eq!(resp.code, TransferCode::Complete as i32);

    // Same file again, from scratch: the server already has it.
    send_upload(&mut stream, 1, md5, 0, payload.len() as i64, payload);
    let resp = read_response(&mut stream);
    assert_eq!(resp.code, TransferCode::Complete as i32);
    assert_eq!(resp.offset, payload.len() as i64);
    assert!(resp.data.is_empty());

    fixture.server.stop();
}

#[test]
fn test_download_of_unknown_file_reports_not_exist() {
    let fixture = start_server();
    let mut stream = connect(fixture.addr);

    send_download(&mut stream, 7, "no-such-md5", NetType::Broadband);
    let resp = read_response(&mut stream);
    assert_eq!(resp.msg_type, MsgType::DownloadResp as i32);
    assert_eq!(resp.seq, 7);
    assert_eq!(resp.code, TransferCode::NotExist as i32);
    assert_eq!(resp.offset, 0);
    assert_eq!(resp.file_size, 0);
    assert!(resp.data.is_empty());

    fixture.server.stop();
}

#[test]
fn test_oversized_frame_closes_connection() {
    let fixture = start_server();
    let mut stream = connect(fixture.addr);

    // Claim a 1 GiB body.
    let bogus = (1i64 << 30).to_le_bytes();
    stream.write_all(&bogus).unwrap();

    // The server force-closes; the read side sees EOF (or a reset).
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, got {n} bytes"),
        Err(_) => {}
    }

    fixture.server.stop();
}
