use std::io::{Read, Write};
use std::net::TcpStream;

fn main() {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:18080".to_string());
    let message = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "hello world".to_string());

    let mut stream = TcpStream::connect(&addr).expect("connect failed");
    stream.write_all(message.as_bytes()).expect("write failed");
    stream
        .shutdown(std::net::Shutdown::Write)
        .expect("shutdown failed");

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("read failed");
    println!("{}", String::from_utf8_lossy(&reply));
    assert_eq!(reply, message.as_bytes());
}
