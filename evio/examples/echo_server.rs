use evio::{EventLoop, InetAddress, PortReuse, TcpServer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(18080);

    let mut base_loop = EventLoop::new().expect("failed to create event loop");
    let addr = InetAddress::any(port);
    let server = TcpServer::new(base_loop.handle(), &addr, "echo", PortReuse::Enabled)
        .expect("failed to bind");

    server.set_connection_callback(|conn| {
        eprintln!(
            "{} -> {} is {}",
            conn.peer_address(),
            conn.local_address(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    });
    server.set_message_callback(|conn, buffer, _when| {
        let bytes = buffer.retrieve_all_as_bytes();
        conn.send(&bytes);
    });

    eprintln!("echo server on 0.0.0.0:{port}");
    server.start(2);
    base_loop.run();
}
