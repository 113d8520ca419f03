use std::time::Duration;

use portal_wire::{ClientOptions, ClientSocket, ServerOptions, ServerSocket};

#[test]
fn client_server_roundtrip() {
    let server = ServerSocket::bind(ServerOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    })
    .expect("bind");
    let addr = server.local_addr();

    let client =
        ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
    assert!(client.connect(Duration::from_secs(2)));

    client.send(vec![b"ping".to_vec()], Duration::from_secs(1)).expect("send");
    let (from, payload) = server.recv(Some(Duration::from_secs(2))).expect("server recv");
    assert_eq!(payload, b"ping");

    server.send(from, vec![b"pong".to_vec()]).expect("server send");
    let reply = client.recv(Duration::from_secs(2)).expect("client recv");
    assert_eq!(reply, b"pong");

    client.close(Some(Duration::from_secs(1)));
    server.close(Some(Duration::from_secs(1)));
}

#[test]
fn multiple_clients_get_independent_ids() {
    let server = ServerSocket::bind(ServerOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    })
    .expect("bind");
    let addr = server.local_addr();

    let client_a =
        ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
    let client_b =
        ClientSocket::new(ClientOptions { host: addr.ip().to_string(), port: addr.port(), ..Default::default() });
    assert!(client_a.connect(Duration::from_secs(2)));
    assert!(client_b.connect(Duration::from_secs(2)));

    client_a.send(vec![b"a".to_vec()], Duration::from_secs(1)).expect("send a");
    client_b.send(vec![b"b".to_vec()], Duration::from_secs(1)).expect("send b");

    let first = server.recv(Some(Duration::from_secs(2))).expect("recv a");
    let second = server.recv(Some(Duration::from_secs(2))).expect("recv b");
    assert_ne!(first.0, second.0);

    client_a.close(Some(Duration::from_secs(1)));
    client_b.close(Some(Duration::from_secs(1)));
    server.close(Some(Duration::from_secs(1)));
}
