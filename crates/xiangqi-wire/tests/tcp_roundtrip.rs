use std::{
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
    thread,
    time::Duration,
};

use xiangqi_wire::{ConnectionManager, PollEvent, Token, encode_frame};

fn free_addr() -> SocketAddr {
    let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.local_addr().unwrap()
}

#[test]
fn accepts_reads_and_replies() {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), free_addr().port());
    let mut manager = ConnectionManager::bind(addr).unwrap();

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&encode_frame(b"LOGIN {\"username\":\"a\"}")).unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        body
    });

    let mut client_token: Option<Token> = None;
    let mut received: Option<Vec<u8>> = None;
    let mut events = Vec::new();

    while received.is_none() {
        events.clear();
        manager.poll(Some(Duration::from_millis(50)), &mut events).unwrap();
        for ev in events.drain(..) {
            match ev {
                PollEvent::Accept { token, .. } => client_token = Some(token),
                PollEvent::Frame { token, payload } => {
                    assert_eq!(Some(token), client_token);
                    assert_eq!(payload, b"LOGIN {\"username\":\"a\"}");
                    received = Some(payload);
                }
                PollEvent::Disconnect { .. } => panic!("unexpected disconnect"),
            }
        }
    }

    let token = client_token.unwrap();
    assert!(manager.send(token, b"LOGIN_SUCCESS {}"));
    // one more poll tick lets the write land even if it didn't flush inline
    manager.poll(Some(Duration::from_millis(50)), &mut events).unwrap();

    let reply = client.join().unwrap();
    assert_eq!(reply, b"LOGIN_SUCCESS {}");
}

#[test]
fn disconnect_is_reported() {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), free_addr().port());
    let mut manager = ConnectionManager::bind(addr).unwrap();

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let stream = TcpStream::connect(addr).unwrap();
        drop(stream);
    });

    let mut saw_accept = false;
    let mut saw_disconnect = false;
    let mut events = Vec::new();

    while !saw_disconnect {
        events.clear();
        manager.poll(Some(Duration::from_millis(50)), &mut events).unwrap();
        for ev in events.drain(..) {
            match ev {
                PollEvent::Accept { .. } => saw_accept = true,
                PollEvent::Disconnect { .. } => saw_disconnect = true,
                PollEvent::Frame { .. } => panic!("no frame expected"),
            }
        }
    }

    assert!(saw_accept);
    client.join().unwrap();
}

#[test]
fn socket_buf_hint_does_not_break_accept_or_roundtrip() {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), free_addr().port());
    let mut manager = ConnectionManager::bind_with_socket_buf(addr, Some(16 * 1024)).unwrap();

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&encode_frame(b"PLAYER_LIST")).unwrap();
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        body
    });

    let mut client_token: Option<Token> = None;
    let mut received = false;
    let mut events = Vec::new();

    while !received {
        events.clear();
        manager.poll(Some(Duration::from_millis(50)), &mut events).unwrap();
        for ev in events.drain(..) {
            match ev {
                PollEvent::Accept { token, .. } => client_token = Some(token),
                PollEvent::Frame { payload, .. } => {
                    assert_eq!(payload, b"PLAYER_LIST");
                    received = true;
                }
                PollEvent::Disconnect { .. } => panic!("unexpected disconnect"),
            }
        }
    }

    assert!(manager.send(client_token.unwrap(), b"INFO {}"));
    manager.poll(Some(Duration::from_millis(50)), &mut events).unwrap();
    assert_eq!(client.join().unwrap(), b"INFO {}");
}
