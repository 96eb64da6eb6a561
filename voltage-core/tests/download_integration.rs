//! End-to-end download behaviour against loopback trackers and peers.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use sha1::{Digest, Sha1};
use voltage_core::config::VoltageConfig;
use voltage_core::events::{DownloadEvent, NullSink};
use voltage_core::storage::PieceStore;
use voltage_core::torrent::{InfoHash, PieceIndex, TorrentDescriptor};
use voltage_core::DownloadCoordinator;

const INFO_HASH: [u8; 20] = [0x5C; 20];

fn descriptor(content: &[u8], piece_length: u32, announce: String) -> Arc<TorrentDescriptor> {
    let hashes = content
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect();

    let descriptor = TorrentDescriptor::new(
        InfoHash::new(INFO_HASH),
        "loopback".to_string(),
        piece_length,
        hashes,
        vec![(vec!["payload.bin".to_string()], content.len() as u64)],
        vec![announce],
    )
    .unwrap();
    Arc::new(descriptor)
}

fn remote_handshake(info_hash: [u8; 20]) -> Vec<u8> {
    let mut handshake = vec![19];
    handshake.extend_from_slice(b"BitTorrent protocol");
    handshake.extend_from_slice(&[0; 8]);
    handshake.extend_from_slice(&info_hash);
    handshake.extend_from_slice(b"-SEED01-000000000000");
    handshake
}

/// Serves every REQUEST from `content` to the first connecting peer.
fn spawn_seeder(content: Arc<Vec<u8>>, piece_length: usize, piece_count: usize) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .unwrap();

        let mut handshake = [0u8; 68];
        if stream.read_exact(&mut handshake).is_err() || handshake[28..48] != INFO_HASH {
            return;
        }

        let mut greeting = remote_handshake(INFO_HASH);
        let bitfield_len = piece_count.div_ceil(8);
        greeting.extend_from_slice(&(1 + bitfield_len as u32).to_be_bytes());
        greeting.push(5);
        greeting.extend(std::iter::repeat_n(0xFF, bitfield_len));
        greeting.extend_from_slice(&[0, 0, 0, 1, 1]);
        if stream.write_all(&greeting).is_err() {
            return;
        }

        loop {
            let mut length = [0u8; 4];
            if stream.read_exact(&mut length).is_err() {
                return;
            }
            let length = u32::from_be_bytes(length) as usize;
            let mut payload = vec![0u8; length];
            if stream.read_exact(&mut payload).is_err() {
                return;
            }
            if length != 13 || payload[0] != 6 {
                continue;
            }

            let index = u32::from_be_bytes(payload[1..5].try_into().unwrap());
            let offset = u32::from_be_bytes(payload[5..9].try_into().unwrap());
            let requested = u32::from_be_bytes(payload[9..13].try_into().unwrap()) as usize;

            let start = index as usize * piece_length + offset as usize;
            let end = (start + requested).min(content.len());
            let block = &content[start..end];

            let mut message = Vec::with_capacity(13 + block.len());
            message.extend_from_slice(&(9 + block.len() as u32).to_be_bytes());
            message.push(7);
            message.extend_from_slice(&index.to_be_bytes());
            message.extend_from_slice(&offset.to_be_bytes());
            message.extend_from_slice(block);
            if stream.write_all(&message).is_err() {
                return;
            }
        }
    });

    port
}

/// Answers CONNECT and ANNOUNCE, reporting a single peer on `peer_port`.
fn spawn_udp_tracker(peer_port: u16) -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();
    socket
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((received, from)) = socket.recv_from(&mut buf) {
            let transaction = &buf[12..16];
            let mut reply = Vec::new();

            match received {
                16 => {
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(transaction);
                    reply.extend_from_slice(&0x1234_5678_9ABC_DEF0u64.to_be_bytes());
                }
                98 => {
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(transaction);
                    reply.extend_from_slice(&60u32.to_be_bytes());
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&[127, 0, 0, 1]);
                    reply.extend_from_slice(&peer_port.to_be_bytes());
                }
                _ => continue,
            }

            if socket.send_to(&reply, from).is_err() {
                return;
            }
        }
    });

    port
}

#[test]
fn test_two_piece_halves_complete_after_forced_flush() {
    let content: Vec<u8> = (0..32768)
        .map(|position| if position < 16384 { 0x41 } else { 0x42 })
        .collect();
    let descriptor = descriptor(&content, 16384, "udp://127.0.0.1:6969".to_string());
    let dir = tempfile::tempdir().unwrap();
    let mut store = PieceStore::with_capacity(descriptor, dir.path().to_path_buf(), 16, 4);

    store.allocate(&mut NullSink).unwrap();
    for (piece, offset) in [(1, 8192), (0, 8192), (1, 0), (0, 0)] {
        let byte = if piece == 0 { 0x41 } else { 0x42 };
        store
            .commit(PieceIndex::new(piece), offset, &[byte; 8192])
            .unwrap();
    }
    store.flush(true).unwrap();
    store.check(&BTreeSet::new(), &mut NullSink).unwrap();

    assert!(store.has_piece(PieceIndex::new(0)));
    assert!(store.has_piece(PieceIndex::new(1)));
    assert!(store.is_complete());
    assert_eq!(std::fs::read(dir.path().join("payload.bin")).unwrap(), content);
}

#[test]
fn test_add_peer_twice_returns_same_connection() {
    let content = vec![7u8; 4096];
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = DownloadCoordinator::new(
        descriptor(&content, 4096, "udp://127.0.0.1:6969".to_string()),
        dir.path().to_path_buf(),
        VoltageConfig::for_testing(),
        Box::new(NullSink),
    )
    .unwrap();

    let first = coordinator.add_peer("192.168.1.5", 6881).unwrap();
    let second = coordinator.add_peer("192.168.1.5", 6881).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 6881));
    assert_eq!(coordinator.stats().known_peers, 1);
}

#[test]
fn test_downloads_from_loopback_swarm() {
    let piece_length = 16384usize;
    let content: Arc<Vec<u8>> = Arc::new(
        (0..piece_length * 3 + 5000)
            .map(|position| (position * 31 % 251) as u8)
            .collect(),
    );
    let seeder_port = spawn_seeder(Arc::clone(&content), piece_length, 4);
    let tracker_port = spawn_udp_tracker(seeder_port);

    let dir = tempfile::tempdir().unwrap();
    let (sender, receiver) = mpsc::channel();
    let mut coordinator = DownloadCoordinator::new(
        descriptor(
            &content,
            piece_length as u32,
            format!("udp://127.0.0.1:{tracker_port}/announce"),
        ),
        dir.path().to_path_buf(),
        VoltageConfig::for_testing(),
        Box::new(sender),
    )
    .unwrap();

    coordinator.start().unwrap();
    for _ in 0..3000 {
        coordinator.tick().unwrap();
        if coordinator.is_complete() {
            break;
        }
    }

    assert!(coordinator.is_complete(), "stats: {:?}", coordinator.stats());
    let stats = coordinator.stats();
    assert_eq!(stats.verified_pieces, 4);
    assert_eq!(stats.remaining, 0);
    assert!(stats.downloaded >= content.len() as u64);

    let seeder = SocketAddrV4::new(Ipv4Addr::LOCALHOST, seeder_port);
    let peer = coordinator.peer(seeder).unwrap();
    assert!(peer.remote_id().is_some());
    assert!(!peer.is_errored());

    coordinator.finish().unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("payload.bin")).unwrap(),
        *content
    );
    assert!(
        receiver
            .try_iter()
            .any(|event| matches!(event, DownloadEvent::CheckEnd))
    );
}

#[test]
fn test_peer_with_wrong_info_hash_is_killed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let _ = stream.write_all(&remote_handshake([0xEE; 20]));
            let mut sink = [0u8; 256];
            let _ = stream.read(&mut sink);
        }
    });

    let content = vec![9u8; 4096];
    let dir = tempfile::tempdir().unwrap();
    let (sender, receiver) = mpsc::channel();
    let mut coordinator = DownloadCoordinator::new(
        descriptor(&content, 4096, "udp://127.0.0.1:9".to_string()),
        dir.path().to_path_buf(),
        VoltageConfig::for_testing(),
        Box::new(sender),
    )
    .unwrap();
    coordinator.start().unwrap();

    let address = coordinator
        .add_peer("127.0.0.1", i64::from(port))
        .unwrap();
    for _ in 0..500 {
        coordinator.tick().unwrap();
        if coordinator.peer(address).is_some_and(|peer| peer.is_errored()) {
            break;
        }
    }

    let peer = coordinator.peer(address).unwrap();
    assert_eq!(peer.error(), Some("Invalid torrent hash"));
    assert_eq!(coordinator.stats().connected_peers, 0);

    let disconnect = receiver.try_iter().find_map(|event| match event {
        DownloadEvent::PeerDisconnected { address, reason } => Some((address, reason)),
        _ => None,
    });
    assert_eq!(
        disconnect,
        Some((address, Some("Invalid torrent hash".to_string())))
    );

    // Errored peers are never reconnected
    coordinator.tick().unwrap();
    assert_eq!(coordinator.stats().connected_peers, 0);
    assert_eq!(coordinator.stats().known_peers, 1);
}
