use std::io::{Read, Write};
use std::net;
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use reactor_io::{Channel, ChannelEvent, ChannelState, Config, Processor, Protocol};

const TIMEOUT: Duration = Duration::from_secs(10);

fn processor_with_events(config: Config) -> (Processor, Receiver<ChannelEvent>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let processor = Processor::new(
        config,
        Box::new(move |event: ChannelEvent| {
            let _ = tx.lock().unwrap().send(event);
        }),
    )
    .unwrap();

    (processor, rx)
}

fn expect_opened(rx: &Receiver<ChannelEvent>) {
    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Opened(_) => {}
        other => panic!("expected Opened, got {:?}", other),
    }
}

#[test]
fn tcp_echo_single_packet() {
    let config = Config::default();
    let (processor, rx) = processor_with_events(config.clone());

    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut peer = net::TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();

    let channel = Channel::tcp(accepted, &config).unwrap();
    processor.add(&channel).unwrap();
    expect_opened(&rx);

    peer.write_all(&[0x41, 0x42, 0x43, 0x44, 0x45]).unwrap();

    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Read(_, payload) => {
            assert_eq!(vec![0x41, 0x42, 0x43, 0x44, 0x45], payload);
        }
        other => panic!("expected Read, got {:?}", other),
    }

    channel.write(vec![0x41, 0x42, 0x43, 0x44, 0x45]).unwrap();
    processor.flush(&channel).unwrap();

    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Flush(_, payload) => {
            assert_eq!(vec![0x41, 0x42, 0x43, 0x44, 0x45], payload);
        }
        other => panic!("expected Flush, got {:?}", other),
    }

    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Written(_, payload) => {
            assert_eq!(vec![0x41, 0x42, 0x43, 0x44, 0x45], payload);
        }
        other => panic!("expected Written, got {:?}", other),
    }

    let mut echo = [0u8; 5];
    peer.read_exact(&mut echo).unwrap();
    assert_eq!([0x41, 0x42, 0x43, 0x44, 0x45], echo);

    drop(peer);

    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Closed(_) => {}
        other => panic!("expected Closed, got {:?}", other),
    }

    assert_eq!(ChannelState::Closed, channel.state());

    processor.shutdown();
}

#[test]
fn backpressure_drains_after_peer_catches_up() {
    let config = Config::default();
    let (processor, rx) = processor_with_events(config.clone());

    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut peer = net::TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();

    let channel = Channel::tcp(accepted, &config).unwrap();
    processor.add(&channel).unwrap();
    expect_opened(&rx);

    // Far more than a loopback send buffer holds, so the drain must hit
    // saturation, set write interest and retry across iterations.
    let payload: Vec<u8> = (0..1_000_000).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    channel.write(payload).unwrap();
    processor.flush(&channel).unwrap();

    let reader = thread::spawn(move || {
        let mut received = Vec::with_capacity(1_000_000);
        let mut buf = [0u8; 8192];

        while received.len() < 1_000_000 {
            let n = peer.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        received
    });

    let mut written_count = 0;

    loop {
        match rx.recv_timeout(TIMEOUT).unwrap() {
            ChannelEvent::Flush(..) => continue,
            ChannelEvent::Written(_, written) => {
                written_count += 1;
                assert_eq!(1_000_000, written.len());
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    let received = reader.join().unwrap();
    assert_eq!(expected, received);

    // The buffer completed exactly once.
    thread::sleep(Duration::from_millis(200));
    while let Ok(event) = rx.try_recv() {
        if let ChannelEvent::Written(..) = event {
            written_count += 1;
        }
    }
    assert_eq!(1, written_count);

    processor.shutdown();
}

#[test]
fn udp_learns_remote_from_first_datagram() {
    let config = Config::new(Protocol::Udp);
    let (processor, rx) = processor_with_events(config.clone());

    let socket = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let local = socket.local_addr().unwrap();

    let channel = Channel::udp(socket, None, &config).unwrap();
    processor.add(&channel).unwrap();
    expect_opened(&rx);

    assert!(channel.remote_addr().is_none());

    let peer = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"hello", local).unwrap();

    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Read(_, payload) => assert_eq!(b"hello".to_vec(), payload),
        other => panic!("expected Read, got {:?}", other),
    }

    assert_eq!(Some(peer.local_addr().unwrap()), channel.remote_addr());

    // Replies go back to the learned remote.
    channel.write(b"world".to_vec()).unwrap();
    processor.flush(&channel).unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(b"world", &buf[..n]);
    assert_eq!(local, from);

    processor.shutdown();
}

#[test]
fn shutdown_closes_every_channel_exactly_once() {
    let config = Config::new(Protocol::Udp);
    let (processor, rx) = processor_with_events(config.clone());

    let mut channels = Vec::new();

    for _ in 0..10 {
        let socket = net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let channel = Channel::udp(socket, None, &config).unwrap();

        channel.write(vec![1, 2, 3]).unwrap();
        processor.add(&channel).unwrap();
        channels.push(channel);
    }

    for _ in 0..10 {
        expect_opened(&rx);
    }

    processor.shutdown();

    let mut closed = Vec::new();

    for _ in 0..10 {
        match rx.recv_timeout(TIMEOUT).unwrap() {
            ChannelEvent::Closed(channel) => closed.push(channel.id()),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    closed.sort_unstable();
    closed.dedup();
    assert_eq!(10, closed.len());

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    for channel in &channels {
        assert_eq!(ChannelState::Closed, channel.state());
    }
}

#[test]
fn double_remove_closes_once() {
    let config = Config::new(Protocol::Udp);
    let (processor, rx) = processor_with_events(config.clone());

    let socket = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let channel = Channel::udp(socket, None, &config).unwrap();

    processor.add(&channel).unwrap();
    expect_opened(&rx);

    processor.remove(&channel).unwrap();
    processor.remove(&channel).unwrap();

    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Closed(_) => {}
        other => panic!("expected Closed, got {:?}", other),
    }

    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    processor.shutdown();
}

#[test]
fn read_payload_is_independent_of_loop_buffers() {
    let config = Config::new(Protocol::Udp);
    let (processor, rx) = processor_with_events(config.clone());

    let socket = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let local = socket.local_addr().unwrap();

    let channel = Channel::udp(socket, None, &config).unwrap();
    processor.add(&channel).unwrap();
    expect_opened(&rx);

    let peer = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"first", local).unwrap();

    let mut first = match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Read(_, payload) => payload,
        other => panic!("expected Read, got {:?}", other),
    };

    // Mutating a delivered payload must not leak into later reads.
    first.iter_mut().for_each(|b| *b = 0xff);

    peer.send_to(b"second", local).unwrap();

    match rx.recv_timeout(TIMEOUT).unwrap() {
        ChannelEvent::Read(_, payload) => assert_eq!(b"second".to_vec(), payload),
        other => panic!("expected Read, got {:?}", other),
    }

    processor.shutdown();
}
