//! End-to-end loopback test: a real `StreamFrontEnd` plus a real
//! `WorkerPool` servicing ECHO/REVERSE/TIME requests from a plain
//! `TcpStream` client.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use sc_net::stream::StreamFrontEnd;
use sc_queue::WorkQueue;
use sc_wire::stream::{STREAM_HEADER_SIZE, StreamHeader, StreamMessageType};
use sc_worker::{QueuedResponseSink, ResponseSink, WorkItem, WorkerPool};

fn send_and_recv(stream: &mut TcpStream, message_type: StreamMessageType, body: &[u8]) -> (StreamMessageType, Vec<u8>) {
    let header = StreamHeader::new(message_type, body.len() as u32);
    let mut frame = vec![0u8; STREAM_HEADER_SIZE + body.len()];
    header.encode(&mut frame[..STREAM_HEADER_SIZE]);
    frame[STREAM_HEADER_SIZE..].copy_from_slice(body);
    stream.write_all(&frame).unwrap();

    let mut response_header = [0u8; STREAM_HEADER_SIZE];
    stream.read_exact(&mut response_header).unwrap();
    let header = StreamHeader::decode(&response_header).unwrap();

    let mut response_body = vec![0u8; header.length as usize];
    stream.read_exact(&mut response_body).unwrap();

    (StreamMessageType::from_u32(header.message_type).unwrap(), response_body)
}

#[test]
fn echo_reverse_and_time_roundtrip_over_loopback() {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let queue = Arc::new(WorkQueue::<WorkItem>::new(16).unwrap());
    let responses = Arc::new(WorkQueue::new(16).unwrap());
    let sink: Arc<dyn ResponseSink> = Arc::new(QueuedResponseSink::new(Arc::clone(&responses)));
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut front = StreamFrontEnd::bind(addr, 8, Arc::clone(&queue), Arc::clone(&responses)).unwrap();
    let bound_addr = front.local_addr().unwrap();

    let workers = WorkerPool::start(2, queue, sink, Arc::clone(&shutdown));

    let front_shutdown = Arc::clone(&shutdown);
    let front_handle = thread::spawn(move || {
        front.run(&front_shutdown).unwrap();
    });

    // Give the front end a moment to start polling before connecting.
    thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(bound_addr).expect("failed to connect to stream front end");
    client.set_nodelay(true).unwrap();

    let (t, body) = send_and_recv(&mut client, StreamMessageType::Echo, b"hello");
    assert_eq!(t, StreamMessageType::Echo);
    assert_eq!(body, b"hello");

    let (t, body) = send_and_recv(&mut client, StreamMessageType::Reverse, b"abcdef");
    assert_eq!(t, StreamMessageType::Reverse);
    assert_eq!(body, b"fedcba\0");

    let (t, body) = send_and_recv(&mut client, StreamMessageType::Time, b"");
    assert_eq!(t, StreamMessageType::Time);
    assert_eq!(body.last(), Some(&0u8));
    assert!(std::str::from_utf8(&body[..body.len() - 1]).unwrap().ends_with('Z'));

    drop(client);
    shutdown.store(true, Ordering::Relaxed);
    front_handle.join().unwrap();
    workers.join();
}
