//! Stream (TCP) front end: accept loop, partial-read framing state machine,
//! and response writer.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use sc_pool::{BufferHandle, BufferPool, ReadState};
use sc_queue::WorkQueue;
use sc_wire::stream::{MAX_STREAM_BODY_LEN, STREAM_HEADER_SIZE, StreamHeader, StreamMessageType};
use sc_worker::{ConnId, WorkItem};
use tracing::{debug, info, warn};

pub const MAX_EVENTS_PER_CONN: usize = 2;
pub const MIN_EVENTS: usize = 64;
pub const ABSOLUTE_MAX_EVENTS: usize = 65536;
pub const MAX_EMPTY_POLLS: u32 = 10;
pub const EPOLL_TIMEOUT_MS: u64 = 10;

const LISTENER_TOKEN: Token = Token(usize::MAX);

fn events_capacity(pool_size: usize) -> usize {
    (pool_size * MAX_EVENTS_PER_CONN).clamp(MIN_EVENTS, ABSOLUTE_MAX_EVENTS)
}

struct Connection {
    stream: TcpStream,
    handle: BufferHandle,
    write_backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,
}

/// Owns the listening socket, live connection table, and buffer pool. Runs
/// solely on the main thread; workers never touch any of this.
pub struct StreamFrontEnd {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    pool: BufferPool,
    next_token: usize,
    empty_polls: u32,
    events_cap: usize,
    queue: Arc<WorkQueue<WorkItem>>,
    responses: Arc<WorkQueue<(ConnId, StreamMessageType, Vec<u8>)>>,
}

impl StreamFrontEnd {
    pub fn bind(
        addr: SocketAddr,
        pool_size: usize,
        queue: Arc<WorkQueue<WorkItem>>,
        responses: Arc<WorkQueue<(ConnId, StreamMessageType, Vec<u8>)>>,
    ) -> io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(%addr, pool_size, "stream front end listening");

        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            pool: BufferPool::new(pool_size),
            next_token: 0,
            empty_polls: 0,
            events_cap: events_capacity(pool_size),
            queue,
            responses,
        })
    }

    /// Runs the adaptive-polling accept/read/write loop until `shutdown` is
    /// observed set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_cap);
        while !shutdown.load(Ordering::Relaxed) {
            let timeout =
                if self.empty_polls < MAX_EMPTY_POLLS { Duration::ZERO } else { Duration::from_millis(EPOLL_TIMEOUT_MS) };
            self.poll.poll(&mut events, Some(timeout))?;

            if events.is_empty() {
                self.empty_polls = self.empty_polls.saturating_add(1);
            } else {
                self.empty_polls = 0;
                let hits: Vec<(Token, bool, bool)> =
                    events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
                for (token, readable, writable) in hits {
                    if token == LISTENER_TOKEN {
                        self.accept_all();
                    } else {
                        self.service(token, readable, writable);
                    }
                }
            }

            self.drain_responses();
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, error = %e, "failed to set TCP_NODELAY, continuing anyway");
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        warn!(%peer, error = %e, "failed to register accepted connection");
                        continue;
                    }

                    let mut handle = self.pool.acquire();
                    if let Ok(buf) = self.pool.get_mut(&mut handle) {
                        buf.fd = stream.as_raw_fd();
                    }

                    info!(%peer, ?token, "accepted connection");
                    self.connections.insert(token, Connection { stream, handle, write_backlog: VecDeque::new(), writable_armed: false });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn service(&mut self, token: Token, readable: bool, writable: bool) {
        if readable && self.read_loop(token) == ConnOutcome::Disconnected {
            self.disconnect(token);
            return;
        }
        if writable && self.drain_backlog(token) == ConnOutcome::Disconnected {
            self.disconnect(token);
        }
    }

    /// Drives the partial-read state machine until `WouldBlock` or an
    /// error; a completed message re-enters the loop for the next one on
    /// the same connection.
    fn read_loop(&mut self, token: Token) -> ConnOutcome {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else { return ConnOutcome::Disconnected };
            let Ok(buf) = self.pool.get_mut(&mut conn.handle) else { return ConnOutcome::Disconnected };

            match &mut buf.state {
                ReadState::Header { buf: header_buf, filled } => {
                    match conn.stream.read(&mut header_buf[*filled..]) {
                        Ok(0) => return ConnOutcome::Disconnected,
                        Ok(n) => {
                            *filled += n;
                            if *filled == STREAM_HEADER_SIZE {
                                let header = match StreamHeader::decode(header_buf) {
                                    Ok(h) if h.length as usize <= MAX_STREAM_BODY_LEN => h,
                                    _ => {
                                        debug!(?token, "invalid stream header, closing");
                                        return ConnOutcome::Disconnected;
                                    }
                                };
                                buf.state = ReadState::Body { header, buf: vec![0; header.length as usize], filled: 0 };
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ConnOutcome::WouldBlock,
                        Err(e) => {
                            debug!(?token, error = %e, "read error in header state");
                            return ConnOutcome::Disconnected;
                        }
                    }
                }
                ReadState::Body { header, buf: body_buf, filled } => {
                    let header = *header;
                    if *filled == body_buf.len() {
                        let Some(message_type) = StreamMessageType::from_u32(header.message_type) else {
                            debug!(?token, "unknown stream message type, closing");
                            return ConnOutcome::Disconnected;
                        };
                        let body = std::mem::take(body_buf);
                        buf.reset_for_next_message();

                        // Blocking add: the main thread is a sanctioned
                        // suspension point here (spec §5), and back-pressure
                        // on a full queue is the documented contract, not
                        // message loss.
                        let origin = ConnId(token.0);
                        if let Err(e) = self.queue.add(WorkItem { origin, message_type, body }) {
                            warn!(?token, error = %e, "failed to enqueue message, dropping");
                        }
                        continue;
                    }

                    match conn.stream.read(&mut body_buf[*filled..]) {
                        Ok(0) => return ConnOutcome::Disconnected,
                        Ok(n) => *filled += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ConnOutcome::WouldBlock,
                        Err(e) => {
                            debug!(?token, error = %e, "read error in body state");
                            return ConnOutcome::Disconnected;
                        }
                    }
                }
            }
        }
    }

    /// Pulls every response queued by the worker pool since the last cycle
    /// and writes (or backlogs) it to its originating connection.
    fn drain_responses(&mut self) {
        while let Ok((origin, message_type, body)) = self.responses.try_pop() {
            let token = Token(origin.0);
            self.send_frame(token, message_type, body);
        }
    }

    fn send_frame(&mut self, token: Token, message_type: StreamMessageType, body: Vec<u8>) {
        let Some(conn) = self.connections.get_mut(&token) else {
            debug!(?token, "response for closed connection, dropping");
            return;
        };

        let header = StreamHeader::new(message_type, body.len() as u32);
        let mut frame = vec![0u8; STREAM_HEADER_SIZE + body.len()];
        header.encode(&mut frame[..STREAM_HEADER_SIZE]);
        frame[STREAM_HEADER_SIZE..].copy_from_slice(&body);

        if !conn.write_backlog.is_empty() {
            conn.write_backlog.push_back(frame);
            return;
        }

        match conn.stream.write(&frame) {
            Ok(n) if n == frame.len() => {
                info!(?token, ?message_type, "sent response");
            }
            Ok(n) => {
                conn.write_backlog.push_back(frame[n..].to_vec());
                self.arm_writable(token);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.write_backlog.push_back(frame);
                self.arm_writable(token);
            }
            Err(e) => {
                warn!(?token, error = %e, "failed to send response, aborting send");
            }
        }
    }

    fn arm_writable(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            if !conn.writable_armed
                && self.poll.registry().reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE).is_ok()
            {
                conn.writable_armed = true;
            }
        }
    }

    fn drain_backlog(&mut self, token: Token) -> ConnOutcome {
        let Some(conn) = self.connections.get_mut(&token) else { return ConnOutcome::Disconnected };

        while let Some(front) = conn.write_backlog.front_mut() {
            match conn.stream.write(front) {
                Ok(0) => return ConnOutcome::Disconnected,
                Ok(n) if n == front.len() => {
                    conn.write_backlog.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                    return ConnOutcome::WouldBlock;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ConnOutcome::WouldBlock,
                Err(e) => {
                    debug!(?token, error = %e, "backlog write failed");
                    return ConnOutcome::Disconnected;
                }
            }
        }

        if conn.writable_armed && self.poll.registry().reregister(&mut conn.stream, token, Interest::READABLE).is_ok() {
            conn.writable_armed = false;
        }
        ConnOutcome::Alive
    }

    fn disconnect(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            let _ = self.pool.release(conn.handle);
            debug!(?token, "connection closed");
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ConnOutcome {
    Alive,
    WouldBlock,
    Disconnected,
}
