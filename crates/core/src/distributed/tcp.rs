//! TCP process group.
//!
//! Rendezvous uses `MASTER_ADDR:MASTER_PORT`: rank 0 listens, every other
//! rank connects and introduces itself with its rank. The resulting star
//! topology carries all collectives:
//! - broadcast: the source sends to rank 0, which forwards to everyone else
//! - barrier: rank 0 collects one arrival per peer, then releases them all
//!
//! Frame layout: `kind: u8 | len: u64 LE | payload`.
//!
//! Rank 0 listens on every interface, so connections that do not complete a
//! valid HELLO are dropped and accepting continues until the deadline.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use super::communicator::{BackendCapabilities, CommBackend, GroupOptions};
use super::error::{DistributedError, Result};

/// Backend names served by [`TcpBackend`].
pub const TCP_BACKEND_NAMES: &[&str] = &["tcp", "gloo"];

const FRAME_HELLO: u8 = 1;
const FRAME_BROADCAST: u8 = 2;
const FRAME_BARRIER: u8 = 3;
const FRAME_RELEASE: u8 = 4;

/// Largest payload accepted from the wire.
pub const MAX_FRAME_LEN: u64 = 1 << 30;
const HELLO_LEN: u64 = 8;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(100);
/// How long a fresh connection may take to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

fn write_frame(stream: &mut TcpStream, kind: u8, payload: &[u8]) -> io::Result<()> {
    let mut header = [0u8; 9];
    header[0] = kind;
    header[1..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream, max_len: u64) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header)?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[1..]);
    let len = u64::from_le_bytes(len);
    if len > max_len {
        return Err(DistributedError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok((header[0], payload))
}

fn expect_frame(stream: &mut TcpStream, kind: u8) -> Result<Vec<u8>> {
    expect_frame_within(stream, kind, MAX_FRAME_LEN)
}

fn expect_frame_within(stream: &mut TcpStream, kind: u8, max_len: u64) -> Result<Vec<u8>> {
    let (got, payload) = read_frame(stream, max_len)?;
    if got != kind {
        return Err(DistributedError::Protocol(format!(
            "expected frame kind {kind}, got {got}"
        )));
    }
    Ok(payload)
}

enum Role {
    /// Rank 0. `peers[i]` is the stream to rank `i + 1`.
    Root { peers: Vec<TcpStream> },
    Member { root: TcpStream },
}

struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

/// Process group over plain TCP sockets.
#[derive(Default)]
pub struct TcpBackend {
    group: Option<TcpGroup>,
}

impl TcpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn group_mut(&mut self) -> Result<&mut TcpGroup> {
        self.group.as_mut().ok_or(DistributedError::NotInitialized)
    }
}

impl CommBackend for TcpBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    fn is_initialized(&self) -> bool {
        self.group.is_some()
    }

    fn form_group(&mut self, options: &GroupOptions) -> Result<()> {
        if options.device_hint.is_some() {
            return Err(DistributedError::UnsupportedOption("device_hint"));
        }
        if !TCP_BACKEND_NAMES.contains(&options.backend.as_str()) {
            return Err(DistributedError::UnsupportedBackend(options.backend.clone()));
        }
        if options.world_size == 0 {
            return Err(DistributedError::InvalidWorldSize(0));
        }
        if options.rank >= options.world_size {
            return Err(DistributedError::InvalidRank {
                rank: options.rank,
                world_size: options.world_size,
            });
        }
        if self.group.is_some() {
            return Err(DistributedError::GroupFormation(
                "a process group already exists".to_string(),
            ));
        }

        let deadline = Instant::now() + options.timeout;
        let role = if options.rank == 0 {
            Role::Root {
                peers: accept_peers(options, deadline)?,
            }
        } else {
            Role::Member {
                root: connect_root(options, deadline)?,
            }
        };

        tracing::debug!(
            rank = options.rank,
            world_size = options.world_size,
            addr = %options.rendezvous.address(),
            "TCP process group formed"
        );
        self.group = Some(TcpGroup {
            rank: options.rank,
            world_size: options.world_size,
            role,
        });
        Ok(())
    }

    fn broadcast(&mut self, payload: Vec<u8>, src_rank: usize) -> Result<Vec<u8>> {
        let group = self.group_mut()?;
        if src_rank >= group.world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size: group.world_size,
            });
        }
        let rank = group.rank;
        match &mut group.role {
            Role::Root { peers } => {
                let data = if src_rank == 0 {
                    payload
                } else {
                    expect_frame(&mut peers[src_rank - 1], FRAME_BROADCAST)?
                };
                for (i, peer) in peers.iter_mut().enumerate() {
                    if i + 1 != src_rank {
                        write_frame(peer, FRAME_BROADCAST, &data)?;
                    }
                }
                Ok(data)
            }
            Role::Member { root } => {
                if rank == src_rank {
                    write_frame(root, FRAME_BROADCAST, &payload)?;
                    Ok(payload)
                } else {
                    expect_frame(root, FRAME_BROADCAST)
                }
            }
        }
    }

    fn barrier(&mut self, _device_hint: Option<usize>) -> Result<()> {
        let group = self.group_mut()?;
        match &mut group.role {
            Role::Root { peers } => {
                for peer in peers.iter_mut() {
                    expect_frame(peer, FRAME_BARRIER)?;
                }
                for peer in peers.iter_mut() {
                    write_frame(peer, FRAME_RELEASE, &[])?;
                }
            }
            Role::Member { root } => {
                write_frame(root, FRAME_BARRIER, &[])?;
                expect_frame(root, FRAME_RELEASE)?;
            }
        }
        Ok(())
    }

    fn destroy_group(&mut self) -> Result<()> {
        if let Some(group) = self.group.take() {
            let streams: Vec<TcpStream> = match group.role {
                Role::Root { peers } => peers,
                Role::Member { root } => vec![root],
            };
            for stream in streams {
                // Peer may already be gone.
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            tracing::debug!(rank = group.rank, "TCP process group destroyed");
        }
        Ok(())
    }
}

fn timeout_error(options: &GroupOptions) -> DistributedError {
    DistributedError::Timeout {
        timeout_ms: options.timeout.as_millis() as u64,
    }
}

/// Rank 0: accept one connection per peer and order them by rank.
fn accept_peers(options: &GroupOptions, deadline: Instant) -> Result<Vec<TcpStream>> {
    let bind_addr = format!("0.0.0.0:{}", options.rendezvous.master_port);
    let listener = TcpListener::bind(&bind_addr).map_err(|e| {
        DistributedError::GroupFormation(format!("failed to bind {bind_addr}: {e}"))
    })?;
    listener.set_nonblocking(true)?;

    let expected = options.world_size - 1;
    let mut slots: Vec<Option<TcpStream>> = (0..expected).map(|_| None).collect();
    let mut joined = 0;

    while joined < expected {
        let now = Instant::now();
        if now >= deadline {
            tracing::error!(joined, expected, "rendezvous timed out waiting for peers");
            return Err(timeout_error(options));
        }
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let peer_rank = match read_hello(&mut stream, options, deadline - now) {
                    Ok(peer_rank) => peer_rank,
                    Err(e) => {
                        tracing::warn!(
                            peer = %peer,
                            error = %e,
                            "dropping connection without a valid hello"
                        );
                        continue;
                    }
                };
                let slot = &mut slots[peer_rank - 1];
                if slot.is_some() {
                    return Err(DistributedError::GroupFormation(format!(
                        "rank {peer_rank} joined twice"
                    )));
                }
                stream.set_read_timeout(None)?;
                stream.set_nodelay(true)?;
                tracing::trace!(peer = %peer, peer_rank, "peer joined");
                *slot = Some(stream);
                joined += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                return Err(DistributedError::GroupFormation(format!("accept failed: {e}")));
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

/// Rank > 0: connect to rank 0, retrying until the deadline.
fn connect_root(options: &GroupOptions, deadline: Instant) -> Result<TcpStream> {
    let addr = options.rendezvous.address();
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect(&addr) {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                write_frame(
                    &mut stream,
                    FRAME_HELLO,
                    &(options.rank as u64).to_le_bytes(),
                )?;
                return Ok(stream);
            }
            Err(e) if Instant::now() + CONNECT_RETRY < deadline => {
                tracing::trace!(attempt, addr = %addr, error = %e, "retrying connection to rank 0");
                attempt += 1;
                std::thread::sleep(CONNECT_RETRY);
            }
            Err(e) => {
                tracing::error!(attempt, addr = %addr, error = %e, "could not reach rank 0");
                return Err(timeout_error(options));
            }
        }
    }
}

/// Read and validate the HELLO a freshly accepted connection must send.
fn read_hello(stream: &mut TcpStream, options: &GroupOptions, remaining: Duration) -> Result<usize> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(remaining.min(HELLO_TIMEOUT)))?;
    let hello = expect_frame_within(stream, FRAME_HELLO, HELLO_LEN)?;
    let peer_rank = decode_rank(&hello)?;
    if peer_rank == 0 || peer_rank >= options.world_size {
        return Err(DistributedError::Protocol(format!(
            "announced invalid rank {peer_rank}"
        )));
    }
    Ok(peer_rank)
}

fn decode_rank(payload: &[u8]) -> Result<usize> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| DistributedError::Protocol("malformed hello frame".to_string()))?;
    Ok(u64::from_le_bytes(bytes) as usize)
}
