//! Socket lifecycle for sessions: the listening acceptor, the outbound
//! initiator and the connected stream, with optional TLS layered on top.
//! Transports are plain state holders; readiness dispatch and the decisions
//! about what to do with bytes stay in the session.

use crate::buffer::Buffer;
use crate::error::NetResult;
use crate::tls::{PeerInfo, TlsContext};
use mio::net::{TcpListener, TcpStream};
use rustls::{ClientConnection, ServerConnection};
use std::io;
use std::net::{Shutdown, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Accepting,
    Connected,
    Disconnected,
    Error,
}

/// Listening socket for the server side of a session.
pub struct Listener {
    sock: TcpListener,
    pub state: TransportState,
}

impl Listener {
    pub fn bind(addr: &SocketAddr) -> NetResult<Listener> {
        let sock = TcpListener::bind(addr)?;
        Ok(Listener {
            sock,
            state: TransportState::Accepting,
        })
    }

    #[inline]
    pub fn socket(&self) -> &TcpListener {
        &self.sock
    }

    #[inline]
    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.sock.local_addr().map_err(Into::into)
    }

    /// Accepts one pending connection, `None` when the wakeup was spurious.
    pub fn accept(&self) -> NetResult<Option<(TcpStream, SocketAddr)>> {
        match self.sock.accept() {
            Ok((stream, peer)) => Ok(Some((stream, peer))),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

enum TlsState {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

impl TlsState {
    fn is_handshaking(&self) -> bool {
        match self {
            TlsState::Client(conn) => conn.is_handshaking(),
            TlsState::Server(conn) => conn.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsState::Client(conn) => conn.wants_write(),
            TlsState::Server(conn) => conn.wants_write(),
        }
    }

    fn complete_io(&mut self, sock: &mut TcpStream) -> io::Result<(usize, usize)> {
        match self {
            TlsState::Client(conn) => conn.complete_io(sock),
            TlsState::Server(conn) => conn.complete_io(sock),
        }
    }

    /// Pushes any pending TLS records out, stopping when the socket blocks.
    fn flush(&mut self, sock: &mut TcpStream) -> NetResult<()> {
        while self.wants_write() {
            let result = match self {
                TlsState::Client(conn) => conn.write_tls(sock),
                TlsState::Server(conn) => conn.write_tls(sock),
            };
            match result {
                Ok(_) => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// An initiated or accepted connection, optionally TLS-wrapped.
pub struct Conn {
    sock: TcpStream,
    tls: Option<TlsState>,
    pub state: TransportState,
    peer: Option<SocketAddr>,
}

impl Conn {
    /// Starts a nonblocking connect toward `addr`.
    pub fn connect(addr: &SocketAddr) -> NetResult<Conn> {
        let sock = TcpStream::connect(addr)?;
        sock.set_nodelay(true)?;
        Ok(Conn {
            sock,
            tls: None,
            state: TransportState::Connecting,
            peer: Some(*addr),
        })
    }

    /// Wraps a freshly accepted stream.
    pub fn accepted(sock: TcpStream, peer: SocketAddr) -> NetResult<Conn> {
        sock.set_nodelay(true)?;
        Ok(Conn {
            sock,
            tls: None,
            state: TransportState::Connected,
            peer: Some(peer),
        })
    }

    #[inline]
    pub fn socket(&self) -> &TcpStream {
        &self.sock
    }

    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Resolves a pending connect after a writable event. `Ok(true)` once
    /// the socket is live, `Ok(false)` for a spurious wakeup.
    pub fn finish_connect(&mut self) -> NetResult<bool> {
        if self.state != TransportState::Connecting {
            return Ok(self.state == TransportState::Connected);
        }

        if let Some(err) = self.sock.take_error()? {
            self.state = TransportState::Error;
            return Err(err.into());
        }

        match self.sock.peer_addr() {
            Ok(peer) => {
                self.peer = Some(peer);
                self.state = TransportState::Connected;
                Ok(true)
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => {
                self.state = TransportState::Error;
                Err(err.into())
            }
        }
    }

    /// Layers a TLS session over the socket; the handshake is driven by
    /// subsequent `drive_handshake` calls.
    pub fn start_tls(&mut self, ctx: &TlsContext) -> NetResult<()> {
        let tls = if ctx.is_server() {
            TlsState::Server(Box::new(ctx.new_server_conn()?))
        } else {
            TlsState::Client(Box::new(ctx.new_client_conn()?))
        };
        self.tls = Some(tls);
        Ok(())
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    #[inline]
    pub fn handshaking(&self) -> bool {
        self.tls
            .as_ref()
            .map(|tls| tls.is_handshaking())
            .unwrap_or(false)
    }

    /// Advances the TLS handshake. `Ok(true)` when it has completed.
    pub fn drive_handshake(&mut self) -> NetResult<bool> {
        let sock = &mut self.sock;
        match self.tls.as_mut() {
            Some(tls) => {
                while tls.is_handshaking() {
                    match tls.complete_io(sock) {
                        Ok(_) => continue,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(false)
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(true)
            }
            None => Ok(true),
        }
    }

    /// Runs the context's post-handshake verify capability.
    pub fn verify_peer(&self, ctx: &TlsContext) -> bool {
        let (certificates, server_side) = match &self.tls {
            Some(TlsState::Client(conn)) => (conn.peer_certificates(), false),
            Some(TlsState::Server(conn)) => (conn.peer_certificates(), true),
            None => (None, false),
        };
        ctx.verify_peer(&PeerInfo {
            certificates,
            server_side,
        })
    }

    /// Reads everything available into the buffer.
    pub fn read_into(&mut self, buf: &mut Buffer) -> NetResult<usize> {
        let sock = &mut self.sock;
        match self.tls.as_mut() {
            None => buf.ingress(sock),
            Some(TlsState::Client(conn)) => {
                let mut stream = rustls::Stream::new(conn.as_mut(), sock);
                buf.ingress(&mut stream)
            }
            Some(TlsState::Server(conn)) => {
                let mut stream = rustls::Stream::new(conn.as_mut(), sock);
                buf.ingress(&mut stream)
            }
        }
    }

    /// Writes buffered bytes to the wire. Pending TLS records are flushed
    /// first so a bare writable event makes progress even with an empty
    /// buffer.
    pub fn write_from(&mut self, buf: &mut Buffer) -> NetResult<usize> {
        let sock = &mut self.sock;
        match self.tls.as_mut() {
            None => {
                if buf.is_empty() {
                    return Ok(0);
                }
                buf.egress(sock)
            }
            Some(tls) => {
                tls.flush(sock)?;
                if buf.is_empty() {
                    return Ok(0);
                }
                let written = match tls {
                    TlsState::Client(conn) => {
                        let mut stream = rustls::Stream::new(conn.as_mut(), sock);
                        buf.egress(&mut stream)?
                    }
                    TlsState::Server(conn) => {
                        let mut stream = rustls::Stream::new(conn.as_mut(), sock);
                        buf.egress(&mut stream)?
                    }
                };
                Ok(written)
            }
        }
    }

    /// True when the transport has bytes it still wants to push.
    pub fn wants_write(&self) -> bool {
        self.tls
            .as_ref()
            .map(|tls| tls.wants_write())
            .unwrap_or(false)
    }

    /// Closes the socket. Errors are ignored; the peer may already be gone.
    pub fn close(&mut self) {
        let _ = self.sock.shutdown(Shutdown::Both);
        self.state = TransportState::Disconnected;
    }
}
