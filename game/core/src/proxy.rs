//! The interceptor proxy: one client, one upstream server, transparent
//! relay with its own cipher pair per direction. Two commands are watched on
//! the way down: 02/17 (cipher setup, which the proxy must mirror to stay
//! readable) and 19 (reconnect, rewritten so the client stays tethered to
//! the proxy).
//!
//! The proxy speaks the GC dialect: 4-byte headers and the GC cipher.

use byteorder::{ByteOrder, LittleEndian};
use keel::crypto::{Cipher, GcCipher};
use keel::logging;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use rigging::buffer::Buffer;
use rigging::frame::Header;
use rigging::support::{ErrorUtils, NetworkError, NetworkResult};
use rigging::version::Version;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const CLIENT_TOKEN: Token = Token(1);
const SERVER_TOKEN: Token = Token(2);

const HEADER_SIZE: usize = 4;
const BUF_SIZE: usize = 64 * 1024;

/// One relay direction: source socket, its buffers and its cipher pair
/// state is owned by the [`ProxyServer`]; this enum just names the sides.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Side {
    Client,
    Server,
}

struct Direction {
    recv: Buffer,
    send: Buffer,
    crypt_in: Option<GcCipher>,
    crypt_out: Option<GcCipher>,
    /// Header bytes already decrypted while waiting for the full body.
    pending_header: Option<Header>,
}

impl Direction {
    fn new() -> Direction {
        Direction {
            recv: Buffer::new(BUF_SIZE),
            send: Buffer::new(BUF_SIZE),
            crypt_in: None,
            crypt_out: None,
            pending_header: None,
        }
    }

    fn reset(&mut self) {
        self.recv.clear();
        self.send.clear();
        self.crypt_in = None;
        self.crypt_out = None;
        self.pending_header = None;
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    listen_port: u16,
    next_destination: SocketAddr,

    poll: Poll,
    client: Option<TcpStream>,
    server: Option<TcpStream>,
    from_client: Direction,
    from_server: Direction,

    should_exit: Arc<AtomicBool>,
    log: logging::Logger,
}

impl ProxyServer {
    pub fn new(
        listen_addr: SocketAddr,
        destination: SocketAddr,
        log: &logging::Logger,
    ) -> io::Result<ProxyServer> {
        let poll = Poll::new()?;
        let std_listener = std::net::TcpListener::bind(listen_addr)?;
        std_listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(ProxyServer {
            listener,
            listen_port: listen_addr.port(),
            next_destination: destination,
            poll,
            client: None,
            server: None,
            from_client: Direction::new(),
            from_server: Direction::new(),
            should_exit: Arc::new(AtomicBool::new(false)),
            log: log.new(logging::o!("source" => "proxy")),
        })
    }

    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.should_exit.clone()
    }

    /// Runs the relay loop on a dedicated thread.
    pub fn start(mut self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("proxy-server".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn the proxy thread")
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(64);
        logging::info!(self.log, "proxy listening"; "port" => self.listen_port);

        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(Duration::from_secs(2))) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "proxy poll failed"; "error" => %err);
                break;
            }
            if self.should_exit.load(Ordering::Acquire) {
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_client(),
                    CLIENT_TOKEN | SERVER_TOKEN => {}
                    _ => {}
                }
            }

            // Service both directions every pass; readiness bookkeeping per
            // side is not worth the complexity at one-client scale.
            if self.pump().has_failed() {
                self.teardown();
            }
        }
    }

    fn accept_client(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.client.is_some() {
                        logging::warn!(self.log,
                            "ignoring connection because a client is already attached";
                            "peer" => %peer);
                        continue;
                    }
                    logging::info!(self.log, "client connected"; "peer" => %peer);

                    if self
                        .poll
                        .registry()
                        .register(
                            &mut stream,
                            CLIENT_TOKEN,
                            Interest::READABLE | Interest::WRITABLE,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    self.client = Some(stream);

                    match self.connect_upstream() {
                        Ok(()) => {}
                        Err(err) => {
                            logging::warn!(self.log, "upstream connect failed"; "error" => %err);
                            self.teardown();
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "proxy accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn connect_upstream(&mut self) -> io::Result<()> {
        logging::info!(self.log, "connecting upstream"; "destination" => %self.next_destination);
        let mut stream = TcpStream::connect(self.next_destination)?;
        self.poll.registry().register(
            &mut stream,
            SERVER_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.server = Some(stream);
        Ok(())
    }

    /// Moves bytes in both directions until both sockets block.
    fn pump(&mut self) -> NetworkResult<()> {
        if self.client.is_none() || self.server.is_none() {
            return Ok(());
        }

        self.pump_side(Side::Client)?;
        self.pump_side(Side::Server)?;

        // Flush whatever the relays queued.
        if let Some(client) = self.client.as_mut() {
            self.from_server.send.egress(client)?;
        }
        if let Some(server) = self.server.as_mut() {
            self.from_client.send.egress(server)?;
        }
        Ok(())
    }

    fn pump_side(&mut self, side: Side) -> NetworkResult<()> {
        // Phase one: pull bytes off the socket.
        {
            let stream = match side {
                Side::Client => self.client.as_mut(),
                Side::Server => self.server.as_mut(),
            };
            let stream = match stream {
                Some(stream) => stream,
                None => return Ok(()),
            };
            let direction = match side {
                Side::Client => &mut self.from_client,
                Side::Server => &mut self.from_server,
            };

            let (_, eof) = direction.recv.ingress(&mut *stream)?;
            if eof {
                logging::info!(self.log, "peer disconnected";
                               "side" => if side == Side::Client { "client" } else { "server" });
                return Err(NetworkError::Fatal(rigging::support::ErrorType::Closed));
            }
        }

        // Phase two: peel complete commands off, inspect downstream traffic,
        // re-encrypt and queue for the other side.
        loop {
            let extracted = {
                let direction = match side {
                    Side::Client => &mut self.from_client,
                    Side::Server => &mut self.from_server,
                };
                Self::extract_command(direction)?
            };
            let (header, mut command) = match extracted {
                Some(extracted) => extracted,
                None => break,
            };

            if side == Side::Server {
                self.inspect_downstream(header, &mut command)?;
            }

            let direction = match side {
                Side::Client => &mut self.from_client,
                Side::Server => &mut self.from_server,
            };
            if let Some(crypt) = direction.crypt_out.as_mut() {
                crypt.encrypt(&mut command).map_err(NetworkError::from)?;
            }
            direction.send.write(&command)?;
        }

        Ok(())
    }

    /// Pops one complete decrypted command, or `None` when more bytes are
    /// needed. The header is decrypted eagerly so the size is known before
    /// the body arrives.
    fn extract_command(direction: &mut Direction) -> NetworkResult<Option<(Header, Vec<u8>)>> {
        let header = match direction.pending_header {
            Some(header) => header,
            None => {
                if direction.recv.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut header_bytes = [0u8; HEADER_SIZE];
                header_bytes.copy_from_slice(&direction.recv.read_slice()[..HEADER_SIZE]);
                if let Some(crypt) = direction.crypt_in.as_mut() {
                    crypt.decrypt(&mut header_bytes).map_err(NetworkError::from)?;
                }
                let header = Header::parse(Version::Gc, &header_bytes);
                direction.pending_header = Some(header);
                header
            }
        };

        let total = (header.size as usize).max(HEADER_SIZE);
        if direction.recv.len() < total {
            return Ok(None);
        }

        let mut command = direction.recv.read_slice()[..total].to_vec();
        direction.recv.consume(total);
        direction.pending_header = None;

        // The header bytes were decrypted separately; write them back and
        // run the cipher over the body only.
        header.write(Version::Gc, &mut command[..HEADER_SIZE]);
        if let Some(crypt) = direction.crypt_in.as_mut() {
            crypt
                .decrypt(&mut command[HEADER_SIZE..])
                .map_err(NetworkError::from)?;
        }
        Ok(Some((header, command)))
    }

    /// Watches upstream-to-client commands for the two that matter.
    fn inspect_downstream(&mut self, header: Header, command: &mut [u8]) -> NetworkResult<()> {
        match header.command {
            0x02 | 0x17 => {
                // Cipher setup: copyright text, then the two seeds.
                if command.len() < HEADER_SIZE + 0x48 {
                    return Err(NetworkError::Fatal(rigging::support::ErrorType::BadFrame));
                }
                let keys_at = HEADER_SIZE + 0x40;
                let server_key = LittleEndian::read_u32(&command[keys_at..keys_at + 4]);
                let client_key = LittleEndian::read_u32(&command[keys_at + 4..keys_at + 8]);

                logging::info!(self.log, "upstream negotiated encryption");
                self.from_server.crypt_in = Some(GcCipher::new(server_key));
                self.from_client.crypt_out = Some(GcCipher::new(client_key));
                // The client-facing pair is inverted: what the real server
                // encrypts with, the proxy re-encrypts for the client.
                self.from_client.crypt_in = Some(GcCipher::new(client_key));
                self.from_server.crypt_out = Some(GcCipher::new(server_key));
            }
            0x19 => {
                // The rewrite uses the local address of the downstream
                // socket, which is what the client can actually reach.
                let local_ip = self
                    .client
                    .as_ref()
                    .and_then(|c| c.local_addr().ok())
                    .map(|addr| addr.ip());
                rewrite_reconnect(command, local_ip, self.listen_port);
                logging::info!(self.log, "rewrote reconnect"; "port" => self.listen_port);
            }
            _ => {}
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut stream) = self.client.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        if let Some(mut stream) = self.server.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        self.from_client.reset();
        self.from_server.reset();
        logging::info!(self.log, "proxy session torn down");
    }
}

/// Rewrites a decrypted 19 command in place so its destination is the proxy
/// itself. The body is `u32 address (network order), u16 port, u16 unused`.
pub fn rewrite_reconnect(command: &mut [u8], local_ip: Option<IpAddr>, listen_port: u16) {
    if command.len() < HEADER_SIZE + 8 {
        return;
    }
    if let Some(IpAddr::V4(v4)) = local_ip {
        command[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&v4.octets());
    }
    command[HEADER_SIZE + 4..HEADER_SIZE + 6].copy_from_slice(&listen_port.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn reconnect_rewrite_points_at_the_proxy() {
        // 19 command: header + address 1.2.3.4, port 9100.
        let mut command = vec![0x19, 0x00, 0x0C, 0x00, 1, 2, 3, 4, 0x8C, 0x23, 0, 0];
        rewrite_reconnect(
            &mut command,
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))),
            9999,
        );

        assert_eq!(&command[4..8], &[192, 168, 1, 10]);
        assert_eq!(u16::from_le_bytes([command[8], command[9]]), 9999);
        // Header and trailing bytes untouched.
        assert_eq!(&command[..4], &[0x19, 0x00, 0x0C, 0x00]);
        assert_eq!(&command[10..], &[0, 0]);
    }

    #[test]
    fn short_commands_are_left_alone() {
        let mut command = vec![0x19, 0x00, 0x04, 0x00];
        let original = command.clone();
        rewrite_reconnect(&mut command, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), 9999);
        assert_eq!(command, original);
    }
}
