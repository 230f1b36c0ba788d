//! Per-connection plumbing. A [`Channel`] lives on the worker thread that
//! accepted the connection and owns the socket, the receive buffer and the
//! inbound cipher. Its paired [`Conduit`] is shared with the rest of the
//! server: any thread may frame and enqueue outbound commands through it,
//! and the owning worker is woken to flush them.

use crate::buffer::Buffer;
use crate::frame::{self, Header};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::version::Version;
use keel::crypto::Cipher;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const RECV_BUF_SIZE: usize = 64 * 1024;
const SEND_BUF_SIZE: usize = 512 * 1024;

struct ConduitTx {
    buffer: Buffer,
    crypt: Option<Box<dyn Cipher>>,
}

/// The shared outbound half of a connection. Commands are framed, encrypted
/// and buffered under one lock, so the cipher state always advances in the
/// same order the commands hit the wire.
pub struct Conduit {
    version: Version,
    token: usize,
    tx: Mutex<ConduitTx>,
    waker: Option<Arc<Waker>>,
    disconnect: AtomicBool,
}

impl Conduit {
    pub fn new(version: Version, token: usize, waker: Option<Arc<Waker>>) -> Conduit {
        Conduit {
            version,
            token,
            tx: Mutex::new(ConduitTx { buffer: Buffer::new(SEND_BUF_SIZE), crypt: None }),
            waker,
            disconnect: AtomicBool::new(false),
        }
    }

    /// A conduit with no worker behind it; sends accumulate in the buffer.
    /// Used by tests that want to inspect framed output.
    pub fn detached(version: Version) -> Conduit {
        Conduit::new(version, 0, None)
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn token(&self) -> usize {
        self.token
    }

    /// Frames, encrypts and enqueues one command, then wakes the owning
    /// worker to flush it.
    pub fn send(&self, command: u16, flag: u32, payload: &[u8]) -> NetworkResult<()> {
        {
            let mut tx = self.tx.lock().unwrap();
            let encrypted = tx.crypt.is_some();
            let mut data = frame::encode_command(self.version, command, flag, payload, encrypted)?;
            if let Some(crypt) = tx.crypt.as_mut() {
                crypt.encrypt(&mut data)?;
            }
            tx.buffer.write(&data)?;
        }
        self.wake();
        Ok(())
    }

    /// Installs the outbound cipher. Anything already buffered stays
    /// plaintext; everything framed afterwards is encrypted.
    pub fn set_crypt(&self, crypt: Box<dyn Cipher>) {
        self.tx.lock().unwrap().crypt = Some(crypt);
    }

    /// Asks the owning worker to flush what is buffered and then drop the
    /// connection.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
        self.wake();
    }

    #[inline]
    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.tx.lock().unwrap().buffer.is_empty()
    }

    /// Drains and returns everything buffered. Test helper for detached
    /// conduits.
    pub fn take_pending(&self) -> Vec<u8> {
        let mut tx = self.tx.lock().unwrap();
        let data = tx.buffer.read_slice().to_vec();
        tx.buffer.clear();
        data
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
    }

    fn flush_to<W: std::io::Write>(&self, writer: W) -> NetworkResult<bool> {
        let mut tx = self.tx.lock().unwrap();
        tx.buffer.egress(writer)?;
        Ok(tx.buffer.is_empty())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ChannelState {
    Established,
    Draining,
}

/// The worker-owned half of a connection.
pub struct Channel {
    version: Version,
    stream: TcpStream,
    recv: Buffer,
    decrypted: usize,
    crypt_in: Option<Box<dyn Cipher>>,
    conduit: Arc<Conduit>,
    state: ChannelState,
}

impl Channel {
    pub fn new(stream: TcpStream, version: Version, conduit: Arc<Conduit>) -> Channel {
        Channel {
            version,
            stream,
            recv: Buffer::new(RECV_BUF_SIZE),
            decrypted: 0,
            crypt_in: None,
            conduit,
            state: ChannelState::Established,
        }
    }

    #[inline]
    pub fn conduit(&self) -> &Arc<Conduit> {
        &self.conduit
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established
    }

    /// Switches to the draining substate: reads stop, buffered writes keep
    /// flushing until empty.
    pub fn start_drain(&mut self) {
        self.state = ChannelState::Draining;
    }

    /// Splits out the pieces a command handler is allowed to touch: the
    /// shared conduit and the inbound cipher slot.
    pub fn dispatch_parts(&mut self) -> (&Arc<Conduit>, &mut Option<Box<dyn Cipher>>) {
        (&self.conduit, &mut self.crypt_in)
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) -> std::io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Drains the socket into the receive buffer and decrypts every complete
    /// cipher block that arrived. Returns whether the peer closed its end.
    pub fn receive(&mut self) -> NetworkResult<bool> {
        if self.state != ChannelState::Established {
            return Ok(false);
        }
        let (_, eof) = self.recv.ingress(&mut self.stream)?;
        self.decrypt_pending()?;
        Ok(eof)
    }

    fn decrypt_pending(&mut self) -> NetworkResult<()> {
        let total = self.recv.len();
        match self.crypt_in.as_mut() {
            None => {
                self.decrypted = total;
                Ok(())
            }
            Some(crypt) => {
                let block = crypt.block_size();
                let pending = total - self.decrypted;
                let usable = pending & !(block - 1);
                if usable > 0 {
                    let start = self.decrypted;
                    crypt.decrypt(&mut self.recv.read_slice_mut()[start..start + usable])?;
                    self.decrypted += usable;
                }
                Ok(())
            }
        }
    }

    /// Pops the next complete command off the receive buffer, or `None` if
    /// more bytes are needed. The cipher state has already advanced over the
    /// returned bytes exactly once, padding included.
    pub fn next_command(&mut self) -> NetworkResult<Option<(Header, Vec<u8>)>> {
        let header_size = self.version.header_size();
        if self.decrypted < header_size {
            return Ok(None);
        }

        let header = Header::parse(self.version, self.recv.read_slice());
        let size = header.size as usize;
        if size < header_size || size > frame::MAX_COMMAND_SIZE {
            return Err(NetworkError::Fatal(ErrorType::BadFrame));
        }

        let aligned = frame::aligned_size(self.version, size);
        if self.decrypted < aligned {
            return Ok(None);
        }

        let payload = self.recv.read_slice()[header_size..size].to_vec();
        self.recv.consume(aligned);
        self.decrypted -= aligned;
        Ok(Some((header, payload)))
    }

    /// Flushes buffered output to the socket. Returns whether the send
    /// buffer is now empty.
    pub fn flush(&mut self) -> NetworkResult<bool> {
        self.conduit.flush_to(&mut self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::crypto::{GcCipher, PcCipher};

    #[test]
    fn conduit_frames_and_buffers_commands() {
        let conduit = Conduit::detached(Version::Gc);
        conduit.send(0x06, 0x01, &[1, 2, 3, 4]).unwrap();
        conduit.send(0x1D, 0x00, &[]).unwrap();

        let data = conduit.take_pending();
        let first = Header::parse(Version::Gc, &data);
        assert_eq!(first.command, 0x06);
        assert_eq!(first.size, 8);
        let second = Header::parse(Version::Gc, &data[8..]);
        assert_eq!(second.command, 0x1D);
        assert_eq!(second.size, 4);
        assert_eq!(data.len(), 12);
    }

    #[test]
    fn conduit_encrypts_after_cipher_install() {
        let conduit = Conduit::detached(Version::Gc);
        conduit.set_crypt(Box::new(GcCipher::new(0x42)));
        conduit.send(0x02, 0, &[0xAA; 4]).unwrap();

        let mut data = conduit.take_pending();
        // Decrypting with an identically-seeded engine recovers the frame.
        let mut rx = GcCipher::new(0x42);
        rx.decrypt(&mut data).unwrap();
        let header = Header::parse(Version::Gc, &data);
        assert_eq!(header.command, 0x02);
        assert_eq!(&data[4..8], &[0xAA; 4]);
    }

    #[test]
    fn conduit_disconnect_flag_is_sticky() {
        let conduit = Conduit::detached(Version::Pc);
        assert!(!conduit.disconnect_requested());
        conduit.request_disconnect();
        assert!(conduit.disconnect_requested());
    }

    // Command iteration is exercised end-to-end through a Channel in the
    // endpoint tests; the framing edge cases live in `frame::tests`. The
    // cipher-advance-exactly-once property is covered here by running a PC
    // cipher over a conduit's output stream in two differently-sized chunks.
    #[test]
    fn conduit_cipher_state_is_continuous_across_commands() {
        let conduit = Conduit::detached(Version::Pc);
        conduit.set_crypt(Box::new(PcCipher::new(0x1337)));
        conduit.send(0x09, 0, &[0x11; 8]).unwrap();
        conduit.send(0x09, 0, &[0x22; 12]).unwrap();

        let mut data = conduit.take_pending();
        let mut rx = PcCipher::new(0x1337);
        rx.decrypt(&mut data).unwrap();

        let first = Header::parse(Version::Pc, &data);
        assert_eq!(first.size, 12);
        assert_eq!(&data[4..12], &[0x11; 8]);
        let second = Header::parse(Version::Pc, &data[12..]);
        assert_eq!(second.size, 16);
        assert_eq!(&data[16..28], &[0x22; 12]);
    }
}
