use crate::support::{ErrorType, NetworkError, NetworkResult};
use std::io;

// Consumed bytes are compacted away once they pass this threshold, so the
// buffer never re-allocates for steady-state traffic.
const COMPACT_THRESHOLD: usize = 16384;

/// A bounded FIFO byte queue. Data is appended at the tail and consumed from
/// the head; the head index is compacted lazily.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    limit: usize,
}

impl Buffer {
    pub fn new(limit: usize) -> Buffer {
        Buffer { data: Vec::with_capacity(limit.min(COMPACT_THRESHOLD)), head: 0, limit }
    }

    /// The number of unconsumed bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining capacity before the buffer refuses further ingress.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.len()
    }

    /// Slice containing the unconsumed data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Mutable view of the unconsumed data; used for in-place decryption.
    #[inline]
    pub fn read_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Drops `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.head += count;
        debug_assert!(self.head <= self.data.len());
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Appends bytes at the tail, failing when the limit would be exceeded.
    pub fn write(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        if bytes.len() > self.free_capacity() {
            return Err(NetworkError::Fatal(ErrorType::BufferOverrun));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes buffered data out, advancing the head, until the writer blocks
    /// or the buffer drains. A zero-length write is treated as an error.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> NetworkResult<usize> {
        let mut sent = 0;
        while self.len() > 0 {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::WriteZero))),
                Ok(count) => {
                    self.consume(count);
                    sent += count;
                }
                Err(err) => {
                    let err = NetworkError::from(err);
                    if err == NetworkError::Wait {
                        break;
                    }
                    return Err(err);
                }
            }
        }
        Ok(sent)
    }

    /// Reads from the reader into the tail until it blocks, returns EOF, or
    /// the buffer fills. Returns the bytes read and whether EOF was seen.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> NetworkResult<(usize, bool)> {
        let mut chunk = [0u8; 8192];
        let mut received = 0;
        loop {
            let room = self.free_capacity();
            if room == 0 {
                return Err(NetworkError::Fatal(ErrorType::BufferOverrun));
            }
            let want = room.min(chunk.len());
            match reader.read(&mut chunk[..want]) {
                Ok(0) => return Ok((received, true)),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    received += count;
                }
                Err(err) => {
                    let err = NetworkError::from(err);
                    if err == NetworkError::Wait {
                        return Ok((received, false));
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::ErrorUtils;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk, max_size }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn roundtrip_through_a_chunked_channel() {
        let mock_data: Vec<_> = (0..4096).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(65536);
        let (count, eof) = buffer.ingress(&mut channel).unwrap();
        assert_eq!(count, mock_data.len());
        assert!(!eof);
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let sent = buffer.egress(&mut channel).unwrap();
        assert_eq!(sent, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn egress_error_on_zero_write() {
        let mut sink: &mut [u8] = &mut [];
        let mut buffer = Buffer::new(65536);
        buffer.write(&[1]).unwrap();

        let result = buffer.egress(&mut sink);
        assert!(result.has_failed());
    }

    #[test]
    fn ingress_stops_at_the_limit() {
        let mock_data: Vec<_> = (0..4096).map(|item| item as u8).collect();
        let mut buffer = Buffer::new(1024);
        let result = buffer.ingress(&mock_data[..]);
        assert!(result.has_failed());
    }

    #[test]
    fn ingress_reports_eof() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(65536);
        let (count, eof) = buffer.ingress(&mut cursor).unwrap();
        assert_eq!(count, 3);
        assert!(eof);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn consume_compacts_and_tracks_len() {
        let mut buffer = Buffer::new(65536);
        buffer.write(&[1, 2, 3, 4, 5]).unwrap();
        buffer.consume(2);
        assert_eq!(buffer.read_slice(), &[3, 4, 5]);
        buffer.consume(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 65536);
    }

    #[test]
    fn write_past_limit_is_refused() {
        let mut buffer = Buffer::new(4);
        buffer.write(&[1, 2, 3]).unwrap();
        assert!(buffer.write(&[4, 5]).has_failed());
    }
}
