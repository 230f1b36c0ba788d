//! Per-version command framing. Every dialect prefixes each command with a
//! small header carrying the command code, a flag and the total size; the
//! field order and widths differ per dialect:
//!
//! | version  | layout (little-endian)                  |
//! |----------|-----------------------------------------|
//! | DC/GC    | `u8 command, u8 flag, u16 size`         |
//! | PC/Patch | `u16 size, u8 command, u8 flag`         |
//! | BB       | `u16 size, u16 command, u32 flag`       |
//!
//! The size field counts the header itself. Logical sizes are rounded up to
//! a 4-byte boundary; when a Blue Burst connection is encrypted the bytes on
//! the wire are additionally padded to the 8-byte cipher block, without
//! changing the size field.

use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::version::Version;
use byteorder::{ByteOrder, LittleEndian};

/// Most known client builds have a 0x7C00-byte receive buffer; anything
/// larger would overflow it.
pub const MAX_COMMAND_SIZE: usize = 0x7C00;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub command: u16,
    pub flag: u32,
    pub size: u16,
}

impl Header {
    /// Decodes a header from the start of `data`, which must hold at least
    /// `version.header_size()` bytes.
    pub fn parse(version: Version, data: &[u8]) -> Header {
        match version {
            Version::Dc | Version::Gc => Header {
                command: u16::from(data[0]),
                flag: u32::from(data[1]),
                size: LittleEndian::read_u16(&data[2..4]),
            },
            Version::Pc | Version::Patch => Header {
                size: LittleEndian::read_u16(&data[0..2]),
                command: u16::from(data[2]),
                flag: u32::from(data[3]),
            },
            Version::Bb => Header {
                size: LittleEndian::read_u16(&data[0..2]),
                command: LittleEndian::read_u16(&data[2..4]),
                flag: LittleEndian::read_u32(&data[4..8]),
            },
        }
    }

    pub fn write(&self, version: Version, out: &mut [u8]) {
        match version {
            Version::Dc | Version::Gc => {
                out[0] = self.command as u8;
                out[1] = self.flag as u8;
                LittleEndian::write_u16(&mut out[2..4], self.size);
            }
            Version::Pc | Version::Patch => {
                LittleEndian::write_u16(&mut out[0..2], self.size);
                out[2] = self.command as u8;
                out[3] = self.flag as u8;
            }
            Version::Bb => {
                LittleEndian::write_u16(&mut out[0..2], self.size);
                LittleEndian::write_u16(&mut out[2..4], self.command);
                LittleEndian::write_u32(&mut out[4..8], self.flag);
            }
        }
    }
}

/// Rounds a logical command size up to the version's header multiple; this
/// is the number of stream bytes the command actually occupies.
#[inline]
pub fn aligned_size(version: Version, size: usize) -> usize {
    let unit = version.header_size();
    (size + unit - 1) & !(unit - 1)
}

/// Frames a command for the wire: header, payload, NUL padding to the
/// 4-byte boundary, and (for an encrypted Blue Burst stream) padding out to
/// the 8-byte cipher block. The returned bytes are still plaintext.
pub fn encode_command(
    version: Version,
    command: u16,
    flag: u32,
    payload: &[u8],
    encrypted: bool,
) -> NetworkResult<Vec<u8>> {
    let header_size = version.header_size();
    let logical_size = (header_size + payload.len() + 3) & !3;
    if logical_size > MAX_COMMAND_SIZE {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    let wire_size = if version == Version::Bb && encrypted {
        (logical_size + 7) & !7
    } else {
        logical_size
    };

    let mut data = vec![0u8; wire_size];
    let header = Header { command, flag, size: logical_size as u16 };
    header.write(version, &mut data[..header_size]);
    data[header_size..header_size + payload.len()].copy_from_slice(payload);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VERSIONS: [Version; 5] =
        [Version::Dc, Version::Pc, Version::Patch, Version::Gc, Version::Bb];

    #[test]
    fn header_roundtrip_every_version() {
        for &version in &ALL_VERSIONS {
            for &(command, flag) in &[(0x02u16, 0u32), (0x93, 0x41), (0x60, 0xFF)] {
                for payload_len in &[0usize, 4, 8, 0x40, 0x400] {
                    let payload: Vec<u8> =
                        (0..*payload_len).map(|x| (x * 7 + 1) as u8).collect();
                    let encoded =
                        encode_command(version, command, flag, &payload, false).unwrap();

                    let header = Header::parse(version, &encoded);
                    assert_eq!(header.command, command);
                    assert_eq!(header.flag, flag);
                    assert_eq!(header.size as usize, encoded.len());
                    let body = &encoded[version.header_size()..header.size as usize];
                    assert_eq!(&body[..payload.len()], &payload[..]);
                }
            }
        }
    }

    #[test]
    fn unaligned_payload_is_padded_with_nuls() {
        let encoded = encode_command(Version::Gc, 0x06, 0, b"hi", false).unwrap();
        assert_eq!(encoded.len(), 8);
        assert_eq!(&encoded[4..6], b"hi");
        assert_eq!(&encoded[6..8], &[0, 0]);
    }

    #[test]
    fn bb_flag_is_wide() {
        let encoded = encode_command(Version::Bb, 0x01E8, 0xDEAD_BEEF, &[], false).unwrap();
        let header = Header::parse(Version::Bb, &encoded);
        assert_eq!(header.command, 0x01E8);
        assert_eq!(header.flag, 0xDEAD_BEEF);
    }

    #[test]
    fn bb_encrypted_commands_pad_to_cipher_blocks() {
        let encoded = encode_command(Version::Bb, 0x00E7, 0, &[1, 2, 3, 4], false).unwrap();
        assert_eq!(encoded.len(), 12);

        let encoded = encode_command(Version::Bb, 0x00E7, 0, &[1, 2, 3, 4], true).unwrap();
        assert_eq!(encoded.len(), 16);
        // The size field still records the logical (4-aligned) size.
        let header = Header::parse(Version::Bb, &encoded);
        assert_eq!(header.size, 12);
    }

    #[test]
    fn oversized_commands_are_refused() {
        let payload = vec![0u8; MAX_COMMAND_SIZE];
        assert!(encode_command(Version::Gc, 0x6C, 0, &payload, false).is_err());
    }

    #[test]
    fn aligned_size_rounds_to_header_multiple() {
        assert_eq!(aligned_size(Version::Gc, 5), 8);
        assert_eq!(aligned_size(Version::Gc, 8), 8);
        assert_eq!(aligned_size(Version::Bb, 12), 16);
        assert_eq!(aligned_size(Version::Bb, 16), 16);
    }
}
