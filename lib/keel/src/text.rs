//! Text handling for the wire protocols: Shift-JIS and UTF-16LE transcoding
//! through a fixed lookup table, the two-code-unit language marker prefix,
//! and the `$`/`#`/`%` markup escapes used in user-visible strings.

use lazy_static::lazy_static;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// A bidirectional Shift-JIS ↔ UTF-16 mapping. Loaded once at startup from a
/// tab-separated table file; until then an ASCII-identity fallback is used,
/// which is enough for the western clients.
pub struct SjisTable {
    to_utf16: Vec<u16>,
    from_utf16: Vec<u16>,
}

impl SjisTable {
    pub fn ascii() -> SjisTable {
        let mut to_utf16 = vec![0u16; 0x10000];
        let mut from_utf16 = vec![0u16; 0x10000];
        for x in 0..0x80u16 {
            to_utf16[x as usize] = x;
            from_utf16[x as usize] = x;
        }
        SjisTable { to_utf16, from_utf16 }
    }

    /// Parses a table file of `<sjis>\t<utf16>` pairs, one per line, each
    /// value in any base `u32::from_str_radix` understands via a `0x` prefix.
    /// Unparseable lines are skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<SjisTable> {
        let contents = fs::read_to_string(path)?;
        let mut table = SjisTable::ascii();
        for line in contents.lines() {
            let mut tokens = line.split('\t');
            let sjis = tokens.next().and_then(parse_code);
            let utf16 = tokens.next().and_then(parse_code);
            if let (Some(sjis), Some(utf16)) = (sjis, utf16) {
                table.to_utf16[sjis as usize] = utf16;
                table.from_utf16[utf16 as usize] = sjis;
            }
        }
        Ok(table)
    }
}

fn parse_code(token: &str) -> Option<u16> {
    let token = token.trim();
    let value = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        token.parse::<u32>().ok()?
    };
    if value > 0xFFFF {
        return None;
    }
    Some(value as u16)
}

lazy_static! {
    static ref TABLE: RwLock<Arc<SjisTable>> = RwLock::new(Arc::new(SjisTable::ascii()));
}

/// Replaces the process-wide transcoding table. Readers holding the old
/// table keep using it safely.
pub fn install_table(table: SjisTable) {
    *TABLE.write().unwrap() = Arc::new(table);
}

fn table() -> Arc<SjisTable> {
    TABLE.read().unwrap().clone()
}

/// Encodes a string as Shift-JIS bytes. Characters above the BMP and
/// characters with no table entry are dropped.
pub fn encode_sjis(src: &str) -> Vec<u8> {
    let table = table();
    let mut out = Vec::with_capacity(src.len());
    for unit in src.encode_utf16() {
        let sjis = table.from_utf16[unit as usize];
        if sjis == 0 && unit != 0 {
            continue;
        }
        if sjis > 0xFF {
            out.push((sjis >> 8) as u8);
        }
        out.push(sjis as u8);
    }
    out
}

/// Decodes Shift-JIS bytes; any byte with the high bit set is treated as the
/// lead of a two-byte sequence. Stops at the first NUL.
pub fn decode_sjis(src: &[u8]) -> String {
    let table = table();
    let mut units = Vec::with_capacity(src.len());
    let mut x = 0;
    while x < src.len() {
        let byte = src[x];
        x += 1;
        if byte == 0 {
            break;
        }
        let code = if byte & 0x80 != 0 {
            if x >= src.len() || src[x] == 0 {
                break;
            }
            let trail = src[x];
            x += 1;
            (u16::from(byte) << 8) | u16::from(trail)
        } else {
            u16::from(byte)
        };
        let unit = table.to_utf16[code as usize];
        if unit != 0 {
            units.push(unit);
        }
    }
    String::from_utf16_lossy(&units)
}

/// UTF-16LE code units for a string, without a terminator.
pub fn encode_utf16(src: &str) -> Vec<u16> {
    src.encode_utf16().collect()
}

/// Decodes UTF-16 code units, stopping at the first NUL.
pub fn decode_utf16(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

fn has_language_marker(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('\t') && !matches!(chars.next(), Some('C') | None)
}

/// Prefixes `\t<marker>` unless the string already carries a marker. A `\tC`
/// sequence is a color code, not a marker, and does not count.
pub fn add_language_marker(s: &str, marker: char) -> String {
    if has_language_marker(s) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\t');
    out.push(marker);
    out.push_str(s);
    out
}

/// Strips a leading language marker if one is present.
pub fn remove_language_marker(s: &str) -> &str {
    if has_language_marker(s) {
        let mut chars = s.char_indices();
        chars.next();
        chars.next();
        match chars.next() {
            Some((offset, _)) => &s[offset..],
            None => "",
        }
    } else {
        s
    }
}

/// Translates user-facing markup into the control characters the client
/// renders: `$` starts a color/wait control (TAB on the wire), `#` breaks the
/// line, and `%s`/`%n`/`%%` escape the literal characters.
pub fn render_markup(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '%' => match chars.peek() {
                Some('s') => {
                    chars.next();
                    out.push('$');
                }
                Some('n') => {
                    chars.next();
                    out.push('#');
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            },
            '$' => out.push('\t'),
            '#' => out.push('\n'),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_sjis_roundtrip() {
        let encoded = encode_sjis("HUnewearl 12");
        assert_eq!(encoded, b"HUnewearl 12");
        assert_eq!(decode_sjis(&encoded), "HUnewearl 12");
    }

    #[test]
    fn decode_sjis_stops_at_nul() {
        assert_eq!(decode_sjis(b"abc\0def"), "abc");
    }

    #[test]
    fn utf16_roundtrip_stops_at_nul() {
        let mut units = encode_utf16("lobby");
        units.push(0);
        units.push(0x44);
        assert_eq!(decode_utf16(&units), "lobby");
    }

    #[test]
    fn language_marker_is_idempotent() {
        let marked = add_language_marker("Alice", 'J');
        assert_eq!(marked, "\tJAlice");
        assert_eq!(add_language_marker(&marked, 'E'), "\tJAlice");
        assert_eq!(remove_language_marker(&marked), "Alice");
        assert_eq!(remove_language_marker("Alice"), "Alice");
    }

    #[test]
    fn color_code_is_not_a_marker() {
        let colored = "\tC6warning";
        assert_eq!(remove_language_marker(colored), colored);
        assert_eq!(add_language_marker(colored, 'J'), "\tJ\tC6warning");
    }

    #[test]
    fn markup_translation() {
        assert_eq!(render_markup("$C6hello#world"), "\tC6hello\nworld");
        assert_eq!(render_markup("100%% %sdrop %nline"), "100% $drop #line");
        assert_eq!(render_markup("trailing %"), "trailing %");
    }
}
