use std::fmt;

/// The client dialects the server speaks. Each one gets its own listen
/// ports, header shape, cipher family and text encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Version {
    Dc,
    Pc,
    Patch,
    Gc,
    Bb,
}

impl Version {
    /// Size of the command header, which is also the alignment unit for
    /// command boundaries in the byte stream.
    #[inline]
    pub fn header_size(self) -> usize {
        match self {
            Version::Bb => 8,
            _ => 4,
        }
    }

    /// Whether text fields for this dialect are UTF-16LE (as opposed to
    /// Shift-JIS).
    #[inline]
    pub fn uses_utf16(self) -> bool {
        matches!(self, Version::Pc | Version::Patch | Version::Bb)
    }

    pub fn name(self) -> &'static str {
        match self {
            Version::Dc => "DC",
            Version::Pc => "PC",
            Version::Patch => "Patch",
            Version::Gc => "GC",
            Version::Bb => "BB",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
