//! The metadata root header and stream directory.
//!
//! The signature-checked header at the start of the metadata blob names a
//! version string and an ordered list of named streams (offset and size,
//! relative to the blob). This is the handoff point into the logical
//! metadata-tables decoder: the crate parses the directory, retains the
//! raw blob, and goes no deeper.

use crate::{
    file::{parser::Parser, writer::Writer},
    Result,
};

/// One stream directory entry: where a named stream lives within the
/// metadata blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset of the stream from the start of the metadata blob.
    pub offset: u32,
    /// Size of the stream in bytes.
    pub size: u32,
    /// Stream name (`#~`, `#Strings`, `#US`, `#GUID`, `#Blob`, ...).
    pub name: String,
}

impl StreamHeader {
    /// Parse one entry. The name is zero-terminated and padded to a
    /// 4-byte boundary relative to the blob start.
    pub fn read(parser: &mut Parser) -> Result<StreamHeader> {
        let offset = parser.read_le::<u32>()?;
        let size = parser.read_le::<u32>()?;
        let name = parser.read_string_ascii()?;
        if name.is_empty() {
            return Err(malformed_error!("invalid StreamHeader.Name"));
        }
        parser.align(4)?;

        Ok(StreamHeader { offset, size, name })
    }

    /// Encoded size of this entry.
    pub(crate) fn encoded_len(&self) -> u32 {
        let name_len = self.name.len() as u32 + 1;
        8 + name_len.div_ceil(4) * 4
    }

    /// Serialize one entry, padding the name to a 4-byte boundary.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.offset);
        writer.write_le(self.size);
        writer.write_string_ascii(&self.name);
        writer.align(4);
    }
}

/// The metadata root: version string, stream directory, and the raw blob
/// itself.
///
/// The parsed fields are a decoded *view*; the blob in `raw` is
/// authoritative, owned for re-emission and for the external tables
/// decoder. Use [`MetadataRoot::assemble`] to build a fresh blob from
/// named stream contents.
#[derive(Debug, Clone)]
pub struct MetadataRoot {
    /// Format major version.
    pub major_version: u16,
    /// Format minor version.
    pub minor_version: u16,
    /// Runtime version string.
    pub version: String,
    /// The stream directory, in file order.
    pub stream_headers: Vec<StreamHeader>,
    /// The whole metadata blob, headers included.
    pub raw: Vec<u8>,
}

impl MetadataRoot {
    /// Magic signature opening the metadata blob.
    pub const SIGNATURE: u32 = 0x424A_5342;
    /// Nominal format major version.
    pub const DEFAULT_MAJOR_VERSION: u16 = 1;
    /// Nominal format minor version.
    pub const DEFAULT_MINOR_VERSION: u16 = 1;
    /// The runtime version string common to 2.x-era images.
    pub const DEFAULT_VERSION: &'static str = "v2.0.50727";

    const RESERVED: u32 = 0;
    const FLAGS: u16 = 0;

    /// Parse the root header and stream directory from a metadata blob,
    /// retaining the blob.
    pub fn parse(data: &[u8]) -> Result<MetadataRoot> {
        let mut parser = Parser::new(data);

        let actual_signature = parser.read_le::<u32>()?;
        if actual_signature != Self::SIGNATURE {
            return Err(malformed_error!(
                "invalid MetadataRoot.Signature - {:#010x}",
                actual_signature
            ));
        }
        let major_version = parser.read_le::<u16>()?;
        let minor_version = parser.read_le::<u16>()?;
        let actual_reserved = parser.read_le::<u32>()?;
        if actual_reserved != Self::RESERVED {
            return Err(malformed_error!("invalid MetadataRoot.Reserved"));
        }

        let version_len = parser.read_le::<u32>()? as usize;
        if version_len == 0 || version_len > 255 || version_len % 4 != 0 {
            return Err(malformed_error!(
                "invalid MetadataRoot.Version - length {}",
                version_len
            ));
        }
        let version_bytes = parser.read_bytes(version_len)?;
        let end = version_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(version_len);
        let Ok(version) = std::str::from_utf8(&version_bytes[..end]) else {
            return Err(malformed_error!("invalid MetadataRoot.Version"));
        };
        let version = version.to_string();

        let actual_flags = parser.read_le::<u16>()?;
        if actual_flags != Self::FLAGS {
            return Err(malformed_error!("invalid MetadataRoot.Flags"));
        }

        let stream_count = parser.read_le::<u16>()?;
        let mut stream_headers = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let header = StreamHeader::read(&mut parser)?;
            let Some(stream_end) = header.offset.checked_add(header.size) else {
                return Err(malformed_error!(
                    "invalid StreamHeader - {} overflows the blob",
                    header.name
                ));
            };
            if stream_end as usize > data.len() {
                return Err(malformed_error!(
                    "invalid StreamHeader - {} extends past the blob",
                    header.name
                ));
            }
            stream_headers.push(header);
        }

        Ok(MetadataRoot {
            major_version,
            minor_version,
            version,
            stream_headers,
            raw: data.to_vec(),
        })
    }

    /// Serialize the root header and stream directory (not the stream
    /// contents).
    pub fn write_header(&self, writer: &mut Writer) {
        writer.write_le(Self::SIGNATURE);
        writer.write_le(self.major_version);
        writer.write_le(self.minor_version);
        writer.write_le(Self::RESERVED);
        let version_len = (self.version.len() as u32 + 1).div_ceil(4) * 4;
        writer.write_le(version_len);
        writer.write_bytes(self.version.as_bytes());
        writer.pad(version_len as usize - self.version.len());
        writer.write_le(Self::FLAGS);
        writer.write_le(self.stream_headers.len() as u16);
        for header in &self.stream_headers {
            header.write(writer);
        }
    }

    fn header_len(version: &str, streams: &[(&str, &[u8])]) -> u32 {
        let version_len = (version.len() as u32 + 1).div_ceil(4) * 4;
        let directory_len: u32 = streams
            .iter()
            .map(|(name, _)| {
                let name_len = name.len() as u32 + 1;
                8 + name_len.div_ceil(4) * 4
            })
            .sum();
        16 + version_len + 4 + directory_len
    }

    /// Build a complete metadata blob from a version string and named
    /// stream contents, in the order given.
    ///
    /// Stream offsets are computed from the header length; contents are
    /// concatenated without extra padding. The result parses back with
    /// [`MetadataRoot::parse`].
    pub fn assemble(version: &str, streams: &[(&str, &[u8])]) -> Result<MetadataRoot> {
        if version.is_empty() || version.len() > 254 || !version.is_ascii() {
            return Err(crate::Error::WriteLayoutFailed {
                message: format!("unusable metadata version string '{}'", version),
            });
        }

        let mut offset = Self::header_len(version, streams);
        let mut stream_headers = Vec::with_capacity(streams.len());
        for (name, contents) in streams {
            stream_headers.push(StreamHeader {
                offset,
                size: contents.len() as u32,
                name: (*name).to_string(),
            });
            offset += contents.len() as u32;
        }

        let root = MetadataRoot {
            major_version: Self::DEFAULT_MAJOR_VERSION,
            minor_version: Self::DEFAULT_MINOR_VERSION,
            version: version.to_string(),
            stream_headers,
            raw: Vec::new(),
        };

        let mut writer = Writer::new();
        root.write_header(&mut writer);
        for (_, contents) in streams {
            writer.write_bytes(contents);
        }

        let raw = writer.into_bytes();
        Ok(MetadataRoot { raw, ..root })
    }

    /// Look up a stream by name.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        self.stream_headers.iter().find(|s| s.name == name)
    }
}
