//! Section headers and the section directory.
//!
//! A managed image in this layout carries exactly three sections (code,
//! resources and relocations) identified by their fixed zero-padded ASCII
//! names. The [`SectionDirectory`] owns the three headers in document
//! order and is the single authority for answering "which section contains
//! this virtual address, and where does it live in the file"; every RVA
//! dereference in the crate goes through it.

use bitflags::bitflags;
use strum::Display;

use crate::{
    file::{parser::Parser, writer::Writer},
    pe::{address::FileOffset, context::ReaderContext},
    Result,
};

/// The three sections a managed image is composed of, in document order.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// `.text`: code, import machinery, CLI header and metadata.
    #[strum(serialize = ".text")]
    Text,
    /// `.rsrc`: native resource directory blob.
    #[strum(serialize = ".rsrc")]
    Rsrc,
    /// `.reloc`: base-relocation table.
    #[strum(serialize = ".reloc")]
    Reloc,
}

impl SectionKind {
    /// The fixed on-disk section name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SectionKind::Text => ".text",
            SectionKind::Rsrc => ".rsrc",
            SectionKind::Reloc => ".reloc",
        }
    }

    /// Maps an on-disk name to a section kind. Any other name is not part
    /// of the accepted layout.
    #[must_use]
    pub fn from_name(name: &str) -> Option<SectionKind> {
        match name {
            ".text" => Some(SectionKind::Text),
            ".rsrc" => Some(SectionKind::Rsrc),
            ".reloc" => Some(SectionKind::Reloc),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            SectionKind::Text => 0,
            SectionKind::Rsrc => 1,
            SectionKind::Reloc => 2,
        }
    }
}

bitflags! {
    /// Section characteristics bits (`IMAGE_SCN_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        /// Section contains executable code.
        const CNT_CODE = 0x0000_0020;
        /// Section contains initialized data.
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// Section contains uninitialized data.
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// Section can be discarded as needed.
        const MEM_DISCARDABLE = 0x0200_0000;
        /// Section can be executed.
        const MEM_EXECUTE = 0x2000_0000;
        /// Section can be read.
        const MEM_READ = 0x4000_0000;
        /// Section can be written to.
        const MEM_WRITE = 0x8000_0000;
    }
}

/// One entry of the section table.
///
/// `virtual_size` may be smaller than `size_of_raw_data` (the file pads to
/// the file alignment); the reverse would require implicit zero-fill on
/// load, which this layout does not support and which is rejected as a
/// format violation.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    /// Which of the three fixed sections this is.
    pub kind: SectionKind,
    /// Section extent in virtual memory.
    pub virtual_size: u32,
    /// Virtual address relative to the image base.
    pub virtual_address: u32,
    /// Length of the section data in the file.
    pub size_of_raw_data: u32,
    /// Where the section data starts in the file.
    pub pointer_to_raw_data: FileOffset,
    /// COFF relocation pointer; unused by the loader for images.
    pub pointer_to_relocations: u32,
    /// COFF relocation count; unused by the loader for images.
    pub number_of_relocations: u16,
    /// Section characteristics bits.
    pub characteristics: SectionCharacteristics,
}

impl SectionHeader {
    /// Encoded size of one section header.
    pub const SIZE: u32 = 40;

    const POINTER_TO_LINENUMBERS: u32 = 0;
    const NUMBER_OF_LINENUMBERS: u16 = 0;

    /// Parse and validate one section header.
    pub fn read(ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<SectionHeader> {
        let name = parser.read_string_ascii_padded(8)?;
        let Some(kind) = SectionKind::from_name(&name) else {
            return Err(malformed_error!("invalid SectionHeader.Name - '{}'", name));
        };

        let virtual_size = parser.read_le::<u32>()?;
        let virtual_address = parser.read_le::<u32>()?;
        let size_of_raw_data = parser.read_le::<u32>()?;
        if virtual_size > size_of_raw_data {
            // Would need implicit zero padding at the end of the raw data
            return Err(malformed_error!(
                "invalid SectionHeader.VirtualSize - {:#x} exceeds raw size {:#x}",
                virtual_size,
                size_of_raw_data
            ));
        }

        let pointer_to_raw_data = FileOffset::read(parser)?;
        let pointer_to_relocations = parser.read_le::<u32>()?;
        let actual_pointer_to_linenumbers = parser.read_le::<u32>()?;
        if actual_pointer_to_linenumbers != Self::POINTER_TO_LINENUMBERS {
            return Err(malformed_error!("invalid SectionHeader.PointerToLinenumbers"));
        }
        let number_of_relocations = parser.read_le::<u16>()?;
        let actual_number_of_linenumbers = parser.read_le::<u16>()?;
        if actual_number_of_linenumbers != Self::NUMBER_OF_LINENUMBERS {
            return Err(malformed_error!("invalid SectionHeader.NumberOfLinenumbers"));
        }
        let characteristics = SectionCharacteristics::from_bits_retain(parser.read_le::<u32>()?);

        ctxt.trace_line(|| {
            format!(
                "SectionHeader {} {{ VirtualSize: {:#010x}, VirtualAddress: {:#010x}, \
                 SizeOfRawData: {:#010x}, PointerToRawData: {:#010x} }}",
                kind,
                virtual_size,
                virtual_address,
                size_of_raw_data,
                pointer_to_raw_data.0
            )
        });

        Ok(SectionHeader {
            kind,
            virtual_size,
            virtual_address,
            size_of_raw_data,
            pointer_to_raw_data,
            pointer_to_relocations,
            number_of_relocations,
            characteristics,
        })
    }

    /// Serialize one section header.
    pub fn write(&self, writer: &mut Writer) -> Result<()> {
        writer.write_string_ascii_padded(self.kind.name(), 8)?;
        writer.write_le(self.virtual_size);
        writer.write_le(self.virtual_address);
        writer.write_le(self.size_of_raw_data);
        self.pointer_to_raw_data.write(writer);
        writer.write_le(self.pointer_to_relocations);
        writer.write_le(Self::POINTER_TO_LINENUMBERS);
        writer.write_le(self.number_of_relocations);
        writer.write_le(Self::NUMBER_OF_LINENUMBERS);
        writer.write_le(self.characteristics.bits());
        Ok(())
    }

    /// Returns `true` if `rva` falls inside this section's virtual range.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && (rva - self.virtual_address) < self.virtual_size
    }
}

/// The ordered set of section headers, pivoting virtual addresses into
/// file offsets.
///
/// Constructed once the section table has been parsed; from that point on
/// every RVA in the image can be dereferenced.
#[derive(Debug, Clone)]
pub struct SectionDirectory {
    headers: Vec<SectionHeader>,
}

impl SectionDirectory {
    /// Build a directory over the parsed headers (document order).
    #[must_use]
    pub fn new(headers: Vec<SectionHeader>) -> SectionDirectory {
        SectionDirectory { headers }
    }

    /// The headers in document order.
    #[must_use]
    pub fn headers(&self) -> &[SectionHeader] {
        &self.headers
    }

    /// The header for a given section kind, if present.
    #[must_use]
    pub fn get(&self, kind: SectionKind) -> Option<&SectionHeader> {
        self.headers.iter().find(|h| h.kind == kind)
    }

    /// Resolve an RVA to `(file offset, bytes available)` within the
    /// owning section's raw data.
    ///
    /// # Errors
    /// A format violation naming `field` if no section contains the
    /// address; a hard parse failure, never recoverable.
    pub fn resolve(&self, rva: u32, field: &str) -> Result<(usize, usize)> {
        for header in &self.headers {
            if header.contains_rva(rva) {
                let delta = rva - header.virtual_address;
                let offset = header.pointer_to_raw_data.0 + delta;
                let available = header.size_of_raw_data - delta;
                return Ok((offset as usize, available as usize));
            }
        }

        Err(malformed_error!(
            "invalid {} - address {:#010x} is outside every section",
            field,
            rva
        ))
    }
}
