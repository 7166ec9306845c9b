//! Address types: file offsets, RVAs and their resolution lifecycle.
//!
//! Almost every interesting field in a PE image is not a file offset but a
//! *relative virtual address*, meaningful only once the section table
//! maps virtual ranges onto file ranges. These wrappers keep "address
//! known" and "payload known" as distinct, checkable states:
//!
//! - reading parses only the raw address ([`Rva::read`]); the payload is
//!   untouched,
//! - dereferencing ([`Rva::reader`] and friends) maps the address through
//!   the section directory and hands back a cursor over the pointed-to
//!   bytes, eagerly, so nothing lazy survives past the deref phase,
//! - on the write side, [`Rva::alloc`] records a reservation in a growing
//!   section and [`Rva::fixup`] turns it into the final address once
//!   sections are placed, before [`Rva::write`] serializes the bare
//!   address again.
//!
//! A null address (zero) dereferences to "absent" wherever the format
//! documents the field optional; an address no section contains is a hard
//! format violation.

use crate::{
    file::{check_slice, parser::Parser, writer::Writer},
    pe::context::{ReaderContext, WriterContext},
    pe::sections::SectionKind,
    Result,
};

/// An absolute byte offset into the image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileOffset(pub u32);

impl FileOffset {
    /// Read a file offset.
    pub fn read(parser: &mut Parser) -> Result<FileOffset> {
        Ok(FileOffset(parser.read_le::<u32>()?))
    }

    /// Write a file offset.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.0);
    }
}

/// A relative virtual address, logically typed by the payload it points
/// to.
///
/// `value` is `None` until a deref pass resolves the address and parses
/// the payload; afterwards the structure carries both. The unparameterized
/// form `Rva` (with `T = ()`) is used for address-only fields such as the
/// base-of-code pointer.
#[derive(Debug, Clone)]
pub struct Rva<T = ()> {
    address: u32,
    /// The resolved payload, populated by the owning structure's deref.
    pub value: Option<T>,
    slot: Option<(SectionKind, u32)>,
}

impl<T> Default for Rva<T> {
    fn default() -> Self {
        Rva {
            address: 0,
            value: None,
            slot: None,
        }
    }
}

impl<T> Rva<T> {
    /// A null (absent) address.
    #[must_use]
    pub fn null() -> Rva<T> {
        Rva::default()
    }

    /// An address-only RVA carrying a payload for the write side.
    #[must_use]
    pub fn with_value(value: T) -> Rva<T> {
        Rva {
            address: 0,
            value: Some(value),
            slot: None,
        }
    }

    /// Parse the raw 32-bit address. The payload is not touched.
    pub fn read(parser: &mut Parser) -> Result<Rva<T>> {
        Ok(Rva {
            address: parser.read_le::<u32>()?,
            value: None,
            slot: None,
        })
    }

    /// The raw address value.
    #[must_use]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Overwrite the address directly (used by fixups whose address comes
    /// from an aggregate query rather than a reservation).
    pub fn set_address(&mut self, address: u32) {
        self.address = address;
    }

    /// Returns `true` if the address is null (absent).
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Dereference: a cursor over the pointed-to bytes, spanning the rest
    /// of the owning section's raw data. `None` for a null address.
    ///
    /// Only callable once the section directory is known; an address no
    /// section contains is a format violation naming `field`.
    pub fn reader<'d>(
        &self,
        ctxt: &ReaderContext<'d>,
        field: &str,
    ) -> Result<Option<Parser<'d>>> {
        if self.address == 0 {
            return Ok(None);
        }

        let (offset, available) = ctxt.resolve(self.address, field)?;
        let data = check_slice(ctxt.data, offset, available)?;
        Ok(Some(Parser::new(data)))
    }

    /// Like [`Rva::reader`], but a null address is itself a format
    /// violation; for fields the format requires present.
    pub fn reader_non_null<'d>(
        &self,
        ctxt: &ReaderContext<'d>,
        field: &str,
    ) -> Result<Parser<'d>> {
        match self.reader(ctxt, field)? {
            Some(parser) => Ok(parser),
            None => Err(malformed_error!("missing {}", field)),
        }
    }

    /// Reserve `len` bytes of payload space in `section`, recording the
    /// section-relative offset for the later fixup. Returns that offset.
    pub fn alloc(
        &mut self,
        ctxt: &mut WriterContext,
        section: SectionKind,
        len: u32,
    ) -> Result<u32> {
        let offset = ctxt.reserve(section, len)?;
        self.slot = Some((section, offset));
        Ok(offset)
    }

    /// Recompute the address from the final section placement. A field
    /// that never allocated (null, or address set directly) is left
    /// unchanged.
    pub fn fixup(&mut self, ctxt: &WriterContext) -> Result<()> {
        if let Some((section, offset)) = self.slot {
            self.address = ctxt.section_rva(section, offset)?;
        }
        Ok(())
    }

    /// The reservation recorded by [`Rva::alloc`], if any.
    pub(crate) fn slot(&self) -> Option<(SectionKind, u32)> {
        self.slot
    }

    /// Share another field's reservation, so both fix up to the same
    /// address (the lookup and address tables alias one hint-name record).
    pub(crate) fn share_slot<U>(&mut self, other: &Rva<U>) {
        self.slot = other.slot;
    }

    /// Serialize the bare address.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.address);
    }
}

/// An RVA paired with an explicit byte length, as used by directory-table
/// entries pointing at variable-length blobs.
#[derive(Debug, Clone)]
pub struct SizedRva<T = ()> {
    address: u32,
    /// Byte length of the pointed-to blob.
    pub size: u32,
    /// The resolved payload, populated by the owning structure's deref.
    pub value: Option<T>,
    slot: Option<(SectionKind, u32)>,
}

impl<T> Default for SizedRva<T> {
    fn default() -> Self {
        SizedRva {
            address: 0,
            size: 0,
            value: None,
            slot: None,
        }
    }
}

impl<T> SizedRva<T> {
    /// A null (absent) directory entry.
    #[must_use]
    pub fn null() -> SizedRva<T> {
        SizedRva::default()
    }

    /// An entry carrying a payload for the write side.
    #[must_use]
    pub fn with_value(value: T) -> SizedRva<T> {
        SizedRva {
            address: 0,
            size: 0,
            value: Some(value),
            slot: None,
        }
    }

    /// Parse the raw address/size pair. The payload is not touched.
    pub fn read(parser: &mut Parser) -> Result<SizedRva<T>> {
        Ok(SizedRva {
            address: parser.read_le::<u32>()?,
            size: parser.read_le::<u32>()?,
            value: None,
            slot: None,
        })
    }

    /// The raw address value.
    #[must_use]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Returns `true` if the address is null (absent).
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Returns `true` if both address and size are zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.address == 0 && self.size == 0
    }

    /// Dereference: a cursor spanning exactly the `size` bytes the entry
    /// covers. `None` for a null address.
    pub fn reader<'d>(
        &self,
        ctxt: &ReaderContext<'d>,
        field: &str,
    ) -> Result<Option<Parser<'d>>> {
        if self.address == 0 {
            return Ok(None);
        }

        let (offset, available) = ctxt.resolve(self.address, field)?;
        if (self.size as usize) > available {
            return Err(malformed_error!(
                "invalid {} - {} bytes at {:#010x} extend past the owning section",
                field,
                self.size,
                self.address
            ));
        }

        let data = check_slice(ctxt.data, offset, self.size as usize)?;
        Ok(Some(Parser::new(data)))
    }

    /// Like [`SizedRva::reader`], but a null address is a format
    /// violation.
    pub fn reader_non_null<'d>(
        &self,
        ctxt: &ReaderContext<'d>,
        field: &str,
    ) -> Result<Parser<'d>> {
        match self.reader(ctxt, field)? {
            Some(parser) => Ok(parser),
            None => Err(malformed_error!("missing {}", field)),
        }
    }

    /// Dereference an opaque blob: the raw bytes the entry covers, or
    /// `None` when absent.
    pub fn bytes(&self, ctxt: &ReaderContext, field: &str) -> Result<Option<Vec<u8>>> {
        match self.reader(ctxt, field)? {
            Some(parser) => Ok(Some(parser.data().to_vec())),
            None => Ok(None),
        }
    }

    /// Reserve `len` bytes in `section` and record `len` as the entry's
    /// size. Returns the section-relative offset.
    pub fn alloc(
        &mut self,
        ctxt: &mut WriterContext,
        section: SectionKind,
        len: u32,
    ) -> Result<u32> {
        let offset = ctxt.reserve(section, len)?;
        self.slot = Some((section, offset));
        self.size = len;
        Ok(offset)
    }

    /// Recompute the address from the final section placement.
    pub fn fixup(&mut self, ctxt: &WriterContext) -> Result<()> {
        if let Some((section, offset)) = self.slot {
            self.address = ctxt.section_rva(section, offset)?;
        }
        Ok(())
    }

    /// The reservation recorded by [`SizedRva::alloc`], if any.
    pub(crate) fn slot(&self) -> Option<(SectionKind, u32)> {
        self.slot
    }

    /// Serialize the address/size pair.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.address);
        writer.write_le(self.size);
    }
}

/// A directory entry whose value duplicates another field's resolved
/// address (the IAT directory entry mirrors the import table's address
/// table field).
///
/// Never allocates or dereferences on its own: the read side asserts the
/// equality, the write side copies it in during fixup.
#[derive(Debug, Clone, Copy, Default)]
pub struct AliasedSizedRva {
    address: u32,
    size: u32,
}

impl AliasedSizedRva {
    /// Parse the raw address/size pair.
    pub fn read(parser: &mut Parser) -> Result<AliasedSizedRva> {
        Ok(AliasedSizedRva {
            address: parser.read_le::<u32>()?,
            size: parser.read_le::<u32>()?,
        })
    }

    /// The raw address value.
    #[must_use]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// The raw size value.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Copy the aliased field's final address and size in.
    pub fn alias(&mut self, address: u32, size: u32) {
        self.address = address;
        self.size = size;
    }

    /// Serialize the address/size pair.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.address);
        writer.write_le(self.size);
    }
}
