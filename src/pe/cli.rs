//! The CLI (COM descriptor) header and v-table fixups.
//!
//! The directory entry that marks an image as managed: runtime version,
//! the metadata directory, runtime flags, the entry-point metadata token,
//! and the optional resources / strong-name-signature / v-table-fixup
//! blobs. Dereferencing the metadata directory publishes the resolved
//! stream-header list on the reader context, which is the handoff point
//! into the metadata-tables decoder.

use bitflags::bitflags;

use crate::{
    file::{parser::Parser, writer::Writer},
    pe::{
        address::SizedRva,
        context::{ReaderContext, WriterContext},
        metadata::MetadataRoot,
        sections::SectionKind,
    },
    Result,
};

bitflags! {
    /// Runtime flags of the CLI header (`COMIMAGE_FLAGS_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuntimeFlags: u32 {
        /// Image contains only IL code.
        const IL_ONLY = 0x0000_0001;
        /// Image requires a 32-bit process.
        const REQUIRE_32BIT = 0x0000_0002;
        /// Image is an IL library.
        const IL_LIBRARY = 0x0000_0004;
        /// Image is strong-name signed.
        const STRONG_NAME_SIGNED = 0x0000_0008;
        /// Entry point is an unmanaged method.
        const NATIVE_ENTRYPOINT = 0x0000_0010;
        /// Debugger tracking data is present.
        const TRACK_DEBUG_DATA = 0x0001_0000;
    }
}

bitflags! {
    /// Kind bits of one v-table fixup slot (`COR_VTABLE_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VtableKind: u16 {
        /// Slots are 32 bits wide.
        const SLOT_32BIT = 0x0001;
        /// Slots are 64 bits wide.
        const SLOT_64BIT = 0x0002;
        /// Slots are called from unmanaged code.
        const FROM_UNMANAGED = 0x0004;
        /// Call most-derived method.
        const CALL_MOST_DERIVED = 0x0010;
    }
}

/// One v-table fixup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtableFixup {
    /// Virtual address of the slot array.
    pub virtual_address: u32,
    /// Number of slots.
    pub count: u16,
    /// Kind bits.
    pub kind: VtableKind,
}

impl VtableFixup {
    /// Encoded size of one record.
    pub const SIZE: u32 = 8;

    /// First-pass scan: step over one record.
    pub fn skip(parser: &mut Parser) -> Result<()> {
        parser.skip(Self::SIZE as usize)
    }

    /// Parse one record.
    pub fn read(parser: &mut Parser) -> Result<VtableFixup> {
        Ok(VtableFixup {
            virtual_address: parser.read_le::<u32>()?,
            count: parser.read_le::<u16>()?,
            kind: VtableKind::from_bits_retain(parser.read_le::<u16>()?),
        })
    }

    /// Serialize one record.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.virtual_address);
        writer.write_le(self.count);
        writer.write_le(self.kind.bits());
    }
}

/// The v-table fixup list, discovered by the same two-pass scan the
/// relocation table uses.
#[derive(Debug, Clone, Default)]
pub struct VtableFixups {
    /// The records, in file order.
    pub fixups: Vec<VtableFixup>,
}

impl VtableFixups {
    /// Parse the list over the directory-sized blob.
    pub fn read(parser: &mut Parser) -> Result<VtableFixups> {
        let init_offset = parser.pos();
        let mut count = 0;
        while !parser.at_end() {
            VtableFixup::skip(parser)?;
            count += 1;
        }

        if count == 0 {
            return Ok(VtableFixups::default());
        }

        parser.seek(init_offset)?;
        let mut fixups = Vec::with_capacity(count);
        for _ in 0..count {
            fixups.push(VtableFixup::read(parser)?);
        }

        Ok(VtableFixups { fixups })
    }

    /// Encoded size of the list.
    pub(crate) fn encoded_len(&self) -> u32 {
        self.fixups.len() as u32 * VtableFixup::SIZE
    }

    /// Serialize every record.
    pub fn write(&self, writer: &mut Writer) {
        for fixup in &self.fixups {
            fixup.write(writer);
        }
    }
}

/// The CLI header.
#[derive(Debug, Clone)]
pub struct CliHeader {
    /// Minimum major runtime version.
    pub major_runtime_version: u16,
    /// Minimum minor runtime version.
    pub minor_runtime_version: u16,
    /// The metadata blob directory.
    pub metadata: SizedRva<MetadataRoot>,
    /// Runtime flags.
    pub flags: RuntimeFlags,
    /// Metadata token of the entry point (`MethodDef` or `File`).
    pub entry_point_token: u32,
    /// Managed resources blob, if any.
    pub resources: SizedRva<Vec<u8>>,
    /// Strong-name signature hash, if any.
    pub strong_name_signature: SizedRva<Vec<u8>>,
    /// V-table fixups, if any.
    pub vtable_fixups: SizedRva<VtableFixups>,
}

impl CliHeader {
    /// Encoded size of the header.
    pub const SIZE: u32 = 72;
    /// Nominal major runtime version.
    pub const DEFAULT_MAJOR_RUNTIME_VERSION: u16 = 2;
    /// Nominal minor runtime version.
    pub const DEFAULT_MINOR_RUNTIME_VERSION: u16 = 5;

    /// Parse and validate the CLI header.
    pub fn read(_ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<CliHeader> {
        let actual_cb = parser.read_le::<u32>()?;
        if actual_cb != Self::SIZE {
            return Err(malformed_error!("invalid CliHeader.Cb - {}", actual_cb));
        }
        let major_runtime_version = parser.read_le::<u16>()?;
        let minor_runtime_version = parser.read_le::<u16>()?;
        let metadata = SizedRva::read(parser)?;
        let flags = RuntimeFlags::from_bits_retain(parser.read_le::<u32>()?);
        let entry_point_token = parser.read_le::<u32>()?;
        let resources = SizedRva::read(parser)?;
        let strong_name_signature = SizedRva::read(parser)?;
        let actual_code_manager_table = parser.read_le::<u64>()?;
        if actual_code_manager_table != 0 {
            return Err(malformed_error!("invalid CliHeader.CodeManagerTable"));
        }
        let vtable_fixups = SizedRva::read(parser)?;
        let actual_export_jumps = parser.read_le::<u64>()?;
        if actual_export_jumps != 0 {
            return Err(malformed_error!("invalid CliHeader.ExportAddressTableJumps"));
        }
        let actual_managed_native_header = parser.read_le::<u64>()?;
        if actual_managed_native_header != 0 {
            return Err(malformed_error!("invalid CliHeader.ManagedNativeHeader"));
        }

        Ok(CliHeader {
            major_runtime_version,
            minor_runtime_version,
            metadata,
            flags,
            entry_point_token,
            resources,
            strong_name_signature,
            vtable_fixups,
        })
    }

    /// Resolve the metadata blob (publishing its stream headers on the
    /// context) and the optional blobs.
    pub fn deref(&mut self, ctxt: &mut ReaderContext) -> Result<()> {
        let reader = self.metadata.reader_non_null(ctxt, "CliHeader.MetaData")?;
        let root = MetadataRoot::parse(reader.data())?;
        // Heap references elsewhere may now be resolved by name
        ctxt.streams = Some(root.stream_headers.clone());
        self.metadata.value = Some(root);

        let bytes = self.resources.bytes(ctxt, "CliHeader.Resources")?;
        self.resources.value = bytes;
        let bytes = self
            .strong_name_signature
            .bytes(ctxt, "CliHeader.StrongNameSignature")?;
        self.strong_name_signature.value = bytes;

        let fixups = match self.vtable_fixups.reader(ctxt, "CliHeader.VtableFixups")? {
            Some(mut reader) => VtableFixups::read(&mut reader)?,
            None => VtableFixups::default(),
        };
        self.vtable_fixups.value = Some(fixups);

        ctxt.trace_line(|| format!("CliHeader.MetaData: {:#010x}", self.metadata.address()));

        Ok(())
    }

    /// Reserve the metadata blob and the optional blobs in the code
    /// section.
    pub fn alloc(&mut self, ctxt: &mut WriterContext) -> Result<()> {
        let Some(root) = self.metadata.value.as_ref() else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "metadata root is not populated".to_string(),
            });
        };
        let metadata_len = root.raw.len() as u32;
        ctxt.align(SectionKind::Text, 4)?;
        self.metadata.alloc(ctxt, SectionKind::Text, metadata_len)?;

        let resources_len = self.resources.value.as_ref().map_or(0, |b| b.len() as u32);
        if resources_len > 0 {
            ctxt.align(SectionKind::Text, 4)?;
            self.resources.alloc(ctxt, SectionKind::Text, resources_len)?;
        }

        let signature_len = self
            .strong_name_signature
            .value
            .as_ref()
            .map_or(0, |b| b.len() as u32);
        if signature_len > 0 {
            ctxt.align(SectionKind::Text, 4)?;
            self.strong_name_signature
                .alloc(ctxt, SectionKind::Text, signature_len)?;
        }

        let fixups_len = self
            .vtable_fixups
            .value
            .as_ref()
            .map_or(0, VtableFixups::encoded_len);
        if fixups_len > 0 {
            ctxt.align(SectionKind::Text, 4)?;
            self.vtable_fixups.alloc(ctxt, SectionKind::Text, fixups_len)?;
        }

        Ok(())
    }

    /// Finalize every blob address.
    pub fn fixup(&mut self, ctxt: &WriterContext) -> Result<()> {
        self.metadata.fixup(ctxt)?;
        self.resources.fixup(ctxt)?;
        self.strong_name_signature.fixup(ctxt)?;
        self.vtable_fixups.fixup(ctxt)?;
        Ok(())
    }

    /// Serialize the header.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(Self::SIZE);
        writer.write_le(self.major_runtime_version);
        writer.write_le(self.minor_runtime_version);
        self.metadata.write(writer);
        writer.write_le(self.flags.bits());
        writer.write_le(self.entry_point_token);
        self.resources.write(writer);
        self.strong_name_signature.write(writer);
        writer.write_le(0u64); // code manager table
        self.vtable_fixups.write(writer);
        writer.write_le(0u64); // export address table jumps
        writer.write_le(0u64); // managed native header
    }
}
