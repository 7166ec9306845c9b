//! Fixed-layout header records at the front of the image.
//!
//! DOS header, COFF file header and the three blocks of the PE optional
//! header (standard fields, NT-specific fields, data directories). Each
//! record follows the same four-operation contract: `read` parses and
//! validates, `deref` resolves any RVAs it owns (requires the section
//! directory), `alloc`/`fixup` participate in the write-side layout
//! passes, and `write` serializes. Validation is strict equality for
//! every field the format pins to a constant; the tolerated exceptions
//! live in [`crate::pe::variations`].

use bitflags::bitflags;
use strum::FromRepr;

use crate::{
    file::{parser::Parser, writer::Writer},
    pe::{
        address::{AliasedSizedRva, FileOffset, Rva, SizedRva},
        cli::CliHeader,
        context::{round_up, ReaderContext, WriterContext, FILE_ALIGNMENTS, SECTION_ALIGNMENT},
        imports::{ImportLookupTable, ImportTable},
        relocs::RelocationTable,
        sections::{SectionHeader, SectionKind},
        variations,
    },
    Result,
};

/// Total size of everything before the first section's raw data: DOS
/// header, COFF header, optional header and the three-entry section table.
pub(crate) const HEADERS_SIZE: u32 =
    DosHeader::SIZE + CoffHeader::SIZE + OptionalHeader::SIZE + 3 * SectionHeader::SIZE;

/// The 128-byte DOS stub opening every image.
///
/// Apart from `LfaNew` (the file offset of the PE signature) and the
/// trailing reserved dword, the stub is a fixed byte string: the historic
/// DOS program that prints "This program cannot be run in DOS mode".
#[derive(Debug, Clone, Default)]
pub struct DosHeader {
    /// File offset of the PE signature; must be at least the stub's own
    /// size.
    pub lfa_new: FileOffset,
    /// Trailing reserved dword. Zero per the format; tolerated non-zero
    /// (see [`crate::pe::variations`]).
    pub final_word: u32,
}

impl DosHeader {
    /// Encoded size of the DOS stub.
    pub const SIZE: u32 = 128;

    #[rustfmt::skip]
    const PREFIX: [u8; 60] = [
        0x4d, 0x5a, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00,
        0x00, 0xFF, 0xFF, 0x00, 0x00, 0xb8, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    #[rustfmt::skip]
    const SUFFIX: [u8; 60] = [
        0x0e, 0x1f, 0xba, 0x0e, 0x00, 0xb4, 0x09, 0xcd, 0x21, 0xb8, 0x01,
        0x4c, 0xcd, 0x21, 0x54, 0x68, 0x69, 0x73, 0x20, 0x70, 0x72, 0x6f,
        0x67, 0x72, 0x61, 0x6d, 0x20, 0x63, 0x61, 0x6e, 0x6e, 0x6f, 0x74,
        0x20, 0x62, 0x65, 0x20, 0x72, 0x75, 0x6e, 0x20, 0x69, 0x6e, 0x20,
        0x44, 0x4f, 0x53, 0x20, 0x6d, 0x6f, 0x64, 0x65, 0x2e, 0x0d, 0x0d,
        0x0a, 0x24, 0x00, 0x00, 0x00,
    ];

    /// Parse and validate the DOS stub.
    pub fn read(ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<DosHeader> {
        if parser.remaining() < Self::SIZE as usize {
            return Err(malformed_error!("missing DosHeader"));
        }

        let actual_prefix = parser.read_bytes(Self::PREFIX.len())?;
        if actual_prefix != Self::PREFIX.as_slice() {
            return Err(malformed_error!("invalid DosHeader.Prefix"));
        }

        let lfa_new = FileOffset::read(parser)?;
        if lfa_new.0 < Self::SIZE {
            return Err(malformed_error!("invalid DosHeader.LfaNew"));
        }

        let actual_suffix = parser.read_bytes(Self::SUFFIX.len())?;
        if actual_suffix != Self::SUFFIX.as_slice() {
            return Err(malformed_error!("invalid DosHeader.Suffix"));
        }

        let final_word = parser.read_le::<u32>()?;
        variations::check("DosHeader.Final", final_word == 0)?;

        ctxt.trace_line(|| format!("DosHeader.LfaNew: {:#010x}", lfa_new.0));

        Ok(DosHeader { lfa_new, final_word })
    }

    /// Write-side layout: the PE signature follows the stub immediately.
    pub fn alloc(&mut self) {
        self.lfa_new = FileOffset(Self::SIZE);
    }

    /// Serialize the DOS stub.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&Self::PREFIX);
        self.lfa_new.write(writer);
        writer.write_bytes(&Self::SUFFIX);
        writer.write_le(self.final_word);
    }
}

bitflags! {
    /// COFF characteristics bits (`IMAGE_FILE_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoffFlags: u16 {
        /// Relocation info stripped from the file.
        const RELOCS_STRIPPED = 0x0001;
        /// File is executable.
        const EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers stripped.
        const LINE_NUMS_STRIPPED = 0x0004;
        /// COFF local symbols stripped.
        const LOCAL_SYMS_STRIPPED = 0x0008;
        /// Aggressively trim the working set.
        const AGGRESSIVE_WS_TRIM = 0x0010;
        /// Application can handle > 2GB addresses.
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// Bytes of the word are reversed (low).
        const BYTES_REVERSED_LO = 0x0080;
        /// Machine is based on a 32-bit word architecture.
        const MACHINE_32BIT = 0x0100;
        /// Debugging information stripped.
        const DEBUG_STRIPPED = 0x0200;
        /// Copy and run from swap if on removable media.
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        /// Copy and run from swap if on network media.
        const NET_RUN_FROM_SWAP = 0x0800;
        /// System file, not a user program.
        const SYSTEM = 0x1000;
        /// File is a DLL.
        const DLL = 0x2000;
        /// Run only on a uniprocessor machine.
        const UP_SYSTEM_ONLY = 0x4000;
        /// Bytes of the word are reversed (high).
        const BYTES_REVERSED_HI = 0x8000;
    }
}

/// The COFF file header, including the leading `PE\0\0` signature.
#[derive(Debug, Clone)]
pub struct CoffHeader {
    /// Link time, in seconds since the Unix epoch. Producer-variable; the
    /// write pipeline never refreshes it.
    pub timestamp: u32,
    /// Characteristics bits. A required subset must be set and a
    /// forbidden subset clear, independent of the DLL bit.
    pub flags: CoffFlags,
}

impl CoffHeader {
    /// Encoded size including the PE signature.
    pub const SIZE: u32 = 24;

    const SIGNATURE: u32 = 0x0000_4550;
    const MACHINE: u16 = 0x014c;
    /// Managed images in this layout carry exactly three sections.
    pub const NUMBER_OF_SECTIONS: u16 = 3;
    const POINTER_TO_SYMBOL_TABLE: u32 = 0;
    const NUMBER_OF_SYMBOLS: u32 = 0;

    const REQUIRED_FLAGS: CoffFlags =
        CoffFlags::EXECUTABLE_IMAGE.union(CoffFlags::MACHINE_32BIT);
    const FORBIDDEN_FLAGS: CoffFlags = CoffFlags::RELOCS_STRIPPED
        .union(CoffFlags::AGGRESSIVE_WS_TRIM)
        .union(CoffFlags::LARGE_ADDRESS_AWARE)
        .union(CoffFlags::BYTES_REVERSED_LO)
        .union(CoffFlags::DEBUG_STRIPPED)
        .union(CoffFlags::REMOVABLE_RUN_FROM_SWAP)
        .union(CoffFlags::NET_RUN_FROM_SWAP)
        .union(CoffFlags::SYSTEM)
        .union(CoffFlags::UP_SYSTEM_ONLY)
        .union(CoffFlags::BYTES_REVERSED_HI);
    const STRIPPED_FLAGS: CoffFlags =
        CoffFlags::LINE_NUMS_STRIPPED.union(CoffFlags::LOCAL_SYMS_STRIPPED);

    /// Parse and validate the COFF header.
    pub fn read(ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<CoffHeader> {
        if parser.remaining() < Self::SIZE as usize {
            return Err(malformed_error!("missing CoffHeader"));
        }

        let actual_signature = parser.read_le::<u32>()?;
        if actual_signature != Self::SIGNATURE {
            return Err(malformed_error!("invalid CoffHeader.Signature"));
        }
        let actual_machine = parser.read_le::<u16>()?;
        if actual_machine != Self::MACHINE {
            return Err(malformed_error!("invalid CoffHeader.Machine"));
        }
        let actual_number_of_sections = parser.read_le::<u16>()?;
        if actual_number_of_sections != Self::NUMBER_OF_SECTIONS {
            return Err(malformed_error!("invalid CoffHeader.NumberOfSections"));
        }
        let timestamp = parser.read_le::<u32>()?;
        let actual_pointer_to_symbol_table = parser.read_le::<u32>()?;
        if actual_pointer_to_symbol_table != Self::POINTER_TO_SYMBOL_TABLE {
            return Err(malformed_error!("invalid CoffHeader.PointerToSymbolTable"));
        }
        let actual_number_of_symbols = parser.read_le::<u32>()?;
        if actual_number_of_symbols != Self::NUMBER_OF_SYMBOLS {
            return Err(malformed_error!("invalid CoffHeader.NumberOfSymbols"));
        }
        let actual_optional_header_size = parser.read_le::<u16>()?;
        if actual_optional_header_size != OptionalHeader::SIZE as u16 {
            return Err(malformed_error!("invalid CoffHeader.OptionalHeaderSize"));
        }

        let flags = CoffFlags::from_bits_retain(parser.read_le::<u16>()?);
        let check = flags.difference(CoffFlags::DLL);
        if !check.contains(Self::REQUIRED_FLAGS) {
            return Err(malformed_error!("invalid CoffHeader.Flags"));
        }
        if check.intersects(Self::FORBIDDEN_FLAGS) {
            return Err(malformed_error!("invalid CoffHeader.Flags"));
        }
        variations::check("CoffHeader.Flags", check.contains(Self::STRIPPED_FLAGS))?;

        ctxt.trace_line(|| format!("CoffHeader.Flags: {:#06x}", flags.bits()));

        Ok(CoffHeader { timestamp, flags })
    }

    /// Returns `true` if the DLL characteristics bit is set.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.flags.contains(CoffFlags::DLL)
    }

    /// Serialize the COFF header.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(Self::SIGNATURE);
        writer.write_le(Self::MACHINE);
        writer.write_le(Self::NUMBER_OF_SECTIONS);
        writer.write_le(self.timestamp);
        writer.write_le(Self::POINTER_TO_SYMBOL_TABLE);
        writer.write_le(Self::NUMBER_OF_SYMBOLS);
        writer.write_le(OptionalHeader::SIZE as u16);
        writer.write_le(self.flags.bits());
    }
}

/// The two subsystems a managed executable may declare.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SubSystem {
    /// Windows graphical subsystem.
    WindowsGui = 2,
    /// Windows character subsystem.
    WindowsCui = 3,
}

/// Standard fields of the PE optional header.
#[derive(Debug, Clone)]
pub struct StandardFields {
    /// Linker major version; the format accepts 6 through 8.
    pub linker_major: u8,
    /// Raw size of the code section.
    pub code_size: u32,
    /// Combined raw size of the resource and relocation sections.
    pub initialized_data_size: u32,
    /// The native entry stub: six bytes, `FF 25` followed by the absolute
    /// address of the import address table entry.
    pub entry_point: Rva<Vec<u8>>,
    /// Start of the code section.
    pub base_of_code: Rva,
    /// Start of `.rsrc` or `.reloc`, whichever is lower.
    pub base_of_data: Rva,
}

impl StandardFields {
    /// Encoded size of the standard-fields block.
    pub const SIZE: u32 = 28;
    /// Length of the native entry stub.
    pub const ENTRY_STUB_SIZE: u32 = 6;

    const MAGIC: u16 = 0x010b;
    const LINKER_MAJOR_MIN: u8 = 6;
    const LINKER_MAJOR_MAX: u8 = 8;
    const LINKER_MINOR: u8 = 0;
    const UNINITIALIZED_DATA_SIZE: u32 = 0;

    /// Parse and validate the standard fields. No RVA resolution happens
    /// here; the section directory does not exist yet.
    pub fn read(ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<StandardFields> {
        let actual_magic = parser.read_le::<u16>()?;
        if actual_magic != Self::MAGIC {
            return Err(malformed_error!("invalid StandardFields.Magic"));
        }
        let linker_major = parser.read_le::<u8>()?;
        if !(Self::LINKER_MAJOR_MIN..=Self::LINKER_MAJOR_MAX).contains(&linker_major) {
            return Err(malformed_error!("invalid StandardFields.LinkerMajor"));
        }
        let actual_linker_minor = parser.read_le::<u8>()?;
        if actual_linker_minor != Self::LINKER_MINOR {
            return Err(malformed_error!("invalid StandardFields.LinkerMinor"));
        }
        let code_size = parser.read_le::<u32>()?;
        let initialized_data_size = parser.read_le::<u32>()?;
        let actual_uninitialized = parser.read_le::<u32>()?;
        if actual_uninitialized != Self::UNINITIALIZED_DATA_SIZE {
            return Err(malformed_error!(
                "invalid StandardFields.UninitializedDataSize"
            ));
        }
        let entry_point = Rva::read(parser)?;
        let base_of_code = Rva::read(parser)?;
        let base_of_data = Rva::read(parser)?;

        ctxt.trace_line(|| format!("StandardFields.CodeSize: {:#010x}", code_size));
        ctxt.trace_line(|| {
            format!(
                "StandardFields.InitializedDataSize: {:#010x}",
                initialized_data_size
            )
        });

        Ok(StandardFields {
            linker_major,
            code_size,
            initialized_data_size,
            entry_point,
            base_of_code,
            base_of_data,
        })
    }

    /// Resolve and validate the entry stub.
    pub fn deref(&mut self, ctxt: &mut ReaderContext) -> Result<()> {
        let mut reader = self
            .entry_point
            .reader_non_null(ctxt, "StandardFields.EntryPoint")?;
        let stub = reader.read_bytes(Self::ENTRY_STUB_SIZE as usize)?;
        if stub[0] != 0xFF || stub[1] != 0x25 {
            return Err(malformed_error!("invalid StandardFields.EntryPoint"));
        }
        self.entry_point.value = Some(stub.to_vec());

        ctxt.trace_line(|| {
            format!(
                "StandardFields.EntryPoint: {:#010x}",
                self.entry_point.address()
            )
        });

        Ok(())
    }

    /// Reserve space for the entry stub at the end of the code section.
    pub fn alloc(&mut self, ctxt: &mut WriterContext) -> Result<()> {
        ctxt.align(SectionKind::Text, 4)?;
        self.entry_point
            .alloc(ctxt, SectionKind::Text, Self::ENTRY_STUB_SIZE)?;
        Ok(())
    }

    /// Derive the aggregate size fields and final addresses.
    pub fn fixup(&mut self, ctxt: &WriterContext) -> Result<()> {
        self.code_size = ctxt.code_size()?;
        self.initialized_data_size = ctxt.initialized_data_size()?;
        self.entry_point.fixup(ctxt)?;
        self.base_of_code.set_address(ctxt.base_of_code()?);
        self.base_of_data.set_address(ctxt.base_of_data()?);
        Ok(())
    }

    /// Serialize the standard fields.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(Self::MAGIC);
        writer.write_le(self.linker_major);
        writer.write_le(Self::LINKER_MINOR);
        writer.write_le(self.code_size);
        writer.write_le(self.initialized_data_size);
        writer.write_le(Self::UNINITIALIZED_DATA_SIZE);
        self.entry_point.write(writer);
        self.base_of_code.write(writer);
        self.base_of_data.write(writer);
    }
}

/// NT-specific fields of the PE optional header.
#[derive(Debug, Clone)]
pub struct NtFields {
    /// Preferred load address. Nominally 0x400000; varies in the wild.
    pub image_base: u32,
    /// Raw-data alignment; 0x200 or 0x1000.
    pub file_alignment: u32,
    /// Virtual extent of the image, a multiple of the section alignment.
    pub image_size: u32,
    /// Size of all headers, a multiple of the file alignment.
    pub header_size: u32,
    /// PE checksum. Nominally zero; varies in the wild.
    pub file_checksum: u32,
    /// Declared subsystem.
    pub sub_system: SubSystem,
    /// DLL characteristics. Nominally zero; varies in the wild.
    pub dll_flags: u16,
    /// Stack commit size. Nominally 0x1000; varies in the wild.
    pub stack_commit_size: u32,
    /// Heap reserve size. Nominally 0x100000; varies in the wild.
    pub heap_reserve_size: u32,
    /// Heap commit size. Nominally 0x1000; varies in the wild.
    pub heap_commit_size: u32,
}

impl NtFields {
    /// Encoded size of the NT-specific block.
    pub const SIZE: u32 = 68;

    /// Nominal image base.
    pub const DEFAULT_IMAGE_BASE: u32 = 0x0040_0000;
    /// Nominal stack commit size.
    pub const DEFAULT_STACK_COMMIT: u32 = 0x1000;
    /// Nominal heap reserve size.
    pub const DEFAULT_HEAP_RESERVE: u32 = 0x0010_0000;
    /// Nominal heap commit size.
    pub const DEFAULT_HEAP_COMMIT: u32 = 0x1000;

    const OS_MAJOR: u16 = 4;
    const OS_MINOR: u16 = 0;
    const USER_MAJOR: u16 = 0;
    const USER_MINOR: u16 = 0;
    const SUBSYS_MAJOR: u16 = 4;
    const SUBSYS_MINOR: u16 = 0;
    const RESERVED: u32 = 0;
    const STACK_RESERVE_SIZE: u32 = 0x0010_0000;
    const LOADER_FLAGS: u32 = 0;
    const NUMBER_OF_DATA_DIRECTORIES: u32 = 0x10;

    /// Parse and validate the NT-specific fields.
    pub fn read(ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<NtFields> {
        let image_base = parser.read_le::<u32>()?;
        variations::check("NtFields.ImageBase", image_base == Self::DEFAULT_IMAGE_BASE)?;
        let actual_section_alignment = parser.read_le::<u32>()?;
        if actual_section_alignment != SECTION_ALIGNMENT {
            return Err(malformed_error!("invalid NtFields.SectionAlignment"));
        }
        let file_alignment = parser.read_le::<u32>()?;
        if !FILE_ALIGNMENTS.contains(&file_alignment) {
            return Err(malformed_error!("invalid NtFields.FileAlignment"));
        }
        let actual_os_major = parser.read_le::<u16>()?;
        if actual_os_major != Self::OS_MAJOR {
            return Err(malformed_error!("invalid NtFields.OsMajor"));
        }
        let actual_os_minor = parser.read_le::<u16>()?;
        if actual_os_minor != Self::OS_MINOR {
            return Err(malformed_error!("invalid NtFields.OsMinor"));
        }
        let actual_user_major = parser.read_le::<u16>()?;
        if actual_user_major != Self::USER_MAJOR {
            return Err(malformed_error!("invalid NtFields.UserMajor"));
        }
        let actual_user_minor = parser.read_le::<u16>()?;
        if actual_user_minor != Self::USER_MINOR {
            return Err(malformed_error!("invalid NtFields.UserMinor"));
        }
        let actual_subsys_major = parser.read_le::<u16>()?;
        if actual_subsys_major != Self::SUBSYS_MAJOR {
            return Err(malformed_error!("invalid NtFields.SubSysMajor"));
        }
        let actual_subsys_minor = parser.read_le::<u16>()?;
        if actual_subsys_minor != Self::SUBSYS_MINOR {
            return Err(malformed_error!("invalid NtFields.SubSysMinor"));
        }
        let actual_reserved = parser.read_le::<u32>()?;
        if actual_reserved != Self::RESERVED {
            return Err(malformed_error!("invalid NtFields.Reserved"));
        }
        let image_size = parser.read_le::<u32>()?;
        if image_size % SECTION_ALIGNMENT != 0 {
            return Err(malformed_error!("invalid NtFields.ImageSize"));
        }
        let header_size = parser.read_le::<u32>()?;
        if header_size % file_alignment != 0 {
            return Err(malformed_error!("invalid NtFields.HeaderSize"));
        }
        let file_checksum = parser.read_le::<u32>()?;
        variations::check("NtFields.FileChecksum", file_checksum == 0)?;
        let raw_sub_system = parser.read_le::<u16>()?;
        let Some(sub_system) = SubSystem::from_repr(raw_sub_system) else {
            return Err(malformed_error!("invalid NtFields.SubSystem"));
        };
        let dll_flags = parser.read_le::<u16>()?;
        variations::check("NtFields.DllFlags", dll_flags == 0)?;
        let actual_stack_reserve = parser.read_le::<u32>()?;
        if actual_stack_reserve != Self::STACK_RESERVE_SIZE {
            return Err(malformed_error!("invalid NtFields.StackReserveSize"));
        }
        let stack_commit_size = parser.read_le::<u32>()?;
        variations::check(
            "NtFields.StackCommitSize",
            stack_commit_size == Self::DEFAULT_STACK_COMMIT,
        )?;
        let heap_reserve_size = parser.read_le::<u32>()?;
        variations::check(
            "NtFields.HeapReserveSize",
            heap_reserve_size == Self::DEFAULT_HEAP_RESERVE,
        )?;
        let heap_commit_size = parser.read_le::<u32>()?;
        variations::check(
            "NtFields.HeapCommitSize",
            heap_commit_size == Self::DEFAULT_HEAP_COMMIT,
        )?;
        let actual_loader_flags = parser.read_le::<u32>()?;
        if actual_loader_flags != Self::LOADER_FLAGS {
            return Err(malformed_error!("invalid NtFields.LoaderFlags"));
        }
        let actual_number_of_data_directories = parser.read_le::<u32>()?;
        if actual_number_of_data_directories != Self::NUMBER_OF_DATA_DIRECTORIES {
            return Err(malformed_error!("invalid NtFields.NumberOfDataDirectories"));
        }

        ctxt.trace_line(|| format!("NtFields.ImageBase: {:#010x}", image_base));
        ctxt.trace_line(|| format!("NtFields.ImageSize: {:#010x}", image_size));
        ctxt.trace_line(|| format!("NtFields.HeaderSize: {:#010x}", header_size));

        Ok(NtFields {
            image_base,
            file_alignment,
            image_size,
            header_size,
            file_checksum,
            sub_system,
            dll_flags,
            stack_commit_size,
            heap_reserve_size,
            heap_commit_size,
        })
    }

    /// Derive the aggregate size fields from the final layout.
    pub fn fixup(&mut self, ctxt: &WriterContext) -> Result<()> {
        self.image_size = round_up(ctxt.virtual_limit()?, SECTION_ALIGNMENT);
        self.header_size = round_up(HEADERS_SIZE, self.file_alignment);
        self.file_checksum = 0;
        Ok(())
    }

    /// Serialize the NT-specific fields.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.image_base);
        writer.write_le(SECTION_ALIGNMENT);
        writer.write_le(self.file_alignment);
        writer.write_le(Self::OS_MAJOR);
        writer.write_le(Self::OS_MINOR);
        writer.write_le(Self::USER_MAJOR);
        writer.write_le(Self::USER_MINOR);
        writer.write_le(Self::SUBSYS_MAJOR);
        writer.write_le(Self::SUBSYS_MINOR);
        writer.write_le(Self::RESERVED);
        writer.write_le(self.image_size);
        writer.write_le(self.header_size);
        writer.write_le(self.file_checksum);
        writer.write_le(self.sub_system as u16);
        writer.write_le(self.dll_flags);
        writer.write_le(Self::STACK_RESERVE_SIZE);
        writer.write_le(self.stack_commit_size);
        writer.write_le(self.heap_reserve_size);
        writer.write_le(self.heap_commit_size);
        writer.write_le(Self::LOADER_FLAGS);
        writer.write_le(Self::NUMBER_OF_DATA_DIRECTORIES);
    }
}

/// The sixteen data-directory slots of the optional header.
///
/// A managed image populates import table, resource table, certificate
/// table, base-relocation table, debug, IAT and CLI header; every other
/// slot is an invariant zero. The IAT entry is an alias of the import
/// table's import-address-table field and never resolves on its own.
#[derive(Debug, Clone, Default)]
pub struct DataDirectories {
    /// Import directory record.
    pub import_table: SizedRva<ImportTable>,
    /// Native resource blob; nominally zero for managed images.
    pub resource_table: SizedRva<Vec<u8>>,
    /// Authenticode certificate blob; tolerated but never dereferenced.
    pub certificate_table: SizedRva<Vec<u8>>,
    /// Base-relocation table.
    pub base_relocation_table: SizedRva<RelocationTable>,
    /// Debug directory blob; nominally zero.
    pub debug: SizedRva<Vec<u8>>,
    /// Import address table; duplicates the import table's field.
    pub iat: AliasedSizedRva,
    /// CLI (COM descriptor) header.
    pub cli_header: SizedRva<CliHeader>,
}

impl DataDirectories {
    /// Encoded size of the data-directory block.
    pub const SIZE: u32 = 128;

    fn read_zero_slot(parser: &mut Parser, field: &'static str) -> Result<()> {
        let actual = parser.read_le::<u64>()?;
        if actual != 0 {
            return Err(malformed_error!("invalid {}", field));
        }
        Ok(())
    }

    /// Parse and validate the sixteen directory slots.
    pub fn read(_ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<DataDirectories> {
        Self::read_zero_slot(parser, "DataDirectories.ExportTable")?;
        let import_table = SizedRva::read(parser)?;
        let resource_table = SizedRva::read(parser)?;
        variations::check("DataDirectories.ResourceTable", resource_table.is_zero())?;
        Self::read_zero_slot(parser, "DataDirectories.ExceptionTable")?;
        let certificate_table = SizedRva::read(parser)?;
        variations::check(
            "DataDirectories.CertificateTable",
            certificate_table.is_zero(),
        )?;
        let base_relocation_table = SizedRva::read(parser)?;
        let debug = SizedRva::read(parser)?;
        variations::check("DataDirectories.Debug", debug.is_zero())?;
        Self::read_zero_slot(parser, "DataDirectories.Copyright")?;
        Self::read_zero_slot(parser, "DataDirectories.GlobalPtr")?;
        Self::read_zero_slot(parser, "DataDirectories.TlsTable")?;
        Self::read_zero_slot(parser, "DataDirectories.LoadConfigTable")?;
        Self::read_zero_slot(parser, "DataDirectories.BoundImport")?;
        let iat = AliasedSizedRva::read(parser)?;
        Self::read_zero_slot(parser, "DataDirectories.DelayImportDescriptor")?;
        let cli_header = SizedRva::read(parser)?;
        Self::read_zero_slot(parser, "DataDirectories.Reserved")?;

        Ok(DataDirectories {
            import_table,
            resource_table,
            certificate_table,
            base_relocation_table,
            debug,
            iat,
            cli_header,
        })
    }

    /// Resolve every populated directory, recursively dereferencing the
    /// import and CLI subsystems, and assert the IAT aliasing invariant.
    pub fn deref(&mut self, ctxt: &mut ReaderContext) -> Result<()> {
        let mut reader = self
            .import_table
            .reader_non_null(ctxt, "DataDirectories.ImportTable")?;
        let table = ImportTable::read(ctxt, &mut reader)?;
        self.import_table.value = Some(table);

        let bytes = self
            .resource_table
            .bytes(ctxt, "DataDirectories.ResourceTable")?;
        self.resource_table.value = bytes;

        // The certificate table is deliberately left unresolved: known
        // producers emit addresses outside every section.

        let mut reader = self
            .base_relocation_table
            .reader_non_null(ctxt, "DataDirectories.BaseRelocationTable")?;
        let table = RelocationTable::read(ctxt, &mut reader)?;
        self.base_relocation_table.value = Some(table);

        let bytes = self.debug.bytes(ctxt, "DataDirectories.Debug")?;
        self.debug.value = bytes;

        let mut reader = self
            .cli_header
            .reader_non_null(ctxt, "DataDirectories.CliHeader")?;
        let header = CliHeader::read(ctxt, &mut reader)?;
        self.cli_header.value = Some(header);

        if let Some(table) = self.import_table.value.as_mut() {
            table.deref(ctxt)?;
        }
        if let Some(header) = self.cli_header.value.as_mut() {
            header.deref(ctxt)?;
        }

        if let Some(table) = self.import_table.value.as_ref() {
            if self.iat.address() != table.import_address_table.address() {
                return Err(malformed_error!(
                    "invalid DataDirectories.IAT - does not alias the import address table"
                ));
            }
        }

        ctxt.trace_line(|| {
            format!(
                "DataDirectories.ImportTable: {:#010x}",
                self.import_table.address()
            )
        });
        ctxt.trace_line(|| {
            format!(
                "DataDirectories.CliHeader: {:#010x}",
                self.cli_header.address()
            )
        });

        Ok(())
    }

    /// Reserve every populated directory's payload.
    ///
    /// The code section is laid out import machinery first (so the IAT
    /// sits at the section base), then the CLI subsystem, then the debug
    /// blob; the native resource blob goes to `.rsrc` and the relocation
    /// table to `.reloc`.
    pub fn alloc(&mut self, ctxt: &mut WriterContext) -> Result<()> {
        let Some(import) = self.import_table.value.as_mut() else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "import table is not populated".to_string(),
            });
        };
        import.alloc(ctxt)?;
        ctxt.align(SectionKind::Text, 4)?;
        self.import_table
            .alloc(ctxt, SectionKind::Text, ImportTable::SIZE)?;

        if self.cli_header.value.is_none() {
            return Err(crate::Error::WriteLayoutFailed {
                message: "CLI header is not populated".to_string(),
            });
        }
        ctxt.align(SectionKind::Text, 4)?;
        self.cli_header
            .alloc(ctxt, SectionKind::Text, CliHeader::SIZE)?;
        if let Some(cli) = self.cli_header.value.as_mut() {
            cli.alloc(ctxt)?;
        }

        let debug_len = self.debug.value.as_ref().map_or(0, |b| b.len() as u32);
        if debug_len > 0 {
            ctxt.align(SectionKind::Text, 4)?;
            self.debug.alloc(ctxt, SectionKind::Text, debug_len)?;
        }

        let resource_len = self
            .resource_table
            .value
            .as_ref()
            .map_or(0, |b| b.len() as u32);
        if resource_len > 0 {
            self.resource_table
                .alloc(ctxt, SectionKind::Rsrc, resource_len)?;
        }

        self.base_relocation_table.alloc(
            ctxt,
            SectionKind::Reloc,
            RelocationTable::DERIVED_TABLE_LEN,
        )?;

        Ok(())
    }

    /// Finalize every directory address and copy the IAT alias in.
    pub fn fixup(&mut self, ctxt: &WriterContext) -> Result<()> {
        if let Some(table) = self.import_table.value.as_mut() {
            table.fixup(ctxt)?;
        }
        self.import_table.fixup(ctxt)?;
        self.resource_table.fixup(ctxt)?;
        self.base_relocation_table.fixup(ctxt)?;
        self.debug.fixup(ctxt)?;
        if let Some(header) = self.cli_header.value.as_mut() {
            header.fixup(ctxt)?;
        }
        self.cli_header.fixup(ctxt)?;

        let Some(table) = self.import_table.value.as_ref() else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "import table is not populated".to_string(),
            });
        };
        self.iat.alias(
            table.import_address_table.address(),
            ImportLookupTable::SIZE,
        );

        Ok(())
    }

    /// Serialize the sixteen directory slots.
    ///
    /// The certificate directory is always written as zero: the read side
    /// never resolves its payload, so the write side produces unsigned
    /// images.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(0u64); // export table
        self.import_table.write(writer);
        self.resource_table.write(writer);
        writer.write_le(0u64); // exception table
        writer.write_le(0u64); // certificate table
        self.base_relocation_table.write(writer);
        self.debug.write(writer);
        writer.write_le(0u64); // copyright
        writer.write_le(0u64); // global ptr
        writer.write_le(0u64); // TLS table
        writer.write_le(0u64); // load config table
        writer.write_le(0u64); // bound import
        self.iat.write(writer);
        writer.write_le(0u64); // delay import descriptor
        self.cli_header.write(writer);
        writer.write_le(0u64); // reserved
    }
}

/// The PE optional header: standard fields, NT-specific fields and the
/// data directories, 224 bytes total.
#[derive(Debug, Clone)]
pub struct OptionalHeader {
    /// Standard fields block.
    pub standard_fields: StandardFields,
    /// NT-specific fields block.
    pub nt_fields: NtFields,
    /// Data-directory block.
    pub data_directories: DataDirectories,
}

impl OptionalHeader {
    /// Encoded size of the whole optional header.
    pub const SIZE: u32 = StandardFields::SIZE + NtFields::SIZE + DataDirectories::SIZE;

    /// Parse and validate all three blocks.
    pub fn read(ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<OptionalHeader> {
        if parser.remaining() < Self::SIZE as usize {
            return Err(malformed_error!("missing OptionalHeader"));
        }

        let standard_fields = StandardFields::read(ctxt, parser)?;
        let nt_fields = NtFields::read(ctxt, parser)?;
        let data_directories = DataDirectories::read(ctxt, parser)?;

        Ok(OptionalHeader {
            standard_fields,
            nt_fields,
            data_directories,
        })
    }

    /// Resolve every RVA the header owns.
    pub fn deref(&mut self, ctxt: &mut ReaderContext) -> Result<()> {
        self.standard_fields.deref(ctxt)?;
        self.data_directories.deref(ctxt)
    }

    /// Serialize all three blocks.
    pub fn write(&self, writer: &mut Writer) {
        self.standard_fields.write(writer);
        self.nt_fields.write(writer);
        self.data_directories.write(writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dos_header_bytes() -> Vec<u8> {
        let mut header = DosHeader::default();
        header.alloc();
        let mut writer = Writer::new();
        header.write(&mut writer);
        writer.into_bytes()
    }

    #[test]
    fn dos_round_trip() {
        let bytes = dos_header_bytes();
        assert_eq!(bytes.len(), 128);
        assert_eq!(&bytes[0..2], b"MZ");

        let mut ctxt = ReaderContext::new(&bytes);
        let header = DosHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(header.lfa_new, FileOffset(128));
        assert_eq!(header.final_word, 0);
    }

    #[test]
    fn dos_rejects_prefix_damage() {
        let mut bytes = dos_header_bytes();
        bytes[0] = b'Z';
        let mut ctxt = ReaderContext::new(&bytes);
        let err = DosHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("DosHeader.Prefix"));
    }

    #[test]
    fn dos_rejects_low_lfa_new() {
        let mut bytes = dos_header_bytes();
        bytes[60] = 0x40;
        bytes[61] = 0;
        let mut ctxt = ReaderContext::new(&bytes);
        let err = DosHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("DosHeader.LfaNew"));
    }

    #[test]
    fn dos_tolerates_final_word() {
        // Known producers leave data in the trailing reserved dword
        let mut bytes = dos_header_bytes();
        bytes[124] = 0xAB;
        let mut ctxt = ReaderContext::new(&bytes);
        let header = DosHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(header.final_word, 0xAB);
    }

    fn coff_header_bytes(flags: CoffFlags) -> Vec<u8> {
        let header = CoffHeader {
            timestamp: 0x5F00_0000,
            flags,
        };
        let mut writer = Writer::new();
        header.write(&mut writer);
        writer.into_bytes()
    }

    #[test]
    fn coff_round_trip() {
        let flags = CoffFlags::EXECUTABLE_IMAGE | CoffFlags::MACHINE_32BIT;
        let bytes = coff_header_bytes(flags);
        assert_eq!(bytes.len(), 24);

        let mut ctxt = ReaderContext::new(&bytes);
        let header = CoffHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(header.timestamp, 0x5F00_0000);
        assert_eq!(header.flags, flags);
        assert!(!header.is_dll());
    }

    #[test]
    fn coff_dll_bit_is_independent() {
        let flags = CoffFlags::EXECUTABLE_IMAGE | CoffFlags::MACHINE_32BIT | CoffFlags::DLL;
        let bytes = coff_header_bytes(flags);
        let mut ctxt = ReaderContext::new(&bytes);
        let header = CoffHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert!(header.is_dll());
    }

    #[test]
    fn coff_rejects_wrong_machine() {
        let mut bytes = coff_header_bytes(CoffFlags::EXECUTABLE_IMAGE | CoffFlags::MACHINE_32BIT);
        bytes[4] = 0x64; // 0x8664, not the managed 32-bit machine
        bytes[5] = 0x86;
        let mut ctxt = ReaderContext::new(&bytes);
        let err = CoffHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("CoffHeader.Machine"));
    }

    #[test]
    fn coff_rejects_forbidden_flags() {
        let bytes = coff_header_bytes(
            CoffFlags::EXECUTABLE_IMAGE | CoffFlags::MACHINE_32BIT | CoffFlags::RELOCS_STRIPPED,
        );
        let mut ctxt = ReaderContext::new(&bytes);
        let err = CoffHeader::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("CoffHeader.Flags"));
    }

    #[test]
    fn coff_rejects_missing_required_flags() {
        let bytes = coff_header_bytes(CoffFlags::EXECUTABLE_IMAGE);
        let mut ctxt = ReaderContext::new(&bytes);
        assert!(CoffHeader::read(&mut ctxt, &mut Parser::new(&bytes)).is_err());
    }

    fn standard_fields() -> StandardFields {
        StandardFields {
            linker_major: 8,
            code_size: 0x200,
            initialized_data_size: 0x400,
            entry_point: Rva::null(),
            base_of_code: Rva::null(),
            base_of_data: Rva::null(),
        }
    }

    #[test]
    fn standard_fields_round_trip() {
        let mut fields = standard_fields();
        fields.entry_point.set_address(0x2100);
        fields.base_of_code.set_address(0x2000);
        fields.base_of_data.set_address(0x4000);

        let mut writer = Writer::new();
        fields.write(&mut writer);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), StandardFields::SIZE as usize);

        let mut ctxt = ReaderContext::new(&bytes);
        let parsed = StandardFields::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(parsed.linker_major, 8);
        assert_eq!(parsed.code_size, 0x200);
        assert_eq!(parsed.entry_point.address(), 0x2100);
        assert_eq!(parsed.base_of_data.address(), 0x4000);
    }

    #[test]
    fn standard_fields_reject_linker_version() {
        let mut fields = standard_fields();
        fields.linker_major = 5;
        let mut writer = Writer::new();
        fields.write(&mut writer);
        let bytes = writer.into_bytes();

        let mut ctxt = ReaderContext::new(&bytes);
        let err = StandardFields::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("StandardFields.LinkerMajor"));
    }

    fn nt_fields() -> NtFields {
        NtFields {
            image_base: NtFields::DEFAULT_IMAGE_BASE,
            file_alignment: 0x200,
            image_size: 0x8000,
            header_size: 0x200,
            file_checksum: 0,
            sub_system: SubSystem::WindowsCui,
            dll_flags: 0,
            stack_commit_size: NtFields::DEFAULT_STACK_COMMIT,
            heap_reserve_size: NtFields::DEFAULT_HEAP_RESERVE,
            heap_commit_size: NtFields::DEFAULT_HEAP_COMMIT,
        }
    }

    #[test]
    fn nt_fields_round_trip() {
        let fields = nt_fields();
        let mut writer = Writer::new();
        fields.write(&mut writer);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), NtFields::SIZE as usize);

        let mut ctxt = ReaderContext::new(&bytes);
        let parsed = NtFields::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(parsed.image_base, NtFields::DEFAULT_IMAGE_BASE);
        assert_eq!(parsed.sub_system, SubSystem::WindowsCui);
        assert_eq!(parsed.image_size, 0x8000);
    }

    #[test]
    fn nt_fields_reject_unaligned_image_size() {
        let mut fields = nt_fields();
        fields.image_size = 0x8100;
        let mut writer = Writer::new();
        fields.write(&mut writer);
        let bytes = writer.into_bytes();

        let mut ctxt = ReaderContext::new(&bytes);
        let err = NtFields::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("NtFields.ImageSize"));
    }

    #[test]
    fn nt_fields_reject_unknown_subsystem() {
        let fields = nt_fields();
        let mut writer = Writer::new();
        fields.write(&mut writer);
        let mut bytes = writer.into_bytes();
        bytes[40] = 9; // native subsystem, offset of the u16 within the block
        bytes[41] = 0;

        let mut ctxt = ReaderContext::new(&bytes);
        let err = NtFields::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("NtFields.SubSystem"));
    }

    #[test]
    fn nt_fields_tolerate_variation_values() {
        let mut fields = nt_fields();
        fields.image_base = 0x1000_0000;
        fields.file_checksum = 0xDEAD;
        fields.dll_flags = 0x540;
        fields.stack_commit_size = 0x2000;
        let mut writer = Writer::new();
        fields.write(&mut writer);
        let bytes = writer.into_bytes();

        let mut ctxt = ReaderContext::new(&bytes);
        let parsed = NtFields::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(parsed.image_base, 0x1000_0000);
        assert_eq!(parsed.file_checksum, 0xDEAD);
    }

    #[test]
    fn data_directories_reject_populated_reserved_slot() {
        let dirs = DataDirectories::default();
        let mut writer = Writer::new();
        dirs.write(&mut writer);
        let mut bytes = writer.into_bytes();
        assert_eq!(bytes.len(), DataDirectories::SIZE as usize);

        // Export table slot is the first eight bytes
        bytes[0] = 1;
        let mut ctxt = ReaderContext::new(&bytes);
        let err = DataDirectories::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("DataDirectories.ExportTable"));
    }

    #[test]
    fn data_directories_round_trip_addresses() {
        let mut dirs = DataDirectories::default();
        let mut writer = Writer::new();
        // Hand-write a directory block with import/IAT/CLI populated
        dirs.iat.alias(0x2000, 8);
        dirs.write(&mut writer);
        let mut bytes = writer.into_bytes();
        // import table at slot 1, CLI header at slot 14
        bytes[8..16].copy_from_slice(&[0x40, 0x20, 0, 0, 0x28, 0, 0, 0]);
        bytes[112..120].copy_from_slice(&[0x80, 0x20, 0, 0, 0x48, 0, 0, 0]);

        let mut ctxt = ReaderContext::new(&bytes);
        let parsed = DataDirectories::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(parsed.import_table.address(), 0x2040);
        assert_eq!(parsed.import_table.size, 0x28);
        assert_eq!(parsed.iat.address(), 0x2000);
        assert_eq!(parsed.cli_header.address(), 0x2080);
        assert_eq!(parsed.cli_header.size, 0x48);
    }
}
