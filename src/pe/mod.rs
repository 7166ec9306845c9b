//! The managed PE format layer.
//!
//! [`PeFile`] is the aggregate root owning the whole parsed tree: DOS
//! header, COFF header, optional header (with its data directories and
//! everything they point at), and the section table. Reading is a strictly
//! sequential pipeline (headers, then the section directory pivot, then
//! RVA dereferencing), and writing is the mirrored three-pass
//! Alloc/Fixup/Write protocol. Any validation failure at any stage aborts
//! the whole operation; no partial `PeFile` is ever returned.

pub mod address;
pub mod cli;
pub mod context;
pub mod headers;
pub mod imports;
pub mod metadata;
pub mod relocs;
pub mod sections;
pub mod variations;

use std::path::Path;

use crate::{
    file::{parser::Parser, writer::Writer, Backend, Memory, Physical},
    Result,
};

use address::{Rva, SizedRva};
use cli::{CliHeader, RuntimeFlags, VtableFixups};
use context::{round_up, ReaderContext, SectionLayout, WriterContext};
use headers::{
    CoffFlags, CoffHeader, DataDirectories, DosHeader, NtFields, OptionalHeader,
    StandardFields, SubSystem, HEADERS_SIZE,
};
use imports::{HintNameTable, ImportLookupTable, ImportTable};
use metadata::MetadataRoot;
use relocs::RelocationTable;
use sections::{SectionDirectory, SectionHeader, SectionKind};

/// A fully parsed managed PE image.
///
/// Owns every header record, the section table, and every payload the
/// deref phase copied out of the file. Constructed by [`PeFile::read`]
/// (or the [`PeFile::from_file`] / [`PeFile::from_mem`] conveniences) or
/// by [`PeFileBuilder`]; serialized back by [`PeFile::write`].
#[derive(Debug, Clone)]
pub struct PeFile {
    /// The 128-byte DOS stub.
    pub dos_header: DosHeader,
    /// The COFF file header.
    pub coff_header: CoffHeader,
    /// The PE optional header.
    pub optional_header: OptionalHeader,
    /// The section table, in document order.
    pub section_headers: Vec<SectionHeader>,
}

impl PeFile {
    /// Load and parse an image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<PeFile> {
        let backend = Physical::new(path)?;
        Self::load(&backend)
    }

    /// Parse an image already resident in memory.
    pub fn from_mem(data: Vec<u8>) -> Result<PeFile> {
        let backend = Memory::new(data);
        Self::load(&backend)
    }

    fn load(backend: &dyn Backend) -> Result<PeFile> {
        if backend.is_empty() {
            return Err(crate::Error::Empty);
        }

        let mut ctxt = ReaderContext::new(backend.data());
        Self::read(&mut ctxt)
    }

    /// The full read pipeline, strictly sequential:
    ///
    /// 1. DOS header, yielding the PE header offset.
    /// 2. COFF header, then the optional header's standard and
    ///    NT-specific fields; no RVA resolution yet.
    /// 3. The three-entry section table.
    /// 4. The section directory becomes available on the context: the
    ///    pivot after which RVAs can be dereferenced.
    /// 5. The optional header's directories deref recursively (imports,
    ///    relocations, CLI header, metadata stream directory).
    ///
    /// The context's stream-header list is populated as a side effect and
    /// is the handoff to the metadata-tables decoder.
    pub fn read(ctxt: &mut ReaderContext) -> Result<PeFile> {
        let mut parser = Parser::new(ctxt.data);

        let dos_header = DosHeader::read(ctxt, &mut parser)?;
        parser.seek(dos_header.lfa_new.0 as usize)?;

        let coff_header = CoffHeader::read(ctxt, &mut parser)?;
        let mut optional_header = OptionalHeader::read(ctxt, &mut parser)?;

        let mut section_headers =
            Vec::with_capacity(CoffHeader::NUMBER_OF_SECTIONS as usize);
        for _ in 0..CoffHeader::NUMBER_OF_SECTIONS {
            section_headers.push(SectionHeader::read(ctxt, &mut parser)?);
        }

        // The pivot: RVAs may be resolved from here on
        ctxt.sections = Some(SectionDirectory::new(section_headers.clone()));

        optional_header.deref(ctxt)?;

        Ok(PeFile {
            dos_header,
            coff_header,
            optional_header,
            section_headers,
        })
    }

    /// The section table, in document order.
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.section_headers
    }

    /// The resolved CLI header, once read.
    #[must_use]
    pub fn cli_header(&self) -> Option<&CliHeader> {
        self.optional_header.data_directories.cli_header.value.as_ref()
    }

    /// The entry-point metadata token, once read.
    #[must_use]
    pub fn entry_point_token(&self) -> Option<u32> {
        self.cli_header().map(|cli| cli.entry_point_token)
    }

    /// The resolved metadata root, once read; the handoff into the
    /// metadata-tables decoder.
    #[must_use]
    pub fn metadata(&self) -> Option<&MetadataRoot> {
        self.cli_header().and_then(|cli| cli.metadata.value.as_ref())
    }

    /// The full write pipeline: three total passes over the structure
    /// tree, each complete before the next begins.
    ///
    /// **Alloc** reserves every payload in its target section, recording
    /// provisional section-relative offsets, and then freezes section
    /// placement. **Fixup** turns reservations into final addresses and
    /// derives every aggregate field (code size, image size, header size,
    /// entry-point address, the relocation table covering the entry
    /// stub). **Write** serializes headers and payloads with no further
    /// address computation.
    pub fn write(&mut self) -> Result<Vec<u8>> {
        let image_base = self.optional_header.nt_fields.image_base;
        let file_alignment = self.optional_header.nt_fields.file_alignment;
        let mut ctxt = WriterContext::new(image_base, file_alignment)?;

        // Alloc
        self.dos_header.alloc();
        self.optional_header.data_directories.alloc(&mut ctxt)?;
        self.optional_header.standard_fields.alloc(&mut ctxt)?;
        ctxt.place(round_up(HEADERS_SIZE, file_alignment))?;

        // Fixup
        let Some((stub_section, stub_offset)) =
            self.optional_header.standard_fields.entry_point.slot()
        else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "entry stub was never allocated".to_string(),
            });
        };
        let stub_rva = ctxt.section_rva(stub_section, stub_offset)?;
        let reloc_table = RelocationTable::for_entry_stub(stub_rva + 2);
        if reloc_table.encoded_len() != RelocationTable::DERIVED_TABLE_LEN {
            return Err(crate::Error::WriteLayoutFailed {
                message: "relocation table does not match its reservation".to_string(),
            });
        }
        self.optional_header
            .data_directories
            .base_relocation_table
            .value = Some(reloc_table);

        self.optional_header.data_directories.fixup(&ctxt)?;
        self.optional_header.standard_fields.fixup(&ctxt)?;
        self.optional_header.nt_fields.fixup(&ctxt)?;
        self.section_headers = ctxt.section_headers()?;

        // Write
        let mut writer = Writer::new();
        self.dos_header.write(&mut writer);
        self.coff_header.write(&mut writer);
        self.optional_header.write(&mut writer);
        for header in &self.section_headers {
            header.write(&mut writer)?;
        }
        self.write_payloads(&ctxt, &mut writer)?;

        Ok(writer.into_bytes())
    }

    /// Serialize every section payload at the offset its reservation
    /// recorded, zero-filling alignment gaps and the file-alignment tail
    /// of each section.
    fn write_payloads(&self, ctxt: &WriterContext, writer: &mut Writer) -> Result<()> {
        fn at(
            layout: &SectionLayout,
            slot: Option<(SectionKind, u32)>,
            what: &str,
        ) -> Result<usize> {
            match slot {
                Some((_, offset)) => Ok((layout.pointer_to_raw_data + offset) as usize),
                None => Err(crate::Error::WriteLayoutFailed {
                    message: format!("{} was never allocated", what),
                }),
            }
        }
        fn missing(what: &str) -> crate::Error {
            crate::Error::WriteLayoutFailed {
                message: format!("{} is not populated", what),
            }
        }

        let text = *ctxt.layout(SectionKind::Text)?;
        let dirs = &self.optional_header.data_directories;
        let import = dirs
            .import_table
            .value
            .as_ref()
            .ok_or_else(|| missing("import table"))?;

        let address_table = import
            .import_address_table
            .value
            .as_ref()
            .ok_or_else(|| missing("import address table"))?;
        writer.ensure_at(at(
            &text,
            import.import_address_table.slot(),
            "import address table",
        )?)?;
        address_table.write(writer);

        let lookup_table = import
            .import_lookup_table
            .value
            .as_ref()
            .ok_or_else(|| missing("import lookup table"))?;
        writer.ensure_at(at(
            &text,
            import.import_lookup_table.slot(),
            "import lookup table",
        )?)?;
        lookup_table.write(writer);

        let hint = lookup_table
            .hint_name_table
            .value
            .as_ref()
            .ok_or_else(|| missing("hint-name table"))?;
        writer.ensure_at(at(
            &text,
            lookup_table.hint_name_table.slot(),
            "hint-name table",
        )?)?;
        hint.write(writer);

        let module_name = import
            .name
            .value
            .as_ref()
            .ok_or_else(|| missing("import module name"))?;
        writer.ensure_at(at(&text, import.name.slot(), "import module name")?)?;
        writer.write_string_ascii(module_name);

        writer.ensure_at(at(&text, dirs.import_table.slot(), "import directory record")?)?;
        import.write(writer);

        let cli = dirs
            .cli_header
            .value
            .as_ref()
            .ok_or_else(|| missing("CLI header"))?;
        writer.ensure_at(at(&text, dirs.cli_header.slot(), "CLI header")?)?;
        cli.write(writer);

        let root = cli
            .metadata
            .value
            .as_ref()
            .ok_or_else(|| missing("metadata root"))?;
        writer.ensure_at(at(&text, cli.metadata.slot(), "metadata blob")?)?;
        writer.write_bytes(&root.raw);

        if cli.resources.slot().is_some() {
            let bytes = cli
                .resources
                .value
                .as_ref()
                .ok_or_else(|| missing("managed resources"))?;
            writer.ensure_at(at(&text, cli.resources.slot(), "managed resources")?)?;
            writer.write_bytes(bytes);
        }
        if cli.strong_name_signature.slot().is_some() {
            let bytes = cli
                .strong_name_signature
                .value
                .as_ref()
                .ok_or_else(|| missing("strong-name signature"))?;
            writer.ensure_at(at(
                &text,
                cli.strong_name_signature.slot(),
                "strong-name signature",
            )?)?;
            writer.write_bytes(bytes);
        }
        if cli.vtable_fixups.slot().is_some() {
            let fixups = cli
                .vtable_fixups
                .value
                .as_ref()
                .ok_or_else(|| missing("v-table fixups"))?;
            writer.ensure_at(at(&text, cli.vtable_fixups.slot(), "v-table fixups")?)?;
            fixups.write(writer);
        }
        if dirs.debug.slot().is_some() {
            let bytes = dirs
                .debug
                .value
                .as_ref()
                .ok_or_else(|| missing("debug blob"))?;
            writer.ensure_at(at(&text, dirs.debug.slot(), "debug blob")?)?;
            writer.write_bytes(bytes);
        }

        // The entry stub jumps through the import address table slot
        let standard = &self.optional_header.standard_fields;
        writer.ensure_at(at(&text, standard.entry_point.slot(), "entry stub")?)?;
        writer.write_le(0xFFu8);
        writer.write_le(0x25u8);
        writer.write_le(ctxt.image_base.wrapping_add(dirs.iat.address()));

        writer.ensure_at((text.pointer_to_raw_data + text.size_of_raw_data) as usize)?;

        let rsrc = *ctxt.layout(SectionKind::Rsrc)?;
        if dirs.resource_table.slot().is_some() {
            let bytes = dirs
                .resource_table
                .value
                .as_ref()
                .ok_or_else(|| missing("resource blob"))?;
            writer.ensure_at(at(&rsrc, dirs.resource_table.slot(), "resource blob")?)?;
            writer.write_bytes(bytes);
        }
        writer.ensure_at((rsrc.pointer_to_raw_data + rsrc.size_of_raw_data) as usize)?;

        let reloc = *ctxt.layout(SectionKind::Reloc)?;
        let table = dirs
            .base_relocation_table
            .value
            .as_ref()
            .ok_or_else(|| missing("relocation table"))?;
        writer.ensure_at(at(
            &reloc,
            dirs.base_relocation_table.slot(),
            "relocation table",
        )?)?;
        table.write(writer);
        writer.ensure_at((reloc.pointer_to_raw_data + reloc.size_of_raw_data) as usize)?;

        Ok(())
    }
}

/// Builds a [`PeFile`] ready for [`PeFile::write`] from the handful of
/// inputs a managed image actually varies in.
///
/// ```no_run
/// use cilpe::{MetadataRoot, PeFileBuilder};
///
/// let metadata = MetadataRoot::assemble(
///     MetadataRoot::DEFAULT_VERSION,
///     &[("#~", &[0u8; 24]), ("#Strings", &[0u8; 4])],
/// )?;
/// let mut pe = PeFileBuilder::new(metadata, 0x0600_0001).build();
/// let image = pe.write()?;
/// # Ok::<(), cilpe::Error>(())
/// ```
#[derive(Debug)]
pub struct PeFileBuilder {
    metadata: MetadataRoot,
    entry_point_token: u32,
    dll: bool,
    sub_system: SubSystem,
    image_base: u32,
    file_alignment: u32,
    timestamp: u32,
    linker_major: u8,
    runtime_flags: RuntimeFlags,
    resources: Option<Vec<u8>>,
    strong_name_signature: Option<Vec<u8>>,
    native_resources: Option<Vec<u8>>,
}

impl PeFileBuilder {
    /// Start a builder from the assembled metadata blob and the
    /// entry-point metadata token.
    #[must_use]
    pub fn new(metadata: MetadataRoot, entry_point_token: u32) -> PeFileBuilder {
        PeFileBuilder {
            metadata,
            entry_point_token,
            dll: false,
            sub_system: SubSystem::WindowsCui,
            image_base: NtFields::DEFAULT_IMAGE_BASE,
            file_alignment: 0x200,
            timestamp: 0,
            linker_major: 8,
            runtime_flags: RuntimeFlags::IL_ONLY,
            resources: None,
            strong_name_signature: None,
            native_resources: None,
        }
    }

    /// Emit a library instead of an executable: sets the DLL
    /// characteristics bit and imports the library entry stub.
    #[must_use]
    pub fn dll(mut self, dll: bool) -> Self {
        self.dll = dll;
        self
    }

    /// Choose the subsystem (character or graphical).
    #[must_use]
    pub fn sub_system(mut self, sub_system: SubSystem) -> Self {
        self.sub_system = sub_system;
        self
    }

    /// Override the preferred load address.
    #[must_use]
    pub fn image_base(mut self, image_base: u32) -> Self {
        self.image_base = image_base;
        self
    }

    /// Override the file alignment (0x200 or 0x1000).
    #[must_use]
    pub fn file_alignment(mut self, file_alignment: u32) -> Self {
        self.file_alignment = file_alignment;
        self
    }

    /// Set the link timestamp (seconds since the Unix epoch).
    #[must_use]
    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Override the runtime flags.
    #[must_use]
    pub fn runtime_flags(mut self, runtime_flags: RuntimeFlags) -> Self {
        self.runtime_flags = runtime_flags;
        self
    }

    /// Attach a managed resources blob.
    #[must_use]
    pub fn resources(mut self, resources: Vec<u8>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Attach a strong-name signature hash.
    #[must_use]
    pub fn strong_name_signature(mut self, signature: Vec<u8>) -> Self {
        self.strong_name_signature = Some(signature);
        self
    }

    /// Attach a native resource directory blob (goes to `.rsrc`).
    #[must_use]
    pub fn native_resources(mut self, resources: Vec<u8>) -> Self {
        self.native_resources = Some(resources);
        self
    }

    /// Assemble the [`PeFile`].
    #[must_use]
    pub fn build(self) -> PeFile {
        let hint_name = if self.dll {
            HintNameTable::DLL_ENTRY
        } else {
            HintNameTable::EXE_ENTRY
        };
        let lookup = ImportLookupTable {
            hint_name_table: Rva::with_value(HintNameTable {
                name: hint_name.to_string(),
            }),
        };
        let import = ImportTable {
            import_lookup_table: Rva::with_value(lookup.clone()),
            name: Rva::with_value(ImportTable::RUNTIME_HOST.to_string()),
            import_address_table: Rva::with_value(lookup),
        };

        let cli = CliHeader {
            major_runtime_version: CliHeader::DEFAULT_MAJOR_RUNTIME_VERSION,
            minor_runtime_version: CliHeader::DEFAULT_MINOR_RUNTIME_VERSION,
            metadata: SizedRva::with_value(self.metadata),
            flags: self.runtime_flags,
            entry_point_token: self.entry_point_token,
            resources: match self.resources {
                Some(bytes) => SizedRva::with_value(bytes),
                None => SizedRva::null(),
            },
            strong_name_signature: match self.strong_name_signature {
                Some(bytes) => SizedRva::with_value(bytes),
                None => SizedRva::null(),
            },
            vtable_fixups: SizedRva::with_value(VtableFixups::default()),
        };

        let mut flags = CoffFlags::EXECUTABLE_IMAGE | CoffFlags::MACHINE_32BIT;
        if self.dll {
            flags |= CoffFlags::DLL;
        }

        PeFile {
            dos_header: DosHeader::default(),
            coff_header: CoffHeader {
                timestamp: self.timestamp,
                flags,
            },
            optional_header: OptionalHeader {
                standard_fields: StandardFields {
                    linker_major: self.linker_major,
                    code_size: 0,
                    initialized_data_size: 0,
                    entry_point: Rva::null(),
                    base_of_code: Rva::null(),
                    base_of_data: Rva::null(),
                },
                nt_fields: NtFields {
                    image_base: self.image_base,
                    file_alignment: self.file_alignment,
                    image_size: 0,
                    header_size: 0,
                    file_checksum: 0,
                    sub_system: self.sub_system,
                    dll_flags: 0,
                    stack_commit_size: NtFields::DEFAULT_STACK_COMMIT,
                    heap_reserve_size: NtFields::DEFAULT_HEAP_RESERVE,
                    heap_commit_size: NtFields::DEFAULT_HEAP_COMMIT,
                },
                data_directories: DataDirectories {
                    import_table: SizedRva::with_value(import),
                    resource_table: match self.native_resources {
                        Some(bytes) => SizedRva::with_value(bytes),
                        None => SizedRva::null(),
                    },
                    certificate_table: SizedRva::null(),
                    base_relocation_table: SizedRva::null(),
                    debug: SizedRva::null(),
                    iat: Default::default(),
                    cli_header: SizedRva::with_value(cli),
                },
            },
            section_headers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_metadata() -> MetadataRoot {
        MetadataRoot::assemble(
            MetadataRoot::DEFAULT_VERSION,
            &[("#~", &[0u8; 24]), ("#Strings", &[0u8, 0u8, 0u8, 0u8])],
        )
        .unwrap()
    }

    #[test]
    fn build_write_read() {
        let mut pe = PeFileBuilder::new(minimal_metadata(), 0x0600_0001)
            .timestamp(0x5000_0000)
            .build();
        let image = pe.write().unwrap();

        let parsed = PeFile::from_mem(image).unwrap();
        assert_eq!(parsed.entry_point_token(), Some(0x0600_0001));
        assert_eq!(parsed.coff_header.timestamp, 0x5000_0000);
        assert_eq!(parsed.sections().len(), 3);
        assert_eq!(parsed.sections()[0].kind, SectionKind::Text);
        assert_eq!(parsed.sections()[1].kind, SectionKind::Rsrc);
        assert_eq!(parsed.sections()[2].kind, SectionKind::Reloc);
    }

    #[test]
    fn dll_uses_library_entry_stub() {
        let mut pe = PeFileBuilder::new(minimal_metadata(), 0x0600_0002)
            .dll(true)
            .build();
        let image = pe.write().unwrap();

        let parsed = PeFile::from_mem(image).unwrap();
        assert!(parsed.coff_header.is_dll());
        let import = parsed
            .optional_header
            .data_directories
            .import_table
            .value
            .as_ref()
            .unwrap();
        let hint = import
            .import_lookup_table
            .value
            .as_ref()
            .unwrap()
            .hint_name_table
            .value
            .as_ref()
            .unwrap();
        assert_eq!(hint.name, HintNameTable::DLL_ENTRY);
    }

    #[test]
    fn image_size_reflects_final_layout() {
        let mut pe = PeFileBuilder::new(minimal_metadata(), 0x0600_0001).build();
        let image = pe.write().unwrap();
        let parsed = PeFile::from_mem(image).unwrap();

        let extent = parsed
            .sections()
            .iter()
            .map(|s| s.virtual_address + s.virtual_size)
            .max()
            .unwrap();
        let expected = extent.div_ceil(context::SECTION_ALIGNMENT) * context::SECTION_ALIGNMENT;
        assert_eq!(parsed.optional_header.nt_fields.image_size, expected);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            PeFile::from_mem(Vec::new()),
            Err(crate::Error::Empty)
        ));
    }

    #[test]
    fn stream_headers_published_on_context() {
        let mut pe = PeFileBuilder::new(minimal_metadata(), 0x0600_0001).build();
        let image = pe.write().unwrap();

        let mut ctxt = ReaderContext::new(&image);
        let parsed = PeFile::read(&mut ctxt).unwrap();
        let streams = ctxt.streams.as_ref().unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].name, "#~");
        assert_eq!(streams[1].name, "#Strings");
        assert_eq!(parsed.metadata().unwrap().stream_headers.len(), 2);
    }
}
