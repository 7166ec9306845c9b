//! End-to-end scenarios over synthesized images: build, parse, re-emit,
//! mutate.

use cilpe::{
    pe::cli::RuntimeFlags,
    pe::headers::SubSystem,
    MetadataRoot, PeFile, PeFileBuilder, SectionKind,
};

fn minimal_metadata() -> MetadataRoot {
    let tables = [0u8; 24];
    let strings = [0u8, b'M', b'a', b'i', b'n', 0u8, 0u8, 0u8];
    MetadataRoot::assemble(
        MetadataRoot::DEFAULT_VERSION,
        &[("#~", &tables), ("#Strings", &strings)],
    )
    .unwrap()
}

fn minimal_image() -> Vec<u8> {
    PeFileBuilder::new(minimal_metadata(), 0x0600_0001)
        .sub_system(SubSystem::WindowsCui)
        .timestamp(0x4F8B_2C00)
        .build()
        .write()
        .unwrap()
}

#[test]
fn minimal_image_parses() {
    let image = minimal_image();
    let pe = PeFile::from_mem(image).unwrap();

    // The entry-point token surfaces from the CLI header
    assert_eq!(pe.entry_point_token(), Some(0x0600_0001));
    assert_eq!(
        pe.cli_header().unwrap().entry_point_token,
        pe.entry_point_token().unwrap()
    );

    // Exactly three sections, named in document order
    let kinds: Vec<SectionKind> = pe.sections().iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        [SectionKind::Text, SectionKind::Rsrc, SectionKind::Reloc]
    );

    // The entry stub is the six-byte indirect jump
    let stub = pe
        .optional_header
        .standard_fields
        .entry_point
        .value
        .as_ref()
        .unwrap();
    assert_eq!(stub.len(), 6);
    assert_eq!(&stub[0..2], &[0xFF, 0x25]);

    // ... and its operand is the absolute address of the IAT slot
    let operand = u32::from_le_bytes([stub[2], stub[3], stub[4], stub[5]]);
    let iat = pe.optional_header.data_directories.iat;
    assert_eq!(
        operand,
        pe.optional_header.nt_fields.image_base + iat.address()
    );
}

#[test]
fn write_read_write_is_byte_exact() {
    let image = minimal_image();
    let mut reparsed = PeFile::from_mem(image.clone()).unwrap();
    let rewritten = reparsed.write().unwrap();
    assert_eq!(image, rewritten);
}

#[test]
fn write_read_write_with_all_blobs_is_byte_exact() {
    let image = PeFileBuilder::new(minimal_metadata(), 0x0600_0010)
        .dll(true)
        .sub_system(SubSystem::WindowsGui)
        .timestamp(0x6000_0000)
        .runtime_flags(RuntimeFlags::IL_ONLY | RuntimeFlags::STRONG_NAME_SIGNED)
        .resources(vec![0xAA; 33])
        .strong_name_signature(vec![0xBB; 128])
        .native_resources(vec![0xCC; 70])
        .build()
        .write()
        .unwrap();

    let mut reparsed = PeFile::from_mem(image.clone()).unwrap();
    let rewritten = reparsed.write().unwrap();
    assert_eq!(image, rewritten);
}

#[test]
fn blobs_survive_a_round_trip() {
    let image = PeFileBuilder::new(minimal_metadata(), 0x0600_0010)
        .resources(vec![0xAA; 33])
        .strong_name_signature(vec![0xBB; 128])
        .native_resources(vec![0xCC; 70])
        .build()
        .write()
        .unwrap();

    let pe = PeFile::from_mem(image).unwrap();
    let cli = pe.cli_header().unwrap();
    assert_eq!(cli.resources.value.as_deref(), Some(&[0xAA; 33][..]));
    assert_eq!(
        cli.strong_name_signature.value.as_deref(),
        Some(&[0xBB; 128][..])
    );
    assert_eq!(
        pe.optional_header
            .data_directories
            .resource_table
            .value
            .as_deref(),
        Some(&[0xCC; 70][..])
    );
}

#[test]
fn resolved_addresses_stay_inside_their_sections() {
    let image = minimal_image();
    let pe = PeFile::from_mem(image).unwrap();

    let contains = |rva: u32, size: u32| {
        pe.sections().iter().any(|s| {
            rva >= s.virtual_address
                && rva - s.virtual_address < s.virtual_size
                && rva - s.virtual_address + size <= s.size_of_raw_data
        })
    };

    let dirs = &pe.optional_header.data_directories;
    assert!(contains(dirs.import_table.address(), dirs.import_table.size));
    assert!(contains(dirs.cli_header.address(), dirs.cli_header.size));
    assert!(contains(
        dirs.base_relocation_table.address(),
        dirs.base_relocation_table.size
    ));
    assert!(contains(dirs.iat.address(), dirs.iat.size()));

    let cli = pe.cli_header().unwrap();
    assert!(contains(cli.metadata.address(), cli.metadata.size));
    assert!(contains(
        pe.optional_header.standard_fields.entry_point.address(),
        6
    ));
}

#[test]
fn image_size_matches_rounded_virtual_extent() {
    let image = minimal_image();
    let pe = PeFile::from_mem(image).unwrap();

    let extent = pe
        .sections()
        .iter()
        .map(|s| s.virtual_address + s.virtual_size)
        .max()
        .unwrap();
    assert_eq!(
        pe.optional_header.nt_fields.image_size,
        extent.div_ceil(0x2000) * 0x2000
    );
    assert_eq!(pe.optional_header.nt_fields.image_size % 0x2000, 0);
}

#[test]
fn relocation_block_covers_the_entry_stub() {
    let image = minimal_image();
    let pe = PeFile::from_mem(image).unwrap();

    let table = pe
        .optional_header
        .data_directories
        .base_relocation_table
        .value
        .as_ref()
        .unwrap();
    assert_eq!(table.blocks.len(), 1);

    let block = &table.blocks[0];
    assert_eq!(block.page & 0xFFF, 0);
    // Block length (entries * 2 + 8) is a multiple of 4 by construction
    assert_eq!((block.entries.len() * 2 + 8) % 4, 0);

    let operand_rva = pe.optional_header.standard_fields.entry_point.address() + 2;
    let patched = block
        .entries
        .iter()
        .any(|e| block.page + u32::from(e.offset) == operand_rva);
    assert!(patched, "no fixup entry covers the entry stub operand");
}

#[test]
fn mutated_machine_type_names_the_field() {
    let mut image = minimal_image();
    // COFF machine immediately follows the PE signature at LfaNew = 128
    image[132] = 0x64;
    image[133] = 0x86;

    let err = PeFile::from_mem(image).unwrap_err();
    assert!(err.to_string().contains("CoffHeader.Machine"));
}

#[test]
fn mutated_optional_magic_names_the_field() {
    let mut image = minimal_image();
    // Optional header starts after the 24-byte COFF header
    image[152] = 0x0B;
    image[153] = 0x02; // PE32+ magic

    let err = PeFile::from_mem(image).unwrap_err();
    assert!(err.to_string().contains("StandardFields.Magic"));
}

#[test]
fn mutated_reserved_directory_slot_names_the_field() {
    let mut image = minimal_image();
    // The export-table slot opens the data directories at 152 + 28 + 68
    image[248] = 0x01;

    let err = PeFile::from_mem(image).unwrap_err();
    assert!(err.to_string().contains("DataDirectories.ExportTable"));
}

#[test]
fn mutated_hint_name_is_rejected_not_defaulted() {
    let mut image = minimal_image();

    let needle = b"_CorExeMain";
    let position = image
        .windows(needle.len())
        .position(|window| window == needle)
        .expect("entry stub name not found in image");
    image[position..position + needle.len()].copy_from_slice(b"_CorFooMain");

    let err = PeFile::from_mem(image).unwrap_err();
    assert!(err.to_string().contains("HintNameTable.Name"));
}

#[test]
fn mutated_section_name_is_rejected() {
    let mut image = minimal_image();

    let needle = b".rsrc\0\0\0";
    let position = image
        .windows(needle.len())
        .position(|window| window == needle)
        .expect("section name not found in image");
    image[position..position + 5].copy_from_slice(b".data");

    let err = PeFile::from_mem(image).unwrap_err();
    assert!(err.to_string().contains("SectionHeader.Name"));
}

#[test]
fn truncated_image_is_rejected() {
    let image = minimal_image();
    let err = PeFile::from_mem(image[..100].to_vec()).unwrap_err();
    assert!(err.to_string().contains("missing DosHeader"));
}

#[test]
fn trace_is_observational() {
    let image = minimal_image();

    let mut traced = cilpe::ReaderContext::with_trace(&image);
    let with_trace = PeFile::read(&mut traced).unwrap();
    let mut quiet = cilpe::ReaderContext::new(&image);
    let without_trace = PeFile::read(&mut quiet).unwrap();

    // Tracing collected something, and changed nothing
    assert!(!traced.trace.as_ref().unwrap().lines().is_empty());
    assert_eq!(
        with_trace.entry_point_token(),
        without_trace.entry_point_token()
    );
    assert_eq!(
        with_trace.optional_header.nt_fields.image_size,
        without_trace.optional_header.nt_fields.image_size
    );
}
