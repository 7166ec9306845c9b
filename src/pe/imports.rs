//! The import bootstrap chain.
//!
//! A managed image imports exactly one symbol from the runtime host
//! library: the CLI entry stub the OS loader jumps through. The chain is
//! import directory record → lookup/address tables → hint-name record,
//! where the lookup table and the address table alias the *same*
//! hint-name record, and the address table is additionally duplicated in
//! the optional header's IAT directory slot.

use crate::{
    file::{parser::Parser, writer::Writer},
    pe::{
        address::Rva,
        context::{ReaderContext, WriterContext},
        sections::SectionKind,
    },
    Result,
};

/// The hint-name record both lookup tables point at.
#[derive(Debug, Clone)]
pub struct HintNameTable {
    /// Imported symbol name; one of the two CLI entry stubs.
    pub name: String,
}

impl HintNameTable {
    /// Entry stub for executables.
    pub const EXE_ENTRY: &'static str = "_CorExeMain";
    /// Entry stub for libraries.
    pub const DLL_ENTRY: &'static str = "_CorDllMain";

    const HINT: u16 = 0;

    /// Parse and validate the hint-name record.
    pub fn read(parser: &mut Parser) -> Result<HintNameTable> {
        let actual_hint = parser.read_le::<u16>()?;
        if actual_hint != Self::HINT {
            return Err(malformed_error!("invalid HintNameTable.Hint"));
        }

        let name = parser.read_string_ascii()?;
        if name != Self::EXE_ENTRY && name != Self::DLL_ENTRY {
            return Err(malformed_error!("invalid HintNameTable.Name - '{}'", name));
        }

        Ok(HintNameTable { name })
    }

    /// Encoded size: hint word, name, terminator.
    pub(crate) fn encoded_len(&self) -> u32 {
        2 + self.name.len() as u32 + 1
    }

    /// Serialize the hint-name record.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(Self::HINT);
        writer.write_string_ascii(&self.name);
    }
}

/// One entry of the import lookup (or address) table, followed by its
/// zero terminator.
#[derive(Debug, Clone)]
pub struct ImportLookupTable {
    /// The hint-name record this entry points at. The high bit (ordinal
    /// import) must be clear.
    pub hint_name_table: Rva<HintNameTable>,
}

impl ImportLookupTable {
    /// Encoded size: one entry plus the zero terminator.
    pub const SIZE: u32 = 8;

    /// Parse and validate one lookup/address table.
    pub fn read(_ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<ImportLookupTable> {
        let hint_name_table = Rva::read(parser)?;
        if hint_name_table.address() >> 31 != 0 {
            return Err(malformed_error!(
                "invalid ImportLookupTable.HintNameTable - ordinal import"
            ));
        }
        let actual_padding = parser.read_le::<u32>()?;
        if actual_padding != 0 {
            return Err(malformed_error!("invalid ImportLookupTable.Padding"));
        }

        Ok(ImportLookupTable { hint_name_table })
    }

    /// Resolve the hint-name record.
    pub fn deref(&mut self, ctxt: &mut ReaderContext) -> Result<()> {
        let mut reader = self
            .hint_name_table
            .reader_non_null(ctxt, "ImportLookupTable.HintNameTable")?;
        self.hint_name_table.value = Some(HintNameTable::read(&mut reader)?);
        Ok(())
    }

    /// Serialize the entry and its terminator.
    pub fn write(&self, writer: &mut Writer) {
        self.hint_name_table.write(writer);
        writer.write_le(0u32);
    }
}

/// The import directory record.
#[derive(Debug, Clone)]
pub struct ImportTable {
    /// The import lookup table.
    pub import_lookup_table: Rva<ImportLookupTable>,
    /// The imported module name; must be the runtime host library.
    pub name: Rva<String>,
    /// The import address table; aliased by the optional header's IAT
    /// directory slot.
    pub import_address_table: Rva<ImportLookupTable>,
}

impl ImportTable {
    /// Encoded size of the directory record, including the all-zero
    /// terminator record.
    pub const SIZE: u32 = 40;

    /// The only module a managed image imports, matched
    /// case-insensitively.
    pub const RUNTIME_HOST: &'static str = "mscoree.dll";

    const PADDING: usize = 20;

    /// Parse and validate the import directory record.
    pub fn read(_ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<ImportTable> {
        let import_lookup_table = Rva::read(parser)?;
        let actual_date_time_stamp = parser.read_le::<u32>()?;
        if actual_date_time_stamp != 0 {
            return Err(malformed_error!("invalid ImportTable.DateTimeStamp"));
        }
        let actual_forwarder_chain = parser.read_le::<u32>()?;
        if actual_forwarder_chain != 0 {
            return Err(malformed_error!("invalid ImportTable.ForwarderChain"));
        }
        let name = Rva::read(parser)?;
        let import_address_table = Rva::read(parser)?;
        parser.skip(Self::PADDING)?;

        Ok(ImportTable {
            import_lookup_table,
            name,
            import_address_table,
        })
    }

    /// Resolve the lookup/address tables and the module name, then
    /// recursively resolve the hint-name records.
    pub fn deref(&mut self, ctxt: &mut ReaderContext) -> Result<()> {
        let mut reader = self
            .import_lookup_table
            .reader_non_null(ctxt, "ImportTable.ImportLookupTable")?;
        let table = ImportLookupTable::read(ctxt, &mut reader)?;
        self.import_lookup_table.value = Some(table);

        let mut reader = self.name.reader_non_null(ctxt, "ImportTable.Name")?;
        let name = reader.read_string_ascii()?;
        if !name.eq_ignore_ascii_case(Self::RUNTIME_HOST) {
            return Err(malformed_error!("invalid ImportTable.Name - '{}'", name));
        }
        self.name.value = Some(name);

        let mut reader = self
            .import_address_table
            .reader_non_null(ctxt, "ImportTable.ImportAddressTable")?;
        let table = ImportLookupTable::read(ctxt, &mut reader)?;
        self.import_address_table.value = Some(table);

        if let Some(table) = self.import_lookup_table.value.as_mut() {
            table.deref(ctxt)?;
        }
        if let Some(table) = self.import_address_table.value.as_mut() {
            table.deref(ctxt)?;
        }

        ctxt.trace_line(|| format!("ImportTable.Name: {:#010x}", self.name.address()));

        Ok(())
    }

    /// Reserve the import machinery at the base of the code section:
    /// address table first (so the IAT directory points at the section
    /// start), then the lookup table, the shared hint-name record and the
    /// module name string.
    pub fn alloc(&mut self, ctxt: &mut WriterContext) -> Result<()> {
        self.import_address_table
            .alloc(ctxt, SectionKind::Text, ImportLookupTable::SIZE)?;
        self.import_lookup_table
            .alloc(ctxt, SectionKind::Text, ImportLookupTable::SIZE)?;

        let Some(lookup) = self.import_lookup_table.value.as_mut() else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "import lookup table is not populated".to_string(),
            });
        };
        let Some(hint) = lookup.hint_name_table.value.as_ref() else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "hint-name table is not populated".to_string(),
            });
        };
        let hint_len = hint.encoded_len();
        lookup
            .hint_name_table
            .alloc(ctxt, SectionKind::Text, hint_len)?;

        // Both tables alias the single hint-name record
        let shared = lookup.hint_name_table.clone();
        let Some(address_table) = self.import_address_table.value.as_mut() else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "import address table is not populated".to_string(),
            });
        };
        address_table.hint_name_table.share_slot(&shared);
        address_table.hint_name_table.value = shared.value;

        let Some(name) = self.name.value.as_ref() else {
            return Err(crate::Error::WriteLayoutFailed {
                message: "import module name is not populated".to_string(),
            });
        };
        let name_len = name.len() as u32 + 1;
        self.name.alloc(ctxt, SectionKind::Text, name_len)?;

        Ok(())
    }

    /// Finalize every address in the chain.
    pub fn fixup(&mut self, ctxt: &WriterContext) -> Result<()> {
        self.import_address_table.fixup(ctxt)?;
        self.import_lookup_table.fixup(ctxt)?;
        if let Some(table) = self.import_lookup_table.value.as_mut() {
            table.hint_name_table.fixup(ctxt)?;
        }
        if let Some(table) = self.import_address_table.value.as_mut() {
            table.hint_name_table.fixup(ctxt)?;
        }
        self.name.fixup(ctxt)?;
        Ok(())
    }

    /// Serialize the directory record and its terminator.
    pub fn write(&self, writer: &mut Writer) {
        self.import_lookup_table.write(writer);
        writer.write_le(0u32); // date/time stamp
        writer.write_le(0u32); // forwarder chain
        self.name.write(writer);
        self.import_address_table.write(writer);
        writer.pad(Self::PADDING);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted_hint_name() {
        #[rustfmt::skip]
        let bytes = [
            0x00, 0x00,
            b'_', b'C', b'o', b'r', b'E', b'x', b'e', b'M', b'a', b'i', b'n', 0x00,
        ];

        let table = HintNameTable::read(&mut Parser::new(&bytes)).unwrap();
        assert_eq!(table.name, HintNameTable::EXE_ENTRY);
        assert_eq!(table.encoded_len(), 14);
    }

    #[test]
    fn crafted_hint_name_invalid() {
        #[rustfmt::skip]
        let bytes = [
            0x00, 0x00,
            b'_', b'C', b'o', b'r', b'F', b'o', b'o', b'M', b'a', b'i', b'n', 0x00,
        ];

        let err = HintNameTable::read(&mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("HintNameTable.Name"));
    }

    #[test]
    fn crafted_hint_name_nonzero_hint() {
        let bytes = [0x01, 0x00, b'_', 0x00];
        let err = HintNameTable::read(&mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("HintNameTable.Hint"));
    }

    #[test]
    fn crafted_lookup_table() {
        #[rustfmt::skip]
        let bytes = [
            0x30, 0x20, 0x00, 0x00, // hint-name RVA
            0x00, 0x00, 0x00, 0x00, // terminator
        ];

        let mut ctxt = ReaderContext::new(&[]);
        let table = ImportLookupTable::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap();
        assert_eq!(table.hint_name_table.address(), 0x2030);
    }

    #[test]
    fn crafted_lookup_table_ordinal() {
        // High bit set means import-by-ordinal, which the format forbids
        #[rustfmt::skip]
        let bytes = [
            0x01, 0x00, 0x00, 0x80,
            0x00, 0x00, 0x00, 0x00,
        ];

        let mut ctxt = ReaderContext::new(&[]);
        let err = ImportLookupTable::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("ImportLookupTable.HintNameTable"));
    }

    #[test]
    fn crafted_lookup_table_unterminated() {
        #[rustfmt::skip]
        let bytes = [
            0x30, 0x20, 0x00, 0x00,
            0x44, 0x00, 0x00, 0x00,
        ];

        let mut ctxt = ReaderContext::new(&[]);
        let err = ImportLookupTable::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("ImportLookupTable.Padding"));
    }

    #[test]
    fn crafted_import_record() {
        #[rustfmt::skip]
        let bytes = [
            0x08, 0x20, 0x00, 0x00, // lookup table RVA
            0x00, 0x00, 0x00, 0x00, // date/time stamp
            0x00, 0x00, 0x00, 0x00, // forwarder chain
            0x1E, 0x20, 0x00, 0x00, // name RVA
            0x00, 0x20, 0x00, 0x00, // address table RVA
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let mut ctxt = ReaderContext::new(&[]);
        let mut parser = Parser::new(&bytes);
        let table = ImportTable::read(&mut ctxt, &mut parser).unwrap();
        assert_eq!(table.import_lookup_table.address(), 0x2008);
        assert_eq!(table.name.address(), 0x201E);
        assert_eq!(table.import_address_table.address(), 0x2000);
        assert!(parser.at_end());
    }

    #[test]
    fn crafted_import_record_stamped() {
        #[rustfmt::skip]
        let bytes = [
            0x08, 0x20, 0x00, 0x00,
            0x60, 0x52, 0x00, 0x00, // bound imports carry a timestamp
            0x00, 0x00, 0x00, 0x00,
            0x1E, 0x20, 0x00, 0x00,
            0x00, 0x20, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let mut ctxt = ReaderContext::new(&[]);
        let err = ImportTable::read(&mut ctxt, &mut Parser::new(&bytes)).unwrap_err();
        assert!(err.to_string().contains("ImportTable.DateTimeStamp"));
    }

    #[test]
    fn record_write_is_forty_bytes() {
        let table = ImportTable {
            import_lookup_table: Rva::null(),
            name: Rva::null(),
            import_address_table: Rva::null(),
        };
        let mut writer = Writer::new();
        table.write(&mut writer);
        assert_eq!(writer.offset(), ImportTable::SIZE as usize);
    }
}
