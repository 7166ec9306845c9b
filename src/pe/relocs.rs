//! The base-relocation table.
//!
//! Page-granular patch records applied by the OS loader when the image
//! cannot load at its preferred base. Blocks are self-describing (an
//! embedded byte length determines the entry count), so the table is
//! discovered by a two-pass scan: a first pass walks the blob using only
//! the block-length fields to count blocks, then a second pass re-reads
//! from the start and parses each block fully. The owning directory entry
//! gives the table's total length, never its block count.

use strum::FromRepr;

use crate::{
    file::{parser::Parser, writer::Writer},
    pe::context::ReaderContext,
    Result,
};

/// The 4-bit relocation kinds a 32-bit managed image can carry.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocationKind {
    /// No-op entry used to pad blocks to a 4-byte multiple.
    Absolute = 0,
    /// Patch the high 16 bits of a 32-bit address.
    High = 1,
    /// Patch the low 16 bits of a 32-bit address.
    Low = 2,
    /// Patch a full 32-bit address.
    HighLow = 3,
    /// Patch the high 16 bits, adjusted for sign extension of the low
    /// half.
    HighAdj = 4,
}

/// One fixup entry: a 4-bit kind and a 12-bit offset within the block's
/// page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupEntry {
    /// What kind of patch to apply.
    pub kind: RelocationKind,
    /// Offset of the patch site within the page.
    pub offset: u16,
}

impl FixupEntry {
    /// Encoded size of one entry.
    pub const SIZE: u32 = 2;

    /// Parse one entry.
    pub fn read(parser: &mut Parser) -> Result<FixupEntry> {
        let word = parser.read_le::<u16>()?;
        let Some(kind) = RelocationKind::from_repr((word >> 12) as u8) else {
            return Err(malformed_error!(
                "invalid FixupEntry.Type - {:#x}",
                word >> 12
            ));
        };

        Ok(FixupEntry {
            kind,
            offset: word & 0xFFF,
        })
    }

    /// Serialize one entry.
    pub fn write(&self, writer: &mut Writer) {
        let word = ((self.kind as u16) << 12) | self.offset;
        writer.write_le(word);
    }
}

/// One relocation block: a 4 KiB-aligned page address and the entries
/// patching that page.
#[derive(Debug, Clone)]
pub struct FixupBlock {
    /// Virtual address of the patched page, relative to the image base.
    pub page: u32,
    /// The patch entries.
    pub entries: Vec<FixupEntry>,
}

impl FixupBlock {
    const HEADER_SIZE: u32 = 8;

    /// First-pass scan: step over one block using only its length field,
    /// validating the block's framing.
    pub fn skip(parser: &mut Parser) -> Result<()> {
        parser.skip(4)?;
        let block_size = parser.read_le::<u32>()?;
        if block_size < Self::HEADER_SIZE
            || (block_size - Self::HEADER_SIZE) % FixupEntry::SIZE != 0
        {
            return Err(malformed_error!(
                "invalid FixupBlock.BlockSize - {}",
                block_size
            ));
        }
        parser.skip((block_size - Self::HEADER_SIZE) as usize)?;
        Ok(())
    }

    /// Parse one block fully. The cursor is 4-aligned on completion.
    pub fn read(_ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<FixupBlock> {
        let page = parser.read_le::<u32>()?;
        if page & 0xFFF != 0 {
            return Err(malformed_error!("invalid FixupBlock.Page - {:#x}", page));
        }
        let block_size = parser.read_le::<u32>()?;
        let entry_count = (block_size - Self::HEADER_SIZE) / FixupEntry::SIZE;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            entries.push(FixupEntry::read(parser)?);
        }
        parser.align(4)?;

        Ok(FixupBlock { page, entries })
    }

    /// Encoded size of the block, including the trailing alignment.
    pub(crate) fn encoded_len(&self) -> u32 {
        let raw = Self::HEADER_SIZE + self.entries.len() as u32 * FixupEntry::SIZE;
        raw.div_ceil(4) * 4
    }

    /// Serialize the block; the writer is 4-aligned on completion.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.page);
        let block_size = Self::HEADER_SIZE + self.entries.len() as u32 * FixupEntry::SIZE;
        writer.write_le(block_size);
        for entry in &self.entries {
            entry.write(writer);
        }
        writer.align(4);
    }
}

/// The whole base-relocation table.
#[derive(Debug, Clone, Default)]
pub struct RelocationTable {
    /// The blocks, in file order.
    pub blocks: Vec<FixupBlock>,
}

impl RelocationTable {
    /// Reserved length of the table the write pipeline derives: one block
    /// holding one address patch and its alignment pad entry.
    pub(crate) const DERIVED_TABLE_LEN: u32 = 12;

    /// Parse the table with the two-pass scan over the directory-sized
    /// blob.
    pub fn read(ctxt: &mut ReaderContext, parser: &mut Parser) -> Result<RelocationTable> {
        let init_offset = parser.pos();
        let mut count = 0;
        while !parser.at_end() {
            FixupBlock::skip(parser)?;
            count += 1;
        }

        parser.seek(init_offset)?;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(FixupBlock::read(ctxt, parser)?);
        }

        Ok(RelocationTable { blocks })
    }

    /// Encoded size of the whole table.
    pub(crate) fn encoded_len(&self) -> u32 {
        self.blocks.iter().map(FixupBlock::encoded_len).sum()
    }

    /// Serialize every block.
    pub fn write(&self, writer: &mut Writer) {
        for block in &self.blocks {
            block.write(writer);
        }
    }

    /// The table the write pipeline emits: a single block patching the
    /// 32-bit operand of the entry stub at `operand_rva`, padded to a
    /// 4-byte multiple with an absolute entry.
    pub(crate) fn for_entry_stub(operand_rva: u32) -> RelocationTable {
        RelocationTable {
            blocks: vec![FixupBlock {
                page: operand_rva & !0xFFF,
                entries: vec![
                    FixupEntry {
                        kind: RelocationKind::HighLow,
                        offset: (operand_rva & 0xFFF) as u16,
                    },
                    FixupEntry {
                        kind: RelocationKind::Absolute,
                        offset: 0,
                    },
                ],
            }],
        }
    }
}
