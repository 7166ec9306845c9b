// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! # cilpe
//!
//! A strict, bit-exact reader and writer for managed (.NET/CLI) PE/COFF
//! executable images.
//!
//! `cilpe` loads a managed PE image into a fully owned, structured form:
//! DOS stub, COFF file header, PE optional header, section table, import
//! table, base-relocation table, CLI header and metadata stream directory,
//! validating every field against the published binary format as it
//! goes, and re-emits an equivalent image through a three-pass
//! allocate/fixup/write pipeline.
//!
//! ## Reading
//!
//! ```rust,no_run
//! use cilpe::PeFile;
//! use std::path::Path;
//!
//! let pe = PeFile::from_file(Path::new("Example.exe"))?;
//! println!("entry point token: {:?}", pe.entry_point_token());
//! for section in pe.sections() {
//!     println!("{} at RVA 0x{:x}", section.kind, section.virtual_address);
//! }
//! # Ok::<(), cilpe::Error>(())
//! ```
//!
//! ## Writing
//!
//! ```rust,no_run
//! use cilpe::{MetadataRoot, PeFileBuilder};
//!
//! let metadata = MetadataRoot::assemble(
//!     MetadataRoot::DEFAULT_VERSION,
//!     &[("#~", &[0u8; 24]), ("#Strings", &[0u8; 4])],
//! )?;
//! let mut pe = PeFileBuilder::new(metadata, 0x0600_0001).build();
//! let image = pe.write()?;
//! # Ok::<(), cilpe::Error>(())
//! ```
//!
//! ## Validation model
//!
//! Any structural deviation from the expected layout is a hard failure
//! ([`Error::Malformed`]) carrying the offending field path; a failed read
//! never yields a partial [`PeFile`]. The only tolerated deviations are
//! the named entries of [`pe::variations::SPEC_VARIATIONS`].
//!
//! The metadata *tables* behind the stream directory are out of scope:
//! the crate resolves the stream-header list and keeps the raw metadata
//! blob for the downstream decoder.
//!
//! # References
//!
//! - Microsoft PE/COFF Specification
//! - ECMA-335 6th Edition, Partition II - PE File Format

#[macro_use]
pub(crate) mod error;
pub mod file;
pub mod pe;

pub use error::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

pub use file::parser::Parser;
pub use file::writer::Writer;
pub use pe::address::{AliasedSizedRva, FileOffset, Rva, SizedRva};
pub use pe::context::{ReaderContext, Trace, WriterContext};
pub use pe::metadata::{MetadataRoot, StreamHeader};
pub use pe::sections::{SectionHeader, SectionKind};
pub use pe::{PeFile, PeFileBuilder};

/// Convenient re-exports of the most commonly used types.
pub mod prelude {
    pub use crate::{
        Error, MetadataRoot, Parser, PeFile, PeFileBuilder, ReaderContext, Result,
        SectionHeader, SectionKind, StreamHeader,
    };
    pub use crate::pe::cli::{CliHeader, RuntimeFlags};
    pub use crate::pe::headers::{CoffHeader, DosHeader, OptionalHeader, SubSystem};
}
