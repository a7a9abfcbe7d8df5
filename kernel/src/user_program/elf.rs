//! Parsing of the executable image's metadata.
//!
//! The pager never holds a whole image in memory: it reads the ELF header
//! and the program-header table with byte-range reads and resolves each
//! fault against the segment descriptors, which carry file offsets rather
//! than borrowed slices of image data.

use nom::bytes::complete::{tag, take};
use nom::combinator::{map, map_opt};
use nom::error::Error;
use nom::number::complete::{u16, u32, u8};
use nom::number::Endianness;
use nom::IResult;

use alloc::vec::Vec;

/// Size of the ELF header for the 32-bit class.
pub const ELF_HEADER_SIZE: usize = 52;
/// Size of one program header for the 32-bit class.
pub const PROGRAM_HEADER_SIZE: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfEndianness {
    Little,
    Big,
}

impl ElfEndianness {
    pub(crate) fn to_nom(self) -> Endianness {
        match self {
            ElfEndianness::Little => Endianness::Little,
            ElfEndianness::Big => Endianness::Big,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfUsage {
    Relocatable,
    Executable,
    Shared,
    Core,
}

// Strictly 32-bit ELFs.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub endianness: ElfEndianness,
    pub usage: ElfUsage,
    pub machine: u16,
    pub program_entry: u32,
    pub program_headers_offset: u32,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ElfHeader> {
        let (bytes, _) = tag([0x7F, b'E', b'L', b'F'])(bytes)?;

        // Elf Bit Width, we don't parse 64-bit ELF binaries.
        let (bytes, _) = tag([1u8])(bytes)?;

        let (bytes, endianness) = map_opt(u8, |value| match value {
            1 => Some(ElfEndianness::Little),
            2 => Some(ElfEndianness::Big),
            _ => None,
        })(bytes)?;

        let endian = endianness.to_nom();

        let (bytes, _header_version) = u8(bytes)?;
        let (bytes, _abi) = u8(bytes)?;

        let (bytes, _) = take(8usize)(bytes)?;

        let (bytes, usage) = map_opt(u16(endian), |value| match value {
            1 => Some(ElfUsage::Relocatable),
            2 => Some(ElfUsage::Executable),
            3 => Some(ElfUsage::Shared),
            4 => Some(ElfUsage::Core),
            _ => None,
        })(bytes)?;

        let (bytes, machine) = u16(endian)(bytes)?;
        let (bytes, _elf_version) = u32(endian)(bytes)?;
        let (bytes, program_entry) = u32(endian)(bytes)?;
        let (bytes, program_headers_offset) = u32(endian)(bytes)?;
        let (bytes, _section_headers_offset) = u32(endian)(bytes)?;

        let (bytes, _flags) = u32(endian)(bytes)?;

        let (bytes, _elf_header_size) = u16(endian)(bytes)?;
        let (bytes, program_header_entry_size) = u16(endian)(bytes)?;
        let (bytes, program_header_count) = u16(endian)(bytes)?;
        let (bytes, _section_header_entry_size) = u16(endian)(bytes)?;
        let (bytes, _section_header_count) = u16(endian)(bytes)?;
        let (bytes, _section_header_index) = u16(endian)(bytes)?;

        Ok((
            bytes,
            ElfHeader {
                endianness,
                usage,
                machine,
                program_entry,
                program_headers_offset,
                program_header_entry_size,
                program_header_count,
            },
        ))
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<ElfHeader, nom::Err<Error<&[u8]>>> {
        Ok(Self::parse(bytes)?.1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Ignore,
    Load,
    Dynamic,
    Interpret,
    Note,
    OsSpecific(u32),
    Other(u32),
}

/// One loadable-region descriptor out of the program-header table.
#[derive(Copy, Clone, Debug)]
pub struct ElfProgramHeader {
    pub program_type: ElfProgramType,
    /// Byte offset of the segment's contents within the image.
    pub file_offset: u32,
    pub virtual_address: u32,
    /// Bytes present in the image; the tail up to `memory_size` is
    /// zero-initialized memory.
    pub file_size: u32,
    pub memory_size: u32,
    pub executable: bool,
    pub writable: bool,
    pub readable: bool,
}

impl ElfProgramHeader {
    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (bytes, program_type) = map(u32(endian), |value| match value {
            0 => ElfProgramType::Ignore,
            1 => ElfProgramType::Load,
            2 => ElfProgramType::Dynamic,
            3 => ElfProgramType::Interpret,
            4 => ElfProgramType::Note,
            0x6000_0000.. => ElfProgramType::OsSpecific(value),
            other => ElfProgramType::Other(other),
        })(bytes)?;

        let (bytes, file_offset) = u32(endian)(bytes)?;
        let (bytes, virtual_address) = u32(endian)(bytes)?;
        let (bytes, _physical_address) = u32(endian)(bytes)?;
        let (bytes, file_size) = u32(endian)(bytes)?;
        let (bytes, memory_size) = u32(endian)(bytes)?;
        let (bytes, flags) = u32(endian)(bytes)?;
        let (bytes, _alignment) = u32(endian)(bytes)?;

        let executable = flags & 1 != 0;
        let writable = flags & 2 != 0;
        let readable = flags & 4 != 0;

        Ok((
            bytes,
            ElfProgramHeader {
                program_type,
                file_offset,
                virtual_address,
                file_size,
                memory_size,
                executable,
                writable,
                readable,
            },
        ))
    }

    /// Parse `count` descriptors out of a program-header table read from
    /// the image, stepping by the header-declared entry size.
    pub fn parse_table(
        table: &[u8],
        endianness: ElfEndianness,
        count: usize,
        entry_size: usize,
    ) -> Result<Vec<Self>, nom::Err<Error<&[u8]>>> {
        let endian = endianness.to_nom();
        let mut headers = Vec::with_capacity(count);
        let mut rest = table;

        for _ in 0..count {
            let (_, header) = Self::parse(rest, endian)?;
            headers.push(header);
            (rest, _) = take(entry_size)(rest)?;
        }

        Ok(headers)
    }
}
