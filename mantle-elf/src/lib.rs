// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ELF32 image loading.
//!
//! Walks the allocatable section headers of a little-endian ELF32 image,
//! asking a caller-supplied allocator for destination memory per section,
//! then copying (or zero-filling) the section contents. The allocator
//! callback is where the domain spawner maps frames into both the parent
//! and the child vspace.

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "CONFIG_TEST_IMAGE"))]
extern crate alloc;

use log::trace;

pub const EM_ARM: u16 = 40;

const EI_NIDENT: usize = 16;
const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;

// Section header types.
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_NOBITS: u32 = 8;

// Section header flags.
pub const SHF_WRITE: u32 = 0x1;
pub const SHF_ALLOC: u32 = 0x2;
pub const SHF_EXECINSTR: u32 = 0x4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ElfError {
    /// Not a little-endian ELF32 image for the requested machine.
    Header,
    /// Image too small for the structures its header names.
    Truncated,
    /// The section allocator failed.
    Allocate,
}

/// A parsed section header.
#[derive(Debug, Copy, Clone)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
}

const SHDR_SIZE: usize = 40;
const EHDR_SIZE: usize = 52;

fn read_u16(image: &[u8], off: usize) -> Result<u16, ElfError> {
    let bytes = image.get(off..off + 2).ok_or(ElfError::Truncated)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(image: &[u8], off: usize) -> Result<u32, ElfError> {
    let bytes = image.get(off..off + 4).ok_or(ElfError::Truncated)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

struct Header {
    e_entry: u32,
    e_shoff: u32,
    e_shnum: u16,
    e_shstrndx: u16,
}

fn parse_header(machine: u16, image: &[u8]) -> Result<Header, ElfError> {
    if image.len() < EHDR_SIZE
        || image[..4] != ELFMAG
        || image[4] != ELFCLASS32
        || image[5] != ELFDATA2LSB
    {
        return Err(ElfError::Header);
    }
    if read_u16(image, EI_NIDENT + 2)? != machine {
        return Err(ElfError::Header);
    }
    Ok(Header {
        e_entry: read_u32(image, EI_NIDENT + 8)?,
        e_shoff: read_u32(image, EI_NIDENT + 16)?,
        e_shnum: read_u16(image, EI_NIDENT + 32)?,
        e_shstrndx: read_u16(image, EI_NIDENT + 34)?,
    })
}

/// Checks the image magic. Cheap pre-validation before committing to a
/// spawn.
pub fn is_elf(image: &[u8]) -> bool { image.len() >= 4 && image[..4] == ELFMAG }

fn section_header(image: &[u8], shoff: usize, index: usize) -> Result<SectionHeader, ElfError> {
    let off = shoff + index * SHDR_SIZE;
    Ok(SectionHeader {
        sh_name: read_u32(image, off)?,
        sh_type: read_u32(image, off + 4)?,
        sh_flags: read_u32(image, off + 8)?,
        sh_addr: read_u32(image, off + 12)?,
        sh_offset: read_u32(image, off + 16)?,
        sh_size: read_u32(image, off + 20)?,
    })
}

/// Loads the allocatable sections of `image`.
///
/// For every `SHF_ALLOC` section with a non-zero size, `allocate` is
/// called with `(requested_vaddr, size, flags)` and must return a
/// host-writable pointer for the section's bytes. Returns the image's
/// entry point.
pub fn elf_load(
    machine: u16,
    image: &[u8],
    allocate: &mut dyn FnMut(u32, usize, u32) -> Result<*mut u8, ()>,
) -> Result<u32, ElfError> {
    let hdr = parse_header(machine, image)?;

    for i in 0..hdr.e_shnum as usize {
        let shdr = section_header(image, hdr.e_shoff as usize, i)?;
        if shdr.sh_flags & SHF_ALLOC == 0 || shdr.sh_size == 0 {
            continue;
        }
        trace!(
            "load section {} at {:#x} size {:#x} flags {:#x}",
            i,
            shdr.sh_addr,
            shdr.sh_size,
            shdr.sh_flags
        );

        let size = shdr.sh_size as usize;
        let dest = allocate(shdr.sh_addr, size, shdr.sh_flags).map_err(|_| ElfError::Allocate)?;
        let dest = unsafe { core::slice::from_raw_parts_mut(dest, size) };

        if shdr.sh_type == SHT_NOBITS {
            dest.fill(0);
        } else {
            let off = shdr.sh_offset as usize;
            let src = image.get(off..off + size).ok_or(ElfError::Truncated)?;
            dest.copy_from_slice(src);
        }
    }

    Ok(hdr.e_entry)
}

/// Finds the section header whose name is `name`.
pub fn find_section_header_name(image: &[u8], name: &str) -> Option<SectionHeader> {
    let hdr = parse_header_any(image).ok()?;
    let strtab = section_header(image, hdr.e_shoff as usize, hdr.e_shstrndx as usize).ok()?;
    for i in 0..hdr.e_shnum as usize {
        let shdr = section_header(image, hdr.e_shoff as usize, i).ok()?;
        let name_off = (strtab.sh_offset + shdr.sh_name) as usize;
        let bytes = image.get(name_off..)?;
        let len = bytes.iter().position(|&b| b == 0)?;
        if &bytes[..len] == name.as_bytes() {
            return Some(shdr);
        }
    }
    None
}

// Header parse without a machine check, for name lookups on an image
// already validated by elf_load.
fn parse_header_any(image: &[u8]) -> Result<Header, ElfError> {
    if image.len() < EHDR_SIZE || image[..4] != ELFMAG {
        return Err(ElfError::Header);
    }
    Ok(Header {
        e_entry: read_u32(image, EI_NIDENT + 8)?,
        e_shoff: read_u32(image, EI_NIDENT + 16)?,
        e_shnum: read_u16(image, EI_NIDENT + 32)?,
        e_shstrndx: read_u16(image, EI_NIDENT + 34)?,
    })
}

#[cfg(any(test, feature = "CONFIG_TEST_IMAGE"))]
pub mod testimage {
    //! Builder for minimal ELF32 test images.

    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    pub struct Section {
        pub name: &'static str,
        pub sh_type: u32,
        pub flags: u32,
        pub addr: u32,
        pub data: Vec<u8>,
    }

    /// Builds a little-endian ELF32 image with the given sections, a
    /// NULL section 0 and a trailing .shstrtab.
    pub fn build(machine: u16, entry: u32, sections: &[Section]) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for s in sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(s.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let shnum = sections.len() + 2;
        let data_base = EHDR_SIZE;
        let mut data = Vec::new();
        let mut data_offsets = Vec::new();
        for s in sections {
            data_offsets.push(data_base + data.len());
            if s.sh_type != SHT_NOBITS {
                data.extend_from_slice(&s.data);
            }
        }
        let shstrtab_off = data_base + data.len();
        data.extend_from_slice(&shstrtab);
        let shoff = data_base + data.len();

        let mut image = Vec::new();
        image.extend_from_slice(&ELFMAG);
        image.push(ELFCLASS32);
        image.push(ELFDATA2LSB);
        image.push(1); // EI_VERSION
        image.resize(EI_NIDENT, 0);
        image.extend_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
        image.extend_from_slice(&machine.to_le_bytes());
        image.extend_from_slice(&1u32.to_le_bytes()); // e_version
        image.extend_from_slice(&entry.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // e_phoff
        image.extend_from_slice(&(shoff as u32).to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
        image.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
        image.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        image.extend_from_slice(&(shnum as u16).to_le_bytes());
        image.extend_from_slice(&((shnum - 1) as u16).to_le_bytes()); // e_shstrndx
        assert_eq!(image.len(), EHDR_SIZE);

        image.extend_from_slice(&data);
        assert_eq!(image.len(), shoff);

        let mut push_shdr = |name: u32, sh_type: u32, flags: u32, addr: u32, off: u32, size: u32,
                             image: &mut Vec<u8>| {
            image.extend_from_slice(&name.to_le_bytes());
            image.extend_from_slice(&sh_type.to_le_bytes());
            image.extend_from_slice(&flags.to_le_bytes());
            image.extend_from_slice(&addr.to_le_bytes());
            image.extend_from_slice(&off.to_le_bytes());
            image.extend_from_slice(&size.to_le_bytes());
            // sh_link, sh_info, sh_addralign, sh_entsize
            image.extend_from_slice(&[0u8; 16]);
        };

        // Section 0: NULL.
        push_shdr(0, 0, 0, 0, 0, 0, &mut image);
        for (i, s) in sections.iter().enumerate() {
            push_shdr(
                name_offsets[i],
                s.sh_type,
                s.flags,
                s.addr,
                data_offsets[i] as u32,
                s.data.len() as u32,
                &mut image,
            );
        }
        // .shstrtab
        push_shdr(
            shstrtab_name,
            3, // SHT_STRTAB
            0,
            0,
            shstrtab_off as u32,
            shstrtab.len() as u32,
            &mut image,
        );
        image
    }
}

#[cfg(test)]
mod tests {
    use super::testimage::{build, Section};
    use super::*;
    use std::collections::HashMap;

    fn two_section_image() -> Vec<u8> {
        build(
            EM_ARM,
            0x40_0040,
            &[
                Section {
                    name: ".text",
                    sh_type: SHT_PROGBITS,
                    flags: SHF_ALLOC | SHF_EXECINSTR,
                    addr: 0x40_0000,
                    data: vec![0xAA; 64],
                },
                Section {
                    name: ".got",
                    sh_type: SHT_PROGBITS,
                    flags: SHF_ALLOC | SHF_WRITE,
                    addr: 0x40_2000,
                    data: vec![0xBB; 32],
                },
            ],
        )
    }

    #[test]
    fn test_is_elf() {
        assert!(is_elf(&two_section_image()));
        assert!(!is_elf(b"not an elf image"));
        assert!(!is_elf(b"\x7fEL"));
    }

    #[test]
    fn test_load_copies_sections() {
        let image = two_section_image();
        let mut dests: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut requests = Vec::new();

        let entry = elf_load(EM_ARM, &image, &mut |vaddr, size, flags| {
            requests.push((vaddr, size, flags));
            let buf = dests.entry(vaddr).or_insert_with(|| vec![0; size]);
            Ok(buf.as_mut_ptr())
        })
        .unwrap();

        assert_eq!(entry, 0x40_0040);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], (0x40_0000, 64, SHF_ALLOC | SHF_EXECINSTR));
        assert_eq!(requests[1], (0x40_2000, 32, SHF_ALLOC | SHF_WRITE));
        assert!(dests[&0x40_0000].iter().all(|&b| b == 0xAA));
        assert!(dests[&0x40_2000].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_load_zero_fills_nobits() {
        let image = build(
            EM_ARM,
            0,
            &[Section {
                name: ".bss",
                sh_type: SHT_NOBITS,
                flags: SHF_ALLOC | SHF_WRITE,
                addr: 0x40_3000,
                data: vec![0xCC; 16],
            }],
        );
        let mut buf = vec![0xFFu8; 16];
        elf_load(EM_ARM, &image, &mut |_, _, _| Ok(buf.as_mut_ptr())).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_load_skips_unallocated() {
        let image = build(
            EM_ARM,
            0,
            &[Section {
                name: ".comment",
                sh_type: SHT_PROGBITS,
                flags: 0,
                addr: 0,
                data: vec![1, 2, 3],
            }],
        );
        let mut called = false;
        elf_load(EM_ARM, &image, &mut |_, _, _| {
            called = true;
            Ok(core::ptr::null_mut())
        })
        .unwrap();
        assert!(!called);
    }

    #[test]
    fn test_wrong_machine_rejected() {
        let image = build(0x3E /* x86-64 */, 0, &[]);
        assert_eq!(
            elf_load(EM_ARM, &image, &mut |_, _, _| Ok(core::ptr::null_mut())),
            Err(ElfError::Header)
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(
            elf_load(EM_ARM, b"garbage", &mut |_, _, _| Ok(core::ptr::null_mut())),
            Err(ElfError::Header)
        );
    }

    #[test]
    fn test_find_section_by_name() {
        let image = two_section_image();
        let got = find_section_header_name(&image, ".got").unwrap();
        assert_eq!(got.sh_addr, 0x40_2000);
        assert_eq!(got.sh_size, 32);
        assert!(find_section_header_name(&image, ".data").is_none());
    }
}
