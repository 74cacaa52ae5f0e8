//! COFF (x86-64) relocatable-object serialisation.
//!
//! COFF has no explicit relocation addends, so the addend is folded into
//! the section bytes at the relocation site before writing; the Microsoft
//! REL32 convention measures from the byte after the fixed-up field, which
//! matches an ELF addend of -4 with zeroed inline bytes.

use super::{Binding, GenericObject, RelocKind, SectionKind, SymbolKind};

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

const IMAGE_REL_AMD64_ADDR64: u16 = 0x0001;
const IMAGE_REL_AMD64_ADDR32: u16 = 0x0002;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;

const TEXT_CHARACTERISTICS: u32 = 0x6050_0020; // code | execute | read | align 16
const DATA_CHARACTERISTICS: u32 = 0xc050_0040; // initialised | read | write | align 16
const BSS_CHARACTERISTICS: u32 = 0xc050_0080; // uninitialised | read | write | align 16

fn reloc_type(kind: RelocKind) -> u16 {
    match kind {
        RelocKind::Abs64 => IMAGE_REL_AMD64_ADDR64,
        RelocKind::Abs32 => IMAGE_REL_AMD64_ADDR32,
        RelocKind::Pc32 | RelocKind::Plt32 => IMAGE_REL_AMD64_REL32,
    }
}

fn section_number(kind: SectionKind) -> i16 {
    match kind {
        SectionKind::Text => 1,
        SectionKind::Data => 2,
        SectionKind::Bss => 3,
    }
}

/// Serialise `obj` as a COFF object file.
pub fn write(obj: &GenericObject) -> Vec<u8> {
    // Fold addends into the text image.
    let mut text = obj.text.clone();
    for r in &obj.relocs {
        if r.section != SectionKind::Text {
            continue;
        }
        let inline: i32 = match r.kind {
            RelocKind::Pc32 | RelocKind::Plt32 => (r.addend + 4) as i32,
            _ => r.addend as i32,
        };
        let at = r.offset as usize;
        if at + 4 <= text.len() {
            text[at..at + 4].copy_from_slice(&inline.to_le_bytes());
        }
    }

    let header_size = 20u32;
    let section_headers = 3 * 40u32;
    let off_text = header_size + section_headers;
    let off_data = off_text + text.len() as u32;
    let off_relocs = off_data + obj.data.len() as u32;
    let reloc_count = obj.relocs.len() as u32;
    let off_symtab = off_relocs + reloc_count * 10;
    let symbol_count = obj.symbols.len() as u32;

    let mut out = Vec::new();
    // File header.
    out.extend_from_slice(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
    out.extend_from_slice(&3u16.to_le_bytes()); // sections
    out.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    out.extend_from_slice(&off_symtab.to_le_bytes());
    out.extend_from_slice(&symbol_count.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // optional header size
    out.extend_from_slice(&0u16.to_le_bytes()); // characteristics

    // Section headers.
    coff_section(
        &mut out,
        b".text\0\0\0",
        text.len() as u32,
        off_text,
        off_relocs,
        reloc_count as u16,
        TEXT_CHARACTERISTICS,
    );
    coff_section(
        &mut out,
        b".data\0\0\0",
        obj.data.len() as u32,
        off_data,
        0,
        0,
        DATA_CHARACTERISTICS,
    );
    // NOBITS: size recorded, no raw data.
    coff_section(
        &mut out,
        b".bss\0\0\0\0",
        obj.bss_size as u32,
        0,
        0,
        0,
        BSS_CHARACTERISTICS,
    );

    out.extend_from_slice(&text);
    out.extend_from_slice(&obj.data);

    for r in &obj.relocs {
        out.extend_from_slice(&(r.offset as u32).to_le_bytes());
        out.extend_from_slice(&(r.symbol as u32).to_le_bytes());
        out.extend_from_slice(&reloc_type(r.kind).to_le_bytes());
    }

    // Symbol table with a trailing string table for long names.
    let mut strings: Vec<u8> = vec![0, 0, 0, 0];
    for sym in &obj.symbols {
        if sym.name.len() <= 8 {
            let mut name = [0u8; 8];
            name[..sym.name.len()].copy_from_slice(sym.name.as_bytes());
            out.extend_from_slice(&name);
        } else {
            let off = strings.len() as u32;
            strings.extend_from_slice(sym.name.as_bytes());
            strings.push(0);
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&off.to_le_bytes());
        }
        out.extend_from_slice(&(sym.offset as u32).to_le_bytes());
        let number = sym.section.map(section_number).unwrap_or(0);
        out.extend_from_slice(&number.to_le_bytes());
        let coff_type: u16 = if sym.kind == SymbolKind::Function {
            0x20
        } else {
            0
        };
        out.extend_from_slice(&coff_type.to_le_bytes());
        let storage: u8 = match sym.binding {
            Binding::Local => 3,  // static
            Binding::Global | Binding::Weak => 2, // external
        };
        out.push(storage);
        out.push(0); // auxiliary entries
    }
    let total = strings.len() as u32;
    strings[0..4].copy_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&strings);
    out
}

fn coff_section(
    out: &mut Vec<u8>,
    name: &[u8; 8],
    size: u32,
    raw_offset: u32,
    reloc_offset: u32,
    reloc_count: u16,
    characteristics: u32,
) {
    out.extend_from_slice(name);
    out.extend_from_slice(&0u32.to_le_bytes()); // virtual size
    out.extend_from_slice(&0u32.to_le_bytes()); // virtual address
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&raw_offset.to_le_bytes());
    out.extend_from_slice(&reloc_offset.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // line numbers
    out.extend_from_slice(&reloc_count.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // line number count
    out.extend_from_slice(&characteristics.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{ObjReloc, ObjSymbol};

    #[test]
    fn test_header_and_sections() {
        let mut obj = GenericObject::new();
        obj.text = vec![0xc3];
        obj.add_symbol(ObjSymbol {
            name: "f".to_string(),
            kind: SymbolKind::Function,
            section: Some(SectionKind::Text),
            offset: 0,
            size: 1,
            binding: Binding::Global,
        });
        let bytes = obj.to_coff();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 0x8664);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 3);
        // First section header name is .text.
        assert_eq!(&bytes[20..25], b".text");
    }

    #[test]
    fn test_rel32_addend_folded_inline() {
        let mut obj = GenericObject::new();
        // e8 00 00 00 00 (call rel32)
        obj.text = vec![0xe8, 0, 0, 0, 0];
        let ext = obj.external_index("g");
        obj.relocs.push(ObjReloc {
            section: SectionKind::Text,
            offset: 1,
            symbol: ext,
            kind: RelocKind::Plt32,
            addend: -4,
        });
        let bytes = obj.to_coff();
        // The text image starts after the 20-byte header and 3 section
        // headers; the folded addend for -4 is zero.
        let text_at = 20 + 3 * 40;
        assert_eq!(&bytes[text_at..text_at + 5], &[0xe8, 0, 0, 0, 0]);
    }
}
