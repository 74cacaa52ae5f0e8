//! ELF64 relocatable-object serialisation.
//!
//! Translates a [`GenericObject`] into `ET_REL` for `EM_X86_64`. Section
//! layout: the file header, raw section contents, then the section header
//! table. Local symbols precede globals as the format requires.

use super::{Binding, GenericObject, ObjSymbol, RelocKind, SectionKind, SymbolKind};

// ELF constants used below.
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_32: u32 = 10;

// Section header table indices.
const SHN_TEXT: u16 = 1;
const SHN_RELA_TEXT: u16 = 2;
const SHN_DATA: u16 = 3;
const SHN_BSS: u16 = 4;
const SHN_SYMTAB: u16 = 5;
const SHN_STRTAB: u16 = 6;
const SHN_SHSTRTAB: u16 = 7;
const SECTION_COUNT: u16 = 8;

fn reloc_type(kind: RelocKind) -> u32 {
    match kind {
        RelocKind::Abs64 => R_X86_64_64,
        RelocKind::Pc32 => R_X86_64_PC32,
        RelocKind::Plt32 => R_X86_64_PLT32,
        RelocKind::Abs32 => R_X86_64_32,
    }
}

fn section_index(kind: SectionKind) -> u16 {
    match kind {
        SectionKind::Text => SHN_TEXT,
        SectionKind::Data => SHN_DATA,
        SectionKind::Bss => SHN_BSS,
    }
}

struct StrTab {
    bytes: Vec<u8>,
}

impl StrTab {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        off
    }
}

/// Serialise `obj` as an ELF64 relocatable file.
pub fn write(obj: &GenericObject) -> Vec<u8> {
    // Symbols sorted locals-first; remember where each original index went.
    let mut order: Vec<usize> = (0..obj.symbols.len()).collect();
    order.sort_by_key(|&i| obj.symbols[i].binding != Binding::Local);
    let mut new_index = vec![0usize; obj.symbols.len()];
    for (new, &old) in order.iter().enumerate() {
        new_index[old] = new + 1; // entry 0 is the null symbol
    }
    let first_global = 1 + order
        .iter()
        .filter(|&&i| obj.symbols[i].binding == Binding::Local)
        .count() as u32;

    let mut strtab = StrTab::new();
    let mut symtab: Vec<u8> = vec![0; 24]; // null symbol
    for &old in &order {
        let sym = &obj.symbols[old];
        symtab.extend_from_slice(&encode_symbol(sym, &mut strtab));
    }

    let mut rela: Vec<u8> = Vec::new();
    for r in &obj.relocs {
        debug_assert_eq!(r.section, SectionKind::Text);
        rela.extend_from_slice(&r.offset.to_le_bytes());
        let info = ((new_index[r.symbol] as u64) << 32) | reloc_type(r.kind) as u64;
        rela.extend_from_slice(&info.to_le_bytes());
        rela.extend_from_slice(&r.addend.to_le_bytes());
    }

    let mut shstrtab = StrTab::new();
    let name_text = shstrtab.add(".text");
    let name_rela = shstrtab.add(".rela.text");
    let name_data = shstrtab.add(".data");
    let name_bss = shstrtab.add(".bss");
    let name_symtab = shstrtab.add(".symtab");
    let name_strtab = shstrtab.add(".strtab");
    let name_shstrtab = shstrtab.add(".shstrtab");

    // Content layout after the 64-byte file header.
    let mut offset = 64u64;
    let mut place = |len: u64, align: u64| {
        let align = align.max(1);
        offset = (offset + align - 1) & !(align - 1);
        let at = offset;
        offset += len;
        at
    };
    let off_text = place(obj.text.len() as u64, obj.text_align);
    let off_rela = place(rela.len() as u64, 8);
    let off_data = place(obj.data.len() as u64, obj.data_align);
    let off_bss = place(0, obj.bss_align);
    let off_symtab = place(symtab.len() as u64, 8);
    let off_strtab = place(strtab.bytes.len() as u64, 1);
    let off_shstrtab = place(shstrtab.bytes.len() as u64, 1);
    let shoff = (offset + 7) & !7;

    let mut out = Vec::new();
    // File header.
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&1u16.to_le_bytes()); // ET_REL
    out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&shoff.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&SECTION_COUNT.to_le_bytes()); // e_shnum
    out.extend_from_slice(&SHN_SHSTRTAB.to_le_bytes()); // e_shstrndx

    let mut put_at = |out: &mut Vec<u8>, at: u64, bytes: &[u8]| {
        if out.len() < at as usize {
            out.resize(at as usize, 0);
        }
        out.extend_from_slice(bytes);
    };
    put_at(&mut out, off_text, &obj.text);
    put_at(&mut out, off_rela, &rela);
    put_at(&mut out, off_data, &obj.data);
    put_at(&mut out, off_symtab, &symtab);
    put_at(&mut out, off_strtab, &strtab.bytes);
    put_at(&mut out, off_shstrtab, &shstrtab.bytes);
    if out.len() < shoff as usize {
        out.resize(shoff as usize, 0);
    }

    // Section headers.
    out.extend_from_slice(&[0u8; 64]); // null section
    section_header(
        &mut out,
        name_text,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        off_text,
        obj.text.len() as u64,
        0,
        0,
        obj.text_align,
        0,
    );
    section_header(
        &mut out,
        name_rela,
        SHT_RELA,
        0,
        off_rela,
        rela.len() as u64,
        SHN_SYMTAB as u32,
        SHN_TEXT as u32,
        8,
        24,
    );
    section_header(
        &mut out,
        name_data,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE,
        off_data,
        obj.data.len() as u64,
        0,
        0,
        obj.data_align,
        0,
    );
    section_header(
        &mut out,
        name_bss,
        SHT_NOBITS,
        SHF_ALLOC | SHF_WRITE,
        off_bss,
        obj.bss_size,
        0,
        0,
        obj.bss_align,
        0,
    );
    section_header(
        &mut out,
        name_symtab,
        SHT_SYMTAB,
        0,
        off_symtab,
        symtab.len() as u64,
        SHN_STRTAB as u32,
        first_global,
        8,
        24,
    );
    section_header(
        &mut out,
        name_strtab,
        SHT_STRTAB,
        0,
        off_strtab,
        strtab.bytes.len() as u64,
        0,
        0,
        1,
        0,
    );
    section_header(
        &mut out,
        name_shstrtab,
        SHT_STRTAB,
        0,
        off_shstrtab,
        shstrtab.bytes.len() as u64,
        0,
        0,
        1,
        0,
    );
    out
}

fn encode_symbol(sym: &ObjSymbol, strtab: &mut StrTab) -> [u8; 24] {
    let mut entry = [0u8; 24];
    let name = strtab.add(&sym.name);
    entry[0..4].copy_from_slice(&name.to_le_bytes());
    let bind: u8 = match sym.binding {
        Binding::Local => 0,
        Binding::Global => 1,
        Binding::Weak => 2,
    };
    let typ: u8 = match sym.kind {
        SymbolKind::Function => 2,
        SymbolKind::Object => 1,
        SymbolKind::External => 0,
    };
    entry[4] = (bind << 4) | typ;
    let shndx: u16 = sym.section.map(section_index).unwrap_or(0);
    entry[6..8].copy_from_slice(&shndx.to_le_bytes());
    entry[8..16].copy_from_slice(&sym.offset.to_le_bytes());
    entry[16..24].copy_from_slice(&sym.size.to_le_bytes());
    entry
}

#[allow(clippy::too_many_arguments)]
fn section_header(
    out: &mut Vec<u8>,
    name: u32,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) {
    out.extend_from_slice(&name.to_le_bytes());
    out.extend_from_slice(&sh_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&link.to_le_bytes());
    out.extend_from_slice(&info.to_le_bytes());
    out.extend_from_slice(&align.to_le_bytes());
    out.extend_from_slice(&entsize.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{ObjReloc, SectionKind};

    fn sample_object() -> GenericObject {
        let mut obj = GenericObject::new();
        obj.text = vec![0xc3];
        obj.data = vec![1, 2, 3, 4];
        obj.bss_size = 16;
        obj.add_symbol(ObjSymbol {
            name: "f".to_string(),
            kind: SymbolKind::Function,
            section: Some(SectionKind::Text),
            offset: 0,
            size: 1,
            binding: Binding::Global,
        });
        let ext = obj.external_index("puts");
        obj.relocs.push(ObjReloc {
            section: SectionKind::Text,
            offset: 0,
            symbol: ext,
            kind: RelocKind::Plt32,
            addend: -4,
        });
        obj
    }

    #[test]
    fn test_header_fields() {
        let bytes = sample_object().to_elf();
        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(bytes[4], 2); // 64-bit
        assert_eq!(bytes[5], 1); // little endian
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 1); // ET_REL
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 62); // x86-64
        assert_eq!(u16::from_le_bytes([bytes[60], bytes[61]]), 8); // e_shnum
    }

    #[test]
    fn test_reloc_encoding() {
        let obj = sample_object();
        let bytes = obj.to_elf();
        // The single rela entry names PLT32 (type 4).
        // Find it by scanning for the info word with type 4 and a
        // non-zero symbol index.
        let found = bytes
            .windows(8)
            .any(|w| u64::from_le_bytes(w.try_into().unwrap()) & 0xffff_ffff == 4
                && u64::from_le_bytes(w.try_into().unwrap()) >> 32 != 0);
        assert!(found);
    }
}
