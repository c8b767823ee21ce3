//! Per-file symbol table caches and address/name resolution.
//!
//! Each file-info lazily gets owned copies of `.symtab` and `.dynsym`
//! (with their string tables) plus two index arrays: one sorted by
//! address for `lookup_by_addr`, one sorted by name for binary search.
//! The address sort breaks ties the way a tracer wants them broken:
//! functions beat objects, global binding beats local, fewer leading
//! underscores, no `$`-prefixed compiler droppings, smaller size,
//! then lexicographic.

use goblin::elf::sym::{Sym, STB_LOCAL, STT_COMMON, STT_FUNC, STT_OBJECT, STT_TLS};
use goblin::elf::Elf;
use log::debug;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fs::File;
use std::rc::Rc;

use super::maps::{FileInfo, ObjSpec};
use super::Process;
use crate::error::Result;

const ET_DYN: u16 = 3;

/// Which symbol table a symbol came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WhichTable {
    SymTab,
    DynSym,
}

/// Binding/type filter for symbol iteration, ORed together.
pub mod filter {
    pub const BIND_LOCAL: u32 = 0x0001;
    pub const BIND_GLOBAL: u32 = 0x0002;
    pub const BIND_WEAK: u32 = 0x0004;
    pub const BIND_ANY: u32 = BIND_LOCAL | BIND_GLOBAL | BIND_WEAK;
    pub const TYPE_NOTYPE: u32 = 0x0100;
    pub const TYPE_OBJECT: u32 = 0x0200;
    pub const TYPE_FUNC: u32 = 0x0400;
    pub const TYPE_SECTION: u32 = 0x0800;
    pub const TYPE_FILE: u32 = 0x1000;
    pub const TYPE_ANY: u32 =
        TYPE_NOTYPE | TYPE_OBJECT | TYPE_FUNC | TYPE_SECTION | TYPE_FILE;
}

/// A resolved symbol, with its load bias already applied to `value`.
#[derive(Clone, Debug)]
pub struct SymbolInfo {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub shndx: usize,
    pub table: WhichTable,
    /// Name of the object the symbol was found in.
    pub object: String,
    pub lmid: Option<u64>,
}

impl SymbolInfo {
    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    pub fn bind(&self) -> u8 {
        self.info >> 4
    }

    pub fn is_func(&self) -> bool {
        self.sym_type() == STT_FUNC
    }

    pub fn is_undefined(&self) -> bool {
        self.shndx == 0
    }
}

/// One cached symbol table: immutable symbol and string data plus the
/// two sort indices.
#[derive(Default)]
pub struct SymTable {
    syms: Vec<Sym>,
    strs: Vec<u8>,
    by_addr: Vec<u32>,
    by_name: Vec<u32>,
}

impl SymTable {
    pub(crate) fn from_parts(syms: Vec<Sym>, strs: Vec<u8>) -> SymTable {
        let mut t = SymTable {
            syms,
            strs,
            by_addr: Vec::new(),
            by_name: Vec::new(),
        };
        t.optimize();
        t
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    fn name_of(&self, sym: &Sym) -> &str {
        str_at(&self.strs, sym.st_name)
    }

    /// Build the two sort indices over the data-type symbols with sane
    /// string offsets.
    fn optimize(&mut self) {
        let strsz = self.strs.len();
        let keep = |s: &Sym| {
            s.st_name < strsz
                && matches!(s.st_type(), STT_OBJECT | STT_FUNC | STT_COMMON | STT_TLS)
        };

        self.by_addr = (0..self.syms.len() as u32)
            .filter(|&i| keep(&self.syms[i as usize]))
            .collect();
        self.by_name = self.by_addr.clone();

        let syms = &self.syms;
        let strs = &self.strs;
        self.by_addr.sort_by(|&a, &b| {
            let (sa, sb) = (&syms[a as usize], &syms[b as usize]);
            byaddr_cmp(sa, str_at(strs, sa.st_name), sb, str_at(strs, sb.st_name))
        });
        self.by_name.sort_by(|&a, &b| {
            str_at(strs, syms[a as usize].st_name).cmp(str_at(strs, syms[b as usize].st_name))
        });
    }

    /// Binary-search the address index.  `addr` must already be adjusted
    /// down by the file's load bias.
    pub(crate) fn by_addr(&self, addr: u64) -> Option<&Sym> {
        let mut found: Option<usize> = None;
        let (mut min, mut max) = (0isize, self.by_addr.len() as isize - 1);

        // A match cannot end the search: we keep going for the closest
        // (highest-valued) covering symbol.
        while min <= max {
            let mid = ((max + min) / 2) as usize;
            let sym = &self.syms[self.by_addr[mid] as usize];
            if addr >= sym.st_value
                && addr < sym.st_value + sym.st_size
                && found
                    .map(|f| sym.st_value > self.syms[self.by_addr[f] as usize].st_value)
                    .unwrap_or(true)
            {
                found = Some(mid);
            }
            if addr < sym.st_value {
                max = mid as isize - 1;
            } else {
                min = mid as isize + 1;
            }
        }

        // Many symbols may share a value; the index order already puts
        // the preferred one first, so walk back to it.
        let mut best = found?;
        while best > 0 {
            let cur = &self.syms[self.by_addr[best] as usize];
            let prev = &self.syms[self.by_addr[best - 1] as usize];
            if prev.st_value == cur.st_value
                && addr >= prev.st_value
                && addr < prev.st_value + prev.st_size
            {
                best -= 1;
            } else {
                break;
            }
        }
        Some(&self.syms[self.by_addr[best] as usize])
    }

    /// Binary-search the name index.
    pub(crate) fn by_name(&self, name: &str) -> Option<&Sym> {
        let idx = self
            .by_name
            .binary_search_by(|&i| self.name_of(&self.syms[i as usize]).cmp(name))
            .ok()?;
        Some(&self.syms[self.by_name[idx] as usize])
    }

    pub(crate) fn iter_by_addr(&self) -> impl Iterator<Item = (&Sym, &str)> {
        self.by_addr
            .iter()
            .map(move |&i| (&self.syms[i as usize], self.name_of(&self.syms[i as usize])))
    }
}

fn str_at(strs: &[u8], off: usize) -> &str {
    if off >= strs.len() {
        return "";
    }
    let tail = &strs[off..];
    let end = memchr::memchr(0, tail).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..end]).unwrap_or("")
}

/// The address-sort comparator, with the full tie-break chain.
fn byaddr_cmp(a: &Sym, aname: &str, b: &Sym, bname: &str) -> Ordering {
    if a.st_value != b.st_value {
        return a.st_value.cmp(&b.st_value);
    }

    // Prefer the function to the non-function.
    if a.st_type() != b.st_type() {
        if a.st_type() == STT_FUNC {
            return Ordering::Less;
        }
        if b.st_type() == STT_FUNC {
            return Ordering::Greater;
        }
    }

    // Prefer the weak or strong global symbol to the local one.
    if a.st_bind() != b.st_bind() {
        if b.st_bind() == STB_LOCAL {
            return Ordering::Less;
        }
        if a.st_bind() == STB_LOCAL {
            return Ordering::Greater;
        }
    }

    // Compilers and other symbol generators use '$' as a prefix; prefer
    // the name without one.
    match (aname.starts_with('$'), bname.starts_with('$')) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        _ => {}
    }

    // Prefer the name with fewer leading underscores.
    let aund = aname.len() - aname.trim_start_matches('_').len();
    let bund = bname.len() - bname.trim_start_matches('_').len();
    if aund != bund {
        return aund.cmp(&bund);
    }

    // Prefer the smaller symbol.
    if a.st_size != b.st_size {
        return a.st_size.cmp(&b.st_size);
    }

    aname.cmp(bname)
}

impl Process {
    /// Lazily build the symbol tables for a mapped file: open the backing
    /// file (preferring the kernel's map_files link, since the on-disk
    /// file may have been deleted or renamed), parse it, and copy out the
    /// symbol and string data.
    pub(crate) fn build_file_symtab(&mut self, file: &Rc<RefCell<FileInfo>>) {
        if file.borrow().init {
            return;
        }
        file.borrow_mut().init = true;

        let (pname, file_map) = {
            let f = file.borrow();
            (f.pname.clone(), f.file_map)
        };

        let opened = self.open_backing_file(&pname, file_map);
        let fd = match opened {
            Some(f) => f,
            None => {
                debug!("{}: cannot open backing file {}", self.pid(), pname);
                return;
            }
        };

        let data = match unsafe { memmap2::Mmap::map(&fd) } {
            Ok(m) => m,
            Err(e) => {
                debug!("{}: cannot map {}: {}", self.pid(), pname, e);
                return;
            }
        };

        let elf = match Elf::parse(&data) {
            Ok(e) => e,
            Err(e) => {
                debug!("{}: {} does not parse as ELF: {}", self.pid(), pname, e);
                return;
            }
        };

        let mut f = file.borrow_mut();
        f.etype = elf.header.e_type;

        f.symtab = SymTable::from_parts(
            elf.syms.iter().collect(),
            strtab_bytes(&data, &elf, false),
        );
        f.dynsym = SymTable::from_parts(
            elf.dynsyms.iter().collect(),
            strtab_bytes(&data, &elf, true),
        );

        // The load bias: the linker tells us outright for objects it
        // knows; otherwise compute it from the primary mapping and the
        // first loadable program header.
        if f.etype == ET_DYN {
            let linker_base = f.lo.as_ref().map(|lo| lo.base);
            if let Some(base) = linker_base {
                f.dyn_base = base;
            } else if let Some(m) = f.file_map.and_then(|idx| self.mappings.get(idx)) {
                // Compute the bias from the text mapping and the loadable
                // segment backing it.  (Objects are mapped in several
                // segments; the text one is rarely the first.)
                use goblin::elf::program_header::PT_LOAD;
                let ph = elf
                    .program_headers
                    .iter()
                    .find(|ph| {
                        ph.p_type == PT_LOAD
                            && ph.p_offset <= m.offset
                            && m.offset < ph.p_offset + ph.p_filesz.max(1)
                    })
                    .or_else(|| elf.program_headers.iter().find(|ph| ph.p_type == PT_LOAD));
                if let Some(ph) = ph {
                    f.dyn_base = m
                        .start
                        .wrapping_sub(m.offset.wrapping_sub(ph.p_offset))
                        .wrapping_sub(ph.p_vaddr);
                }
            }
        } else {
            f.dyn_base = 0;
        }

        debug!(
            "{}: built symtab for {}: {} syms, {} dynsyms, bias {:#x}",
            self.pid(),
            pname,
            f.symtab.len(),
            f.dynsym.len(),
            f.dyn_base
        );
    }

    fn open_backing_file(&mut self, pname: &str, file_map: Option<usize>) -> Option<File> {
        if self.map_files_usable() {
            if let Some(idx) = file_map {
                if let Some(m) = self.mappings.get(idx) {
                    let path = self.procname(&format!("map_files/{}", m.addr_range));
                    if let Ok(f) = File::open(path) {
                        return Some(f);
                    }
                }
            }
        }
        File::open(pname).ok()
    }

    /// Resolve the symbol covering `addr` across all loaded objects.
    pub fn lookup_by_addr(&mut self, addr: u64) -> Option<SymbolInfo> {
        self.update_maps();
        self.update_lmids();

        let idx = self.addr_to_map_idx(addr)?;
        let file = self.mappings[idx].file.clone()?;
        self.build_file_symtab(&file);

        let f = file.borrow();
        let bias = f.dyn_base;
        let faddr = addr.wrapping_sub(bias);

        let (mut best, mut table) = (f.symtab.by_addr(faddr), WhichTable::SymTab);
        if let Some(dsym) = f.dynsym.by_addr(faddr) {
            best = match best {
                None => {
                    table = WhichTable::DynSym;
                    Some(dsym)
                }
                Some(psym) => {
                    if byaddr_cmp(
                        psym,
                        f.symtab.name_of(psym),
                        dsym,
                        f.dynsym.name_of(dsym),
                    ) == Ordering::Greater
                    {
                        table = WhichTable::DynSym;
                        Some(dsym)
                    } else {
                        Some(psym)
                    }
                }
            };
        }

        let sym = best?;
        let name = match table {
            WhichTable::SymTab => f.symtab.name_of(sym),
            WhichTable::DynSym => f.dynsym.name_of(sym),
        };
        Some(SymbolInfo {
            name: name.to_string(),
            value: sym.st_value.wrapping_add(bias),
            size: sym.st_size,
            info: sym.st_info,
            shndx: sym.st_shndx,
            table,
            object: f.lname.clone().unwrap_or_else(|| f.pname.clone()),
            lmid: f.lo.as_ref().map(|lo| lo.lmid),
        })
    }

    /// Look a symbol up by name with a scope walk: the requested object's
    /// own symbol search path first, then a linear sweep over every
    /// file.  Undefined symbols match only if no defined match exists.
    pub fn xlookup_by_name(
        &mut self,
        lmid: Option<u64>,
        spec: ObjSpec,
        name: &str,
    ) -> Option<SymbolInfo> {
        self.update_maps();
        self.update_lmids();

        let mut candidates: Vec<Rc<RefCell<FileInfo>>> = Vec::new();
        match spec {
            ObjSpec::Every => {}
            _ => {
                let idx = self.object_to_map_idx(lmid, spec)?;
                let file = self.mappings[idx].file.clone()?;
                self.update_symsearch(&file);
                let search = file.borrow().symsearch.clone();
                candidates.push(file);
                if let Some(search) = search {
                    for w in search {
                        if let Some(f) = w.upgrade() {
                            candidates.push(f);
                        }
                    }
                }
            }
        }

        if candidates.is_empty() {
            // Linear sweep over every file, by mapping order.
            for m in &self.mappings {
                if let Some(f) = &m.file {
                    if f.borrow().file_map.is_some()
                        && !candidates.iter().any(|c| Rc::ptr_eq(c, f))
                    {
                        candidates.push(Rc::clone(f));
                    }
                }
            }
        }

        let mut undef_match: Option<SymbolInfo> = None;
        for file in candidates {
            self.build_file_symtab(&file);
            let f = file.borrow();

            if let Some(want) = lmid {
                if let Some(lo) = &f.lo {
                    if lo.lmid != want {
                        continue;
                    }
                }
            }

            for &(table, tab) in
                [(WhichTable::SymTab, &f.symtab), (WhichTable::DynSym, &f.dynsym)].iter()
            {
                if let Some(sym) = tab.by_name(name) {
                    let info = SymbolInfo {
                        name: name.to_string(),
                        value: sym.st_value.wrapping_add(f.dyn_base),
                        size: sym.st_size,
                        info: sym.st_info,
                        shndx: sym.st_shndx,
                        table,
                        object: f.lname.clone().unwrap_or_else(|| f.pname.clone()),
                        lmid: f.lo.as_ref().map(|lo| lo.lmid),
                    };
                    if info.is_undefined() {
                        undef_match.get_or_insert(info);
                    } else {
                        return Some(info);
                    }
                }
            }
        }

        undef_match
    }

    /// Look a symbol up by name in every object.
    pub fn lookup_by_name(&mut self, name: &str) -> Option<SymbolInfo> {
        self.xlookup_by_name(None, ObjSpec::Every, name)
    }

    pub(crate) fn lookup_by_name_everywhere(&mut self, name: &str) -> Option<SymbolInfo> {
        self.lookup_by_name(name)
    }

    /// Iterate, in address order, over one object's symbols that pass the
    /// binding/type filter.
    pub fn symbol_iter_by_addr<F>(
        &mut self,
        spec: ObjSpec,
        which: WhichTable,
        mask: u32,
        mut f: F,
    ) -> Result<usize>
    where
        F: FnMut(&SymbolInfo),
    {
        self.update_maps();
        self.update_lmids();

        let idx = match self.object_to_map_idx(None, spec) {
            Some(idx) => idx,
            None => return Ok(0),
        };
        let file = match self.mappings[idx].file.clone() {
            Some(f) => f,
            None => return Ok(0),
        };
        self.build_file_symtab(&file);

        let fi = file.borrow();
        let tab = match which {
            WhichTable::SymTab => &fi.symtab,
            WhichTable::DynSym => &fi.dynsym,
        };

        let mut n = 0;
        for (sym, name) in tab.iter_by_addr() {
            let bind_bit = 1u32 << sym.st_bind().min(15);
            let type_bit = 0x100u32 << sym.st_type().min(15);
            if mask & bind_bit == 0 || mask & type_bit == 0 {
                continue;
            }
            f(&SymbolInfo {
                name: name.to_string(),
                value: sym.st_value.wrapping_add(fi.dyn_base),
                size: sym.st_size,
                info: sym.st_info,
                shndx: sym.st_shndx,
                table: which,
                object: fi.lname.clone().unwrap_or_else(|| fi.pname.clone()),
                lmid: fi.lo.as_ref().map(|lo| lo.lmid),
            });
            n += 1;
        }
        Ok(n)
    }
}

/// Copy out the raw string table linked from the symbol table section of
/// the given type, so the cache owns bytes that the `st_name` offsets
/// index directly.
fn strtab_bytes(data: &[u8], elf: &Elf, dynamic: bool) -> Vec<u8> {
    use goblin::elf::section_header::{SHT_DYNSYM, SHT_SYMTAB};

    let want = if dynamic { SHT_DYNSYM } else { SHT_SYMTAB };
    for sh in &elf.section_headers {
        if sh.sh_type != want {
            continue;
        }
        if let Some(strsh) = elf.section_headers.get(sh.sh_link as usize) {
            let start = strsh.sh_offset as usize;
            let end = start.saturating_add(strsh.sh_size as usize);
            if end <= data.len() {
                return data[start..end].to_vec();
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(value: u64, size: u64, info: u8, name_off: usize) -> Sym {
        Sym {
            st_name: name_off,
            st_info: info,
            st_other: 0,
            st_shndx: 1,
            st_value: value,
            st_size: size,
        }
    }

    // st_info = (bind << 4) | type
    const GLOBAL_FUNC: u8 = (1 << 4) | 2;
    const LOCAL_FUNC: u8 = 2;
    const GLOBAL_OBJ: u8 = (1 << 4) | 1;

    fn table() -> SymTable {
        let strs = b"\0alpha\0_alpha\0$pad\0beta\0".to_vec();
        // offsets:   1      7       14    19
        let syms = vec![
            sym(0x1000, 0x10, GLOBAL_FUNC, 1),  // alpha
            sym(0x1000, 0x10, LOCAL_FUNC, 7),   // _alpha (local, underscore)
            sym(0x1000, 0x10, GLOBAL_OBJ, 14),  // $pad (object, $)
            sym(0x2000, 0x20, GLOBAL_FUNC, 19), // beta
        ];
        SymTable::from_parts(syms, strs)
    }

    #[test]
    fn address_lookup_prefers_functions_and_clean_names() {
        let t = table();
        let s = t.by_addr(0x1008).unwrap();
        assert_eq!(t.name_of(s), "alpha");

        let s = t.by_addr(0x2010).unwrap();
        assert_eq!(t.name_of(s), "beta");

        // Bounds are exclusive at the top.
        assert!(t.by_addr(0x1010).is_none());
        assert!(t.by_addr(0xfff).is_none());
    }

    #[test]
    fn name_lookup_binary_search() {
        let t = table();
        assert_eq!(t.by_name("beta").unwrap().st_value, 0x2000);
        assert_eq!(t.by_name("alpha").unwrap().st_value, 0x1000);
        assert!(t.by_name("gamma").is_none());
    }

    #[test]
    fn tie_break_chain() {
        let strs = b"\0aa\0a\0".to_vec();
        let a = sym(0x10, 8, GLOBAL_FUNC, 1); // "aa", size 8
        let b = sym(0x10, 4, GLOBAL_FUNC, 4); // "a", size 4: smaller wins
        assert_eq!(
            byaddr_cmp(&a, str_at(&strs, 1), &b, str_at(&strs, 4)),
            Ordering::Greater
        );
    }

    #[test]
    fn self_symbols_resolve() {
        // Our own executable has a dynamic symbol table with libc
        // imports; resolving a well-known one through the whole stack
        // exercises mapping update, symtab build and the scope sweep.
        let mut p = super::super::Process::grab(
            std::process::id() as libc::pid_t,
            super::super::Grab::Noninvasive,
            false,
        )
        .expect("cannot grab self");

        let sym = p.lookup_by_name("getpid");
        assert!(sym.is_some(), "getpid not found in any loaded object");
        let sym = sym.unwrap();
        assert!(sym.value != 0);

        // And the reverse direction agrees (modulo aliasing).
        if !sym.is_undefined() && sym.size > 0 {
            let back = p.lookup_by_addr(sym.value).expect("no symbol at getpid");
            assert!(back.value <= sym.value);
            assert!(sym.value < back.value + back.size.max(1));
        }
    }
}
