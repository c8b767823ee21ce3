//! The auxiliary vector cache, and the walk from it to `r_debug`.

use log::debug;
use std::convert::TryInto;
use std::fs::File;
use std::io::Read;

use super::{Process, ProcessState};

pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_BASE: u64 = 7;
pub const AT_ENTRY: u64 = 9;

const PT_DYNAMIC: u32 = 2;
const PT_PHDR: u32 = 6;
const DT_DEBUG: u64 = 21;

/// `r_debug` address values with out-of-band meaning: `NONE` means the
/// process has no `_r_debug` at all, 0 means it is not (yet) known.
pub const R_DEBUG_NONE: u64 = u64::MAX;

impl Process {
    /// (Re-)read `/proc/<pid>/auxv` into the cache.  The entry width
    /// follows the target's ELF class.
    pub(crate) fn read_auxv(&mut self) {
        if self.state == ProcessState::Dead {
            return;
        }
        self.auxv = None;

        let path = self.procname("auxv");
        let mut raw = Vec::new();
        match File::open(&path).and_then(|mut f| f.read_to_end(&mut raw)) {
            Ok(_) => {}
            Err(e) => {
                debug!("cannot open auxiliary vector file {}: {}", path, e);
                return;
            }
        }

        let entsize = if self.elf64 { 16 } else { 8 };
        let mut entries = Vec::with_capacity(raw.len() / entsize);
        for chunk in raw.chunks_exact(entsize) {
            let (a_type, a_val) = if self.elf64 {
                (
                    u64::from_ne_bytes(chunk[0..8].try_into().unwrap()),
                    u64::from_ne_bytes(chunk[8..16].try_into().unwrap()),
                )
            } else {
                (
                    u32::from_ne_bytes(chunk[0..4].try_into().unwrap()) as u64,
                    u32::from_ne_bytes(chunk[4..8].try_into().unwrap()) as u64,
                )
            };
            entries.push((a_type, a_val));
        }
        debug!("{}: {} auxv entries", self.pid(), entries.len());
        self.auxv = Some(entries);
    }

    /// A requested element from the process's aux vector, or `None`.
    pub fn getauxval(&mut self, a_type: u64) -> Option<u64> {
        if self.state == ProcessState::Dead {
            return None;
        }
        if self.auxv.is_none() {
            self.read_auxv();
        }
        for &(t, v) in self.auxv.as_deref().unwrap_or(&[]) {
            if t == 0 {
                break; // AT_NULL
            }
            if t == a_type {
                return Some(v);
            }
        }
        None
    }

    /// The address of the base link map's `r_debug`, found via
    /// `AT_PHDR` → `PT_DYNAMIC` → `DT_DEBUG`.  Statically linked programs
    /// have no `PT_DYNAMIC`; their `_r_debug` is looked up by name.
    ///
    /// Returns [`R_DEBUG_NONE`] if there is no `r_debug` at all, 0 if it
    /// cannot be determined yet.
    pub(crate) fn r_debug(&mut self) -> u64 {
        if self.state == ProcessState::Dead {
            return 0;
        }
        if let Some(addr) = self.r_debug_addr {
            return addr;
        }
        let addr = self.find_r_debug();
        // Cache everything but transient lookup failures.
        if addr != 0 {
            self.r_debug_addr = Some(addr);
        }
        addr
    }

    fn find_r_debug(&mut self) -> u64 {
        let phaddr = self.getauxval(AT_PHDR);
        let phent = self.getauxval(AT_PHENT);
        let phnum = self.getauxval(AT_PHNUM);
        let (mut phaddr, phent, phnum) = match (phaddr, phent, phnum) {
            (Some(a), Some(e), Some(n)) => (a, e, n),
            _ => {
                debug!("{}: no phaddr, phent or phnum auxvec entry", self.pid());
                return R_DEBUG_NONE;
            }
        };

        let phdr_size: u64 = if self.elf64 { 56 } else { 32 };
        if phent != phdr_size {
            debug!(
                "{}: AT_PHENT is the wrong size: {} bytes versus an expected {}",
                self.pid(),
                phent,
                phdr_size
            );
            return R_DEBUG_NONE;
        }

        // Find PT_DYNAMIC, and PT_PHDR for the load bias of PIEs.
        let mut dynaddr = 0u64;
        let mut dynsize = 0u64;
        let mut reloc = 0u64;
        let mut num_found = 0;
        for _ in 0..phnum {
            if num_found >= 2 {
                break;
            }
            let p_type = match self.read_scalar_quietly(4, 4, phaddr, true) {
                Ok(t) => t as u32,
                Err(_) => break, // short read: end of phdrs
            };
            match p_type {
                PT_DYNAMIC => {
                    let (vaddr_off, memsz_off) = if self.elf64 { (16, 40) } else { (8, 20) };
                    let psize = self.ptr_size();
                    dynaddr = match self.read_scalar_quietly(psize, 8, phaddr + vaddr_off, true)
                    {
                        Ok(v) => v,
                        Err(_) => break,
                    };
                    dynsize = self
                        .read_scalar_quietly(psize, 8, phaddr + memsz_off, true)
                        .unwrap_or(0);
                    num_found += 1;
                }
                PT_PHDR => {
                    let vaddr_off = if self.elf64 { 16 } else { 8 };
                    let psize = self.ptr_size();
                    if let Ok(vaddr) =
                        self.read_scalar_quietly(psize, 8, phaddr + vaddr_off, true)
                    {
                        reloc = phaddr.wrapping_sub(vaddr);
                    }
                    num_found += 1;
                }
                _ => {}
            }
            phaddr += phdr_size;
        }

        if dynaddr == 0 {
            // No PT_DYNAMIC: probably statically linked.  Look for the
            // symbol by name instead.
            self.no_dyn = true;
            match self.lookup_by_name_everywhere("_r_debug") {
                Some(sym) => return sym.value,
                None => {
                    debug!("{}: cannot find r_debug: no dynaddr", self.pid());
                    return 0;
                }
            }
        }

        // Find the DT_DEBUG dynamic tag.
        let dyn_size: u64 = if self.elf64 { 16 } else { 8 };
        let psize = self.ptr_size();
        let mut off = 0u64;
        let mut entaddr = dynaddr + reloc;
        while off < dynsize {
            let tag = match self.read_scalar_quietly(psize, 8, entaddr, true) {
                Ok(t) => t,
                Err(_) => {
                    debug!(
                        "{}: cannot find r_debug: short read in dynamic section",
                        self.pid()
                    );
                    return R_DEBUG_NONE;
                }
            };
            if tag == DT_DEBUG {
                return self
                    .read_scalar_quietly(psize, 8, entaddr + psize as u64, true)
                    .unwrap_or(R_DEBUG_NONE);
            }
            off += dyn_size;
            entaddr += dyn_size;
        }

        debug!(
            "{}: cannot find r_debug: no DT_DEBUG dynamic tag",
            self.pid()
        );
        R_DEBUG_NONE
    }
}
