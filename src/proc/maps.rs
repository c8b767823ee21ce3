//! The mapping cache: a sorted view of the target's address space, with
//! reference-counted per-file symbol information hanging off it.

use bitflags::bitflags;
use log::debug;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use super::rtld::LoadObj;
use super::symtab::SymTable;
use super::{Process, ProcessState};
use crate::error::Result;

bitflags! {
    pub struct MapPerms: u32 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const EXEC  = 0b100;
    }
}

/// One VM mapping of the target.
pub struct Mapping {
    pub start: u64,
    pub size: u64,
    pub offset: u64,
    pub perms: MapPerms,
    pub dev: u64,
    pub ino: u64,
    /// Backing pathname.
    pub name: String,
    /// The kernel's `start-end` name for this range, for map_files opens.
    pub addr_range: String,
    pub(crate) file: Option<Rc<RefCell<FileInfo>>>,
}

impl Mapping {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.size
    }
}

/// Symbol information for one distinct backing file, shared by all the
/// mappings that reference it and persisting across cache rebuilds while
/// any mapping still does.
pub struct FileInfo {
    pub pname: String,
    pub dev: u64,
    pub ino: u64,
    pub refcount: usize,
    /// Symbol-table build attempted (possibly yielding empty tables).
    pub init: bool,
    pub etype: u16,
    /// Load-object name as the linker knows it; may differ from the
    /// on-disk name.
    pub lname: Option<String>,
    pub lo: Option<LoadObj>,
    /// Index of the primary text mapping.
    pub file_map: Option<usize>,
    pub symtab: SymTable,
    pub dynsym: SymTable,
    /// Load address adjustment for ET_DYN objects.
    pub dyn_base: u64,
    /// Ordered symbol search scope, computed lazily from the loadobj.
    pub symsearch: Option<Vec<std::rc::Weak<RefCell<FileInfo>>>>,
}

impl FileInfo {
    fn new(pname: String, dev: u64, ino: u64) -> FileInfo {
        FileInfo {
            pname,
            dev,
            ino,
            refcount: 0,
            init: false,
            etype: 0,
            lname: None,
            lo: None,
            file_map: None,
            symtab: SymTable::default(),
            dynsym: SymTable::default(),
            dyn_base: 0,
            symsearch: None,
        }
    }

    pub fn lbase(&self) -> Option<&str> {
        self.lname
            .as_deref()
            .map(|n| n.rsplit('/').next().unwrap_or(n))
    }
}

/// Which object a name lookup should search.
#[derive(Copy, Clone, Debug)]
pub enum ObjSpec<'a> {
    /// The main executable.
    Exec,
    /// The dynamic linker.
    Ldso,
    /// Every load object.
    Every,
    /// A specific object, by path, load-object name, or basename.
    Name(&'a str),
}

pub(crate) struct MapsLine {
    pub start: u64,
    pub end: u64,
    pub perms: MapPerms,
    pub offset: u64,
    pub dev: u64,
    pub ino: u64,
    pub name: Option<String>,
}

/// Parse one line of the kernel's per-process mapping list.
pub(crate) fn parse_maps_line(line: &str) -> Option<MapsLine> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms_s = fields.next()?;
    let offset_s = fields.next()?;
    let dev_s = fields.next()?;
    let ino_s = fields.next()?;
    // The pathname may contain spaces; take the remainder of the line.
    let name = match fields.next() {
        None => None,
        Some(first) => {
            let idx = line.find(first)?;
            Some(line[idx..].trim_end().to_string())
        }
    };

    let dash = range.find('-')?;
    let start = u64::from_str_radix(&range[..dash], 16).ok()?;
    let end = u64::from_str_radix(&range[dash + 1..], 16).ok()?;

    let pb = perms_s.as_bytes();
    let mut perms = MapPerms::empty();
    if pb.first() == Some(&b'r') {
        perms |= MapPerms::READ;
    }
    if pb.get(1) == Some(&b'w') {
        perms |= MapPerms::WRITE;
    }
    if pb.get(2) == Some(&b'x') {
        perms |= MapPerms::EXEC;
    }

    let offset = u64::from_str_radix(offset_s, 16).ok()?;
    let colon = dev_s.find(':')?;
    let major = u32::from_str_radix(&dev_s[..colon], 16).ok()?;
    let minor = u32::from_str_radix(&dev_s[colon + 1..], 16).ok()?;
    let ino = ino_s.parse::<u64>().ok()?;

    Some(MapsLine {
        start,
        end,
        perms,
        offset,
        dev: libc::makedev(major, minor),
        ino,
        name,
    })
}

/// The dynamic-linker heuristic: all glibc 2.x linkers are named ld-*.so*
/// and live under a lib directory.
fn is_ldso_name(path: &str) -> bool {
    let base = path.rsplit('/').next().unwrap_or(path);
    (path.starts_with("/lib") || path.starts_with("/usr/lib")) && base.starts_with("ld-")
        && base.contains(".so")
}

impl Process {
    /// Rebuild the mapping cache if it has been invalidated.  File-infos
    /// for still-present files are revived rather than rebuilt.
    pub fn update_maps(&mut self) {
        if self.info_valid || self.state == ProcessState::Dead {
            return;
        }

        debug!("updating mappings for PID {}", self.pid());
        self.mapping_purge();

        let mapfile = self.procname("maps");
        let content = match fs::read_to_string(&mapfile) {
            Ok(c) => c,
            Err(_) => {
                self.reset_maps();
                return;
            }
        };

        let exefile = fs::read_link(self.procname("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let old_files = std::mem::take(&mut self.files);

        for line in content.lines() {
            let parsed = match parse_maps_line(line) {
                Some(p) => p,
                None => continue,
            };
            // Skip anonymous mappings and special ones like the stack,
            // heap and vdso.
            let name = match parsed.name {
                Some(ref n) if !n.starts_with('[') => n.clone(),
                _ => continue,
            };

            let idx = self.mappings.len();
            let mut mapping = Mapping {
                start: parsed.start,
                size: parsed.end - parsed.start,
                offset: parsed.offset,
                perms: parsed.perms,
                dev: parsed.dev,
                ino: parsed.ino,
                name: name.clone(),
                addr_range: format!("{:x}-{:x}", parsed.start, parsed.end),
                file: None,
            };

            if parsed.perms.contains(MapPerms::EXEC) {
                if self.map_ldso.is_none() && !self.no_dyn && is_ldso_name(&name) {
                    self.map_ldso = Some(idx);
                }
                if self.map_exec.is_none() && !exefile.is_empty() && name == exefile {
                    self.map_exec = Some(idx);
                }
            }

            // Only on-disk files can carry symbol tables.
            if name.starts_with('/') {
                let file = old_files
                    .iter()
                    .chain(self.files.iter())
                    .find(|f| {
                        let f = f.borrow();
                        f.dev == parsed.dev && f.ino == parsed.ino && f.pname == name
                    })
                    .cloned()
                    .unwrap_or_else(|| {
                        Rc::new(RefCell::new(FileInfo::new(
                            name.clone(),
                            parsed.dev,
                            parsed.ino,
                        )))
                    });

                {
                    let mut f = file.borrow_mut();
                    f.refcount += 1;
                    // The first executable mapping of a file is its
                    // primary text mapping.
                    if f.file_map.is_none() && parsed.perms.contains(MapPerms::EXEC) {
                        f.file_map = Some(idx);
                    }
                }
                if !self.files.iter().any(|f| Rc::ptr_eq(f, &file)) {
                    self.files.push(Rc::clone(&file));
                }
                mapping.file = Some(file);
            }

            self.map_names.entry(name).or_default().push(idx);
            self.map_inum
                .entry((parsed.dev, parsed.ino))
                .or_default()
                .push(idx);

            debug!(
                "added mapping for {}: {:#x}({:#x})",
                mapping.name, mapping.start, mapping.size
            );
            self.mappings.push(mapping);
        }

        // old_files entries that no mapping revived die here.
        drop(old_files);

        self.info_valid = true;
        if !self.no_dyn {
            self.lmids_valid = false;
        }
    }

    /// Drop all mapping entries, dropping file refcounts, but keep the
    /// file-info list for revival by the next rebuild.
    fn mapping_purge(&mut self) {
        for m in self.mappings.drain(..) {
            if let Some(f) = m.file {
                let mut f = f.borrow_mut();
                f.refcount = f.refcount.saturating_sub(1);
                f.file_map = None;
                f.symsearch = None;
            }
        }
        self.map_names.clear();
        self.map_inum.clear();
        self.map_exec = None;
        self.map_ldso = None;
    }

    /// Whether the mapping cache is current.  False after an
    /// invalidating event (exec, fork/clone, linker activity) until the
    /// next query rebuilds it.
    pub fn maps_valid(&self) -> bool {
        self.info_valid
    }

    /// Throw away all mapping and file information.
    pub fn reset_maps(&mut self) {
        self.mapping_purge();
        self.files.clear();
        self.info_valid = false;
        self.lmids_valid = false;
    }

    pub(crate) fn symtab_release(&mut self) {
        self.reset_maps();
    }

    /// The index of the mapping covering `addr`, if any.
    pub(crate) fn addr_to_map_idx(&mut self, addr: u64) -> Option<usize> {
        self.update_maps();
        let idx = self
            .mappings
            .partition_point(|m| m.start + m.size <= addr);
        if idx < self.mappings.len() && self.mappings[idx].contains(addr) {
            Some(idx)
        } else {
            None
        }
    }

    /// The mapping covering `addr`.
    pub fn addr_to_map(&mut self, addr: u64) -> Option<&Mapping> {
        let idx = self.addr_to_map_idx(addr)?;
        Some(&self.mappings[idx])
    }

    /// All mappings backed by a given (device, inode) identity, however
    /// the file has been renamed since.
    pub fn dev_ino_to_maps(&mut self, dev: u64, ino: u64) -> Vec<usize> {
        self.update_maps();
        self.map_inum.get(&(dev, ino)).cloned().unwrap_or_default()
    }

    /// The primary text mapping of the object described by `spec`,
    /// within `lmid` (or any link map if `None`).
    pub(crate) fn object_to_map_idx(&mut self, lmid: Option<u64>, spec: ObjSpec) -> Option<usize> {
        self.update_maps();
        self.update_lmids();

        match spec {
            ObjSpec::Exec => self.map_exec,
            ObjSpec::Ldso => self.map_ldso,
            ObjSpec::Every => None,
            ObjSpec::Name(name) => {
                // An exact pathname hits the filename hash without a
                // scan (only when no lmid fence applies).
                if lmid.is_none() {
                    if let Some(idxs) = self.map_names.get(name) {
                        for &idx in idxs {
                            if let Some(file) = &self.mappings[idx].file {
                                if let Some(fmap) = file.borrow().file_map {
                                    return Some(fmap);
                                }
                            }
                        }
                    }
                }
                let base_wanted = name.rsplit('/').next().unwrap_or(name);
                for (idx, m) in self.mappings.iter().enumerate() {
                    let file = match &m.file {
                        Some(f) => f,
                        None => continue,
                    };
                    let f = file.borrow();
                    if f.file_map != Some(idx) {
                        continue;
                    }
                    if let (Some(want), Some(lo)) = (lmid, f.lo.as_ref()) {
                        if lo.lmid != want {
                            continue;
                        }
                    }
                    let pbase = f.pname.rsplit('/').next().unwrap_or(&f.pname);
                    if f.pname == name
                        || pbase == base_wanted
                        || f.lname.as_deref() == Some(name)
                        || f.lbase() == Some(base_wanted)
                    {
                        return Some(idx);
                    }
                }
                None
            }
        }
    }

    pub fn name_to_map(&mut self, name: &str) -> Option<&Mapping> {
        let idx = self.object_to_map_idx(None, ObjSpec::Name(name))?;
        Some(&self.mappings[idx])
    }

    pub fn lmid_to_map(&mut self, lmid: u64, name: &str) -> Option<&Mapping> {
        let idx = self.object_to_map_idx(Some(lmid), ObjSpec::Name(name))?;
        Some(&self.mappings[idx])
    }

    /// The name of the load object containing `addr` (the linker's name
    /// for it if known, else the backing path).
    pub fn objname(&mut self, addr: u64) -> Option<String> {
        let idx = self.addr_to_map_idx(addr)?;
        let m = &self.mappings[idx];
        let file = m.file.as_ref()?;
        let f = file.borrow();
        Some(f.lname.clone().unwrap_or_else(|| f.pname.clone()))
    }

    /// The link-map identifier of the object containing `addr`.
    pub fn lmid(&mut self, addr: u64) -> Option<u64> {
        self.update_maps();
        self.update_lmids();
        let idx = self.addr_to_map_idx(addr)?;
        let f = self.mappings[idx].file.as_ref()?.borrow();
        f.lo.as_ref().map(|lo| lo.lmid)
    }

    /// Iterate over the primary mappings of all load objects.
    pub fn object_iter<F>(&mut self, mut f: F) -> Result<usize>
    where
        F: FnMut(&Mapping, &str),
    {
        self.update_maps();
        self.update_lmids();
        let mut n = 0;
        for idx in 0..self.mappings.len() {
            let primary = {
                let m = &self.mappings[idx];
                match &m.file {
                    Some(file) => file.borrow().file_map == Some(idx),
                    None => false,
                }
            };
            if !primary {
                continue;
            }
            let m = &self.mappings[idx];
            let name = {
                let fi = m.file.as_ref().unwrap().borrow();
                fi.lname.clone().unwrap_or_else(|| fi.pname.clone())
            };
            f(m, &name);
            n += 1;
        }
        Ok(n)
    }

    /// Recompute load-object names and lmids for all mappings by walking
    /// the link maps.  Lazy: the linker agent itself looks up symbols in
    /// ld.so to check link-map consistency, and iteration requires that
    /// consistency, so this cannot run during the map rebuild itself.
    pub(crate) fn update_lmids(&mut self) {
        if !self.info_valid || self.noninvasive() || self.no_dyn || self.lmids_valid
            || self.lmids_updating
        {
            return;
        }

        let rap = match self.rtld_agent() {
            Ok(rap) => rap,
            Err(_) => return,
        };
        self.lmids_updating = true;

        let mut num = 0usize;
        let result = rap.loadobj_iter(self, &mut |p: &mut Process, lo: &LoadObj| {
            let n = num;
            num += 1;

            // The first object is the executable itself; the second is
            // the vdso, which has no backing file.
            let idx = if n == 0 {
                match p.map_exec {
                    Some(idx) => idx,
                    None => {
                        debug!(
                            "map_iter: executable mapping not found in maps for {}",
                            p.pid()
                        );
                        return true;
                    }
                }
            } else if n == 1 {
                return true;
            } else if lo.dyn_addr == 0 {
                return true;
            } else {
                match p.addr_to_map_idx(lo.dyn_addr) {
                    Some(idx) => idx,
                    None => {
                        debug!(
                            "map_iter: dynamic address {:#x} matches no mapping",
                            lo.dyn_addr
                        );
                        return true;
                    }
                }
            };

            let file = match p.mappings[idx].file.clone() {
                Some(f) => f,
                None => return true,
            };

            let lname = if n == 0 {
                // The C library populates the executable's load-object
                // name as an empty string; use the mapping's file name.
                Some(file.borrow().pname.clone())
            } else {
                p.read_string(4096, lo.nameaddr).ok()
            };

            let mut f = file.borrow_mut();
            if let Some(lname) = lname {
                if !lname.is_empty() || f.lname.is_none() {
                    f.lname = Some(lname);
                }
            }
            f.lo = Some(lo.clone());
            f.symsearch = None;
            true
        });

        self.lmids_updating = false;
        if let Err(e) = result {
            debug!("{}: lmid update failed: {}", self.pid(), e);
            return;
        }
        self.lmids_valid = true;
    }

    /// Compute the ordered symbol-search scope for a file, lazily.
    pub(crate) fn update_symsearch(&mut self, file: &Rc<RefCell<FileInfo>>) {
        if file.borrow().symsearch.is_some() || file.borrow().lo.is_none() {
            return;
        }

        let rap = match self.rap.clone() {
            Some(rap) => rap,
            None => return,
        };
        let lo = file.borrow().lo.clone().unwrap();

        let mut search = Vec::with_capacity(lo.scope.len());
        for i in 0..lo.scope.len() {
            // Skip scopes we cannot read out: the target may have mutated
            // them since the loadobj was captured.
            let scope_lo = match rap.get_scope(self, &lo, i) {
                Ok(Some(slo)) => slo,
                _ => {
                    debug!(
                        "cannot read scope {} in symbol search path for {:?}",
                        i,
                        file.borrow().lbase()
                    );
                    continue;
                }
            };

            if let Some(idx) = self.addr_to_map_idx(scope_lo.dyn_addr) {
                if let Some(sfile) = &self.mappings[idx].file {
                    search.push(Rc::downgrade(sfile));
                }
            }
        }

        file.borrow_mut().symsearch = Some(search);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_lines_parse() {
        let m = parse_maps_line(
            "7f1b2c000000-7f1b2c021000 r-xp 00010000 fd:01 396191 /usr/lib64/libc-2.28.so",
        )
        .unwrap();
        assert_eq!(m.start, 0x7f1b2c000000);
        assert_eq!(m.end, 0x7f1b2c021000);
        assert_eq!(m.perms, MapPerms::READ | MapPerms::EXEC);
        assert_eq!(m.offset, 0x10000);
        assert_eq!(m.ino, 396191);
        assert_eq!(m.name.as_deref(), Some("/usr/lib64/libc-2.28.so"));
    }

    #[test]
    fn maps_lines_with_spaces_and_anon() {
        let m = parse_maps_line("00400000-00452000 rw-s 00000000 08:02 173521 /tmp/a b c").unwrap();
        assert_eq!(m.name.as_deref(), Some("/tmp/a b c"));

        let anon = parse_maps_line("7ffc04b2f000-7ffc04b50000 rw-p 00000000 00:00 0").unwrap();
        assert!(anon.name.is_none());

        let stack =
            parse_maps_line("7ffc04b2f000-7ffc04b50000 rw-p 00000000 00:00 0 [stack]").unwrap();
        assert_eq!(stack.name.as_deref(), Some("[stack]"));
    }

    #[test]
    fn ldso_heuristic() {
        assert!(is_ldso_name("/lib64/ld-2.28.so"));
        assert!(is_ldso_name("/usr/lib64/ld-linux-x86-64.so.2"));
        assert!(!is_ldso_name("/usr/lib64/libc-2.28.so"));
        assert!(!is_ldso_name("/opt/ld-weird.so"));
    }

    #[test]
    fn self_maps_are_sorted_with_live_files() {
        let mut p = super::super::Process::grab(
            std::process::id() as libc::pid_t,
            super::super::Grab::Noninvasive,
            false,
        )
        .expect("cannot grab self");
        p.update_maps();

        assert!(!p.mappings.is_empty());
        for w in p.mappings.windows(2) {
            assert!(w[0].start + w[0].size <= w[1].start, "mappings overlap");
        }
        for m in &p.mappings {
            if let Some(f) = &m.file {
                assert!(f.borrow().refcount >= 1);
            }
        }
        // Our own executable must be found.
        assert!(p.map_exec.is_some());
    }
}
