//! Thin wrappers over the bpf(2) and perf_event_open(2) syscalls, plus
//! the attach ioctl.  Only the commands the providers use.

use log::debug;
use nix::errno::Errno;
use std::os::unix::io::RawFd;

use super::insn::Program;
use crate::error::{Error, Result};

const BPF_PROG_LOAD: libc::c_int = 5;
const BPF_RAW_TRACEPOINT_OPEN: libc::c_int = 17;

/// BPF program types, per provider family.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProgType {
    Kprobe,
    Tracepoint,
    PerfEvent,
    RawTracepoint,
}

impl ProgType {
    fn raw(self) -> u32 {
        match self {
            ProgType::Kprobe => 2,
            ProgType::Tracepoint => 5,
            ProgType::PerfEvent => 7,
            ProgType::RawTracepoint => 17,
        }
    }
}

#[repr(C)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
}

#[repr(C)]
struct RawTracepointAttr {
    name: u64,
    prog_fd: u32,
}

fn bpf(cmd: libc::c_int, attr: *const libc::c_void, size: usize) -> Result<RawFd> {
    let fd = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size) };
    if fd < 0 {
        return Err(Errno::last().into());
    }
    Ok(fd as RawFd)
}

/// Load an assembled program.  On verifier rejection the (truncated) log
/// is surfaced in the error.
pub fn prog_load(prog_type: ProgType, prog: &Program) -> Result<RawFd> {
    let image = prog.encoded();
    let license = b"GPL\0";
    let mut log = vec![0u8; 64 * 1024];

    let attr = ProgLoadAttr {
        prog_type: prog_type.raw(),
        insn_cnt: image.len() as u32,
        insns: image.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: 1,
        log_size: log.len() as u32,
        log_buf: log.as_mut_ptr() as u64,
        kern_version: 0,
        prog_flags: 0,
    };

    match bpf(
        BPF_PROG_LOAD,
        &attr as *const _ as *const libc::c_void,
        std::mem::size_of::<ProgLoadAttr>(),
    ) {
        Ok(fd) => Ok(fd),
        Err(Error::Sys(Errno::EACCES)) | Err(Error::Sys(Errno::EINVAL)) => {
            let end = log.iter().position(|&b| b == 0).unwrap_or(0);
            let text = String::from_utf8_lossy(&log[..end]).into_owned();
            debug!("BPF verifier log:\n{}", text);
            Err(Error::Verifier(text))
        }
        Err(e) => Err(e),
    }
}

/// Attach a loaded program to a raw tracepoint by name.
pub fn raw_tracepoint_open(name: &str, prog_fd: RawFd) -> Result<RawFd> {
    let cname = std::ffi::CString::new(name).map_err(|_| Error::Sys(Errno::EINVAL))?;
    let attr = RawTracepointAttr {
        name: cname.as_ptr() as u64,
        prog_fd: prog_fd as u32,
    };
    bpf(
        BPF_RAW_TRACEPOINT_OPEN,
        &attr as *const _ as *const libc::c_void,
        std::mem::size_of::<RawTracepointAttr>(),
    )
}

// perf_event_attr, with the fields the providers set.  The kernel copies
// exactly `size` bytes, so trailing fields we never touch can be absent.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// sample_period / sample_freq.
    pub sample: u64,
    pub sample_type: u64,
    pub read_format: u64,
    /// Bitfield; bit 10 is `freq`.
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
}

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;

pub const PERF_FLAG_FREQ: u64 = 1 << 10;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_SET_BPF: libc::c_ulong = 0x4004_2408;

impl PerfEventAttr {
    /// A tracepoint event firing on every hit.
    pub fn tracepoint(event_id: u64) -> PerfEventAttr {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.type_ = PERF_TYPE_TRACEPOINT;
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.config = event_id;
        attr.sample = 1;
        attr.wakeup_events = 1;
        attr
    }

    /// A timer firing every `period_ns` nanoseconds.
    pub fn cpu_clock(period_ns: u64) -> PerfEventAttr {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.type_ = PERF_TYPE_SOFTWARE;
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.config = PERF_COUNT_SW_CPU_CLOCK;
        attr.sample = period_ns;
        attr.wakeup_events = 1;
        attr
    }

    /// A hardware counter overflowing every `count` events.
    pub fn hardware(config: u64, count: u64) -> PerfEventAttr {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.config = config;
        attr.sample = count;
        attr.wakeup_events = 1;
        attr
    }
}

/// Open a perf event.
pub fn perf_event_open(
    attr: &PerfEventAttr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: RawFd,
) -> Result<RawFd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            0usize, // flags
        )
    };
    if fd < 0 {
        return Err(Errno::last().into());
    }
    Ok(fd as RawFd)
}

/// Attach a loaded BPF program to a perf event and enable it.
pub fn perf_attach_bpf(event_fd: RawFd, bpf_fd: RawFd) -> Result<()> {
    if unsafe { libc::ioctl(event_fd, PERF_EVENT_IOC_SET_BPF, bpf_fd) } < 0 {
        return Err(Errno::last().into());
    }
    if unsafe { libc::ioctl(event_fd, PERF_EVENT_IOC_ENABLE, 0) } < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

/// Number of possible CPUs, for per-CPU event fans.
pub fn ncpus() -> usize {
    match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) } {
        n if n > 0 => n as usize,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_constructors_fill_the_basics() {
        let tp = PerfEventAttr::tracepoint(1234);
        assert_eq!(tp.type_, PERF_TYPE_TRACEPOINT);
        assert_eq!(tp.config, 1234);
        assert_eq!(tp.sample, 1);
        assert_eq!(tp.size as usize, std::mem::size_of::<PerfEventAttr>());

        let clock = PerfEventAttr::cpu_clock(1_000_000);
        assert_eq!(clock.type_, PERF_TYPE_SOFTWARE);
        assert_eq!(clock.sample, 1_000_000);
    }
}
