//! End-to-end probe pipeline tests against a fake tracefs: populate from
//! files, enable by description, and inspect the emitted programs.

use std::fs;
use std::io::Write;

use utrace::bpf::dctx::{dmst_arg, pt_regs_off};
use utrace::bpf::insn::{BPF_DW, BPF_LDX, BPF_MEM, BPF_STX, R0, R1, R7, R8};
use utrace::bpf::Clause;
use utrace::probe::ProbeDesc;
use utrace::provider::{
    fbt::FbtProvider, proc::ProcProvider, rawtp::RawTpProvider, sched::SchedProvider,
    syscall_prov::SyscallProvider, ProviderOps,
};
use utrace::Session;

fn fake_tracefs() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("no tempdir");

    let mut f = fs::File::create(dir.path().join("available_filter_functions")).unwrap();
    writeln!(f, "vfs_read").unwrap();
    writeln!(f, "vfs_write").unwrap();
    writeln!(f, "e1000_probe [e1000]").unwrap();

    // The raw tracepoints the SDT providers mount their probes on.
    let mut f = fs::File::create(dir.path().join("available_events")).unwrap();
    for event in &[
        "sched:sched_process_fork",
        "sched:sched_process_exec",
        "sched:sched_process_exit",
        "sched:sched_switch",
        "sched:sched_wakeup",
        "sched:sched_wakeup_new",
        "signal:signal_generate",
        "signal:signal_deliver",
        "syscalls:sys_enter_read",
    ] {
        writeln!(f, "{}", event).unwrap();
    }

    let ev = dir.path().join("events/syscalls/sys_enter_read");
    fs::create_dir_all(&ev).unwrap();
    fs::write(ev.join("id"), "612\n").unwrap();
    fs::write(
        ev.join("format"),
        "name: sys_enter_read\nID: 612\nformat:\n\
         \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
         \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
         \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
         \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
         \tfield:int __syscall_nr;\toffset:8;\tsize:4;\tsigned:1;\n\
         \tfield:unsigned int fd;\toffset:16;\tsize:8;\tsigned:0;\n\
         \tfield:char * buf;\toffset:24;\tsize:8;\tsigned:0;\n\
         \tfield:size_t count;\toffset:32;\tsize:8;\tsigned:0;\n",
    )
    .unwrap();

    dir
}

fn session_with_fake_tracefs(dir: &tempfile::TempDir) -> Session {
    let mut stp = Session::new();
    stp.tracefs_root = dir.path().to_path_buf();
    FbtProvider.populate(&mut stp).unwrap();
    SyscallProvider.populate(&mut stp).unwrap();
    RawTpProvider.populate(&mut stp).unwrap();
    ProcProvider.populate(&mut stp).unwrap();
    SchedProvider.populate(&mut stp).unwrap();
    stp
}

#[test]
fn fbt_populates_entry_and_return_pairs() {
    let dir = fake_tracefs();
    let stp = session_with_fake_tracefs(&dir);

    for (module, func) in &[("vmlinux", "vfs_read"), ("vmlinux", "vfs_write"), ("e1000", "e1000_probe")] {
        for prb in &["entry", "return"] {
            assert!(
                stp.registry
                    .lookup(&ProbeDesc::new("fbt", module, func, prb))
                    .is_some(),
                "missing fbt:{}:{}:{}",
                module,
                func,
                prb
            );
        }
    }
}

#[test]
fn fbt_entry_trampoline_marshals_first_arg() {
    let dir = fake_tracefs();
    let mut stp = session_with_fake_tracefs(&dir);

    let ids = stp
        .enable(&ProbeDesc::parse("fbt:vmlinux:vfs_read:entry"))
        .unwrap();
    assert_eq!(ids.len(), 1);
    stp.add_clause(
        ids[0],
        Clause {
            func_id: 1,
            pred_id: None,
        },
    );

    let prog = stp.build_program(ids[0]).unwrap();

    // Somewhere in the program, the first parameter register is loaded
    // from the kernel pt_regs and stored into argv[0]: that is what
    // makes `trace(arg0)` see the caller's first argument.
    let insns = &prog.insns;
    let mut found = false;
    for w in insns.windows(2) {
        let load_arg0 = w[0].code == (BPF_LDX | BPF_MEM | BPF_DW)
            && w[0].src == R8
            && w[0].off == pt_regs_off::arg(0);
        let store_argv0 = w[1].code == (BPF_STX | BPF_MEM | BPF_DW)
            && w[1].dst == R7
            && w[1].off == dmst_arg(0);
        if load_arg0 && store_argv0 {
            found = true;
            break;
        }
    }
    assert!(found, "no arg0 marshalling sequence found");

    // And the clause is called through a relocation.
    assert_eq!(prog.relocs.len(), 1);
    assert_eq!(prog.relocs[0].func_id, 1);
}

#[test]
fn syscall_probes_report_format_args() {
    let dir = fake_tracefs();
    let mut stp = session_with_fake_tracefs(&dir);

    let id = stp
        .registry
        .lookup(&ProbeDesc::new("syscall", "vmlinux", "read", "entry"))
        .expect("syscall probe missing");

    let args = stp.probe_info(id).unwrap();
    assert_eq!(args.len(), 3);
    assert_eq!(args[0].native.as_deref(), Some("unsigned int"));
    assert_eq!(args[1].native.as_deref(), Some("char *"));
    assert_eq!(args[2].native.as_deref(), Some("size_t"));

    // The second query comes from the cache but must agree.
    let again = stp.probe_info(id).unwrap();
    assert_eq!(again.len(), 3);
}

#[test]
fn populate_then_close_leaves_nothing() {
    let dir = fake_tracefs();
    let mut stp = session_with_fake_tracefs(&dir);

    assert!(!stp.registry.is_empty());
    stp.close();
    assert!(stp.registry.is_empty());
}

#[test]
fn proc_create_mounts_on_its_rawtp_underlier() {
    let dir = fake_tracefs();
    let mut stp = session_with_fake_tracefs(&dir);

    let ids = stp.enable(&ProbeDesc::parse("proc:::create")).unwrap();
    assert_eq!(ids.len(), 1);

    // The fork tracepoint gained exactly this dependent and came along
    // enabled; the neighboring lifecycle tracepoints were left alone.
    let fork = stp
        .registry
        .lookup(&ProbeDesc::new("rawtp", "sched", "", "sched_process_fork"))
        .expect("fork rawtp missing");
    let fp = stp.registry.get(fork).unwrap();
    assert!(fp.enabled);
    assert_eq!(fp.dependents, vec![ids[0]]);

    let exit = stp
        .registry
        .lookup(&ProbeDesc::new("rawtp", "sched", "", "sched_process_exit"))
        .unwrap();
    assert!(!stp.registry.get(exit).unwrap().enabled);
    assert!(stp.registry.get(exit).unwrap().dependents.is_empty());

    // The syscalls group belongs to another provider; rawtp must not
    // have claimed it.
    assert!(stp
        .registry
        .lookup(&ProbeDesc::new("rawtp", "syscalls", "", "sys_enter_read"))
        .is_none());

    // End to end: a clause on the proc probe rides the underlier's
    // program through a relocation, the same way a directly-attached
    // clause would.
    stp.add_clause(
        ids[0],
        Clause {
            func_id: 21,
            pred_id: None,
        },
    );
    let prog = stp.build_program(fork).unwrap();
    assert_eq!(prog.relocs.len(), 1);
    assert_eq!(prog.relocs[0].func_id, 21);
}

#[test]
fn sched_off_cpu_swaps_the_switch_arguments() {
    let dir = fake_tracefs();
    let mut stp = session_with_fake_tracefs(&dir);

    let ids = stp.enable(&ProbeDesc::parse("sched:::off-cpu")).unwrap();
    assert_eq!(ids.len(), 1);
    stp.add_clause(
        ids[0],
        Clause {
            func_id: 31,
            pred_id: None,
        },
    );

    let switch = stp
        .registry
        .lookup(&ProbeDesc::new("rawtp", "sched", "", "sched_switch"))
        .expect("sched_switch rawtp missing");
    assert!(stp.registry.get(switch).unwrap().enabled);
    assert_eq!(stp.registry.get(switch).unwrap().dependents, vec![ids[0]]);

    let prog = stp.build_program(switch).unwrap();
    assert_eq!(prog.relocs.len(), 1);
    assert_eq!(prog.relocs[0].func_id, 31);

    // The dependent's rewrite runs on the underlier's program:
    // sched_switch(preempt, prev, next) is presented with the incoming
    // task first, so argv[0] and argv[2] trade places.
    let ld = BPF_LDX | BPF_MEM | BPF_DW;
    let st = BPF_STX | BPF_MEM | BPF_DW;
    let mut swapped = false;
    for w in prog.insns.windows(4) {
        if w[0].code == ld
            && w[0].dst == R0
            && w[0].src == R7
            && w[0].off == dmst_arg(0)
            && w[1].code == ld
            && w[1].dst == R1
            && w[1].src == R7
            && w[1].off == dmst_arg(2)
            && w[2].code == st
            && w[2].dst == R7
            && w[2].off == dmst_arg(2)
            && w[2].src == R0
            && w[3].code == st
            && w[3].dst == R7
            && w[3].off == dmst_arg(0)
            && w[3].src == R1
        {
            swapped = true;
            break;
        }
    }
    assert!(swapped, "no argv[0] <-> argv[2] exchange in the emitted program");
}
