//! End-to-end process-control tests.  These fork and ptrace real
//! children, so each one bails out quietly (rather than failing) in
//! sandboxes where that is not permitted.

use std::cell::Cell;
use std::rc::Rc;

use utrace::proc::auxv::AT_ENTRY;
use utrace::{Process, ProcessState, ReleaseMode};

fn create(path: &str, argv: &[&str]) -> Option<Process> {
    let _ = env_logger::builder().is_test(true).try_init();
    match Process::create(path, argv) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("skipping: cannot create and seize a tracee here: {}", e);
            None
        }
    }
}

/// Drive the state machine until the process dies (or give up).
fn wait_until_dead(p: &mut Process) {
    for _ in 0..1000 {
        if p.state() == ProcessState::Dead {
            return;
        }
        let _ = p.wait(true);
    }
}

#[test]
fn create_and_trace_exec() {
    let mut p = match create("/bin/true", &["true"]) {
        Some(p) => p,
        None => return,
    };

    // Creation leaves the child trace-stopped at its exec.
    assert_eq!(p.state(), ProcessState::TraceStop);

    p.untrace(false);
    wait_until_dead(&mut p);
    assert_eq!(p.state(), ProcessState::Dead);

    p.release(ReleaseMode::Normal);
}

#[test]
fn trace_untrace_balance_restores_run() {
    let mut p = match create("/bin/sleep", &["sleep", "30"]) {
        Some(p) => p,
        None => return,
    };

    p.untrace(false);
    assert_eq!(p.state(), ProcessState::Run);

    // A nested stop request and its balancing release return the
    // process to where it was.
    p.trace(true).expect("cannot re-stop the tracee");
    assert_eq!(p.state(), ProcessState::TraceStop);
    p.untrace(false);
    assert_eq!(p.state(), ProcessState::Run);

    p.release(ReleaseMode::Kill);
}

#[test]
fn breakpoint_leaves_instruction_stream_unchanged() {
    let mut p = match create("/bin/true", &["true"]) {
        Some(p) => p,
        None => return,
    };

    let entry = match p.getauxval(AT_ENTRY) {
        Some(e) => e,
        None => {
            p.release(ReleaseMode::Kill);
            return;
        }
    };

    let mut before = [0u8; 8];
    assert_eq!(p.read(&mut before, entry).unwrap(), 8);

    p.bkpt(entry, false, |_, _| ProcessState::TraceStop)
        .expect("cannot install breakpoint");

    let mut armed = [0u8; 8];
    assert_eq!(p.read(&mut armed, entry).unwrap(), 8);
    assert_ne!(before, armed, "breakpoint did not change the text");

    p.unbkpt(entry);

    let mut after = [0u8; 8];
    assert_eq!(p.read(&mut after, entry).unwrap(), 8);
    assert_eq!(before, after, "original instruction not restored");

    p.release(ReleaseMode::Kill);
}

#[test]
fn breakpoint_fires_once_and_program_continues() {
    let mut p = match create("/bin/true", &["true"]) {
        Some(p) => p,
        None => return,
    };

    let entry = match p.getauxval(AT_ENTRY) {
        Some(e) => e,
        None => {
            p.release(ReleaseMode::Kill);
            return;
        }
    };

    let hits = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&hits);
    p.bkpt(entry, false, move |_, _| {
        counter.set(counter.get() + 1);
        ProcessState::Run
    })
    .expect("cannot install breakpoint");

    p.untrace(false);
    wait_until_dead(&mut p);

    assert_eq!(hits.get(), 1, "entry breakpoint fired {} times", hits.get());
    p.release(ReleaseMode::Normal);
}

#[test]
fn rtld_agent_iterates_consistent_link_maps() {
    let mut p = match create("/bin/sleep", &["sleep", "30"]) {
        Some(p) => p,
        None => return,
    };

    // At the exec stop, the dynamic linker has not run: link maps are
    // not ready, and saying so is the contract.
    let rap = match p.rtld_agent() {
        Ok(rap) => rap,
        Err(e) => {
            eprintln!("skipping: no rtld agent: {}", e);
            p.release(ReleaseMode::Kill);
            return;
        }
    };
    if !rap.maps_ready() {
        let res = rap.loadobj_iter(&mut p, &mut |_, _| true);
        assert!(res.is_err(), "iteration over unready maps succeeded");
    }

    // Let the linker initialize; the agent's entry-point notifier marks
    // the maps ready.
    p.untrace(false);
    for _ in 0..1000 {
        if rap.maps_ready() || p.state() == ProcessState::Dead {
            break;
        }
        let _ = p.wait(true);
    }
    if !rap.maps_ready() {
        eprintln!("skipping: linker never initialized (static /bin/sleep?)");
        p.release(ReleaseMode::Kill);
        return;
    }

    // Iterate: every object's dynamic section must point into a mapping
    // we currently know, or the view is torn.
    p.trace(true).expect("cannot stop for iteration");
    let mut names = Vec::new();
    let mut dyns = Vec::new();
    rap.loadobj_iter(&mut p, &mut |p, lo| {
        if lo.nameaddr != 0 {
            if let Ok(name) = p.read_string(4096, lo.nameaddr) {
                names.push(name);
            }
        }
        dyns.push(lo.dyn_addr);
        true
    })
    .expect("link map iteration failed");

    assert!(!dyns.is_empty());
    for d in dyns.into_iter().skip(2) {
        // (The executable and vdso are special.)
        if d != 0 {
            assert!(
                p.addr_to_map(d).is_some(),
                "l_ld {:#x} points outside every known mapping",
                d
            );
        }
    }
    assert!(
        names.iter().any(|n| n.contains("libc")),
        "libc not among loaded objects: {:?}",
        names
    );

    p.untrace(false);
    p.release(ReleaseMode::Kill);
}

#[test]
fn symbols_resolve_in_live_target() {
    let mut p = match create("/bin/sleep", &["sleep", "30"]) {
        Some(p) => p,
        None => return,
    };

    p.update_maps();
    let sym = p.lookup_by_name("clock_nanosleep").or_else(|| p.lookup_by_name("nanosleep"));
    if let Some(sym) = sym {
        assert!(sym.value != 0);
        if sym.size > 0 {
            let back = p.lookup_by_addr(sym.value).expect("address lookup failed");
            assert!(back.value <= sym.value && sym.value < back.value + back.size.max(1));
        }
    }

    p.release(ReleaseMode::Kill);
}
