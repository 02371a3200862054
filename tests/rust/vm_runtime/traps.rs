use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

use mit_vm_runtime::builtins::{core_extras, libc, mit, selector, Library, TrapError};
use mit_vm_runtime::bytecode::Word;
use mit_vm_runtime::{Assembler, ExecutionConfig, HostIo, Machine, Opcode, Traps, VmError};

const THROW: Word = selector(core_extras::LIBRARY, core_extras::THROW);
const BUFFER: Word = 0x400;

/// Output sink the test can read back after the machine owns a clone.
#[derive(Clone, Default)]
struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn config() -> ExecutionConfig {
    ExecutionConfig {
        memory_bytes: 4096,
        stack_words: 64,
        ..ExecutionConfig::default()
    }
}

fn run(asm: Assembler, vm: &mut Machine) -> Result<(), VmError> {
    asm.finish().unwrap().load_into(vm).unwrap();
    vm.run()
}

fn halting(build: impl FnOnce(&mut Assembler)) -> Assembler {
    let mut asm = Assembler::new(0);
    build(&mut asm);
    asm.push(0).extra(THROW);
    asm
}

#[test]
fn zero_form_extra_takes_selector_from_stack() {
    let mut asm = Assembler::new(0);
    asm.push(0).push(THROW);
    asm.op(Opcode::Extra).unwrap();
    let mut vm = Machine::new(config());

    run(asm, &mut vm).expect("THROW 0 halts");
    // A trap that stops the machine leaves its selector where it was.
    assert_eq!(vm.stack(), &[0, THROW]);
}

#[test]
fn unknown_library_and_function_are_reported() {
    let mut vm = Machine::new(config());
    let error = run(halting(|asm| { asm.extra(selector(9, 0)); }), &mut vm)
        .expect_err("library 9 does not exist");
    assert_eq!(error, VmError::Trap(TrapError::InvalidLibrary(9)));
    assert_eq!(error.code(), -15);
    assert_eq!(vm.bad(), 9);

    let mut vm = Machine::new(config());
    let error = run(
        halting(|asm| {
            asm.extra(selector(core_extras::LIBRARY, 0x55));
        }),
        &mut vm,
    )
    .expect_err("function 0x55 does not exist");
    assert_eq!(error, VmError::Trap(TrapError::InvalidFunction(0x55)));
    assert_eq!(error.code(), -16);
}

#[test]
fn arguments_are_visible_to_programs() {
    let mut vm = Machine::new(config());
    vm.register_args(["mit", "hello"]);
    let asm = halting(|asm| {
        asm.extra(selector(core_extras::LIBRARY, core_extras::ARGC));
        asm.push(1)
            .extra(selector(core_extras::LIBRARY, core_extras::ARG_LEN));
        asm.push(1)
            .push(BUFFER)
            .extra(selector(core_extras::LIBRARY, core_extras::ARG_COPY));
        asm.push(7)
            .extra(selector(core_extras::LIBRARY, core_extras::ARG_LEN));
    });

    run(asm, &mut vm).expect("program halts");
    assert_eq!(vm.stack(), &[2, 5, 5, -1, 0]);
    assert_eq!(&vm.memory()[0x400..0x405], b"hello");
    assert_eq!(vm.args(), ["mit", "hello"]);
}

#[test]
fn libc_streams_go_through_host_io() {
    let output = SharedOutput::default();
    let mut vm = Machine::new(config()).with_io(HostIo::new(
        Cursor::new(b"hi".to_vec()),
        output.clone(),
    ));
    let asm = halting(|asm| {
        asm.extra(selector(libc::LIBRARY, libc::GETCHAR));
        asm.extra(selector(libc::LIBRARY, libc::PUTCHAR));
        asm.extra(selector(libc::LIBRARY, libc::GETCHAR));
        asm.extra(selector(libc::LIBRARY, libc::GETCHAR));
        asm.extra(selector(libc::LIBRARY, libc::FLUSH));
    });

    run(asm, &mut vm).expect("program halts");
    assert_eq!(vm.stack(), &[104, 105, -1, 0, 0]);
    assert_eq!(output.contents(), b"h");
}

#[test]
fn read_and_write_move_blocks_of_bytes() {
    let output = SharedOutput::default();
    let mut vm = Machine::new(config()).with_io(HostIo::new(
        Cursor::new(b"abc".to_vec()),
        output.clone(),
    ));
    let asm = halting(|asm| {
        asm.push(BUFFER)
            .push(3)
            .extra(selector(libc::LIBRARY, libc::READ));
        asm.push(BUFFER)
            .push(3)
            .extra(selector(libc::LIBRARY, libc::WRITE));
    });

    run(asm, &mut vm).expect("program halts");
    assert_eq!(vm.stack(), &[3, 3, 0]);
    assert_eq!(output.contents(), b"abc");
    assert_eq!(&vm.memory()[0x400..0x403], b"abc");
}

#[test]
fn child_state_lifecycle() {
    // Child code: PUSHI_0 then THROW inline.
    let child_code = {
        let mut asm = Assembler::new(0);
        asm.push(0).extra(THROW);
        asm.finish().unwrap().words[0]
    };
    let trap = |function| selector(mit::LIBRARY, function);

    let mut vm = Machine::new(config());
    let asm = halting(|asm| {
        asm.push(1024).push(16).extra(trap(mit::NEW_STATE));
        asm.push(child_code)
            .push(0)
            .push(1)
            .extra(trap(mit::STORE_WORD));
        asm.push(1).extra(trap(mit::RUN));
        asm.push(1).extra(trap(mit::GET_PC));
        asm.push(1).extra(trap(mit::GET_STACK_DEPTH));
    });
    run(asm, &mut vm).expect("program halts");
    assert_eq!(vm.stack(), &[1, 0, 0, 8, 1, 0]);

    let child = vm.child(1).expect("handle 1 is live");
    assert_eq!(child.memory_size(), 1024);
    assert_eq!(child.stack_words(), 16);
    assert_eq!(child.stack(), &[0]);
    assert_eq!(child.pc(), 8);
}

#[test]
fn child_stack_and_memory_are_reachable_from_the_parent() {
    let trap = |function| selector(mit::LIBRARY, function);
    let mut vm = Machine::new(config());
    let asm = halting(|asm| {
        asm.push(256).push(4).extra(trap(mit::NEW_STATE));
        asm.push(11).push(1).extra(trap(mit::PUSH_STACK));
        asm.push(1).extra(trap(mit::POP_STACK));
        asm.push(1).extra(trap(mit::POP_STACK));
        asm.push(-8).push(1).extra(trap(mit::LOAD_WORD));
        asm.push(1).extra(trap(mit::FREE_STATE));
    });
    run(asm, &mut vm).expect("program halts");
    // PUSH_STACK ok, POP_STACK 11, POP_STACK underflow, LOAD_WORD out of range.
    assert_eq!(vm.stack(), &[1, 0, 11, 0, 0, -3, 0, -5, 0]);
    assert!(vm.child(1).is_none());
}

#[test]
fn copy_to_moves_parent_memory_into_the_child() {
    let trap = |function| selector(mit::LIBRARY, function);
    let mut vm = Machine::new(config());
    vm.memory_mut()[0x400..0x408].copy_from_slice(&0x1234_5678_i64.to_ne_bytes());
    let asm = halting(|asm| {
        asm.push(64).push(4).extra(trap(mit::NEW_STATE));
        asm.push(BUFFER)
            .push(16)
            .push(8)
            .push(1)
            .extra(trap(mit::COPY_TO));
        asm.push(BUFFER)
            .push(64)
            .push(8)
            .push(1)
            .extra(trap(mit::COPY_TO));
    });
    run(asm, &mut vm).expect("program halts");
    assert_eq!(vm.stack(), &[1, 0, -6, 0]);
    assert_eq!(vm.child(1).unwrap().load_word(16), Ok(0x1234_5678));
}

#[test]
fn bad_handles_and_sizes() {
    let trap = |function| selector(mit::LIBRARY, function);

    let mut vm = Machine::new(config());
    let error = run(
        halting(|asm| {
            asm.push(5).extra(trap(mit::GET_PC));
        }),
        &mut vm,
    )
    .expect_err("handle 5 was never created");
    assert_eq!(error, VmError::Trap(TrapError::InvalidHandle(5)));
    assert_eq!(error.code(), -17);
    assert_eq!(vm.stack(), &[5]);

    let mut vm = Machine::new(config());
    let asm = halting(|asm| {
        asm.push(-1).push(16).extra(trap(mit::NEW_STATE));
    });
    run(asm, &mut vm).expect("NEW_STATE reports failure as handle 0");
    assert_eq!(vm.stack(), &[0, 0]);
}

#[test]
fn custom_libraries_can_be_registered() {
    fn answer(vm: &mut Machine) -> Result<(), VmError> {
        vm.push(42)?;
        Ok(())
    }

    let mut traps = Traps::standard();
    traps.register(5, Library::new("answers").with(0, "ANSWER", answer));
    let names: Vec<_> = traps
        .descriptors()
        .into_iter()
        .map(|library| library.name)
        .collect();
    assert_eq!(names, ["core", "libc", "mit", "answers"]);

    let mut vm = Machine::with_traps(config(), Arc::new(traps));
    run(halting(|asm| { asm.extra(selector(5, 0)); }), &mut vm).expect("program halts");
    assert_eq!(vm.stack(), &[42, 0]);
}
