//! Extra instructions: the trap libraries reachable through `EXTRA`.
//!
//! An `EXTRA` selector names a library in its upper bits and a function in
//! its low byte.  Libraries are plain tables of function pointers; a machine
//! holds its table behind an `Arc` so child states share it.  Each handler
//! works directly on the machine and validates every stack and memory access
//! it needs before it changes anything, which keeps failing traps free of
//! side effects like every other instruction.
//!
//! Three libraries are installed by [`Traps::standard`]:
//!
//! * [`core_extras`] (library 0): `THROW` and the command-line arguments.
//! * [`libc`] (library 1): byte I/O over the machine's [`HostIo`] streams.
//! * [`mit`] (library 2): creation and control of child machines.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bytecode::{UWord, Word};
use crate::interpreter::{ExecutionConfig, Machine, VmError};
use crate::memory::MemoryError;
use crate::stack::StackError;

/// Library 0.
pub mod core_extras {
    use crate::bytecode::Word;

    pub const LIBRARY: Word = 0;
    pub const THROW: Word = 1;
    pub const ARGC: Word = 2;
    pub const ARG_LEN: Word = 3;
    pub const ARG_COPY: Word = 4;
}

/// Library 1.
pub mod libc {
    use crate::bytecode::Word;

    pub const LIBRARY: Word = 1;
    pub const GETCHAR: Word = 0;
    pub const PUTCHAR: Word = 1;
    pub const READ: Word = 2;
    pub const WRITE: Word = 3;
    pub const FLUSH: Word = 4;
}

/// Library 2.
pub mod mit {
    use crate::bytecode::Word;

    pub const LIBRARY: Word = 2;
    pub const NEW_STATE: Word = 0;
    pub const FREE_STATE: Word = 1;
    pub const RUN: Word = 2;
    pub const SINGLE_STEP: Word = 3;
    pub const GET_PC: Word = 4;
    pub const SET_PC: Word = 5;
    pub const GET_IR: Word = 6;
    pub const SET_IR: Word = 7;
    pub const GET_BAD: Word = 8;
    pub const GET_STACK_DEPTH: Word = 9;
    pub const PUSH_STACK: Word = 10;
    pub const POP_STACK: Word = 11;
    pub const LOAD_WORD: Word = 12;
    pub const STORE_WORD: Word = 13;
    pub const COPY_TO: Word = 14;
}

/// Combine a library and function number into an `EXTRA` selector.
pub const fn selector(library: Word, function: Word) -> Word {
    (library << 8) | (function & 0xff)
}

/// Trap dispatch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrapError {
    #[error("unknown trap library {0}")]
    InvalidLibrary(Word),
    #[error("unknown trap function {0}")]
    InvalidFunction(Word),
    #[error("unknown machine handle {0}")]
    InvalidHandle(Word),
}

impl TrapError {
    pub fn bad(&self) -> Word {
        match self {
            TrapError::InvalidLibrary(value)
            | TrapError::InvalidFunction(value)
            | TrapError::InvalidHandle(value) => *value,
        }
    }
}

pub type TrapFn = fn(&mut Machine) -> Result<(), VmError>;

/// A named table of trap functions.
#[derive(Debug, Clone)]
pub struct Library {
    name: String,
    functions: BTreeMap<Word, (String, TrapFn)>,
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
        }
    }

    pub fn with(mut self, function: Word, name: impl Into<String>, handler: TrapFn) -> Self {
        self.functions.insert(function, (name.into(), handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, function: Word) -> Option<TrapFn> {
        self.functions.get(&function).map(|(_, handler)| *handler)
    }
}

/// Registry of trap libraries keyed by library number.
#[derive(Debug, Clone, Default)]
pub struct Traps {
    libraries: BTreeMap<Word, Library>,
}

impl Traps {
    /// No libraries; every `EXTRA` fails with `InvalidLibrary`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Construct the default registry used by the interpreter.
    pub fn standard() -> Self {
        let mut traps = Self::empty();
        traps.register(
            core_extras::LIBRARY,
            Library::new("core")
                .with(core_extras::THROW, "THROW", throw)
                .with(core_extras::ARGC, "ARGC", argc)
                .with(core_extras::ARG_LEN, "ARG_LEN", arg_len)
                .with(core_extras::ARG_COPY, "ARG_COPY", arg_copy),
        );
        traps.register(
            libc::LIBRARY,
            Library::new("libc")
                .with(libc::GETCHAR, "GETCHAR", getchar)
                .with(libc::PUTCHAR, "PUTCHAR", putchar)
                .with(libc::READ, "READ", read)
                .with(libc::WRITE, "WRITE", write)
                .with(libc::FLUSH, "FLUSH", flush),
        );
        traps.register(
            mit::LIBRARY,
            Library::new("mit")
                .with(mit::NEW_STATE, "NEW_STATE", new_state)
                .with(mit::FREE_STATE, "FREE_STATE", free_state)
                .with(mit::RUN, "RUN", run_child)
                .with(mit::SINGLE_STEP, "SINGLE_STEP", single_step)
                .with(mit::GET_PC, "GET_PC", get_pc)
                .with(mit::SET_PC, "SET_PC", set_pc)
                .with(mit::GET_IR, "GET_IR", get_ir)
                .with(mit::SET_IR, "SET_IR", set_ir)
                .with(mit::GET_BAD, "GET_BAD", get_bad)
                .with(mit::GET_STACK_DEPTH, "GET_STACK_DEPTH", get_stack_depth)
                .with(mit::PUSH_STACK, "PUSH_STACK", push_stack)
                .with(mit::POP_STACK, "POP_STACK", pop_stack)
                .with(mit::LOAD_WORD, "LOAD_WORD", load_word)
                .with(mit::STORE_WORD, "STORE_WORD", store_word)
                .with(mit::COPY_TO, "COPY_TO", copy_to),
        );
        traps
    }

    /// Install `library`, returning any library it replaces.
    pub fn register(&mut self, number: Word, library: Library) -> Option<Library> {
        self.libraries.insert(number, library)
    }

    pub fn resolve(&self, selector: Word) -> Result<TrapFn, TrapError> {
        let (library, function) = (selector >> 8, selector & 0xff);
        self.libraries
            .get(&library)
            .ok_or(TrapError::InvalidLibrary(library))?
            .get(function)
            .ok_or(TrapError::InvalidFunction(function))
    }
}

/// Lightweight serialisable descriptor of one library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryDescriptor {
    pub number: Word,
    pub name: String,
    pub functions: Vec<(Word, String)>,
}

impl Traps {
    /// Return the registered libraries for documentation and telemetry.
    pub fn descriptors(&self) -> Vec<LibraryDescriptor> {
        self.libraries
            .iter()
            .map(|(number, library)| LibraryDescriptor {
                number: *number,
                name: library.name.clone(),
                functions: library
                    .functions
                    .iter()
                    .map(|(function, (name, _))| (*function, name.clone()))
                    .collect(),
            })
            .collect()
    }
}

/// Byte streams used by the `libc` library.
pub struct HostIo {
    pub input: Box<dyn Read + Send>,
    pub output: Box<dyn Write + Send>,
}

impl HostIo {
    pub fn new(input: impl Read + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Self {
            input: Box::new(input),
            output: Box::new(output),
        }
    }

    /// The process's standard input and output.
    pub fn standard() -> Self {
        Self::new(io::stdin(), io::stdout())
    }

    /// End-of-file input and discarded output.
    pub fn empty() -> Self {
        Self::new(io::empty(), io::sink())
    }
}

impl fmt::Debug for HostIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostIo").finish_non_exhaustive()
    }
}

/// Run the trap named by `inline`, or by the popped stack top when `None`.
/// A failing zero-form call leaves its selector on the stack.
pub(crate) fn dispatch_extra(vm: &mut Machine, inline: Option<Word>) -> Result<(), VmError> {
    match inline {
        Some(selector) => {
            let handler = vm.traps.resolve(selector)?;
            handler(vm)
        }
        None => {
            let selector = vm.stack.load(0)?;
            let handler = vm.traps.resolve(selector)?;
            vm.stack.pop()?;
            let result = handler(vm);
            if result.is_err() {
                vm.stack.push(selector)?;
            }
            result
        }
    }
}

impl Machine {
    /// Check a trap's stack effect and read its `N` arguments, bottom first.
    fn trap_args<const N: usize>(&self, results: u64) -> Result<[Word; N], StackError> {
        self.stack.check_effect(N as u64, results)?;
        let mut args = [0; N];
        for (index, slot) in args.iter_mut().enumerate() {
            *slot = self.stack.load((N - 1 - index) as u64)?;
        }
        Ok(args)
    }

    /// Replace `args` stack words with `results`, bottom first.
    fn trap_results(&mut self, args: usize, results: &[Word]) -> Result<(), StackError> {
        self.stack.adjust(results.len() as i64 - args as i64)?;
        for (index, value) in results.iter().enumerate() {
            self.stack.store((results.len() - 1 - index) as u64, *value)?;
        }
        Ok(())
    }
}

fn byte_len(address: Word, len: Word) -> Result<usize, MemoryError> {
    usize::try_from(len).map_err(|_| MemoryError::InvalidRead {
        address: address as UWord,
    })
}

fn code_of<T, E: Into<VmError>>(result: Result<T, E>) -> Word {
    match result {
        Ok(_) => 0,
        Err(error) => error.into().code(),
    }
}

fn throw(vm: &mut Machine) -> Result<(), VmError> {
    let [code] = vm.trap_args::<1>(1)?;
    if code == 0 {
        Err(VmError::Halt)
    } else {
        Err(VmError::Thrown(code))
    }
}

fn argc(vm: &mut Machine) -> Result<(), VmError> {
    vm.trap_args::<0>(1)?;
    let argc = vm.args.len() as Word;
    Ok(vm.trap_results(0, &[argc])?)
}

fn arg(args: &[String], index: Word) -> Option<&String> {
    usize::try_from(index).ok().and_then(|index| args.get(index))
}

fn arg_len(vm: &mut Machine) -> Result<(), VmError> {
    let [index] = vm.trap_args::<1>(1)?;
    let len = arg(&vm.args, index).map_or(-1, |arg| arg.len() as Word);
    Ok(vm.trap_results(1, &[len])?)
}

fn arg_copy(vm: &mut Machine) -> Result<(), VmError> {
    let [index, address] = vm.trap_args::<2>(1)?;
    let copied = match arg(&vm.args, index) {
        Some(arg) => {
            let bytes = arg.as_bytes();
            vm.memory
                .slice_mut(address as UWord, bytes.len())?
                .copy_from_slice(bytes);
            bytes.len() as Word
        }
        None => -1,
    };
    Ok(vm.trap_results(2, &[copied])?)
}

fn getchar(vm: &mut Machine) -> Result<(), VmError> {
    vm.trap_args::<0>(1)?;
    let mut byte = [0u8];
    let c = match vm.io.input.read(&mut byte) {
        Ok(1) => byte[0] as Word,
        _ => -1,
    };
    Ok(vm.trap_results(0, &[c])?)
}

fn putchar(vm: &mut Machine) -> Result<(), VmError> {
    let [c] = vm.trap_args::<1>(1)?;
    let written = match vm.io.output.write_all(&[c as u8]) {
        Ok(()) => c,
        Err(_) => -1,
    };
    Ok(vm.trap_results(1, &[written])?)
}

fn read(vm: &mut Machine) -> Result<(), VmError> {
    let [address, len] = vm.trap_args::<2>(1)?;
    // No amount of growth accepts a negative length.
    let len = byte_len(address, len).map_err(|_| MemoryError::InvalidWrite {
        address: address as UWord,
        end: None,
    })?;
    let buffer = vm.memory.slice_mut(address as UWord, len)?;
    let n = vm.io.input.read(buffer).map_or(-1, |n| n as Word);
    Ok(vm.trap_results(2, &[n])?)
}

fn write(vm: &mut Machine) -> Result<(), VmError> {
    let [address, len] = vm.trap_args::<2>(1)?;
    let buffer = vm.memory.slice(address as UWord, byte_len(address, len)?)?;
    let n = vm.io.output.write(buffer).map_or(-1, |n| n as Word);
    Ok(vm.trap_results(2, &[n])?)
}

fn flush(vm: &mut Machine) -> Result<(), VmError> {
    vm.trap_args::<0>(1)?;
    let status = vm.io.output.flush().map_or(-1, |()| 0);
    Ok(vm.trap_results(0, &[status])?)
}

fn child_index(children: &[Option<Box<Machine>>], handle: Word) -> Result<usize, TrapError> {
    usize::try_from(handle)
        .ok()
        .and_then(|handle| handle.checked_sub(1))
        .filter(|&index| children.get(index).is_some_and(Option::is_some))
        .ok_or(TrapError::InvalidHandle(handle))
}

fn child_mut(
    children: &mut [Option<Box<Machine>>],
    handle: Word,
) -> Result<&mut Machine, TrapError> {
    let index = child_index(children, handle)?;
    children[index]
        .as_deref_mut()
        .ok_or(TrapError::InvalidHandle(handle))
}

fn new_state(vm: &mut Machine) -> Result<(), VmError> {
    let [memory_bytes, stack_words] = vm.trap_args::<2>(1)?;
    let limits = vm.sandbox.limits();
    let sizes = usize::try_from(memory_bytes)
        .ok()
        .zip(usize::try_from(stack_words).ok())
        .filter(|&(memory_bytes, stack_words)| {
            memory_bytes <= limits.max_memory_bytes && stack_words <= limits.max_stack_words
        });
    let handle = match sizes {
        Some((memory_bytes, stack_words)) => {
            let config = ExecutionConfig {
                memory_bytes,
                stack_words,
                sandbox_limits: limits,
            };
            let child = Box::new(
                Machine::with_traps(config, Arc::clone(&vm.traps)).with_io(HostIo::empty()),
            );
            let index = match vm.children.iter().position(Option::is_none) {
                Some(index) => {
                    vm.children[index] = Some(child);
                    index
                }
                None => {
                    vm.children.push(Some(child));
                    vm.children.len() - 1
                }
            };
            debug!(handle = index + 1, memory_bytes, stack_words, "created child state");
            index as Word + 1
        }
        None => 0,
    };
    Ok(vm.trap_results(2, &[handle])?)
}

fn free_state(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(0)?;
    let index = child_index(&vm.children, handle)?;
    vm.children[index] = None;
    debug!(handle, "freed child state");
    Ok(vm.trap_results(1, &[])?)
}

fn run_child(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(1)?;
    let code = code_of(child_mut(&mut vm.children, handle)?.run());
    Ok(vm.trap_results(1, &[code])?)
}

fn single_step(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(1)?;
    let code = code_of(child_mut(&mut vm.children, handle)?.step());
    Ok(vm.trap_results(1, &[code])?)
}

fn get_pc(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(1)?;
    let pc = child_mut(&mut vm.children, handle)?.pc as Word;
    Ok(vm.trap_results(1, &[pc])?)
}

fn set_pc(vm: &mut Machine) -> Result<(), VmError> {
    let [pc, handle] = vm.trap_args::<2>(0)?;
    child_mut(&mut vm.children, handle)?.pc = pc as UWord;
    Ok(vm.trap_results(2, &[])?)
}

fn get_ir(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(1)?;
    let ir = child_mut(&mut vm.children, handle)?.ir;
    Ok(vm.trap_results(1, &[ir])?)
}

fn set_ir(vm: &mut Machine) -> Result<(), VmError> {
    let [ir, handle] = vm.trap_args::<2>(0)?;
    child_mut(&mut vm.children, handle)?.ir = ir;
    Ok(vm.trap_results(2, &[])?)
}

fn get_bad(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(1)?;
    let bad = child_mut(&mut vm.children, handle)?.bad;
    Ok(vm.trap_results(1, &[bad])?)
}

fn get_stack_depth(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(1)?;
    let depth = child_mut(&mut vm.children, handle)?.stack.depth() as Word;
    Ok(vm.trap_results(1, &[depth])?)
}

fn push_stack(vm: &mut Machine) -> Result<(), VmError> {
    let [value, handle] = vm.trap_args::<2>(1)?;
    let code = code_of(child_mut(&mut vm.children, handle)?.stack.push(value));
    Ok(vm.trap_results(2, &[code])?)
}

fn pop_stack(vm: &mut Machine) -> Result<(), VmError> {
    let [handle] = vm.trap_args::<1>(2)?;
    let results = match child_mut(&mut vm.children, handle)?.stack.pop() {
        Ok(value) => [value, 0],
        Err(error) => [0, VmError::from(error).code()],
    };
    Ok(vm.trap_results(1, &results)?)
}

fn load_word(vm: &mut Machine) -> Result<(), VmError> {
    let [address, handle] = vm.trap_args::<2>(2)?;
    let results = match child_mut(&mut vm.children, handle)?.memory.load_word(address as UWord) {
        Ok(value) => [value, 0],
        Err(error) => [0, VmError::from(error).code()],
    };
    Ok(vm.trap_results(2, &results)?)
}

fn store_word(vm: &mut Machine) -> Result<(), VmError> {
    let [value, address, handle] = vm.trap_args::<3>(1)?;
    let code = code_of(
        child_mut(&mut vm.children, handle)?
            .memory
            .store_word(address as UWord, value),
    );
    Ok(vm.trap_results(3, &[code])?)
}

fn copy_to(vm: &mut Machine) -> Result<(), VmError> {
    let [source, destination, len, handle] = vm.trap_args::<4>(1)?;
    let child = child_mut(&mut vm.children, handle)?;
    let bytes = vm.memory.slice(source as UWord, byte_len(source, len)?)?;
    let code = code_of(
        child
            .memory
            .slice_mut(destination as UWord, bytes.len())
            .map(|target| target.copy_from_slice(bytes)),
    );
    Ok(vm.trap_results(4, &[code])?)
}
