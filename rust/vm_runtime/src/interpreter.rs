//! Interpreter for the Mit virtual machine.
//!
//! A [`Machine`] is a complete VM state: registers, operand stack, memory, the
//! trap table it dispatches `EXTRA` through, its host I/O streams and the
//! child states it manages.  `step` executes exactly one instruction and
//! leaves the state untouched apart from `bad` if the instruction fails, so a
//! host can always inspect or resume a stopped machine.  `run` repeats `step`
//! until an error, consulting the sandbox before every instruction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::builtins::{HostIo, TrapError, Traps};
use crate::bytecode::{
    has_inline_operand, instructions, Action, Instruction, Operands, UWord, Word, OPCODE_BITS,
    OPCODE_MASK,
};
use crate::effect::StackEffect;
use crate::memory::{Memory, MemoryError, Width, DEFAULT_MEMORY_BYTES};
use crate::sandbox::{Sandbox, SandboxError, SandboxLimits};
use crate::stack::{Stack, StackError, DEFAULT_STACK_WORDS};
use crate::trace::{TraceControl, TraceEvent, TraceSink};

/// Error code reported for a `Break`.
pub const BREAK_CODE: Word = -127;

/// Sizes and budgets for a new machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub memory_bytes: usize,
    pub stack_words: usize,
    pub sandbox_limits: SandboxLimits,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            stack_words: DEFAULT_STACK_WORDS,
            sandbox_limits: SandboxLimits::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One VM state.
#[derive(Debug)]
pub struct Machine {
    pub(crate) memory: Memory,
    pub(crate) stack: Stack,
    pub(crate) pc: UWord,
    pub(crate) ir: Word,
    pub(crate) bad: Word,
    pub(crate) sandbox: Sandbox,
    pub(crate) traps: Arc<Traps>,
    pub(crate) io: HostIo,
    pub(crate) args: Vec<String>,
    pub(crate) children: Vec<Option<Box<Machine>>>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

impl Machine {
    /// A machine with the standard trap libraries and the process's stdio.
    pub fn new(config: ExecutionConfig) -> Self {
        Self::with_traps(config, Arc::new(Traps::standard()))
    }

    pub fn with_traps(config: ExecutionConfig, traps: Arc<Traps>) -> Self {
        Self {
            memory: Memory::new(config.memory_bytes),
            stack: Stack::new(config.stack_words),
            pc: 0,
            ir: 0,
            bad: 0,
            sandbox: Sandbox::new(config.sandbox_limits),
            traps,
            io: HostIo::standard(),
            args: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_io(mut self, io: HostIo) -> Self {
        self.io = io;
        self
    }

    // Registers.

    #[inline]
    pub fn pc(&self) -> UWord {
        self.pc
    }

    pub fn set_pc(&mut self, pc: UWord) {
        self.pc = pc;
    }

    #[inline]
    pub fn ir(&self) -> Word {
        self.ir
    }

    pub fn set_ir(&mut self, ir: Word) {
        self.ir = ir;
    }

    /// Auxiliary value recorded by the last failing instruction.
    #[inline]
    pub fn bad(&self) -> Word {
        self.bad
    }

    // Operand stack.

    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn set_stack_depth(&mut self, depth: usize) -> Result<(), StackError> {
        self.stack.set_depth(depth)
    }

    /// Stack capacity in words.
    pub fn stack_words(&self) -> usize {
        self.stack.capacity()
    }

    /// Valid stack words, bottom first.
    pub fn stack(&self) -> &[Word] {
        self.stack.as_slice()
    }

    pub fn push(&mut self, value: Word) -> Result<(), StackError> {
        self.stack.push(value)
    }

    pub fn pop(&mut self) -> Result<Word, StackError> {
        self.stack.pop()
    }

    pub fn load_stack(&self, depth: u64) -> Result<Word, StackError> {
        self.stack.load(depth)
    }

    pub fn store_stack(&mut self, depth: u64, value: Word) -> Result<(), StackError> {
        self.stack.store(depth, value)
    }

    // Memory.

    pub fn memory_size(&self) -> usize {
        self.memory.size()
    }

    pub fn memory(&self) -> &[u8] {
        self.memory.as_bytes()
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_bytes_mut()
    }

    pub fn load(&self, address: UWord, width: Width) -> Result<Word, MemoryError> {
        self.memory.load(address, width)
    }

    pub fn store(&mut self, address: UWord, width: Width, value: Word) -> Result<(), MemoryError> {
        self.memory.store(address, width, value)
    }

    pub fn load_word(&self, address: UWord) -> Result<Word, MemoryError> {
        self.memory.load_word(address)
    }

    pub fn store_word(&mut self, address: UWord, value: Word) -> Result<(), MemoryError> {
        self.memory.store_word(address, value)
    }

    // Host environment.

    /// Make command-line arguments visible to the `ARGC`/`ARG_*` traps.
    pub fn register_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn io_mut(&mut self) -> &mut HostIo {
        &mut self.io
    }

    pub fn traps(&self) -> &Arc<Traps> {
        &self.traps
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn sandbox_mut(&mut self) -> &mut Sandbox {
        &mut self.sandbox
    }

    /// A child state created by `NEW_STATE`.
    pub fn child(&self, handle: Word) -> Option<&Machine> {
        let index = usize::try_from(handle).ok()?.checked_sub(1)?;
        self.children.get(index)?.as_deref()
    }

    // Execution.

    /// Execute one instruction.  On error `pc`, `ir`, the stack and memory
    /// are as they were before the call and `bad` describes the failure.
    pub fn step(&mut self) -> Result<(), VmError> {
        let (pc, ir) = (self.pc, self.ir);
        let opcode = (ir & OPCODE_MASK) as u8;
        let result = match instructions().get(opcode) {
            Some(instruction) => {
                self.ir = ir >> OPCODE_BITS;
                self.execute(instruction)
            }
            None => Err(VmError::InvalidOpcode(opcode)),
        };
        if let Err(error) = &result {
            self.fail(pc, ir, error);
        }
        result
    }

    /// Run until an error.  `THROW 0` ends the run successfully.
    pub fn run(&mut self) -> Result<(), VmError> {
        self.run_loop(None, None)
    }

    /// Run at most `steps` instructions; returns `Break` if they all succeed.
    pub fn run_for(&mut self, steps: u64) -> Result<(), VmError> {
        self.run_loop(None, Some(steps))
    }

    /// Run with `sink` observing, and able to stop, every instruction.
    pub fn run_traced(&mut self, sink: &mut dyn TraceSink) -> Result<(), VmError> {
        self.run_loop(Some(sink), None)
    }

    fn run_loop(
        &mut self,
        mut sink: Option<&mut dyn TraceSink>,
        mut budget: Option<u64>,
    ) -> Result<(), VmError> {
        self.sandbox.start_run();
        loop {
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(VmError::Break);
                }
                *left -= 1;
            }
            let result = match sink.as_deref_mut() {
                Some(sink) => self.traced_step(sink),
                None => self.observed_step(),
            };
            match result {
                Ok(()) => {}
                Err(VmError::Halt) => return Ok(()),
                Err(error) if self.recover(&error) => {}
                Err(error) => return Err(self.stopped(error)),
            }
        }
    }

    fn traced_step(&mut self, sink: &mut dyn TraceSink) -> Result<(), VmError> {
        let event = TraceEvent {
            pc: self.pc,
            ir: self.ir,
            opcode: (self.ir & OPCODE_MASK) as u8,
            stack_depth: self.stack.depth(),
        };
        if sink.instruction(&event) == TraceControl::Break {
            return Err(VmError::Break);
        }
        self.observed_step()
    }

    /// `step` under the sandbox budgets.
    pub(crate) fn observed_step(&mut self) -> Result<(), VmError> {
        self.sandbox.observe_instruction()?;
        let result = self.step();
        self.sandbox.record_stack_depth(self.stack.depth());
        result
    }

    pub(crate) fn stopped(&self, error: VmError) -> VmError {
        debug!(code = error.code(), pc = self.pc, bad = self.bad, %error, "run stopped");
        error
    }

    pub(crate) fn fail(&mut self, pc: UWord, ir: Word, error: &VmError) {
        self.pc = pc;
        self.ir = ir;
        if let Some(bad) = error.bad() {
            self.bad = bad;
        }
    }

    /// Grow the stack or memory after an overflow when the sandbox allows
    /// it.  Returns whether the failed instruction should be retried.
    pub(crate) fn recover(&mut self, error: &VmError) -> bool {
        let limits = self.sandbox.limits();
        match *error {
            VmError::Stack(StackError::Overflow { shortfall }) => {
                let current = self.stack.capacity();
                let needed = current.saturating_add(shortfall as usize);
                let Some(words) =
                    self.sandbox
                        .extended_size(current, needed, limits.max_stack_words)
                else {
                    return false;
                };
                self.stack.grow(words);
                self.sandbox.record_extension();
                info!(from = current, to = words, "extended operand stack");
                true
            }
            VmError::Memory(MemoryError::InvalidWrite { end: Some(end), .. }) => {
                let current = self.memory.size();
                let Some(bytes) = usize::try_from(end).ok().and_then(|needed| {
                    self.sandbox
                        .extended_size(current, needed, limits.max_memory_bytes)
                }) else {
                    return false;
                };
                self.memory.grow(bytes);
                self.sandbox.record_extension();
                info!(from = current, to = bytes, "extended memory");
                true
            }
            _ => false,
        }
    }

    /// Run an instruction whose opcode has already been shifted out of `ir`.
    pub(crate) fn execute(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let mut ops = Operands {
            opcode: instruction.opcode,
            ..Operands::default()
        };
        match &instruction.terminal {
            Some(terminal) if has_inline_operand(self.ir) => {
                ops.inline = self.ir;
                self.ir = 0;
                self.apply(terminal.effect.as_ref(), terminal.action, &mut ops)
            }
            Some(_) => {
                self.ir = 0;
                self.apply(instruction.effect.as_ref(), instruction.action, &mut ops)
            }
            None => self.apply(instruction.effect.as_ref(), instruction.action, &mut ops),
        }
    }

    /// Check `effect` against the stack, load the arguments, run `action`
    /// and store the results.  Nothing on the stack changes unless the
    /// action succeeds.
    fn apply(
        &mut self,
        effect: Option<&StackEffect>,
        action: Action,
        ops: &mut Operands,
    ) -> Result<(), VmError> {
        let Some(effect) = effect else {
            return action(self, ops);
        };
        let count = match effect.count_depth() {
            Some(depth) => self.stack.load(depth)? as u64,
            None => 0,
        };
        let (args, results) = effect.sizes(count);
        self.stack.check_effect(args, results)?;
        for (slot, item) in ops.args.iter_mut().zip(effect.args().named()) {
            *slot = self.stack.load(item.depth.resolve(count))?;
        }
        action(self, ops)?;
        self.stack.adjust(results as i64 - args as i64)?;
        for ((item, in_place), value) in effect.named_results().zip(ops.results) {
            if !in_place {
                self.stack.store(item.depth.resolve(count), value)?;
            }
        }
        Ok(())
    }
}

/// Everything that can stop an instruction or a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("halt")]
    Halt,
    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("stack error: {0}")]
    Stack(#[from] StackError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("division by zero")]
    DivisionByZero,
    #[error("trap error: {0}")]
    Trap(#[from] TrapError),
    #[error("break")]
    Break,
    #[error("sandbox budget exhausted: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("program threw {0}")]
    Thrown(Word),
}

impl VmError {
    /// Numeric code visible to programs (`RUN`, `SINGLE_STEP`) and hosts.
    pub fn code(&self) -> Word {
        match self {
            VmError::Halt => 0,
            VmError::InvalidOpcode(_) => -1,
            VmError::Stack(StackError::Overflow { .. }) => -2,
            VmError::Stack(StackError::InvalidRead { .. }) => -3,
            VmError::Stack(StackError::InvalidWrite { .. }) => -4,
            VmError::Memory(MemoryError::InvalidRead { .. }) => -5,
            VmError::Memory(MemoryError::InvalidWrite { .. }) => -6,
            VmError::Memory(MemoryError::Unaligned { .. }) => -7,
            VmError::DivisionByZero => -8,
            VmError::Trap(TrapError::InvalidLibrary(_)) => -15,
            VmError::Trap(TrapError::InvalidFunction(_)) => -16,
            VmError::Trap(TrapError::InvalidHandle(_)) => -17,
            VmError::Break | VmError::Sandbox(_) => BREAK_CODE,
            VmError::Thrown(code) => *code,
        }
    }

    /// Value stored in the `bad` register, if the error carries one.
    pub fn bad(&self) -> Option<Word> {
        match self {
            VmError::InvalidOpcode(opcode) => Some(*opcode as Word),
            VmError::Stack(error) => Some(error.bad() as Word),
            VmError::Memory(error) => Some(error.address() as Word),
            VmError::Trap(error) => Some(error.bad()),
            _ => None,
        }
    }

    /// Halt and break are control sentinels rather than faults.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, VmError::Halt | VmError::Break | VmError::Sandbox(_))
    }
}
