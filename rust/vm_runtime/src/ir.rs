//! Micro-op representation of compiled instruction words.
//!
//! The stack-cache compiler turns the opcodes packed into one instruction
//! word into a [`Block`]: one [`Step`] per opcode, each a short list of
//! [`Op`]s over a small register file.  Registers hold the top few stack
//! slots so that consecutive instructions pass values to each other without
//! a round trip through the stack array.  The real stack depth is adjusted
//! by every step, so depth checks stay exact; only slot contents lag behind
//! until the cache is flushed.

use std::fmt;

use crate::bytecode::{Action, Word};

/// Index into the block's register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u16);

impl Reg {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One micro-op.
#[derive(Debug, Clone)]
pub enum Op {
    /// The stack must hold a value at `depth`.
    CheckRead { depth: u64 },
    /// The stack must have room for `words` more values.
    CheckRoom { words: u64 },
    /// `reg = stack[depth]`.
    Load { reg: Reg, depth: u64 },
    /// `stack[depth] = reg`.
    Store { reg: Reg, depth: u64 },
    /// Run instruction semantics over registers.  A `None` result is left
    /// in the register of the argument it aliases.
    Execute {
        opcode: u8,
        action: Action,
        args: Vec<Reg>,
        results: Vec<Option<Reg>>,
    },
    /// Move the top of stack.
    Adjust(i64),
    /// Run the instruction with the ordinary interpreter.
    Generic,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::CheckRead { depth } => write!(f, "check_read {depth}"),
            Op::CheckRoom { words } => write!(f, "check_room {words}"),
            Op::Load { reg, depth } => write!(f, "{reg} = stack[{depth}]"),
            Op::Store { reg, depth } => write!(f, "stack[{depth}] = {reg}"),
            Op::Execute {
                opcode,
                args,
                results,
                ..
            } => {
                write!(f, "execute {opcode:#04x} (")?;
                for (index, reg) in args.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{reg}")?;
                }
                f.write_str(" --")?;
                for reg in results {
                    match reg {
                        Some(reg) => write!(f, " {reg}")?,
                        None => f.write_str(" _")?,
                    }
                }
                f.write_str(")")
            }
            Op::Adjust(delta) => write!(f, "adjust {delta:+}"),
            Op::Generic => f.write_str("generic"),
        }
    }
}

/// Compiled form of one opcode.
#[derive(Debug, Clone)]
pub struct Step {
    pub opcode: u8,
    /// `ir` before the opcode is extracted.
    pub ir: Word,
    /// Cache layout on entry, as `(register, depth)`; written back to the
    /// stack if the step fails.
    pub spill: Vec<(Reg, u64)>,
    pub ops: Vec<Op>,
}

impl Step {
    pub fn is_generic(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Generic))
    }
}

/// Compiled form of an instruction word.
#[derive(Debug, Clone)]
pub struct Block {
    /// The `ir` value the block starts from.
    pub word: Word,
    pub steps: Vec<Step>,
    /// Stores that empty the cache once every step has run.
    pub exit: Vec<Op>,
    /// Size of the register file the block needs.
    pub registers: usize,
}

impl Block {
    /// Micro-ops across all steps, excluding the exit flush.
    pub fn op_count(&self) -> usize {
        self.steps.iter().map(|step| step.ops.len()).sum()
    }

    pub fn count_ops(&self, predicate: impl Fn(&Op) -> bool) -> usize {
        self.steps
            .iter()
            .flat_map(|step| step.ops.iter())
            .chain(self.exit.iter())
            .filter(|op| predicate(op))
            .count()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {:#018x}:", self.word)?;
        for step in &self.steps {
            writeln!(f, "  opcode {:#04x}:", step.opcode)?;
            for op in &step.ops {
                writeln!(f, "    {op}")?;
            }
        }
        for op in &self.exit {
            writeln!(f, "  exit {op}")?;
        }
        Ok(())
    }
}
