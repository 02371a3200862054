//! Mit virtual machine runtime.
//!
//! A stack machine with packed instruction words, checked stack effects, an
//! extensible trap mechanism and a stack-caching block compiler.  The entry
//! point is [`Machine`]; [`Assembler`] builds code for it and [`Specializer`]
//! runs it through compiled blocks.

pub mod asm;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod disasm;
pub mod effect;
pub mod interpreter;
pub mod ir;
pub mod memory;
pub mod object;
pub mod profile;
pub mod sandbox;
pub mod specializer;
pub mod stack;
pub mod trace;

pub use asm::{Assembler, Assembly, Insn, Label};
pub use builtins::{HostIo, Traps};
pub use bytecode::{Opcode, UWord, Word, WORD_BYTES};
pub use interpreter::{ExecutionConfig, Machine, VmError};
pub use memory::Width;
pub use specializer::{Specializer, SpecializerConfig};
