//! Instruction set of the Mit virtual machine.
//!
//! Code is a sequence of machine words.  Each word packs up to eight 8-bit
//! opcodes starting from the least significant byte; the interpreter peels
//! them off with an arithmetic shift, so a word runs out either as `0` (the
//! `NEXT` opcode) or as all ones (the `NEXTFF` opcode).  Terminal
//! instructions end the word early and take whatever bits remain above them
//! as an inline operand.
//!
//! The table below is built once and indexed directly by opcode byte.  Each
//! entry pairs a [`StackEffect`] with a plain function that computes results
//! from arguments; loading arguments, checking depths and storing results is
//! done generically by the interpreter (or by the stack-cache compiler).

use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::builtins;
use crate::effect::{EffectError, StackEffect, MAX_ITEMS};
use crate::interpreter::{Machine, VmError};
use crate::memory::{MemoryError, Width};

/// Signed machine word.
pub type Word = i64;
/// Unsigned view of a machine word, used for addresses.
pub type UWord = u64;

pub const WORD_BYTES: usize = std::mem::size_of::<Word>();
pub const WORD_BITS: u32 = Word::BITS;
pub const OPCODE_BITS: u32 = 8;
pub const OPCODE_MASK: Word = 0xff;
pub const OPCODES_PER_WORD: u32 = WORD_BITS / OPCODE_BITS;

/// First opcode of the `PUSHRELI_n` family.
pub const PUSHRELI_BASE: u8 = 0x40;
/// First opcode of the `PUSHI_n` family.
pub const PUSHI_BASE: u8 = 0x80;
/// Immediates cover `IMMEDIATE_MIN..IMMEDIATE_END`.
pub const IMMEDIATE_MIN: Word = -32;
pub const IMMEDIATE_END: Word = 32;

/// Named opcodes.  The `PUSHI_n` and `PUSHRELI_n` families are described by
/// [`Decoded`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Load the next instruction word.
    Next = 0x00,
    Jump = 0x01,
    Jumpz = 0x02,
    Call = 0x03,
    Pop = 0x04,
    Dup = 0x05,
    Swap = 0x06,
    /// Dispatch to a trap library.
    Extra = 0x07,
    /// Push the following literal word.
    Push = 0x08,
    /// Push the following literal word added to its own address.
    PushRel = 0x09,
    Not = 0x0a,
    And = 0x0b,
    Or = 0x0c,
    Xor = 0x0d,
    Lshift = 0x0e,
    Rshift = 0x0f,
    Arshift = 0x10,
    Eq = 0x11,
    Lt = 0x12,
    Ult = 0x13,
    Add = 0x14,
    Negate = 0x15,
    Mul = 0x16,
    Divmod = 0x17,
    Udivmod = 0x18,
    Load = 0x19,
    Store = 0x1a,
    Load1 = 0x1b,
    Store1 = 0x1c,
    Load2 = 0x1d,
    Store2 = 0x1e,
    Load4 = 0x1f,
    Store4 = 0x20,
    /// `NEXT` as seen at the end of a negative word.
    NextFf = 0xff,
}

impl Opcode {
    pub const ALL: [Opcode; 34] = [
        Opcode::Next,
        Opcode::Jump,
        Opcode::Jumpz,
        Opcode::Call,
        Opcode::Pop,
        Opcode::Dup,
        Opcode::Swap,
        Opcode::Extra,
        Opcode::Push,
        Opcode::PushRel,
        Opcode::Not,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::Lshift,
        Opcode::Rshift,
        Opcode::Arshift,
        Opcode::Eq,
        Opcode::Lt,
        Opcode::Ult,
        Opcode::Add,
        Opcode::Negate,
        Opcode::Mul,
        Opcode::Divmod,
        Opcode::Udivmod,
        Opcode::Load,
        Opcode::Store,
        Opcode::Load1,
        Opcode::Store1,
        Opcode::Load2,
        Opcode::Store2,
        Opcode::Load4,
        Opcode::Store4,
        Opcode::NextFf,
    ];

    #[inline]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.byte() == byte)
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Next => "next",
            Opcode::Jump => "jump",
            Opcode::Jumpz => "jumpz",
            Opcode::Call => "call",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::Swap => "swap",
            Opcode::Extra => "extra",
            Opcode::Push => "push",
            Opcode::PushRel => "pushrel",
            Opcode::Not => "not",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Lshift => "lshift",
            Opcode::Rshift => "rshift",
            Opcode::Arshift => "arshift",
            Opcode::Eq => "eq",
            Opcode::Lt => "lt",
            Opcode::Ult => "ult",
            Opcode::Add => "add",
            Opcode::Negate => "negate",
            Opcode::Mul => "mul",
            Opcode::Divmod => "divmod",
            Opcode::Udivmod => "udivmod",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Load1 => "load1",
            Opcode::Store1 => "store1",
            Opcode::Load2 => "load2",
            Opcode::Store2 => "store2",
            Opcode::Load4 => "load4",
            Opcode::Store4 => "store4",
            Opcode::NextFf => "nextff",
        }
    }

    /// Terminal instructions end the current word.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Opcode::Next
                | Opcode::NextFf
                | Opcode::Jump
                | Opcode::Jumpz
                | Opcode::Call
                | Opcode::Extra
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Classification of an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Named(Opcode),
    PushI(Word),
    PushRelI(Word),
    Undefined(u8),
}

impl Decoded {
    pub fn from_byte(byte: u8) -> Self {
        if let Some(op) = Opcode::from_byte(byte) {
            return Decoded::Named(op);
        }
        match byte {
            b if (PUSHRELI_BASE..PUSHI_BASE).contains(&b) => Decoded::PushRelI(immediate_value(b)),
            b if (PUSHI_BASE..PUSHI_BASE + 0x40).contains(&b) => Decoded::PushI(immediate_value(b)),
            b => Decoded::Undefined(b),
        }
    }
}

/// Sign-extend the low six bits of an immediate opcode.
#[inline]
pub const fn immediate_value(opcode: u8) -> Word {
    ((((opcode & 0x3f) << 2) as i8) >> 2) as Word
}

#[inline]
pub fn fits_immediate(value: Word) -> bool {
    (IMMEDIATE_MIN..IMMEDIATE_END).contains(&value)
}

pub fn pushi_opcode(value: Word) -> Option<u8> {
    fits_immediate(value).then(|| PUSHI_BASE | (value as u8 & 0x3f))
}

pub fn pushreli_opcode(words: Word) -> Option<u8> {
    fits_immediate(words).then(|| PUSHRELI_BASE | (words as u8 & 0x3f))
}

/// Whether the bits left in `ir` after a terminal opcode form an inline
/// operand.  `0` and `-1` both mean the word is exhausted.
#[inline]
pub const fn has_inline_operand(ir: Word) -> bool {
    ir != 0 && ir != -1
}

/// `pc` moved by `words` machine words.
#[inline]
pub fn relative(pc: UWord, words: Word) -> UWord {
    pc.wrapping_add((words as UWord).wrapping_mul(WORD_BYTES as UWord))
}

/// Working storage for one instruction execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operands {
    pub opcode: u8,
    /// Inline operand of a terminal instruction.
    pub inline: Word,
    /// Named arguments, bottom first.
    pub args: [Word; MAX_ITEMS],
    /// Named results, bottom first.
    pub results: [Word; MAX_ITEMS],
}

/// Instruction semantics: read `args`, write `results`.  Actions may touch
/// memory and the `pc`/`ir` registers but never the operand stack, and they
/// must finish every check before their first write.
pub type Action = fn(&mut Machine, &mut Operands) -> Result<(), VmError>;

/// Alternate semantics used when a terminal instruction has an inline operand.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub effect: Option<StackEffect>,
    pub action: Action,
}

/// Immutable instruction descriptor.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: u8,
    pub name: String,
    /// `None` when the effect cannot be known statically (`EXTRA`).
    pub effect: Option<StackEffect>,
    pub action: Action,
    pub terminal: Option<Terminal>,
}

impl Instruction {
    fn new(
        opcode: u8,
        name: impl Into<String>,
        effect: Option<StackEffect>,
        action: Action,
    ) -> Self {
        Self {
            opcode,
            name: name.into(),
            effect,
            action,
            terminal: None,
        }
    }

    fn with_terminal(mut self, effect: Option<StackEffect>, action: Action) -> Self {
        self.terminal = Some(Terminal { effect, action });
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}

/// Dense opcode-indexed instruction table.
#[derive(Debug, Clone)]
pub struct InstructionTable {
    entries: Vec<Option<Instruction>>,
}

static STANDARD: LazyLock<InstructionTable> = LazyLock::new(|| {
    InstructionTable::standard().expect("standard instruction table has valid stack effects")
});

/// The instruction table used by every machine.
pub fn instructions() -> &'static InstructionTable {
    &STANDARD
}

impl InstructionTable {
    pub fn standard() -> Result<Self, EffectError> {
        let mut table = Self {
            entries: vec![None; 256],
        };
        let effect = |args, results| StackEffect::new(args, results).map(Some);

        table.insert(
            Instruction::new(Opcode::Next.byte(), "NEXT", effect("", "")?, next)
                .with_terminal(effect("", "")?, next),
        );
        table.insert(
            Instruction::new(Opcode::NextFf.byte(), "NEXTFF", effect("", "")?, next)
                .with_terminal(effect("", "")?, next),
        );
        table.insert(
            Instruction::new(Opcode::Jump.byte(), "JUMP", effect("addr", "")?, jump)
                .with_terminal(effect("", "")?, jump_inline),
        );
        table.insert(
            Instruction::new(Opcode::Jumpz.byte(), "JUMPZ", effect("flag addr", "")?, jumpz)
                .with_terminal(effect("flag", "")?, jumpz_inline),
        );
        table.insert(
            Instruction::new(Opcode::Call.byte(), "CALL", effect("addr", "ret")?, call)
                .with_terminal(effect("", "ret")?, call_inline),
        );
        table.insert(Instruction::new(
            Opcode::Pop.byte(),
            "POP",
            effect("ITEMS COUNT", "")?,
            pop,
        ));
        table.insert(Instruction::new(
            Opcode::Dup.byte(),
            "DUP",
            effect("x ITEMS COUNT", "x ITEMS x")?,
            dup,
        ));
        table.insert(Instruction::new(
            Opcode::Swap.byte(),
            "SWAP",
            effect("x ITEMS y COUNT", "y ITEMS x")?,
            swap,
        ));
        table.insert(
            Instruction::new(Opcode::Extra.byte(), "EXTRA", None, extra)
                .with_terminal(None, extra_inline),
        );
        table.insert(Instruction::new(Opcode::Push.byte(), "PUSH", effect("", "x")?, push));
        table.insert(Instruction::new(
            Opcode::PushRel.byte(),
            "PUSHREL",
            effect("", "addr")?,
            push_rel,
        ));

        let unary: [(Opcode, &str, Action); 2] =
            [(Opcode::Not, "NOT", not), (Opcode::Negate, "NEGATE", negate)];
        for (op, name, action) in unary {
            table.insert(Instruction::new(op.byte(), name, effect("a", "b")?, action));
        }

        let binary: [(Opcode, &str, Action); 12] = [
            (Opcode::And, "AND", and),
            (Opcode::Or, "OR", or),
            (Opcode::Xor, "XOR", xor),
            (Opcode::Lshift, "LSHIFT", lshift),
            (Opcode::Rshift, "RSHIFT", rshift),
            (Opcode::Arshift, "ARSHIFT", arshift),
            (Opcode::Eq, "EQ", eq),
            (Opcode::Lt, "LT", lt),
            (Opcode::Ult, "ULT", ult),
            (Opcode::Add, "ADD", add),
            (Opcode::Mul, "MUL", mul),
            (Opcode::Divmod, "DIVMOD", divmod),
        ];
        for (op, name, action) in binary {
            let results = if op == Opcode::Divmod { "q r" } else { "c" };
            table.insert(Instruction::new(op.byte(), name, effect("a b", results)?, action));
        }
        table.insert(Instruction::new(
            Opcode::Udivmod.byte(),
            "UDIVMOD",
            effect("a b", "q r")?,
            udivmod,
        ));

        let memory: [(Opcode, &str, Action, Opcode, &str, Action); 4] = [
            (Opcode::Load, "LOAD", load8, Opcode::Store, "STORE", store8),
            (Opcode::Load1, "LOAD1", load1, Opcode::Store1, "STORE1", store1),
            (Opcode::Load2, "LOAD2", load2, Opcode::Store2, "STORE2", store2),
            (Opcode::Load4, "LOAD4", load4, Opcode::Store4, "STORE4", store4),
        ];
        for (load_op, load_name, load, store_op, store_name, store) in memory {
            table.insert(Instruction::new(load_op.byte(), load_name, effect("addr", "x")?, load));
            table.insert(Instruction::new(
                store_op.byte(),
                store_name,
                effect("x addr", "")?,
                store,
            ));
        }

        for n in IMMEDIATE_MIN..IMMEDIATE_END {
            if let (Some(pushi), Some(pushreli)) = (pushi_opcode(n), pushreli_opcode(n)) {
                table.insert(Instruction::new(
                    pushi,
                    format!("PUSHI_{n}"),
                    effect("", "x")?,
                    push_immediate,
                ));
                table.insert(Instruction::new(
                    pushreli,
                    format!("PUSHRELI_{n}"),
                    effect("", "addr")?,
                    push_rel_immediate,
                ));
            }
        }
        Ok(table)
    }

    fn insert(&mut self, instruction: Instruction) {
        let index = instruction.opcode as usize;
        self.entries[index] = Some(instruction);
    }

    #[inline]
    pub fn get(&self, opcode: u8) -> Option<&Instruction> {
        self.entries[opcode as usize].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.entries.iter().flatten()
    }
}

fn check_code_address(address: UWord) -> Result<(), VmError> {
    if Width::Eight.is_aligned(address) {
        Ok(())
    } else {
        Err(MemoryError::Unaligned { address }.into())
    }
}

fn next(vm: &mut Machine, _ops: &mut Operands) -> Result<(), VmError> {
    let word = vm.memory.load_word(vm.pc)?;
    vm.ir = word;
    vm.pc = vm.pc.wrapping_add(WORD_BYTES as UWord);
    Ok(())
}

fn jump(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    let addr = ops.args[0] as UWord;
    check_code_address(addr)?;
    vm.pc = addr;
    Ok(())
}

fn jump_inline(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    vm.pc = relative(vm.pc, ops.inline);
    Ok(())
}

fn jumpz(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    let [flag, addr, ..] = ops.args;
    if flag == 0 {
        check_code_address(addr as UWord)?;
        vm.pc = addr as UWord;
    }
    Ok(())
}

fn jumpz_inline(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    if ops.args[0] == 0 {
        vm.pc = relative(vm.pc, ops.inline);
    }
    Ok(())
}

fn call(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    let addr = ops.args[0] as UWord;
    check_code_address(addr)?;
    ops.results[0] = vm.pc as Word;
    vm.pc = addr;
    Ok(())
}

fn call_inline(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = vm.pc as Word;
    vm.pc = relative(vm.pc, ops.inline);
    Ok(())
}

fn pop(_vm: &mut Machine, _ops: &mut Operands) -> Result<(), VmError> {
    Ok(())
}

fn dup(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = ops.args[0];
    ops.results[1] = ops.args[0];
    Ok(())
}

fn swap(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = ops.args[1];
    ops.results[1] = ops.args[0];
    Ok(())
}

fn extra(vm: &mut Machine, _ops: &mut Operands) -> Result<(), VmError> {
    builtins::dispatch_extra(vm, None)
}

fn extra_inline(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    builtins::dispatch_extra(vm, Some(ops.inline))
}

fn push(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = vm.memory.load_word(vm.pc)?;
    vm.pc = vm.pc.wrapping_add(WORD_BYTES as UWord);
    Ok(())
}

fn push_rel(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    let offset = vm.memory.load_word(vm.pc)?;
    ops.results[0] = vm.pc.wrapping_add(offset as UWord) as Word;
    vm.pc = vm.pc.wrapping_add(WORD_BYTES as UWord);
    Ok(())
}

fn push_immediate(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = immediate_value(ops.opcode);
    Ok(())
}

fn push_rel_immediate(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = relative(vm.pc, immediate_value(ops.opcode)) as Word;
    Ok(())
}

fn not(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = !ops.args[0];
    Ok(())
}

fn negate(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    ops.results[0] = ops.args[0].wrapping_neg();
    Ok(())
}

/// A shift count below the word width.
fn shifted(count: Word) -> Option<u32> {
    u32::try_from(count as UWord).ok().filter(|&count| count < WORD_BITS)
}

macro_rules! binary_actions {
    ($($name:ident => |$a:ident, $b:ident| $body:expr;)*) => {
        $(
            fn $name(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
                let ($a, $b) = (ops.args[0], ops.args[1]);
                ops.results[0] = $body;
                Ok(())
            }
        )*
    };
}

binary_actions! {
    and => |a, b| a & b;
    or => |a, b| a | b;
    xor => |a, b| a ^ b;
    lshift => |x, s| shifted(s).map_or(0, |s| ((x as UWord) << s) as Word);
    rshift => |x, s| shifted(s).map_or(0, |s| ((x as UWord) >> s) as Word);
    arshift => |x, s| x >> (s as UWord).min(WORD_BITS as UWord - 1);
    eq => |a, b| (a == b) as Word;
    lt => |a, b| (a < b) as Word;
    ult => |a, b| ((a as UWord) < (b as UWord)) as Word;
    add => |a, b| a.wrapping_add(b);
    mul => |a, b| a.wrapping_mul(b);
}

fn divmod(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    let (a, b) = (ops.args[0], ops.args[1]);
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    ops.results[0] = a.wrapping_div(b);
    ops.results[1] = a.wrapping_rem(b);
    Ok(())
}

fn udivmod(_vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
    let (a, b) = (ops.args[0] as UWord, ops.args[1] as UWord);
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    ops.results[0] = (a / b) as Word;
    ops.results[1] = (a % b) as Word;
    Ok(())
}

macro_rules! memory_actions {
    ($($load:ident, $store:ident => $width:expr;)*) => {
        $(
            fn $load(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
                ops.results[0] = vm.memory.load(ops.args[0] as UWord, $width)?;
                Ok(())
            }

            fn $store(vm: &mut Machine, ops: &mut Operands) -> Result<(), VmError> {
                vm.memory.store(ops.args[1] as UWord, $width, ops.args[0])?;
                Ok(())
            }
        )*
    };
}

memory_actions! {
    load8, store8 => Width::Eight;
    load1, store1 => Width::One;
    load2, store2 => Width::Two;
    load4, store4 => Width::Four;
}
