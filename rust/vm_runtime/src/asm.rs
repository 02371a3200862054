//! Assembler: packs symbolic instructions into Mit instruction words.
//!
//! Opcodes fill a word from its least significant byte.  A word ends when it
//! is full, when a terminal instruction is placed, or on [`Assembler::next_word`].
//! The literal of a `PUSH` or `PUSHREL` is placed in the word directly after
//! the instruction word (or after earlier literals of the same word), which is
//! where the running `pc` points when the instruction executes.
//!
//! Every value gets its shortest encoding: `PUSHI_n`/`PUSHRELI_n` when the
//! immediate fits, an inline operand for terminals when the remaining bits can
//! hold it, and otherwise a literal plus the zero-operand form.

use thiserror::Error;

use crate::bytecode::{
    fits_immediate, pushi_opcode, pushreli_opcode, Opcode, UWord, Word, OPCODE_BITS,
    WORD_BITS, WORD_BYTES,
};
use crate::interpreter::Machine;
use crate::memory::MemoryError;

/// A control-flow target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// One symbolic instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Insn {
    /// A plain instruction, or the zero-operand form of a terminal.
    Op(Opcode),
    /// Push a constant.
    Push(Word),
    /// Push an absolute address, encoded relative to the `pc`.
    PushRel(UWord),
    /// A terminal with an inline operand.
    Terminal(Opcode, Word),
    /// A raw opcode byte with no defined meaning.
    Invalid(u8),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("label {0:?} was referenced but never bound")]
    UnboundLabel(Label),
    #[error("label {0:?} is bound twice")]
    Rebound(Label),
    #[error("label {0:?} belongs to another assembler")]
    UnknownLabel(Label),
    #[error("{0} takes no inline operand")]
    NotTerminal(Opcode),
    #[error("{op} cannot carry inline operand {operand}")]
    InvalidOperand { op: Opcode, operand: Word },
    #[error("{0} needs a literal; use Insn::Push or Insn::PushRel")]
    MissingLiteral(Opcode),
}

/// Assembled words and the address of the first one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assembly {
    pub base: UWord,
    pub words: Vec<Word>,
}

impl Assembly {
    /// The words in memory byte order.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|word| word.to_ne_bytes()).collect()
    }

    pub fn end(&self) -> UWord {
        self.base + (self.words.len() * WORD_BYTES) as UWord
    }

    /// Copy the code into `machine` and point it at the first word.
    pub fn load_into(&self, machine: &mut Machine) -> Result<(), MemoryError> {
        let bytes = self.to_bytes();
        machine
            .memory
            .slice_mut(self.base, bytes.len())?
            .copy_from_slice(&bytes);
        machine.set_pc(self.base);
        machine.set_ir(0);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
struct OpenWord {
    index: usize,
    shift: u32,
}

#[derive(Copy, Clone, Debug)]
struct Fixup {
    /// Index of a `PUSHREL` literal.
    at: usize,
    label: Label,
}

/// Instruction word builder.
#[derive(Clone, Debug, Default)]
pub struct Assembler {
    base: UWord,
    words: Vec<Word>,
    open: Option<OpenWord>,
    labels: Vec<Option<UWord>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    /// Assemble code that will be loaded at `base`.
    pub fn new(base: UWord) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    /// Address of the next word to be started.
    pub fn here(&self) -> UWord {
        self.base + (self.words.len() * WORD_BYTES) as UWord
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the start of a fresh word.
    pub fn bind(&mut self, label: Label) -> Result<&mut Self, AsmError> {
        self.next_word();
        let address = self.here();
        match self.labels.get_mut(label.0) {
            None => Err(AsmError::UnknownLabel(label)),
            Some(Some(_)) => Err(AsmError::Rebound(label)),
            Some(slot) => {
                *slot = Some(address);
                Ok(self)
            }
        }
    }

    /// Close the current word; the rest of it decodes as `NEXT`.
    pub fn next_word(&mut self) -> &mut Self {
        self.open = None;
        self
    }

    pub fn emit(&mut self, insn: Insn) -> Result<&mut Self, AsmError> {
        match insn {
            Insn::Op(Opcode::Next | Opcode::NextFf) => {
                self.next_word();
            }
            Insn::Op(op @ (Opcode::Push | Opcode::PushRel)) => {
                return Err(AsmError::MissingLiteral(op));
            }
            Insn::Op(op) => {
                self.place(op.byte());
                if op.is_terminal() {
                    self.next_word();
                }
            }
            Insn::Push(value) => self.push_value(value),
            Insn::PushRel(address) => self.push_address(address),
            Insn::Terminal(op, operand) => {
                if !op.is_terminal() {
                    return Err(AsmError::NotTerminal(op));
                }
                if !self.place_terminal(op, |_| operand) {
                    return Err(AsmError::InvalidOperand { op, operand });
                }
            }
            Insn::Invalid(byte) => self.place(byte),
        }
        Ok(self)
    }

    pub fn emit_all(
        &mut self,
        insns: impl IntoIterator<Item = Insn>,
    ) -> Result<&mut Self, AsmError> {
        for insn in insns {
            self.emit(insn)?;
        }
        Ok(self)
    }

    pub fn op(&mut self, op: Opcode) -> Result<&mut Self, AsmError> {
        self.emit(Insn::Op(op))
    }

    pub fn push(&mut self, value: Word) -> &mut Self {
        self.push_value(value);
        self
    }

    /// Push the address of `label`.
    pub fn push_label(&mut self, label: Label) -> Result<&mut Self, AsmError> {
        match self.label_address(label)? {
            Some(address) => self.push_address(address),
            None => self.push_fixup(label),
        }
        Ok(self)
    }

    /// Call a trap, inline when the selector allows it.
    pub fn extra(&mut self, selector: Word) -> &mut Self {
        if !self.place_terminal(Opcode::Extra, |_| selector) {
            self.push_value(selector);
            self.place(Opcode::Extra.byte());
            self.next_word();
        }
        self
    }

    pub fn jump_to(&mut self, label: Label) -> Result<&mut Self, AsmError> {
        self.branch_to(Opcode::Jump, label)
    }

    pub fn jumpz_to(&mut self, label: Label) -> Result<&mut Self, AsmError> {
        self.branch_to(Opcode::Jumpz, label)
    }

    pub fn call_to(&mut self, label: Label) -> Result<&mut Self, AsmError> {
        self.branch_to(Opcode::Call, label)
    }

    /// Patch forward references and return the code.
    pub fn finish(mut self) -> Result<Assembly, AsmError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.labels[fixup.label.0].ok_or(AsmError::UnboundLabel(fixup.label))?;
            self.words[fixup.at] = target.wrapping_sub(self.word_address(fixup.at)) as Word;
        }
        Ok(Assembly {
            base: self.base,
            words: self.words,
        })
    }

    fn label_address(&self, label: Label) -> Result<Option<UWord>, AsmError> {
        self.labels
            .get(label.0)
            .copied()
            .ok_or(AsmError::UnknownLabel(label))
    }

    fn word_address(&self, index: usize) -> UWord {
        self.base + (index * WORD_BYTES) as UWord
    }

    fn branch_to(&mut self, op: Opcode, label: Label) -> Result<&mut Self, AsmError> {
        match self.label_address(label)? {
            Some(target) => {
                let inline = self.place_terminal(op, |end| {
                    (target.wrapping_sub(end) as Word) / WORD_BYTES as Word
                });
                if !inline {
                    self.push_address(target);
                    self.place(op.byte());
                    self.next_word();
                }
            }
            None => {
                self.push_fixup(label);
                self.place(op.byte());
                self.next_word();
            }
        }
        Ok(self)
    }

    /// Make sure the open word has room for one more opcode.
    fn reserve(&mut self) -> OpenWord {
        match self.open {
            Some(open) if open.shift < WORD_BITS => open,
            _ => {
                self.words.push(0);
                let open = OpenWord {
                    index: self.words.len() - 1,
                    shift: 0,
                };
                self.open = Some(open);
                open
            }
        }
    }

    fn place(&mut self, byte: u8) {
        let open = self.reserve();
        self.words[open.index] |= (byte as Word) << open.shift;
        self.open = Some(OpenWord {
            shift: open.shift + OPCODE_BITS,
            ..open
        });
    }

    /// `pc` seen by an instruction placed next.
    fn next_pc(&mut self) -> UWord {
        self.reserve();
        self.here()
    }

    /// Try to place `op` with the inline operand computed from the address
    /// the word ends at, first in the open word and then in a fresh one.
    fn place_terminal(&mut self, op: Opcode, operand: impl Fn(UWord) -> Word) -> bool {
        for fresh in [false, true] {
            if fresh {
                if self.open.is_some_and(|open| open.shift == 0) {
                    break;
                }
                self.next_word();
            }
            let open = self.reserve();
            let value = operand(self.here());
            let shift = open.shift + OPCODE_BITS;
            if shift >= WORD_BITS || !fits_inline(value, WORD_BITS - shift) {
                continue;
            }
            self.words[open.index] |= (op.byte() as Word) << open.shift;
            self.words[open.index] |= value << shift;
            self.next_word();
            return true;
        }
        false
    }

    fn push_value(&mut self, value: Word) {
        match pushi_opcode(value) {
            Some(opcode) => self.place(opcode),
            None => {
                self.place(Opcode::Push.byte());
                self.words.push(value);
            }
        }
    }

    fn push_address(&mut self, address: UWord) {
        let pc = self.next_pc();
        let delta = address.wrapping_sub(pc) as Word;
        let short = (delta % WORD_BYTES as Word == 0)
            .then(|| delta / WORD_BYTES as Word)
            .filter(|&words| fits_immediate(words))
            .and_then(pushreli_opcode);
        match short {
            Some(opcode) => self.place(opcode),
            None => {
                self.place(Opcode::PushRel.byte());
                let at = self.here();
                self.words.push(address.wrapping_sub(at) as Word);
            }
        }
    }

    fn push_fixup(&mut self, label: Label) {
        self.place(Opcode::PushRel.byte());
        self.fixups.push(Fixup {
            at: self.words.len(),
            label,
        });
        self.words.push(0);
    }
}

/// Whether `value` survives a round trip through the top `bits` bits of a
/// word and is not one of the end-of-word markers.
fn fits_inline(value: Word, bits: u32) -> bool {
    if value == 0 || value == -1 {
        return false;
    }
    let spare = WORD_BITS - bits;
    (value << spare) >> spare == value
}
