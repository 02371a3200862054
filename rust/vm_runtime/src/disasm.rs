//! Disassembler for Mit instruction words.
//!
//! Decoding follows the interpreter's own `pc`/`ir` state machine, so literal
//! words are attributed to the instruction that consumes them and relative
//! addresses are shown as the absolute addresses they produce.  Each
//! instruction becomes a [`Line`] holding both the symbolic [`Insn`] and a
//! stable text rendering.

use std::fmt;

use crate::asm::Insn;
use crate::bytecode::{
    has_inline_operand, Decoded, Opcode, UWord, Word, OPCODE_BITS, OPCODE_MASK, WORD_BYTES,
};

/// One decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    /// Address of the instruction word holding the opcode.
    pub address: UWord,
    pub insn: Insn,
    pub text: String,
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}: {}", self.address, self.text)
    }
}

/// Render a number as `(0xa=10)` or `(-0x5=-5)`.
pub fn format_number(value: Word) -> String {
    if value < 0 {
        format!("(-{:#x}={})", value.unsigned_abs(), value)
    } else {
        format!("({value:#x}={value})")
    }
}

/// Reinterpret memory bytes as words; a trailing partial word is dropped.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<Word> {
    bytes
        .chunks_exact(WORD_BYTES)
        .map(|chunk| {
            let mut word = [0u8; WORD_BYTES];
            word.copy_from_slice(chunk);
            Word::from_ne_bytes(word)
        })
        .collect()
}

/// Disassemble `words`, the first of which sits at `base`.
pub fn disassemble(words: &[Word], base: UWord) -> Vec<Line> {
    let address_of = |index: usize| base + (index * WORD_BYTES) as UWord;
    let mut lines = Vec::new();
    let mut next = 0;
    while next < words.len() {
        let address = address_of(next);
        let mut ir = words[next];
        next += 1;
        while ir != 0 && ir != -1 {
            let opcode = (ir & OPCODE_MASK) as u8;
            ir >>= OPCODE_BITS;
            // `pc` as the instruction sees it.
            let pc = address_of(next);
            let insn = match Decoded::from_byte(opcode) {
                Decoded::Named(op) if op.is_terminal() => {
                    let insn = if has_inline_operand(ir) {
                        Insn::Terminal(op, ir)
                    } else {
                        Insn::Op(op)
                    };
                    ir = 0;
                    insn
                }
                Decoded::Named(op @ (Opcode::Push | Opcode::PushRel)) => match words.get(next) {
                    Some(&literal) => {
                        next += 1;
                        if op == Opcode::Push {
                            Insn::Push(literal)
                        } else {
                            Insn::PushRel(pc.wrapping_add(literal as UWord))
                        }
                    }
                    None => Insn::Op(op),
                },
                Decoded::Named(op) => Insn::Op(op),
                Decoded::PushI(value) => Insn::Push(value),
                Decoded::PushRelI(n) => {
                    Insn::PushRel(pc.wrapping_add((n * WORD_BYTES as Word) as UWord))
                }
                Decoded::Undefined(byte) => Insn::Invalid(byte),
            };
            lines.push(Line {
                address,
                insn,
                text: render(&insn, pc),
            });
        }
    }
    lines
}

fn render(insn: &Insn, pc: UWord) -> String {
    match *insn {
        Insn::Op(op) => op.mnemonic().to_owned(),
        Insn::Push(value) => format!("push {}", format_number(value)),
        Insn::PushRel(address) => format!("pushrel {}", format_number(address as Word)),
        Insn::Terminal(op @ (Opcode::Jump | Opcode::Jumpz | Opcode::Call), words) => {
            let target = pc.wrapping_add((words as UWord).wrapping_mul(WORD_BYTES as UWord));
            format!("{op} {words} ; {}", format_number(target as Word))
        }
        Insn::Terminal(Opcode::Extra, selector) => {
            format!("extra {}:{}", selector >> 8, selector & 0xff)
        }
        Insn::Terminal(op, operand) => format!("{op} {}", format_number(operand)),
        Insn::Invalid(byte) => format!("invalid {byte:#04x}"),
    }
}
