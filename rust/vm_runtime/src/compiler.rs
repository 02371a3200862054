//! Stack-cache compiler.
//!
//! [`compile_block`] translates the opcodes of one instruction word into a
//! [`Block`] of micro-ops, keeping recently produced values in registers.
//! The bookkeeping is a [`CacheState`]: how many top-of-stack slots live in
//! registers, and how many further pushes are already known to fit.
//!
//! Instructions with a fixed stack effect are compiled inline.  Everything
//! else (terminals, variadic instructions, traps and undefined opcodes) is a
//! block boundary: the cache is joined with the empty state, which writes it
//! all back, and the instruction runs through the ordinary interpreter.

use std::cmp::min;

use tracing::trace;

use crate::bytecode::{
    has_inline_operand, instructions, Action, Word, OPCODE_BITS, OPCODE_MASK,
};
use crate::effect::{StackEffect, MAX_ITEMS};
use crate::ir::{Block, Op, Reg, Step};

/// Upper bound on cached stack slots.
pub const MAX_CACHE_REGISTERS: usize = 64;

/// Register-cache bookkeeping at one point in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheState {
    /// Top-of-stack slots held in registers.
    pub cached_depth: u64,
    /// Pushes already known not to overflow.
    pub checked_depth: u64,
}

impl CacheState {
    pub const EMPTY: CacheState = CacheState {
        cached_depth: 0,
        checked_depth: 0,
    };

    /// State valid on both incoming edges of a join.
    pub fn join(self, other: CacheState) -> CacheState {
        CacheState {
            cached_depth: min(self.cached_depth, other.cached_depth),
            checked_depth: min(self.checked_depth, other.checked_depth),
        }
    }
}

/// Compile the opcodes in `word` with at most `cache_registers` cached slots.
///
/// The block ends after the first terminal instruction or, when the word
/// runs out, just before the implicit `NEXT`.
pub fn compile_block(word: Word, cache_registers: usize) -> Block {
    let mut compiler = BlockCompiler::new(cache_registers.min(MAX_CACHE_REGISTERS));
    let table = instructions();
    let mut steps = Vec::new();
    let mut ir = word;
    while has_inline_operand(ir) {
        let opcode = (ir & OPCODE_MASK) as u8;
        let spill = compiler.layout();
        let instruction = table.get(opcode);
        let fixed = instruction
            .filter(|instruction| !instruction.is_terminal())
            .and_then(|instruction| instruction.effect.as_ref())
            .filter(|effect| !effect.is_variadic());
        let ops = match (instruction, fixed) {
            (Some(instruction), Some(effect)) => {
                compiler.compile_fixed(opcode, effect, instruction.action)
            }
            _ => {
                let mut ops = compiler.flush(CacheState::EMPTY);
                ops.push(Op::Generic);
                ops
            }
        };
        steps.push(Step {
            opcode,
            ir,
            spill,
            ops,
        });
        let ends_block = instruction.map_or(true, |instruction| instruction.is_terminal());
        if ends_block {
            break;
        }
        ir >>= OPCODE_BITS;
    }
    let exit = compiler.flush(CacheState::EMPTY);
    let block = Block {
        word,
        steps,
        exit,
        registers: compiler.registers,
    };
    trace!(
        word = format_args!("{word:#x}"),
        steps = block.steps.len(),
        ops = block.op_count(),
        "compiled block"
    );
    block
}

struct BlockCompiler {
    budget: usize,
    registers: usize,
    /// Register for each cached slot, top first.
    cache: Vec<Reg>,
    free: Vec<Reg>,
    checked_depth: u64,
}

impl BlockCompiler {
    fn new(budget: usize) -> Self {
        // Cached slots plus loaded arguments plus fresh results.
        let registers = budget + 2 * MAX_ITEMS;
        Self {
            budget,
            registers,
            cache: Vec::with_capacity(budget),
            free: (0..registers as u16).rev().map(Reg).collect(),
            checked_depth: 0,
        }
    }

    fn state(&self) -> CacheState {
        CacheState {
            cached_depth: self.cache.len() as u64,
            checked_depth: self.checked_depth,
        }
    }

    fn layout(&self) -> Vec<(Reg, u64)> {
        self.cache
            .iter()
            .enumerate()
            .map(|(depth, reg)| (*reg, depth as u64))
            .collect()
    }

    fn allocate(&mut self) -> Reg {
        self.free.pop().unwrap_or_else(|| {
            self.registers += 1;
            Reg(self.registers as u16 - 1)
        })
    }

    fn release(&mut self, reg: Reg) {
        self.free.push(reg);
    }

    /// Write back cached slots until the cache matches `state.join(target)`.
    fn flush(&mut self, target: CacheState) -> Vec<Op> {
        let joined = self.state().join(target);
        let mut ops = Vec::new();
        while self.cache.len() as u64 > joined.cached_depth {
            let depth = self.cache.len() - 1;
            if let Some(reg) = self.cache.pop() {
                ops.push(Op::Store {
                    reg,
                    depth: depth as u64,
                });
                self.release(reg);
            }
        }
        self.checked_depth = joined.checked_depth;
        ops
    }

    fn compile_fixed(
        &mut self,
        opcode: u8,
        effect: &StackEffect,
        action: Action,
    ) -> Vec<Op> {
        let mut ops = Vec::new();
        let (args, results) = effect.sizes(0);
        let cached = self.cache.len() as u64;
        if args > cached {
            ops.push(Op::CheckRead { depth: args - 1 });
        }
        let delta = results as i64 - args as i64;
        if delta > 0 && self.checked_depth < delta as u64 {
            ops.push(Op::CheckRoom {
                words: delta as u64,
            });
            self.checked_depth = delta as u64;
        }

        let mut arg_regs = Vec::with_capacity(MAX_ITEMS);
        let mut loaded = Vec::new();
        for item in effect.args().named() {
            let depth = item.depth.words;
            let reg = match self.cache.get(depth as usize) {
                Some(&reg) => reg,
                None => {
                    let reg = self.allocate();
                    ops.push(Op::Load { reg, depth });
                    loaded.push(reg);
                    reg
                }
            };
            arg_regs.push(reg);
        }

        let mut top = vec![Reg(0); results as usize];
        let mut result_regs = Vec::with_capacity(MAX_ITEMS);
        for (item, in_place) in effect.named_results() {
            let aliased = in_place
                .then(|| effect.args().named().position(|arg| arg.name == item.name))
                .flatten();
            let reg = match aliased {
                Some(index) => {
                    result_regs.push(None);
                    arg_regs[index]
                }
                None => {
                    let reg = self.allocate();
                    result_regs.push(Some(reg));
                    reg
                }
            };
            top[item.depth.words as usize] = reg;
        }

        ops.push(Op::Execute {
            opcode,
            action,
            args: arg_regs,
            results: result_regs,
        });
        if delta != 0 {
            ops.push(Op::Adjust(delta));
        }

        let consumed = min(args as usize, self.cache.len());
        let dead: Vec<Reg> = self
            .cache
            .drain(..consumed)
            .chain(loaded)
            .filter(|reg| !top.contains(reg))
            .collect();
        for reg in dead {
            self.release(reg);
        }
        self.cache.splice(0..0, top);

        while self.cache.len() > self.budget {
            let depth = self.cache.len() - 1;
            if let Some(reg) = self.cache.pop() {
                ops.push(Op::Store {
                    reg,
                    depth: depth as u64,
                });
                self.release(reg);
            }
        }

        self.checked_depth = if delta > 0 {
            self.checked_depth - delta as u64
        } else {
            self.checked_depth.saturating_add(delta.unsigned_abs())
        };
        ops
    }
}
