//! Profiling block runner.
//!
//! The [`Specializer`] drives a [`Machine`] the way `Machine::run` does, but
//! once an instruction word has been fetched often enough it compiles the
//! word into a stack-cached [`Block`] and runs that instead of dispatching
//! opcode by opcode.  Compiling a word also compiles the words the profiler
//! expects to follow it.  Observable behaviour is identical to the plain loop:
//! every step still passes through the sandbox, and a failing step writes
//! its cached values back and restores `pc` and `ir` before the error is
//! returned.

use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::{
    has_inline_operand, instructions, Operands, Word, OPCODE_BITS, OPCODE_MASK,
};
use crate::compiler::compile_block;
use crate::interpreter::{Machine, VmError};
use crate::ir::{Block, Op, Step};
use crate::profile::Profiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecializerConfig {
    /// Stack slots kept in registers; 0 writes every result straight back.
    pub cache_registers: usize,
    /// Fetches of a word before it is compiled.
    pub compile_threshold: u64,
    /// Length of the paths tracked by the profiler.
    pub path_depth: usize,
}

impl Default for SpecializerConfig {
    fn default() -> Self {
        Self {
            cache_registers: 4,
            compile_threshold: 2,
            path_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecializerStats {
    pub blocks_compiled: u64,
    /// Compiled because the profiler predicted them, before they were hot.
    pub blocks_predicted: u64,
    pub block_runs: u64,
    pub plain_steps: u64,
}

#[derive(Debug)]
pub struct Specializer {
    config: SpecializerConfig,
    blocks: HashMap<Word, Rc<Block>>,
    profiler: Profiler,
    registers: Vec<Word>,
    stats: SpecializerStats,
}

impl Default for Specializer {
    fn default() -> Self {
        Self::new(SpecializerConfig::default())
    }
}

impl Specializer {
    pub fn new(config: SpecializerConfig) -> Self {
        Self {
            config,
            blocks: HashMap::new(),
            profiler: Profiler::new(config.path_depth),
            registers: Vec::new(),
            stats: SpecializerStats::default(),
        }
    }

    pub fn config(&self) -> SpecializerConfig {
        self.config
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn stats(&self) -> SpecializerStats {
        self.stats
    }

    pub fn block(&self, word: Word) -> Option<&Block> {
        self.blocks.get(&word).map(Rc::as_ref)
    }

    /// Compile `word` now rather than waiting for it to become hot.
    pub fn precompile(&mut self, word: Word) -> Rc<Block> {
        self.compiled(word)
    }

    /// Compile every word the profiler has seen at least `min_count` times.
    pub fn precompile_hot(&mut self, min_count: u64) -> usize {
        let hot = self.profiler.hot_words(min_count);
        for entry in &hot {
            self.compiled(entry.word);
        }
        hot.len()
    }

    /// Run `vm` until an error; `THROW 0` ends the run successfully.
    pub fn run(&mut self, vm: &mut Machine) -> Result<(), VmError> {
        vm.sandbox.start_run();
        loop {
            match self.dispatch(vm) {
                Ok(()) => {}
                Err(VmError::Halt) => return Ok(()),
                Err(error) if vm.recover(&error) => {}
                Err(error) => return Err(vm.stopped(error)),
            }
        }
    }

    /// Execute the rest of the current word.
    fn dispatch(&mut self, vm: &mut Machine) -> Result<(), VmError> {
        if !has_inline_operand(vm.ir) {
            vm.observed_step()?;
            self.profiler.record(vm.ir);
            return Ok(());
        }
        let word = vm.ir;
        let known = self.blocks.contains_key(&word);
        if known || self.profiler.count(word) >= self.config.compile_threshold {
            let block = self.compiled(word);
            if !known {
                self.compile_predicted(word);
            }
            self.stats.block_runs += 1;
            return self.run_block(vm, &block);
        }
        self.plain_word(vm)
    }

    /// Step through the current word without compiling it.
    fn plain_word(&mut self, vm: &mut Machine) -> Result<(), VmError> {
        while has_inline_operand(vm.ir) {
            let opcode = (vm.ir & OPCODE_MASK) as u8;
            let terminal = instructions()
                .get(opcode)
                .map_or(true, |instruction| instruction.is_terminal());
            vm.observed_step()?;
            self.stats.plain_steps += 1;
            if terminal {
                break;
            }
        }
        Ok(())
    }

    fn compiled(&mut self, word: Word) -> Rc<Block> {
        if let Some(block) = self.blocks.get(&word) {
            return Rc::clone(block);
        }
        let block = Rc::new(compile_block(word, self.config.cache_registers));
        self.stats.blocks_compiled += 1;
        self.blocks.insert(word, Rc::clone(&block));
        block
    }

    /// Compile the most likely words to follow `word`, as far ahead as the
    /// profiler tracks paths.
    fn compile_predicted(&mut self, word: Word) {
        let mut path = vec![word];
        while let Some(next) = self.profiler.predict(&path) {
            if has_inline_operand(next) && !self.blocks.contains_key(&next) {
                self.compiled(next);
                self.stats.blocks_predicted += 1;
            }
            path.push(next);
        }
    }

    fn run_block(&mut self, vm: &mut Machine, block: &Block) -> Result<(), VmError> {
        if self.registers.len() < block.registers {
            self.registers.resize(block.registers, 0);
        }
        for step in &block.steps {
            let pc = vm.pc;
            if let Err(error) = self.run_step(vm, step) {
                for &(reg, depth) in &step.spill {
                    vm.stack.store(depth, self.registers[reg.index()])?;
                }
                vm.fail(pc, step.ir, &error);
                return Err(error);
            }
        }
        for op in &block.exit {
            self.execute(vm, op, block.word)?;
        }
        Ok(())
    }

    fn run_step(&mut self, vm: &mut Machine, step: &Step) -> Result<(), VmError> {
        vm.sandbox.observe_instruction()?;
        for op in &step.ops {
            self.execute(vm, op, step.ir)?;
        }
        if !step.is_generic() {
            vm.ir = step.ir >> OPCODE_BITS;
        }
        vm.sandbox.record_stack_depth(vm.stack.depth());
        Ok(())
    }

    fn execute(&mut self, vm: &mut Machine, op: &Op, ir: Word) -> Result<(), VmError> {
        let registers = &mut self.registers;
        match op {
            Op::CheckRead { depth } => vm.stack.check_read(*depth)?,
            Op::CheckRoom { words } => vm.stack.check_room(*words)?,
            Op::Load { reg, depth } => registers[reg.index()] = vm.stack.load(*depth)?,
            Op::Store { reg, depth } => vm.stack.store(*depth, registers[reg.index()])?,
            Op::Execute {
                opcode,
                action,
                args,
                results,
            } => {
                let mut operands = Operands {
                    opcode: *opcode,
                    ..Operands::default()
                };
                for (slot, reg) in operands.args.iter_mut().zip(args) {
                    *slot = registers[reg.index()];
                }
                action(vm, &mut operands)?;
                for (value, reg) in operands.results.iter().zip(results) {
                    if let Some(reg) = reg {
                        registers[reg.index()] = *value;
                    }
                }
            }
            Op::Adjust(delta) => vm.stack.adjust(*delta)?,
            Op::Generic => {
                vm.ir = ir;
                vm.step()?;
            }
        }
        Ok(())
    }
}
