//! Execution trace collection.
//!
//! `Machine::run_traced` hands a [`TraceEvent`] to a [`TraceSink`] before each
//! instruction, and the sink decides whether to continue.  This is the hook
//! debuggers and single-step tooling build on.  [`TraceCollector`] is the
//! stock sink: it records the executed instructions, the fetch addresses that
//! were visited and a handful of aggregate counters, and produces a
//! serialisable [`ExecutionTrace`] once the run is over.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::bytecode::{instructions, UWord, Word};
use crate::sandbox::SandboxMetrics;

/// Machine state just before an instruction executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub pc: UWord,
    /// `ir` before the opcode is shifted out.
    pub ir: Word,
    pub opcode: u8,
    pub stack_depth: usize,
}

/// Sink verdict for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceControl {
    Continue,
    /// Stop before the instruction; the run returns `Break`.
    Break,
}

pub trait TraceSink {
    fn instruction(&mut self, event: &TraceEvent) -> TraceControl;
}

impl<F> TraceSink for F
where
    F: FnMut(&TraceEvent) -> TraceControl,
{
    fn instruction(&mut self, event: &TraceEvent) -> TraceControl {
        self(event)
    }
}

/// Everything a [`TraceCollector`] saw, ready for JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub steps: Vec<TraceStep>,
    pub coverage: TraceCoverage,
    pub metrics: TraceMetrics,
}

impl ExecutionTrace {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, self)
    }
}

/// One executed instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub pc: UWord,
    pub opcode: u8,
    pub name: String,
    pub stack_depth: usize,
}

/// Instruction fetch addresses reached during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCoverage {
    pub addresses: Vec<UWord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetrics {
    pub instructions: u64,
    pub opcode_counts: BTreeMap<String, u64>,
    /// Times control moved to a lower address.
    pub backward_branches: u64,
    pub max_stack_depth: usize,
    pub sandbox: SandboxMetrics,
}

/// Sink recording every instruction, optionally stopping after a budget.
#[derive(Debug, Default)]
pub struct TraceCollector {
    steps: Vec<TraceStep>,
    coverage: BTreeSet<UWord>,
    opcode_counts: BTreeMap<u8, u64>,
    instruction_count: u64,
    backward_branches: u64,
    max_stack_depth: usize,
    last_pc: Option<UWord>,
    break_after: Option<u64>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a `Break` once `instructions` have been recorded.
    pub fn break_after(mut self, instructions: u64) -> Self {
        self.break_after = Some(instructions);
        self
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn finish(self, sandbox: SandboxMetrics) -> ExecutionTrace {
        let table = instructions();
        let opcode_counts = self
            .opcode_counts
            .into_iter()
            .map(|(opcode, count)| (opcode_name(table, opcode), count))
            .collect();
        ExecutionTrace {
            steps: self.steps,
            coverage: TraceCoverage {
                addresses: self.coverage.into_iter().collect(),
            },
            metrics: TraceMetrics {
                instructions: self.instruction_count,
                opcode_counts,
                backward_branches: self.backward_branches,
                max_stack_depth: self.max_stack_depth,
                sandbox,
            },
        }
    }
}

impl TraceSink for TraceCollector {
    fn instruction(&mut self, event: &TraceEvent) -> TraceControl {
        if self.break_after == Some(self.instruction_count) {
            return TraceControl::Break;
        }
        if self.last_pc.is_some_and(|last| event.pc < last) {
            self.backward_branches += 1;
        }
        self.last_pc = Some(event.pc);
        self.instruction_count += 1;
        *self.opcode_counts.entry(event.opcode).or_default() += 1;
        self.max_stack_depth = self.max_stack_depth.max(event.stack_depth);
        self.coverage.insert(event.pc);
        self.steps.push(TraceStep {
            pc: event.pc,
            opcode: event.opcode,
            name: opcode_name(instructions(), event.opcode),
            stack_depth: event.stack_depth,
        });
        TraceControl::Continue
    }
}

fn opcode_name(table: &crate::bytecode::InstructionTable, opcode: u8) -> String {
    match table.get(opcode) {
        Some(instruction) => instruction.name.clone(),
        None => format!("INVALID_{opcode:#04x}"),
    }
}
