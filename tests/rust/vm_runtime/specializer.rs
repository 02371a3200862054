use mit_vm_runtime::builtins::{core_extras, selector};
use mit_vm_runtime::bytecode::{pushi_opcode, Opcode, UWord, Word};
use mit_vm_runtime::compiler::{compile_block, CacheState};
use mit_vm_runtime::ir::Op;
use mit_vm_runtime::profile::Profiler;
use mit_vm_runtime::stack::StackError;
use mit_vm_runtime::{Assembler, ExecutionConfig, Machine, Specializer, SpecializerConfig, VmError};

const THROW: Word = selector(core_extras::LIBRARY, core_extras::THROW);
const COUNTER: Word = 8;
const STACK_WORDS: usize = 8;

#[derive(Debug, PartialEq, Eq)]
struct Outcome {
    result: Result<(), VmError>,
    pc: UWord,
    ir: Word,
    bad: Word,
    stack: Vec<Word>,
    memory: Vec<u8>,
}

fn packed(bytes: &[u8]) -> Word {
    bytes
        .iter()
        .rev()
        .fold(0, |word, &byte| (word << 8) | byte as Word)
}

fn pushi(value: Word) -> u8 {
    pushi_opcode(value).expect("value fits an immediate")
}

fn machine(asm: &Assembler, counter: Word) -> Machine {
    let mut vm = Machine::new(ExecutionConfig {
        memory_bytes: 2048,
        stack_words: STACK_WORDS,
        ..ExecutionConfig::default()
    });
    asm.clone().finish().unwrap().load_into(&mut vm).unwrap();
    vm.store_word(COUNTER as UWord, counter).unwrap();
    vm
}

fn outcome(vm: Machine, result: Result<(), VmError>) -> Outcome {
    Outcome {
        result,
        pc: vm.pc(),
        ir: vm.ir(),
        bad: vm.bad(),
        stack: vm.stack().to_vec(),
        memory: vm.memory().to_vec(),
    }
}

fn plain(asm: &Assembler, counter: Word) -> Outcome {
    let mut vm = machine(asm, counter);
    let result = vm.run();
    outcome(vm, result)
}

fn specialized(asm: &Assembler, counter: Word, cache_registers: usize) -> (Outcome, Specializer) {
    let mut vm = machine(asm, counter);
    let mut specializer = Specializer::new(SpecializerConfig {
        cache_registers,
        compile_threshold: 1,
        ..SpecializerConfig::default()
    });
    let result = specializer.run(&mut vm);
    (outcome(vm, result), specializer)
}

/// Decrements the counter in memory and divides 30 by it until the
/// division faults.
fn divide_down() -> Assembler {
    let mut asm = Assembler::new(0x100);
    let top = asm.new_label();
    asm.bind(top).unwrap();
    asm.push(COUNTER).op(Opcode::Load).unwrap();
    asm.push(-1).op(Opcode::Add).unwrap();
    asm.push(COUNTER).op(Opcode::Store).unwrap();
    asm.push(30).push(COUNTER).op(Opcode::Load).unwrap();
    asm.op(Opcode::Divmod).unwrap();
    asm.push(2).op(Opcode::Pop).unwrap();
    asm.jump_to(top).unwrap();
    asm
}

/// Sums the counter down to zero, leaving `[sum, 0]` at the halt.
fn sum_down() -> Assembler {
    let mut asm = Assembler::new(0x100);
    let top = asm.new_label();
    let done = asm.new_label();
    asm.push(0);
    asm.bind(top).unwrap();
    asm.push(COUNTER).op(Opcode::Load).unwrap();
    asm.push(0).op(Opcode::Dup).unwrap();
    asm.jumpz_to(done).unwrap();
    asm.op(Opcode::Add).unwrap();
    asm.push(COUNTER).op(Opcode::Load).unwrap();
    asm.push(-1).op(Opcode::Add).unwrap();
    asm.push(COUNTER).op(Opcode::Store).unwrap();
    asm.jump_to(top).unwrap();
    asm.bind(done).unwrap();
    asm.push(1).op(Opcode::Pop).unwrap();
    asm.push(0).extra(THROW);
    asm
}

/// Nets one extra word per pass until a push no longer fits.
fn fill_up() -> Assembler {
    let mut asm = Assembler::new(0x100);
    let top = asm.new_label();
    asm.bind(top).unwrap();
    asm.push(1).push(2).op(Opcode::Add).unwrap();
    asm.jump_to(top).unwrap();
    asm
}

/// Nets one word fewer per pass; the second ADD of the third pass underflows
/// with the first ADD's result still cached.
fn drain() -> Assembler {
    let mut asm = Assembler::new(0x100);
    let top = asm.new_label();
    asm.push(5).push(6).push(7);
    asm.bind(top).unwrap();
    asm.push(1).op(Opcode::Add).unwrap();
    asm.op(Opcode::Add).unwrap();
    asm.jump_to(top).unwrap();
    asm
}

#[test]
fn compiled_loop_matches_the_interpreter() {
    let program = sum_down();
    let expected = plain(&program, 10);
    assert_eq!(expected.result, Ok(()));
    assert_eq!(expected.stack, [55, 0]);

    for cache_registers in [0, 1, 4, 16] {
        let (actual, specializer) = specialized(&program, 10, cache_registers);
        assert_eq!(actual, expected, "cache_registers = {cache_registers}");
        let stats = specializer.stats();
        assert!(stats.blocks_compiled > 0);
        assert!(stats.block_runs > 0);
    }
}

#[test]
fn faults_inside_blocks_restore_the_interpreter_state() {
    let program = divide_down();
    let expected = plain(&program, 4);
    assert_eq!(expected.result, Err(VmError::DivisionByZero));
    assert_eq!(expected.stack, [30, 0]);

    for cache_registers in [0, 4] {
        let (actual, _) = specialized(&program, 4, cache_registers);
        assert_eq!(actual, expected, "cache_registers = {cache_registers}");
    }

    let program = fill_up();
    let expected = plain(&program, 0);
    assert_eq!(
        expected.result,
        Err(VmError::Stack(StackError::Overflow { shortfall: 1 }))
    );
    assert_eq!(expected.stack.len(), STACK_WORDS);

    let underflow = drain();
    let drained = plain(&underflow, 0);
    assert_eq!(
        drained.result,
        Err(VmError::Stack(StackError::InvalidRead { depth: 1 }))
    );
    assert_eq!(drained.stack, [21]);
    assert_eq!(drained.bad, 1);

    for cache_registers in [0, 1, 4, 8] {
        let (actual, _) = specialized(&program, 0, cache_registers);
        assert_eq!(actual, expected, "overflow, cache_registers = {cache_registers}");
        let (actual, _) = specialized(&underflow, 0, cache_registers);
        assert_eq!(actual, drained, "underflow, cache_registers = {cache_registers}");
    }
}

#[test]
fn thrown_codes_survive_specialization() {
    let mut asm = Assembler::new(0x100);
    asm.push(3).push(4).op(Opcode::Mul).unwrap();
    asm.extra(THROW);
    let expected = plain(&asm, 0);
    assert_eq!(expected.result, Err(VmError::Thrown(12)));

    let (actual, _) = specialized(&asm, 0, 4);
    assert_eq!(actual, expected);
}

#[test]
fn hot_words_are_compiled_once() {
    let program = sum_down();
    let (_, mut specializer) = specialized(&program, 10, 4);
    let compiled = specializer.stats().blocks_compiled;

    let hot = specializer.profiler().hot_words(10);
    assert!(!hot.is_empty());
    assert!(hot.windows(2).all(|pair| pair[0].count >= pair[1].count));
    for entry in &hot {
        assert!(specializer.block(entry.word).is_some());
    }
    specializer.precompile_hot(10);
    assert_eq!(specializer.stats().blocks_compiled, compiled);
}

#[test]
fn predicted_successors_compile_before_they_are_hot() {
    let program = sum_down();
    let expected = plain(&program, 10);

    let mut vm = machine(&program, 10);
    let mut specializer = Specializer::new(SpecializerConfig {
        compile_threshold: 3,
        path_depth: 3,
        ..SpecializerConfig::default()
    });
    let result = specializer.run(&mut vm);
    assert_eq!(outcome(vm, result), expected);

    // The loop's second word is compiled when the first one turns hot, one
    // fetch before it would reach the threshold itself.
    let stats = specializer.stats();
    assert!(stats.blocks_predicted >= 1);
    assert!(stats.blocks_compiled >= stats.blocks_predicted);
    assert!(stats.blocks_compiled > 0);
}

#[test]
fn cached_operands_skip_stack_checks() {
    let word = packed(&[pushi(1), pushi(2), Opcode::Add.byte()]);
    let is_check_read = |op: &Op| matches!(op, Op::CheckRead { .. });
    let is_load = |op: &Op| matches!(op, Op::Load { .. });

    let cached = compile_block(word, 4);
    assert_eq!(cached.steps.len(), 3);
    assert_eq!(cached.count_ops(is_check_read), 0);
    assert_eq!(cached.count_ops(is_load), 0);
    assert_eq!(cached.exit.len(), 1);

    let uncached = compile_block(word, 0);
    assert_eq!(uncached.count_ops(is_check_read), 1);
    assert_eq!(uncached.count_ops(is_load), 2);
    assert!(uncached.exit.is_empty());
}

#[test]
fn room_freed_by_a_pop_is_not_rechecked() {
    let word = packed(&[Opcode::Add.byte(), pushi(1)]);
    let block = compile_block(word, 4);
    let is_check_room = |op: &Op| matches!(op, Op::CheckRoom { .. });
    assert_eq!(block.count_ops(is_check_room), 0);
    assert_eq!(block.count_ops(|op| matches!(op, Op::CheckRead { depth: 1 })), 1);
}

#[test]
fn terminals_and_variadic_instructions_fall_back() {
    let word = packed(&[pushi(1), Opcode::Jump.byte(), pushi(2)]);
    let block = compile_block(word, 4);
    assert_eq!(block.steps.len(), 2);
    assert!(!block.steps[0].is_generic());
    assert!(block.steps[1].is_generic());
    // The cached push is written back before the jump runs.
    assert!(matches!(block.steps[1].ops[0], Op::Store { depth: 0, .. }));

    let word = packed(&[pushi(0), Opcode::Dup.byte(), Opcode::Add.byte()]);
    let block = compile_block(word, 4);
    assert!(block.steps[1].is_generic());
    assert!(!block.steps[2].is_generic());
}

#[test]
fn cache_states_join_to_the_minimum() {
    let left = CacheState {
        cached_depth: 3,
        checked_depth: 2,
    };
    let right = CacheState {
        cached_depth: 1,
        checked_depth: 5,
    };
    assert_eq!(
        left.join(right),
        CacheState {
            cached_depth: 1,
            checked_depth: 2
        }
    );
    assert_eq!(left.join(right), right.join(left));
    assert_eq!(left.join(CacheState::EMPTY), CacheState::EMPTY);
}

#[test]
fn profiler_predicts_the_usual_successor() {
    let mut profiler = Profiler::new(3);
    for word in [1, 2, 3, 1, 2, 3, 1, 2, 4] {
        profiler.record(word);
    }
    assert_eq!(profiler.count(1), 3);
    assert_eq!(profiler.count(4), 1);
    assert_eq!(profiler.path_count(&[1, 2]), 3);
    assert_eq!(profiler.path_count(&[2, 3, 1]), 2);
    assert_eq!(profiler.predict(&[1, 2]), Some(3));
    assert_eq!(profiler.predict(&[2]), Some(3));
    assert_eq!(profiler.predict(&[]), Some(1));
    assert_eq!(profiler.predict(&[1, 2, 3]), None);

    let hot: Vec<_> = profiler.hot_words(2).iter().map(|entry| entry.word).collect();
    assert_eq!(hot, [1, 2, 3]);

    profiler.clear();
    assert_eq!(profiler.count(1), 0);
    assert_eq!(profiler.predict(&[]), None);
}
