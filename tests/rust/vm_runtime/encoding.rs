use mit_vm_runtime::asm::AsmError;
use mit_vm_runtime::bytecode::{
    immediate_value, pushi_opcode, pushreli_opcode, Decoded, Opcode, Word, OPCODE_BITS,
};
use mit_vm_runtime::disasm::{disassemble, format_number, words_from_bytes};
use mit_vm_runtime::{Assembler, ExecutionConfig, Insn, Machine};

#[test]
fn small_push_is_a_single_immediate_opcode() {
    let mut asm = Assembler::new(0);
    asm.push(10);
    let code = asm.finish().unwrap();
    assert_eq!(code.words, vec![pushi_opcode(10).unwrap() as Word]);

    let lines = disassemble(&code.words, code.base);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].insn, Insn::Push(10));
    assert_eq!(lines[0].text, "push (0xa=10)");
    assert_eq!(lines[0].to_string(), "0x00000000: push (0xa=10)");
}

#[test]
fn large_push_takes_a_literal_word() {
    let mut asm = Assembler::new(0);
    asm.push(1000).push(-5);
    let code = asm.finish().unwrap();
    assert_eq!(code.words.len(), 2);
    assert_eq!(code.words[0] & 0xff, Opcode::Push.byte() as Word);
    assert_eq!(code.words[1], 1000);

    let texts: Vec<_> = disassemble(&code.words, 0)
        .into_iter()
        .map(|line| line.text)
        .collect();
    assert_eq!(texts, ["push (0x3e8=1000)", "push (-0x5=-5)"]);
}

#[test]
fn immediates_sign_extend_six_bits() {
    for value in -32..32 {
        let opcode = pushi_opcode(value).unwrap();
        assert_eq!(immediate_value(opcode), value);
        assert_eq!(Decoded::from_byte(opcode), Decoded::PushI(value));
        let relative = pushreli_opcode(value).unwrap();
        assert_eq!(Decoded::from_byte(relative), Decoded::PushRelI(value));
    }
    assert_eq!(pushi_opcode(32), None);
    assert_eq!(pushi_opcode(-33), None);
    assert_eq!(Decoded::from_byte(0x21), Decoded::Undefined(0x21));
}

#[test]
fn non_terminals_share_a_word_until_the_terminal() {
    let mut asm = Assembler::new(0);
    asm.push(1).push(2).op(Opcode::Add).unwrap();
    asm.extra(1);
    asm.push(3);
    let code = asm.finish().unwrap();

    assert_eq!(code.words.len(), 2);
    let first = code.words[0];
    assert_eq!(first & 0xff, pushi_opcode(1).unwrap() as Word);
    assert_eq!((first >> 16) & 0xff, Opcode::Add.byte() as Word);
    assert_eq!((first >> 24) & 0xff, Opcode::Extra.byte() as Word);
    assert_eq!(first >> 32, 1);
    assert_eq!(code.words[1], pushi_opcode(3).unwrap() as Word);
}

#[test]
fn a_full_word_spills_into_the_next() {
    let mut asm = Assembler::new(0);
    for value in 0..8 {
        asm.push(value);
    }
    assert_eq!(asm.here(), 8);
    asm.push(8);
    let code = asm.finish().unwrap();
    assert_eq!(code.words.len(), 2);
    assert_eq!(code.words[1], pushi_opcode(8).unwrap() as Word);
}

#[test]
fn disassembly_recovers_what_was_assembled() {
    let base = 0x1000;
    let program = [
        Insn::Op(Opcode::Add),
        Insn::Push(10),
        Insn::Push(1000),
        Insn::Push(-5),
        Insn::Op(Opcode::Not),
        Insn::PushRel(base),
        Insn::PushRel(0x9000),
        Insn::Invalid(0x21),
        Insn::Terminal(Opcode::Jump, 3),
        Insn::Push(-32),
        Insn::Push(31),
        Insn::Push(32),
        Insn::Terminal(Opcode::Jumpz, -2),
        Insn::Op(Opcode::Mul),
        Insn::Terminal(Opcode::Call, 100),
        Insn::Op(Opcode::Swap),
        Insn::Terminal(Opcode::Extra, 0x203),
        Insn::Op(Opcode::Load4),
        Insn::Op(Opcode::Jump),
    ];
    let mut asm = Assembler::new(base);
    asm.emit_all(program).unwrap();
    let code = asm.finish().unwrap();

    let decoded: Vec<Insn> = disassemble(&code.words, base)
        .into_iter()
        .map(|line| line.insn)
        .collect();
    assert_eq!(decoded, program);

    let bytes = code.to_bytes();
    assert_eq!(words_from_bytes(&bytes), code.words);
}

#[test]
fn inline_branches_render_their_targets() {
    let mut asm = Assembler::new(0);
    asm.emit(Insn::Terminal(Opcode::Jump, 3)).unwrap();
    asm.emit(Insn::Terminal(Opcode::Extra, 0x203)).unwrap();
    let code = asm.finish().unwrap();

    let texts: Vec<_> = disassemble(&code.words, 0)
        .into_iter()
        .map(|line| line.text)
        .collect();
    // The jump's pc is 8 once its word is fetched; 3 words on is 0x20.
    assert_eq!(texts, ["jump 3 ; (0x20=32)", "extra 2:3"]);
}

#[test]
fn assembler_rejects_impossible_encodings() {
    let mut asm = Assembler::new(0);
    assert_eq!(
        asm.emit(Insn::Terminal(Opcode::Add, 4)).unwrap_err(),
        AsmError::NotTerminal(Opcode::Add)
    );
    assert_eq!(
        asm.emit(Insn::Terminal(Opcode::Jump, 0)).unwrap_err(),
        AsmError::InvalidOperand {
            op: Opcode::Jump,
            operand: 0
        }
    );
    assert_eq!(
        asm.emit(Insn::Op(Opcode::Push)).unwrap_err(),
        AsmError::MissingLiteral(Opcode::Push)
    );

    let label = asm.new_label();
    asm.jump_to(label).unwrap();
    assert_eq!(asm.finish().unwrap_err(), AsmError::UnboundLabel(label));
}

#[test]
fn labels_resolve_forward_and_backward() {
    let mut asm = Assembler::new(0);
    let skip = asm.new_label();
    let back = asm.new_label();
    asm.push(0).jumpz_to(skip).unwrap();
    asm.push(99);
    asm.bind(back).unwrap();
    asm.push(0).push(7).push(1).op(Opcode::Swap).unwrap();
    asm.push(0).extra(1);
    asm.bind(skip).unwrap();
    asm.push(5);
    asm.push(0).jumpz_to(back).unwrap();
    assert_eq!(asm.bind(back).unwrap_err(), AsmError::Rebound(back));
    let code = asm.finish().unwrap();

    let mut vm = Machine::new(ExecutionConfig {
        memory_bytes: 1024,
        stack_words: 16,
        ..ExecutionConfig::default()
    });
    code.load_into(&mut vm).unwrap();
    vm.run().expect("program halts");
    // 99 is skipped; SWAP exchanges the 5 and the 7.
    assert_eq!(vm.stack(), &[7, 0, 5, 0]);
}

#[test]
fn opcode_bytes_leave_room_for_inline_operands() {
    assert_eq!(OPCODE_BITS, 8);
    assert_eq!(format_number(0), "(0x0=0)");
    assert_eq!(format_number(-32), "(-0x20=-32)");
    for op in Opcode::ALL {
        assert_eq!(Opcode::from_byte(op.byte()), Some(op));
    }
}
