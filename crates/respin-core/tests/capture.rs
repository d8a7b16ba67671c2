//! Capture-trace shape tests: decode a handcrafted function image, run the
//! emulator, and check what was folded versus captured. No generated code
//! is executed here.

use pretty_assertions::assert_eq;
use respin_core::capture;
use respin_core::state::{AbstractState, Value};
use respin_core::RewriteError;
use respin_x86::inst::{MemOperand, Mnemonic, Operand, Reg, Width};
use respin_x86::{decode_func, Trace};

const BASE: u64 = 0x10_0000;
const STACK: usize = 4096;

fn capture_with(code: &[u8], stop_at_ret: bool, setup: impl FnOnce(&mut AbstractState)) -> Trace {
    let decoded = decode_func(code, BASE, code.len(), stop_at_ret);
    let mut state = AbstractState::new(STACK);
    setup(&mut state);
    capture::run(&decoded, &mut state, 1 << 16).unwrap()
}

fn capture_err(code: &[u8], setup: impl FnOnce(&mut AbstractState)) -> RewriteError {
    let decoded = decode_func(code, BASE, code.len(), true);
    let mut state = AbstractState::new(STACK);
    setup(&mut state);
    capture::run(&decoded, &mut state, 256).unwrap_err()
}

#[test]
fn prologue_folds_to_plain_ret() {
    // push rbp; mov rbp, rsp; pop rbp; ret
    let code = [0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3];
    let trace = capture_with(&code, true, |_| {});
    let kinds: Vec<_> = trace.iter().map(|i| i.mnemonic).collect();
    assert_eq!(kinds, [Mnemonic::Ret]);
}

#[test]
fn lea_folds_static_base_into_displacement() {
    // lea rax, [rdi+rsi]; ret  — with rdi bound to 3.
    let code = [0x48, 0x8D, 0x04, 0x37, 0xC3];
    let trace = capture_with(&code, true, |s| {
        s.set_reg(Reg::Rdi, Value::Static(3));
    });

    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].mnemonic, Mnemonic::Lea);
    assert_eq!(trace[0].dst, Some(Operand::reg64(Reg::Rax)));
    assert_eq!(
        trace[0].src,
        Some(Operand::Mem(MemOperand::base_disp(Width::W64, Reg::Rsi, 3)))
    );
    assert_eq!(trace[1].mnemonic, Mnemonic::Ret);
}

#[test]
fn fully_static_body_materializes_the_result() {
    // mov rax, rdi; add rax, rsi; ret — both arguments bound.
    let code = [0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3];
    let trace = capture_with(&code, true, |s| {
        s.set_reg(Reg::Rdi, Value::Static(5));
        s.set_reg(Reg::Rsi, Value::Static(7));
    });

    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].mnemonic, Mnemonic::Mov);
    assert_eq!(trace[0].dst, Some(Operand::reg64(Reg::Rax)));
    assert_eq!(trace[0].src, Some(Operand::imm64(12)));
    assert_eq!(trace[1].mnemonic, Mnemonic::Ret);
}

#[test]
fn partially_static_op_materializes_the_destination() {
    // mov rax, rdi; add rax, rsi; ret — only rdi bound.
    let code = [0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3];
    let trace = capture_with(&code, true, |s| {
        s.set_reg(Reg::Rdi, Value::Static(5));
    });

    let kinds: Vec<_> = trace.iter().map(|i| i.mnemonic).collect();
    assert_eq!(kinds, [Mnemonic::Mov, Mnemonic::Add, Mnemonic::Ret]);
    // The materialized destination value...
    assert_eq!(trace[0].src, Some(Operand::imm64(5)));
    // ...feeding the captured add of the dynamic argument.
    assert_eq!(trace[1].src, Some(Operand::reg64(Reg::Rsi)));
}

#[test]
fn static_condition_selects_an_edge() {
    // cmp rdi, 10; jb taken; mov eax, 1; ret; taken: mov eax, 2; ret
    let code = [
        0x48, 0x83, 0xFF, 0x0A, // cmp rdi, 10
        0x72, 0x06, // jb +6
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xC3, // ret
        0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
        0xC3, // ret
    ];

    let below = capture_with(&code, false, |s| {
        s.set_reg(Reg::Rdi, Value::Static(5));
    });
    assert_eq!(below.len(), 2);
    assert_eq!(below[0].src, Some(Operand::imm64(2)));

    let above = capture_with(&code, false, |s| {
        s.set_reg(Reg::Rdi, Value::Static(50));
    });
    assert_eq!(above.len(), 2);
    assert_eq!(above[0].src, Some(Operand::imm64(1)));
}

#[test]
fn dynamic_branch_terminates_the_capture() {
    // dec rdi; jne -5; ret — nothing bound.
    let code = [0x48, 0xFF, 0xCF, 0x75, 0xFB, 0xC3];
    let trace = capture_with(&code, true, |_| {});

    let kinds: Vec<_> = trace.iter().map(|i| i.mnemonic).collect();
    assert_eq!(kinds, [Mnemonic::Dec, Mnemonic::Jcc, Mnemonic::Jmp]);
    // The branch keeps its original target, the synthetic jump covers the
    // fall-through edge.
    assert_eq!(trace[1].branch_target(), Some(BASE));
    assert_eq!(trace[2].branch_target(), Some(BASE + 5));
}

#[test]
fn external_call_materializes_args_and_clobbers() {
    // call -10 (outside the function); ret
    let code = [0xE8, 0xF6, 0xFF, 0xFF, 0xFF, 0xC3];
    let decoded = decode_func(&code, BASE, code.len(), true);
    let mut state = AbstractState::new(STACK);
    state.set_reg(Reg::Rcx, Value::Static(7));
    state.set_reg(Reg::Rbx, Value::Static(9));
    let trace = capture::run(&decoded, &mut state, 256).unwrap();

    let kinds: Vec<_> = trace.iter().map(|i| i.mnemonic).collect();
    assert_eq!(kinds, [Mnemonic::Mov, Mnemonic::Call, Mnemonic::Ret]);
    // The static argument register is materialized for the callee...
    assert_eq!(trace[0].dst, Some(Operand::reg64(Reg::Rcx)));
    assert_eq!(trace[0].src, Some(Operand::imm64(7)));
    // ...caller-saved state is lost across the call, callee-saved survives.
    assert_eq!(state.reg(Reg::Rcx), Value::Dynamic);
    assert_eq!(state.reg(Reg::Rax), Value::Dynamic);
    assert_eq!(state.reg(Reg::Rbx), Value::Static(9));
}

#[test]
fn indirect_call_is_fatal() {
    // call rax; ret
    let err = capture_err(&[0xFF, 0xD0, 0xC3], |_| {});
    assert!(matches!(err, RewriteError::DynamicTarget(_)));
}

#[test]
fn invalid_instruction_in_path_is_fatal() {
    // 0x06 is undefined in long mode.
    let err = capture_err(&[0x06, 0xC3], |_| {});
    assert!(matches!(err, RewriteError::InvalidInstruction(a) if a == BASE));
}

#[test]
fn static_infinite_loop_exhausts_the_budget() {
    // jmp self
    let err = capture_err(&[0xEB, 0xFE], |_| {});
    assert!(matches!(err, RewriteError::StepBudget(_)));
}

#[test]
fn stack_spill_reload_folds() {
    // mov [rsp-8], rdi; mov rax, [rsp-8]; ret — with rdi bound: the spill
    // and reload both fold through the tagged stack.
    let code = [
        0x48, 0x89, 0x7C, 0x24, 0xF8, // mov [rsp-8], rdi
        0x48, 0x8B, 0x44, 0x24, 0xF8, // mov rax, [rsp-8]
        0xC3, // ret
    ];
    let trace = capture_with(&code, true, |s| {
        s.set_reg(Reg::Rdi, Value::Static(21));
    });
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].mnemonic, Mnemonic::Mov);
    assert_eq!(trace[0].src, Some(Operand::imm64(21)));
    assert_eq!(trace[1].mnemonic, Mnemonic::Ret);
}

#[test]
fn captured_store_to_stack_goes_rsp_relative() {
    // mov [rsp-8], rdi with rdi dynamic: the store is captured and its
    // address stays expressed against RSP.
    let code = [0x48, 0x89, 0x7C, 0x24, 0xF8, 0xC3];
    let trace = capture_with(&code, true, |_| {});
    assert_eq!(trace.len(), 2);
    let Some(Operand::Mem(m)) = trace[0].dst else {
        panic!("expected memory destination")
    };
    assert_eq!(m.base, Some(Reg::Rsp));
    assert_eq!(m.disp, -8);
}
