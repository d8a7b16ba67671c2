//! End-to-end specialization: handcrafted function images are placed in
//! executable memory, specialized, and the generated functions are called
//! with runtime arguments. Each fixture's comment lists its assembly.

#![cfg(all(target_arch = "x86_64", unix))]

use pretty_assertions::assert_eq;
use respin_core::{Binding, CodeStorage, Rewriter, RewriterConfig, RewriteError};

type F1 = extern "C" fn(u64) -> u64;
type F2 = extern "C" fn(u64, u64) -> u64;

/// Copy a handcrafted function image into executable memory.
fn make_func(storage: &mut CodeStorage, bytes: &[u8]) -> *const u8 {
    let dst = storage.reserve(bytes.len()).unwrap();
    dst.copy_from_slice(bytes);
    storage.commit(bytes.len()).unwrap()
}

fn config_for(len: usize) -> RewriterConfig {
    RewriterConfig {
        max_decode_bytes: len,
        ..RewriterConfig::default()
    }
}

#[test]
fn identity_function_passes_through() {
    // mov rax, rdi; ret
    let code = [0x48, 0x89, 0xF8, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: F1 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(42), 42);
    assert_eq!(g(0), 0);
}

#[test]
fn lea_add_specializes_to_canonical_form() {
    // lea rax, [rdi+rsi]; ret  — i.e. f(x, y) = x + y.
    let code = [0x48, 0x8D, 0x04, 0x37, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    rw.bind_arg(0, Binding::Static(3)).unwrap();
    rw.bind_arg(1, Binding::Dynamic).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };

    // The specialized body is exactly `lea rax, [rsi+3]; ret`.
    let bytes = unsafe { std::slice::from_raw_parts(spec.as_ptr(), 5) };
    assert_eq!(bytes, [0x48, 0x8D, 0x46, 0x03, 0xC3]);

    let g: F2 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(999, 4), 7);
    assert_eq!(g(0, u64::MAX), 2); // wrapping, same as the original
}

#[test]
fn fully_static_function_folds_to_a_constant() {
    // mov rax, rdi; add rax, rsi; ret
    let code = [0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    rw.bind_arg(0, Binding::Static(5)).unwrap();
    rw.bind_arg(1, Binding::Static(7)).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: F2 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(0, 0), 12);
    assert_eq!(g(100, 200), 12);
}

#[test]
fn partially_static_function_keeps_the_dynamic_add() {
    let code = [0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    rw.bind_arg(0, Binding::Static(5)).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: F2 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(999, 10), 15);
    assert_eq!(g(999, 0), 5);
}

#[test]
fn frame_pointer_prologue_folds_away() {
    // push rbp; mov rbp, rsp; mov rax, rdi; pop rbp; ret
    let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x89, 0xF8, 0x5D, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };

    // The frame setup folds away entirely.
    let bytes = unsafe { std::slice::from_raw_parts(spec.as_ptr(), 4) };
    assert_eq!(bytes, [0x48, 0x89, 0xF8, 0xC3]);

    let g: F1 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(7), 7);
}

#[test]
fn static_branch_selects_one_arm() {
    // cmp rdi, 10; jb +6; mov eax, 1; ret; mov eax, 2; ret
    let code = [
        0x48, 0x83, 0xFF, 0x0A, 0x72, 0x06, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3, 0xB8, 0x02,
        0x00, 0x00, 0x00, 0xC3,
    ];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let cfg = RewriterConfig {
        stop_at_first_ret: false,
        ..config_for(code.len())
    };

    let mut below = Rewriter::with_config(cfg).unwrap();
    below.bind_arg(0, Binding::Static(5)).unwrap();
    let g: F1 =
        unsafe { std::mem::transmute(below.specialize(f).unwrap().as_ptr()) };
    assert_eq!(g(0), 2);

    let mut above = Rewriter::with_config(cfg).unwrap();
    above.bind_arg(0, Binding::Static(50)).unwrap();
    let g: F1 =
        unsafe { std::mem::transmute(above.specialize(f).unwrap().as_ptr()) };
    assert_eq!(g(0), 1);
}

#[test]
fn internal_call_is_inlined() {
    // 0: call 9      (helper below)
    // 5: inc rax
    // 8: ret
    // 9: mov rax, rdi
    // c: ret
    let code = [
        0xE8, 0x04, 0x00, 0x00, 0x00, 0x48, 0xFF, 0xC0, 0xC3, 0x48, 0x89, 0xF8, 0xC3,
    ];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let cfg = RewriterConfig {
        stop_at_first_ret: false,
        ..config_for(code.len())
    };
    let mut rw = Rewriter::with_config(cfg).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };

    // The call/ret pair folds to hints; only the body survives.
    let bytes = unsafe { std::slice::from_raw_parts(spec.as_ptr(), 7) };
    assert_eq!(bytes, [0x48, 0x89, 0xF8, 0x48, 0xFF, 0xC0, 0xC3]);

    let g: F1 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(7), 8);
}

#[test]
fn dynamic_loop_reenters_the_trace() {
    // 0: mov rax, rdi
    // 3: dec rax
    // 6: jne 3
    // 8: ret
    let code = [0x48, 0x89, 0xF8, 0x48, 0xFF, 0xC8, 0x75, 0xFB, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: F1 = unsafe { std::mem::transmute(spec.as_ptr()) };
    // The back-edge stays inside the trace; the exhausted exit jumps back
    // to the original RET.
    assert_eq!(g(1), 0);
    assert_eq!(g(5), 0);
}

#[test]
fn memory_load_stays_dynamic() {
    // mov rax, [rdi]; ret
    let code = [0x48, 0x8B, 0x07, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: extern "C" fn(*const u64) -> u64 =
        unsafe { std::mem::transmute(spec.as_ptr()) };
    let data = 0xFEED_F00Du64;
    assert_eq!(g(&data), 0xFEED_F00D);
}

#[test]
fn shift_count_binding_becomes_an_immediate() {
    // mov rax, rdi; mov ecx, esi; shl rax, cl; ret
    let code = [
        0x48, 0x89, 0xF8, 0x89, 0xF1, 0x48, 0xD3, 0xE0, 0xC3,
    ];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    rw.bind_arg(1, Binding::Static(4)).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: F2 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(3, 999), 48);
}

#[test]
fn three_operand_imul() {
    // imul rax, rdi, 3; ret
    let code = [0x48, 0x6B, 0xC7, 0x03, 0xC3];
    let mut host = CodeStorage::new(4096).unwrap();
    let f = make_func(&mut host, &code);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: F1 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(7), 21);

    let mut rw = Rewriter::with_config(config_for(code.len())).unwrap();
    rw.bind_arg(0, Binding::Static(10)).unwrap();
    let spec = unsafe { rw.specialize(f).unwrap() };
    let g: F1 = unsafe { std::mem::transmute(spec.as_ptr()) };
    assert_eq!(g(0), 30);
}

#[test]
fn misconfiguration_is_rejected() {
    let mut rw = Rewriter::new().unwrap();
    assert_eq!(
        rw.bind_arg(6, Binding::Dynamic),
        Err(RewriteError::ArgIndexOutOfRange(6))
    );
    rw.bind_arg(2, Binding::Static(1)).unwrap();
    assert_eq!(
        rw.bind_arg(2, Binding::Static(2)),
        Err(RewriteError::ArgRebound(2))
    );
    rw.clear_bindings();
    rw.bind_arg(2, Binding::Static(2)).unwrap();
}
