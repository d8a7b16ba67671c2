//! Decode → re-encode fidelity for canonical encodings.
//!
//! Every fixture here uses the canonical form (shortest displacement, no
//! redundant REX), so re-encoding the decoded instruction at its original
//! address must reproduce the input bytes exactly.

use pretty_assertions::assert_eq;
use respin_x86::{decode_one, encode};

fn roundtrip(bytes: &[u8], addr: u64) {
    let inst = decode_one(bytes, addr).unwrap();
    assert_eq!(
        inst.len as usize,
        bytes.len(),
        "decode length mismatch for {bytes:02X?}"
    );
    let mut out = Vec::new();
    encode(&inst, addr, &mut out).unwrap();
    assert_eq!(out, bytes, "re-encode mismatch for {inst}");
}

#[test]
fn simple_ops() {
    roundtrip(&[0xC3], 0); // ret
    roundtrip(&[0x90], 0); // nop
    roundtrip(&[0x55], 0); // push rbp
    roundtrip(&[0x5D], 0); // pop rbp
    roundtrip(&[0x41, 0x54], 0); // push r12
    roundtrip(&[0x41, 0x5C], 0); // pop r12
    roundtrip(&[0xC2, 0x08, 0x00], 0); // ret 8
}

#[test]
fn mov_forms() {
    roundtrip(&[0x48, 0x89, 0xE5], 0); // mov rbp, rsp
    roundtrip(&[0x89, 0xC8], 0); // mov eax, ecx
    roundtrip(&[0x48, 0x8B, 0x47, 0x10], 0); // mov rax, [rdi+0x10]
    roundtrip(&[0x48, 0x8B, 0x04, 0xCD, 0, 0, 0, 0], 0); // mov rax, [rcx*8]
    roundtrip(&[0x48, 0x8B, 0x44, 0x24, 0x08], 0); // mov rax, [rsp+8]
    roundtrip(&[0x48, 0x8B, 0x45, 0x00], 0); // mov rax, [rbp]
    roundtrip(&[0xB8, 0x05, 0x00, 0x00, 0x00], 0); // mov eax, 5
    roundtrip(
        &[0x48, 0xB8, 0xEF, 0xBE, 0xAD, 0xDE, 0x78, 0x56, 0x34, 0x12],
        0,
    ); // movabs
    roundtrip(&[0xC7, 0x40, 0x04, 0x2A, 0x00, 0x00, 0x00], 0); // mov dword ptr [rax+4], 42
    roundtrip(&[0x4D, 0x8B, 0x48, 0x20], 0); // mov r9, [r8+0x20]
    roundtrip(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00], 0x7000); // mov rax, [rip+0x10]
}

#[test]
fn alu_forms() {
    roundtrip(&[0x48, 0x01, 0xF8], 0); // add rax, rdi
    roundtrip(&[0x48, 0x03, 0x07], 0); // add rax, [rdi]
    roundtrip(&[0x48, 0x83, 0xC0, 0x01], 0); // add rax, 1
    roundtrip(&[0x48, 0x81, 0xC4, 0x00, 0x01, 0x00, 0x00], 0); // add rsp, 0x100
    roundtrip(&[0x48, 0x29, 0xC8], 0); // sub rax, rcx
    roundtrip(&[0x48, 0x31, 0xC0], 0); // xor rax, rax
    roundtrip(&[0x48, 0x21, 0xF7], 0); // and rdi, rsi
    roundtrip(&[0x48, 0x39, 0xF7], 0); // cmp rdi, rsi
    roundtrip(&[0x48, 0xF7, 0xD8], 0); // neg rax
    roundtrip(&[0x48, 0xF7, 0xD0], 0); // not rax
    roundtrip(&[0xFF, 0xC0], 0); // inc eax
    roundtrip(&[0x48, 0xFF, 0xC8], 0); // dec rax
    roundtrip(&[0x48, 0x0F, 0xAF, 0xC7], 0); // imul rax, rdi
}

#[test]
fn test_and_cmp_memory() {
    roundtrip(&[0xF6, 0x00, 0x10], 0); // test byte ptr [rax], 0x10
    roundtrip(&[0x48, 0x85, 0xC0], 0); // test rax, rax
    roundtrip(&[0x80, 0x3F, 0x00], 0); // cmp byte ptr [rdi], 0
}

#[test]
fn lea_forms() {
    roundtrip(&[0x48, 0x8D, 0x04, 0x37], 0); // lea rax, [rdi+rsi]
    roundtrip(&[0x48, 0x8D, 0x46, 0x03], 0); // lea rax, [rsi+3]
    roundtrip(&[0x48, 0x8D, 0x04, 0xBD, 0, 0, 0, 0], 0); // lea rax, [rdi*4]
    roundtrip(&[0x4B, 0x8D, 0x04, 0x0B], 0); // lea rax, [r11+r9]
}

#[test]
fn shift_forms() {
    roundtrip(&[0x48, 0xC1, 0xE0, 0x04], 0); // shl rax, 4
    roundtrip(&[0x48, 0xD3, 0xF8], 0); // sar rax, cl
    roundtrip(&[0xC0, 0xE8, 0x03], 0); // shr al, 3
}

#[test]
fn widening_moves() {
    roundtrip(&[0x0F, 0xB6, 0x07], 0); // movzx eax, byte ptr [rdi]
    roundtrip(&[0x48, 0x0F, 0xBF, 0xC7], 0); // movsx rax, di
    roundtrip(&[0x48, 0x63, 0xC7], 0); // movsxd rax, edi
}

#[test]
fn branches_at_fixed_addresses() {
    roundtrip(&[0xE8, 0x0B, 0x00, 0x00, 0x00], 0x500); // call +0x0B
    roundtrip(&[0xE9, 0x00, 0x01, 0x00, 0x00], 0x500); // jmp +0x100
    roundtrip(&[0xEB, 0x10], 0x500); // jmp short
    roundtrip(&[0x75, 0xFE], 0x500); // jne self
    roundtrip(&[0x0F, 0x84, 0xF0, 0xFF, 0xFF, 0xFF], 0x500); // je backward
}

#[test]
fn conditional_data_ops() {
    roundtrip(&[0x0F, 0x94, 0xC0], 0); // sete al
    roundtrip(&[0x48, 0x0F, 0x45, 0xC1], 0); // cmovne rax, rcx
}

#[test]
fn sse_recorded_forms() {
    roundtrip(&[0xF3, 0x0F, 0x10, 0x07], 0); // movss xmm0, [rdi]
    roundtrip(&[0xF2, 0x0F, 0x58, 0xC1], 0); // addsd xmm0, xmm1
    roundtrip(&[0x0F, 0x28, 0x07], 0); // movaps xmm0, [rdi]
    roundtrip(&[0x66, 0x0F, 0xEF, 0xC0], 0); // pxor xmm0, xmm0
    roundtrip(&[0x66, 0x48, 0x0F, 0x6E, 0xC7], 0); // movq xmm0, rdi
    roundtrip(&[0x0F, 0x57, 0xC0], 0); // xorps xmm0, xmm0
}

#[test]
fn segment_override() {
    // mov rax, fs:[0x28]
    roundtrip(&[0x64, 0x48, 0x8B, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00], 0);
}

#[test]
fn multibyte_nop() {
    // The common compiler forms pad with redundant displacement bytes; only
    // the canonical no-disp form survives a roundtrip.
    roundtrip(&[0x0F, 0x1F, 0x00], 0); // nop dword ptr [rax]
}
