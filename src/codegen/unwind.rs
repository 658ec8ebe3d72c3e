use cranelift_codegen::ir::{types, InstBuilder, StackSlotData, StackSlotKind, TrapCode, Value};
use cranelift_module::Module;

use super::defer::FrameLowering;

/// User trap code marking emitted unreachable terminators.
const TRAP_UNREACHABLE: u8 = 1;

fn unreachable_code() -> TrapCode {
    TrapCode::user(TRAP_UNREACHABLE).unwrap()
}

/// Size in bytes of the platform's opaque sigjmp_buf for a target triple.
/// The listed glibc targets are the ones the backend ships for; anything
/// else gets a generous upper bound, which is safe because the buffer is
/// opaque and never interpreted here.
pub fn context_buf_size(target: &str) -> u32 {
    if target.starts_with("x86_64") && target.contains("linux") {
        200
    } else if target.starts_with("aarch64") && target.contains("linux") {
        312
    } else {
        512
    }
}

impl<'a> FrameLowering<'a> {
    /// Lower the unrecoverable-error path: a diagnostic call with the failing
    /// value, then a terminator asserting control never falls through. The
    /// block is terminated afterwards; further emission requests are ignored.
    pub fn emit_trap(&mut self, value: Value) {
        if self.is_terminated() {
            return;
        }
        let func_ref = self.module.declare_func_in_func(
            self.runtime.get("__vesta_trace_panic"),
            self.builder.func,
        );
        self.builder.ins().call(func_ref, &[value]);
        self.builder.ins().trap(unreachable_code());
        self.mark_terminated();
    }

    /// A bare unreachable terminator, for paths that must never be reached.
    pub fn emit_halt(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.builder.ins().trap(unreachable_code());
        self.mark_terminated();
    }

    /// Allocate the opaque context buffer for the save/restore pair on the
    /// function's frame and return its address.
    pub fn alloca_context_buf(&mut self) -> Value {
        let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            self.context_buf_size,
            4,
        ));
        self.builder.ins().stack_addr(types::I64, slot, 0)
    }

    /// `sigsetjmp(buf, savemask)`: zero on the initial call, nonzero when
    /// control arrives again through `emit_restore_context`.
    pub fn emit_save_context(&mut self, buf: Value, savemask: Value) -> Value {
        let func_ref = self
            .module
            .declare_func_in_func(self.runtime.get("sigsetjmp"), self.builder.func);
        let call = self.builder.ins().call(func_ref, &[buf, savemask]);
        self.builder.inst_results(call)[0]
    }

    /// `siglongjmp(buf, retval)`: transfers control to the paired save site
    /// and never returns. When a transfer happens is the panic logic's
    /// decision; callers terminate the block themselves.
    pub fn emit_restore_context(&mut self, buf: Value, retval: Value) {
        let func_ref = self
            .module
            .declare_func_in_func(self.runtime.get("siglongjmp"), self.builder.func);
        self.builder.ins().call(func_ref, &[buf, retval]);
    }
}
