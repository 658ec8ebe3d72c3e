use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_codegen::ir::{
    types, Block, FuncRef, InstBuilder, MemFlags, SigRef, Signature, StackSlot, StackSlotData,
    StackSlotKind, Type, Value,
};
use cranelift_frontend::{FunctionBuilder, Switch};
use cranelift_module::{DataId, FuncId, Module};

use crate::diagnostics::CompileError;

use super::runtime::RuntimeRegistry;
use super::POINTER_SIZE;

/// Width of the per-activation conditional-defer flag word, in bits.
pub const DEFER_FLAG_BITS: u32 = 64;

// Field offsets within the chain record {flags, link, rund}.
const FLAGS_OFFSET: i32 = 0;
const LINK_OFFSET: i32 = POINTER_SIZE;
const RUND_OFFSET: i32 = 2 * POINTER_SIZE;

/// How a deferred call participates in dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferKind {
    /// Reached on every path through the function.
    Always,
    /// Registered inside a conditional; runs only if the registration point
    /// was dynamically reached before an exit.
    InCond,
    /// Registered inside a loop body. Unsupported: one flag bit cannot carry
    /// per-iteration semantics.
    InLoop,
}

/// Target of a deferred call.
pub enum DeferCallee {
    /// A function declared in the module.
    Direct(FuncId),
    /// A function pointer with an imported signature.
    Indirect { sig: SigRef, fn_ptr: Value },
}

enum CalleeSlot {
    Direct(FuncId),
    Indirect(SigRef),
}

struct DeferEntry {
    callee: CalleeSlot,
    /// Flag mask for conditional entries; None runs unconditionally.
    mask: Option<u64>,
    /// Spill slot holding [fn_ptr?][arg0][arg1]... at pointer-sized strides.
    spill: Option<StackSlot>,
    arg_types: Vec<Type>,
}

struct DeferChain {
    /// {flags, link, rund} on the function's own frame.
    record: StackSlot,
    /// Next unassigned conditional flag bit.
    next_bit: u32,
    /// Shared trampoline block, created by the first `run_defers`.
    proc_block: Option<Block>,
    entries: Vec<DeferEntry>,
    /// One resume block per `run_defers` call site, indexed by `rund`.
    resume_blocks: Vec<Block>,
}

/// Per-function lowering context for defers, traps and non-local jumps.
///
/// Construct it right after the entry block is created, parameterized and
/// sealed. Construction routes entry through an init block that `finish`
/// later fills with the chain acquire sequence, so the acquire dominates
/// every registration point and the trampoline no matter where the first
/// `defer` appears in the body. Emit the body through `builder`, then call
/// `finish` once every path is terminated.
pub struct FrameLowering<'a> {
    pub builder: FunctionBuilder<'a>,
    pub(super) module: &'a mut dyn Module,
    pub(super) runtime: &'a RuntimeRegistry,
    pub(super) context_buf_size: u32,
    defer_key: DataId,
    init_block: Block,
    body_block: Block,
    chain: Option<DeferChain>,
    terminated: bool,
}

impl<'a> FrameLowering<'a> {
    pub fn new(
        mut builder: FunctionBuilder<'a>,
        module: &'a mut dyn Module,
        runtime: &'a RuntimeRegistry,
        defer_key: DataId,
        context_buf_size: u32,
    ) -> Self {
        let init_block = builder.create_block();
        let body_block = builder.create_block();
        builder.ins().jump(init_block, &[]);
        builder.seal_block(init_block);
        builder.switch_to_block(body_block);

        FrameLowering {
            builder,
            module,
            runtime,
            context_buf_size,
            defer_key,
            init_block,
            body_block,
            chain: None,
            terminated: false,
        }
    }

    /// True once the current block ended in a terminator this context
    /// emitted; further emission requests are ignored until `resume_at`.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(super) fn mark_terminated(&mut self) {
        self.terminated = true;
    }

    /// Switch to `block` and resume emission there.
    pub fn resume_at(&mut self, block: Block) {
        self.builder.switch_to_block(block);
        self.terminated = false;
    }

    /// Import `func_id` into the current function.
    pub fn func_ref(&mut self, func_id: FuncId) -> FuncRef {
        self.module.declare_func_in_func(func_id, self.builder.func)
    }

    /// A fresh signature with the module's default calling convention.
    pub fn make_signature(&mut self) -> Signature {
        self.module.make_signature()
    }

    /// The shared trampoline block, if any exit point has been recorded.
    pub fn trampoline_block(&self) -> Option<Block> {
        self.chain.as_ref().and_then(|c| c.proc_block)
    }

    /// Resume blocks in exit order; `rund` values index this slice.
    pub fn resume_blocks(&self) -> &[Block] {
        self.chain
            .as_ref()
            .map(|c| c.resume_blocks.as_slice())
            .unwrap_or(&[])
    }

    /// Lazily create the per-activation chain state. The record lives in a
    /// frame slot so that registration points and the trampoline can reach
    /// it without dominance concerns; the TLS push is emitted by `finish`
    /// into the init block.
    fn chain_mut(&mut self) -> &mut DeferChain {
        if self.chain.is_none() {
            let record = self.builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                3 * POINTER_SIZE as u32,
                3,
            ));
            self.chain = Some(DeferChain {
                record,
                next_bit: 0,
                proc_block: None,
                entries: Vec::new(),
                resume_blocks: Vec::new(),
            });
        }
        self.chain.as_mut().unwrap()
    }

    /// Record a deferred call. Conditional entries take the next flag bit
    /// and arm it at the registration point.
    pub fn register_defer(
        &mut self,
        kind: DeferKind,
        callee: DeferCallee,
        args: &[Value],
    ) -> Result<(), CompileError> {
        if kind == DeferKind::InLoop {
            return Err(CompileError::codegen(
                "defer inside a loop body is not supported",
            ));
        }
        if self.terminated {
            return Ok(());
        }

        let mask = match kind {
            DeferKind::InCond => {
                let chain = self.chain_mut();
                if chain.next_bit == DEFER_FLAG_BITS {
                    return Err(CompileError::codegen(format!(
                        "too many conditional defers in one function (limit {DEFER_FLAG_BITS})"
                    )));
                }
                let bit = chain.next_bit;
                chain.next_bit += 1;
                let record = chain.record;
                let mask = 1u64 << bit;
                let flags = self
                    .builder
                    .ins()
                    .stack_load(types::I64, record, FLAGS_OFFSET);
                let armed = self.builder.ins().bor_imm(flags, mask as i64);
                self.builder.ins().stack_store(armed, record, FLAGS_OFFSET);
                Some(mask)
            }
            DeferKind::Always => {
                self.chain_mut();
                None
            }
            DeferKind::InLoop => unreachable!(),
        };

        // Spill the callee pointer and arguments: the trampoline must never
        // read an SSA value that does not dominate it.
        let indirect_slots = matches!(callee, DeferCallee::Indirect { .. }) as usize;
        let total = indirect_slots + args.len();
        let spill = if total > 0 {
            Some(self.builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                (total * POINTER_SIZE as usize) as u32,
                3,
            )))
        } else {
            None
        };

        let callee_slot = match callee {
            DeferCallee::Direct(id) => CalleeSlot::Direct(id),
            DeferCallee::Indirect { sig, fn_ptr } => {
                self.builder.ins().stack_store(fn_ptr, spill.unwrap(), 0);
                CalleeSlot::Indirect(sig)
            }
        };

        let mut arg_types = Vec::with_capacity(args.len());
        for (i, &arg) in args.iter().enumerate() {
            let offset = ((indirect_slots + i) * POINTER_SIZE as usize) as i32;
            self.builder.ins().stack_store(arg, spill.unwrap(), offset);
            arg_types.push(self.builder.func.dfg.value_type(arg));
        }

        self.chain_mut().entries.push(DeferEntry {
            callee: callee_slot,
            mask,
            spill,
            arg_types,
        });
        Ok(())
    }

    /// Record one exit point: store the resume selector, jump to the shared
    /// trampoline and leave the builder in a fresh resume block for the code
    /// that follows the deferred calls. Returns None when the current block
    /// is already terminated.
    pub fn run_defers(&mut self) -> Option<Block> {
        if self.terminated {
            return None;
        }
        let (record, index) = {
            let chain = self.chain_mut();
            (chain.record, chain.resume_blocks.len() as i64)
        };
        let proc_block = match self.chain.as_ref().unwrap().proc_block {
            Some(block) => block,
            None => {
                let block = self.builder.create_block();
                self.chain.as_mut().unwrap().proc_block = Some(block);
                block
            }
        };

        let selector = self.builder.ins().iconst(types::I64, index);
        self.builder.ins().stack_store(selector, record, RUND_OFFSET);
        self.builder.ins().jump(proc_block, &[]);

        let resume = self.builder.create_block();
        self.chain.as_mut().unwrap().resume_blocks.push(resume);
        self.builder.switch_to_block(resume);
        Some(resume)
    }

    /// Fill the init block, emit the trampoline and finalize the function.
    /// Every block the host emitted must already be terminated.
    pub fn finish(mut self) -> Result<(), CompileError> {
        // Init block: acquire the chain record before any body code runs.
        self.builder.switch_to_block(self.init_block);
        let key = if let Some(chain) = &self.chain {
            let record = chain.record;
            let gv = self
                .module
                .declare_data_in_func(self.defer_key, self.builder.func);
            let key_addr = self.builder.ins().global_value(types::I64, gv);
            let key =
                self.builder
                    .ins()
                    .load(types::I32, MemFlags::new(), key_addr, Offset32::new(0));

            let get_ref = self.module.declare_func_in_func(
                self.runtime.get("pthread_getspecific"),
                self.builder.func,
            );
            let call = self.builder.ins().call(get_ref, &[key]);
            let link = self.builder.inst_results(call)[0];

            let zero = self.builder.ins().iconst(types::I64, 0);
            self.builder.ins().stack_store(zero, record, FLAGS_OFFSET);
            self.builder.ins().stack_store(link, record, LINK_OFFSET);

            let addr = self.builder.ins().stack_addr(types::I64, record, 0);
            let set_ref = self.module.declare_func_in_func(
                self.runtime.get("pthread_setspecific"),
                self.builder.func,
            );
            self.builder.ins().call(set_ref, &[key, addr]);
            Some(key)
        } else {
            None
        };
        self.builder.ins().jump(self.body_block, &[]);
        self.builder.seal_block(self.body_block);

        if let Some(chain) = self.chain.take() {
            if let Some(proc_block) = chain.proc_block {
                let key = key.unwrap();
                self.builder.switch_to_block(proc_block);
                self.builder.seal_block(proc_block);

                // Single flags load shared by every gated entry.
                let flags = self
                    .builder
                    .ins()
                    .stack_load(types::I64, chain.record, FLAGS_OFFSET);

                for entry in chain.entries.iter().rev() {
                    match entry.mask {
                        None => self.emit_entry(entry),
                        Some(mask) => {
                            let hit = self.builder.ins().band_imm(flags, mask as i64);
                            let armed = self.builder.ins().icmp_imm(IntCC::NotEqual, hit, 0);
                            let call_bb = self.builder.create_block();
                            let skip_bb = self.builder.create_block();
                            self.builder.ins().brif(armed, call_bb, &[], skip_bb, &[]);

                            self.builder.switch_to_block(call_bb);
                            self.builder.seal_block(call_bb);
                            self.emit_entry(entry);
                            self.builder.ins().jump(skip_bb, &[]);

                            self.builder.switch_to_block(skip_bb);
                            self.builder.seal_block(skip_bb);
                        }
                    }
                }

                // Pop this record off the thread's chain.
                let link = self
                    .builder
                    .ins()
                    .stack_load(types::I64, chain.record, LINK_OFFSET);
                let set_ref = self.module.declare_func_in_func(
                    self.runtime.get("pthread_setspecific"),
                    self.builder.func,
                );
                self.builder.ins().call(set_ref, &[key, link]);

                // Resume at the exit that entered the trampoline. A single
                // exit needs no selector at all; otherwise the first resume
                // block doubles as the default case.
                if chain.resume_blocks.len() == 1 {
                    self.builder.ins().jump(chain.resume_blocks[0], &[]);
                } else {
                    let rund = self
                        .builder
                        .ins()
                        .stack_load(types::I64, chain.record, RUND_OFFSET);
                    let mut switch = Switch::new();
                    for (i, &block) in chain.resume_blocks.iter().enumerate().skip(1) {
                        switch.set_entry(i as u128, block);
                    }
                    switch.emit(&mut self.builder, rund, chain.resume_blocks[0]);
                }

                for &block in &chain.resume_blocks {
                    self.builder.seal_block(block);
                }
            }
        }

        self.builder.finalize();
        Ok(())
    }

    fn emit_entry(&mut self, entry: &DeferEntry) {
        let base = matches!(entry.callee, CalleeSlot::Indirect(_)) as usize;
        let mut args = Vec::with_capacity(entry.arg_types.len());
        for (i, &ty) in entry.arg_types.iter().enumerate() {
            let offset = ((base + i) * POINTER_SIZE as usize) as i32;
            args.push(self.builder.ins().stack_load(ty, entry.spill.unwrap(), offset));
        }
        match entry.callee {
            CalleeSlot::Direct(func_id) => {
                let func_ref = self.module.declare_func_in_func(func_id, self.builder.func);
                self.builder.ins().call(func_ref, &args);
            }
            CalleeSlot::Indirect(sig) => {
                let fn_ptr = self
                    .builder
                    .ins()
                    .stack_load(types::I64, entry.spill.unwrap(), 0);
                self.builder.ins().call_indirect(sig, fn_ptr, &args);
            }
        }
    }
}
