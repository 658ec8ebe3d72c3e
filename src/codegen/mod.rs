pub mod defer;
pub mod runtime;
pub mod unwind;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_codegen::ir::{types, InstBuilder, MemFlags};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::FunctionBuilder;
use cranelift_module::{DataDescription, DataId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};

use crate::config::CodegenOptions;
use crate::diagnostics::CompileError;
use defer::FrameLowering;
use runtime::RuntimeRegistry;

/// Size of a pointer in bytes. Chain records and spill slots use
/// pointer-sized fields.
pub const POINTER_SIZE: i32 = 8;

/// Symbol of the process-wide pthread key holding the defer chain head.
const DEFER_KEY_SYMBOL: &str = "__vesta_defer_key";

/// Module-level emission state: the object module, the registry of consumed
/// runtime symbols and the defer-key data object shared by every function.
pub struct Backend {
    pub module: ObjectModule,
    runtime: RuntimeRegistry,
    defer_key: DataId,
    context_buf_size: u32,
}

impl Backend {
    pub fn new(opts: &CodegenOptions) -> Result<Self, CompileError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("is_pic", if opts.pic { "true" } else { "false" })
            .unwrap();

        let isa_builder = cranelift_codegen::isa::lookup_by_name(&opts.target)
            .map_err(|e| CompileError::codegen(format!("unsupported target: {e}")))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CompileError::codegen(format!("ISA error: {e}")))?;

        let obj_builder = ObjectBuilder::new(
            isa,
            opts.module_name.clone(),
            cranelift_module::default_libcall_names(),
        )
        .map_err(|e| CompileError::codegen(format!("object builder error: {e}")))?;

        let mut module = ObjectModule::new(obj_builder);
        let runtime = RuntimeRegistry::new(&mut module)?;

        // Process-wide pthread key cell, zero-initialized; the emitted init
        // guard fills it once via pthread_key_create.
        let defer_key = module
            .declare_data(DEFER_KEY_SYMBOL, Linkage::Local, true, false)
            .map_err(|e| CompileError::codegen(format!("declare defer key error: {e}")))?;
        let mut data_desc = DataDescription::new();
        data_desc.define(vec![0u8; 4].into_boxed_slice());
        module
            .define_data(defer_key, &data_desc)
            .map_err(|e| CompileError::codegen(format!("define defer key error: {e}")))?;

        Ok(Backend {
            module,
            runtime,
            defer_key,
            context_buf_size: unwind::context_buf_size(&opts.target),
        })
    }

    pub fn runtime(&self) -> &RuntimeRegistry {
        &self.runtime
    }

    /// Begin lowering one function body. The builder must be positioned in
    /// the sealed entry block with its parameters already declared.
    pub fn frame<'a>(&'a mut self, builder: FunctionBuilder<'a>) -> FrameLowering<'a> {
        FrameLowering::new(
            builder,
            &mut self.module,
            &self.runtime,
            self.defer_key,
            self.context_buf_size,
        )
    }

    /// Emit the one-time defer-key setup into a host init function:
    /// `if key == 0 { pthread_key_create(&key, null) }`. Leaves the builder
    /// in the join block.
    pub fn emit_chain_key_init(&mut self, builder: &mut FunctionBuilder) {
        let gv = self.module.declare_data_in_func(self.defer_key, builder.func);
        let key_addr = builder.ins().global_value(types::I64, gv);
        let key = builder
            .ins()
            .load(types::I32, MemFlags::new(), key_addr, Offset32::new(0));
        let missing = builder.ins().icmp_imm(IntCC::Equal, key, 0);

        let create_bb = builder.create_block();
        let done_bb = builder.create_block();
        builder.ins().brif(missing, create_bb, &[], done_bb, &[]);

        builder.switch_to_block(create_bb);
        builder.seal_block(create_bb);
        let create_ref = self
            .module
            .declare_func_in_func(self.runtime.get("pthread_key_create"), builder.func);
        let null = builder.ins().iconst(types::I64, 0);
        builder.ins().call(create_ref, &[key_addr, null]);
        builder.ins().jump(done_bb, &[]);

        builder.switch_to_block(done_bb);
        builder.seal_block(done_bb);
    }

    /// Finish the module and emit relocatable object bytes.
    pub fn finish(self) -> Result<Vec<u8>, CompileError> {
        let object = self.module.finish();
        object
            .emit()
            .map_err(|e| CompileError::codegen(format!("emit error: {e}")))
    }
}
