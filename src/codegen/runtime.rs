use std::collections::HashMap;

use cranelift_codegen::ir::{types, AbiParam};
use cranelift_module::{FuncId, Linkage, Module};

use crate::diagnostics::CompileError;

/// Registry of C and runtime functions declared in the Cranelift module.
pub struct RuntimeRegistry {
    ids: HashMap<&'static str, FuncId>,
}

impl RuntimeRegistry {
    /// Declare every consumed symbol once. Each entry specifies raw Cranelift
    /// types for parameters and returns, preserving exact C ABI compatibility.
    pub fn new(module: &mut dyn Module) -> Result<Self, CompileError> {
        let mut reg = RuntimeRegistry {
            ids: HashMap::new(),
        };

        // Thread-local storage accessors for the defer chain head. The key
        // is a pthread_key_t (c_uint); stored values are pointer-sized.
        reg.declare(module, "pthread_key_create", &[types::I64, types::I64], &[types::I32])?;
        reg.declare(module, "pthread_getspecific", &[types::I32], &[types::I64])?;
        reg.declare(module, "pthread_setspecific", &[types::I32, types::I64], &[types::I32])?;

        // Signal-safe non-local jump pair. siglongjmp never returns.
        reg.declare(module, "sigsetjmp", &[types::I64, types::I32], &[types::I32])?;
        reg.declare(module, "siglongjmp", &[types::I64, types::I32], &[])?;

        // Diagnostics
        reg.declare(module, "__vesta_trace_panic", &[types::I64], &[])?;
        reg.declare(module, "__vesta_print_int", &[types::I64], &[])?;

        Ok(reg)
    }

    /// Look up a declared function by its full symbol name.
    pub fn get(&self, name: &str) -> FuncId {
        self.ids[name]
    }

    fn declare(
        &mut self,
        module: &mut dyn Module,
        name: &'static str,
        params: &[types::Type],
        returns: &[types::Type],
    ) -> Result<(), CompileError> {
        let mut sig = module.make_signature();
        for &p in params {
            sig.params.push(AbiParam::new(p));
        }
        for &r in returns {
            sig.returns.push(AbiParam::new(r));
        }
        let id = module
            .declare_function(name, Linkage::Import, &sig)
            .map_err(|e| CompileError::codegen(format!("declare {name} error: {e}")))?;
        self.ids.insert(name, id);
        Ok(())
    }
}
