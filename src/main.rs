use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use cranelift_codegen::ir::{types, AbiParam, InstBuilder};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{Linkage, Module};

use vesta_codegen::codegen::defer::{DeferCallee, DeferKind};
use vesta_codegen::codegen::Backend;
use vesta_codegen::config::{self, CodegenOptions};
use vesta_codegen::diagnostics::{render_error, CompileError};

#[derive(Parser)]
#[command(name = "vesta-irdump", version, about = "Inspect Vesta defer/unwind lowering output")]
struct Cli {
    /// Path to a vesta.toml with a [codegen] section
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the CLIF of the built-in demonstration functions
    Clif,
    /// Emit the demonstration module as a relocatable object file
    Obj {
        /// Output object path
        #[arg(short, long, default_value = "vesta_demo.o")]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let opts = match &cli.config {
        Some(path) => match config::load_options(path) {
            Ok(opts) => opts,
            Err(err) => {
                render_error(&err);
                std::process::exit(1);
            }
        },
        None => CodegenOptions::default(),
    };

    let result = match cli.command {
        Commands::Clif => emit_clif(&opts),
        Commands::Obj { output } => emit_obj(&opts, &output),
    };

    if let Err(err) = result {
        render_error(&err);
        std::process::exit(1);
    }
}

fn emit_clif(opts: &CodegenOptions) -> Result<(), CompileError> {
    let (texts, _backend) = build_demo(opts)?;
    for text in texts {
        println!("{text}");
    }
    Ok(())
}

fn emit_obj(opts: &CodegenOptions, output: &Path) -> Result<(), CompileError> {
    let (_texts, backend) = build_demo(opts)?;
    let bytes = backend.finish()?;
    std::fs::write(output, bytes)
        .map_err(|e| CompileError::codegen(format!("failed to write object file: {e}")))?;
    Ok(())
}

/// Build a module with one function per lowering feature: guarded cleanup
/// with a conditional defer and two exits, a trapping function, a
/// save/restore round trip, and the one-time chain key init.
fn build_demo(opts: &CodegenOptions) -> Result<(Vec<String>, Backend), CompileError> {
    let mut backend = Backend::new(opts)?;
    let mut texts = Vec::new();

    // vesta_demo_cleanup(n): defer print(n); if n != 0 { defer print(1); return 1 }; return 0
    {
        let mut sig = backend.module.make_signature();
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I64));
        let func_id = backend
            .module
            .declare_function("vesta_demo_cleanup", Linkage::Export, &sig)
            .map_err(|e| CompileError::codegen(format!("declare demo error: {e}")))?;

        let mut ctx = Context::new();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let arg = builder.block_params(entry)[0];

            let print_int = backend.runtime().get("__vesta_print_int");
            let mut frame = backend.frame(builder);
            frame.register_defer(DeferKind::Always, DeferCallee::Direct(print_int), &[arg])?;

            let then_bb = frame.builder.create_block();
            let else_bb = frame.builder.create_block();
            frame.builder.ins().brif(arg, then_bb, &[], else_bb, &[]);

            frame.resume_at(then_bb);
            frame.builder.seal_block(then_bb);
            let one = frame.builder.ins().iconst(types::I64, 1);
            frame.register_defer(DeferKind::InCond, DeferCallee::Direct(print_int), &[one])?;
            let _ = frame.run_defers();
            let one = frame.builder.ins().iconst(types::I64, 1);
            frame.builder.ins().return_(&[one]);

            frame.resume_at(else_bb);
            frame.builder.seal_block(else_bb);
            let _ = frame.run_defers();
            let zero = frame.builder.ins().iconst(types::I64, 0);
            frame.builder.ins().return_(&[zero]);

            frame.finish()?;
        }
        texts.push(ctx.func.display().to_string());
        backend
            .module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CompileError::codegen(format!("define demo error: {e}")))?;
    }

    // vesta_demo_trap(code): trace the failing value and never return.
    {
        let mut sig = backend.module.make_signature();
        sig.params.push(AbiParam::new(types::I64));
        let func_id = backend
            .module
            .declare_function("vesta_demo_trap", Linkage::Export, &sig)
            .map_err(|e| CompileError::codegen(format!("declare demo error: {e}")))?;

        let mut ctx = Context::new();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let arg = builder.block_params(entry)[0];

            let mut frame = backend.frame(builder);
            frame.emit_trap(arg);
            frame.finish()?;
        }
        texts.push(ctx.func.display().to_string());
        backend
            .module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CompileError::codegen(format!("define demo error: {e}")))?;
    }

    // vesta_demo_guard(): save the context, jump back to it once, return 1.
    {
        let mut sig = backend.module.make_signature();
        sig.returns.push(AbiParam::new(types::I64));
        let func_id = backend
            .module
            .declare_function("vesta_demo_guard", Linkage::Export, &sig)
            .map_err(|e| CompileError::codegen(format!("declare demo error: {e}")))?;

        let mut ctx = Context::new();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
            let entry = builder.create_block();
            builder.switch_to_block(entry);
            builder.seal_block(entry);

            let mut frame = backend.frame(builder);
            let buf = frame.alloca_context_buf();
            let savemask = frame.builder.ins().iconst(types::I32, 1);
            let rc = frame.emit_save_context(buf, savemask);

            let recovered_bb = frame.builder.create_block();
            let normal_bb = frame.builder.create_block();
            frame.builder.ins().brif(rc, recovered_bb, &[], normal_bb, &[]);

            frame.resume_at(normal_bb);
            frame.builder.seal_block(normal_bb);
            let one = frame.builder.ins().iconst(types::I32, 1);
            frame.emit_restore_context(buf, one);
            frame.emit_halt();

            frame.resume_at(recovered_bb);
            frame.builder.seal_block(recovered_bb);
            let one = frame.builder.ins().iconst(types::I64, 1);
            frame.builder.ins().return_(&[one]);

            frame.finish()?;
        }
        texts.push(ctx.func.display().to_string());
        backend
            .module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CompileError::codegen(format!("define demo error: {e}")))?;
    }

    // vesta_demo_init(): one-time chain key setup.
    {
        let sig = backend.module.make_signature();
        let func_id = backend
            .module
            .declare_function("vesta_demo_init", Linkage::Export, &sig)
            .map_err(|e| CompileError::codegen(format!("declare demo error: {e}")))?;

        let mut ctx = Context::new();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
            let entry = builder.create_block();
            builder.switch_to_block(entry);
            builder.seal_block(entry);

            backend.emit_chain_key_init(&mut builder);
            builder.ins().return_(&[]);
            builder.finalize();
        }
        texts.push(ctx.func.display().to_string());
        backend
            .module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CompileError::codegen(format!("define demo error: {e}")))?;
    }

    Ok((texts, backend))
}
