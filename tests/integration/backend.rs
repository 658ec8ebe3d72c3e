mod common;
use common::{call_count, runtime_id};

use std::path::Path;
use std::process::Command;

use cranelift_codegen::ir::{types, AbiParam, InstBuilder};
use cranelift_codegen::settings;
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{Linkage, Module};

use vesta_codegen::codegen::defer::{DeferCallee, DeferKind};
use vesta_codegen::codegen::Backend;
use vesta_codegen::config::{load_options, parse_options, CodegenOptions};
use vesta_codegen::diagnostics::CompileError;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

#[test]
fn config_defaults() {
    let opts = parse_options("").unwrap();
    assert_eq!(opts.target, "x86_64-unknown-linux-gnu");
    assert!(opts.pic);
    assert_eq!(opts.module_name, "vesta_module");
}

#[test]
fn config_overrides() {
    let opts = parse_options(
        "[codegen]\ntarget = \"aarch64-unknown-linux-gnu\"\npic = false\nmodule_name = \"demo\"\n",
    )
    .unwrap();
    assert_eq!(opts.target, "aarch64-unknown-linux-gnu");
    assert!(!opts.pic);
    assert_eq!(opts.module_name, "demo");
}

#[test]
fn config_rejects_bad_toml() {
    assert!(parse_options("[codegen\ntarget=").is_err());
}

#[test]
fn config_missing_file_reports_path() {
    let err = load_options(Path::new("/nonexistent/vesta.toml")).unwrap_err();
    match err {
        CompileError::Config { path, .. } => {
            assert_eq!(path, Path::new("/nonexistent/vesta.toml"));
        }
        other => panic!("expected config error, got {other}"),
    }
}

#[test]
fn unknown_target_rejected() {
    let opts = CodegenOptions {
        target: "z80-unknown-none".to_string(),
        ..CodegenOptions::default()
    };
    assert!(Backend::new(&opts).is_err());
}

#[test]
fn defers_compile_to_elf_object() {
    let mut backend = Backend::new(&CodegenOptions::default()).unwrap();
    let print_int = backend.runtime().get("__vesta_print_int");

    let mut sig = backend.module.make_signature();
    sig.params.push(AbiParam::new(types::I64));
    sig.returns.push(AbiParam::new(types::I64));
    let func_id = backend
        .module
        .declare_function("with_cleanup", Linkage::Export, &sig)
        .unwrap();

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
        frame
            .register_defer(DeferKind::Always, DeferCallee::Direct(print_int), &[arg])
            .unwrap();

        let then_bb = frame.builder.create_block();
        let else_bb = frame.builder.create_block();
        frame.builder.ins().brif(arg, then_bb, &[], else_bb, &[]);

        frame.resume_at(then_bb);
        frame.builder.seal_block(then_bb);
        frame
            .register_defer(DeferKind::InCond, DeferCallee::Direct(print_int), &[arg])
            .unwrap();
        let _ = frame.run_defers();
        let one = frame.builder.ins().iconst(types::I64, 1);
        frame.builder.ins().return_(&[one]);

        frame.resume_at(else_bb);
        frame.builder.seal_block(else_bb);
        let _ = frame.run_defers();
        let zero = frame.builder.ins().iconst(types::I64, 0);
        frame.builder.ins().return_(&[zero]);

        frame.finish().unwrap();
    }
    backend.module.define_function(func_id, &mut ctx).unwrap();

    let bytes = backend.finish().unwrap();
    assert!(bytes.len() > 4);
    assert_eq!(bytes[..4], ELF_MAGIC);
}

#[test]
fn chain_key_init_is_guarded() {
    let mut backend = Backend::new(&CodegenOptions::default()).unwrap();

    let sig = backend.module.make_signature();
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

    let flags = settings::Flags::new(settings::builder());
    cranelift_codegen::verify_function(&ctx.func, &flags).unwrap();
    let clif = ctx.func.display().to_string();

    // key loaded, compared against zero, created only on the miss path
    assert!(clif.contains("load.i32"));
    assert!(clif.contains("brif"));
    assert_eq!(call_count(&clif, runtime_id("pthread_key_create")), 1);
}

fn irdump() -> Command {
    Command::new(env!("CARGO_BIN_EXE_vesta-irdump"))
}

#[test]
fn irdump_prints_clif() {
    let out = irdump().arg("clif").output().unwrap();
    assert!(
        out.status.success(),
        "irdump failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("function"));
    assert!(stdout.contains("trap user1"));
}

#[test]
fn irdump_writes_object() {
    let dir = tempfile::tempdir().unwrap();
    let obj_path = dir.path().join("demo.o");

    let out = irdump()
        .arg("obj")
        .arg("-o")
        .arg(&obj_path)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "irdump failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let bytes = std::fs::read(&obj_path).unwrap();
    assert_eq!(bytes[..4], ELF_MAGIC);
}

#[test]
fn irdump_honors_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vesta.toml");
    std::fs::write(
        &config_path,
        "[codegen]\ntarget = \"aarch64-unknown-linux-gnu\"\n",
    )
    .unwrap();
    let obj_path = dir.path().join("demo.o");

    let out = irdump()
        .arg("--config")
        .arg(&config_path)
        .arg("obj")
        .arg("-o")
        .arg(&obj_path)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "irdump failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let bytes = std::fs::read(&obj_path).unwrap();
    assert_eq!(bytes[..4], ELF_MAGIC);
}
