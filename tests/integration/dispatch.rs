mod common;
use common::{call_count, hook_ids, lower, runtime_id};

use cranelift_codegen::ir::{types, Block, InstBuilder};
use vesta_codegen::codegen::defer::{DeferCallee, DeferKind};

/// Lower a function with one unconditional defer and `exits` return points,
/// collecting the resume block of each exit.
fn lower_with_exits(exits: usize, resumes: &mut Vec<Block>) -> String {
    lower(|frame, h, arg| {
        frame.register_defer(DeferKind::Always, DeferCallee::Direct(h.a()), &[arg])?;
        for e in 0..exits {
            if e > 0 {
                let block = frame.builder.create_block();
                frame.resume_at(block);
                frame.builder.seal_block(block);
            }
            resumes.push(frame.run_defers().unwrap());
            let v = frame.builder.ins().iconst(types::I64, e as i64);
            frame.builder.ins().return_(&[v]);
        }
        Ok(())
    })
}

#[test]
fn each_exit_gets_a_distinct_resume_block() {
    for exits in 1..=4 {
        let mut resumes = Vec::new();
        lower_with_exits(exits, &mut resumes);
        assert_eq!(resumes.len(), exits);
        for i in 0..resumes.len() {
            for j in 0..i {
                assert_ne!(resumes[i], resumes[j], "exits {j} and {i} share a resume block");
            }
        }
    }
}

#[test]
fn chain_pop_is_shared_by_all_exits() {
    // However many exits enter the trampoline, the TLS pop happens exactly
    // once, and the push/pop pair stays balanced.
    for exits in 1..=4 {
        let mut resumes = Vec::new();
        let clif = lower_with_exits(exits, &mut resumes);
        assert_eq!(call_count(&clif, runtime_id("pthread_setspecific")), 2);
        assert_eq!(call_count(&clif, runtime_id("pthread_getspecific")), 1);
    }
}

#[test]
fn branching_exits_dispatch_through_one_trampoline() {
    let hooks = hook_ids();
    let mut trampolines = Vec::new();
    let clif = lower(|frame, h, arg| {
        frame.register_defer(DeferKind::Always, DeferCallee::Direct(h.a()), &[arg])?;

        let then_bb = frame.builder.create_block();
        let else_bb = frame.builder.create_block();
        frame.builder.ins().brif(arg, then_bb, &[], else_bb, &[]);

        frame.resume_at(then_bb);
        frame.builder.seal_block(then_bb);
        let _ = frame.run_defers();
        trampolines.push(frame.trampoline_block().unwrap());
        let one = frame.builder.ins().iconst(types::I64, 1);
        frame.builder.ins().return_(&[one]);

        frame.resume_at(else_bb);
        frame.builder.seal_block(else_bb);
        let _ = frame.run_defers();
        trampolines.push(frame.trampoline_block().unwrap());
        let zero = frame.builder.ins().iconst(types::I64, 0);
        frame.builder.ins().return_(&[zero]);
        Ok(())
    });

    assert_eq!(trampolines[0], trampolines[1]);
    // the deferred call is emitted once, not once per exit
    assert_eq!(call_count(&clif, hooks.a()), 1);
}

#[test]
fn trampoline_absent_when_no_exit_runs_defers() {
    // A function whose only path never reaches run_defers keeps its record
    // pushed and emits no trampoline and no pop.
    let hooks = hook_ids();
    let clif = lower(|frame, h, arg| {
        frame.register_defer(DeferKind::Always, DeferCallee::Direct(h.a()), &[arg])?;
        frame.builder.ins().return_(&[arg]);
        Ok(())
    });

    assert_eq!(call_count(&clif, hooks.a()), 0);
    assert_eq!(call_count(&clif, runtime_id("pthread_getspecific")), 1);
    assert_eq!(call_count(&clif, runtime_id("pthread_setspecific")), 1);
}

#[test]
fn no_defers_means_no_chain_traffic() {
    let clif = lower(|frame, _h, arg| {
        frame.builder.ins().return_(&[arg]);
        Ok(())
    });

    assert_eq!(call_count(&clif, runtime_id("pthread_getspecific")), 0);
    assert_eq!(call_count(&clif, runtime_id("pthread_setspecific")), 0);
    assert!(!clif.contains("explicit_slot"));
}

#[test]
fn run_defers_without_registrations_still_balances_the_chain() {
    let clif = lower(|frame, _h, _arg| {
        let _ = frame.run_defers();
        let zero = frame.builder.ins().iconst(types::I64, 0);
        frame.builder.ins().return_(&[zero]);
        Ok(())
    });

    // empty trampoline: push, pop, no deferred calls
    assert_eq!(call_count(&clif, runtime_id("pthread_setspecific")), 2);
    assert_eq!(call_count(&clif, runtime_id("pthread_getspecific")), 1);
}
