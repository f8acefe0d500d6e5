//! Static-mode engine driven through assembled images.

use std::sync::Arc;

use mire::error::EngineError;
use mire::vm::asm::{Assembler, MethodSpec};
use mire::vm::intrinsic::IntrinsicId;
use mire::vm::ops::Opcode;
use mire::vm::runtime::{ClassInitState, ClinitStatus, ClinitStep, class_id};
use mire::vm::{Image, MValue, Mode, PrimType, SimpleRuntime, StaticEngine, StaticRuntime};

fn engine_with(image: Image, rt: &Arc<SimpleRuntime>) -> StaticEngine {
    let runtime: Arc<dyn StaticRuntime> = rt.clone();
    StaticEngine::new(image, runtime).unwrap()
}

fn engine(asm: Assembler, entry: usize) -> StaticEngine {
    engine_with(asm.finish(Mode::Static, entry).unwrap(), &Arc::new(SimpleRuntime::new()))
}

#[test]
fn test_constant_addition_yields_i32_cell() {
    let mut asm = Assembler::new();
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.constval(PrimType::I32, 5)
        .constval(PrimType::I32, 3)
        .binary(Opcode::Add, PrimType::I32)
        .ret(PrimType::I32);
    let result = engine(asm, m).run_entry(&[]).unwrap();
    assert_eq!(result.prim_type(), PrimType::I32);
    assert_eq!(result, MValue::I32(8));
}

#[test]
fn test_icall_without_magic_goes_through_ffi() {
    let abs = libc::abs as unsafe extern "C" fn(libc::c_int) -> libc::c_int;
    let mut asm = Assembler::new();
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.constval64(PrimType::A64, abs as usize as u64)
        .constval(PrimType::I32, -7)
        .icall(PrimType::I32, 2)
        .regread(PrimType::I32, 0)
        .ret(PrimType::I32);
    assert_eq!(engine(asm, m).run_entry(&[]).unwrap(), MValue::I32(7));
}

#[test]
fn test_icall_into_interpreted_method() {
    let mut asm = Assembler::new();
    let square = asm.begin_method(&MethodSpec::new().formal(PrimType::I64, 0).reserved_slots().eval_depth(2));
    asm.dread(PrimType::I64, 1)
        .dread(PrimType::I64, 1)
        .binary(Opcode::Mul, PrimType::I64)
        .ret(PrimType::I64);
    let main = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.addroffunc(PrimType::A64, square)
        .constval(PrimType::I64, 12)
        .icall(PrimType::I64, 2)
        .regread(PrimType::I64, 0)
        .ret(PrimType::I64);
    assert_eq!(engine(asm, main).run_entry(&[]).unwrap(), MValue::I64(144));
}

#[test]
fn test_catch_tables_match_in_declared_order() {
    let mut asm = Assembler::new();
    let error_word = asm.data_u64(class_id::ERROR);
    let exception_word = asm.data_u64(class_id::EXCEPTION);
    let npe_word = asm.data_u64(class_id::NULL_POINTER);
    let m = asm.begin_method(&MethodSpec::new().formal(PrimType::A64, 0).reserved_slots().eval_depth(1));
    let (first, second) = (asm.label(), asm.label());
    asm.javatry(&[first, second]).dread(PrimType::A64, 1).stmt(Opcode::Throw);
    asm.bind(first);
    asm.javacatch(&[Some(error_word)]).constval(PrimType::I32, 1).ret(PrimType::I32);
    asm.bind(second);
    // the superclass entry precedes the exact one, so it wins
    asm.javacatch(&[Some(exception_word), Some(npe_word)])
        .constval(PrimType::I32, 2)
        .ret(PrimType::I32);

    let rt = Arc::new(SimpleRuntime::new());
    let engine = engine_with(asm.finish(Mode::Static, m).unwrap(), &rt);
    let npe = rt.new_object(class_id::NULL_POINTER);
    assert_eq!(engine.run_entry(&[MValue::A64(npe)]).unwrap(), MValue::I32(2));
    assert_eq!(rt.ref_delta(npe), 0);
}

#[test]
fn test_unhandled_exception_releases_callee_refs_only() {
    let mut asm = Assembler::new();
    let arith_word = asm.data_u64(class_id::ARITHMETIC);
    // callee(obj): try { throw obj } catch (ArithmeticException) { }
    let callee = asm.begin_method(&MethodSpec::new().formal(PrimType::A64, 1).reserved_slots().eval_depth(1));
    let catch = asm.label();
    asm.javatry(&[catch]).dread(PrimType::A64, 1).stmt(Opcode::Throw);
    asm.bind(catch);
    asm.javacatch(&[Some(arith_word)]).ret(PrimType::Void);
    // main(obj): try { callee(obj) } catch (*) { return 3 }
    let main = asm.begin_method(&MethodSpec::new().formal(PrimType::A64, 0).reserved_slots().eval_depth(2));
    let any = asm.label();
    asm.javatry(&[any])
        .addroffunc(PrimType::A64, callee)
        .dread(PrimType::A64, 1)
        .icall(PrimType::Void, 2)
        .constval(PrimType::I32, 0)
        .ret(PrimType::I32);
    asm.bind(any);
    asm.javacatch(&[None]).constval(PrimType::I32, 3).ret(PrimType::I32);

    let rt = Arc::new(SimpleRuntime::new());
    let engine = engine_with(asm.finish(Mode::Static, main).unwrap(), &rt);
    let ex = rt.new_object(class_id::RUNTIME_EXCEPTION);
    assert_eq!(engine.run_entry(&[MValue::A64(ex)]).unwrap(), MValue::I32(3));
    // the callee's counted formal is released once while unwinding
    assert_eq!(rt.ref_delta(ex), -1);
}

#[test]
fn test_null_read_raises_null_pointer_exception() {
    let mut asm = Assembler::new();
    let npe_word = asm.data_u64(class_id::NULL_POINTER);
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(1));
    let catch = asm.label();
    asm.javatry(&[catch])
        .constval64(PrimType::A64, 0)
        .op(Opcode::Iread, PrimType::I32, 0)
        .ret(PrimType::I32);
    asm.bind(catch);
    asm.javacatch(&[Some(npe_word)]).constval(PrimType::I32, 5).ret(PrimType::I32);
    assert_eq!(engine(asm, m).run_entry(&[]).unwrap(), MValue::I32(5));
}

#[test]
fn test_divide_by_zero_is_catchable() {
    let mut asm = Assembler::new();
    let arith_word = asm.data_u64(class_id::ARITHMETIC);
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    let catch = asm.label();
    asm.javatry(&[catch])
        .constval(PrimType::I32, 1)
        .constval(PrimType::I32, 0)
        .binary(Opcode::Div, PrimType::I32)
        .ret(PrimType::I32);
    asm.bind(catch);
    asm.javacatch(&[Some(arith_word)]).constval(PrimType::I32, -1).ret(PrimType::I32);
    assert_eq!(engine(asm, m).run_entry(&[]).unwrap(), MValue::I32(-1));
}

#[test]
fn test_uncaught_exception_reaches_embedder() {
    let mut asm = Assembler::new();
    let m = asm.begin_method(&MethodSpec::new().formal(PrimType::A64, 0).reserved_slots().eval_depth(1));
    asm.dread(PrimType::A64, 1).stmt(Opcode::Throw);
    let rt = Arc::new(SimpleRuntime::new());
    let engine = engine_with(asm.finish(Mode::Static, m).unwrap(), &rt);
    let ex = rt.new_object(class_id::EXCEPTION);
    let err = engine.run_entry(&[MValue::A64(ex)]).unwrap_err();
    assert!(matches!(err, EngineError::UncaughtThrowable(obj) if obj == ex));
    assert_eq!(err.exit_code(), 134);
}

#[test]
fn test_image_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut asm = Assembler::new();
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.constval(PrimType::I64, -2)
        .constval(PrimType::I64, 21)
        .binary(Opcode::Mul, PrimType::I64)
        .ret(PrimType::I64);
    let path = dir.path().join("mul.mire");
    asm.finish(Mode::Static, m).unwrap().save(&path).unwrap();

    let image = Image::load(&path).unwrap();
    assert_eq!(image.mode(), Mode::Static);
    let engine = engine_with(image, &Arc::new(SimpleRuntime::new()));
    assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I64(-42));
}

// ========================================
// Intrinsics
// ========================================

const CLASSINFO: u64 = 0xc1a55;
const PARENT: u64 = 0x200;
const CHILD: u64 = 0x201;

struct ClinitImage {
    engine: StaticEngine,
    ok: u64,
    failing: u64,
    throws_error: u64,
}

/// `main(info)`: runs `MPL_CLINIT_CHECK` on `info`, catching
/// `ExceptionInInitializerError` as 2 and returning 1 otherwise. The error
/// thrown by `throws_error` is `error_obj`.
fn clinit_image(rt: &Arc<SimpleRuntime>, error_obj: u64) -> ClinitImage {
    let mut asm = Assembler::new();
    let eiie_word = asm.data_u64(class_id::EXCEPTION_IN_INITIALIZER);
    let ok = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(1));
    asm.ret(PrimType::Void);
    let failing = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.constval(PrimType::I32, 1)
        .constval(PrimType::I32, 0)
        .binary(Opcode::Div, PrimType::I32)
        .ret(PrimType::Void);
    let throws_error = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(1));
    asm.constval64(PrimType::A64, error_obj).stmt(Opcode::Throw);
    let main = asm.begin_method(&MethodSpec::new().formal(PrimType::A64, 0).reserved_slots().eval_depth(1));
    let catch = asm.label();
    asm.javatry(&[catch])
        .dread(PrimType::A64, 1)
        .intrinsic(PrimType::Void, IntrinsicId::MplClinitCheck as u8, 1)
        .constval(PrimType::I32, 1)
        .ret(PrimType::I32);
    asm.bind(catch);
    asm.javacatch(&[Some(eiie_word)]).constval(PrimType::I32, 2).ret(PrimType::I32);

    let engine = engine_with(asm.finish(Mode::Static, main).unwrap(), rt);
    ClinitImage {
        ok: engine.method_addr(ok),
        failing: engine.method_addr(failing),
        throws_error: engine.method_addr(throws_error),
        engine,
    }
}

fn run_clinit(image: &ClinitImage) -> Result<MValue, EngineError> {
    let info = Box::new(CLASSINFO);
    image.engine.run_entry(&[MValue::A64(&*info as *const u64 as u64)])
}

fn step(class: u64, clinit: u64) -> ClinitStep {
    ClinitStep { class, clinit }
}

#[test]
fn test_clinit_runs_initializers_in_order() {
    let rt = Arc::new(SimpleRuntime::new());
    let image = clinit_image(&rt, 0);
    rt.set_clinit_chain(CLASSINFO, vec![step(PARENT, image.ok), step(CHILD, image.ok), step(0, 0)]);
    assert_eq!(run_clinit(&image).unwrap(), MValue::I32(1));
    assert_eq!(
        rt.finalized(),
        vec![(PARENT, ClinitStatus::Normal), (CHILD, ClinitStatus::Normal)]
    );
    assert_eq!(rt.class_init_state(CHILD), ClassInitState::Initialized);
}

#[test]
fn test_clinit_wraps_exception_and_skips_dependents() {
    let rt = Arc::new(SimpleRuntime::new());
    let image = clinit_image(&rt, 0);
    rt.set_clinit_chain(CLASSINFO, vec![step(PARENT, image.failing), step(CHILD, image.ok)]);
    assert_eq!(run_clinit(&image).unwrap(), MValue::I32(2));
    assert_eq!(
        rt.finalized(),
        vec![(PARENT, ClinitStatus::Thrown), (CHILD, ClinitStatus::Skipped)]
    );
    assert_eq!(rt.class_init_state(PARENT), ClassInitState::Failure);
    // the ArithmeticException is released and replaced by the wrapper
    let [cause, wrapper] = rt.announced()[..] else {
        panic!("expected two allocations, got {:?}", rt.announced());
    };
    assert_eq!(rt.class_of(cause), Some(class_id::ARITHMETIC));
    assert_eq!(rt.ref_delta(cause), -1);
    assert_eq!(rt.class_of(wrapper), Some(class_id::EXCEPTION_IN_INITIALIZER));
}

#[test]
fn test_clinit_rethrows_errors_unchanged() {
    let rt = Arc::new(SimpleRuntime::new());
    let err = rt.new_object(class_id::LINKAGE_ERROR);
    let image = clinit_image(&rt, err);
    rt.set_clinit_chain(CLASSINFO, vec![step(PARENT, image.throws_error)]);
    let result = run_clinit(&image).unwrap_err();
    assert!(matches!(result, EngineError::UncaughtThrowable(obj) if obj == err));
    assert_eq!(rt.ref_delta(err), 0);
    assert_eq!(rt.finalized(), vec![(PARENT, ClinitStatus::Thrown)]);
}

#[test]
fn test_clinit_failed_parent_is_no_class_def_found() {
    let rt = Arc::new(SimpleRuntime::new());
    let image = clinit_image(&rt, 0);
    rt.set_init_state(PARENT, ClassInitState::Failure);
    rt.set_clinit_chain(CLASSINFO, vec![step(PARENT, image.ok), step(CHILD, image.ok)]);
    let result = run_clinit(&image).unwrap_err();
    let EngineError::UncaughtThrowable(obj) = result else {
        panic!("expected an uncaught throwable, got {:?}", result);
    };
    assert_eq!(rt.class_of(obj), Some(class_id::NO_CLASS_DEF_FOUND));
    assert_eq!(rt.finalized(), vec![(CHILD, ClinitStatus::Skipped)]);
}

fn cleanup_image(rt: &Arc<SimpleRuntime>, id: IntrinsicId) -> StaticEngine {
    let mut asm = Assembler::new();
    let m = asm.begin_method(
        &MethodSpec::new()
            .formal(PrimType::A64, 0)
            .formal(PrimType::A64, 0)
            .formal(PrimType::A64, 0)
            .reserved_slots()
            .eval_depth(3),
    );
    asm.dread(PrimType::A64, 1)
        .dread(PrimType::A64, 2)
        .dread(PrimType::A64, 3)
        .intrinsic(PrimType::Void, id as u8, 3)
        .ret(PrimType::Void);
    engine_with(asm.finish(Mode::Static, m).unwrap(), rt)
}

#[test]
fn test_cleanup_local_refs_releases_each_non_null() {
    let rt = Arc::new(SimpleRuntime::new());
    let engine = cleanup_image(&rt, IntrinsicId::MplCleanupLocalRefVars);
    let (a, b) = (rt.new_object(class_id::EXCEPTION), rt.new_object(class_id::EXCEPTION));
    engine.run_entry(&[MValue::A64(a), MValue::A64(0), MValue::A64(b)]).unwrap();
    assert_eq!(rt.ref_delta(a), -1);
    assert_eq!(rt.ref_delta(b), -1);
    assert_eq!(rt.ref_delta(0), 0);
}

#[test]
fn test_cleanup_local_refs_skip_keeps_last_argument() {
    let rt = Arc::new(SimpleRuntime::new());
    let engine = cleanup_image(&rt, IntrinsicId::MplCleanupLocalRefVarsSkip);
    let objs = [
        rt.new_object(class_id::EXCEPTION),
        rt.new_object(class_id::EXCEPTION),
        rt.new_object(class_id::EXCEPTION),
    ];
    engine.run_entry(&objs.map(MValue::A64)).unwrap();
    assert_eq!(objs.map(|o| rt.ref_delta(o)), [-1, -1, 0]);
}

#[test]
fn test_slow_native_call_balances_saferegion() {
    let abs = libc::abs as unsafe extern "C" fn(libc::c_int) -> libc::c_int;
    let rt = Arc::new(SimpleRuntime::new());
    let mut asm = Assembler::new();
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.constval64(PrimType::A64, abs as usize as u64)
        .constval(PrimType::I32, -9)
        .intrinsic(PrimType::I32, IntrinsicId::MccCallSlowNative as u8, 2)
        .regread(PrimType::I32, 0)
        .ret(PrimType::I32);
    let engine = engine_with(asm.finish(Mode::Static, m).unwrap(), &rt);
    assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I32(9));
    assert_eq!(rt.saferegion_depth(), 0);
}

#[test]
fn test_slow_call_that_throws_leaves_saferegion() {
    let rt = Arc::new(SimpleRuntime::new());
    let mut asm = Assembler::new();
    let arith_word = asm.data_u64(class_id::ARITHMETIC);
    let failing = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.constval(PrimType::I32, 1)
        .constval(PrimType::I32, 0)
        .binary(Opcode::Rem, PrimType::I32)
        .ret(PrimType::I32);
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(1));
    let catch = asm.label();
    asm.javatry(&[catch])
        .addroffunc(PrimType::A64, failing)
        .intrinsic(PrimType::I32, IntrinsicId::MccCallSlowNative as u8, 1)
        .constval(PrimType::I32, 0)
        .ret(PrimType::I32);
    asm.bind(catch);
    asm.javacatch(&[Some(arith_word)]).constval(PrimType::I32, 4).ret(PrimType::I32);
    let engine = engine_with(asm.finish(Mode::Static, m).unwrap(), &rt);
    assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I32(4));
    assert_eq!(rt.saferegion_depth(), 0);
}

extern "C" fn new_object_of(class: u64) -> u64 {
    Box::into_raw(Box::new([class, 0u64])) as u64
}

#[test]
fn test_allocation_intrinsic_announces_object() {
    let rt = Arc::new(SimpleRuntime::new());
    let mut asm = Assembler::new();
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(1));
    asm.constval(PrimType::U64, CHILD as i16)
        .intrinsic(PrimType::A64, IntrinsicId::MccNewObjFixedClass as u8, 1)
        .regread(PrimType::A64, 0)
        .ret(PrimType::A64);
    let mut engine = engine_with(asm.finish(Mode::Static, m).unwrap(), &rt);
    engine
        .intrinsics_mut()
        .register(IntrinsicId::MccNewObjFixedClass, new_object_of as *const () as u64);

    let obj = engine.run_entry(&[]).unwrap().address();
    assert_eq!(rt.announced(), vec![obj]);
    let block = unsafe { Box::from_raw(obj as *mut [u64; 2]) };
    assert_eq!(block[0], CHILD);
}
