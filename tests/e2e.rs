use std::path::{Path, PathBuf};
use std::process::Command;

use mire::vm::asm::{Assembler, DynMethodSpec, MethodSpec};
use mire::vm::ops::Opcode;
use mire::vm::{Mode, PrimType};

struct Output {
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

fn mire(args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_mire"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("MIRE_HEAP_SIZE")
        .output()
        .expect("failed to execute mire");
    Output {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        code: output.status.code(),
    }
}

fn save(asm: Assembler, mode: Mode, entry: usize, dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    asm.finish(mode, entry).unwrap().save(&path).unwrap();
    path
}

fn static_sum(dir: &Path) -> PathBuf {
    let mut asm = Assembler::new();
    let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
    asm.constval(PrimType::I32, 5)
        .constval(PrimType::I32, 3)
        .binary(Opcode::Add, PrimType::I32)
        .ret(PrimType::I32);
    save(asm, Mode::Static, m, dir, "sum.mire")
}

#[test]
fn test_static_run_prints_typed_result() {
    let dir = tempfile::tempdir().unwrap();
    let image = static_sum(dir.path());
    let out = mire(&["run", image.to_str().unwrap()]);
    assert_eq!(out.code, Some(0), "stderr:\n{}", out.stderr);
    assert_eq!(out.stdout, "i32 8\n");
}

#[test]
fn test_static_run_with_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let mut asm = Assembler::new();
    let m = asm.begin_method(
        &MethodSpec::new()
            .formal(PrimType::I64, 0)
            .formal(PrimType::I64, 0)
            .reserved_slots()
            .eval_depth(2),
    );
    asm.dread(PrimType::I64, 1)
        .dread(PrimType::I64, 2)
        .binary(Opcode::Sub, PrimType::I64)
        .ret(PrimType::I64);
    let image = save(asm, Mode::Static, m, dir.path(), "sub.mire");
    let out = mire(&["run", image.to_str().unwrap(), "--arg", "10", "--arg", "-32"]);
    assert_eq!(out.code, Some(0), "stderr:\n{}", out.stderr);
    assert_eq!(out.stdout, "i64 42\n");
}

#[test]
fn test_dynamic_run_exits_with_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut asm = Assembler::new();
    let main = asm.begin_dyn_method(&DynMethodSpec::main(0, 2));
    asm.constval(PrimType::DynI32, 6)
        .constval(PrimType::DynI32, 7)
        .binary(Opcode::Mul, PrimType::DynAny)
        .ret(PrimType::DynAny);
    let image = save(asm, Mode::Dynamic, main, dir.path(), "main.mire");
    let out = mire(&["run", image.to_str().unwrap()]);
    assert_eq!(out.code, Some(42));
}

#[test]
fn test_dynamic_uncaught_exception() {
    let dir = tempfile::tempdir().unwrap();
    let mut asm = Assembler::new();
    let main = asm.begin_dyn_method(&DynMethodSpec::main(0, 1));
    asm.constval(PrimType::DynI32, 7).stmt(Opcode::Throw).ret(PrimType::Void);
    let image = save(asm, Mode::Dynamic, main, dir.path(), "throw.mire");
    let out = mire(&["run", image.to_str().unwrap()]);
    assert_eq!(out.code, Some(3));
    assert!(out.stderr.contains("uncaught exception: 7"), "stderr:\n{}", out.stderr);
}

#[test]
fn test_dump_text_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let image = static_sum(dir.path());
    let path = image.to_str().unwrap();

    let text = mire(&["dump", path]);
    assert_eq!(text.code, Some(0));
    assert!(text.stdout.starts_with("== static image"));
    assert!(text.stdout.contains("constval"));
    assert!(text.stdout.contains("add"));

    let json = mire(&["dump", "--json", path]);
    assert_eq!(json.code, Some(0));
    let listing: serde_json::Value = serde_json::from_str(&json.stdout).unwrap();
    assert_eq!(listing["mode"], "static");
    assert_eq!(listing["methods"].as_array().unwrap().len(), 1);
    assert_eq!(listing["methods"][0]["instrs"].as_array().unwrap().len(), 4);
}

#[test]
fn test_check_accepts_image_and_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let image = static_sum(dir.path());
    let ok = mire(&["check", image.to_str().unwrap()]);
    assert_eq!(ok.code, Some(0), "stderr:\n{}", ok.stderr);
    assert!(ok.stdout.ends_with("4 instructions ok\n"));

    let garbage = dir.path().join("garbage.mire");
    std::fs::write(&garbage, b"not an image at all").unwrap();
    let bad = mire(&["check", garbage.to_str().unwrap()]);
    assert_ne!(bad.code, Some(0));
}

#[test]
fn test_missing_image_is_fatal() {
    let out = mire(&["run", "/nonexistent/app.mire"]);
    assert_eq!(out.code, Some(134));
    assert!(out.stderr.contains("error:"));
}
