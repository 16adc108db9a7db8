//! Tests that touch the host filesystem: import, Task, FS builtins and
//! compiled images.

use interpreter::CaptureWriter;
use mica_cli::{run_capturing, Runtime};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

fn write_script(dir: &tempfile::TempDir, name: &str, source: &str) -> String {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(source.as_bytes()).unwrap();
    path.to_string_lossy().to_string()
}

#[test]
fn test_import_merges_globals() {
    let dir = tempfile::tempdir().unwrap();
    let module = write_script(&dir, "lib.ms", "function triple(x) { return x * 3; }");
    let source = format!(r#"import("{}"); println(triple(7));"#, module);
    let out = run_capturing(&source).unwrap();
    assert_eq!(out, "21\n");
}

#[test]
fn test_import_string() {
    let out = run_capturing(
        r#"importString("function twice(x) { return x * 2; }"); println(twice(4));"#,
    )
    .unwrap();
    assert_eq!(out, "8\n");
}

#[test]
fn test_task_spawn_runs_program() {
    let dir = tempfile::tempdir().unwrap();
    let worker = write_script(&dir, "worker.ms", r#"println("from worker");"#);
    let source = format!(r#"var t = new Task("{}"); t.run(); println("from main");"#, worker);
    let out = run_capturing(&source).unwrap();
    assert!(out.contains("from main"), "got: {}", out);
    assert!(out.contains("from worker"), "got: {}", out);
}

#[test]
fn test_fs_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt").to_string_lossy().to_string();
    let source = format!(
        r#"
        var f = FS.open("{path}", "w");
        f.write("line one");
        f.close();
        var g = FS.open("{path}", "r");
        println(g.valid());
        println(g.read());
        "#,
    );
    let out = run_capturing(&source).unwrap();
    assert_eq!(out, "true\nline one\n");
}

#[test]
fn test_directory_listing() {
    let dir = tempfile::tempdir().unwrap();
    let _ = write_script(&dir, "a.txt", "aaa");
    let _ = write_script(&dir, "b.txt", "b");
    let source = format!(
        r#"
        var d = new Directory("{}");
        while (d.valid()) {{
            printf("%s:%d\n", d.name(), d.size());
            d.next();
        }}
        "#,
        dir.path().to_string_lossy()
    );
    let out = run_capturing(&source).unwrap();
    assert_eq!(out, "a.txt:3\nb.txt:1\n");
}

#[test]
fn test_compile_writes_image() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "prog.ms", "var a = 1 + 2;");
    let mut runtime = Runtime::new();
    let image_path = runtime.compile_file(&script).unwrap();
    let bytes = std::fs::read(&image_path).unwrap();
    assert_eq!(&bytes[0..4], b"m8r\0");
}

#[test]
fn test_terminated_task_stops() {
    let dir = tempfile::tempdir().unwrap();
    // The worker would run forever; terminate() must stop it at a safe
    // point so the scheduler finishes.
    let worker = write_script(&dir, "spin.ms", "while (true) { delay(1); }");
    let source = format!(
        r#"var t = new Task("{}"); t.run(); delay(10); t.terminate(); println("stopped");"#,
        worker
    );
    let out = run_capturing(&source).unwrap();
    assert!(out.contains("stopped"), "got: {}", out);
}

#[test]
fn test_capture_console_is_shared_with_spawned_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let worker = write_script(&dir, "w.ms", r#"println("w-out");"#);
    let console = Rc::new(RefCell::new(CaptureWriter::new()));
    let mut runtime = Runtime::new().with_console(console.clone());
    runtime
        .execute_source(&format!(r#"var t = new Task("{}"); t.run();"#, worker))
        .unwrap();
    assert!(console.borrow().contents().contains("w-out"));
}
