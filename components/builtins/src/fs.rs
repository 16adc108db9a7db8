//! Filesystem builtins: FS, File and Directory, over the host's std::fs.
//!
//! A File's state lives entirely in script-visible values: the backing
//! path, a cursor, and a buffered body that `close()` flushes for write
//! modes. That keeps handles collectable like any other object.

use core_types::{Atom, CallResult, CallReturn, Error, ObjectId, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::ExecutionUnit;

struct FileAtoms {
    path: Atom,
    pos: Atom,
    mode: Atom,
    data: Atom,
    valid: Atom,
}

fn file_atoms(eu: &mut ExecutionUnit) -> FileAtoms {
    let atoms = eu.atoms();
    let mut atoms = atoms.borrow_mut();
    FileAtoms {
        path: atoms.intern("%path"),
        pos: atoms.intern("%pos"),
        mode: atoms.intern("%mode"),
        data: atoms.intern("%data"),
        valid: atoms.intern("%valid"),
    }
}

/// Installs `FS`, the `File` prototype and the `Directory` prototype.
pub fn install(eu: &mut ExecutionUnit) {
    let atoms = eu.atoms();
    let mount_a = atoms.borrow_mut().intern("mount");
    let mounted_a = atoms.borrow_mut().intern("mounted");
    let open_a = atoms.borrow_mut().intern("open");
    let remove_a = atoms.borrow_mut().intern("remove");
    ProtoBuilder::new(eu, WellKnown::Fs.into())
        .method(mount_a, fs_mount)
        .method(mounted_a, fs_mounted)
        .method(open_a, fs_open)
        .method(remove_a, fs_remove)
        .build();

    let read_a = atoms.borrow_mut().intern("read");
    let write_a = atoms.borrow_mut().intern("write");
    let close_a = atoms.borrow_mut().intern("close");
    let valid_a = atoms.borrow_mut().intern("valid");
    ProtoBuilder::new(eu, WellKnown::File.into())
        .method(read_a, file_read)
        .method(write_a, file_write)
        .method(close_a, file_close)
        .method(valid_a, file_valid)
        .build();

    let name_a = atoms.borrow_mut().intern("name");
    let size_a = atoms.borrow_mut().intern("size");
    let next_a = WellKnown::Next.into();
    ProtoBuilder::new(eu, WellKnown::Directory.into())
        .method(WellKnown::Constructor.into(), directory_constructor)
        .method(name_a, directory_name)
        .method(size_a, directory_size)
        .method(valid_a, directory_valid)
        .method(next_a, directory_next)
        .build();
}

fn fs_mount(_eu: &mut ExecutionUnit, _this: Value, _nparams: u32) -> CallResult {
    // The host filesystem is always mounted.
    Ok(CallReturn::Count(0))
}

fn fs_mounted(eu: &mut ExecutionUnit, _this: Value, _nparams: u32) -> CallResult {
    eu.push(Value::Bool(true));
    Ok(CallReturn::Count(1))
}

/// `FS.open(path, mode)` with mode `"r"`, `"w"` or `"a"`.
fn fs_open(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let path = eu.to_string_value(eu.native_arg(nparams, 0));
    let mode = if nparams > 1 {
        eu.to_string_value(eu.native_arg(nparams, 1))
    } else {
        "r".to_string()
    };
    let names = file_atoms(eu);

    let (data, valid) = match mode.as_str() {
        "r" => match std::fs::read_to_string(&path) {
            Ok(text) => (text, true),
            Err(_) => (String::new(), false),
        },
        "a" => (std::fs::read_to_string(&path).unwrap_or_default(), true),
        _ => (String::new(), true),
    };

    let proto = eu
        .global(WellKnown::File.into())
        .and_then(|v| v.as_object())
        .unwrap_or(ObjectId::NULL);
    let inst = eu.construct_instance(proto);
    {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        let path_id = heap.create_string(&path);
        let mode_id = heap.create_string(&mode);
        let data_id = heap.create_string(&data);
        if let Some(o) = heap.object_mut(inst) {
            o.set_property(names.path, Value::Str(path_id));
            o.set_property(names.mode, Value::Str(mode_id));
            o.set_property(names.data, Value::Str(data_id));
            o.set_property(names.pos, Value::Integer(0));
            o.set_property(names.valid, Value::Bool(valid));
        }
    }
    eu.push(Value::Obj(inst));
    Ok(CallReturn::Count(1))
}

fn fs_remove(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let path = eu.to_string_value(eu.native_arg(nparams, 0));
    let ok = std::fs::remove_file(&path).is_ok();
    eu.push(Value::Bool(ok));
    Ok(CallReturn::Count(1))
}

fn file_prop(eu: &ExecutionUnit, this: Value, name: Atom) -> Value {
    this.as_object()
        .and_then(|id| eu.heap().borrow().object(id).and_then(|o| o.property(name)))
        .unwrap_or(Value::Undefined)
}

fn set_file_prop(eu: &mut ExecutionUnit, this: Value, name: Atom, value: Value) {
    if let Some(id) = this.as_object() {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(id) {
            o.set_property(name, value);
        }
    }
}

/// `file.read(n?)`: next `n` bytes from the cursor, or the remainder.
fn file_read(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    let names = file_atoms(eu);
    let data = eu.to_string_value(file_prop(eu, this, names.data));
    let pos = eu.to_int_value(file_prop(eu, this, names.pos)).unwrap_or(0).max(0) as usize;
    let want = if nparams > 0 {
        eu.to_int_value(eu.native_arg(nparams, 0))?.max(0) as usize
    } else {
        data.len().saturating_sub(pos)
    };
    let end = (pos + want).min(data.len());
    let slice = data.get(pos..end).unwrap_or("").to_string();
    set_file_prop(eu, this, names.pos, Value::Integer(end as i32));
    let id = eu.heap().borrow_mut().create_string(&slice);
    eu.push(Value::Str(id));
    Ok(CallReturn::Count(1))
}

/// `file.write(text)`: appends to the buffered body.
fn file_write(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    let names = file_atoms(eu);
    let mode = eu.to_string_value(file_prop(eu, this, names.mode));
    if mode == "r" {
        return Err(Error::OutOfRange);
    }
    let mut data = eu.to_string_value(file_prop(eu, this, names.data));
    for i in 0..nparams {
        data.push_str(&eu.to_string_value(eu.native_arg(nparams, i)));
    }
    let id = eu.heap().borrow_mut().create_string(&data);
    set_file_prop(eu, this, names.data, Value::Str(id));
    Ok(CallReturn::Count(0))
}

/// `file.close()`: flushes write modes back to the host filesystem.
fn file_close(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let names = file_atoms(eu);
    let mode = eu.to_string_value(file_prop(eu, this, names.mode));
    if mode == "w" || mode == "a" {
        let path = eu.to_string_value(file_prop(eu, this, names.path));
        let data = eu.to_string_value(file_prop(eu, this, names.data));
        if std::fs::write(&path, data).is_err() {
            set_file_prop(eu, this, names.valid, Value::Bool(false));
            return Err(Error::OutOfRange);
        }
    }
    set_file_prop(eu, this, names.valid, Value::Bool(false));
    Ok(CallReturn::Count(0))
}

fn file_valid(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let names = file_atoms(eu);
    let valid = matches!(file_prop(eu, this, names.valid), Value::Bool(true));
    eu.push(Value::Bool(valid));
    Ok(CallReturn::Count(1))
}

// ---- Directory ----

/// `new Directory(path)`: snapshots the entries (sorted by name) into the
/// instance's elements, with sizes alongside.
fn directory_constructor(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    let path = if nparams > 0 {
        eu.to_string_value(eu.native_arg(nparams, 0))
    } else {
        ".".to_string()
    };
    let names = file_atoms(eu);
    let sizes_a = eu.atoms().borrow_mut().intern("%sizes");

    let mut entries: Vec<(String, i32)> = Vec::new();
    if let Ok(dir) = std::fs::read_dir(&path) {
        for entry in dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let size = entry.metadata().map(|m| m.len() as i32).unwrap_or(0);
            entries.push((name, size));
        }
    }
    entries.sort();

    if let Some(id) = this.as_object() {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        let mut sizes = memory_manager::Object::array();
        let mut name_ids = Vec::with_capacity(entries.len());
        for (name, size) in &entries {
            name_ids.push(heap.create_string(name));
            sizes.append_element(Value::Integer(*size));
        }
        let sizes_id = heap.create_object(sizes);
        if let Some(o) = heap.object_mut(id) {
            o.set_array(true);
            for name_id in name_ids {
                o.append_element(Value::Str(name_id));
            }
            o.set_property(sizes_a, Value::Obj(sizes_id));
            o.set_property(names.pos, Value::Integer(0));
        }
    }
    Ok(CallReturn::Count(0))
}

fn directory_cursor(eu: &mut ExecutionUnit, this: Value) -> (i32, i32) {
    let names = file_atoms(eu);
    let idx = eu.to_int_value(file_prop(eu, this, names.pos)).unwrap_or(0);
    let count = this
        .as_object()
        .and_then(|id| eu.heap().borrow().object(id).map(|o| o.element_count() as i32))
        .unwrap_or(0);
    (idx, count)
}

fn directory_name(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let (idx, _) = directory_cursor(eu, this);
    let value = this
        .as_object()
        .and_then(|id| eu.heap().borrow().object(id).and_then(|o| o.element(idx.max(0) as usize)))
        .unwrap_or(Value::Undefined);
    eu.push(value);
    Ok(CallReturn::Count(1))
}

fn directory_size(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let (idx, _) = directory_cursor(eu, this);
    let sizes_a = eu.atoms().borrow_mut().intern("%sizes");
    let value = file_prop(eu, this, sizes_a)
        .as_object()
        .and_then(|id| eu.heap().borrow().object(id).and_then(|o| o.element(idx.max(0) as usize)))
        .unwrap_or(Value::Integer(0));
    eu.push(value);
    Ok(CallReturn::Count(1))
}

fn directory_valid(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let (idx, count) = directory_cursor(eu, this);
    eu.push(Value::Bool(idx < count));
    Ok(CallReturn::Count(1))
}

fn directory_next(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let names = file_atoms(eu);
    let (idx, _) = directory_cursor(eu, this);
    set_file_prop(eu, this, names.pos, Value::Integer(idx + 1));
    Ok(CallReturn::Count(0))
}
