//! Persisted bytecode image.
//!
//! Layout: magic `m8r\0`, version, endian flag, string-literal pool, atom
//! pool, object table (typed Function / MaterObject entries), root
//! function index. All multi-byte fields are little-endian; the endian
//! flag records that for readers on other hosts.
//!
//! The writer walks the object graph reachable from the program's root
//! function and globals. Native objects have no persisted form and refuse
//! to serialize.

use crate::heap::Heap;
use crate::object::{Object, ObjectKind};
use bytecode_system::{Function, Program};
use core_types::{Atom, AtomTable, ObjectId, StringId, Value};
use std::collections::HashMap;
use std::fmt;

const MAGIC: &[u8; 4] = b"m8r\0";
const VERSION: u8 = 1;
const LITTLE_ENDIAN: u8 = 0;

const OBJ_FUNCTION: u8 = 0;
const OBJ_MATER: u8 = 1;

const VAL_UNDEFINED: u8 = 0;
const VAL_NULL: u8 = 1;
const VAL_BOOL: u8 = 2;
const VAL_INTEGER: u8 = 3;
const VAL_FLOAT: u8 = 4;
const VAL_ATOM: u8 = 5;
const VAL_STRING: u8 = 6;
const VAL_OBJECT: u8 = 7;

/// Errors from reading or writing an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Input ended before a complete field.
    Truncated,
    /// The magic bytes are not `m8r\0`.
    BadMagic,
    /// Unknown format version.
    BadVersion(u8),
    /// A construct with no persisted form (native objects, references).
    Unsupported(&'static str),
    /// A cross-reference points outside its table.
    BadReference,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Truncated => write!(f, "truncated image"),
            ImageError::BadMagic => write!(f, "bad image magic"),
            ImageError::BadVersion(v) => write!(f, "unsupported image version {}", v),
            ImageError::Unsupported(what) => write!(f, "cannot serialize {}", what),
            ImageError::BadReference => write!(f, "image cross-reference out of range"),
        }
    }
}

impl std::error::Error for ImageError {}

// ---- writer ----

struct Writer<'h> {
    heap: &'h Heap,
    object_order: Vec<ObjectId>,
    object_index: HashMap<u32, u16>,
    string_order: Vec<StringId>,
    string_index: HashMap<u32, u16>,
}

impl<'h> Writer<'h> {
    fn new(heap: &'h Heap) -> Self {
        Writer {
            heap,
            object_order: Vec::new(),
            object_index: HashMap::new(),
            string_order: Vec::new(),
            string_index: HashMap::new(),
        }
    }

    fn note_string(&mut self, id: StringId) -> u16 {
        if let Some(&i) = self.string_index.get(&id.raw()) {
            return i;
        }
        let i = self.string_order.len() as u16;
        self.string_order.push(id);
        self.string_index.insert(id.raw(), i);
        i
    }

    fn note_object(&mut self, id: ObjectId) -> Result<u16, ImageError> {
        if let Some(&i) = self.object_index.get(&id.raw()) {
            return Ok(i);
        }
        let i = self.object_order.len() as u16;
        self.object_order.push(id);
        self.object_index.insert(id.raw(), i);

        // Walk the object's references so the table is transitively closed.
        let object = self.heap.object(id).ok_or(ImageError::BadReference)?.clone();
        if matches!(object.kind(), ObjectKind::Native(_)) {
            return Err(ImageError::Unsupported("native object"));
        }
        for (_, v) in object.properties() {
            self.note_value(*v)?;
        }
        for v in object.elements() {
            self.note_value(*v)?;
        }
        if let ObjectKind::Function(f) = object.kind() {
            for v in &f.constants {
                self.note_value(*v)?;
            }
        }
        Ok(i)
    }

    fn note_value(&mut self, value: Value) -> Result<(), ImageError> {
        match value {
            Value::Str(id) => {
                self.note_string(id);
            }
            Value::Obj(id) if !id.is_null() => {
                self.note_object(id)?;
            }
            Value::ElemRef(..) => return Err(ImageError::Unsupported("slot reference")),
            _ => {}
        }
        Ok(())
    }

    fn encode_value(&self, out: &mut Vec<u8>, value: Value) -> Result<(), ImageError> {
        match value {
            Value::Undefined => out.push(VAL_UNDEFINED),
            Value::Null => out.push(VAL_NULL),
            Value::Bool(b) => {
                out.push(VAL_BOOL);
                out.push(b as u8);
            }
            Value::Integer(n) => {
                out.push(VAL_INTEGER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Value::Float(n) => {
                out.push(VAL_FLOAT);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Value::Id(a) => {
                out.push(VAL_ATOM);
                out.extend_from_slice(&a.raw().to_le_bytes());
            }
            Value::Str(id) => {
                out.push(VAL_STRING);
                let i = self.string_index.get(&id.raw()).ok_or(ImageError::BadReference)?;
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Obj(id) => {
                out.push(VAL_OBJECT);
                let i = if id.is_null() {
                    u16::MAX
                } else {
                    *self.object_index.get(&id.raw()).ok_or(ImageError::BadReference)?
                };
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::ElemRef(..) => return Err(ImageError::Unsupported("slot reference")),
        }
        Ok(())
    }

    fn encode_function(&self, out: &mut Vec<u8>, f: &Function) -> Result<(), ImageError> {
        out.extend_from_slice(&f.name.raw().to_le_bytes());
        out.extend_from_slice(&(f.param_end as u16).to_le_bytes());
        out.extend_from_slice(&(f.locals.len() as u16).to_le_bytes());
        for a in &f.locals {
            out.extend_from_slice(&a.raw().to_le_bytes());
        }
        out.push(f.is_ctor as u8);
        out.extend_from_slice(&(f.constants.len() as u16).to_le_bytes());
        for v in &f.constants {
            self.encode_value(out, *v)?;
        }
        out.extend_from_slice(&(f.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&f.code);
        out.extend_from_slice(&(f.lines.len() as u16).to_le_bytes());
        for &(off, line) in &f.lines {
            out.extend_from_slice(&off.to_le_bytes());
            out.extend_from_slice(&line.to_le_bytes());
        }
        Ok(())
    }

    fn encode_object(&self, out: &mut Vec<u8>, object: &Object) -> Result<(), ImageError> {
        match object.kind() {
            ObjectKind::Function(f) => {
                out.push(OBJ_FUNCTION);
                self.encode_function(out, f.as_ref())?;
            }
            ObjectKind::Mater => {
                out.push(OBJ_MATER);
                out.push(object.is_array() as u8);
                out.extend_from_slice(&(object.properties().len() as u16).to_le_bytes());
                for (a, v) in object.properties() {
                    out.extend_from_slice(&a.raw().to_le_bytes());
                    self.encode_value(out, *v)?;
                }
                out.extend_from_slice(&(object.element_count() as u16).to_le_bytes());
                for v in object.elements() {
                    self.encode_value(out, *v)?;
                }
            }
            ObjectKind::Native(_) => return Err(ImageError::Unsupported("native object")),
        }
        Ok(())
    }
}

/// Serializes a program and its reachable object graph.
pub fn write_image(
    program: &Program,
    heap: &Heap,
    atoms: &AtomTable,
) -> Result<Vec<u8>, ImageError> {
    let mut w = Writer::new(heap);

    for id in program.string_literals() {
        w.note_string(*id);
    }
    let root_index = w.note_object(program.main)?;
    for (_, v) in program.globals() {
        w.note_value(*v)?;
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(LITTLE_ENDIAN);

    out.extend_from_slice(&(w.string_order.len() as u16).to_le_bytes());
    for id in &w.string_order {
        let s = heap.string(*id);
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    out.extend_from_slice(&(atoms.len() as u16).to_le_bytes());
    for raw in 0..atoms.len() as u16 {
        let name = atoms.resolve(Atom(raw));
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
    }

    out.extend_from_slice(&(w.object_order.len() as u16).to_le_bytes());
    let mut body = Vec::new();
    for id in &w.object_order {
        let object = heap.object(*id).ok_or(ImageError::BadReference)?;
        w.encode_object(&mut body, object)?;
    }
    out.extend_from_slice(&body);

    out.extend_from_slice(&root_index.to_le_bytes());
    Ok(out)
}

// ---- reader ----

struct Reader<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, n: usize) -> Result<&'b [u8], ImageError> {
        if self.pos + n > self.bytes.len() {
            return Err(ImageError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ImageError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ImageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, ImageError> {
        Ok(self.u32()? as i32)
    }

    fn f64(&mut self) -> Result<f64, ImageError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    fn str(&mut self, len: usize) -> Result<String, ImageError> {
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| ImageError::Unsupported("non-utf8 text"))
    }
}

struct LoadContext {
    atom_map: Vec<Atom>,
    strings: Vec<StringId>,
    objects: Vec<ObjectId>,
}

impl LoadContext {
    fn atom(&self, raw: u16) -> Result<Atom, ImageError> {
        self.atom_map.get(raw as usize).copied().ok_or(ImageError::BadReference)
    }

    fn decode_value(&self, r: &mut Reader<'_>) -> Result<Value, ImageError> {
        Ok(match r.u8()? {
            VAL_UNDEFINED => Value::Undefined,
            VAL_NULL => Value::Null,
            VAL_BOOL => Value::Bool(r.u8()? != 0),
            VAL_INTEGER => Value::Integer(r.i32()?),
            VAL_FLOAT => Value::Float(r.f64()?),
            VAL_ATOM => Value::Id(self.atom(r.u16()?)?),
            VAL_STRING => {
                let i = r.u16()? as usize;
                Value::Str(*self.strings.get(i).ok_or(ImageError::BadReference)?)
            }
            VAL_OBJECT => {
                let i = r.u16()?;
                if i == u16::MAX {
                    Value::Obj(ObjectId::NULL)
                } else {
                    Value::Obj(
                        *self.objects.get(i as usize).ok_or(ImageError::BadReference)?,
                    )
                }
            }
            _ => return Err(ImageError::Unsupported("value tag")),
        })
    }
}

/// Loads an image into the heap and atom table, returning the program.
pub fn read_image(
    bytes: &[u8],
    heap: &mut Heap,
    atoms: &mut AtomTable,
) -> Result<Program, ImageError> {
    let mut r = Reader { bytes, pos: 0 };

    if r.take(4)? != MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(ImageError::BadVersion(version));
    }
    let _endian = r.u8()?;

    let string_count = r.u16()? as usize;
    let mut ctx = LoadContext {
        atom_map: Vec::new(),
        strings: Vec::with_capacity(string_count),
        objects: Vec::new(),
    };
    for _ in 0..string_count {
        let len = r.u32()? as usize;
        let s = r.str(len)?;
        ctx.strings.push(heap.create_string(&s));
    }

    let atom_count = r.u16()? as usize;
    for _ in 0..atom_count {
        let len = r.u16()? as usize;
        let name = r.str(len)?;
        ctx.atom_map.push(atoms.intern(&name));
    }

    // Two passes: allocate handles first so entries can cross-reference,
    // then fill the bodies in.
    let object_count = r.u16()? as usize;
    for _ in 0..object_count {
        ctx.objects.push(heap.create_object(Object::mater()));
    }
    for i in 0..object_count {
        let object = decode_object(&mut r, &ctx)?;
        if let Some(slot) = heap.object_mut(ctx.objects[i]) {
            *slot = object;
        }
    }

    let root_index = r.u16()? as usize;
    let root = *ctx.objects.get(root_index).ok_or(ImageError::BadReference)?;
    if let Some(o) = heap.object_mut(root) {
        o.set_collectable(false);
    }

    let mut program = Program::new(root);
    for id in &ctx.strings {
        program.add_string_literal(*id);
    }
    Ok(program)
}

fn decode_object(r: &mut Reader<'_>, ctx: &LoadContext) -> Result<Object, ImageError> {
    match r.u8()? {
        OBJ_FUNCTION => {
            let name = ctx.atom(r.u16()?)?;
            let mut f = Function::new(name);
            let param_end = r.u16()? as usize;
            let local_count = r.u16()? as usize;
            for _ in 0..local_count {
                let a = ctx.atom(r.u16()?)?;
                f.add_local(a);
            }
            f.param_end = param_end;
            f.is_ctor = r.u8()? != 0;
            let const_count = r.u16()? as usize;
            for _ in 0..const_count {
                let v = ctx.decode_value(r)?;
                f.constants.push(v);
            }
            let code_len = r.u32()? as usize;
            f.code = r.take(code_len)?.to_vec();
            let line_count = r.u16()? as usize;
            for _ in 0..line_count {
                let off = r.u32()?;
                let line = r.u32()?;
                f.lines.push((off, line));
            }
            Ok(Object::function(f))
        }
        OBJ_MATER => {
            let array = r.u8()? != 0;
            let mut o = if array { Object::array() } else { Object::mater() };
            let prop_count = r.u16()? as usize;
            for _ in 0..prop_count {
                let a = ctx.atom(r.u16()?)?;
                let v = ctx.decode_value(r)?;
                o.set_property(a, v);
            }
            let elt_count = r.u16()? as usize;
            for _ in 0..elt_count {
                let v = ctx.decode_value(r)?;
                o.append_element(v);
            }
            Ok(o)
        }
        _ => Err(ImageError::Unsupported("object tag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::Op;

    fn sample_program(heap: &mut Heap, atoms: &mut AtomTable) -> Program {
        let hello = heap.create_string("hello");
        let mut nested = Function::new(atoms.intern("helper"));
        nested.add_local(atoms.intern("x"));
        nested.mark_param_end();
        nested.emit_op(Op::Ret);
        nested.emit_u8(0);
        let nested_id = heap.create_object(Object::function(nested));

        let mut main = Function::new(atoms.intern("main"));
        let k0 = main.add_constant(Value::Str(hello));
        let k1 = main.add_constant(Value::Obj(nested_id));
        main.emit_op(Op::PushK);
        main.emit_u8(k0 as u8);
        main.emit_op(Op::PushK);
        main.emit_u8(k1 as u8);
        main.emit_op(Op::Ret);
        main.emit_u8(0);
        main.note_line(1);
        let mut main_obj = Object::function(main);
        main_obj.set_collectable(false);
        let main_id = heap.create_object(main_obj);

        let mut program = Program::new(main_id);
        program.add_string_literal(hello);
        program
    }

    #[test]
    fn test_image_round_trip() {
        let mut heap = Heap::new();
        let mut atoms = AtomTable::new();
        let program = sample_program(&mut heap, &mut atoms);

        let bytes = write_image(&program, &heap, &atoms).unwrap();
        assert_eq!(&bytes[0..4], b"m8r\0");

        let mut heap2 = Heap::new();
        let mut atoms2 = AtomTable::new();
        let loaded = read_image(&bytes, &mut heap2, &mut atoms2).unwrap();

        let main = heap2.object(loaded.main).unwrap();
        let f = main.as_function().unwrap();
        assert_eq!(atoms2.resolve(f.name), "main");
        assert_eq!(f.constants.len(), 2);
        match f.constants[0] {
            Value::Str(id) => assert_eq!(heap2.string(id), "hello"),
            ref other => panic!("expected string constant, got {:?}", other),
        }
        match f.constants[1] {
            Value::Obj(id) => {
                let nested = heap2.object(id).unwrap();
                let nf = nested.as_function().unwrap();
                assert_eq!(atoms2.resolve(nf.name), "helper");
                assert_eq!(nf.param_count(), 1);
            }
            ref other => panic!("expected function constant, got {:?}", other),
        }
        assert!(!main.collectable());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut heap = Heap::new();
        let mut atoms = AtomTable::new();
        let err = read_image(b"nope....", &mut heap, &mut atoms).unwrap_err();
        assert_eq!(err, ImageError::BadMagic);
    }

    #[test]
    fn test_truncated_rejected() {
        let mut heap = Heap::new();
        let mut atoms = AtomTable::new();
        let program = sample_program(&mut heap, &mut atoms);
        let bytes = write_image(&program, &heap, &atoms).unwrap();

        let mut heap2 = Heap::new();
        let mut atoms2 = AtomTable::new();
        let err = read_image(&bytes[..bytes.len() - 3], &mut heap2, &mut atoms2).unwrap_err();
        assert_eq!(err, ImageError::Truncated);
    }

    #[test]
    fn test_native_objects_refuse_to_serialize() {
        let mut heap = Heap::new();
        let atoms = AtomTable::new();
        let native = heap.create_object(Object::native(0));
        let mut main = Function::new(Atom::EMPTY);
        let _ = main.add_constant(Value::Obj(native));
        let main_id = heap.create_object(Object::function(main));
        let program = Program::new(main_id);

        let err = write_image(&program, &heap, &atoms).unwrap_err();
        assert_eq!(err, ImageError::Unsupported("native object"));
    }
}
