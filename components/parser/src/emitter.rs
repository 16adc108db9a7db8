//! Bytecode emission services for the grammar.
//!
//! The emitter owns a stack of functions under construction (for nested
//! function expressions) and a stack of classes under construction. Each
//! function carries a stack of deferred code regions: bytecode collected
//! off to one side and spliced into the main stream later, with label
//! fix-ups translated by the splice offset. Jumps are relative, so code
//! inside a region survives relocation untouched; only cross-region
//! matches need the translation.

use bytecode_system::{Function, Op};
use core_types::{Atom, ObjectId, Value};
use memory_manager::{Heap, Object};

/// How an identifier may resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    /// The grammar just declared it; it must be a local slot.
    MustBeLocal,
    /// A local if declared, otherwise a global name reference.
    MightBeLocal,
    /// Always a bare name (property names, globals).
    NotLocal,
}

/// Which dereference to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefType {
    /// `obj.name`
    Prop,
    /// `obj[index]`
    Elt,
}

/// A jump label: a recorded target address and/or one matched jump site.
///
/// Addresses are positions in the emission buffer that was active when
/// they were recorded; splicing a deferred region translates them by the
/// splice offset (the grammar does this arithmetic where it applies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    /// Recorded target position.
    pub addr: i32,
    /// Position of the jump's 16-bit operand, or -1 when unmatched.
    pub matched_addr: i32,
}

struct DeferredBlock {
    buf: Vec<u8>,
    active: bool,
}

struct FunctionCtx {
    func: Function,
    deferred: Vec<DeferredBlock>,
}

/// The emitter.
pub struct Emitter {
    functions: Vec<FunctionCtx>,
    classes: Vec<ObjectId>,
}

impl Emitter {
    /// Creates an emitter with no function under construction.
    pub fn new() -> Self {
        Emitter { functions: Vec::new(), classes: Vec::new() }
    }

    // ---- function stack ----

    /// Begins a nested function.
    pub fn function_start(&mut self, name: Atom, is_ctor: bool) {
        let mut func = Function::new(name);
        func.is_ctor = is_ctor;
        self.functions.push(FunctionCtx { func, deferred: Vec::new() });
    }

    /// Declares the next parameter.
    pub fn function_add_param(&mut self, name: Atom) {
        let f = self.func_mut();
        assert!(f.locals.len() < 255, "too many locals");
        f.add_local(name);
    }

    /// Marks the end of the parameter list.
    pub fn function_params_end(&mut self) {
        self.func_mut().mark_param_end();
    }

    /// Finishes the current function: emits the implicit return and moves
    /// the function into the object store.
    pub fn function_end(&mut self, heap: &mut Heap) -> ObjectId {
        self.emit_op(Op::Ret);
        self.emit_u8(0);
        let ctx = self.functions.pop().unwrap_or_else(|| FunctionCtx {
            func: Function::default(),
            deferred: Vec::new(),
        });
        debug_assert!(ctx.deferred.is_empty(), "unflushed deferred region");
        heap.create_object(Object::function(ctx.func))
    }

    /// True while a ctor is the innermost function.
    pub fn function_is_ctor(&self) -> bool {
        self.functions.last().map(|c| c.func.is_ctor).unwrap_or(false)
    }

    /// Declares a body local (or reuses the existing slot) and returns it.
    pub fn add_var(&mut self, name: Atom) -> usize {
        let f = self.func_mut();
        if let Some(slot) = f.local_index(name) {
            return slot;
        }
        assert!(f.locals.len() < 255, "too many locals");
        f.add_local(name)
    }

    /// The function currently being emitted into.
    pub fn func(&self) -> &Function {
        &self.functions.last().expect("no function under construction").func
    }

    fn func_mut(&mut self) -> &mut Function {
        &mut self.functions.last_mut().expect("no function under construction").func
    }

    fn ctx_mut(&mut self) -> &mut FunctionCtx {
        self.functions.last_mut().expect("no function under construction")
    }

    // ---- class stack ----

    /// Begins a class body, allocating its backing object.
    pub fn class_start(&mut self, heap: &mut Heap) -> ObjectId {
        let id = heap.create_object(Object::mater());
        self.classes.push(id);
        id
    }

    /// The innermost class under construction.
    pub fn current_class(&self) -> Option<ObjectId> {
        self.classes.last().copied()
    }

    /// Ends the class body and returns its object.
    pub fn class_end(&mut self) -> Option<ObjectId> {
        self.classes.pop()
    }

    // ---- emission target ----

    fn buf_mut(&mut self) -> &mut Vec<u8> {
        let ctx = self.functions.last_mut().expect("no function under construction");
        match ctx.deferred.iter_mut().rev().find(|d| d.active) {
            Some(block) => &mut block.buf,
            None => &mut ctx.func.code,
        }
    }

    fn buf_is_deferred(&self) -> bool {
        self.functions
            .last()
            .map(|c| c.deferred.iter().any(|d| d.active))
            .unwrap_or(false)
    }

    /// Current position in the active emission buffer.
    pub fn pos(&self) -> i32 {
        let ctx = self.functions.last().expect("no function under construction");
        match ctx.deferred.iter().rev().find(|d| d.active) {
            Some(block) => block.buf.len() as i32,
            None => ctx.func.code.len() as i32,
        }
    }

    /// Appends an opcode.
    pub fn emit_op(&mut self, op: Op) {
        self.buf_mut().push(op as u8);
    }

    /// Appends a one-byte operand.
    pub fn emit_u8(&mut self, v: u8) {
        self.buf_mut().push(v);
    }

    /// Appends a two-byte operand.
    pub fn emit_u16(&mut self, v: u16) {
        self.buf_mut().extend_from_slice(&v.to_le_bytes());
    }

    /// Records the source line for code emitted from here, when emitting
    /// into the main stream.
    pub fn note_line(&mut self, line: u32) {
        if !self.buf_is_deferred() {
            self.func_mut().note_line(line);
        }
    }

    // ---- operand emission ----

    /// Pushes a constant.
    pub fn push_k(&mut self, value: Value) {
        let idx = self.func_mut().add_constant(value);
        assert!(idx < 256, "constant pool overflow");
        self.emit_op(Op::PushK);
        self.emit_u8(idx as u8);
    }

    /// Pushes `this`.
    pub fn push_this(&mut self) {
        self.emit_op(Op::PushThis);
    }

    /// Emits the load for an identifier under the given resolution hint.
    pub fn emit_id(&mut self, name: Atom, hint: IdType) {
        let slot = match hint {
            IdType::NotLocal => None,
            IdType::MustBeLocal | IdType::MightBeLocal => self.func().local_index(name),
        };
        match slot {
            Some(slot) => {
                self.emit_op(Op::PushLocalRef);
                self.emit_u8(slot as u8);
            }
            None => {
                debug_assert!(hint != IdType::MustBeLocal, "local was not declared");
                self.emit_op(Op::PushId);
                self.emit_u16(name.raw());
            }
        }
    }

    /// Duplicates the top of the stack.
    pub fn emit_dup(&mut self) {
        self.emit_op(Op::Dup);
    }

    /// Resolves the reference on top of the stack to its value.
    pub fn emit_push(&mut self) {
        self.emit_op(Op::Push);
    }

    /// Writes the value on top through the reference beneath it.
    pub fn emit_move(&mut self) {
        self.emit_op(Op::Move);
    }

    /// Discards a statement's result.
    pub fn discard_result(&mut self) {
        self.emit_op(Op::Pop);
    }

    /// Binary operator.
    pub fn emit_bin_op(&mut self, op: Op) {
        self.emit_op(op);
    }

    /// Unary operator.
    pub fn emit_un_op(&mut self, op: Op) {
        self.emit_op(op);
    }

    /// Property or element dereference.
    pub fn emit_deref(&mut self, kind: DerefType) {
        self.emit_op(match kind {
            DerefType::Prop => Op::DerefProp,
            DerefType::Elt => Op::DerefElt,
        });
    }

    /// Call, construction or return with its count operand.
    pub fn emit_call_ret(&mut self, op: Op, count: u32) {
        debug_assert!(matches!(op, Op::Call | Op::New | Op::Ret));
        self.emit_op(op);
        self.emit_u8(count as u8);
    }

    /// Pushes a fresh literal object.
    pub fn emit_load_lit(&mut self, array: bool) {
        self.emit_op(Op::LoadLit);
        self.emit_u8(array as u8);
    }

    /// Appends the value on top as the next element of the literal below.
    pub fn emit_append_elt(&mut self) {
        self.emit_op(Op::Push);
        self.emit_op(Op::AppendElt);
    }

    /// Appends the name/value pair on top to the literal below.
    pub fn emit_append_prop(&mut self) {
        self.emit_op(Op::Push);
        self.emit_op(Op::AppendProp);
    }

    /// Compares the value on top against the retained discriminant.
    pub fn emit_case_test(&mut self) {
        self.emit_op(Op::CaseTest);
    }

    // ---- labels & jumps ----

    /// Records the current position as a jump target.
    pub fn label(&mut self) -> Label {
        Label { addr: self.pos(), matched_addr: -1 }
    }

    /// Emits a forward jump whose target is patched later.
    pub fn add_matched_jump(&mut self, op: Op, label: &mut Label) {
        debug_assert!(op.is_jump());
        self.emit_op(op);
        label.matched_addr = self.pos();
        self.emit_u16(0);
    }

    /// Patches a matched jump to land at the current position.
    pub fn match_jump(&mut self, label: &Label) {
        let target = self.pos();
        self.match_jump_to(label, target);
    }

    /// Patches a matched jump to land at an explicit position in the
    /// active buffer's coordinates.
    pub fn match_jump_to(&mut self, label: &Label, target: i32) {
        if label.matched_addr < 0 {
            return;
        }
        let offset = target - (label.matched_addr + 2);
        let operand = (offset as i16).to_le_bytes();
        let at = label.matched_addr as usize;
        let buf = self.buf_mut();
        buf[at] = operand[0];
        buf[at + 1] = operand[1];
    }

    /// Emits a backward jump to a recorded label.
    pub fn jump_to_label(&mut self, op: Op, label: &Label) {
        debug_assert!(op.is_jump());
        self.emit_op(op);
        let offset = label.addr - (self.pos() + 2);
        self.emit_u16((offset as i16) as u16);
    }

    // ---- deferred regions ----

    /// Pushes a new deferral block and starts collecting into it.
    /// Returns the block-relative start offset (always 0).
    pub fn start_deferred(&mut self) -> i32 {
        self.ctx_mut().deferred.push(DeferredBlock { buf: Vec::new(), active: true });
        0
    }

    /// Stops collecting into the top deferral block.
    pub fn end_deferred(&mut self) {
        if let Some(block) = self.ctx_mut().deferred.last_mut() {
            block.active = false;
        }
    }

    /// Resumes collecting into the top deferral block; returns the
    /// block-relative position where emission continues.
    pub fn resume_deferred(&mut self) -> i32 {
        let ctx = self.ctx_mut();
        match ctx.deferred.last_mut() {
            Some(block) => {
                block.active = true;
                block.buf.len() as i32
            }
            None => 0,
        }
    }

    /// Pops the top deferral block and splices it into the enclosing
    /// emission target, returning the splice position there.
    pub fn emit_deferred(&mut self) -> i32 {
        let block = match self.ctx_mut().deferred.pop() {
            Some(b) => b,
            None => return self.pos(),
        };
        debug_assert!(!block.active, "flushing an active deferred region");
        let at = self.pos();
        self.buf_mut().extend_from_slice(&block.buf);
        at
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter_with_function() -> Emitter {
        let mut e = Emitter::new();
        e.function_start(Atom::EMPTY, false);
        e
    }

    #[test]
    fn test_forward_jump_patching() {
        let mut e = emitter_with_function();
        let mut label = e.label();
        e.add_matched_jump(Op::Jmp, &mut label);
        e.emit_op(Op::PushThis);
        e.emit_op(Op::Pop);
        e.match_jump(&label);

        // Jmp operand at offset 1 must skip the two one-byte ops.
        let code = &e.func().code;
        let off = i16::from_le_bytes([code[1], code[2]]);
        assert_eq!(off, 2);
    }

    #[test]
    fn test_backward_jump() {
        let mut e = emitter_with_function();
        let top = e.label();
        e.emit_op(Op::PushThis);
        e.emit_op(Op::Pop);
        e.jump_to_label(Op::Jmp, &top);

        let code = &e.func().code;
        // Operand position 3..5, next pc 5, target 0 => offset -5.
        let off = i16::from_le_bytes([code[3], code[4]]);
        assert_eq!(off, -5);
    }

    #[test]
    fn test_deferred_region_splices_at_flush_point() {
        let mut e = emitter_with_function();
        e.emit_op(Op::PushThis); // main: [PushThis]
        let start = e.start_deferred();
        assert_eq!(start, 0);
        e.emit_op(Op::Dup); // deferred block
        e.end_deferred();
        e.emit_op(Op::Pop); // main: [PushThis, Pop]
        let spliced_at = e.emit_deferred();
        assert_eq!(spliced_at, 2);
        assert_eq!(
            e.func().code,
            vec![Op::PushThis as u8, Op::Pop as u8, Op::Dup as u8]
        );
    }

    #[test]
    fn test_resume_deferred_appends() {
        let mut e = emitter_with_function();
        let _ = e.start_deferred();
        e.emit_op(Op::Dup);
        e.end_deferred();
        let at = e.resume_deferred();
        assert_eq!(at, 1);
        e.emit_op(Op::Pop);
        e.end_deferred();
        let _ = e.emit_deferred();
        assert_eq!(e.func().code, vec![Op::Dup as u8, Op::Pop as u8]);
    }

    #[test]
    fn test_nested_deferred_blocks() {
        let mut e = emitter_with_function();
        let _ = e.start_deferred(); // A
        e.emit_op(Op::Dup); // into A
        let _ = e.start_deferred(); // B
        e.emit_op(Op::Pop); // into B
        e.end_deferred(); // B inactive; target back to A
        e.emit_op(Op::PushThis); // into A
        let b_at = e.emit_deferred(); // B splices into A
        assert_eq!(b_at, 2); // after Dup, PushThis
        e.end_deferred();
        let _ = e.emit_deferred(); // A splices into main
        assert_eq!(
            e.func().code,
            vec![Op::Dup as u8, Op::PushThis as u8, Op::Pop as u8]
        );
    }

    #[test]
    fn test_emit_id_local_vs_global() {
        let mut e = emitter_with_function();
        let name = Atom(200);
        e.emit_id(name, IdType::MightBeLocal);
        let slot = e.add_var(name);
        e.emit_id(name, IdType::MustBeLocal);

        let code = &e.func().code;
        assert_eq!(code[0], Op::PushId as u8);
        assert_eq!(u16::from_le_bytes([code[1], code[2]]), 200);
        assert_eq!(code[3], Op::PushLocalRef as u8);
        assert_eq!(code[4], slot as u8);
    }

    #[test]
    fn test_function_end_creates_object() {
        let mut heap = Heap::new();
        let mut e = Emitter::new();
        e.function_start(Atom(5), true);
        let id = e.function_end(&mut heap);
        let f = heap.object(id).unwrap().as_function().unwrap().clone();
        assert!(f.is_ctor);
        assert_eq!(f.code, vec![Op::Ret as u8, 0]);
    }
}
