//! Recursive-descent grammar with inline emission.
//!
//! Statement and expression methods mirror the shape of the language:
//! `statement` dispatches on the current token, loops keep per-loop stacks
//! of unresolved `break`/`continue` labels, `switch` collects its case
//! bodies in a deferred region so all case tests precede them, and
//! expressions use precedence climbing over an explicit operator table.
//!
//! The first error aborts the parse; no partial program escapes.

use crate::emitter::{DerefType, Emitter, IdType, Label};
use crate::scanner::{Scanner, Token};
use bytecode_system::{Op, Program};
use core_types::{Atom, AtomTable, Error, ObjectId, StringId, Value, WellKnown};
use memory_manager::Heap;
use std::collections::HashMap;
use std::fmt;

/// A parse failure with its diagnostic context.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    /// What went wrong.
    pub kind: Error,
    /// Line of the offending token.
    pub line: u32,
    /// Rendering of the offending token.
    pub near: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on line {}, near '{}'", self.kind, self.line, self.near)
    }
}

impl std::error::Error for ParseError {}

type Parse<T> = Result<T, ParseError>;

/// Parses a complete source text into a program.
///
/// String literals and function objects are allocated in `heap`;
/// identifiers are interned into `atoms`. On success the program's root
/// function is pinned against collection.
pub fn parse_program(
    source: &str,
    heap: &mut Heap,
    atoms: &mut AtomTable,
) -> Result<Program, ParseError> {
    let mut scanner = Scanner::new(source);
    let token = scanner.next_token();
    let mut grammar = Grammar {
        scanner,
        token,
        pushed: None,
        heap,
        atoms,
        emitter: Emitter::new(),
        program: Program::default(),
        literals: HashMap::new(),
        break_stack: Vec::new(),
        continue_stack: Vec::new(),
        hidden_counter: 0,
    };
    grammar.emitter.function_start(WellKnown::Main.into(), false);
    while grammar.statement()? {}
    if grammar.token != Token::Eof {
        return Err(grammar.error(Error::SyntaxError("unexpected token".to_string())));
    }
    let main = grammar.emitter.function_end(grammar.heap);
    if let Some(o) = grammar.heap.object_mut(main) {
        o.set_collectable(false);
    }
    grammar.program.main = main;
    Ok(grammar.program)
}

struct Grammar<'a> {
    scanner: Scanner<'a>,
    token: Token,
    pushed: Option<Token>,
    heap: &'a mut Heap,
    atoms: &'a mut AtomTable,
    emitter: Emitter,
    program: Program,
    literals: HashMap<String, StringId>,
    break_stack: Vec<Vec<Label>>,
    continue_stack: Vec<Vec<Label>>,
    hidden_counter: u32,
}

/// Binary operator table: precedence, right-associativity, dup-the-target
/// (compound assignment) and the opcode.
fn op_info(token: &Token) -> Option<(u8, bool, bool, Op)> {
    Some(match token {
        Token::Sto => (1, true, false, Op::Move),
        Token::AddSto => (2, true, true, Op::Add),
        Token::SubSto => (2, true, true, Op::Sub),
        Token::MulSto => (3, true, true, Op::Mul),
        Token::DivSto => (3, true, true, Op::Div),
        Token::ModSto => (3, true, true, Op::Mod),
        Token::ShlSto => (4, true, true, Op::Shl),
        Token::SarSto => (4, true, true, Op::Sar),
        Token::ShrSto => (4, true, true, Op::Shr),
        Token::AndSto => (5, true, true, Op::And),
        Token::OrSto => (5, true, true, Op::Or),
        Token::XorSto => (5, true, true, Op::Xor),
        Token::LOr => (6, false, false, Op::LOr),
        Token::LAnd => (7, false, false, Op::LAnd),
        Token::Pipe => (8, false, false, Op::Or),
        Token::Caret => (9, false, false, Op::Xor),
        Token::Amp => (10, false, false, Op::And),
        Token::Eq => (11, false, false, Op::Eq),
        Token::Ne => (11, false, false, Op::Ne),
        Token::Lt => (12, false, false, Op::Lt),
        Token::Gt => (12, false, false, Op::Gt),
        Token::Ge => (12, false, false, Op::Ge),
        Token::Le => (12, false, false, Op::Le),
        Token::Shl => (13, false, false, Op::Shl),
        Token::Sar => (13, false, false, Op::Sar),
        Token::Shr => (13, false, false, Op::Shr),
        Token::Plus => (14, false, false, Op::Add),
        Token::Minus => (14, false, false, Op::Sub),
        Token::Star => (15, false, false, Op::Mul),
        Token::Slash => (15, false, false, Op::Div),
        Token::Percent => (15, false, false, Op::Mod),
        _ => return None,
    })
}

impl<'a> Grammar<'a> {
    // ---- token plumbing ----

    fn advance(&mut self) {
        self.token = match self.pushed.take() {
            Some(t) => t,
            None => self.scanner.next_token(),
        };
    }

    /// Puts the current token back and makes `prev` current again; used
    /// for the two-token decision in `for (name : expr)`.
    fn unread(&mut self, prev: Token) {
        debug_assert!(self.pushed.is_none());
        self.pushed = Some(std::mem::replace(&mut self.token, prev));
    }

    fn error(&self, kind: Error) -> ParseError {
        ParseError {
            kind,
            line: self.scanner.token_line(),
            near: self.token.describe(),
        }
    }

    fn expect(&mut self, token: Token, name: &'static str) -> Parse<()> {
        if self.token == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(Error::Expected(name)))
        }
    }

    fn expect_identifier(&mut self) -> Parse<Atom> {
        match &self.token {
            Token::Identifier(s) => {
                let atom = self.atoms.intern(s);
                self.advance();
                Ok(atom)
            }
            _ => Err(self.error(Error::Expected("identifier"))),
        }
    }

    fn string_literal(&mut self, text: &str) -> Value {
        if let Some(&id) = self.literals.get(text) {
            return Value::Str(id);
        }
        let id = self.heap.create_string(text);
        self.literals.insert(text.to_string(), id);
        self.program.add_string_literal(id);
        Value::Str(id)
    }

    // ---- statements ----

    fn statement(&mut self) -> Parse<bool> {
        self.emitter.note_line(self.scanner.token_line());
        match self.token {
            Token::Eof => Ok(false),
            Token::Semicolon => {
                self.advance();
                Ok(true)
            }
            Token::Function => self.function_statement().map(|_| true),
            Token::Class => self.class_statement().map(|_| true),
            Token::LBrace => self.compound_statement().map(|_| true),
            Token::If => self.selection_statement().map(|_| true),
            Token::Switch => self.switch_statement().map(|_| true),
            Token::While | Token::Do | Token::For => self.iteration_statement().map(|_| true),
            Token::Break | Token::Continue | Token::Return => {
                self.jump_statement().map(|_| true)
            }
            Token::Var => {
                self.advance();
                if self.variable_declaration_list()? == 0 {
                    return Err(self.error(Error::MissingVarDecl));
                }
                self.expect(Token::Semicolon, ";")?;
                Ok(true)
            }
            Token::Delete => {
                self.advance();
                if !self.left_hand_side_expression()? {
                    return Err(self.error(Error::Expected("expression")));
                }
                self.emitter.discard_result();
                self.expect(Token::Semicolon, ";")?;
                Ok(true)
            }
            _ => {
                if self.expression(1)? {
                    self.emitter.discard_result();
                    self.expect(Token::Semicolon, ";")?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn statement_required(&mut self) -> Parse<()> {
        if self.statement()? {
            Ok(())
        } else {
            Err(self.error(Error::Expected("statement")))
        }
    }

    fn function_statement(&mut self) -> Parse<()> {
        self.advance();
        let name = self.expect_identifier()?;
        let func = self.function_expression(false, name)?;
        // Bind under the name in the global table when this runs, so a
        // recursive body can see itself.
        self.emitter.emit_id(name, IdType::NotLocal);
        self.emitter.push_k(Value::Obj(func));
        self.emitter.emit_move();
        self.emitter.discard_result();
        Ok(())
    }

    fn class_statement(&mut self) -> Parse<()> {
        self.advance();
        let name = self.expect_identifier()?;
        self.emitter.add_var(name);
        self.emitter.emit_id(name, IdType::MustBeLocal);
        self.class_expression()?;
        self.emitter.emit_move();
        self.emitter.discard_result();
        Ok(())
    }

    fn compound_statement(&mut self) -> Parse<()> {
        self.advance();
        while self.statement()? {}
        self.expect(Token::RBrace, "}")
    }

    fn selection_statement(&mut self) -> Parse<()> {
        self.advance();
        self.expect(Token::LParen, "(")?;
        self.expression_required(1)?;

        let mut if_label = self.emitter.label();
        let mut else_label = self.emitter.label();
        self.emitter.add_matched_jump(Op::Jf, &mut else_label);

        self.expect(Token::RParen, ")")?;
        self.statement_required()?;

        if self.token == Token::Else {
            self.advance();
            self.emitter.add_matched_jump(Op::Jmp, &mut if_label);
            self.emitter.match_jump(&else_label);
            self.statement_required()?;
            self.emitter.match_jump(&if_label);
        } else {
            self.emitter.match_jump(&else_label);
        }
        Ok(())
    }

    /// `switch`: the discriminant stays on the stack while every case
    /// test runs; case bodies collect in a deferred region so they can
    /// fall into one another, and only `break` (or the end of the region)
    /// leaves. `default` runs when no test matched, wherever it appears.
    fn switch_statement(&mut self) -> Parse<()> {
        self.advance();
        self.expect(Token::LParen, "(")?;
        self.expression_required(1)?;
        self.expect(Token::RParen, ")")?;
        self.expect(Token::LBrace, "{")?;

        let _deferred_start = self.emitter.start_deferred();
        self.emitter.end_deferred();

        self.break_stack.push(Vec::new());
        let continue_marks: Vec<usize> = self.continue_stack.iter().map(Vec::len).collect();

        let mut cases: Vec<(Label, i32)> = Vec::new();
        let mut default_addr: Option<i32> = None;

        while matches!(self.token, Token::Case | Token::Default) {
            let is_default = self.token == Token::Default;
            self.advance();

            let mut to_statement = None;
            if is_default {
                if default_addr.is_some() {
                    self.break_stack.pop();
                    return Err(self.error(Error::DuplicateDefault));
                }
            } else {
                self.expression_required(1)?;
                self.emitter.emit_case_test();
                let mut to = self.emitter.label();
                self.emitter.add_matched_jump(Op::Jt, &mut to);
                to_statement = Some(to);
            }

            self.expect(Token::Colon, ":")?;

            let body_addr = self.emitter.resume_deferred();
            if is_default {
                default_addr = Some(body_addr);
            }
            while !matches!(
                self.token,
                Token::Case | Token::Default | Token::RBrace | Token::Eof
            ) {
                self.statement_required()?;
            }
            self.emitter.end_deferred();

            if let Some(to) = to_statement {
                cases.push((to, body_addr));
            }
        }

        self.expect(Token::RBrace, "}")?;

        // Jump over the bodies: to the default body when one exists,
        // otherwise past everything.
        let mut end_jump = self.emitter.label();
        self.emitter.add_matched_jump(Op::Jmp, &mut end_jump);

        let statement_start = self.emitter.emit_deferred();
        let after_statements = self.emitter.pos();

        match default_addr {
            Some(addr) => self.emitter.match_jump_to(&end_jump, addr + statement_start),
            None => self.emitter.match_jump_to(&end_jump, after_statements),
        }
        for (to, addr) in &cases {
            self.emitter.match_jump_to(to, addr + statement_start);
        }

        // Jump sites recorded inside the deferred bodies moved with the
        // splice: translate this switch's breaks and any continue labels
        // destined for enclosing loops.
        let mut breaks = self.break_stack.pop().unwrap_or_default();
        for b in &mut breaks {
            b.matched_addr += statement_start;
            self.emitter.match_jump_to(b, after_statements);
        }
        for (scope, mark) in self.continue_stack.iter_mut().zip(continue_marks) {
            for label in scope.iter_mut().skip(mark) {
                label.matched_addr += statement_start;
            }
        }

        self.emitter.discard_result();
        Ok(())
    }

    fn iteration_statement(&mut self) -> Parse<()> {
        let kind = self.token.clone();
        self.advance();

        self.break_stack.push(Vec::new());
        self.continue_stack.push(Vec::new());

        let body = (|| -> Parse<()> {
            match kind {
                Token::While => {
                    self.expect(Token::LParen, "(")?;
                    let mut label = self.emitter.label();
                    self.expression_required(1)?;
                    self.emitter.add_matched_jump(Op::Jf, &mut label);
                    self.expect(Token::RParen, ")")?;
                    self.statement_required()?;
                    self.resolve_continues();
                    self.emitter.jump_to_label(Op::Jmp, &label);
                    self.emitter.match_jump(&label);
                }
                Token::Do => {
                    let label = self.emitter.label();
                    self.statement_required()?;
                    self.resolve_continues();
                    self.expect(Token::While, "while")?;
                    self.expect(Token::LParen, "(")?;
                    self.expression_required(1)?;
                    self.emitter.jump_to_label(Op::Jt, &label);
                    self.expect(Token::RParen, ")")?;
                    self.expect(Token::Semicolon, ";")?;
                }
                Token::For => {
                    self.expect(Token::LParen, "(")?;
                    if self.token == Token::Var {
                        self.advance();
                        let name = match &self.token {
                            Token::Identifier(s) => self.atoms.intern(s),
                            _ => Atom::EMPTY,
                        };
                        let count = self.variable_declaration_list()?;
                        if count == 0 {
                            return Err(self.error(Error::MissingVarDecl));
                        }
                        if self.token == Token::Colon {
                            if count != 1 {
                                return Err(self.error(Error::OneVarDeclAllowed));
                            }
                            self.advance();
                            self.for_iteration(name)?;
                        } else {
                            self.for_loop_cond_and_it()?;
                        }
                    } else if let Token::Identifier(s) = self.token.clone() {
                        // Two-token decision: `for (name : expr)` versus
                        // an ordinary init expression starting with the
                        // identifier.
                        let prev = self.token.clone();
                        self.advance();
                        if self.token == Token::Colon {
                            self.advance();
                            let name = self.atoms.intern(&s);
                            self.for_iteration(name)?;
                        } else {
                            self.unread(prev);
                            if self.expression(1)? {
                                self.emitter.discard_result();
                            }
                            self.for_loop_cond_and_it()?;
                        }
                    } else {
                        if self.expression(1)? {
                            self.emitter.discard_result();
                        }
                        self.for_loop_cond_and_it()?;
                    }
                }
                _ => unreachable!("iteration_statement dispatch"),
            }
            Ok(())
        })();

        let breaks = self.break_stack.pop().unwrap_or_default();
        self.continue_stack.pop();
        body?;
        for label in &breaks {
            self.emitter.match_jump(label);
        }
        Ok(())
    }

    /// `for (init; cond; iter)` after the init clause: the iteration
    /// expression collects into a deferred region and lands after the
    /// body, where `continue` resolves to.
    fn for_loop_cond_and_it(&mut self) -> Parse<()> {
        self.expect(Token::Semicolon, ";")?;
        let mut label = self.emitter.label();
        let has_cond = self.expression(1)?;
        if has_cond {
            self.emitter.add_matched_jump(Op::Jf, &mut label);
        }
        self.emitter.start_deferred();
        self.expect(Token::Semicolon, ";")?;
        if self.expression(1)? {
            self.emitter.discard_result();
        }
        self.emitter.end_deferred();
        self.expect(Token::RParen, ")")?;
        self.statement_required()?;

        self.resolve_continues();
        let _ = self.emitter.emit_deferred();
        self.emitter.jump_to_label(Op::Jmp, &label);
        self.emitter.match_jump(&label);
        Ok(())
    }

    /// `for (x : obj)`, desugared to
    ///
    /// ```text
    /// it = obj.iterator()
    /// loop: if (it.done()) goto end
    ///       x = it.next()
    ///       body
    ///       goto loop
    /// end:
    /// ```
    ///
    /// The iterator lives in a reserved local whose `%` name cannot
    /// collide with source identifiers.
    fn for_iteration(&mut self, name: Atom) -> Parse<()> {
        if name == Atom::EMPTY {
            return Err(self.error(Error::SyntaxError(
                "for..in target must be an identifier".to_string(),
            )));
        }
        let hidden = self.atoms.intern(&format!("%it{}", self.hidden_counter));
        self.hidden_counter += 1;
        self.emitter.add_var(hidden);

        self.emitter.emit_id(hidden, IdType::MustBeLocal);
        if !self.left_hand_side_expression()? {
            return Err(self.error(Error::Expected("expression")));
        }
        self.emitter.emit_id(WellKnown::Iterator.into(), IdType::NotLocal);
        self.emitter.emit_deref(DerefType::Prop);
        self.emitter.emit_call_ret(Op::Call, 0);
        self.emitter.emit_move();
        self.emitter.discard_result();
        self.expect(Token::RParen, ")")?;

        let loop_label = self.emitter.label();
        self.emitter.emit_id(hidden, IdType::MustBeLocal);
        self.emitter.emit_id(WellKnown::Done.into(), IdType::NotLocal);
        self.emitter.emit_deref(DerefType::Prop);
        self.emitter.emit_call_ret(Op::Call, 0);
        let mut end_label = self.emitter.label();
        self.emitter.add_matched_jump(Op::Jt, &mut end_label);

        self.emitter.emit_id(name, IdType::MightBeLocal);
        self.emitter.emit_id(hidden, IdType::MustBeLocal);
        self.emitter.emit_id(WellKnown::Next.into(), IdType::NotLocal);
        self.emitter.emit_deref(DerefType::Prop);
        self.emitter.emit_call_ret(Op::Call, 0);
        self.emitter.emit_move();
        self.emitter.discard_result();

        self.statement_required()?;

        self.resolve_continues();
        self.emitter.jump_to_label(Op::Jmp, &loop_label);
        self.emitter.match_jump(&end_label);
        Ok(())
    }

    fn resolve_continues(&mut self) {
        let labels = match self.continue_stack.last_mut() {
            Some(scope) => std::mem::take(scope),
            None => return,
        };
        for label in &labels {
            self.emitter.match_jump(label);
        }
    }

    fn jump_statement(&mut self) -> Parse<()> {
        match self.token {
            Token::Break | Token::Continue => {
                let is_break = self.token == Token::Break;
                self.advance();
                self.expect(Token::Semicolon, ";")?;
                let mut label = self.emitter.label();
                self.emitter.add_matched_jump(Op::Jmp, &mut label);
                let stack = if is_break { &mut self.break_stack } else { &mut self.continue_stack };
                match stack.last_mut() {
                    Some(scope) => scope.push(label),
                    None => {
                        let what = if is_break { "break outside loop" } else { "continue outside loop" };
                        return Err(self.error(Error::SyntaxError(what.to_string())));
                    }
                }
                Ok(())
            }
            Token::Return => {
                self.advance();
                let mut count = 0;
                if self.expression(1)? {
                    count = 1;
                }
                // A bare return inside a ctor returns `this`.
                if count == 0 && self.emitter.function_is_ctor() {
                    self.emitter.push_this();
                    count = 1;
                }
                self.emitter.emit_call_ret(Op::Ret, count);
                self.expect(Token::Semicolon, ";")?;
                Ok(())
            }
            _ => unreachable!("jump_statement dispatch"),
        }
    }

    fn variable_declaration_list(&mut self) -> Parse<u32> {
        let mut count = 0;
        while self.variable_declaration()? {
            count += 1;
            if self.token != Token::Comma {
                break;
            }
            self.advance();
        }
        Ok(count)
    }

    fn variable_declaration(&mut self) -> Parse<bool> {
        let name = match &self.token {
            Token::Identifier(s) => self.atoms.intern(s),
            _ => return Ok(false),
        };
        self.emitter.add_var(name);
        self.advance();
        if self.token != Token::Sto {
            return Ok(true);
        }
        self.advance();
        self.emitter.emit_id(name, IdType::MustBeLocal);
        self.expression_required(1)?;
        self.emitter.emit_move();
        self.emitter.discard_result();
        Ok(true)
    }

    // ---- expressions ----

    fn expression_required(&mut self, min_prec: u8) -> Parse<()> {
        if self.expression(min_prec)? {
            Ok(())
        } else {
            Err(self.error(Error::Expected("expression")))
        }
    }

    fn expression(&mut self, min_prec: u8) -> Parse<bool> {
        if !self.arithmetic_primary()? {
            return Ok(false);
        }

        if self.token == Token::Question {
            self.ternary_rest()?;
        }

        loop {
            let (prec, right_assoc, sto, op) = match op_info(&self.token) {
                Some(info) if info.0 >= min_prec => info,
                _ => break,
            };
            let next_min_prec = if right_assoc { prec } else { prec + 1 };
            self.advance();
            if sto {
                self.emitter.emit_dup();
            }

            if op == Op::LAnd || op == Op::LOr {
                // Short circuit: duplicate the left value, skip the right
                // operand when it already decides the result.
                self.emitter.emit_dup();
                let mut pass_label = self.emitter.label();
                let mut skip_label = self.emitter.label();
                let skip_result = op == Op::LOr;
                self.emitter.add_matched_jump(
                    if skip_result { Op::Jt } else { Op::Jf },
                    &mut skip_label,
                );

                self.expression_required(next_min_prec)?;

                self.emitter.emit_bin_op(op);
                self.emitter.add_matched_jump(Op::Jmp, &mut pass_label);
                self.emitter.match_jump(&skip_label);
                self.emitter.discard_result();
                self.emitter.push_k(Value::Bool(skip_result));
                self.emitter.match_jump(&pass_label);
            } else {
                self.expression_required(next_min_prec)?;
                self.emitter.emit_bin_op(op);
            }

            if sto {
                self.emitter.emit_move();
            }
        }
        Ok(true)
    }

    /// `cond ? a : b`; the condition value is on the stack.
    fn ternary_rest(&mut self) -> Parse<()> {
        self.advance();
        let mut if_label = self.emitter.label();
        let mut else_label = self.emitter.label();
        self.emitter.add_matched_jump(Op::Jf, &mut else_label);
        self.expression_required(1)?;
        self.emitter.emit_push();
        self.expect(Token::Colon, ":")?;
        self.emitter.add_matched_jump(Op::Jmp, &mut if_label);
        self.emitter.match_jump(&else_label);
        self.expression_required(1)?;
        self.emitter.emit_push();
        self.emitter.match_jump(&if_label);
        Ok(())
    }

    fn arithmetic_primary(&mut self) -> Parse<bool> {
        if self.token == Token::LParen {
            self.advance();
            self.expression_required(1)?;
            self.expect(Token::RParen, ")")?;
            return Ok(true);
        }

        let prefix = match self.token {
            Token::Inc => Some(Op::PreInc),
            Token::Dec => Some(Op::PreDec),
            Token::Minus => Some(Op::UMinus),
            Token::Tilde => Some(Op::UNot),
            Token::Bang => Some(Op::UNeg),
            _ => None,
        };
        if let Some(op) = prefix {
            self.advance();
            if !self.arithmetic_primary()? {
                return Err(self.error(Error::Expected("expression")));
            }
            self.emitter.emit_un_op(op);
            return Ok(true);
        }

        if !self.left_hand_side_expression()? {
            return Ok(false);
        }

        let postfix = match self.token {
            Token::Inc => Some(Op::PostInc),
            Token::Dec => Some(Op::PostDec),
            _ => None,
        };
        if let Some(op) = postfix {
            self.advance();
            self.emitter.emit_un_op(op);
        }
        Ok(true)
    }

    /// Call, index and member suffixes. The receiver for a method call
    /// rides inside the callee's slot reference.
    fn left_hand_side_expression(&mut self) -> Parse<bool> {
        if !self.member_expression()? {
            return Ok(false);
        }
        loop {
            match self.token {
                Token::LParen => {
                    self.advance();
                    let argc = self.argument_list()?;
                    self.expect(Token::RParen, ")")?;
                    self.emitter.emit_call_ret(Op::Call, argc);
                }
                Token::LBracket => {
                    self.advance();
                    self.expression_required(1)?;
                    self.expect(Token::RBracket, "]")?;
                    self.emitter.emit_deref(DerefType::Elt);
                }
                Token::Dot => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    self.emitter.emit_id(name, IdType::NotLocal);
                    self.emitter.emit_deref(DerefType::Prop);
                }
                _ => return Ok(true),
            }
        }
    }

    fn member_expression(&mut self) -> Parse<bool> {
        if self.token == Token::New {
            self.advance();
            if !self.member_expression()? {
                return Err(self.error(Error::Expected("expression")));
            }
            let argc = if self.token == Token::LParen {
                self.advance();
                let argc = self.argument_list()?;
                self.expect(Token::RParen, ")")?;
                argc
            } else {
                // `new` without parentheses constructs with no arguments.
                0
            };
            self.emitter.emit_call_ret(Op::New, argc);
            return Ok(true);
        }
        if self.token == Token::Function {
            self.advance();
            let func = self.function_expression(false, Atom::EMPTY)?;
            self.emitter.push_k(Value::Obj(func));
            return Ok(true);
        }
        if self.token == Token::Class {
            self.advance();
            self.class_expression()?;
            return Ok(true);
        }
        if !self.primary_expression()? {
            return Ok(false);
        }
        // Member chain without calls, so `new a.b.C(x)` resolves the
        // constructor before the argument list.
        loop {
            match self.token {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    self.emitter.emit_id(name, IdType::NotLocal);
                    self.emitter.emit_deref(DerefType::Prop);
                }
                Token::LBracket => {
                    self.advance();
                    self.expression_required(1)?;
                    self.expect(Token::RBracket, "]")?;
                    self.emitter.emit_deref(DerefType::Elt);
                }
                _ => return Ok(true),
            }
        }
    }

    fn argument_list(&mut self) -> Parse<u32> {
        if !self.expression(1)? {
            return Ok(0);
        }
        self.emitter.emit_push();
        let mut count = 1;
        while self.token == Token::Comma {
            self.advance();
            self.expression_required(1)?;
            self.emitter.emit_push();
            count += 1;
        }
        Ok(count)
    }

    fn primary_expression(&mut self) -> Parse<bool> {
        match self.token.clone() {
            Token::Identifier(s) => {
                let atom = self.atoms.intern(&s);
                self.emitter.emit_id(atom, IdType::MightBeLocal);
                self.advance();
            }
            Token::This => {
                self.emitter.push_this();
                self.advance();
            }
            Token::Integer(n) => {
                self.emitter.push_k(Value::Integer(n));
                self.advance();
            }
            Token::Float(n) => {
                self.emitter.push_k(Value::Float(n));
                self.advance();
            }
            Token::Str(s) => {
                let v = self.string_literal(&s);
                self.emitter.push_k(v);
                self.advance();
            }
            Token::True => {
                self.emitter.push_k(Value::Bool(true));
                self.advance();
            }
            Token::False => {
                self.emitter.push_k(Value::Bool(false));
                self.advance();
            }
            Token::Null => {
                self.emitter.push_k(Value::Null);
                self.advance();
            }
            Token::Undefined => {
                self.emitter.push_k(Value::Undefined);
                self.advance();
            }
            Token::LBracket => {
                self.advance();
                self.emitter.emit_load_lit(true);
                if self.expression(1)? {
                    self.emitter.emit_append_elt();
                    while self.token == Token::Comma {
                        self.advance();
                        self.expression_required(1)?;
                        self.emitter.emit_append_elt();
                    }
                }
                self.expect(Token::RBracket, "]")?;
            }
            Token::LBrace => {
                self.advance();
                self.emitter.emit_load_lit(false);
                if self.property_assignment()? {
                    self.emitter.emit_append_prop();
                    while self.token == Token::Comma {
                        self.advance();
                        if !self.property_assignment()? {
                            return Err(self.error(Error::PropertyAssignment));
                        }
                        self.emitter.emit_append_prop();
                    }
                }
                self.expect(Token::RBrace, "}")?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn property_assignment(&mut self) -> Parse<bool> {
        if !self.property_name()? {
            return Ok(false);
        }
        self.expect(Token::Colon, ":")?;
        self.expression_required(1)?;
        Ok(true)
    }

    fn property_name(&mut self) -> Parse<bool> {
        match self.token.clone() {
            Token::Identifier(s) => {
                let atom = self.atoms.intern(&s);
                self.emitter.emit_id(atom, IdType::NotLocal);
                self.advance();
            }
            Token::Str(s) => {
                let v = self.string_literal(&s);
                self.emitter.push_k(v);
                self.advance();
            }
            Token::Integer(n) => {
                self.emitter.push_k(Value::Integer(n));
                self.advance();
            }
            Token::Float(n) => {
                self.emitter.push_k(Value::Float(n));
                self.advance();
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    // ---- functions & classes ----

    fn function_expression(&mut self, ctor: bool, name: Atom) -> Parse<ObjectId> {
        self.expect(Token::LParen, "(")?;
        self.emitter.function_start(name, ctor);
        self.formal_parameter_list()?;
        self.emitter.function_params_end();
        self.expect(Token::RParen, ")")?;
        self.expect(Token::LBrace, "{")?;
        while self.statement()? {}
        self.expect(Token::RBrace, "}")?;
        Ok(self.emitter.function_end(self.heap))
    }

    fn formal_parameter_list(&mut self) -> Parse<()> {
        if !matches!(self.token, Token::Identifier(_)) {
            return Ok(());
        }
        loop {
            let name = self.expect_identifier()?;
            self.emitter.function_add_param(name);
            if self.token != Token::Comma {
                return Ok(());
            }
            self.advance();
            if !matches!(self.token, Token::Identifier(_)) {
                return Err(self.error(Error::Expected("identifier")));
            }
        }
    }

    fn class_expression(&mut self) -> Parse<()> {
        self.emitter.class_start(self.heap);
        self.expect(Token::LBrace, "{")?;
        while self.class_contents_statement()? {}
        self.expect(Token::RBrace, "}")?;
        let class = self.emitter.class_end().unwrap_or(ObjectId::NULL);
        self.emitter.push_k(Value::Obj(class));
        Ok(())
    }

    fn set_class_property(&mut self, name: Atom, value: Value) {
        if let Some(class) = self.emitter.current_class() {
            if let Some(o) = self.heap.object_mut(class) {
                o.set_property(name, value);
            }
        }
    }

    fn class_contents_statement(&mut self) -> Parse<bool> {
        match self.token.clone() {
            Token::Eof => Ok(false),
            Token::Function => {
                self.advance();
                let name = self.expect_identifier()?;
                let func = self.function_expression(false, name)?;
                self.set_class_property(name, Value::Obj(func));
                Ok(true)
            }
            // Method shorthand: `name(params) { ... }`.
            Token::Identifier(s) => {
                let name = self.atoms.intern(&s);
                self.advance();
                let func = self.function_expression(false, name)?;
                self.set_class_property(name, Value::Obj(func));
                Ok(true)
            }
            Token::Constructor => {
                self.advance();
                let func = self.function_expression(true, WellKnown::Constructor.into())?;
                self.set_class_property(WellKnown::Constructor.into(), Value::Obj(func));
                Ok(true)
            }
            Token::Var => {
                self.advance();
                let name = self.expect_identifier()?;
                let mut value = Value::Null;
                if self.token == Token::Sto {
                    self.advance();
                    value = match self.token.clone() {
                        Token::Float(n) => Value::Float(n),
                        Token::Integer(n) => Value::Integer(n),
                        Token::Str(s) => self.string_literal(&s),
                        Token::True => Value::Bool(true),
                        Token::False => Value::Bool(false),
                        Token::Null => Value::Null,
                        Token::Undefined => Value::Undefined,
                        _ => return Err(self.error(Error::ConstantValueRequired)),
                    };
                    self.advance();
                }
                self.set_class_property(name, value);
                self.expect(Token::Semicolon, ";")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<(Program, Heap, AtomTable), ParseError> {
        let mut heap = Heap::new();
        let mut atoms = AtomTable::new();
        let program = parse_program(source, &mut heap, &mut atoms)?;
        Ok((program, heap, atoms))
    }

    fn main_code(source: &str) -> Vec<u8> {
        let (program, heap, _) = parse(source).unwrap();
        heap.object(program.main).unwrap().as_function().unwrap().code.clone()
    }

    #[test]
    fn test_empty_program() {
        let code = main_code("");
        assert_eq!(code, vec![Op::Ret as u8, 0]);
    }

    #[test]
    fn test_var_with_initializer() {
        let code = main_code("var a = 1;");
        assert_eq!(
            code,
            vec![
                Op::PushLocalRef as u8,
                0,
                Op::PushK as u8,
                0,
                Op::Move as u8,
                Op::Pop as u8,
                Op::Ret as u8,
                0,
            ]
        );
    }

    #[test]
    fn test_missing_var_decl() {
        let err = parse("var ;").unwrap_err();
        assert_eq!(err.kind, Error::MissingVarDecl);
    }

    #[test]
    fn test_one_var_decl_allowed_in_for_in() {
        let err = parse("for (var a, b : x) ;").unwrap_err();
        assert_eq!(err.kind, Error::OneVarDeclAllowed);
    }

    #[test]
    fn test_duplicate_default() {
        let err = parse("switch (1) { default: ; default: ; }").unwrap_err();
        assert_eq!(err.kind, Error::DuplicateDefault);
    }

    #[test]
    fn test_constant_value_required() {
        let err = parse("class C { var a = 1 + 2; }").unwrap_err();
        assert_eq!(err.kind, Error::ConstantValueRequired);
    }

    #[test]
    fn test_unknown_byte_becomes_diagnostic() {
        let err = parse("var a = #;").unwrap_err();
        assert!(matches!(err.kind, Error::Expected(_) | Error::SyntaxError(_)));
    }

    #[test]
    fn test_parse_error_carries_line() {
        let err = parse("var a = 1;\nvar ;").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_parse_determinism() {
        let source = r#"
            function f(x) { if (x <= 1) return 1; return x * f(x - 1); }
            var a = [1, 2, 3];
            var s = 0;
            for (var v : a) s = s + v;
            switch (s) { case 6: s = 0; default: s = s + 1; }
        "#;
        let (p1, h1, _) = parse(source).unwrap();
        let (p2, h2, _) = parse(source).unwrap();
        let f1 = h1.object(p1.main).unwrap().as_function().unwrap().clone();
        let f2 = h2.object(p2.main).unwrap().as_function().unwrap().clone();
        assert_eq!(f1.code, f2.code);
        assert_eq!(f1.locals, f2.locals);
    }

    #[test]
    fn test_nested_function_is_constant() {
        let (program, heap, atoms) = parse("function f(a, b) { return a + b; }").unwrap();
        let main = heap.object(program.main).unwrap().as_function().unwrap().clone();
        let func_const = main
            .constants
            .iter()
            .find_map(|v| v.as_object())
            .expect("function constant");
        let f = heap.object(func_const).unwrap().as_function().unwrap();
        assert_eq!(f.param_count(), 2);
        assert_eq!(atoms.resolve(f.name), "f");
    }

    #[test]
    fn test_class_builds_property_map() {
        let (program, heap, atoms) = parse(
            "class P { constructor(x) { this.x = x; } get() { return this.x; } var tag = 7; }",
        )
        .unwrap();
        let main = heap.object(program.main).unwrap().as_function().unwrap().clone();
        let class_id = main
            .constants
            .iter()
            .find_map(|v| v.as_object())
            .filter(|id| heap.object(*id).map(|o| !o.has_code()).unwrap_or(false))
            .expect("class constant");
        let class = heap.object(class_id).unwrap();

        let names: Vec<&str> =
            class.properties().iter().map(|(a, _)| atoms.resolve(*a)).collect();
        assert!(names.contains(&"constructor"));
        assert!(names.contains(&"get"));
        assert!(names.contains(&"tag"));
        assert_eq!(class.property(atoms_lookup(&atoms, "tag")), Some(Value::Integer(7)));

        let ctor_id = class
            .property(WellKnown::Constructor.into())
            .and_then(|v| v.as_object())
            .expect("ctor");
        assert!(heap.object(ctor_id).unwrap().as_function().unwrap().is_ctor);
    }

    fn atoms_lookup(atoms: &AtomTable, name: &str) -> Atom {
        // Test-only reverse scan; the table is small.
        for raw in 0..atoms.len() as u16 {
            if atoms.resolve(Atom(raw)) == name {
                return Atom(raw);
            }
        }
        panic!("atom {} not interned", name);
    }

    #[test]
    fn test_string_literals_deduplicate() {
        let (program, _, _) = parse(r#"var a = "x"; var b = "x"; var c = "y";"#).unwrap();
        assert_eq!(program.string_literals().len(), 2);
    }

    #[test]
    fn test_switch_emits_tests_before_bodies() {
        let code = main_code("switch (1) { case 1: ; case 2: ; }");
        let case_test_positions: Vec<usize> = code
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == Op::CaseTest as u8)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(case_test_positions.len(), 2);
        // Both tests precede the unconditional jump over the bodies.
        let jmp = code.iter().position(|&b| b == Op::Jmp as u8).unwrap();
        assert!(case_test_positions.iter().all(|&p| p < jmp));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let err = parse("break;").unwrap_err();
        assert!(matches!(err.kind, Error::SyntaxError(_)));
    }

    #[test]
    fn test_for_in_hidden_iterator_local() {
        let (program, heap, atoms) = parse("var a = []; for (var v : a) ;").unwrap();
        let main = heap.object(program.main).unwrap().as_function().unwrap().clone();
        let names: Vec<&str> = main.locals.iter().map(|&a| atoms.resolve(a)).collect();
        assert!(names.contains(&"a"));
        assert!(names.contains(&"v"));
        assert!(names.iter().any(|n| n.starts_with('%')));
    }

    #[test]
    fn test_method_call_chain_parses() {
        // Receiver tracking exercises deref + call interplay.
        let (_, _, _) = parse("var x = a.b(1)[2].c(3, 4);").unwrap();
    }

    #[test]
    fn test_new_with_member_chain() {
        let (_, _, _) = parse("var p = new ns.Point(1, 2); var q = new Point;").unwrap();
    }
}
