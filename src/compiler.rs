use crate::chunk::OpCode;
use crate::heap::{Heap, ObjRef};
use crate::reporter::{Report, Reporter};
use crate::token::{Token, TokenKind};
use crate::tokenizer::Tokenizer;
use crate::value::{Function, UpvalueDescriptor, Value};

const MAX_LOCALS: usize = u8::MAX as usize + 1;
const UNINITIALIZED_DEPTH: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(clippy::derive_ord_xor_partial_ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Tags the parse functions a token kind's grammar rule dispatches to.
/// A plain enum rather than function pointers, so the one place that
/// needs to know every rule (`apply`) stays a single exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseFn {
    Number,
    StringLit,
    Literal,
    Grouping,
    Unary,
    Binary,
    And,
    Or,
    Call,
    Variable,
}

struct Rule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> Rule {
    use ParseFn::*;
    use Precedence as P;
    match kind {
        TokenKind::LeftParen => Rule { prefix: Some(Grouping), infix: Some(Call), precedence: P::Call },
        TokenKind::Minus => Rule { prefix: Some(Unary), infix: Some(Binary), precedence: P::Term },
        TokenKind::Plus => Rule { prefix: None, infix: Some(Binary), precedence: P::Term },
        TokenKind::Slash => Rule { prefix: None, infix: Some(Binary), precedence: P::Factor },
        TokenKind::Star => Rule { prefix: None, infix: Some(Binary), precedence: P::Factor },
        TokenKind::Bang => Rule { prefix: Some(Unary), infix: None, precedence: P::None },
        TokenKind::BangEqual => Rule { prefix: None, infix: Some(Binary), precedence: P::Equality },
        TokenKind::EqualEqual => Rule { prefix: None, infix: Some(Binary), precedence: P::Equality },
        TokenKind::Greater => Rule { prefix: None, infix: Some(Binary), precedence: P::Comparison },
        TokenKind::GreaterEqual => Rule { prefix: None, infix: Some(Binary), precedence: P::Comparison },
        TokenKind::Less => Rule { prefix: None, infix: Some(Binary), precedence: P::Comparison },
        TokenKind::LessEqual => Rule { prefix: None, infix: Some(Binary), precedence: P::Comparison },
        TokenKind::Identifier => Rule { prefix: Some(Variable), infix: None, precedence: P::None },
        TokenKind::String => Rule { prefix: Some(StringLit), infix: None, precedence: P::None },
        TokenKind::Number => Rule { prefix: Some(Number), infix: None, precedence: P::None },
        TokenKind::And => Rule { prefix: None, infix: Some(And), precedence: P::And },
        TokenKind::Or => Rule { prefix: None, infix: Some(Or), precedence: P::Or },
        TokenKind::False | TokenKind::True | TokenKind::Nil => {
            Rule { prefix: Some(Literal), infix: None, precedence: P::None }
        }
        _ => Rule { prefix: None, infix: None, precedence: P::None },
    }
}

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// One nested compilation in progress: every `fun` body pushes a new
/// scope onto the compiler's scope stack, compiles into its own
/// `Function`, and pops back to its enclosing scope when the body ends.
struct FunctionScope<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: i32,
}

impl<'src> FunctionScope<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>, arity: u8) -> Self {
        // Slot 0 is reserved for the closure being called; it has no
        // name a user program could ever reference.
        let reserved = Local {
            name: Token::new(TokenKind::Identifier, "", 0),
            depth: 0,
            is_captured: false,
        };
        FunctionScope {
            function: Function::new(name, arity),
            kind,
            locals: vec![reserved],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src, 'rep> {
    tokenizer: Tokenizer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    reporter: &'rep mut dyn Reporter,
    heap: &'rep mut Heap,
    scopes: Vec<FunctionScope<'src>>,
}

impl<'src, 'rep> Compiler<'src, 'rep> {
    pub fn new(source: &'src str, heap: &'rep mut Heap, reporter: &'rep mut dyn Reporter) -> Self {
        let mut tokenizer = Tokenizer::new(source);
        let current = tokenizer.scan_token();
        Compiler {
            tokenizer,
            previous: current,
            current,
            had_error: false,
            panic_mode: false,
            reporter,
            heap,
            scopes: vec![FunctionScope::new(FunctionKind::Script, None, 0)],
        }
    }

    /// Compiles the whole source as a top-level script. Returns the
    /// script's `Function` (wrapping a chunk whose last instruction is
    /// always an implicit `return nil`) on success.
    pub fn compile(mut self) -> Result<ObjRef, ()> {
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        let (function, _upvalues) = self.end_function();
        if self.had_error {
            Err(())
        } else {
            Ok(self.heap.alloc_function(function))
        }
    }

    // ----------------------------------------------------------------
    // token stream helpers
    // ----------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.reporter.report(Report::compile(message.to_string(), &token));
    }

    /// Skips tokens until a likely statement boundary, so one syntax
    /// error doesn't cascade into a wall of spurious follow-on errors.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ----------------------------------------------------------------
    // emission helpers
    // ----------------------------------------------------------------

    fn scope(&mut self) -> &mut FunctionScope<'src> {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    fn chunk_line(&self) -> u32 {
        self.previous.line
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.chunk_line();
        self.scope().function.chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.chunk_line();
        self.scope().function.chunk.write(byte, line);
    }

    fn emit_ops(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_constant(&mut self, value: Value) {
        match self.scope().function.chunk.add_constant(value) {
            Ok(idx) => self.emit_ops(OpCode::Constant, idx),
            Err(_) => self.error("Too many constants in one chunk."),
        }
    }

    /// Emits `op` followed by a placeholder 16-bit operand, returning the
    /// offset of that operand so it can be patched once the jump target
    /// is known.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.scope().function.chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.scope().function.chunk.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.scope().function.chunk.patch_short(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.scope().function.chunk.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xFF) as u8);
        self.emit_byte((offset & 0xFF) as u8);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn end_function(&mut self) -> (Function, Vec<UpvalueDescriptor>) {
        self.emit_return();
        let scope = self.scopes.pop().expect("scope stack is never empty");
        let mut function = scope.function;
        function.upvalue_count = scope.upvalues.len();
        (function, scope.upvalues)
    }

    // ----------------------------------------------------------------
    // scopes and locals
    // ----------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.scope().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.scope().scope_depth -= 1;
        let depth = self.scope().scope_depth;
        loop {
            let still_in_scope = match self.scope().locals.last() {
                Some(local) if local.depth > depth => Some(local.is_captured),
                _ => None,
            };
            match still_in_scope {
                Some(is_captured) => {
                    if is_captured {
                        self.emit_op(OpCode::CloseUpvalue);
                    } else {
                        self.emit_op(OpCode::Pop);
                    }
                    self.scope().locals.pop();
                }
                None => break,
            }
        }
    }

    fn names_equal(a: &str, b: &str) -> bool {
        a == b
    }

    fn declare_local(&mut self, name: Token<'src>) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let depth = self.scope().scope_depth;
        let mut duplicate = false;
        {
            let scope = self.scopes.last().expect("scope stack is never empty");
            for local in scope.locals.iter().rev() {
                if local.depth != -1 && local.depth < depth {
                    break;
                }
                if Self::names_equal(local.name.lexeme, name.lexeme) {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        if self.scope().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.scope().locals.push(Local {
            name,
            depth: UNINITIALIZED_DEPTH,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let depth = self.scope().scope_depth;
        self.scope().locals.last_mut().unwrap().depth = depth;
    }

    /// Searches `scopes[scope_index]`'s locals, high to low so inner
    /// shadowing wins.
    fn resolve_local(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        let mut found: Option<(usize, bool)> = None;
        {
            let scope = &self.scopes[scope_index];
            for (i, local) in scope.locals.iter().enumerate().rev() {
                if Self::names_equal(local.name.lexeme, name) {
                    found = Some((i, local.depth == UNINITIALIZED_DEPTH));
                    break;
                }
            }
        }
        let (index, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(index as u8)
    }

    /// Resolves `name` as an upvalue of `scope_index`, recursing toward
    /// the enclosing scopes and registering an upvalue chain as it
    /// unwinds back, deduplicating on `(is_local, index)`.
    fn resolve_upvalue(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        if scope_index == 0 {
            return None;
        }
        let enclosing = scope_index - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.scopes[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(scope_index, local_idx, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_index, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_index: usize, index: u8, is_local: bool) -> u8 {
        {
            let upvalues = &self.scopes[scope_index].upvalues;
            for (i, existing) in upvalues.iter().enumerate() {
                if existing.index == index && existing.is_local == is_local {
                    return i as u8;
                }
            }
        }
        if self.scopes[scope_index].upvalues.len() >= MAX_LOCALS {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let upvalues = &mut self.scopes[scope_index].upvalues;
        upvalues.push(UpvalueDescriptor { is_local, index });
        (upvalues.len() - 1) as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj_ref = self.heap.intern_string(name.as_bytes());
        match self.scope().function.chunk.add_constant(Value::Object(obj_ref)) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    // ----------------------------------------------------------------
    // declarations and statements
    // ----------------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.previous;
        self.declare_local(name);
        self.mark_initialized();
        self.function(name, FunctionKind::Function);
        let global = self.identifier_constant(name.lexeme);
        self.define_variable(global, name);
    }

    fn function(&mut self, name: Token<'src>, kind: FunctionKind) {
        let name_ref = self.heap.intern_string(name.lexeme.as_bytes());
        self.scopes.push(FunctionScope::new(kind, Some(name_ref), 0));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.scope().function.arity;
                if arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.scope().function.arity = arity + 1;
                }
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let param = self.previous;
                self.declare_local(param);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let function_ref = self.heap.alloc_function(function);
        let const_idx = match self.scope().function.chunk.add_constant(Value::Object(function_ref)) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        };
        self.emit_ops(OpCode::Closure, const_idx);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect variable name.");
        let name = self.previous;
        self.declare_local(name);
        let global = if self.scope().scope_depth > 0 {
            0
        } else {
            self.identifier_constant(name.lexeme)
        };

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, name);
    }

    fn define_variable(&mut self, global: u8, name: Token<'src>) {
        if self.scope().scope_depth > 0 {
            self.mark_initialized();
            let _ = name;
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.scope().function.chunk.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.scope().function.chunk.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.scope().function.chunk.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.scope().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ----------------------------------------------------------------
    // expressions (Pratt parser)
    // ----------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        self.apply(prefix, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix.expect("infix rule must exist for looped token");
            self.apply(infix, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn apply(&mut self, parse_fn: ParseFn, can_assign: bool) {
        match parse_fn {
            ParseFn::Number => self.number(),
            ParseFn::StringLit => self.string(),
            ParseFn::Literal => self.literal(),
            ParseFn::Grouping => self.grouping(),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::And => self.and(),
            ParseFn::Or => self.or(),
            ParseFn::Call => self.call(),
            ParseFn::Variable => self.variable(can_assign),
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let obj_ref = self.heap.intern_string(content.as_bytes());
        self.emit_constant(Value::Object(obj_ref));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() only dispatched for false/true/nil"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::ArithmeticNegate),
            TokenKind::Bang => self.emit_op(OpCode::BooleanNegate),
            _ => unreachable!("unary() only dispatched for -/!"),
        }
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        let op_rule = rule(op_kind);
        self.parse_precedence(op_rule.precedence.next());
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::BooleanNegate);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::BooleanNegate);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::BooleanNegate);
            }
            _ => unreachable!("binary() only dispatched for binary operators"),
        }
    }

    /// `a and b`: if `a` is falsy, short-circuit leaving it on the stack;
    /// otherwise discard it and evaluate `b`.
    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// `a or b`: if `a` is truthy, short-circuit leaving it on the stack;
    /// otherwise discard it and evaluate `b`.
    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_ops(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        let current = self.scopes.len() - 1;

        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(current, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(current, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let slot = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, slot)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::Reporter;

    struct NullReporter;
    impl Reporter for NullReporter {
        fn report(&mut self, _report: Report) {}
    }

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let mut reporter = NullReporter;
        let obj_ref = {
            let compiler = Compiler::new(source, &mut heap, &mut reporter);
            compiler.compile().expect("expected compilation to succeed")
        };
        (obj_ref, heap)
    }

    fn compile_err(source: &str) -> bool {
        let mut heap = Heap::new();
        let mut reporter = NullReporter;
        let compiler = Compiler::new(source, &mut heap, &mut reporter);
        compiler.compile().is_err()
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        compile_ok("1 + 2 * 3;");
    }

    #[test]
    fn compiles_variable_declarations_and_scoping() {
        compile_ok("var a = 1; { var a = 2; print a; } print a;");
    }

    #[test]
    fn compiles_closures_over_locals() {
        compile_ok("fun make() { var c = 1; fun inner() { print c; } return inner; }");
    }

    #[test]
    fn rejects_read_of_uninitialized_local() {
        assert!(compile_err("{ var a = a; }"));
    }

    #[test]
    fn rejects_duplicate_local_declaration() {
        assert!(compile_err("{ var a = 1; var a = 2; }"));
    }

    #[test]
    fn rejects_top_level_return() {
        assert!(compile_err("return 1;"));
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        assert!(compile_err("1 + 2 = 3;"));
    }
}
