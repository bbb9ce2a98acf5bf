use crate::chunk::OpCode;
use crate::compiler::Compiler;
use crate::heap::{Heap, ObjRef};
use crate::natives;
use crate::reporter::{Reporter, Report};
use crate::table::Table;
use crate::value::{Closure, Native, NativeFn, ObjData, ObjKind, Upvalue, Value};

const FRAMES_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

/// Owns the whole runtime: the value stack, the call-frame chain, the
/// heap, globals, and the open-upvalue list. Single-threaded, and
/// dropping it frees every object it ever allocated.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
        };
        vm.define_native("clock", 0, natives::clock);
        vm.define_native("random", 0, natives::random);
        vm
    }

    pub fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let name_ref = self.heap.intern_string(name.as_bytes());
        let hash = self.heap.string_hash(name_ref);
        let native_ref = self.heap.alloc_native(Native {
            name,
            arity,
            function,
        });
        self.globals.set(name_ref, hash, Value::Object(native_ref));
    }

    pub fn interpret(&mut self, source: &str, reporter: &mut dyn Reporter) -> Result<(), InterpretError> {
        let function_ref = {
            let compiler = Compiler::new(source, &mut self.heap, reporter);
            compiler.compile().map_err(|_| InterpretError::Compile)?
        };
        let closure_ref = self.heap.alloc_closure(Closure {
            function: function_ref,
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Object(closure_ref));
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            base: 0,
        });
        self.run(reporter)
    }

    // ----------------------------------------------------------------
    // chunk access through the current frame's closure
    // ----------------------------------------------------------------

    fn function_of(&self, closure_ref: ObjRef) -> ObjRef {
        match self.heap.data(closure_ref) {
            ObjData::Closure(closure) => closure.function,
            _ => unreachable!("frame.closure always points to a Closure"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("run() always has an active frame");
        let ip = frame.ip;
        frame.ip += 1;
        let closure_ref = frame.closure;
        let function_ref = self.function_of(closure_ref);
        match self.heap.data(function_ref) {
            ObjData::Function(f) => f.chunk.read_byte(ip),
            _ => unreachable!("Closure.function always points to a Function"),
        }
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let frame = self.frames.last().expect("run() always has an active frame");
        let function_ref = self.function_of(frame.closure);
        match self.heap.data(function_ref) {
            ObjData::Function(f) => f.chunk.constants[idx as usize],
            _ => unreachable!("Closure.function always points to a Function"),
        }
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().expect("run() always has an active frame");
        let function_ref = self.function_of(frame.closure);
        match self.heap.data(function_ref) {
            ObjData::Function(f) => f.chunk.line_at(frame.ip.saturating_sub(1)),
            _ => unreachable!("Closure.function always points to a Function"),
        }
    }

    // ----------------------------------------------------------------
    // stack helpers
    // ----------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler emitted unbalanced bytecode")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ----------------------------------------------------------------
    // upvalues
    // ----------------------------------------------------------------

    /// Finds or creates an open upvalue over `stack_slot`, keeping
    /// `open_upvalues` sorted by descending slot so `close_upvalues` can
    /// always pop from the front.
    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        for &up_ref in self.open_upvalues.iter() {
            let matches = match self.heap.data(up_ref) {
                ObjData::Upvalue(Upvalue::Open(slot)) => *slot == stack_slot,
                _ => false,
            };
            if matches {
                return up_ref;
            }
        }
        let new_ref = self.heap.alloc_upvalue(Upvalue::Open(stack_slot));
        let mut insert_at = self.open_upvalues.len();
        for (i, &up_ref) in self.open_upvalues.iter().enumerate() {
            let slot = match self.heap.data(up_ref) {
                ObjData::Upvalue(Upvalue::Open(slot)) => *slot,
                _ => continue,
            };
            if slot < stack_slot {
                insert_at = i;
                break;
            }
        }
        self.open_upvalues.insert(insert_at, new_ref);
        new_ref
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&up_ref) = self.open_upvalues.first() {
            let slot = match self.heap.data(up_ref) {
                ObjData::Upvalue(Upvalue::Open(slot)) => *slot,
                _ => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            if let ObjData::Upvalue(upvalue) = self.heap.data_mut(up_ref) {
                *upvalue = Upvalue::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // ----------------------------------------------------------------
    // calling
    // ----------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), String> {
        let Value::Object(obj_ref) = callee else {
            return Err("Can only call functions and classes.".to_string());
        };
        match self.heap.kind(obj_ref) {
            ObjKind::Closure => self.call_closure(obj_ref, argc),
            ObjKind::Native => self.call_native(obj_ref, argc),
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: u8) -> Result<(), String> {
        let function_ref = self.function_of(closure_ref);
        let arity = match self.heap.data(function_ref) {
            ObjData::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn call_native(&mut self, native_ref: ObjRef, argc: u8) -> Result<(), String> {
        let (function, arity, base) = match self.heap.data(native_ref) {
            ObjData::Native(native) => {
                (native.function, native.arity, self.stack.len() - argc as usize - 1)
            }
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }
        let args = self.stack[base + 1..].to_vec();
        let result = function(&args).map_err(|msg| msg)?;
        self.stack.truncate(base);
        self.push(result);
        Ok(())
    }

    /// Marks every root this VM can see (the value stack, each frame's
    /// closure, open upvalues, the globals table), then traces and sweeps.
    /// Only the VM calls this, since it's the only thing that knows the
    /// full root set; allocation during compilation never triggers a
    /// collection.
    fn collect_garbage(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        for &value in self.stack.iter() {
            self.heap.mark_value(value);
        }
        for frame in self.frames.iter() {
            self.heap.mark_object(frame.closure);
        }
        for &up_ref in self.open_upvalues.iter() {
            self.heap.mark_object(up_ref);
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }
        self.heap.trace_references();
        self.heap.sweep();
    }

    // ----------------------------------------------------------------
    // main dispatch loop
    // ----------------------------------------------------------------

    fn run(&mut self, reporter: &mut dyn Reporter) -> Result<(), InterpretError> {
        loop {
            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    self.runtime_error(reporter, "Unknown opcode.".to_string());
                    return Err(InterpretError::Runtime);
                }
            };

            match self.dispatch(op) {
                Ok(Some(())) => {}
                Ok(None) => return Ok(()),
                Err(message) => {
                    self.runtime_error(reporter, message);
                    return Err(InterpretError::Runtime);
                }
            }
        }
    }

    /// Executes one instruction. Returns `Ok(Some(()))` to keep running,
    /// `Ok(None)` when the top-level script has returned (the whole
    /// program is done), or `Err(message)` on a runtime fault.
    fn dispatch(&mut self, op: OpCode) -> Result<Option<()>, String> {
        match op {
            OpCode::Constant => {
                let value = self.read_constant();
                self.push(value);
            }
            OpCode::Nil => self.push(Value::Nil),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }

            OpCode::Add => self.binary_add()?,
            OpCode::Subtract => self.binary_numeric(|a, b| a - b)?,
            OpCode::Multiply => self.binary_numeric(|a, b| a * b)?,
            OpCode::Divide => self.binary_numeric(|a, b| a / b)?,
            OpCode::ArithmeticNegate => {
                let value = self.peek(0);
                match value {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err("Operand must be a number.".to_string()),
                }
            }
            OpCode::BooleanNegate => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsy()));
            }
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            OpCode::Greater => self.binary_compare(|a, b| a > b)?,
            OpCode::Less => self.binary_compare(|a, b| a < b)?,

            OpCode::Print => {
                let value = self.pop();
                println!("{}", self.heap.display_value(&value));
            }

            OpCode::DefineGlobal => {
                let name_ref = self.read_global_name();
                let value = self.pop();
                let hash = self.heap.string_hash(name_ref);
                self.globals.set(name_ref, hash, value);
            }
            OpCode::GetGlobal => {
                let name_ref = self.read_global_name();
                let hash = self.heap.string_hash(name_ref);
                match self.globals.get(name_ref, hash) {
                    Some(value) => self.push(value),
                    None => {
                        return Err(format!("Undefined variable '{}'.", self.heap.as_str(name_ref)))
                    }
                }
            }
            OpCode::SetGlobal => {
                let name_ref = self.read_global_name();
                let hash = self.heap.string_hash(name_ref);
                let value = self.peek(0);
                if self.globals.set(name_ref, hash, value) {
                    self.globals.delete(name_ref, hash);
                    return Err(format!("Undefined variable '{}'.", self.heap.as_str(name_ref)));
                }
            }
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().base;
                self.push(self.stack[base + slot]);
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().base;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::GetUpvalue => {
                let slot = self.read_byte() as usize;
                let closure_ref = self.frames.last().unwrap().closure;
                let up_ref = match self.heap.data(closure_ref) {
                    ObjData::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let value = match self.heap.data(up_ref) {
                    ObjData::Upvalue(Upvalue::Open(stack_slot)) => self.stack[*stack_slot],
                    ObjData::Upvalue(Upvalue::Closed(value)) => *value,
                    _ => unreachable!(),
                };
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let slot = self.read_byte() as usize;
                let closure_ref = self.frames.last().unwrap().closure;
                let up_ref = match self.heap.data(closure_ref) {
                    ObjData::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let value = self.peek(0);
                let target_slot = match self.heap.data(up_ref) {
                    ObjData::Upvalue(Upvalue::Open(stack_slot)) => Some(*stack_slot),
                    ObjData::Upvalue(Upvalue::Closed(_)) => None,
                    _ => unreachable!(),
                };
                match target_slot {
                    Some(stack_slot) => self.stack[stack_slot] = value,
                    None => {
                        if let ObjData::Upvalue(upvalue) = self.heap.data_mut(up_ref) {
                            *upvalue = Upvalue::Closed(value);
                        }
                    }
                }
            }
            OpCode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            OpCode::Jump => {
                let offset = self.read_short();
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_short();
                if self.peek(0).is_falsy() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::Loop => {
                let offset = self.read_short();
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }

            OpCode::Call => {
                let argc = self.read_byte();
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            OpCode::Closure => {
                let function_ref = match self.read_constant() {
                    Value::Object(obj_ref) => obj_ref,
                    _ => unreachable!("Closure operand always indexes a Function constant"),
                };
                let upvalue_count = match self.heap.data(function_ref) {
                    ObjData::Function(f) => f.upvalue_count,
                    _ => unreachable!(),
                };
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_byte() as usize;
                    if is_local {
                        let base = self.frames.last().unwrap().base;
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        let closure_ref = self.frames.last().unwrap().closure;
                        let up_ref = match self.heap.data(closure_ref) {
                            ObjData::Closure(c) => c.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(up_ref);
                    }
                }
                let closure_ref = self.heap.alloc_closure(Closure {
                    function: function_ref,
                    upvalues,
                });
                self.push(Value::Object(closure_ref));
                self.collect_garbage();
            }
            OpCode::Return => {
                let result = self.pop();
                let base = self.frames.last().unwrap().base;
                self.close_upvalues(base);
                self.frames.pop();
                if self.frames.is_empty() {
                    self.pop();
                    return Ok(None);
                }
                self.stack.truncate(base);
                self.push(result);
            }
        }
        Ok(Some(()))
    }

    fn read_global_name(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Object(obj_ref) => obj_ref,
            _ => unreachable!("global name constants are always interned strings"),
        }
    }

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), String> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err("Operands must be numbers.".to_string()),
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), String> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err("Operands must be numbers.".to_string()),
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    /// `ADD` is overloaded over numbers and strings. Both operands must
    /// be strings to concatenate (the reference implementation only ever
    /// tested its right-hand operand; fixed here).
    fn binary_add(&mut self) -> Result<(), String> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
            }
            (Value::Object(a), Value::Object(b))
                if self.heap.kind(a) == ObjKind::String && self.heap.kind(b) == ObjKind::String =>
            {
                self.pop();
                self.pop();
                let mut bytes = self.heap.string_bytes(a).to_vec();
                bytes.extend_from_slice(self.heap.string_bytes(b));
                let result = self.heap.intern_string(&bytes);
                self.push(Value::Object(result));
                self.collect_garbage();
            }
            _ => return Err("Operands must be two numbers or two strings.".to_string()),
        }
        Ok(())
    }

    /// Reports a runtime error with a full frame trace, then resets the
    /// VM to an empty stack so the caller (typically the REPL) can keep
    /// going with a fresh expression.
    fn runtime_error(&mut self, reporter: &mut dyn Reporter, message: String) {
        let line = self.current_line();
        reporter.report(Report::runtime(message, line));

        for frame in self.frames.iter().rev() {
            let function_ref = self.function_of(frame.closure);
            let line = match self.heap.data(function_ref) {
                ObjData::Function(f) => f.chunk.line_at(frame.ip.saturating_sub(1)),
                _ => unreachable!(),
            };
            let name = match self.heap.data(function_ref) {
                ObjData::Function(f) => f.name,
                _ => unreachable!(),
            };
            match name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.as_str(name)),
                None => eprintln!("[line {}] in script", line),
            }
        }

        self.stack.clear();
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::Report;

    struct CollectingReporter {
        reports: Vec<Report>,
    }

    impl CollectingReporter {
        fn new() -> Self {
            CollectingReporter { reports: Vec::new() }
        }
    }

    impl Reporter for CollectingReporter {
        fn report(&mut self, report: Report) {
            self.reports.push(report);
        }
    }

    fn run_ok(source: &str) {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter::new();
        let result = vm.interpret(source, &mut reporter);
        assert!(
            result.is_ok(),
            "expected {:?} to succeed, reports: {:?}",
            source,
            reporter.reports.iter().map(|r| r.message.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn runs_arithmetic_and_prints() {
        run_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn string_interning_makes_equal_content_identical() {
        run_ok("var a = \"foo\"; var b = \"foo\"; print a == b;");
    }

    #[test]
    fn for_loop_accumulates() {
        run_ok("var x = 0; for (var i = 0; i < 3; i = i + 1) { x = x + i; } print x;");
    }

    #[test]
    fn if_else_takes_the_true_branch() {
        run_ok("if (!nil) { print \"a\"; } else { print \"b\"; }");
    }

    #[test]
    fn nested_blocks_respect_lexical_scope() {
        run_ok("{ var a = 1; { var a = 2; print a; } print a; }");
    }

    #[test]
    fn closures_capture_and_survive_enclosing_frame() {
        run_ok(
            "fun make() { var c = \"hi\"; fun inner() { print c; } return inner; } var f = make(); f();",
        );
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter::new();
        let result = vm.interpret("var x = 1; x();", &mut reporter);
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(reporter.reports[0].message.contains("Can only call"));
    }

    #[test]
    fn wrong_arity_is_a_runtime_error() {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter::new();
        let result = vm.interpret("fun f(a, b) { return a; } f(1);", &mut reporter);
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(reporter.reports[0].message.contains("Expected 2 arguments"));
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter::new();
        let result = vm.interpret("print undefined_name;", &mut reporter);
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(reporter.reports[0].message.contains("Undefined variable"));
    }
}
