use std::fmt;

use crate::table::Table;
use crate::value::{Closure, Function, Native, ObjData, ObjKind, Upvalue, Value};

const GROW_FACTOR: usize = 2;
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// A stable handle into the heap arena. Stands in for the owned pointer
/// this crate's lineage normally threads through its intrusive object
/// list: instead of a raw pointer chain, every allocation lives in one
/// `Vec` slot and is referred to by its index for as long as it is live.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(usize);

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

struct Slot {
    data: ObjData,
    marked: bool,
    size: usize,
}

/// Owns every heap object ever allocated by one VM. Allocation charges
/// `bytes_allocated`; collection is triggered by the caller (the VM,
/// around allocation points) once that counter crosses `next_gc`.
pub struct Heap {
    arena: Vec<Option<Slot>>,
    free_list: Vec<usize>,
    bytes_allocated: usize,
    next_gc: usize,
    strings: Table,
    gray_stack: Vec<ObjRef>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            arena: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            strings: Table::new(),
            gray_stack: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    fn alloc(&mut self, data: ObjData, size: usize) -> ObjRef {
        self.bytes_allocated += size;
        let slot = Slot {
            data,
            marked: false,
            size,
        };
        if let Some(index) = self.free_list.pop() {
            self.arena[index] = Some(slot);
            ObjRef(index)
        } else {
            self.arena.push(Some(slot));
            ObjRef(self.arena.len() - 1)
        }
    }

    fn slot(&self, obj_ref: ObjRef) -> &Slot {
        self.arena[obj_ref.0]
            .as_ref()
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    fn slot_mut(&mut self, obj_ref: ObjRef) -> &mut Slot {
        self.arena[obj_ref.0]
            .as_mut()
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    pub fn data(&self, obj_ref: ObjRef) -> &ObjData {
        &self.slot(obj_ref).data
    }

    pub fn data_mut(&mut self, obj_ref: ObjRef) -> &mut ObjData {
        &mut self.slot_mut(obj_ref).data
    }

    pub fn kind(&self, obj_ref: ObjRef) -> ObjKind {
        self.slot(obj_ref).data.kind()
    }

    // --- strings ---------------------------------------------------

    pub fn string_bytes(&self, obj_ref: ObjRef) -> &[u8] {
        match &self.slot(obj_ref).data {
            ObjData::String(bytes, _) => bytes,
            _ => panic!("ObjRef does not point to a string"),
        }
    }

    pub fn string_hash(&self, obj_ref: ObjRef) -> u32 {
        match &self.slot(obj_ref).data {
            ObjData::String(_, hash) => *hash,
            _ => panic!("ObjRef does not point to a string"),
        }
    }

    pub fn as_str(&self, obj_ref: ObjRef) -> &str {
        std::str::from_utf8(self.string_bytes(obj_ref)).unwrap_or("<invalid utf8>")
    }

    /// Interns `bytes`, returning the canonical `String` object for that
    /// content. Content-equal strings always resolve to the same
    /// `ObjRef`, which is what lets `Value::Object` equality and
    /// `OP_EQUAL` compare strings by identity.
    pub fn intern_string(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = fnv1a(bytes);
        if let Some(existing) = self.strings.find_interned(hash, |obj_ref| {
            self.string_bytes(obj_ref) == bytes
        }) {
            return existing;
        }
        let owned: Box<[u8]> = bytes.into();
        let size = owned.len() + std::mem::size_of::<ObjData>();
        let obj_ref = self.alloc(ObjData::String(owned, hash), size);
        self.strings.set(obj_ref, hash, Value::Nil);
        obj_ref
    }

    // --- other allocations -------------------------------------------

    pub fn alloc_function(&mut self, function: Function) -> ObjRef {
        let size = std::mem::size_of::<Function>();
        self.alloc(ObjData::Function(function), size)
    }

    pub fn alloc_native(&mut self, native: Native) -> ObjRef {
        let size = std::mem::size_of::<Native>();
        self.alloc(ObjData::Native(native), size)
    }

    pub fn alloc_closure(&mut self, closure: Closure) -> ObjRef {
        let size = std::mem::size_of::<Closure>() + closure.upvalues.len() * 8;
        self.alloc(ObjData::Closure(closure), size)
    }

    pub fn alloc_upvalue(&mut self, upvalue: Upvalue) -> ObjRef {
        let size = std::mem::size_of::<Upvalue>();
        self.alloc(ObjData::Upvalue(upvalue), size)
    }

    /// Renders a value the way `print` and string concatenation want it:
    /// objects resolved through the heap, strings unquoted.
    pub fn display_value(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => crate::value::format_number(*n),
            Value::Object(obj_ref) => match &self.slot(*obj_ref).data {
                ObjData::String(bytes, _) => {
                    String::from_utf8_lossy(bytes).into_owned()
                }
                ObjData::Function(function) => match function.name {
                    Some(name) => format!("<fn {}>", self.as_str(name)),
                    None => "<script>".to_string(),
                },
                ObjData::Native(native) => format!("<native fn {}>", native.name),
                ObjData::Closure(closure) => {
                    let function = match &self.slot(closure.function).data {
                        ObjData::Function(f) => f,
                        _ => unreachable!("Closure.function always points to a Function"),
                    };
                    match function.name {
                        Some(name) => format!("<fn {}>", self.as_str(name)),
                        None => "<script>".to_string(),
                    }
                }
                ObjData::Upvalue(_) => "<upvalue>".to_string(),
            },
        }
    }

    // --- garbage collection -------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Object(obj_ref) = value {
            self.mark_object(obj_ref);
        }
    }

    pub fn mark_object(&mut self, obj_ref: ObjRef) {
        let slot = self.arena[obj_ref.0]
            .as_mut()
            .expect("dangling ObjRef during mark");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray_stack.push(obj_ref);
    }

    /// Pops the gray-stack worklist until empty, "blackening" each object
    /// by marking whatever it references. Roots must already have been
    /// pushed via `mark_object`/`mark_value` before calling this.
    pub fn trace_references(&mut self) {
        while let Some(obj_ref) = self.gray_stack.pop() {
            self.blacken(obj_ref);
        }
    }

    fn blacken(&mut self, obj_ref: ObjRef) {
        match &self.arena[obj_ref.0].as_ref().unwrap().data {
            ObjData::String(..) | ObjData::Native(_) => {}
            ObjData::Function(function) => {
                let name = function.name;
                let constants: Vec<Value> = function.chunk.constants.clone();
                if let Some(name) = name {
                    self.mark_object(name);
                }
                for constant in constants {
                    self.mark_value(constant);
                }
            }
            ObjData::Closure(closure) => {
                let function = closure.function;
                let upvalues = closure.upvalues.clone();
                self.mark_object(function);
                for upvalue in upvalues {
                    self.mark_object(upvalue);
                }
            }
            ObjData::Upvalue(upvalue) => {
                if let Upvalue::Closed(value) = upvalue {
                    let value = *value;
                    self.mark_value(value);
                }
            }
        }
    }

    /// Frees every unmarked object and clears the mark bit on survivors.
    /// Must run after `trace_references` has finished, before any new
    /// roots are considered. The caller (the VM) marks all roots first.
    pub fn sweep(&mut self) {
        for index in 0..self.arena.len() {
            let Some(slot) = self.arena[index].as_mut() else {
                continue;
            };
            if slot.marked {
                slot.marked = false;
                continue;
            }
            let size = slot.size;
            self.arena[index] = None;
            self.free_list.push(index);
            self.bytes_allocated -= size;
        }
        self.strings.retain(|obj_ref| {
            self.arena[obj_ref.0].is_some()
        });
        self.next_gc = self.bytes_allocated.max(INITIAL_GC_THRESHOLD) * GROW_FACTOR;
    }
}

pub fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 2166136261;
    const PRIME: u32 = 16777619;
    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_handle_for_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern_string(b"hello");
        let b = heap.intern_string(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_content_interns_to_distinct_handles() {
        let mut heap = Heap::new();
        let a = heap.intern_string(b"hello");
        let b = heap.intern_string(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn unmarked_object_is_freed_by_sweep() {
        let mut heap = Heap::new();
        let dead = heap.intern_string(b"dead");
        let alive = heap.intern_string(b"alive");
        heap.mark_object(alive);
        heap.trace_references();
        heap.sweep();
        assert!(heap.arena[alive.0].is_some());
        let _ = dead;
    }

    #[test]
    fn closure_blackening_marks_function_and_upvalues() {
        let mut heap = Heap::new();
        let name = heap.intern_string(b"f");
        let function = Function::new(Some(name), 0);
        let function_ref = heap.alloc_function(function);
        let upvalue_ref = heap.alloc_upvalue(Upvalue::Closed(Value::Number(1.0)));
        let closure_ref = heap.alloc_closure(Closure {
            function: function_ref,
            upvalues: vec![upvalue_ref],
        });
        heap.mark_object(closure_ref);
        heap.trace_references();
        heap.sweep();
        assert!(heap.arena[function_ref.0].is_some());
        assert!(heap.arena[upvalue_ref.0].is_some());
        assert!(heap.arena[name.0].is_some());
    }

    #[test]
    fn heap_growth_doubles_threshold_after_sweep() {
        let mut heap = Heap::new();
        heap.intern_string(b"x");
        heap.sweep();
        assert!(heap.next_gc >= INITIAL_GC_THRESHOLD);
    }
}
