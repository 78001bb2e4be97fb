use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::value::{format_number, Value};
use super::{VmError, VmResult};

/// Handle to an array or collection owned by a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef(u32);

impl HeapRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Array(Vec<Value>),
    Collection(BTreeMap<String, Value>),
}

impl HeapObject {
    fn children(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            HeapObject::Array(items) => Box::new(items.iter()),
            HeapObject::Collection(entries) => Box::new(entries.values()),
        }
    }
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    object: Option<HeapObject>,
}

/// Result of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    pub live: usize,
    pub freed: usize,
}

// ── Heap ─────────────────────────────────────────────────────────────

/// Arena of heap objects with a free list, reclaimed by mark-sweep.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    allocated_since_collect: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    pub fn alloc(&mut self, object: HeapObject) -> HeapRef {
        self.live += 1;
        self.allocated_since_collect += 1;
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Slot { marked: false, object: Some(object) };
            return HeapRef(index);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { marked: false, object: Some(object) });
        HeapRef(index)
    }

    pub fn get(&self, handle: HeapRef) -> VmResult<&HeapObject> {
        self.slots
            .get(handle.index())
            .and_then(|slot| slot.object.as_ref())
            .ok_or(VmError::DanglingReference { handle: handle.index() })
    }

    pub fn get_mut(&mut self, handle: HeapRef) -> VmResult<&mut HeapObject> {
        self.slots
            .get_mut(handle.index())
            .and_then(|slot| slot.object.as_mut())
            .ok_or(VmError::DanglingReference { handle: handle.index() })
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn is_live(&self, handle: HeapRef) -> bool {
        self.slots.get(handle.index()).is_some_and(|slot| slot.object.is_some())
    }

    pub fn allocated_since_collect(&self) -> usize {
        self.allocated_since_collect
    }

    /// Mark everything reachable from `roots`, then free the rest.
    pub fn collect<'a>(&mut self, roots: impl IntoIterator<Item = &'a Value>) -> GcStats {
        let mut worklist: Vec<HeapRef> = roots.into_iter().filter_map(Value::heap_ref).collect();

        while let Some(handle) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(handle.index()) else { continue };
            if slot.marked || slot.object.is_none() {
                continue;
            }
            slot.marked = true;
            if let Some(object) = &slot.object {
                worklist.extend(object.children().filter_map(Value::heap_ref));
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.marked {
                slot.marked = false;
            } else if slot.object.take().is_some() {
                self.free.push(index as u32);
                freed += 1;
            }
        }

        self.live -= freed;
        self.allocated_since_collect = 0;
        GcStats { live: self.live, freed }
    }

    // ── Rendering ────────────────────────────────────────────────────

    /// Text form used by `print`. Top-level strings are written raw.
    ///
    /// Walks an explicit stack so nesting depth is bounded by memory,
    /// not by the host call stack.
    pub fn render(&self, value: &Value) -> String {
        if let Value::String(s) = value {
            return s.clone();
        }
        let mut out = String::new();
        let mut open: HashSet<HeapRef> = HashSet::new();
        let mut pending = vec![Pending::Value(value)];

        while let Some(item) = pending.pop() {
            match item {
                Pending::Text(text) => out.push_str(text),
                Pending::Key(key) => {
                    out.push_str(&format!("{:?}: ", key));
                }
                Pending::Close(handle, bracket) => {
                    open.remove(&handle);
                    out.push(bracket);
                }
                Pending::Value(value) => {
                    let Some(handle) = value.heap_ref() else {
                        render_scalar(value, &mut out);
                        continue;
                    };
                    let is_array = matches!(value, Value::Array(_));
                    if open.contains(&handle) {
                        out.push_str(if is_array { "[...]" } else { "{...}" });
                        continue;
                    }
                    let Ok(object) = self.get(handle) else {
                        out.push_str(&format!("<dangling {}>", handle));
                        continue;
                    };
                    open.insert(handle);
                    let mut children = Vec::new();
                    match object {
                        HeapObject::Array(items) => {
                            out.push('[');
                            for (i, item) in items.iter().enumerate() {
                                if i > 0 {
                                    children.push(Pending::Text(", "));
                                }
                                children.push(Pending::Value(item));
                            }
                            children.push(Pending::Close(handle, ']'));
                        }
                        HeapObject::Collection(entries) => {
                            out.push('{');
                            for (i, (key, item)) in entries.iter().enumerate() {
                                if i > 0 {
                                    children.push(Pending::Text(", "));
                                }
                                children.push(Pending::Key(key.as_str()));
                                children.push(Pending::Value(item));
                            }
                            children.push(Pending::Close(handle, '}'));
                        }
                    }
                    pending.extend(children.into_iter().rev());
                }
            }
        }
        out
    }
}

/// Unit of work for [`Heap::render`].
enum Pending<'a> {
    Value(&'a Value),
    Key(&'a str),
    Text(&'static str),
    /// Closing bracket; the handle leaves the open set.
    Close(HeapRef, char),
}

fn render_scalar(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&format_number(*n)),
        Value::String(s) => out.push_str(&format!("{:?}", s)),
        Value::Function(address) => out.push_str(&format!("<function @{}>", address)),
        Value::Builtin(b) => out.push_str(&format!("<builtin {}>", b)),
        Value::Array(_) | Value::Collection(_) => {}
    }
}
