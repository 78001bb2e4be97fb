use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::builtins;
use super::code::{Code, CompiledProgram, Opcode, Operand};
use super::frame::StackFrame;
use super::heap::{GcStats, Heap, HeapObject};
use super::value::{Builtin, Value};
use super::{GcPolicy, MachineConfig, VmError, VmResult};

/// One live call in a runtime backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    /// `None` while still in the bootstrap sequence
    pub function: Option<String>,
    /// Instruction the frame was executing
    pub address: usize,
    pub op: &'static str,
}

// ── Machine ──────────────────────────────────────────────────────────

/// One execution context. Globals, call stack and heap belong to the
/// instance; nothing is shared between machines.
pub struct Machine<'p, W: Write> {
    program: &'p CompiledProgram,
    globals: HashMap<String, Value>,
    frames: Vec<StackFrame>,
    heap: Heap,
    config: MachineConfig,
    out: W,
}

impl<'p, W: Write> Machine<'p, W> {
    pub fn new(program: &'p CompiledProgram, config: MachineConfig, out: W) -> Self {
        Machine {
            program,
            globals: HashMap::new(),
            frames: Vec::new(),
            heap: Heap::new(),
            config,
            out,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Text form of a value as `print` would write it.
    pub fn render(&self, value: &Value) -> String {
        self.heap.render(value)
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Live frames, innermost first. After a failed `run` this is the call
    /// stack at the faulting instruction.
    pub fn backtrace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let address = frame.ip.saturating_sub(1);
                TraceFrame {
                    function: self.program.function_at(address).map(str::to_string),
                    address,
                    op: self.program.code.get(address).map_or("?", |code| code.op.name()),
                }
            })
            .collect()
    }

    /// Execute from address 0 until the outermost frame exits.
    /// Returns whatever `main` returned.
    pub fn run(&mut self) -> VmResult<Value> {
        self.frames.clear();
        self.frames.push(StackFrame::new(0));
        loop {
            self.maybe_collect();
            if let Some(result) = self.step()? {
                self.out.flush()?;
                return Ok(result);
            }
        }
    }

    /// Run a full mark-sweep cycle rooted at every frame and global.
    pub fn collect_garbage(&mut self) -> GcStats {
        let roots = self.frames.iter().flat_map(StackFrame::roots).chain(self.globals.values());
        let stats = self.heap.collect(roots);
        debug!(live = stats.live, freed = stats.freed, "garbage collected");
        stats
    }

    fn maybe_collect(&mut self) {
        let due = match self.config.gc {
            GcPolicy::EveryInstruction => true,
            GcPolicy::Threshold(limit) => self.heap.allocated_since_collect() >= limit,
            GcPolicy::Manual => false,
        };
        if due {
            self.collect_garbage();
        }
    }

    fn frame(&mut self, op: &'static str) -> VmResult<&mut StackFrame> {
        self.frames.last_mut().ok_or(VmError::StackUnderflow { op })
    }

    /// Fetch and execute one instruction. `Some` once the machine halts.
    fn step(&mut self) -> VmResult<Option<Value>> {
        let program = self.program;
        let depth = self.frames.len();
        let frame = self.frame("fetch")?;
        let address = frame.ip;
        let code = program.code.get(address).ok_or(VmError::InvalidAddress { address })?;
        frame.ip += 1;
        trace!(address, op = code.op.name(), depth, "execute");
        self.execute(address, code)
    }

    fn execute(&mut self, address: usize, code: &Code) -> VmResult<Option<Value>> {
        let op = code.op.name();
        match code.op {
            Opcode::Exit => {
                let mut frame = self.frames.pop().ok_or(VmError::StackUnderflow { op })?;
                if self.frames.is_empty() {
                    return Ok(Some(frame.operands.pop().unwrap_or(Value::Null)));
                }
            }
            Opcode::Return => {
                let mut frame = self.frames.pop().ok_or(VmError::StackUnderflow { op })?;
                let result = frame.operands.pop().unwrap_or(Value::Null);
                match self.frames.last_mut() {
                    Some(caller) => caller.push(result),
                    None => return Ok(Some(result)),
                }
            }
            Opcode::Call => {
                let argc = code.index(address)?;
                self.call(argc)?;
            }
            Opcode::Alloca => {
                let size = code.index(address)?;
                self.frame(op)?.reserve_locals(size);
            }

            Opcode::GetGlobal => {
                let value = self.lookup_global(code.text(address)?)?;
                self.frame(op)?.push(value);
            }
            Opcode::SetGlobal => {
                let name = code.text(address)?;
                let value = self.frame(op)?.peek(op)?.clone();
                self.globals.insert(name.to_string(), value);
            }
            Opcode::GetLocal => {
                let slot = code.index(address)?;
                let frame = self.frame(op)?;
                let value = frame.get_local(slot);
                frame.push(value);
            }
            Opcode::SetLocal => {
                let slot = code.index(address)?;
                let frame = self.frame(op)?;
                let value = frame.peek(op)?.clone();
                frame.set_local(slot, value);
            }

            Opcode::Print => {
                let count = code.index(address)?;
                let values = self.frame(op)?.pop_many(count, op)?;
                let text: String = values.iter().map(|v| self.heap.render(v)).collect();
                self.out.write_all(text.as_bytes())?;
            }
            Opcode::PrintLine => writeln!(self.out)?,

            Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide | Opcode::Modulo => {
                let frame = self.frame(op)?;
                let right = frame.pop(op)?;
                let left = frame.pop(op)?;
                frame.push(arithmetic(address, code.op, left, right)?);
            }
            Opcode::Absolute | Opcode::ReverseSign => {
                let frame = self.frame(op)?;
                let n = match frame.pop(op)? {
                    Value::Number(n) => n,
                    other => return Err(VmError::TypeMismatch { op, expected: "number", found: other.kind_name() }),
                };
                let result = if code.op == Opcode::Absolute { n.abs() } else { -n };
                frame.push(Value::Number(result));
            }
            Opcode::LogicalOr | Opcode::LogicalAnd => {
                let frame = self.frame(op)?;
                let right = frame.pop(op)?.is_truthy();
                let left = frame.pop(op)?.is_truthy();
                let result = if code.op == Opcode::LogicalOr { left || right } else { left && right };
                frame.push(Value::Boolean(result));
            }
            Opcode::Equal | Opcode::NotEqual => {
                let frame = self.frame(op)?;
                let right = frame.pop(op)?;
                let left = frame.pop(op)?;
                let equal = left == right;
                frame.push(Value::Boolean(if code.op == Opcode::Equal { equal } else { !equal }));
            }
            Opcode::LessThan | Opcode::GreaterThan | Opcode::LessOrEqual | Opcode::GreaterOrEqual => {
                let frame = self.frame(op)?;
                let right = frame.pop(op)?;
                let left = frame.pop(op)?;
                frame.push(Value::Boolean(compare(address, code.op, &left, &right)?));
            }

            Opcode::Jump => {
                let target = code.index(address)?;
                self.frame(op)?.ip = target;
            }
            Opcode::ConditionJump => {
                let target = code.index(address)?;
                let frame = self.frame(op)?;
                if !frame.pop(op)?.is_truthy() {
                    frame.ip = target;
                }
            }

            Opcode::PushNull => self.frame(op)?.push(Value::Null),
            Opcode::PushBoolean => {
                let Operand::Boolean(b) = code.operand else {
                    return Err(code.malformed(address));
                };
                self.frame(op)?.push(Value::Boolean(b));
            }
            Opcode::PushNumber => {
                let Operand::Number(n) = code.operand else {
                    return Err(code.malformed(address));
                };
                self.frame(op)?.push(Value::Number(n));
            }
            Opcode::PushString => {
                let text = code.text(address)?.to_string();
                self.frame(op)?.push(Value::String(text));
            }
            Opcode::PushArray => {
                let count = code.index(address)?;
                let items = self.frame(op)?.pop_many(count, op)?;
                let handle = self.heap.alloc(HeapObject::Array(items));
                self.frame(op)?.push(Value::Array(handle));
            }
            Opcode::PushMap => {
                let count = code.index(address)?;
                let frame = self.frame(op)?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let value = frame.pop(op)?;
                    match frame.pop(op)? {
                        Value::String(key) => {
                            entries.insert(key, value);
                        }
                        other => {
                            return Err(VmError::TypeMismatch { op, expected: "string key", found: other.kind_name() });
                        }
                    }
                }
                let handle = self.heap.alloc(HeapObject::Collection(entries));
                self.frame(op)?.push(Value::Collection(handle));
            }

            Opcode::GetElement => {
                let frame = self.frame(op)?;
                let index = frame.pop(op)?;
                let collection = frame.pop(op)?;
                let value = self.get_element(&collection, &index)?;
                self.frame(op)?.push(value);
            }
            Opcode::SetElement => {
                let frame = self.frame(op)?;
                let index = frame.pop(op)?;
                let collection = frame.pop(op)?;
                let value = frame.peek(op)?.clone();
                self.set_element(&collection, index, value)?;
            }
            Opcode::PopOperand => {
                self.frame(op)?.pop(op)?;
            }
        }
        Ok(None)
    }

    /// Function table first, then builtins, then global variables.
    fn lookup_global(&self, name: &str) -> VmResult<Value> {
        if let Some(address) = self.program.function_address(name) {
            return Ok(Value::Function(address));
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return Ok(Value::Builtin(builtin));
        }
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::UndefinedGlobal { name: name.to_string() })
    }

    fn call(&mut self, argc: usize) -> VmResult<()> {
        let depth = self.frames.len();
        let frame = self.frame("Call")?;
        let callee = frame.pop("Call")?;
        let args = frame.pop_many(argc, "Call")?;
        match callee {
            Value::Function(address) => {
                if depth >= self.config.max_call_depth {
                    return Err(VmError::CallDepthExceeded { limit: self.config.max_call_depth });
                }
                let mut callee_frame = StackFrame::new(address);
                callee_frame.locals = args;
                self.frames.push(callee_frame);
            }
            Value::Builtin(builtin) => {
                let result = builtins::call(builtin, args, &mut self.heap)?;
                self.frame("Call")?.push(result);
            }
            other => {
                warn!(callee = other.kind_name(), argc, "call on a non-callable value yields null");
                frame.push(Value::Null);
            }
        }
        Ok(())
    }

    fn get_element(&self, collection: &Value, index: &Value) -> VmResult<Value> {
        match collection {
            Value::Array(handle) => {
                let i = array_index(index)?;
                match self.heap.get(*handle)? {
                    HeapObject::Array(items) => Ok(items.get(i).cloned().unwrap_or(Value::Null)),
                    HeapObject::Collection(_) => Err(VmError::DanglingReference { handle: handle.index() }),
                }
            }
            Value::Collection(handle) => {
                let key = collection_key(index)?;
                match self.heap.get(*handle)? {
                    HeapObject::Collection(entries) => Ok(entries.get(key).cloned().unwrap_or(Value::Null)),
                    HeapObject::Array(_) => Err(VmError::DanglingReference { handle: handle.index() }),
                }
            }
            other => Err(VmError::NotIndexable { found: other.kind_name() }),
        }
    }

    fn set_element(&mut self, collection: &Value, index: Value, value: Value) -> VmResult<()> {
        match collection {
            Value::Array(handle) => {
                let i = array_index(&index)?;
                let HeapObject::Array(items) = self.heap.get_mut(*handle)? else {
                    return Err(VmError::DanglingReference { handle: handle.index() });
                };
                let len = items.len();
                match i.cmp(&len) {
                    std::cmp::Ordering::Less => items[i] = value,
                    std::cmp::Ordering::Equal => items.push(value),
                    std::cmp::Ordering::Greater => return Err(VmError::IndexOutOfBounds { index: i, len }),
                }
            }
            Value::Collection(handle) => {
                let key = collection_key(&index)?.to_string();
                let HeapObject::Collection(entries) = self.heap.get_mut(*handle)? else {
                    return Err(VmError::DanglingReference { handle: handle.index() });
                };
                entries.insert(key, value);
            }
            other => return Err(VmError::NotIndexable { found: other.kind_name() }),
        }
        Ok(())
    }
}

fn array_index(index: &Value) -> VmResult<usize> {
    match index {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && n.is_finite() => Ok(*n as usize),
        Value::Number(n) => Err(VmError::InvalidIndex { found: format!("number {}", n) }),
        other => Err(VmError::InvalidIndex { found: other.kind_name().to_string() }),
    }
}

fn collection_key(index: &Value) -> VmResult<&str> {
    match index {
        Value::String(key) => Ok(key),
        other => Err(VmError::InvalidIndex { found: other.kind_name().to_string() }),
    }
}

fn arithmetic(address: usize, op: Opcode, left: Value, right: Value) -> VmResult<Value> {
    let (x, y) = match (&left, &right) {
        (Value::Number(x), Value::Number(y)) => (*x, *y),
        (Value::Number(_), other) | (other, _) => {
            return Err(VmError::TypeMismatch { op: op.name(), expected: "number", found: other.kind_name() });
        }
    };
    let result = match op {
        Opcode::Add => x + y,
        Opcode::Subtract => x - y,
        Opcode::Multiply => x * y,
        Opcode::Divide if y == 0.0 => return Err(VmError::DivisionByZero),
        Opcode::Divide => x / y,
        Opcode::Modulo if y == 0.0 => return Err(VmError::ModuloByZero),
        Opcode::Modulo => x % y,
        _ => return Err(VmError::MalformedInstruction { address, op: op.name() }),
    };
    Ok(Value::Number(result))
}

fn compare(address: usize, op: Opcode, left: &Value, right: &Value) -> VmResult<bool> {
    let ordering = match (left, right) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(_), other) | (Value::String(_), other) | (other, _) => {
            return Err(VmError::TypeMismatch {
                op: op.name(),
                expected: "two numbers or two strings",
                found: other.kind_name(),
            });
        }
    };
    // NaN compares false under every ordering
    let Some(ordering) = ordering else { return Ok(false) };
    Ok(match op {
        Opcode::LessThan => ordering.is_lt(),
        Opcode::GreaterThan => ordering.is_gt(),
        Opcode::LessOrEqual => ordering.is_le(),
        Opcode::GreaterOrEqual => ordering.is_ge(),
        _ => return Err(VmError::MalformedInstruction { address, op: op.name() }),
    })
}
