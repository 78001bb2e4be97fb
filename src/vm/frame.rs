use super::value::Value;
use super::{VmError, VmResult};

/// Activation record of one call.
#[derive(Debug, Default)]
pub struct StackFrame {
    pub locals: Vec<Value>,
    pub operands: Vec<Value>,
    pub ip: usize,
}

impl StackFrame {
    pub fn new(ip: usize) -> Self {
        StackFrame { locals: Vec::new(), operands: Vec::new(), ip }
    }

    pub fn push(&mut self, value: Value) {
        self.operands.push(value);
    }

    /// Pop one operand; `op` names the instruction for the error message.
    pub fn pop(&mut self, op: &'static str) -> VmResult<Value> {
        self.operands.pop().ok_or(VmError::StackUnderflow { op })
    }

    pub fn peek(&self, op: &'static str) -> VmResult<&Value> {
        self.operands.last().ok_or(VmError::StackUnderflow { op })
    }

    /// Pop `count` operands, returned in pop order (top first).
    pub fn pop_many(&mut self, count: usize, op: &'static str) -> VmResult<Vec<Value>> {
        if self.operands.len() < count {
            return Err(VmError::StackUnderflow { op });
        }
        let mut values = self.operands.split_off(self.operands.len() - count);
        values.reverse();
        Ok(values)
    }

    /// Slots past the current length read as null.
    pub fn get_local(&self, slot: usize) -> Value {
        self.locals.get(slot).cloned().unwrap_or(Value::Null)
    }

    pub fn set_local(&mut self, slot: usize, value: Value) {
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, Value::Null);
        }
        self.locals[slot] = value;
    }

    /// Pre-size the local slots; never shrinks.
    pub fn reserve_locals(&mut self, size: usize) {
        if size > self.locals.len() {
            self.locals.resize(size, Value::Null);
        }
    }

    /// Every value this frame keeps alive.
    pub fn roots(&self) -> impl Iterator<Item = &Value> {
        self.locals.iter().chain(self.operands.iter())
    }
}
