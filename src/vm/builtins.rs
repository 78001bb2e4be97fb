use super::heap::{Heap, HeapObject};
use super::value::{Builtin, Value};
use super::{VmError, VmResult};

/// Invoke a native function. `args` are in call order.
pub fn call(builtin: Builtin, args: Vec<Value>, heap: &mut Heap) -> VmResult<Value> {
    match builtin {
        Builtin::Length => length(&args, heap),
        Builtin::Push => push(args, heap),
        Builtin::Pop => pop(&args, heap),
        Builtin::Erase => erase(&args, heap),
        Builtin::Sqrt => sqrt(&args),
    }
}

fn length(args: &[Value], heap: &Heap) -> VmResult<Value> {
    let count = match args {
        [Value::Array(h)] | [Value::Collection(h)] => match heap.get(*h)? {
            HeapObject::Array(items) => items.len(),
            HeapObject::Collection(entries) => entries.len(),
        },
        _ => 0,
    };
    Ok(Value::Number(count as f64))
}

fn push(args: Vec<Value>, heap: &mut Heap) -> VmResult<Value> {
    let [target, item]: [Value; 2] = match args.try_into() {
        Ok(pair) => pair,
        Err(_) => return Ok(Value::Null),
    };
    let Value::Array(handle) = &target else {
        return Ok(Value::Null);
    };
    if let HeapObject::Array(items) = heap.get_mut(*handle)? {
        items.push(item);
    }
    Ok(target)
}

fn pop(args: &[Value], heap: &mut Heap) -> VmResult<Value> {
    let [Value::Array(handle)] = args else {
        return Ok(Value::Null);
    };
    match heap.get_mut(*handle)? {
        HeapObject::Array(items) => Ok(items.pop().unwrap_or(Value::Null)),
        HeapObject::Collection(_) => Ok(Value::Null),
    }
}

fn erase(args: &[Value], heap: &mut Heap) -> VmResult<Value> {
    let [Value::Collection(handle), Value::String(key)] = args else {
        return Ok(Value::Null);
    };
    match heap.get_mut(*handle)? {
        HeapObject::Collection(entries) => Ok(entries.remove(key).unwrap_or(Value::Null)),
        HeapObject::Array(_) => Ok(Value::Null),
    }
}

fn sqrt(args: &[Value]) -> VmResult<Value> {
    match args {
        [Value::Number(n)] => Ok(Value::Number(n.sqrt())),
        [other] => Err(VmError::Builtin {
            name: "sqrt",
            message: format!("expected a number, found {}", other.kind_name()),
        }),
        _ => Err(VmError::Builtin {
            name: "sqrt",
            message: format!("expected 1 argument, got {}", args.len()),
        }),
    }
}
