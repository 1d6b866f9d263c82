//! The stack-machine interpreter: per-instance symbol tables, the
//! host-function registry, the funcref table, and the `run` dispatch
//! loop.
//!
//! *Execution model.* A call frame carries a program counter, a flat
//! locals vector (params followed by declared locals), and the
//! value-stack height a `return` must unwind to. The value and call
//! stacks live behind a `RefCell` because a host function registered
//! against this interpreter may call back into `run` — on this same
//! instance (recursion) or on a different instance sharing the same
//! memory store (cross-module bridging). Every borrow is scoped to a
//! single field access and dropped before invoking a host callable, so
//! a legitimate reentrant call never trips a double-borrow panic.
//!
//! *Control flow.* `block`/`loop`/`end` are markers only; `br`/`br_if`
//! resolve their target by scanning the flat instruction body rather
//! than through a precomputed jump table, exactly as laid out in the
//! component design this module implements.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{Immediate, Module, Opcode, Value, ValueType};
use crate::error::{Error, Result};
use crate::memory::MemoryStore;

/// Construction-time bounds on the value and call stacks. The closest
/// thing to a config file this embeddable interpreter has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterConfig {
    pub value_stack_limit: usize,
    pub call_stack_limit: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            value_stack_limit: 64 * 1024,
            call_stack_limit: 1024,
        }
    }
}

type HostFn = Rc<dyn Fn(&[Value]) -> Result<Value>>;

#[derive(Clone)]
struct HostEntry {
    func: HostFn,
    param_types: Vec<ValueType>,
    result_types: Vec<ValueType>,
}

struct Frame {
    pc: usize,
    locals: Vec<Value>,
    return_height: usize,
    func_index: usize,
}

#[derive(Default)]
struct State {
    value_stack: Vec<Value>,
    call_stack: Vec<Frame>,
}

pub struct Interpreter {
    module: Rc<Module>,
    store: Rc<MemoryStore>,
    config: InterpreterConfig,
    func_map: HashMap<String, usize>,
    string_handles: HashMap<String, i32>,
    table: Vec<Option<usize>>,
    host_registry: RefCell<HashMap<String, HostEntry>>,
    state: RefCell<State>,
}

impl Interpreter {
    pub fn new(module: Rc<Module>, store: Rc<MemoryStore>) -> Result<Self> {
        Self::with_config(module, store, InterpreterConfig::default())
    }

    pub fn with_config(
        module: Rc<Module>,
        store: Rc<MemoryStore>,
        config: InterpreterConfig,
    ) -> Result<Self> {
        let mut func_map = HashMap::new();
        for (i, f) in module.functions.iter().enumerate() {
            func_map.insert(f.name.clone(), i);
        }

        let mut string_handles = HashMap::new();
        for s in &module.strings {
            let mut bytes = Vec::with_capacity(4 + s.bytes.len());
            bytes.extend_from_slice(&(s.bytes.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&s.bytes);
            let handle = store.alloc_readonly(&bytes)?;
            string_handles.insert(s.alias.clone(), handle);
        }

        let table = Self::build_table(&module, &func_map);

        tracing::debug!(
            functions = module.functions.len(),
            imports = module.imports.len(),
            "interpreter instantiated"
        );

        Ok(Interpreter {
            module,
            store,
            config,
            func_map,
            string_handles,
            table,
            host_registry: RefCell::new(HashMap::new()),
            state: RefCell::new(State::default()),
        })
    }

    fn build_table(module: &Module, func_map: &HashMap<String, usize>) -> Vec<Option<usize>> {
        let t = match &module.table {
            Some(t) => t,
            None => return Vec::new(),
        };
        let mut slots: Vec<Option<usize>> = vec![None; t.min as usize];
        for elem in &module.elements {
            for (i, fname) in elem.function_names.iter().enumerate() {
                let slot = elem.offset + i as i32;
                if slot < 0 || slot as usize >= slots.len() {
                    // Out-of-range element targets are silently
                    // skipped; they surface later as indirect-call
                    // faults (UndefinedElement/UninitializedElement).
                    continue;
                }
                if let Some(&fi) = func_map.get(fname) {
                    slots[slot as usize] = Some(fi);
                }
            }
        }
        slots
    }

    pub fn memory_store(&self) -> &MemoryStore {
        &self.store
    }

    /// Registers `callable` against every import matching
    /// `(module_name, field_name)`, validating the declared signature.
    pub fn register_host_function<F>(
        &self,
        module_name: &str,
        field_name: &str,
        callable: F,
        param_types: Vec<ValueType>,
        result_types: Vec<ValueType>,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        let callable: HostFn = Rc::new(callable);
        for import in self
            .module
            .imports
            .iter()
            .filter(|i| i.module == module_name && i.field == field_name)
        {
            if import.param_types != param_types || import.result_types != result_types {
                return Err(Error::ImportSignatureMismatch {
                    module: module_name.to_string(),
                    field: field_name.to_string(),
                    declared_params: import.param_types.clone(),
                    declared_results: import.result_types.clone(),
                    registered_params: param_types.clone(),
                    registered_results: result_types.clone(),
                });
            }
            let entry = HostEntry {
                func: callable.clone(),
                param_types: param_types.clone(),
                result_types: result_types.clone(),
            };
            if let Some(alias) = &import.alias {
                self.host_registry
                    .borrow_mut()
                    .insert(alias.clone(), entry.clone());
            }
            let qualified = format!("{}.{}", import.module, import.field);
            self.host_registry.borrow_mut().insert(qualified, entry);
        }
        Ok(())
    }

    /// Runs `name` to completion with `args`, returning its result (or
    /// `Value::Void` if it declares none). Reentrant: may be called
    /// from within a host function registered on this same instance.
    pub fn run(&self, name: &str, args: &[Value]) -> Result<Value> {
        let func_index = *self
            .func_map
            .get(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        self.invoke(func_index, args)
    }

    fn invoke(&self, func_index: usize, args: &[Value]) -> Result<Value> {
        let func = &self.module.functions[func_index];
        if args.len() != func.param_types.len() {
            return Err(Error::ArgumentMismatch {
                expected: func.param_types.len(),
                got: args.len(),
            });
        }
        let has_result = !func.result_types.is_empty();
        let entry_depth = self.state.borrow().call_stack.len();
        tracing::debug!(callee = %func.name, "run");
        self.push_frame(func_index, args.to_vec())?;
        self.run_until_depth(entry_depth, has_result)
    }

    fn push_frame(&self, func_index: usize, args: Vec<Value>) -> Result<()> {
        let func = &self.module.functions[func_index];
        let mut locals = args;
        locals.extend(func.local_types.iter().map(|t| Value::default_for(*t)));

        let mut state = self.state.borrow_mut();
        if state.call_stack.len() >= self.config.call_stack_limit {
            return Err(Error::CallStackOverflow(self.config.call_stack_limit));
        }
        let return_height = state.value_stack.len();
        state.call_stack.push(Frame {
            pc: 0,
            locals,
            return_height,
            func_index,
        });
        Ok(())
    }

    fn run_until_depth(&self, entry_depth: usize, has_result: bool) -> Result<Value> {
        loop {
            let frame_done = {
                let state = self.state.borrow();
                let frame = state.call_stack.last().ok_or_else(|| {
                    Error::Internal("call stack unexpectedly empty during dispatch".to_string())
                })?;
                frame.pc >= self.module.functions[frame.func_index].body.len()
            };
            if frame_done {
                self.handle_return()?;
                if self.state.borrow().call_stack.len() <= entry_depth {
                    break;
                }
                continue;
            }
            self.step()?;
        }
        if has_result {
            let mut state = self.state.borrow_mut();
            Ok(state.value_stack.pop().unwrap_or(Value::Void))
        } else {
            Ok(Value::Void)
        }
    }

    fn handle_return(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let frame = state.call_stack.pop().ok_or_else(|| {
            Error::Internal("call stack unexpectedly empty on return".to_string())
        })?;
        let func = &self.module.functions[frame.func_index];
        let result = if !func.result_types.is_empty() {
            Some(state.value_stack.pop().ok_or(Error::StackUnderflow)?)
        } else {
            None
        };
        state.value_stack.truncate(frame.return_height);
        if let Some(v) = result {
            state.value_stack.push(v);
        }
        Ok(())
    }

    fn step(&self) -> Result<()> {
        let (opcode, immediate, func_index, instr_index) = {
            let mut state = self.state.borrow_mut();
            let frame = state.call_stack.last_mut().ok_or_else(|| {
                Error::Internal("call stack unexpectedly empty during step".to_string())
            })?;
            let idx = frame.pc;
            let func = &self.module.functions[frame.func_index];
            let instr = func.body[idx].clone();
            frame.pc += 1;
            (instr.opcode, instr.immediate, frame.func_index, idx)
        };
        tracing::trace!(?opcode, pc = instr_index, "dispatch");
        self.execute(opcode, immediate, func_index, instr_index)
    }

    fn execute(
        &self,
        opcode: Opcode,
        immediate: Immediate,
        func_index: usize,
        instr_index: usize,
    ) -> Result<()> {
        use Opcode::*;
        match opcode {
            I32Const => {
                self.push_value(Value::I32(imm_i32(&immediate)))?;
            }
            I64Const => {
                self.push_value(Value::I64(imm_i64(&immediate)))?;
            }
            F32Const => {
                self.push_value(Value::F32(imm_f32(&immediate)))?;
            }
            F64Const => {
                self.push_value(Value::F64(imm_f64(&immediate)))?;
            }

            I32Add => self.binop_i32(|a, b| a.wrapping_add(b))?,
            I32Sub => self.binop_i32(|a, b| a.wrapping_sub(b))?,
            I32Mul => self.binop_i32(|a, b| a.wrapping_mul(b))?,
            I32Eq => self.cmp_i32(|a, b| a == b)?,
            I32Ne => self.cmp_i32(|a, b| a != b)?,
            I32LtS => self.cmp_i32(|a, b| a < b)?,
            I32GtS => self.cmp_i32(|a, b| a > b)?,
            I32LeS => self.cmp_i32(|a, b| a <= b)?,
            I32GeS => self.cmp_i32(|a, b| a >= b)?,

            F64Add => self.binop_f64(|a, b| a + b)?,
            F64Sub => self.binop_f64(|a, b| a - b)?,
            F64Mul => self.binop_f64(|a, b| a * b)?,
            F64Div => self.binop_f64(|a, b| a / b)?,

            LocalGet => {
                let name = imm_name(&immediate);
                let idx = self.resolve_local(func_index, &name)?;
                let v = {
                    let state = self.state.borrow();
                    let frame = state.call_stack.last().ok_or_else(|| {
                        Error::Internal("call stack unexpectedly empty during local.get".to_string())
                    })?;
                    *frame
                        .locals
                        .get(idx)
                        .ok_or_else(|| Error::UnknownLocal(name.clone()))?
                };
                self.push_value(v)?;
            }
            LocalSet => {
                let name = imm_name(&immediate);
                let idx = self.resolve_local(func_index, &name)?;
                let v = self.pop_value()?;
                let mut state = self.state.borrow_mut();
                let frame = state.call_stack.last_mut().ok_or_else(|| {
                    Error::Internal("call stack unexpectedly empty during local.set".to_string())
                })?;
                if idx >= frame.locals.len() {
                    return Err(Error::UnknownLocal(name));
                }
                frame.locals[idx] = v;
            }
            LocalTee => return Err(Error::Unsupported("local.tee")),
            GlobalGet => return Err(Error::Unsupported("global.get")),
            GlobalSet => return Err(Error::Unsupported("global.set")),
            Return => return Err(Error::Unsupported("return")),
            If => return Err(Error::Unsupported("if")),
            Else => return Err(Error::Unsupported("else")),
            Unreachable => return Err(Error::Unsupported("unreachable")),

            StringConst => {
                let name = imm_name(&immediate);
                let handle = *self
                    .string_handles
                    .get(&name)
                    .ok_or_else(|| Error::UnknownString(name.clone()))?;
                self.push_value(Value::I32(handle))?;
            }

            Call => {
                let name = imm_name(&immediate);
                self.do_call(&name)?;
            }
            CallIndirect => {
                let type_name = imm_name(&immediate);
                self.do_call_indirect(&type_name)?;
            }

            Block | Loop | End => {}

            Br => {
                let label = name_or_none(&immediate);
                let target = self.resolve_branch(func_index, instr_index, label.as_deref())?;
                self.set_pc(target)?;
            }
            BrIf => {
                let cond = self.pop_value()?.as_i32();
                if cond != 0 {
                    let label = name_or_none(&immediate);
                    let target =
                        self.resolve_branch(func_index, instr_index, label.as_deref())?;
                    self.set_pc(target)?;
                }
            }

            Nop => {}
        }
        Ok(())
    }

    fn do_call(&self, name: &str) -> Result<()> {
        let host = self.host_registry.borrow().get(name).cloned();
        if let Some(entry) = host {
            let arity = entry.param_types.len();
            let mut args = Vec::with_capacity(arity);
            for _ in 0..arity {
                args.push(self.pop_value()?);
            }
            args.reverse();
            tracing::debug!(callee = name, "host call");
            let result = (entry.func)(&args)?;
            if !entry.result_types.is_empty() {
                self.push_value(result)?;
            }
            return Ok(());
        }
        if let Some(&callee_index) = self.func_map.get(name) {
            let arity = self.module.functions[callee_index].param_types.len();
            let mut args = Vec::with_capacity(arity);
            for _ in 0..arity {
                args.push(self.pop_value()?);
            }
            args.reverse();
            return self.push_frame(callee_index, args);
        }
        Err(Error::UnknownFunction(name.to_string()))
    }

    fn do_call_indirect(&self, type_name: &str) -> Result<()> {
        let ty = self
            .module
            .types
            .iter()
            .find(|t| t.name.as_deref() == Some(type_name))
            .ok_or_else(|| Error::UnknownType(type_name.to_string()))?;

        let index = self.pop_value()?.as_i32();
        if index < 0 || index as usize >= self.table.len() {
            return Err(Error::UndefinedElement(index as u32));
        }
        let callee_index = self.table[index as usize]
            .ok_or(Error::UninitializedElement(index as u32))?;
        let callee = &self.module.functions[callee_index];
        if callee.param_types != ty.param_types || callee.result_types != ty.result_types {
            return Err(Error::IndirectCallSignatureMismatch {
                type_name: type_name.to_string(),
            });
        }

        let arity = callee.param_types.len();
        let mut args = Vec::with_capacity(arity);
        for _ in 0..arity {
            args.push(self.pop_value()?);
        }
        args.reverse();
        self.push_frame(callee_index, args)
    }

    /// Scans `body` backwards from `instr_index` for the nearest
    /// `loop` with `label`; failing that, backwards for the nearest
    /// `block` with `label` and then forward to its matching `end`.
    fn resolve_branch(
        &self,
        func_index: usize,
        instr_index: usize,
        label: Option<&str>,
    ) -> Result<usize> {
        let body = &self.module.functions[func_index].body;

        for i in (0..=instr_index).rev() {
            if body[i].opcode == Opcode::Loop && label_matches(&body[i].immediate, label) {
                return Ok(i);
            }
        }

        let mut block_idx = None;
        for i in (0..=instr_index).rev() {
            if body[i].opcode == Opcode::Block && label_matches(&body[i].immediate, label) {
                block_idx = Some(i);
                break;
            }
        }
        let block_idx =
            block_idx.ok_or_else(|| Error::UnknownLabel(label.unwrap_or_default().to_string()))?;

        let mut depth = 0i32;
        for (i, instr) in body.iter().enumerate().skip(block_idx) {
            match instr.opcode {
                Opcode::Block | Opcode::Loop => depth += 1,
                Opcode::End => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i + 1);
                    }
                }
                _ => {}
            }
        }
        Err(Error::UnknownLabel(label.unwrap_or_default().to_string()))
    }

    fn resolve_local(&self, func_index: usize, name: &str) -> Result<usize> {
        if name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            return name
                .parse::<usize>()
                .map_err(|_| Error::UnknownLocal(name.to_string()));
        }
        let func = &self.module.functions[func_index];
        if let Some(pos) = func.param_names.iter().position(|n| n.as_deref() == Some(name)) {
            return Ok(pos);
        }
        if let Some(pos) = func.local_names.iter().position(|n| n.as_deref() == Some(name)) {
            return Ok(func.param_types.len() + pos);
        }
        Err(Error::UnknownLocal(name.to_string()))
    }

    fn set_pc(&self, target: usize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let frame = state.call_stack.last_mut().ok_or_else(|| {
            Error::Internal("call stack unexpectedly empty while branching".to_string())
        })?;
        frame.pc = target;
        Ok(())
    }

    fn push_value(&self, v: Value) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.value_stack.len() >= self.config.value_stack_limit {
            return Err(Error::StackOverflow(self.config.value_stack_limit));
        }
        state.value_stack.push(v);
        Ok(())
    }

    fn pop_value(&self) -> Result<Value> {
        self.state
            .borrow_mut()
            .value_stack
            .pop()
            .ok_or(Error::StackUnderflow)
    }

    fn binop_i32(&self, f: impl Fn(i32, i32) -> i32) -> Result<()> {
        let b = self.pop_value()?.as_i32();
        let a = self.pop_value()?.as_i32();
        self.push_value(Value::I32(f(a, b)))
    }

    fn cmp_i32(&self, f: impl Fn(i32, i32) -> bool) -> Result<()> {
        let b = self.pop_value()?.as_i32();
        let a = self.pop_value()?.as_i32();
        self.push_value(Value::I32(if f(a, b) { 1 } else { 0 }))
    }

    fn binop_f64(&self, f: impl Fn(f64, f64) -> f64) -> Result<()> {
        let b = self.pop_value()?.as_f64();
        let a = self.pop_value()?.as_f64();
        self.push_value(Value::F64(f(a, b)))
    }
}

fn imm_i32(imm: &Immediate) -> i32 {
    match imm {
        Immediate::I32(n) => *n,
        _ => 0,
    }
}

fn imm_i64(imm: &Immediate) -> i64 {
    match imm {
        Immediate::I64(n) => *n,
        _ => 0,
    }
}

fn imm_f32(imm: &Immediate) -> f32 {
    match imm {
        Immediate::F32(n) => *n,
        _ => 0.0,
    }
}

fn imm_f64(imm: &Immediate) -> f64 {
    match imm {
        Immediate::F64(n) => *n,
        _ => 0.0,
    }
}

fn imm_name(imm: &Immediate) -> String {
    match imm {
        Immediate::Name(s) => s.clone(),
        _ => String::new(),
    }
}

fn name_or_none(imm: &Immediate) -> Option<String> {
    match imm {
        Immediate::Name(s) => Some(s.clone()),
        _ => None,
    }
}

fn label_matches(imm: &Immediate, label: Option<&str>) -> bool {
    match (imm, label) {
        (Immediate::Name(n), Some(l)) => n == l,
        _ => false,
    }
}
