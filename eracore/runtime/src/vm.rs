//! The tree-walking interpreter: scopes, frames, control-result threading,
//! goto resolution, event dispatch.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use era_ast::{CaseCondition, Expr, Function, Program, Statement, Thunk, VarRef};
use era_common::{EraError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::array::{dims_for_index, ArrayVar};
use crate::chara::{RuntimeCharacter, UiState};
use crate::csv::CsvStore;
use crate::flow::ThunkFlow;
use crate::input::InputState;
use crate::value::{value_equal, Value};
use crate::{Output, OutputHook};

pub(crate) struct Frame {
    pub func: Rc<Function>,
    pub locals: HashMap<String, Value>,
    pub l_arrays: HashMap<String, ArrayVar>,
    pub l_ref_decl: HashSet<String>,
    pub refs: HashMap<String, VarRef>,
}

#[derive(Debug, Clone)]
pub enum ExecResult {
    None,
    Goto(String),
    JumpIndex(usize),
    Begin(String),
    Return(Vec<Value>),
    Quit,
    Break,
    Continue,
}

pub type InputProvider = Box<dyn FnMut(&crate::input::InputRequest) -> Result<(String, bool)>>;

pub struct Vm {
    pub(crate) program: Rc<Program>,
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) g_arrays: HashMap<String, ArrayVar>,
    pub(crate) g_ref_decl: HashSet<String>,
    pub(crate) g_refs: HashMap<String, VarRef>,
    pub(crate) stack: Vec<Frame>,
    pub(crate) outputs: Vec<Output>,
    pub(crate) rng: StdRng,
    pub(crate) csv: CsvStore,
    pub(crate) save_dir: String,
    pub(crate) ui: UiState,
    pub(crate) characters: Vec<RuntimeCharacter>,
    pub(crate) next_char_id: i64,
    pub(crate) flow_map: HashMap<u32, ThunkFlow>,
    pub(crate) exec_thunk: Option<u32>,
    pub(crate) exec_pc: usize,
    pub(crate) input: InputState,
    pub(crate) save_unique_code: i64,
    pub(crate) save_version: i64,
    pub(crate) dat_save_format: String,
    pub(crate) output_hook: Option<OutputHook>,
    pub(crate) input_provider: Option<InputProvider>,
    pub(crate) exec_steps: u64,
    pub(crate) max_steps: u64,
}

impl Vm {
    pub fn new(program: Program) -> Result<Self> {
        let csv = CsvStore::new(&program.csv_files);
        let mut vm = Vm {
            program: Rc::new(program),
            globals: HashMap::new(),
            g_arrays: HashMap::new(),
            g_ref_decl: HashSet::new(),
            g_refs: HashMap::new(),
            stack: Vec::new(),
            outputs: Vec::new(),
            rng: StdRng::seed_from_u64(wall_clock_seed()),
            csv,
            save_dir: String::new(),
            ui: UiState::default(),
            characters: Vec::new(),
            next_char_id: 0,
            flow_map: HashMap::new(),
            exec_thunk: None,
            exec_pc: 0,
            input: InputState::default(),
            save_unique_code: 0,
            save_version: 1,
            dat_save_format: "json".to_string(),
            output_hook: None,
            input_provider: None,
            exec_steps: 0,
            max_steps: 0,
        };
        vm.init_save_identity();
        vm.init_defines()?;
        vm.build_flow_index();
        Ok(vm)
    }

    /// A VM shell with no program, used by the save-format converter and
    /// codec tests; identity fields start at their wire defaults.
    pub(crate) fn detached() -> Self {
        Vm {
            program: Rc::new(Program::default()),
            globals: HashMap::new(),
            g_arrays: HashMap::new(),
            g_ref_decl: HashSet::new(),
            g_refs: HashMap::new(),
            stack: Vec::new(),
            outputs: Vec::new(),
            rng: StdRng::seed_from_u64(wall_clock_seed()),
            csv: CsvStore::default(),
            save_dir: String::new(),
            ui: UiState::default(),
            characters: Vec::new(),
            next_char_id: 0,
            flow_map: HashMap::new(),
            exec_thunk: None,
            exec_pc: 0,
            input: InputState::default(),
            save_unique_code: 0,
            save_version: 1,
            dat_save_format: "json".to_string(),
            output_hook: None,
            input_provider: None,
            exec_steps: 0,
            max_steps: 0,
        }
    }

    pub(crate) fn init_defines(&mut self) -> Result<()> {
        let program = self.program.clone();
        let mut keys: Vec<&String> = program.defines.keys().collect();
        keys.sort();
        let mut indexed_keys = Vec::new();
        for k in keys {
            if k.contains(':') {
                indexed_keys.push(k.clone());
                continue;
            }
            let v = self
                .eval_expr(&program.defines[k])
                .unwrap_or(Value::Int(0));
            self.globals.insert(k.clone(), v);
        }
        for decl in &program.var_decls {
            let name = decl.name.trim().to_uppercase();
            if name.is_empty() || decl.scope != era_ast::DeclScope::Global {
                continue;
            }
            if decl.is_ref {
                self.g_ref_decl.insert(name);
                continue;
            }
            self.g_arrays
                .insert(name, ArrayVar::new(decl.is_string, decl.is_dynamic, &decl.dims));
        }
        for k in indexed_keys {
            let Ok(Expr::Var(target)) = era_parser::parse_expr(&k) else { continue };
            if target.index.is_empty() {
                continue;
            }
            let Ok(v) = self.eval_expr(&program.defines[&k]) else { continue };
            self.set_var_ref(&target, v)
                .map_err(|e| EraError(format!("init {}: {}", k, e)))?;
        }
        for name in &program.string_vars {
            if !self.globals.contains_key(name) && !self.g_arrays.contains_key(name) {
                self.globals.insert(name.clone(), Value::Str(String::new()));
            }
        }
        let (title, author, year, window_title, info) = {
            let m = self.csv.game_meta();
            (m.0.to_string(), m.1.to_string(), m.2.to_string(), m.3.to_string(), m.4.to_string())
        };
        for (key, val) in [
            ("GAMEBASE_TITLE", title),
            ("GAMEBASE_AUTHOR", author),
            ("GAMEBASE_YEAR", year),
            ("GAMEBASE_WINDOWTITLE", window_title),
            ("GAMEBASE_INFO", info),
        ] {
            if !val.trim().is_empty() {
                self.globals.insert(key.to_string(), Value::Str(val));
            }
        }
        if !self.globals.contains_key("GAMEBASE_VERSION") {
            let (_, version, _, has_version) = self.csv.game_code_version();
            if has_version {
                self.globals.insert("GAMEBASE_VERSION".to_string(), Value::Int(version));
            }
        }
        self.globals.entry("RESULT".to_string()).or_insert(Value::Int(0));
        Ok(())
    }

    fn init_save_identity(&mut self) {
        let (code, version, has_code, has_version) = self.csv.game_code_version();
        if has_code {
            self.save_unique_code = code;
        } else {
            // Deterministic identity from the program shape when GAMEBASE
            // carries no CODE: FNV-1a over sorted functions and statement
            // summaries, sign bit masked off.
            let mut h = Fnv64::new();
            let mut names: Vec<&String> = self.program.functions.keys().collect();
            names.sort();
            for name in names {
                h.write(name.as_bytes());
                let f = &self.program.functions[name];
                for st in &f.body.statements {
                    match st {
                        Statement::Command { name, arg } => {
                            h.write(name.trim().to_uppercase().as_bytes());
                            h.write(arg.trim().as_bytes());
                        }
                        Statement::Assign { target, .. }
                        | Statement::AssignForm { target, .. } => {
                            h.write(target.name.trim().to_uppercase().as_bytes());
                        }
                        _ => {}
                    }
                }
            }
            self.save_unique_code = (h.finish() & 0x7fff_ffff_ffff_ffff) as i64;
        }
        self.save_version = if has_version { version } else { 1 };
    }

    pub fn run(&mut self, entry: &str) -> Result<Vec<Output>> {
        let queued = std::mem::take(&mut self.input.queue);
        self.outputs.clear();
        self.ui = UiState::default();
        self.characters.clear();
        self.next_char_id = 0;
        self.input = InputState::default();
        self.input.queue = queued;
        self.exec_steps = 0;
        self.refresh_character_globals();

        let mut current = entry.trim().to_uppercase();
        if current.is_empty() {
            current = "TITLE".to_string();
        }
        loop {
            let res = self.dispatch_entry(&current)?;
            match res {
                ExecResult::Begin(keyword) => {
                    current = keyword.trim().to_uppercase();
                }
                ExecResult::Quit => return Ok(self.outputs.clone()),
                ExecResult::Goto(label) => {
                    return Err(EraError(format!("uncaught goto {}", label)));
                }
                _ => return Ok(self.outputs.clone()),
            }
        }
    }

    // Resolves a BEGIN keyword. Event names dispatch to every collected
    // handler in priority order; a handler issuing BEGIN or QUIT wins.
    fn dispatch_entry(&mut self, keyword: &str) -> Result<ExecResult> {
        let kw = keyword.trim().to_uppercase();
        let mut candidates = vec![kw.clone()];
        match kw.as_str() {
            "TITLE" => candidates.push("SYSTEM_TITLE".to_string()),
            "FIRST" => candidates.push("EVENTFIRST".to_string()),
            "SHOP" => candidates.push("EVENTSHOP".to_string()),
            "TRAIN" => candidates.push("EVENTTRAIN".to_string()),
            "AFTERTRAIN" | "AFTERTRA" | "END" => candidates.push("EVENTEND".to_string()),
            "TURNEND" => candidates.push("EVENTTURNEND".to_string()),
            "COM" => candidates.push("EVENTCOM".to_string()),
            "LOAD" => candidates.push("EVENTLOAD".to_string()),
            _ => {}
        }
        for candidate in &candidates {
            let handlers = self.program.events.get(candidate).cloned().unwrap_or_default();
            if !handlers.is_empty() {
                for handler in handlers {
                    let res = self.call_function_rc(handler, Vec::new())?;
                    match res {
                        ExecResult::Begin(_) | ExecResult::Quit => return Ok(res),
                        _ => {}
                    }
                }
                return Ok(ExecResult::None);
            }
            if self.program.functions.contains_key(candidate) {
                return self.call_function(candidate, Vec::new());
            }
        }
        Err(EraError(format!("function {} not found", kw)))
    }

    pub fn globals(&self) -> HashMap<String, Value> {
        self.globals.clone()
    }

    /// Outputs emitted so far; on a runtime failure these are still part of
    /// the host result envelope.
    pub fn outputs_snapshot(&self) -> Vec<Output> {
        self.outputs.clone()
    }

    pub fn set_save_dir(&mut self, dir: impl Into<String>) {
        self.save_dir = dir.into();
    }

    pub fn set_output_hook(&mut self, hook: OutputHook) {
        self.output_hook = Some(hook);
    }

    pub fn set_input_provider(&mut self, provider: InputProvider) {
        self.input_provider = Some(provider);
    }

    pub fn set_dat_save_format(&mut self, format: &str) -> Result<()> {
        let format = format.trim().to_lowercase();
        match format.as_str() {
            "json" | "binary" | "both" => {
                self.dat_save_format = format;
                Ok(())
            }
            _ => Err(EraError(format!(
                "invalid dat save format {:?} (use json|binary|both)",
                format
            ))),
        }
    }

    pub fn dat_save_format(&self) -> &str {
        &self.dat_save_format
    }

    /// Runaway-script ceiling: statements executed between input boundaries.
    /// 0 disables the watchdog.
    pub fn set_max_steps(&mut self, max: u64) {
        self.max_steps = max;
    }

    pub(crate) fn emit_output(&mut self, out: Output) {
        if let Some(hook) = self.output_hook.as_mut() {
            hook(&out);
        }
        self.outputs.push(out);
    }

    pub(crate) fn call_function(
        &mut self,
        name: &str,
        args: Vec<Option<Value>>,
    ) -> Result<ExecResult> {
        let name = name.to_uppercase();
        let Some(func) = self.program.functions.get(&name).cloned() else {
            return Err(EraError(format!("function {} not found", name)));
        };
        self.call_function_rc(func, args)
    }

    pub(crate) fn call_function_rc(
        &mut self,
        func: Rc<Function>,
        args: Vec<Option<Value>>,
    ) -> Result<ExecResult> {
        let frame = Frame {
            func: func.clone(),
            locals: HashMap::new(),
            l_arrays: HashMap::new(),
            l_ref_decl: HashSet::new(),
            refs: HashMap::new(),
        };
        self.stack.push(frame);
        let res = self.run_function_body(&func, args);
        self.stack.pop();
        match res? {
            ExecResult::Return(values) => {
                self.store_result(&values);
                Ok(ExecResult::None)
            }
            // A label missing from the whole function body is an error; it
            // must not leak into the caller's thunks.
            ExecResult::Goto(label) => {
                Err(EraError(format!("uncaught goto {} in {}", label, func.name)))
            }
            other => Ok(other),
        }
    }

    fn run_function_body(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Option<Value>>,
    ) -> Result<ExecResult> {
        for (i, formal) in func.args.iter().enumerate() {
            let target = normalize_func_arg_target(formal, i);
            let value = match args.get(i) {
                Some(Some(v)) => v.clone(),
                _ => match &formal.default {
                    Some(default) => self.eval_expr(default).map_err(|e| {
                        EraError(format!("{} default arg {}: {}", func.name, formal.name, e))
                    })?,
                    None => self.default_value_for_func_arg_target(&target),
                },
            };
            self.assign_func_arg(&target, value)
                .map_err(|e| EraError(format!("{} arg {}: {}", func.name, formal.name, e)))?;
        }

        for decl in &func.var_decls {
            let name = decl.name.trim().to_uppercase();
            if name.is_empty() {
                continue;
            }
            match decl.scope {
                era_ast::DeclScope::Global => {
                    if decl.is_ref {
                        self.g_ref_decl.insert(name);
                        continue;
                    }
                    self.g_arrays
                        .entry(name)
                        .or_insert_with(|| ArrayVar::new(decl.is_string, decl.is_dynamic, &decl.dims));
                }
                era_ast::DeclScope::Local => {
                    let Some(fr) = self.stack.last_mut() else { continue };
                    if decl.is_ref {
                        fr.l_ref_decl.insert(name);
                        continue;
                    }
                    fr.l_arrays
                        .insert(name, ArrayVar::new(decl.is_string, decl.is_dynamic, &decl.dims));
                }
            }
        }

        self.run_thunk(&func.body)
    }

    fn assign_func_arg(&mut self, target: &VarRef, v: Value) -> Result<()> {
        if target.index.is_empty() {
            if let Some(fr) = self.stack.last_mut() {
                fr.locals.insert(target.name.clone(), v);
            }
            return Ok(());
        }
        let index = self.eval_index_exprs_for(&target.name, &target.index)?;
        let is_str = v.is_str();
        let Some(fr) = self.stack.last_mut() else { return Ok(()) };
        let arr = fr
            .l_arrays
            .entry(target.name.clone())
            .or_insert_with(|| ArrayVar::new(is_str, true, &dims_for_index(&index)));
        if is_str {
            arr.is_string = true;
        }
        arr.set(&index, v)
    }

    pub(crate) fn run_thunk(&mut self, thunk: &Thunk) -> Result<ExecResult> {
        let prev_thunk = self.exec_thunk;
        let prev_pc = self.exec_pc;
        self.exec_thunk = Some(thunk.id);

        let mut pc = 0usize;
        let result = loop {
            if pc >= thunk.statements.len() {
                break Ok(ExecResult::None);
            }
            self.exec_pc = pc;
            self.exec_steps += 1;
            if self.max_steps > 0 && self.exec_steps > self.max_steps {
                break Err(EraError(format!(
                    "executed {} statements without input progress",
                    self.exec_steps
                )));
            }
            let stmt = &thunk.statements[pc];
            let res = match self.run_statement(stmt) {
                Ok(res) => res,
                Err(e) => {
                    let fn_name = self
                        .stack
                        .last()
                        .map(|fr| fr.func.name.clone())
                        .unwrap_or_default();
                    break Err(if fn_name.is_empty() {
                        EraError(format!("pc {} ({}): {}", pc, statement_name(stmt), e))
                    } else {
                        EraError(format!(
                            "{} pc {} ({}): {}",
                            fn_name,
                            pc,
                            statement_name(stmt),
                            e
                        ))
                    });
                }
            };
            match res {
                ExecResult::Goto(label) => {
                    let label = label.to_uppercase();
                    if let Some(&idx) = thunk.labels.get(&label) {
                        pc = idx;
                        continue;
                    }
                    break Ok(ExecResult::Goto(label));
                }
                ExecResult::JumpIndex(idx) => {
                    if idx <= thunk.statements.len() {
                        pc = idx;
                        continue;
                    }
                    break Err(EraError(format!("invalid jump index {}", idx)));
                }
                ExecResult::None => {
                    pc += 1;
                }
                other => break Ok(other),
            }
        };

        self.exec_thunk = prev_thunk;
        self.exec_pc = prev_pc;
        result
    }

    fn run_statement(&mut self, stmt: &Statement) -> Result<ExecResult> {
        match stmt {
            Statement::Print { expr, newline } => {
                if self.ui.skip_disp {
                    return Ok(ExecResult::None);
                }
                let v = self.eval_expr(expr)?;
                self.emit_output(Output::text(v.as_str(), *newline));
                Ok(ExecResult::None)
            }
            Statement::Assign { target, op, expr } => self.run_assign(target, op, expr),
            Statement::AssignForm { target, raw } => {
                let text = self.expand_form_template(&era_parser::decode_char_seq(raw))?;
                self.set_var_ref(target, Value::Str(text))?;
                Ok(ExecResult::None)
            }
            Statement::IncDec { target, op } => {
                let cur = self.get_var_ref(target)?;
                let delta = if op == "--" { -1 } else { 1 };
                self.set_var_ref(target, Value::Int(cur.as_int() + delta))?;
                Ok(ExecResult::None)
            }
            Statement::If { branches, else_body } => {
                for br in branches {
                    if self.eval_expr(&br.cond)?.truthy() {
                        return self.run_thunk(&br.body);
                    }
                }
                self.run_thunk(else_body)
            }
            Statement::SelectCase { target, branches, else_body } => {
                let target = self.eval_expr(target)?;
                for br in branches {
                    if self.match_case_conditions(&target, &br.conditions)? {
                        return self.run_thunk(&br.body);
                    }
                }
                self.run_thunk(else_body)
            }
            Statement::While { cond, body } => loop {
                if !self.eval_expr(cond)?.truthy() {
                    return Ok(ExecResult::None);
                }
                match self.run_thunk(body)? {
                    ExecResult::None | ExecResult::Continue => {}
                    ExecResult::Break => return Ok(ExecResult::None),
                    other => return Ok(other),
                }
            },
            Statement::DoWhile { body, cond } => loop {
                match self.run_thunk(body)? {
                    ExecResult::None | ExecResult::Continue => {}
                    ExecResult::Break => return Ok(ExecResult::None),
                    other => return Ok(other),
                }
                if !self.eval_expr(cond)?.truthy() {
                    return Ok(ExecResult::None);
                }
            },
            Statement::Repeat { count, body } => {
                let n = self.eval_expr(count)?.as_int().max(0);
                for _ in 0..n {
                    match self.run_thunk(body)? {
                        ExecResult::None | ExecResult::Continue => {}
                        ExecResult::Break => return Ok(ExecResult::None),
                        other => return Ok(other),
                    }
                }
                Ok(ExecResult::None)
            }
            Statement::For { target, init, limit, step, body } => {
                let init = self.eval_expr(init)?.as_int();
                let limit = self.eval_expr(limit)?.as_int();
                let mut step = self.eval_expr(step)?.as_int();
                if step == 0 {
                    step = 1;
                }
                let mut target = target.clone();
                target.name = target.name.trim().to_uppercase();
                self.set_var_ref(&target, Value::Int(init))?;
                loop {
                    let cur = self.get_var_ref(&target)?.as_int();
                    if (step > 0 && cur >= limit) || (step < 0 && cur <= limit) {
                        return Ok(ExecResult::None);
                    }
                    match self.run_thunk(body)? {
                        ExecResult::None | ExecResult::Continue => {}
                        ExecResult::Break => return Ok(ExecResult::None),
                        other => return Ok(other),
                    }
                    self.set_var_ref(&target, Value::Int(cur + step))?;
                }
            }
            Statement::Goto { label } => Ok(ExecResult::Goto(label.to_uppercase())),
            Statement::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for e in args {
                    values.push(Some(self.eval_call_arg_expr(e)?));
                }
                let res = self.call_function(name, values)?;
                Ok(res)
            }
            Statement::Return { values } => {
                let mut out = Vec::with_capacity(values.len());
                for e in values {
                    out.push(self.eval_expr(e)?);
                }
                Ok(ExecResult::Return(out))
            }
            Statement::Begin { keyword } => Ok(ExecResult::Begin(keyword.clone())),
            Statement::Quit => Ok(ExecResult::Quit),
            Statement::Break => Ok(ExecResult::Break),
            Statement::Continue => Ok(ExecResult::Continue),
            Statement::PrintData { command, items } => {
                let text = self.pick_data_item_text(items)?;
                if !self.ui.skip_disp {
                    self.emit_output(Output::text(text, should_newline_on_print(command)));
                }
                if command.ends_with('W') {
                    self.implicit_wait(command)?;
                }
                Ok(ExecResult::None)
            }
            Statement::StrData { target, items } => {
                let text = self.pick_data_item_text(items)?;
                self.set_var_ref(target, Value::Str(text))?;
                Ok(ExecResult::None)
            }
            Statement::Command { name, arg } => self.run_command(name, arg),
        }
    }

    fn run_assign(&mut self, target: &VarRef, op: &str, expr: &Expr) -> Result<ExecResult> {
        if op == "=" && target.index.is_empty() {
            if let Expr::Var(source) = expr {
                if self.is_ref_declared(&target.name) {
                    self.set_ref_binding(&target.name.to_uppercase(), source.clone());
                    return Ok(ExecResult::None);
                }
            }
        }
        let mut v = match expr {
            Expr::Empty => self.default_value_for_var_ref(target),
            _ => self.eval_expr(expr)?,
        };
        // A raw-text fallback RHS may still carry template placeholders.
        if matches!(expr, Expr::Str(_)) {
            if let Value::Str(raw) = &v {
                if raw.contains('%') || raw.contains('{') || raw.contains('@') {
                    let raw = raw.clone();
                    v = Value::Str(self.expand_form_template(&raw)?);
                }
            }
        }
        if op == "=" {
            self.set_var_ref(target, v)?;
            return Ok(ExecResult::None);
        }
        let current = self.get_var_ref(target)?;
        let next = crate::expr::eval_assign_binary(op, &current, &v)?;
        self.set_var_ref(target, next)?;
        Ok(ExecResult::None)
    }

    fn match_case_conditions(
        &mut self,
        target: &Value,
        conditions: &[CaseCondition],
    ) -> Result<bool> {
        for cond in conditions {
            match cond {
                CaseCondition::Equal(e) => {
                    let v = self.eval_expr(e)?;
                    if value_equal(target, &v) {
                        return Ok(true);
                    }
                }
                CaseCondition::Range { from, to } => {
                    let from = self.eval_expr(from)?.as_int();
                    let to = self.eval_expr(to)?.as_int();
                    let tv = target.as_int();
                    if from <= tv && tv <= to {
                        return Ok(true);
                    }
                }
                CaseCondition::Compare { op, expr } => {
                    let v = self.eval_expr(expr)?.as_int();
                    let t = target.as_int();
                    let hit = match op.as_str() {
                        "<" => t < v,
                        "<=" => t <= v,
                        ">" => t > v,
                        ">=" => t >= v,
                        "==" => t == v,
                        "!=" => t != v,
                        _ => false,
                    };
                    if hit {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    pub(crate) fn pick_data_item_text(&mut self, items: &[era_ast::DataItem]) -> Result<String> {
        if items.is_empty() {
            return Ok(String::new());
        }
        let idx = self.rng.gen_range(0..items.len());
        let item = &items[idx];
        if item.is_form {
            self.eval_print_form(&item.raw)
        } else {
            Ok(era_parser::decode_char_seq(&item.raw))
        }
    }

    pub(crate) fn store_result(&mut self, values: &[Value]) {
        if values.is_empty() {
            self.globals.insert("RESULT".to_string(), Value::Int(0));
            return;
        }
        self.globals.insert("RESULT".to_string(), values[0].clone());
        if values[0].is_str() {
            self.globals.insert("RESULTS".to_string(), values[0].clone());
        }
        for (i, v) in values.iter().enumerate() {
            self.globals.insert(format!("RESULT{}", i), v.clone());
        }
    }

    // ---- name resolution ----

    pub(crate) fn current_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub(crate) fn has_array(&self, name: &str) -> bool {
        let name = name.to_uppercase();
        if let Some(fr) = self.stack.last() {
            if fr.l_arrays.contains_key(&name) {
                return true;
            }
        }
        self.g_arrays.contains_key(&name)
    }

    /// Runs `f` against the named array (frame-local first, then global).
    pub(crate) fn with_array_mut<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut ArrayVar) -> R,
    ) -> Option<R> {
        let name = name.to_uppercase();
        if let Some(fr) = self.stack.last_mut() {
            if let Some(arr) = fr.l_arrays.get_mut(&name) {
                return Some(f(arr));
            }
        }
        self.g_arrays.get_mut(&name).map(f)
    }

    pub(crate) fn array_dims(&self, name: &str) -> Option<Vec<usize>> {
        let name = name.to_uppercase();
        if let Some(fr) = self.stack.last() {
            if let Some(arr) = fr.l_arrays.get(&name) {
                return Some(arr.dims.clone());
            }
        }
        self.g_arrays.get(&name).map(|a| a.dims.clone())
    }

    pub(crate) fn get_var(&mut self, name: &str) -> Value {
        let name = name.to_uppercase();
        if name == "LINECOUNT" {
            return Value::Int(self.outputs.len() as i64);
        }
        if let Some(bound) = self.resolve_ref_binding(&name) {
            if let Ok(v) = self.get_var_ref(&bound) {
                return v;
            }
        }
        if is_result_like_name(&name) {
            if let Some(v) = self.globals.get(&name) {
                return v.clone();
            }
        }
        if let Some(fr) = self.stack.last_mut() {
            if let Some(v) = fr.locals.get(&name) {
                return v.clone();
            }
            if let Some(arr) = fr.l_arrays.get_mut(&name) {
                if let Ok(v) = arr.get(&[0]) {
                    return v;
                }
            }
        }
        if let Some(arr) = self.g_arrays.get_mut(&name) {
            if let Ok(v) = arr.get(&[0]) {
                return v;
            }
        }
        if let Some(v) = self.globals.get(&name) {
            return v.clone();
        }
        if self.is_string_array_base(&name) {
            return Value::Str(String::new());
        }
        Value::Int(0)
    }

    pub(crate) fn set_var(&mut self, name: &str, v: Value) {
        let name = name.to_uppercase();
        if let Some(bound) = self.resolve_ref_binding(&name) {
            let _ = self.set_var_ref(&bound, v);
            return;
        }
        if is_result_like_name(&name) {
            self.globals.insert(name.clone(), v.clone());
            if let Some(fr) = self.stack.last_mut() {
                if let Some(arr) = fr.l_arrays.get_mut(&name) {
                    let _ = arr.set(&[0], v);
                    return;
                }
            }
            if let Some(arr) = self.g_arrays.get_mut(&name) {
                let _ = arr.set(&[0], v);
            }
            return;
        }
        if let Some(fr) = self.stack.last_mut() {
            if fr.locals.contains_key(&name) {
                fr.locals.insert(name, v);
                return;
            }
            if let Some(arr) = fr.l_arrays.get_mut(&name) {
                let _ = arr.set(&[0], v);
                return;
            }
        }
        if let Some(arr) = self.g_arrays.get_mut(&name) {
            let _ = arr.set(&[0], v);
            return;
        }
        self.globals.insert(name, v);
    }

    pub(crate) fn get_var_ref(&mut self, var: &VarRef) -> Result<Value> {
        let name = var.name.to_uppercase();
        if var.index.is_empty() {
            if let Some(bound) = self.resolve_ref_binding(&name) {
                return self.get_var_ref(&bound);
            }
            return Ok(self.get_var(&name));
        }
        if name == "RAND" {
            let limit = self.eval_expr(&var.index[0])?.as_int();
            if limit <= 0 {
                return Ok(Value::Int(0));
            }
            return Ok(Value::Int(self.rng.gen_range(0..limit)));
        }
        let index = self.eval_index_exprs_for(&name, &var.index)?;
        if is_result_like_name(&name) && index.len() == 1 && index[0] == 0 {
            if let Some(v) = self.globals.get(&name) {
                return Ok(v.clone());
            }
        }
        if name == "NO" && !index.is_empty() {
            return Ok(Value::Int(self.character_id_by_index(index[0]).unwrap_or(0)));
        }

        let in_frame = self
            .stack
            .last()
            .map_or(false, |fr| fr.l_arrays.contains_key(&name));
        if in_frame || self.g_arrays.contains_key(&name) {
            let got = self
                .with_array_mut(&name, |arr| {
                    let is_string = arr.is_string;
                    let explicit = arr.has_explicit_value(&index);
                    (arr.get(&index), is_string, explicit)
                })
                .expect("array vanished");
            let (res, is_string, explicit) = got;
            return match res {
                Ok(v) => {
                    if !explicit {
                        if let Some(fb) = self.character_text_fallback(&name, &index) {
                            return Ok(fb);
                        }
                    }
                    Ok(v)
                }
                Err(e) => {
                    if is_string && index.iter().any(|&i| i < 0) {
                        Ok(Value::Str(String::new()))
                    } else {
                        Err(EraError(format!("{}:{:?}: {}", name, index, e)))
                    }
                }
            };
        }
        if let Some(fb) = self.character_text_fallback(&name, &index) {
            return Ok(fb);
        }
        // Unknown indexed access auto-creates a dynamic array sized to fit.
        let is_string = self.is_string_array_base(&name);
        let arr = ArrayVar::new(is_string, true, &dims_for_index(&index));
        let slot = if self.stack.last().is_some() && name.starts_with("LOCAL") {
            let fr = self.stack.last_mut().expect("frame");
            fr.l_arrays.entry(name.clone()).or_insert(arr)
        } else {
            self.g_arrays.entry(name.clone()).or_insert(arr)
        };
        slot.get(&index)
            .map_err(|e| EraError(format!("{}:{:?}: {}", name, index, e)))
    }

    pub(crate) fn set_var_ref(&mut self, var: &VarRef, v: Value) -> Result<()> {
        let name = var.name.to_uppercase();
        if var.index.is_empty() {
            if let Some(bound) = self.resolve_ref_binding(&name) {
                return self.set_var_ref(&bound, v);
            }
            self.set_var(&name, v);
            return Ok(());
        }
        let index = self.eval_index_exprs_for(&name, &var.index)?;
        if name == "NO" && !index.is_empty() {
            let i = index[0];
            if i >= 0 && (i as usize) < self.characters.len() {
                self.characters[i as usize].id = v.as_int();
            }
            return Ok(());
        }
        let mirror = is_result_like_name(&name) && index.len() == 1 && index[0] == 0;
        if let Some(fr) = self.stack.last_mut() {
            if let Some(arr) = fr.l_arrays.get_mut(&name) {
                arr.set(&index, v.clone())
                    .map_err(|e| EraError(format!("{}:{:?}: {}", name, index, e)))?;
                if mirror {
                    self.globals.insert(name, v);
                }
                return Ok(());
            }
            if name.starts_with("LOCAL") {
                let is_string = v.is_str() || self.is_string_array_base(&name);
                let fr = self.stack.last_mut().expect("frame");
                let arr = fr
                    .l_arrays
                    .entry(name.clone())
                    .or_insert_with(|| ArrayVar::new(is_string, true, &dims_for_index(&index)));
                arr.set(&index, v)
                    .map_err(|e| EraError(format!("{}:{:?}: {}", name, index, e)))?;
                return Ok(());
            }
        }
        let is_string = self.is_string_array_base(&name);
        let arr = self
            .g_arrays
            .entry(name.clone())
            .or_insert_with(|| ArrayVar::new(is_string, true, &dims_for_index(&index)));
        arr.set(&index, v.clone())
            .map_err(|e| EraError(format!("{}:{:?}: {}", name, index, e)))?;
        if mirror {
            self.globals.insert(name, v);
        }
        Ok(())
    }

    pub(crate) fn default_value_for_var_ref(&mut self, var: &VarRef) -> Value {
        let name = var.name.trim().to_uppercase();
        if var.index.is_empty() {
            if let Some(fr) = self.stack.last() {
                if let Some(v) = fr.locals.get(&name) {
                    return if v.is_str() { Value::Str(String::new()) } else { Value::Int(0) };
                }
                if let Some(arr) = fr.l_arrays.get(&name) {
                    return arr.default_value();
                }
            }
            if let Some(arr) = self.g_arrays.get(&name) {
                return arr.default_value();
            }
            if let Some(v) = self.globals.get(&name) {
                if v.is_str() {
                    return Value::Str(String::new());
                }
            }
            if self.program.string_vars.contains(&name) {
                return Value::Str(String::new());
            }
            return Value::Int(0);
        }
        if let Some(fr) = self.stack.last() {
            if let Some(arr) = fr.l_arrays.get(&name) {
                return arr.default_value();
            }
        }
        if let Some(arr) = self.g_arrays.get(&name) {
            return arr.default_value();
        }
        if self.is_string_array_base(&name) {
            Value::Str(String::new())
        } else {
            Value::Int(0)
        }
    }

    pub(crate) fn is_string_array_base(&self, name: &str) -> bool {
        let name = name.trim().to_uppercase();
        if name.is_empty() {
            return false;
        }
        if self.program.string_vars.contains(&name) {
            return true;
        }
        matches!(
            name.as_str(),
            "NAME" | "CALLNAME" | "NICKNAME" | "MASTERNAME" | "CSTR" | "LOCALS" | "ARGS"
                | "RESULTS" | "GLOBALS"
        )
    }

    fn is_character_text_base(&self, name: &str) -> bool {
        matches!(
            name.trim().to_uppercase().as_str(),
            "NAME" | "CALLNAME" | "NICKNAME" | "MASTERNAME"
        )
    }

    fn character_text_fallback(&self, name: &str, index: &[i64]) -> Option<Value> {
        if !self.is_character_text_base(name) || index.is_empty() {
            return None;
        }
        let Some(id) = self.character_id_by_index(index[0]) else {
            return Some(Value::Str(String::new()));
        };
        match self.csv.name(&name.to_uppercase(), id) {
            Some(v) => Some(Value::Str(v.to_string())),
            None => Some(Value::Str(String::new())),
        }
    }

    pub(crate) fn is_ref_declared(&self, name: &str) -> bool {
        let name = name.to_uppercase();
        if let Some(fr) = self.stack.last() {
            if fr.l_ref_decl.contains(&name) {
                return true;
            }
        }
        self.g_ref_decl.contains(&name)
    }

    pub(crate) fn set_ref_binding(&mut self, name: &str, mut target: VarRef) {
        let name = name.to_uppercase();
        target.name = target.name.to_uppercase();
        if let Some(fr) = self.stack.last_mut() {
            if fr.l_ref_decl.contains(&name) {
                fr.refs.insert(name, target);
                return;
            }
        }
        if self.g_ref_decl.contains(&name) {
            self.g_refs.insert(name, target);
        }
    }

    pub(crate) fn resolve_ref_binding(&self, name: &str) -> Option<VarRef> {
        let name = name.to_uppercase();
        if let Some(fr) = self.stack.last() {
            if let Some(t) = fr.refs.get(&name) {
                return Some(t.clone());
            }
        }
        self.g_refs.get(&name).cloned()
    }

    pub(crate) fn eval_index_exprs(&mut self, exprs: &[Expr]) -> Result<Vec<i64>> {
        self.eval_index_exprs_for("", exprs)
    }

    /// Evaluates index expressions; bare identifiers and string values are
    /// first tried as symbolic keys in the base variable's CSV table.
    pub(crate) fn eval_index_exprs_for(
        &mut self,
        base_name: &str,
        exprs: &[Expr],
    ) -> Result<Vec<i64>> {
        let csv_base = csv_base_from_var_name(base_name);
        let mut idx = Vec::with_capacity(exprs.len());
        for expr in exprs {
            if let Some(mapped) = self.resolve_named_csv_index(base_name, expr) {
                idx.push(mapped);
                continue;
            }
            let v = self.eval_expr(expr)?;
            if let Some(mapped) = self.resolve_named_csv_index_value(&csv_base, &v) {
                idx.push(mapped);
                continue;
            }
            idx.push(v.as_int());
        }
        Ok(idx)
    }

    fn resolve_named_csv_index(&self, base_name: &str, expr: &Expr) -> Option<i64> {
        let base_name = base_name.trim().to_uppercase();
        if base_name.is_empty() {
            return None;
        }
        let Expr::Var(var) = expr else { return None };
        if !var.index.is_empty() {
            return None;
        }
        let key = var.name.trim();
        if key.is_empty() || self.symbol_exists(key) {
            return None;
        }
        self.csv.find_id(&csv_base_from_var_name(&base_name), key)
    }

    fn resolve_named_csv_index_value(&self, csv_base: &str, v: &Value) -> Option<i64> {
        if csv_base.is_empty() || !v.is_str() {
            return None;
        }
        let key = v.as_str();
        let key = key.trim();
        if key.is_empty() || is_numeric_like(key) {
            return None;
        }
        self.csv.find_id(csv_base, key)
    }

    pub(crate) fn symbol_exists(&self, name: &str) -> bool {
        let name = name.trim().to_uppercase();
        if name.is_empty() {
            return false;
        }
        if self.resolve_ref_binding(&name).is_some() {
            return true;
        }
        if let Some(fr) = self.stack.last() {
            if fr.locals.contains_key(&name)
                || fr.l_arrays.contains_key(&name)
                || fr.l_ref_decl.contains(&name)
                || fr.refs.contains_key(&name)
            {
                return true;
            }
        }
        self.globals.contains_key(&name)
            || self.g_arrays.contains_key(&name)
            || self.g_ref_decl.contains(&name)
            || self.g_refs.contains_key(&name)
            || self.program.string_vars.contains(&name)
    }

    pub(crate) fn parse_var_ref_runtime(&self, raw: &str) -> Result<VarRef> {
        match era_parser::parse_expr(raw.trim())? {
            Expr::Var(v) => Ok(v),
            _ => Err(EraError("not a variable reference".into())),
        }
    }

    pub(crate) fn default_value_for_func_arg_target(&self, target: &VarRef) -> Value {
        let name = target.name.trim().to_uppercase();
        if self.is_string_array_base(&name) || self.program.string_vars.contains(&name) {
            Value::Str(String::new())
        } else {
            Value::Int(0)
        }
    }
}

pub(crate) fn normalize_func_arg_target(arg: &era_ast::Arg, position: usize) -> VarRef {
    let mut target = if arg.target.name.trim().is_empty() {
        VarRef::scalar(arg.name.clone())
    } else {
        arg.target.clone()
    };
    target.name = target.name.trim().to_uppercase();
    if target.index.is_empty() && (target.name == "ARG" || target.name == "ARGS") {
        target.index = vec![Expr::Int(position as i64)];
    }
    target
}

pub(crate) fn is_result_like_name(name: &str) -> bool {
    let name = name.trim().to_uppercase();
    name == "RESULT" || name == "RESULTS"
}

pub(crate) fn csv_base_from_var_name(name: &str) -> String {
    let name = name.trim().to_uppercase();
    match name.as_str() {
        "MAXBASE" => "BASE".to_string(), // MAXBASE indices use BASE.CSV labels
        _ => name,
    }
}

pub(crate) fn is_numeric_like(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() {
        return false;
    }
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    if s.is_empty() {
        return false;
    }
    let mut parts = s.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next();
    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    match frac_part {
        None => true,
        Some(f) => !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()),
    }
}

pub(crate) fn should_newline_on_print(name: &str) -> bool {
    name.starts_with("PRINTL")
        || name.starts_with("DEBUGPRINTL")
        || name.ends_with('L')
        || name.ends_with('W')
}

fn statement_name(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Print { .. } => "print",
        Statement::Assign { .. } | Statement::AssignForm { .. } => "assign",
        Statement::IncDec { .. } => "incdec",
        Statement::If { .. } => "if",
        Statement::While { .. } => "while",
        Statement::DoWhile { .. } => "do",
        Statement::Repeat { .. } => "repeat",
        Statement::For { .. } => "for",
        Statement::SelectCase { .. } => "selectcase",
        Statement::Goto { .. } => "goto",
        Statement::Call { .. } => "call",
        Statement::Return { .. } => "return",
        Statement::Begin { .. } => "begin",
        Statement::Quit => "quit",
        Statement::Break => "break",
        Statement::Continue => "continue",
        Statement::PrintData { .. } => "printdata",
        Statement::StrData { .. } => "strdata",
        Statement::Command { .. } => "command",
    }
}

fn wall_clock_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5DEECE66D)
}

// FNV-1a 64: the save identity must be stable across platforms, so it is
// spelled out rather than borrowed from a hasher with unspecified keys.
struct Fnv64(u64);

impl Fnv64 {
    fn new() -> Self {
        Fnv64(0xcbf29ce484222325)
    }
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }
    fn finish(&self) -> u64 {
        self.0
    }
}
