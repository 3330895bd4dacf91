//! Source-to-AST front end: preprocessing, declaration (ERH) parsing, and
//! function/statement (ERB) parsing into an [`era_ast::Program`].

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use era_ast::{
    Arg, CaseBranch, CaseCondition, DataItem, DeclScope, Expr, Function, IfBranch, Program,
    Statement, Thunk, VarDecl,
};
use era_common::{EraError, Result};

pub mod commands;
pub mod dim;
pub mod expr;
pub mod preprocess;

pub use commands::{is_known_command, known_command_count, known_commands, split_known_command_prefix};
pub use expr::{decode_char_seq, parse_expr, parse_expr_list, parse_var_ref_text, split_top_level};

use preprocess::{preprocess, to_lines, Line};

const EVENT_FUNCTIONS: &[&str] = &[
    "EVENTSHOP", "EVENTFIRST", "EVENTTRAIN", "EVENTEND", "EVENTTURNEND", "EVENTCOM", "EVENTLOAD",
    "SYSTEM_TITLE",
];

fn is_event_function(name: &str) -> bool {
    EVENT_FUNCTIONS.contains(&name)
}

pub fn parse_program(files: &HashMap<String, String>) -> Result<Program> {
    let mut erh = HashMap::new();
    let mut erb = HashMap::new();
    let mut csv = HashMap::new();
    for (file, content) in files {
        let upper = file.to_uppercase();
        if upper.ends_with(".ERH") {
            erh.insert(file.clone(), content.clone());
        } else if upper.ends_with(".ERB") {
            erb.insert(file.clone(), content.clone());
        } else if upper.ends_with(".CSV") {
            csv.insert(file.clone(), content.clone());
        }
    }

    if erb.is_empty() {
        return Err(EraError("no ERB files found".into()));
    }

    let mut macros = HashSet::new();
    let erh_res = parse_erh(&erh, &mut macros)?;
    let erb_res = parse_erb(&erb, &macros)?;

    let mut program = Program {
        defines: erh_res.defines,
        functions: HashMap::new(),
        order: erb_res.order,
        events: HashMap::new(),
        csv_files: csv,
        string_vars: erh_res.string_vars,
        var_decls: erh_res.var_decls,
    };

    // Thunk ids key the runtime's precomputed flow maps; hand them out once
    // per program, then freeze functions behind Rc.
    let mut next_id = 0u32;
    let mut functions = erb_res.functions;
    for fun in functions.values_mut() {
        assign_thunk_ids(&mut fun.body, &mut next_id);
    }
    let mut shared: HashMap<String, Rc<Function>> = HashMap::new();
    for (name, fun) in functions {
        shared.insert(name, Rc::new(fun));
    }
    for (event, names) in erb_res.event_order {
        let mut handlers: Vec<Rc<Function>> = Vec::with_capacity(names.len());
        for key in names {
            if let Some(f) = shared.get(&key) {
                handlers.push(f.clone());
            }
        }
        handlers.sort_by(|a, b| b.priority.cmp(&a.priority));
        program.events.insert(event, handlers);
    }
    program.functions = shared;
    Ok(program)
}

fn assign_thunk_ids(thunk: &mut Thunk, next: &mut u32) {
    thunk.id = *next;
    *next += 1;
    for stmt in &mut thunk.statements {
        for child in stmt.child_thunks_mut() {
            assign_thunk_ids(child, next);
        }
    }
}

struct ErhResult {
    defines: HashMap<String, Expr>,
    string_vars: HashSet<String>,
    var_decls: Vec<VarDecl>,
}

fn parse_erh(files: &HashMap<String, String>, macros: &mut HashSet<String>) -> Result<ErhResult> {
    let mut result = ErhResult {
        defines: HashMap::new(),
        string_vars: HashSet::new(),
        var_decls: Vec::new(),
    };
    let mut keys: Vec<&String> = files.keys().collect();
    keys.sort();
    for file in keys {
        let lines = preprocess(to_lines(file, &files[file]), macros);
        for line in lines {
            let Some(content) = line.content.strip_prefix('#') else { continue };
            let content = content.trim();
            let upper = content.to_uppercase();
            if let Some(rest) = upper.strip_prefix("DEFINE") {
                if rest.is_empty() {
                    return Err(EraError(format!("{}:{}: invalid #DEFINE", line.file, line.number)));
                }
                let rest = content["DEFINE".len()..].trim();
                let (name, expr_raw) = split_name_and_rest(rest);
                if name.is_empty() {
                    return Err(EraError(format!(
                        "{}:{}: invalid #DEFINE name",
                        line.file, line.number
                    )));
                }
                let uname = name.to_uppercase();
                let expr = if expr_raw.trim().is_empty() {
                    Expr::Int(1)
                } else {
                    parse_expr(&expr_raw)
                        .map_err(|e| EraError(format!("{}:{}: {}", line.file, line.number, e)))?
                };
                result.defines.insert(uname.clone(), expr);
                macros.insert(uname);
                continue;
            }
            let parsed = if let Some(rest) = upper.strip_prefix("DIMS ") {
                let _ = rest;
                dim::parse_dim_decl(&content["DIMS".len()..], true, DeclScope::Global)
            } else if upper.strip_prefix("DIM ").is_some() {
                dim::parse_dim_decl(&content["DIM".len()..], false, DeclScope::Global)
            } else {
                None
            };
            if let Some(d) = parsed {
                if d.decl.is_string {
                    result.string_vars.insert(d.decl.name.clone());
                }
                for (i, init) in d.inits.iter().enumerate() {
                    result.defines.insert(format!("{}:{}", d.decl.name, i), init.clone());
                }
                result.var_decls.push(d.decl);
            }
        }
    }
    Ok(result)
}

fn split_name_and_rest(raw: &str) -> (String, String) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (String::new(), String::new());
    }
    for (i, r) in raw.char_indices() {
        if i == 0 {
            continue;
        }
        if r.is_whitespace() || !expr::is_ident_part(r) {
            return (
                raw[..i].trim().to_string(),
                raw[i + r.len_utf8()..].trim().to_string(),
            );
        }
    }
    (raw.to_string(), String::new())
}

struct ErbResult {
    functions: HashMap<String, Function>,
    order: Vec<String>,
    // Event name -> function-map keys holding each collected handler.
    event_order: HashMap<String, Vec<String>>,
}

fn parse_erb(files: &HashMap<String, String>, macros: &HashSet<String>) -> Result<ErbResult> {
    let mut result = ErbResult {
        functions: HashMap::new(),
        order: Vec::new(),
        event_order: HashMap::new(),
    };
    let mut keys: Vec<&String> = files.keys().collect();
    keys.sort();
    for file in keys {
        let lines = preprocess(to_lines(file, &files[file]), macros);
        let mut i = 0;
        while i < lines.len() {
            if !lines[i].content.starts_with('@') {
                return Err(EraError(format!(
                    "{}:{}: expected function definition, got {:?}",
                    lines[i].file, lines[i].number, lines[i].content
                )));
            }
            let (fun, consumed) = parse_function(&lines, i)?;
            i += consumed;
            if is_event_function(&fun.name) {
                // Every handler body is retained; extras are stored under a
                // suffixed key and dispatched through the event lists.
                let list = result.event_order.entry(fun.name.clone()).or_default();
                let key = if result.functions.contains_key(&fun.name) {
                    format!("{}#{}", fun.name, list.len())
                } else {
                    result.order.push(fun.name.clone());
                    fun.name.clone()
                };
                list.push(key.clone());
                result.functions.insert(key, fun);
                continue;
            }
            if let Some(existing) = result.functions.get_mut(&fun.name) {
                merge_duplicate_function(existing, fun)
                    .map_err(|e| EraError(format!("{}:{}: {}", lines[i - consumed].file, lines[i - consumed].number, e)))?;
                continue;
            }
            result.order.push(fun.name.clone());
            result.functions.insert(fun.name.clone(), fun);
        }
    }
    Ok(result)
}

fn merge_duplicate_function(dst: &mut Function, src: Function) -> Result<()> {
    if dst.args.len() != src.args.len() {
        return Err(EraError(format!(
            "duplicate function {}: argument count mismatch ({} vs {})",
            dst.name,
            dst.args.len(),
            src.args.len()
        )));
    }
    for (a, b) in dst.args.iter().zip(src.args.iter()) {
        if a.name != b.name {
            return Err(EraError(format!(
                "duplicate function {}: argument mismatch ({} vs {})",
                dst.name, a.name, b.name
            )));
        }
    }
    let offset = dst.body.statements.len();
    dst.body.statements.extend(src.body.statements);
    for (label, idx) in src.body.labels {
        dst.body.labels.insert(label, idx + offset);
    }
    dst.var_decls.extend(src.var_decls);
    Ok(())
}

fn parse_function(lines: &[Line], from: usize) -> Result<(Function, usize)> {
    let def = &lines[from];
    let (name, args) = parse_function_def(&def.content)
        .map_err(|e| EraError(format!("{}:{}: {}", def.file, def.number, e)))?;
    let mut idx = from + 1;
    let mut var_decls = Vec::new();
    let mut priority = 0i64;
    while idx < lines.len() && lines[idx].content.starts_with('#') {
        let prop = lines[idx].content[1..].trim().to_string();
        let upper = prop.to_uppercase();
        if upper == "PRI" {
            priority = 1;
        } else if upper.starts_with("DIMS ") {
            if let Some(d) = dim::parse_dim_decl(&prop["DIMS".len()..], true, DeclScope::Local) {
                var_decls.push(d.decl);
            }
        } else if upper.starts_with("DIM ") {
            if let Some(d) = dim::parse_dim_decl(&prop["DIM".len()..], false, DeclScope::Local) {
                var_decls.push(d.decl);
            }
        }
        idx += 1;
    }
    let mut end = idx;
    while end < lines.len() && !lines[end].content.starts_with('@') {
        end += 1;
    }
    // Declarations may also appear between statements; hoist them to the
    // function entry (plain #DIM stays global there, unlike the property
    // block where LOCAL is the default).
    let mut body_lines = Vec::with_capacity(end - idx);
    for line in &lines[idx..end] {
        let Some(prop) = line.content.strip_prefix('#') else {
            body_lines.push(line.clone());
            continue;
        };
        let prop = prop.trim();
        let upper = prop.to_uppercase();
        if upper.starts_with("DIMS ") {
            if let Some(d) = dim::parse_dim_decl(&prop["DIMS".len()..], true, DeclScope::Global) {
                var_decls.push(d.decl);
            }
        } else if upper.starts_with("DIM ") {
            if let Some(d) = dim::parse_dim_decl(&prop["DIM".len()..], false, DeclScope::Global) {
                var_decls.push(d.decl);
            }
        }
    }
    let (thunk, consumed) = parse_thunk(&body_lines, None)?;
    if consumed != body_lines.len() {
        return Err(EraError(format!(
            "{}:{}: parser consumed {}/{} lines",
            def.file,
            def.number,
            consumed,
            body_lines.len()
        )));
    }
    Ok((Function { name, args, body: thunk, var_decls, priority }, end - from))
}

fn parse_function_def(raw: &str) -> Result<(String, Vec<Arg>)> {
    let raw = raw.trim();
    let raw = raw
        .strip_prefix('@')
        .ok_or_else(|| EraError("function must start with @".into()))?
        .trim();
    if raw.is_empty() {
        return Err(EraError("missing function name".into()));
    }
    let (name, args_raw) = if let Some(i) = raw.find('(') {
        if !raw.ends_with(')') {
            return Err(EraError("invalid function argument list".into()));
        }
        (raw[..i].trim().to_string(), raw[i + 1..raw.len() - 1].trim().to_string())
    } else {
        split_name_and_rest(raw)
    };
    if name.is_empty() {
        return Err(EraError("missing function name".into()));
    }
    Ok((name.to_uppercase(), parse_args(&args_raw)?))
}

fn parse_args(raw: &str) -> Result<Vec<Arg>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    for part in split_top_level(raw, ',') {
        if part.is_empty() {
            continue;
        }
        let (name_raw, default) = match part.find('=') {
            Some(i) => {
                let expr_raw = part[i + 1..].trim();
                let e = parse_expr(expr_raw).map_err(|e| {
                    EraError(format!("invalid default argument expression {:?}: {}", expr_raw, e))
                })?;
                (part[..i].trim().to_string(), Some(e))
            }
            None => (part.trim().to_string(), None),
        };
        let mut target = parse_var_ref_text(&name_raw)
            .map_err(|e| EraError(format!("invalid argument name {:?}: {}", name_raw, e)))?;
        if target.name.trim().is_empty() {
            return Err(EraError(format!("invalid argument name {:?}", name_raw)));
        }
        target.name = target.name.trim().to_uppercase();
        args.push(Arg { name: target.name.clone(), target, default });
    }
    Ok(args)
}

fn parse_thunk(lines: &[Line], until: Option<&dyn Fn(&str) -> bool>) -> Result<(Thunk, usize)> {
    let mut stmts = Vec::with_capacity(lines.len());
    let mut labels = HashMap::new();
    let mut idx = 0;
    while idx < lines.len() {
        let upper = lines[idx].content.to_uppercase();
        if let Some(f) = until {
            if f(&upper) {
                break;
            }
        }
        if let Some(label) = lines[idx].content.strip_prefix('$') {
            let label = label.trim().to_uppercase();
            if label.is_empty() {
                return Err(EraError(format!(
                    "{}:{}: empty label",
                    lines[idx].file, lines[idx].number
                )));
            }
            labels.insert(label, stmts.len());
            idx += 1;
            continue;
        }
        let (stmt, consumed) = parse_statement(lines, idx)?;
        stmts.push(stmt);
        idx += consumed;
    }
    Ok((Thunk { id: 0, statements: stmts, labels }, idx))
}

fn parse_statement(lines: &[Line], index: usize) -> Result<(Statement, usize)> {
    let line = &lines[index];
    let content = line.content.trim().to_string();
    if content.is_empty() {
        return Ok((Statement::Print { expr: Expr::Str(String::new()), newline: true }, 1));
    }
    let upper = content.to_uppercase();

    if upper == "IF" || upper.starts_with("IF ") {
        return parse_if(lines, index);
    }
    if upper == "WHILE" || upper.starts_with("WHILE ") {
        return parse_while(lines, index);
    }
    if upper == "DO" || upper.starts_with("DO ") {
        return parse_do_while(lines, index);
    }
    if upper == "REPEAT" || upper.starts_with("REPEAT ") {
        return parse_repeat(lines, index);
    }
    if upper == "FOR" || upper.starts_with("FOR ") {
        return parse_for(lines, index);
    }

    let (mut cmd, mut rest) = split_name_and_rest(&content);
    if !is_known_command(&cmd.to_uppercase()) {
        if let Some((known_cmd, known_rest)) = split_known_command_prefix(&content) {
            cmd = known_cmd;
            rest = known_rest;
        }
    }
    let cmd_upper = cmd.to_uppercase();

    match cmd_upper.as_str() {
        "PRINT" => {
            return Ok((
                Statement::Print { expr: parse_print_expr(&rest), newline: false },
                1,
            ));
        }
        "PRINTL" => {
            return Ok((
                Statement::Print { expr: parse_print_expr(&rest), newline: true },
                1,
            ));
        }
        "GOTO" => {
            let label = rest.trim().to_uppercase();
            if label.is_empty() {
                return Err(EraError(format!(
                    "{}:{}: missing goto label",
                    line.file, line.number
                )));
            }
            return Ok((Statement::Goto { label }, 1));
        }
        "CALL" => {
            let (name, args) = parse_call(&rest)
                .map_err(|e| EraError(format!("{}:{}: {}", line.file, line.number, e)))?;
            return Ok((Statement::Call { name, args }, 1));
        }
        "RETURN" => {
            let values = parse_expr_list(&rest)
                .map_err(|e| EraError(format!("{}:{}: {}", line.file, line.number, e)))?;
            return Ok((Statement::Return { values }, 1));
        }
        "BEGIN" => {
            let kw = rest.trim().to_uppercase();
            if kw.is_empty() {
                return Err(EraError(format!(
                    "{}:{}: missing BEGIN keyword",
                    line.file, line.number
                )));
            }
            return Ok((Statement::Begin { keyword: kw }, 1));
        }
        "QUIT" => return Ok((Statement::Quit, 1)),
        "BREAK" => return Ok((Statement::Break, 1)),
        "CONTINUE" => return Ok((Statement::Continue, 1)),
        "SIF" => {
            let cond = parse_expr(&rest).map_err(|e| {
                EraError(format!("{}:{}: invalid SIF condition: {}", line.file, line.number, e))
            })?;
            if index + 1 >= lines.len() {
                return Err(EraError(format!(
                    "{}:{}: SIF expects next statement",
                    line.file, line.number
                )));
            }
            let (next_stmt, consumed) = parse_statement(lines, index + 1)?;
            let body = Thunk { id: 0, statements: vec![next_stmt], labels: HashMap::new() };
            return Ok((
                Statement::If {
                    branches: vec![IfBranch { cond, body }],
                    else_body: Thunk::default(),
                },
                consumed + 1,
            ));
        }
        "SELECTCASE" => return parse_select_case(lines, index, &rest),
        "STRDATA" => return parse_str_data(lines, index, &rest),
        _ => {}
    }

    if cmd_upper.starts_with("PRINTDATA") {
        let (items, consumed) = parse_data_block(lines, index + 1)?;
        return Ok((Statement::PrintData { command: cmd_upper, items }, consumed + 1));
    }

    if is_known_command(&cmd_upper) {
        return Ok((Statement::Command { name: cmd_upper, arg: rest.trim().to_string() }, 1));
    }

    if let Some((target_raw, op, pre)) = split_inc_dec(&content) {
        let _ = pre;
        let target = parse_var_ref_text(&target_raw)
            .map_err(|e| EraError(format!("{}:{}: {}", line.file, line.number, e)))?;
        return Ok((Statement::IncDec { target, op }, 1));
    }

    if let Some(assign) = split_assign(&content) {
        let target = parse_var_ref_text(&assign.left)
            .map_err(|e| EraError(format!("{}:{}: {}", line.file, line.number, e)))?;
        if assign.op == "'=" {
            return Ok((Statement::AssignForm { target, raw: assign.right }, 1));
        }
        let expr = if assign.right.trim().is_empty() {
            Expr::Empty
        } else {
            match parse_expr(&assign.right) {
                Ok(e) => e,
                Err(_) => Expr::Str(decode_char_seq(assign.right.trim())),
            }
        };
        return Ok((Statement::Assign { target, op: assign.op, expr }, 1));
    }

    if let Some(res) = parse_bare_call(&content) {
        let (name, args) =
            res.map_err(|e| EraError(format!("{}:{}: {}", line.file, line.number, e)))?;
        return Ok((Statement::Call { name, args }, 1));
    }

    if expr::is_identifier(&cmd_upper) {
        return Ok((Statement::Command { name: cmd_upper, arg: rest.trim().to_string() }, 1));
    }

    Err(EraError(format!(
        "{}:{}: unsupported statement {:?}",
        line.file, line.number, content
    )))
}

fn parse_print_expr(raw: &str) -> Expr {
    let raw = raw.trim();
    Expr::Str(decode_char_seq(raw))
}

fn parse_if(lines: &[Line], from: usize) -> Result<(Statement, usize)> {
    let mut idx = from;
    let mut branches = Vec::new();
    let mut else_body = Thunk::default();
    loop {
        if idx >= lines.len() {
            return Err(EraError(format!(
                "{}:{}: unterminated IF block",
                lines[from].file, lines[from].number
            )));
        }
        let line = &lines[idx];
        let upper = line.content.to_uppercase();
        if upper == "IF" || upper.starts_with("IF ") || upper.starts_with("ELSEIF ") {
            let kw_len = if upper.starts_with("ELSEIF") { "ELSEIF".len() } else { "IF".len() };
            let cond_raw = line.content[kw_len..].trim();
            let cond = parse_expr(cond_raw).map_err(|e| {
                EraError(format!("{}:{}: invalid IF condition: {}", line.file, line.number, e))
            })?;
            idx += 1;
            let (body, consumed) = parse_thunk(&lines[idx..], Some(&|s: &str| {
                s.starts_with("ELSEIF ") || s == "ELSE" || s == "ENDIF"
            }))?;
            idx += consumed;
            branches.push(IfBranch { cond, body });
        } else if upper == "ELSE" {
            idx += 1;
            let (body, consumed) = parse_thunk(&lines[idx..], Some(&|s: &str| s == "ENDIF"))?;
            idx += consumed;
            else_body = body;
        } else if upper == "ENDIF" {
            if branches.is_empty() {
                return Err(EraError(format!(
                    "{}:{}: empty IF block",
                    lines[from].file, lines[from].number
                )));
            }
            return Ok((Statement::If { branches, else_body }, idx - from + 1));
        } else {
            return Err(EraError(format!(
                "{}:{}: invalid token inside IF block: {:?}",
                line.file, line.number, line.content
            )));
        }
    }
}

fn parse_while(lines: &[Line], from: usize) -> Result<(Statement, usize)> {
    let line = &lines[from];
    let cond_raw = line.content["WHILE".len()..].trim();
    let cond = parse_expr(cond_raw).map_err(|e| {
        EraError(format!("{}:{}: invalid WHILE condition: {}", line.file, line.number, e))
    })?;
    let (body, consumed) = parse_thunk(&lines[from + 1..], Some(&|s: &str| s == "WEND"))?;
    let end = from + 1 + consumed;
    if end >= lines.len() || !lines[end].content.eq_ignore_ascii_case("WEND") {
        return Err(EraError(format!(
            "{}:{}: WHILE without WEND",
            line.file, line.number
        )));
    }
    Ok((Statement::While { cond, body }, consumed + 2))
}

fn parse_do_while(lines: &[Line], from: usize) -> Result<(Statement, usize)> {
    let line = &lines[from];
    let (body, consumed) =
        parse_thunk(&lines[from + 1..], Some(&|s: &str| s.starts_with("LOOP")))?;
    let end = from + 1 + consumed;
    if end >= lines.len() {
        return Err(EraError(format!("{}:{}: DO without LOOP", line.file, line.number)));
    }
    let loop_line = lines[end].content.trim();
    if !loop_line.to_uppercase().starts_with("LOOP") {
        return Err(EraError(format!("{}:{}: DO without LOOP", line.file, line.number)));
    }
    let cond_raw = loop_line["LOOP".len()..].trim();
    let cond = parse_expr(cond_raw).map_err(|e| {
        EraError(format!(
            "{}:{}: invalid LOOP condition: {}",
            lines[end].file, lines[end].number, e
        ))
    })?;
    Ok((Statement::DoWhile { body, cond }, consumed + 2))
}

fn parse_repeat(lines: &[Line], from: usize) -> Result<(Statement, usize)> {
    let line = &lines[from];
    let count_raw = line.content["REPEAT".len()..].trim();
    let count = parse_expr(count_raw).map_err(|e| {
        EraError(format!("{}:{}: invalid REPEAT count: {}", line.file, line.number, e))
    })?;
    let (body, consumed) = parse_thunk(&lines[from + 1..], Some(&|s: &str| s == "REND"))?;
    let end = from + 1 + consumed;
    if end >= lines.len() || !lines[end].content.eq_ignore_ascii_case("REND") {
        return Err(EraError(format!(
            "{}:{}: REPEAT without REND",
            line.file, line.number
        )));
    }
    Ok((Statement::Repeat { count, body }, consumed + 2))
}

fn parse_for(lines: &[Line], from: usize) -> Result<(Statement, usize)> {
    let line = &lines[from];
    let rest = line.content["FOR".len()..].trim();
    let parts = split_top_level(rest, ',');
    if parts.len() < 3 || parts.len() > 4 {
        return Err(EraError(format!(
            "{}:{}: FOR requires 3 or 4 arguments",
            line.file, line.number
        )));
    }
    let mut target = parse_var_ref_text(&parts[0]).map_err(|_| {
        EraError(format!(
            "{}:{}: invalid FOR variable {:?}",
            line.file,
            line.number,
            parts[0].trim()
        ))
    })?;
    target.name = target.name.trim().to_uppercase();
    if target.name.is_empty() {
        return Err(EraError(format!(
            "{}:{}: invalid FOR variable {:?}",
            line.file,
            line.number,
            parts[0].trim()
        )));
    }
    let init = parse_expr(&parts[1]).map_err(|e| {
        EraError(format!("{}:{}: invalid FOR init expression: {}", line.file, line.number, e))
    })?;
    let limit = parse_expr(&parts[2]).map_err(|e| {
        EraError(format!("{}:{}: invalid FOR limit expression: {}", line.file, line.number, e))
    })?;
    let step = if parts.len() == 4 {
        parse_expr(&parts[3]).map_err(|e| {
            EraError(format!("{}:{}: invalid FOR step expression: {}", line.file, line.number, e))
        })?
    } else {
        Expr::Int(1)
    };
    let (body, consumed) = parse_thunk(&lines[from + 1..], Some(&|s: &str| s == "NEXT"))?;
    let end = from + 1 + consumed;
    if end >= lines.len() || !lines[end].content.eq_ignore_ascii_case("NEXT") {
        return Err(EraError(format!("{}:{}: FOR without NEXT", line.file, line.number)));
    }
    Ok((Statement::For { target, init, limit, step, body }, consumed + 2))
}

fn parse_select_case(lines: &[Line], from: usize, rest: &str) -> Result<(Statement, usize)> {
    let head = &lines[from];
    let target = parse_expr(rest.trim()).map_err(|e| {
        EraError(format!(
            "{}:{}: invalid SELECTCASE expression: {}",
            head.file, head.number, e
        ))
    })?;

    let mut idx = from + 1;
    let mut branches = Vec::new();
    let mut else_body = Thunk::default();
    loop {
        if idx >= lines.len() {
            return Err(EraError(format!(
                "{}:{}: SELECTCASE without ENDSELECT",
                head.file, head.number
            )));
        }
        let line = &lines[idx];
        let upper = line.content.trim().to_uppercase();
        if upper.starts_with("CASE ") {
            let cond_raw = line.content.trim()["CASE".len()..].trim().to_string();
            let conditions = parse_case_conditions(&cond_raw)
                .map_err(|e| EraError(format!("{}:{}: {}", line.file, line.number, e)))?;
            idx += 1;
            let (body, consumed) = parse_thunk(&lines[idx..], Some(&|s: &str| {
                s.starts_with("CASE ") || s == "CASEELSE" || s == "ENDSELECT"
            }))?;
            idx += consumed;
            branches.push(CaseBranch { conditions, body });
        } else if upper == "CASEELSE" {
            idx += 1;
            let (body, consumed) = parse_thunk(&lines[idx..], Some(&|s: &str| s == "ENDSELECT"))?;
            idx += consumed;
            else_body = body;
        } else if upper == "ENDSELECT" {
            return Ok((
                Statement::SelectCase { target, branches, else_body },
                idx - from + 1,
            ));
        } else {
            return Err(EraError(format!(
                "{}:{}: unexpected token in SELECTCASE block: {:?}",
                line.file, line.number, line.content
            )));
        }
    }
}

fn parse_case_conditions(raw: &str) -> Result<Vec<CaseCondition>> {
    let parts = split_top_level(raw, ',');
    let mut conditions = Vec::with_capacity(parts.len());
    for p in parts {
        let p = p.trim();
        if p.is_empty() {
            continue;
        }
        let upper = p.to_uppercase();
        if upper.starts_with("IS ") {
            let rest = p["IS".len()..].trim();
            let mut op = "";
            let mut expr_raw = rest;
            for candidate in ["==", "!=", "<=", ">=", "<", ">"] {
                if rest.starts_with(candidate) {
                    op = candidate;
                    expr_raw = rest[candidate.len()..].trim();
                    break;
                }
            }
            if op.is_empty() {
                return Err(EraError("invalid CASE IS comparator".into()));
            }
            let e = parse_expr(expr_raw)
                .map_err(|e| EraError(format!("invalid CASE IS expression: {}", e)))?;
            conditions.push(CaseCondition::Compare { op: op.to_string(), expr: e });
            continue;
        }
        if let Some(i) = upper.find(" TO ") {
            let from_expr = parse_expr(p[..i].trim())
                .map_err(|e| EraError(format!("invalid CASE range from expression: {}", e)))?;
            let to_expr = parse_expr(p[i + " TO ".len()..].trim())
                .map_err(|e| EraError(format!("invalid CASE range to expression: {}", e)))?;
            conditions.push(CaseCondition::Range { from: from_expr, to: to_expr });
            continue;
        }
        let e = parse_expr(p)
            .map_err(|e| EraError(format!("invalid CASE condition expression: {}", e)))?;
        conditions.push(CaseCondition::Equal(e));
    }
    if conditions.is_empty() {
        return Err(EraError("CASE requires at least one condition".into()));
    }
    Ok(conditions)
}

fn parse_str_data(lines: &[Line], from: usize, rest: &str) -> Result<(Statement, usize)> {
    let head = &lines[from];
    let target_raw = rest.trim();
    if target_raw.is_empty() {
        return Err(EraError(format!(
            "{}:{}: STRDATA requires destination variable",
            head.file, head.number
        )));
    }
    let target = parse_var_ref_text(target_raw)
        .map_err(|e| EraError(format!("{}:{}: {}", head.file, head.number, e)))?;
    let (items, consumed) = parse_data_block(lines, from + 1)?;
    Ok((Statement::StrData { target, items }, consumed + 1))
}

fn parse_data_block(lines: &[Line], from: usize) -> Result<(Vec<DataItem>, usize)> {
    let mut idx = from;
    let mut items = Vec::new();
    loop {
        if idx >= lines.len() {
            let head = &lines[from - 1];
            return Err(EraError(format!(
                "{}:{}: DATA block without ENDDATA",
                head.file, head.number
            )));
        }
        let line = &lines[idx];
        let upper = line.content.trim().to_uppercase();
        if upper == "ENDDATA" {
            return Ok((items, idx - from + 1));
        } else if upper == "DATALIST" || upper == "ENDLIST" {
            // grouping markers, no payload
        } else if upper.starts_with("DATAFORM ") || upper == "DATAFORM" {
            let raw = line.content.trim();
            let raw = raw[raw.len().min("DATAFORM".len())..].trim().to_string();
            items.push(DataItem { is_form: true, raw });
        } else if upper.starts_with("DATA ") || upper == "DATA" {
            let raw = line.content.trim();
            let raw = raw[raw.len().min("DATA".len())..].trim().to_string();
            items.push(DataItem { is_form: false, raw });
        } else {
            return Err(EraError(format!(
                "{}:{}: invalid token in DATA block: {:?}",
                line.file, line.number, line.content
            )));
        }
        idx += 1;
    }
}

fn parse_call(raw: &str) -> Result<(String, Vec<Expr>)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(EraError("missing call target".into()));
    }
    if let Some(i) = raw.find('(') {
        let comma = raw.find(',');
        let paren_first = comma.map_or(true, |c| c > i);
        if paren_first {
            if !raw.ends_with(')') {
                return Err(EraError("invalid call syntax".into()));
            }
            let name = raw[..i].trim().to_uppercase();
            if !expr::is_identifier(&name) {
                return Err(EraError(format!("invalid function name {:?}", name)));
            }
            let arg_raw = raw[i + 1..raw.len() - 1].trim();
            let args = match parse_expr_list(arg_raw) {
                Ok(args) => args,
                Err(_) => split_top_level(arg_raw, ',')
                    .into_iter()
                    .map(|p| {
                        if p.is_empty() {
                            Expr::Empty
                        } else {
                            Expr::Str(decode_char_seq(&p))
                        }
                    })
                    .collect(),
            };
            return Ok((name, args));
        }
    }
    let parts = split_top_level(raw, ',');
    let name = parts[0].trim().to_uppercase();
    if !expr::is_identifier(&name) {
        return Err(EraError(format!("invalid function name {:?}", name)));
    }
    let mut args = Vec::with_capacity(parts.len().saturating_sub(1));
    for p in &parts[1..] {
        if p.is_empty() {
            args.push(Expr::Empty);
            continue;
        }
        match parse_expr(p) {
            Ok(e) => args.push(e),
            Err(_) => args.push(Expr::Str(decode_char_seq(p))),
        }
    }
    Ok((name, args))
}

// `NAME(args)` alone on a line, no spaces outside the parens.
fn parse_bare_call(raw: &str) -> Option<Result<(String, Vec<Expr>)>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(' ') {
        return None;
    }
    let i = raw.find('(')?;
    if i == 0 || !raw.ends_with(')') {
        return None;
    }
    let name = raw[..i].trim().to_uppercase();
    if !expr::is_identifier(&name) {
        return None;
    }
    match parse_expr_list(raw[i + 1..raw.len() - 1].trim()) {
        Ok(args) => Some(Ok((name, args))),
        Err(e) => Some(Err(e)),
    }
}

pub struct AssignParts {
    pub left: String,
    pub op: String,
    pub right: String,
}

pub fn split_assign(raw: &str) -> Option<AssignParts> {
    let runes: Vec<char> = raw.chars().collect();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escape = false;
    for i in 0..runes.len() {
        let r = runes[i];
        if in_str {
            if escape {
                escape = false;
                continue;
            }
            match r {
                '\\' => escape = true,
                '"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match r {
            '"' => in_str = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '=' => {
                if depth != 0 {
                    continue;
                }
                let prev = if i > 0 { runes[i - 1] } else { '\0' };
                let prev2 = if i > 1 { runes[i - 2] } else { '\0' };
                let next = if i + 1 < runes.len() { runes[i + 1] } else { '\0' };
                if next == '=' || prev == '!' || prev == '=' {
                    continue;
                }
                if (prev == '<' || prev == '>') && prev2 != prev {
                    continue;
                }
                let mut left: String = runes[..i].iter().collect::<String>().trim().to_string();
                let right: String = runes[i + 1..].iter().collect::<String>().trim().to_string();
                if left.is_empty() {
                    return None;
                }
                let mut op = "=".to_string();
                if left.ends_with('\'') {
                    op = "'=".to_string();
                    left = left[..left.len() - 1].trim().to_string();
                } else {
                    for c in ["<<", ">>", "+", "-", "*", "/", "%", "&", "|", "^"] {
                        if left.ends_with(c) {
                            op = format!("{}=", c);
                            left = left[..left.len() - c.len()].trim().to_string();
                            break;
                        }
                    }
                }
                return Some(AssignParts { left, op, right });
            }
            _ => {}
        }
    }
    None
}

pub fn split_inc_dec(raw: &str) -> Option<(String, String, bool)> {
    let trimmed = raw.trim();
    if trimmed.chars().count() < 3 {
        return None;
    }
    for op in ["++", "--"] {
        if let Some(rest) = trimmed.strip_prefix(op) {
            let name = rest.trim();
            if !name.is_empty() {
                return Some((name.to_string(), op.to_string(), true));
            }
        }
        if let Some(rest) = trimmed.strip_suffix(op) {
            let name = rest.trim();
            if !name.is_empty() {
                return Some((name.to_string(), op.to_string(), false));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_of(src: &str) -> Program {
        let mut files = HashMap::new();
        files.insert("MAIN.ERB".to_string(), src.to_string());
        parse_program(&files).expect("parse program")
    }

    #[test]
    fn parses_functions_and_labels() {
        let p = program_of("@TITLE\n$TOP\nA = 1\nGOTO TOP\n@SUB(X)\nRETURN X\n");
        assert_eq!(p.order, vec!["TITLE", "SUB"]);
        let title = &p.functions["TITLE"];
        assert_eq!(title.body.labels["TOP"], 0);
        assert_eq!(p.functions["SUB"].args.len(), 1);
    }

    #[test]
    fn duplicate_functions_merge_with_label_offset() {
        let p = program_of("@F\nA = 1\n@F\n$MORE\nA = 2\n");
        let f = &p.functions["F"];
        assert_eq!(f.body.statements.len(), 2);
        assert_eq!(f.body.labels["MORE"], 1);
    }

    #[test]
    fn sif_wraps_exactly_one_statement() {
        let p = program_of("@TITLE\nSIF A\nB = 1\nC = 2\n");
        let body = &p.functions["TITLE"].body.statements;
        assert_eq!(body.len(), 2);
        match &body[0] {
            Statement::If { branches, .. } => assert_eq!(branches[0].body.statements.len(), 1),
            other => panic!("expected SIF expansion, got {:?}", other),
        }
    }

    #[test]
    fn event_functions_collect_in_priority_order() {
        let src = "@EVENTSHOP\nPRINTL a\n@EVENTSHOP\n#PRI\nPRINTL b\n";
        let p = program_of(src);
        let handlers = &p.events["EVENTSHOP"];
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].priority, 1);
    }

    #[test]
    fn command_prefix_without_space() {
        let p = program_of("@TITLE\nPRINTV A\n");
        match &p.functions["TITLE"].body.statements[0] {
            Statement::Command { name, arg } => {
                assert_eq!(name, "PRINTV");
                assert_eq!(arg, "A");
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn assignment_operators_split() {
        let a = split_assign("A:1 += B").unwrap();
        assert_eq!((a.left.as_str(), a.op.as_str(), a.right.as_str()), ("A:1", "+=", "B"));
        let b = split_assign("S '= hi %A%").unwrap();
        assert_eq!(b.op, "'=");
        assert!(split_assign("A == B").is_none());
        let c = split_assign("A <<= 2").unwrap();
        assert_eq!(c.op, "<<=");
    }

    #[test]
    fn erh_defines_and_dims() {
        let mut files = HashMap::new();
        files.insert("M.ERH".to_string(), "#DEFINE DBG\n#DIM FLAG, 8\n#DIMS WORDS, 2 = \"a\", \"b\"\n".to_string());
        files.insert("M.ERB".to_string(), "@TITLE\nQUIT\n".to_string());
        let p = parse_program(&files).unwrap();
        assert!(p.defines.contains_key("DBG"));
        assert!(p.defines.contains_key("WORDS:0"));
        assert!(p.string_vars.contains("WORDS"));
        assert_eq!(p.var_decls.len(), 2);
    }

    #[test]
    fn define_gates_conditional_blocks_in_erb() {
        let mut files = HashMap::new();
        files.insert("M.ERH".to_string(), "#DEFINE EXTRA\n".to_string());
        files.insert(
            "M.ERB".to_string(),
            "@TITLE\n[IF EXTRA]\nA = 1\n[ENDIF]\nQUIT\n".to_string(),
        );
        let p = parse_program(&files).unwrap();
        assert_eq!(p.functions["TITLE"].body.statements.len(), 2);
    }
}
