//! Built-in command dispatch. Commands receive their raw argument text and
//! the active VM; most failures resolve to `RESULT = 0` rather than errors.

use chrono::{Local, Timelike, Utc};
use era_common::{EraError, Result};
use era_parser::{decode_char_seq, parse_expr, parse_expr_list, split_top_level};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::array::ArrayVar;
use crate::chara::normalize_align;
use crate::value::Value;
use crate::vm::{should_newline_on_print, ExecResult, Vm};
use crate::Output;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]*>").expect("static pattern"));

impl Vm {
    pub(crate) fn run_command(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let name = name.trim().to_uppercase();
        let arg = arg.trim();

        if (name.starts_with("PRINT") || name.starts_with("DEBUGPRINT"))
            && name != "PRINTCPERLINE"
        {
            // PRINTDATA blocks arrive as their own statement kind; anything
            // else in the family is a single-line print.
            let text = self.eval_command_print(&name, arg)?;
            if !self.ui.skip_disp {
                self.emit_output(Output::text(text, should_newline_on_print(&name)));
            }
            if name.ends_with('W') {
                self.implicit_wait(&name)?;
            }
            return Ok(ExecResult::None);
        }

        match name.as_str() {
            "WAIT" | "WAITANYKEY" | "FORCEWAIT" | "TWAIT" | "AWAIT" => {
                return self.exec_wait_like(&name, arg)
            }
            "INPUT" | "ONEINPUT" | "TINPUT" | "TONEINPUT" => {
                return self.exec_input_int_like(&name, arg)
            }
            "INPUTS" | "ONEINPUTS" | "TINPUTS" | "TONEINPUTS" => {
                return self.exec_input_string_like(&name, arg)
            }
            "GETTIME" => {
                self.set_result_int(Utc::now().timestamp());
                return Ok(ExecResult::None);
            }
            "GETSECOND" => {
                self.set_result_int(Local::now().second() as i64);
                return Ok(ExecResult::None);
            }
            "GETMILLISECOND" => {
                self.set_result_int((Local::now().nanosecond() / 1_000_000) as i64);
                return Ok(ExecResult::None);
            }
            "RANDOMIZE" => {
                self.reseed_from_clock();
                return Ok(ExecResult::None);
            }
            "INITRAND" => {
                if !arg.is_empty() {
                    if let Ok(v) = self.eval_loose_expr(arg) {
                        self.reseed(v.as_int() as u64);
                    }
                }
                return Ok(ExecResult::None);
            }
            "DUMPRAND" => {
                let v: i64 = self.rng.gen_range(0..i64::MAX);
                self.set_result_int(v);
                return Ok(ExecResult::None);
            }
            "RESTART" => return Ok(ExecResult::Begin("TITLE".to_string())),
            "THROW" => {
                if arg.is_empty() {
                    return Err(EraError("THROW without message".into()));
                }
                let v = self.eval_loose_expr(arg)?;
                return Err(EraError(format!("THROW: {}", v.as_str())));
            }
            "RETURNFORM" => {
                let text = self.eval_print_form(arg)?;
                return Ok(ExecResult::Return(vec![Value::Str(text)]));
            }
            "RETURNF" => {
                let values = self.eval_expr_list_values(arg)?;
                let mut out = Vec::with_capacity(values.len());
                for v in values {
                    out.push(match v {
                        Value::Str(s) => Value::Str(self.expand_form_template(&s)?),
                        other => other,
                    });
                }
                return Ok(ExecResult::Return(out));
            }
            "BEGIN" => {
                if arg.is_empty() {
                    return Err(EraError("BEGIN without keyword".into()));
                }
                return Ok(ExecResult::Begin(arg.to_uppercase()));
            }
            "QUIT" => return Ok(ExecResult::Quit),
            "SAVEDATA" => return self.exec_save_data(arg),
            "LOADDATA" => return self.exec_load_data(arg),
            "DELDATA" => return self.exec_delete_data(arg),
            "CHKDATA" => return self.exec_check_data(arg),
            "SAVEGAME" => return self.exec_save_game(arg),
            "LOADGAME" => return self.exec_load_game(arg),
            "SAVEGLOBAL" => {
                self.save_globals("global")?;
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "LOADGLOBAL" => {
                let ok = self.load_globals("global")?;
                self.set_result_int(ok as i64);
                return Ok(ExecResult::None);
            }
            "SAVEVAR" => return self.exec_save_var(arg),
            "LOADVAR" => return self.exec_load_var(arg),
            "SAVECHARA" => return self.exec_save_chara(arg),
            "LOADCHARA" => return self.exec_load_chara(arg),
            "VARSET" | "CVARSET" => return self.exec_var_set(arg),
            "TIMES" => return self.exec_times(arg),
            "SPLIT" => return self.exec_split(arg),
            "ESCAPE" => return self.exec_escape(arg),
            "ENCODETOUNI" => return self.exec_encode_to_uni(arg),
            "PUTFORM" => return self.exec_put_form(arg),
            "BAR" | "BARL" => return self.exec_bar(&name, arg),
            "SETBIT" | "CLEARBIT" | "INVERTBIT" => return self.exec_bit_mutation(&name, arg),
            "GETBIT" => return self.exec_get_bit(arg),
            "SWAP" => return self.exec_swap(arg),
            "ARRAYSHIFT" => return self.exec_array_shift(arg),
            "ARRAYREMOVE" => return self.exec_array_remove(arg),
            "ARRAYCOPY" => return self.exec_array_copy(arg),
            "ARRAYSORT" => return self.exec_array_sort(arg),
            "DRAWLINE" | "CUSTOMDRAWLINE" | "DRAWLINEFORM" => return self.exec_draw_line(&name, arg),
            "CLEARLINE" => return self.exec_clear_line(arg),
            "REUSELASTLINE" => return self.exec_reuse_last_line(),
            "ALIGNMENT" => return self.exec_alignment(arg),
            "CURRENTALIGN" => {
                let align = self.ui.align.clone();
                self.set_result_str(align);
                return Ok(ExecResult::None);
            }
            "REDRAW" => return self.exec_redraw(arg),
            "CURRENTREDRAW" => {
                self.set_result_int(self.ui.redraw as i64);
                return Ok(ExecResult::None);
            }
            "SKIPDISP" | "MOUSESKIP" | "NOSKIP" | "ENDNOSKIP" => return self.exec_skip_disp(&name, arg),
            "ISSKIP" => {
                self.set_result_int(self.ui.skip_disp as i64);
                return Ok(ExecResult::None);
            }
            "SETCOLOR" | "SETCOLORBYNAME" => return self.exec_set_color(arg, false),
            "SETBGCOLOR" | "SETBGCOLORBYNAME" => return self.exec_set_color(arg, true),
            "RESETCOLOR" => {
                self.ui.color = "FFFFFF".to_string();
                return Ok(ExecResult::None);
            }
            "RESETBGCOLOR" => {
                self.ui.bg_color = "000000".to_string();
                return Ok(ExecResult::None);
            }
            "GETCOLOR" => {
                let c = self.ui.color.clone();
                self.set_result_str(c);
                return Ok(ExecResult::None);
            }
            "GETBGCOLOR" => {
                let c = self.ui.bg_color.clone();
                self.set_result_str(c);
                return Ok(ExecResult::None);
            }
            "GETDEFCOLOR" => {
                self.set_result_str("FFFFFF".to_string());
                return Ok(ExecResult::None);
            }
            "GETDEFBGCOLOR" => {
                self.set_result_str("000000".to_string());
                return Ok(ExecResult::None);
            }
            "GETFOCUSCOLOR" => {
                let c = self.ui.focus_color.clone();
                self.set_result_str(c);
                return Ok(ExecResult::None);
            }
            "SETFONT" => {
                self.ui.font = arg.to_string();
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "GETFONT" => {
                let f = self.ui.font.clone();
                self.set_result_str(f);
                return Ok(ExecResult::None);
            }
            "CHKFONT" => {
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "FONTBOLD" => {
                self.ui.bold = true;
                return Ok(ExecResult::None);
            }
            "FONTITALIC" => {
                self.ui.italic = true;
                return Ok(ExecResult::None);
            }
            "FONTREGULAR" => {
                self.ui.bold = false;
                self.ui.italic = false;
                return Ok(ExecResult::None);
            }
            "FONTSTYLE" => {
                let v = self.eval_loose_expr(arg)?;
                let style = v.as_int();
                self.ui.bold = style & 1 != 0;
                self.ui.italic = style & 2 != 0;
                self.set_result_int(style);
                return Ok(ExecResult::None);
            }
            "PRINTCPERLINE" => {
                let v = self.eval_loose_expr(arg)?;
                let n = v.as_int().max(1);
                self.ui.print_c_per_line = n;
                self.set_result_int(n);
                return Ok(ExecResult::None);
            }
            "ADDCHARA" | "ADDDEFCHARA" | "ADDVOIDCHARA" | "ADDSPCHARA" => {
                let id = if arg.is_empty() {
                    -1
                } else {
                    self.eval_loose_expr(arg).map(|v| v.as_int()).unwrap_or(-1)
                };
                let idx = self.add_character(id);
                self.set_result_int(idx);
                return Ok(ExecResult::None);
            }
            "DELCHARA" => {
                let v = self.eval_loose_expr(arg)?;
                let ok = self.delete_character_at(v.as_int());
                self.set_result_int(ok as i64);
                return Ok(ExecResult::None);
            }
            "DELALLCHARA" => {
                self.characters.clear();
                self.refresh_character_globals();
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "GETCHARA" => return self.exec_get_chara(arg),
            "FINDCHARA" => return self.exec_find_chara(arg, false),
            "FINDLASTCHARA" => return self.exec_find_chara(arg, true),
            "SWAPCHARA" => return self.exec_swap_chara(arg),
            "SORTCHARA" => {
                self.sort_characters();
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "COPYCHARA" => return self.exec_copy_chara(arg, false),
            "ADDCOPYCHARA" => return self.exec_copy_chara(arg, true),
            "PICKUPCHARA" => return self.exec_pickup_chara(arg),
            "ISACTIVE" => {
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "MOUSEX" | "MOUSEY" => {
                self.set_result_int(0);
                return Ok(ExecResult::None);
            }
            "OUTPUTLOG" | "SAVENOS" => {
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "DEBUGCLEAR" => {
                self.outputs.clear();
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "ASSERT" => {
                if arg.is_empty() {
                    return Err(EraError("ASSERT without expression".into()));
                }
                let v = self.eval_loose_expr(arg)?;
                if !v.truthy() {
                    return Err(EraError("ASSERT failed".into()));
                }
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "REF" | "REFBYNAME" => return self.exec_ref_binding(&name, arg),
            "RESETGLOBAL" => return self.exec_reset_global(),
            "RESETDATA" => return self.exec_reset_data(),
            "CATCH" => {
                // Reached only when the preceding try succeeded; skip the
                // recovery block via the precomputed end index.
                self.set_result_int(1);
                if let Some(end_idx) = self.current_catch_end_index() {
                    return Ok(ExecResult::JumpIndex(end_idx));
                }
                return Ok(ExecResult::None);
            }
            "ENDCATCH" | "FUNC" | "ENDFUNC" => {
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "HTML_PRINT" => return self.exec_html_print(arg),
            "RESET_STAIN" | "STOPCALLTRAIN" | "CBGCLEAR" | "CBGCLEARBUTTON" | "CBGREMOVEBMAP"
            | "CLEARTEXTBOX" | "UPCHECK" | "CUPCHECK" | "DOTRAIN" | "FORCEKANA"
            | "HTML_TAGSPLIT" | "INPUTMOUSEKEY" | "TOOLTIP_SETCOLOR" | "TOOLTIP_SETDELAY"
            | "TOOLTIP_SETDURATION" => {
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            "GOTO" | "GOTOFORM" | "TRYGOTO" | "TRYGOTOFORM" | "TRYCGOTO" | "TRYCGOTOFORM" => {
                return self.exec_goto_like(&name, arg)
            }
            _ => {}
        }

        if let Some(base) = name.strip_prefix("CSV") {
            if !base.is_empty() {
                return self.exec_csv_command(base, arg);
            }
        }

        if let Some(res) = self.exec_method_like(&name, arg) {
            let v = res?;
            if v.is_str() {
                self.globals.insert("RESULTS".to_string(), v);
            } else {
                self.globals.insert("RESULT".to_string(), v);
            }
            return Ok(ExecResult::None);
        }

        if matches!(
            name.as_str(),
            "CALL" | "CALLF" | "CALLFORM" | "CALLFORMF" | "TRYCALL" | "TRYCALLFORM" | "TRYCCALL"
                | "TRYCCALLFORM" | "CALLTRAIN" | "JUMP" | "JUMPFORM" | "TRYJUMP" | "TRYJUMPFORM"
                | "TRYCJUMP" | "TRYCJUMPFORM"
        ) {
            return self.exec_call_like(&name, arg);
        }

        if matches!(name.as_str(), "TRYCALLLIST" | "TRYJUMPLIST" | "TRYGOTOLIST" | "CALLEVENT") {
            return self.exec_call_list_like(&name, arg);
        }

        Ok(ExecResult::None)
    }

    pub(crate) fn set_result_int(&mut self, v: i64) {
        self.globals.insert("RESULT".to_string(), Value::Int(v));
    }

    pub(crate) fn set_result_str(&mut self, v: String) {
        self.globals.insert("RESULT".to_string(), Value::Str(v));
    }

    fn reseed(&mut self, seed: u64) {
        use rand::SeedableRng;
        self.rng = rand::rngs::StdRng::seed_from_u64(seed);
    }

    fn reseed_from_clock(&mut self) {
        use std::time::{SystemTime, UNIX_EPOCH};
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        self.reseed(seed);
    }

    // ---- print helpers ----

    fn eval_command_print(&mut self, name: &str, arg: &str) -> Result<String> {
        if name.contains("BUTTON") {
            return self.eval_print_button(arg);
        }
        if name.starts_with("PRINTS") || name.starts_with("DEBUGPRINTS") {
            return self.eval_print_s(arg);
        }
        if name.contains("FORMS") {
            return self.eval_print_forms(arg);
        }
        if name.contains("FORM") {
            return self.eval_print_form(arg);
        }
        if name.starts_with("PRINTV")
            || name.starts_with("DEBUGPRINTV")
            || name.starts_with("PRINTSINGLEV")
        {
            return self.eval_print_v(arg);
        }
        Ok(decode_char_seq(arg))
    }

    fn eval_print_s(&mut self, arg: &str) -> Result<String> {
        if let Ok(v) = self.eval_strict_expr(arg) {
            let text = v.as_str();
            if v.is_str() {
                if let Ok(expanded) = self.expand_decoded_template(&text) {
                    return Ok(expanded);
                }
            }
            return Ok(text);
        }
        let s = decode_char_seq(arg);
        if let Some(u) = try_unquote_command_string(&s) {
            return Ok(self.expand_form_template(&u).unwrap_or(u));
        }
        Ok(self.expand_decoded_template(&s).unwrap_or(s))
    }

    fn eval_print_button(&mut self, arg: &str) -> Result<String> {
        let parts = split_top_level(arg, ',');
        let Some(first) = parts.first() else { return Ok(String::new()) };
        let first = first.trim();
        if first.is_empty() {
            return Ok(String::new());
        }
        if let Ok(v) = self.eval_strict_expr(first) {
            if v.is_str() {
                if let Ok(s) = self.expand_form_template(&v.as_str()) {
                    return Ok(s);
                }
            }
            return Ok(v.as_str());
        }
        let s = decode_char_seq(first);
        if let Some(u) = try_unquote_command_string(&s) {
            return Ok(self.expand_form_template(&u).unwrap_or(u));
        }
        Ok(self.expand_form_template(&s).unwrap_or(s))
    }

    fn eval_print_forms(&mut self, arg: &str) -> Result<String> {
        let v = self.eval_call_arg_raw(arg)?;
        self.eval_print_form(&v.as_str())
    }

    fn eval_print_v(&mut self, arg: &str) -> Result<String> {
        let parts = split_top_level(arg, ',');
        if parts.len() == 1 && parts[0].trim().is_empty() {
            return Ok(String::new());
        }
        let mut b = String::new();
        for p in parts {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            // 'text form prints the literal after the quote.
            if let Some(rest) = p.strip_prefix('\'') {
                b.push_str(&decode_char_seq(rest));
                continue;
            }
            let v = self.eval_call_arg_raw(p)?;
            b.push_str(&v.as_str());
        }
        Ok(b)
    }

    fn eval_strict_expr(&mut self, raw: &str) -> Result<Value> {
        let e = parse_expr(raw)?;
        self.eval_expr(&e)
    }

    // ---- goto / call ----

    fn exec_goto_like(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let is_try = name.starts_with("TRY");
        let label = match self.eval_command_target(arg, name.contains("FORM")) {
            Ok(label) => label,
            Err(e) => {
                if is_try {
                    return self.handle_try_failure(name);
                }
                return Err(e);
            }
        };
        if label.is_empty() {
            if is_try {
                return self.handle_try_failure(name);
            }
            return Err(EraError(format!("{} without target", name)));
        }
        let label = label.to_uppercase();
        if is_try {
            if let Some(fr) = self.current_frame() {
                if !fr.func.body.labels.contains_key(&label) {
                    return self.handle_try_failure(name);
                }
            }
        }
        Ok(ExecResult::Goto(label))
    }

    fn exec_call_like(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let is_try = name.starts_with("TRY");
        let dynamic = name.contains("FORM");
        let (target, args) = match self.parse_command_call(arg, dynamic) {
            Ok(v) => v,
            Err(e) => {
                if is_try {
                    return self.handle_try_failure(name);
                }
                return Err(e);
            }
        };
        if target.is_empty() {
            if is_try {
                return self.handle_try_failure(name);
            }
            return Err(EraError(format!("{} without target", name)));
        }
        if !self.program.functions.contains_key(&target) {
            if is_try {
                return self.handle_try_failure(name);
            }
            return Err(EraError(format!("function {} not found", target)));
        }
        let args = args.into_iter().map(Some).collect();
        self.call_function(&target, args)
    }

    fn exec_call_list_like(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        if name.starts_with("TRY") {
            if let Some(res) = self.exec_try_list_block(name)? {
                return Ok(res);
            }
        }
        let mut parts = split_top_level(arg, ',');
        if parts.iter().all(|p| p.is_empty()) {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() {
            return Ok(ExecResult::None);
        }
        if name == "CALLEVENT" {
            let target = parts[0].trim().to_uppercase();
            if target.is_empty() || !self.program.functions.contains_key(&target) {
                return Ok(ExecResult::None);
            }
            return self.call_function(&target, Vec::new());
        }
        if name == "TRYGOTOLIST" {
            let labels = self
                .current_frame()
                .map(|fr| fr.func.body.labels.clone())
                .unwrap_or_default();
            for p in &parts {
                let label = p.trim().to_uppercase();
                if labels.contains_key(&label) {
                    return Ok(ExecResult::Goto(label));
                }
            }
            return Ok(ExecResult::None);
        }
        for p in &parts {
            let target = p.trim().to_uppercase();
            if target.is_empty() || !self.program.functions.contains_key(&target) {
                continue;
            }
            return self.call_function(&target, Vec::new());
        }
        Ok(ExecResult::None)
    }

    // ---- CSV ----

    fn exec_csv_command(&mut self, base: &str, arg: &str) -> Result<ExecResult> {
        let args = self.eval_command_args(arg)?;
        let Some(first) = args.first() else {
            self.set_result_int(0);
            return Ok(ExecResult::None);
        };
        let id = first.as_int();
        let text = self.csv.name(base, id).unwrap_or("").to_string();
        self.set_result_str(text);
        Ok(ExecResult::None)
    }

    // ---- variable commands ----

    fn exec_var_set(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() || parts[0].trim().is_empty() {
            return Err(EraError("VARSET/CVARSET requires variable".into()));
        }
        let target = self
            .parse_var_ref_runtime(&parts[0])
            .map_err(|e| EraError(format!("VARSET/CVARSET invalid variable: {}", e)))?;
        if parts.len() == 1 {
            self.reset_var_set_target(&target)?;
            self.set_result_int(1);
            return Ok(ExecResult::None);
        }

        let val = self.eval_loose_expr(&parts[1])?;

        if parts.len() >= 3 {
            let start = self.eval_loose_expr(&parts[2])?.as_int();
            let end = if parts.len() >= 4 {
                self.eval_loose_expr(&parts[3])?.as_int()
            } else {
                start
            };
            self.var_set_range(&target, val, start, end)?;
            self.set_result_int(1);
            return Ok(ExecResult::None);
        }

        self.set_var_ref(&target, val)?;
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn reset_var_set_target(&mut self, target: &era_ast::VarRef) -> Result<()> {
        let name = target.name.trim().to_uppercase();
        if name.is_empty() {
            return Ok(());
        }
        if target.index.is_empty() {
            if self.has_array(&name) {
                let default = self
                    .with_array_mut(&name, |arr| {
                        arr.clear();
                        arr.default_value()
                    })
                    .expect("array checked");
                if crate::vm::is_result_like_name(&name) {
                    self.globals.insert(name, default);
                }
                return Ok(());
            }
            let def = self.default_value_for_var_ref(target);
            return self.set_var_ref(target, def);
        }
        let prefix = self.eval_index_exprs_for(&target.name, &target.index)?;
        if self.has_array(&name) {
            self.with_array_mut(&name, |arr| arr.clear_by_prefix(&prefix));
            return Ok(());
        }
        let def = self.default_value_for_var_ref(target);
        self.set_var_ref(target, def)
    }

    fn var_set_range(
        &mut self,
        target: &era_ast::VarRef,
        val: Value,
        start: i64,
        end: i64,
    ) -> Result<()> {
        let name = target.name.trim().to_uppercase();
        let prefix = self.eval_index_exprs_for(&target.name, &target.index)?;
        let (start, end) = if end < start { (end, start) } else { (start, end) };
        if !self.has_array(&name) {
            let mut dims: Vec<usize> = prefix.iter().map(|&v| ((v + 1).max(1)) as usize).collect();
            dims.push(((end + 1).max(1)) as usize);
            let arr = ArrayVar::new(val.is_str(), true, &dims);
            let in_local = self.current_frame().is_some() && name.starts_with("LOCAL");
            if in_local {
                self.stack.last_mut().expect("frame").l_arrays.insert(name.clone(), arr);
            } else {
                self.g_arrays.insert(name.clone(), arr);
            }
        }
        let val_clone = val.clone();
        let is_str = val.is_str();
        let res = self.with_array_mut(&name, move |arr| {
            if is_str {
                arr.is_string = true;
            }
            for i in start..=end {
                let mut idx = prefix.clone();
                idx.push(i);
                arr.set(&idx, val_clone.clone())?;
            }
            Ok::<(), EraError>(())
        });
        if let Some(res) = res {
            res?;
        }
        if crate::vm::is_result_like_name(&name)
            && target.index.is_empty()
            && start <= 0
            && 0 <= end
        {
            self.globals.insert(name, val);
        }
        Ok(())
    }

    fn exec_times(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError("TIMES requires variable and factor".into()));
        }
        let target = self.parse_var_ref_runtime(&parts[0])?;
        let base = self.get_var_ref(&target)?;
        let mut factor = 1.0f64;
        if let Ok(v) = self.eval_loose_expr(&parts[1]) {
            if let Ok(f) = v.as_str().parse::<f64>() {
                factor = f;
            }
        }
        let res = (base.as_int() as f64 * factor) as i64;
        self.set_var_ref(&target, Value::Int(res))?;
        self.set_result_int(res);
        Ok(ExecResult::None)
    }

    fn exec_split(&mut self, arg: &str) -> Result<ExecResult> {
        let parts = split_top_level(arg, ',');
        if parts.len() < 3 {
            return Err(EraError("SPLIT requires value, separator, destination".into()));
        }
        let value = self.eval_loose_expr(&parts[0])?;
        let sep = self.eval_loose_expr(&parts[1])?;
        let dest = self.parse_var_ref_runtime(&parts[2])?;
        let chunks: Vec<String> = value
            .as_str()
            .split(&sep.as_str())
            .map(str::to_string)
            .collect();
        let base_idx = self.eval_index_exprs_for(&dest.name, &dest.index)?;
        let dest_name = dest.name.to_uppercase();
        if !self.has_array(&dest_name) {
            let dims: Vec<usize> = base_idx
                .iter()
                .chain(std::iter::once(&0))
                .map(|&v| ((v + chunks.len() as i64).max(1)) as usize)
                .collect();
            self.g_arrays.insert(dest_name.clone(), ArrayVar::new(true, true, &dims));
        }
        let count = chunks.len() as i64;
        self.with_array_mut(&dest_name, |arr| {
            for (i, c) in chunks.into_iter().enumerate() {
                let mut idx = base_idx.clone();
                idx.push(i as i64);
                let _ = arr.set(&idx, Value::Str(c));
            }
        });
        self.set_result_int(count);
        Ok(ExecResult::None)
    }

    fn exec_escape(&mut self, arg: &str) -> Result<ExecResult> {
        let v = self.eval_loose_expr(arg)?;
        let mut s = v.as_str();
        for (from, to) in [
            ("\\", "\\\\"), ("*", "\\*"), ("+", "\\+"), ("?", "\\?"),
            ("|", "\\|"), ("{", "\\{"), ("}", "\\}"), ("[", "\\["),
            ("]", "\\]"), ("(", "\\("), (")", "\\)"), ("^", "\\^"),
            ("$", "\\$"), (".", "\\."), ("#", "\\#"),
        ] {
            s = s.replace(from, to);
        }
        self.globals.insert("RESULT".to_string(), Value::Int(s.len() as i64));
        self.globals.insert("RESULTS".to_string(), Value::Str(s));
        Ok(ExecResult::None)
    }

    fn exec_encode_to_uni(&mut self, arg: &str) -> Result<ExecResult> {
        let v = self.eval_loose_expr(arg)?;
        let bytes = v.as_str().into_bytes();
        self.set_result_int(bytes.len() as i64);
        for (i, b) in bytes.into_iter().enumerate() {
            self.globals.insert(format!("RESULT{}", i + 1), Value::Int(b as i64));
        }
        Ok(ExecResult::None)
    }

    fn exec_put_form(&mut self, arg: &str) -> Result<ExecResult> {
        let text = self.eval_print_form(arg)?;
        let prev = self
            .globals
            .get("SAVEDATA_TEXT")
            .map(|v| v.as_str())
            .unwrap_or_default();
        self.set_var("SAVEDATA_TEXT", Value::Str(prev + &text));
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn exec_bar(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let args = self.eval_command_args(arg)?;
        if args.len() < 3 {
            return Err(EraError(format!("{} requires value,max,length", name)));
        }
        let text = bar_text(args[0].as_int(), args[1].as_int(), args[2].as_int());
        if !self.ui.skip_disp {
            self.emit_output(Output::text(text.clone(), name == "BARL"));
        }
        self.globals.insert("RESULTS".to_string(), Value::Str(text));
        Ok(ExecResult::None)
    }

    fn exec_bit_mutation(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError(format!("{} requires variable and bit", name)));
        }
        let target = self
            .parse_var_ref_runtime(&parts[0])
            .map_err(|e| EraError(format!("{} invalid variable: {}", name, e)))?;
        let bit = self.eval_loose_expr(&parts[1])?.as_int() as u32;
        let mut cur = self.get_var_ref(&target)?.as_int();
        let mask = 1i64.wrapping_shl(bit);
        match name {
            "SETBIT" => cur |= mask,
            "CLEARBIT" => cur &= !mask,
            "INVERTBIT" => cur ^= mask,
            _ => {}
        }
        self.set_var_ref(&target, Value::Int(cur))?;
        self.set_result_int(cur);
        Ok(ExecResult::None)
    }

    fn exec_get_bit(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError("GETBIT requires value and bit".into()));
        }
        let v = self.eval_loose_expr(&parts[0])?.as_int();
        let bit = self.eval_loose_expr(&parts[1])?.as_int() as u32;
        let mask = 1i64.wrapping_shl(bit);
        self.set_result_int(((v & mask) != 0) as i64);
        Ok(ExecResult::None)
    }

    fn exec_swap(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError("SWAP requires two variables".into()));
        }
        let a = self.parse_var_ref_runtime(&parts[0])?;
        let b = self.parse_var_ref_runtime(&parts[1])?;
        let av = self.get_var_ref(&a)?;
        let bv = self.get_var_ref(&b)?;
        self.set_var_ref(&a, bv)?;
        self.set_var_ref(&b, av)?;
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    // ---- array commands ----

    fn base_array_target(&mut self, raw: &str, cmd: &str) -> Result<String> {
        let r = self.parse_var_ref_runtime(raw)?;
        if !r.index.is_empty() {
            return Err(EraError(format!("{} expects base array variable", cmd)));
        }
        Ok(r.name.to_uppercase())
    }

    fn exec_array_shift(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError("ARRAYSHIFT requires variable and index".into()));
        }
        let name = self.base_array_target(&parts[0], "ARRAYSHIFT")?;
        let start = self.eval_loose_expr(&parts[1])?.as_int().max(0);
        let mut count = 1i64;
        if let Some(p) = parts.get(2) {
            if let Ok(v) = self.eval_loose_expr(p) {
                if v.as_int() > 0 {
                    count = v.as_int();
                }
            }
        }
        if !self.has_array(&name) {
            return Err(EraError("ARRAYSHIFT target is not an array".into()));
        }
        let shifted = self
            .with_array_mut(&name, |arr| {
                let Some(&d0) = arr.dims.first() else { return false };
                let n = d0 as i64;
                if start >= n {
                    return false;
                }
                for i in start..n {
                    let src = i + count;
                    let val = if src >= 0 && src < n {
                        arr.get(&[src]).unwrap_or_else(|_| arr.default_value())
                    } else {
                        arr.default_value()
                    };
                    let _ = arr.set(&[i], val);
                }
                true
            })
            .unwrap_or(false);
        self.set_result_int(shifted as i64);
        Ok(ExecResult::None)
    }

    fn exec_array_remove(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError("ARRAYREMOVE requires variable and index".into()));
        }
        let name = self.base_array_target(&parts[0], "ARRAYREMOVE")?;
        let idx = self.eval_loose_expr(&parts[1])?.as_int();
        if !self.has_array(&name) {
            return Err(EraError("ARRAYREMOVE target is not an array".into()));
        }
        self.with_array_mut(&name, |arr| {
            let def = arr.default_value();
            let _ = arr.set(&[idx], def);
        });
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn exec_array_copy(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError("ARRAYCOPY requires destination and source".into()));
        }
        let dst_name = self.base_array_target(&parts[0], "ARRAYCOPY")?;
        let src_name = self.base_array_target(&parts[1], "ARRAYCOPY")?;
        let Some(src) = self
            .with_array_mut(&src_name, |arr| arr.clone()) else {
            return Err(EraError("ARRAYCOPY source is not an array".into()));
        };
        if self.has_array(&dst_name) {
            self.with_array_mut(&dst_name, |dst| *dst = src.clone());
        } else {
            self.g_arrays.insert(dst_name, src);
        }
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn exec_array_sort(&mut self, arg: &str) -> Result<ExecResult> {
        let name = self.base_array_target(arg, "ARRAYSORT")?;
        if !self.has_array(&name) {
            return Err(EraError("ARRAYSORT target is not an array".into()));
        }
        let sorted = self
            .with_array_mut(&name, |arr| {
                let Some(&d0) = arr.dims.first() else { return 0 };
                if d0 <= 1 {
                    return 1;
                }
                let mut vals = Vec::with_capacity(d0);
                for i in 0..d0 {
                    vals.push(arr.get(&[i as i64]).unwrap_or_else(|_| arr.default_value()));
                }
                if arr.is_string {
                    vals.sort_by_key(|v| v.as_str());
                } else {
                    vals.sort_by_key(|v| v.as_int());
                }
                for (i, v) in vals.into_iter().enumerate() {
                    let _ = arr.set(&[i as i64], v);
                }
                1
            })
            .unwrap_or(0);
        self.set_result_int(sorted);
        Ok(ExecResult::None)
    }

    // ---- output shaping ----

    fn exec_draw_line(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let mut text = "-".repeat(40);
        if name.contains("FORM") {
            if let Ok(v) = self.eval_print_form(arg) {
                if !v.trim().is_empty() {
                    text = v;
                }
            }
        } else if !arg.trim().is_empty() {
            if let Ok(v) = self.eval_loose_expr(arg) {
                if !v.as_str().trim().is_empty() {
                    text = v.as_str();
                }
            }
        }
        self.emit_output(Output::text(text, true));
        Ok(ExecResult::None)
    }

    fn exec_clear_line(&mut self, arg: &str) -> Result<ExecResult> {
        let mut n = 1i64;
        if !arg.trim().is_empty() {
            if let Ok(v) = self.eval_loose_expr(arg) {
                if v.as_int() > 0 {
                    n = v.as_int();
                }
            }
        }
        let n = (n as usize).min(self.outputs.len());
        self.outputs.truncate(self.outputs.len() - n);
        if let Some(hook) = self.output_hook.as_mut() {
            hook(&Output { text: String::new(), new_line: false, clear_lines: n as i64 });
        }
        Ok(ExecResult::None)
    }

    fn exec_reuse_last_line(&mut self) -> Result<ExecResult> {
        if let Some(last) = self.outputs.last().cloned() {
            self.emit_output(last);
        }
        Ok(ExecResult::None)
    }

    fn exec_alignment(&mut self, arg: &str) -> Result<ExecResult> {
        if arg.trim().is_empty() {
            let align = self.ui.align.clone();
            self.set_result_str(align);
            return Ok(ExecResult::None);
        }
        let v = self.eval_loose_expr(arg)?;
        self.ui.align = normalize_align(&v.as_str());
        let align = self.ui.align.clone();
        self.set_result_str(align);
        Ok(ExecResult::None)
    }

    fn exec_redraw(&mut self, arg: &str) -> Result<ExecResult> {
        if arg.trim().is_empty() {
            self.ui.redraw = true;
        } else {
            let v = self.eval_loose_expr(arg)?;
            self.ui.redraw = v.as_int() != 0;
        }
        Ok(ExecResult::None)
    }

    fn exec_skip_disp(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        match name {
            "NOSKIP" => self.ui.skip_disp = false,
            "ENDNOSKIP" => {}
            _ => {
                if arg.trim().is_empty() {
                    self.ui.skip_disp = true;
                } else {
                    let v = self.eval_loose_expr(arg)?;
                    self.ui.skip_disp = v.as_int() != 0;
                }
            }
        }
        self.set_result_int(self.ui.skip_disp as i64);
        Ok(ExecResult::None)
    }

    fn exec_set_color(&mut self, arg: &str, background: bool) -> Result<ExecResult> {
        let v = self.eval_loose_expr(arg)?;
        let c = v.as_str().trim().to_string();
        if background {
            self.ui.bg_color = c.clone();
        } else {
            self.ui.color = c.clone();
        }
        self.set_result_str(c);
        Ok(ExecResult::None)
    }

    // ---- character roster ----

    fn exec_get_chara(&mut self, arg: &str) -> Result<ExecResult> {
        if arg.trim().is_empty() {
            self.set_result_int(self.characters.len() as i64);
            return Ok(ExecResult::None);
        }
        let v = self.eval_loose_expr(arg)?;
        let res = self.character_id_by_index(v.as_int()).unwrap_or(-1);
        self.set_result_int(res);
        Ok(ExecResult::None)
    }

    fn exec_find_chara(&mut self, arg: &str, reverse: bool) -> Result<ExecResult> {
        let v = self.eval_loose_expr(arg)?;
        let id = v.as_int();
        let found = if reverse {
            self.characters.iter().rposition(|c| c.id == id)
        } else {
            self.characters.iter().position(|c| c.id == id)
        };
        self.set_result_int(found.map(|i| i as i64).unwrap_or(-1));
        Ok(ExecResult::None)
    }

    fn exec_swap_chara(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError("SWAPCHARA requires 2 indices".into()));
        }
        let a = self.eval_loose_expr(&parts[0])?.as_int();
        let b = self.eval_loose_expr(&parts[1])?.as_int();
        if a < 0 || b < 0 || a as usize >= self.characters.len() || b as usize >= self.characters.len()
        {
            self.set_result_int(0);
            return Ok(ExecResult::None);
        }
        self.characters.swap(a as usize, b as usize);
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn exec_copy_chara(&mut self, arg: &str, add: bool) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.iter().all(|p| p.is_empty()) {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() {
            return Err(EraError("COPYCHARA requires source index".into()));
        }
        let src = self.eval_loose_expr(&parts[0])?.as_int();
        if src < 0 || src as usize >= self.characters.len() {
            self.set_result_int(0);
            return Ok(ExecResult::None);
        }
        if add || parts.len() < 2 {
            let id = self.characters[src as usize].id;
            let idx = self.add_character(id);
            self.set_result_int(idx);
            return Ok(ExecResult::None);
        }
        let dst = self.eval_loose_expr(&parts[1])?.as_int();
        if dst < 0 || dst as usize >= self.characters.len() {
            self.set_result_int(0);
            return Ok(ExecResult::None);
        }
        self.characters[dst as usize].id = self.characters[src as usize].id;
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn exec_pickup_chara(&mut self, arg: &str) -> Result<ExecResult> {
        let v = self.eval_loose_expr(arg)?;
        let id = v.as_int();
        let found = self.characters.iter().position(|c| c.id == id);
        self.set_result_int(found.map(|i| i as i64).unwrap_or(-1));
        Ok(ExecResult::None)
    }

    // ---- REF / reset ----

    fn exec_ref_binding(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.len() < 2 {
            return Err(EraError(format!("{} requires destination and source", name)));
        }
        let dst = self.parse_var_ref_runtime(&parts[0])?;
        if !dst.index.is_empty() {
            return Err(EraError(format!("{} destination must be a base variable", name)));
        }
        let src = if name == "REFBYNAME" {
            let v = self.eval_loose_expr(&parts[1])?;
            self.parse_var_ref_runtime(&v.as_str())?
        } else {
            self.parse_var_ref_runtime(&parts[1])?
        };
        if !self.is_ref_declared(&dst.name) {
            self.set_result_int(0);
            return Ok(ExecResult::None);
        }
        self.set_ref_binding(&dst.name.to_uppercase(), src);
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn exec_reset_global(&mut self) -> Result<ExecResult> {
        self.globals.clear();
        self.g_arrays.clear();
        self.g_refs.clear();
        self.g_ref_decl.clear();
        self.init_defines()?;
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn exec_reset_data(&mut self) -> Result<ExecResult> {
        let res = self.exec_reset_global()?;
        self.characters.clear();
        self.next_char_id = 0;
        self.refresh_character_globals();
        Ok(res)
    }

    // ---- HTML print ----

    fn exec_html_print(&mut self, arg: &str) -> Result<ExecResult> {
        let mut text = String::new();
        if !arg.trim().is_empty() {
            match self.eval_loose_expr(arg) {
                Ok(v) => text = v.as_str(),
                Err(_) => {
                    text = decode_char_seq(arg);
                    if let Some(u) = try_unquote_command_string(&text) {
                        text = u;
                    }
                }
            }
        }
        for _ in 0..6 {
            let prev = text.clone();
            if let Ok(t) = self.eval_percent_placeholders(&text) {
                text = t;
            }
            if let Ok(t) = self.eval_brace_placeholders(&text) {
                text = t;
            }
            if text == prev {
                break;
            }
        }
        let text = html_unescape(&text);
        let text = HTML_TAG.replace_all(&text, "").into_owned();
        if !text.trim().is_empty() {
            self.emit_output(Output::text(text, true));
        }
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    // ---- argument plumbing shared by commands ----

    pub(crate) fn eval_command_args(&mut self, arg: &str) -> Result<Vec<Value>> {
        let arg = arg.trim();
        if arg.is_empty() {
            return Ok(Vec::new());
        }
        if let Ok(exprs) = parse_expr_list(arg) {
            let mut values = Vec::with_capacity(exprs.len());
            for e in &exprs {
                values.push(self.eval_expr(e)?);
            }
            return Ok(values);
        }
        let mut values = Vec::new();
        for p in split_top_level(arg, ',') {
            if p.trim().is_empty() {
                continue;
            }
            values.push(self.eval_loose_expr(&p)?);
        }
        Ok(values)
    }

    pub(crate) fn eval_expr_list_values(&mut self, raw: &str) -> Result<Vec<Value>> {
        let exprs = parse_expr_list(raw)?;
        let mut values = Vec::with_capacity(exprs.len());
        for e in &exprs {
            values.push(self.eval_expr(e)?);
        }
        Ok(values)
    }

    pub(crate) fn eval_call_arg_expr(&mut self, e: &era_ast::Expr) -> Result<Value> {
        let era_ast::Expr::Str(raw) = e else {
            return self.eval_expr(e);
        };
        if !looks_like_call_arg_expr(raw) {
            return Ok(Value::Str(raw.clone()));
        }
        if let Ok(v) = self.eval_loose_expr(raw) {
            // The loose path can silently fall back to the raw text; only a
            // real evaluation result counts.
            if !v.is_str() || v.as_str().trim() != raw.trim() {
                return Ok(v);
            }
        }
        if let Some(text) = self.eval_call_arg_form_string(raw)? {
            return Ok(Value::Str(text));
        }
        if let Ok(text) = self.expand_decoded_template(raw) {
            return Ok(Value::Str(text));
        }
        Ok(Value::Str(raw.clone()))
    }

    fn eval_call_arg_form_string(&mut self, raw: &str) -> Result<Option<String>> {
        let parts = split_top_level(raw, '+');
        if parts.is_empty() {
            return Ok(None);
        }
        let mut b = String::new();
        let mut handled = false;
        for p in parts {
            let part = p.trim();
            if part.is_empty() {
                continue;
            }
            match self.eval_call_arg_form_term(part)? {
                Some(text) => {
                    handled = true;
                    b.push_str(&text);
                }
                None => return Ok(None),
            }
        }
        if !handled {
            return Ok(None);
        }
        Ok(Some(b))
    }

    fn eval_call_arg_form_term(&mut self, part: &str) -> Result<Option<String>> {
        let part = part.trim();
        if part.is_empty() {
            return Ok(Some(String::new()));
        }
        if part.len() >= 3 && part.starts_with("@\"") && part.ends_with('"') {
            let inner = &part[2..part.len() - 1];
            return Ok(Some(self.expand_decoded_template(inner)?));
        }
        if part.len() >= 2 && part.starts_with('@') && part.ends_with('@') {
            let mut inner = part[1..part.len() - 1].trim().to_string();
            if inner.ends_with('#') {
                inner.push_str(" \"\"");
            }
            if let Some(text) = self.eval_at_placeholder_expr(&inner)? {
                return Ok(Some(text));
            }
        }
        if let Some(u) = try_unquote_command_string(part) {
            return Ok(Some(self.expand_decoded_template(&u)?));
        }
        if let Ok(v) = self.eval_loose_expr(part) {
            if !v.is_str() || v.as_str() != part {
                return Ok(Some(v.as_str()));
            }
        }
        if let Ok(text) = self.expand_decoded_template(part) {
            if text != part {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    pub(crate) fn eval_call_arg_raw(&mut self, raw: &str) -> Result<Value> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Value::Str(String::new()));
        }
        match parse_expr(raw) {
            Ok(e) => self.eval_call_arg_expr(&e),
            Err(_) => self.eval_call_arg_expr(&era_ast::Expr::Str(raw.to_string())),
        }
    }

    pub(crate) fn eval_command_target(&mut self, raw: &str, dynamic: bool) -> Result<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(String::new());
        }
        if dynamic {
            let target = self.eval_dynamic_target(raw)?;
            return Ok(target.trim().to_uppercase());
        }
        let (cmd, _) = split_name_and_rest_runtime(raw);
        Ok(cmd.trim().to_uppercase())
    }

    pub(crate) fn parse_command_call(
        &mut self,
        raw: &str,
        dynamic: bool,
    ) -> Result<(String, Vec<Value>)> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        if dynamic {
            if let Some((target_raw, arg_raw)) = split_dynamic_target_call(raw) {
                let target = self.eval_dynamic_target(&target_raw)?;
                let target = target.trim().to_uppercase();
                let args = self.eval_dynamic_call_args(&arg_raw)?;
                return Ok((target, args));
            }
            let parts = split_top_level(raw, ',');
            if parts.is_empty() {
                return Ok((String::new(), Vec::new()));
            }
            let target = self.eval_dynamic_target(&parts[0])?;
            let target = target.trim().to_uppercase();
            let mut args = Vec::new();
            for p in &parts[1..] {
                if p.trim().is_empty() {
                    continue;
                }
                args.push(self.eval_call_arg_raw(p)?);
            }
            return Ok((target, args));
        }

        if let Some(i) = raw.find('(') {
            if raw.ends_with(')') {
                let target = raw[..i].trim().to_uppercase();
                let arg_raw = raw[i + 1..raw.len() - 1].trim();
                let values = self.eval_call_arg_list(arg_raw)?;
                return Ok((target, values));
            }
        }

        let parts = split_top_level(raw, ',');
        if parts.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        let target = parts[0].trim().to_uppercase();
        let mut args = Vec::new();
        for p in &parts[1..] {
            if p.trim().is_empty() {
                continue;
            }
            args.push(self.eval_call_arg_raw(p)?);
        }
        Ok((target, args))
    }

    fn eval_dynamic_call_args(&mut self, arg_raw: &str) -> Result<Vec<Value>> {
        let arg_raw = arg_raw.trim();
        if arg_raw.is_empty() {
            return Ok(Vec::new());
        }
        if let Ok(values) = self.eval_call_arg_list(arg_raw) {
            return Ok(values);
        }
        let mut values = Vec::new();
        for p in split_top_level(arg_raw, ',') {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            values.push(self.eval_call_arg_raw(p)?);
        }
        Ok(values)
    }

    fn eval_call_arg_list(&mut self, raw: &str) -> Result<Vec<Value>> {
        let exprs = parse_expr_list(raw)?;
        let mut values = Vec::with_capacity(exprs.len());
        for e in &exprs {
            values.push(self.eval_call_arg_expr(e)?);
        }
        Ok(values)
    }

    fn eval_dynamic_target(&mut self, raw: &str) -> Result<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(String::new());
        }
        if let Ok(v) = self.eval_loose_expr(raw) {
            let s = v.as_str().trim().to_string();
            // The loose path may have fallen back to the raw text; templates
            // still need expansion in that case.
            if !(s == raw && (raw.contains('%') || raw.contains('{'))) {
                return Ok(s);
            }
        }
        let mut text = decode_char_seq(raw);
        for _ in 0..6 {
            let prev = text.clone();
            if let Ok(t) = self.eval_percent_placeholders(&text) {
                text = t;
            }
            if let Ok(t) = self.eval_brace_placeholders(&text) {
                text = t;
            }
            if text == prev {
                break;
            }
        }
        Ok(text.trim().to_string())
    }
}

fn bar_text(val: i64, max: i64, length: i64) -> String {
    let max = max.max(1);
    let length = length.max(0);
    let filled = (length * val / max).clamp(0, length);
    format!(
        "[{}{}]",
        "*".repeat(filled as usize),
        ".".repeat((length - filled) as usize)
    )
}

pub(crate) fn try_unquote_command_string(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() >= 3 && raw.starts_with("@\"") && raw.ends_with('"') {
        return Some(raw[2..raw.len() - 1].to_string());
    }
    era_parser::expr::unquote_string(raw)
}

fn looks_like_call_arg_expr(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    if raw.starts_with("@\"") {
        return true;
    }
    raw.contains(['%', '@', '(', ')', '?', ':', '#', '{', '}'])
}

fn split_name_and_rest_runtime(raw: &str) -> (String, String) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (String::new(), String::new());
    }
    for (i, r) in raw.char_indices() {
        if r.is_whitespace() {
            return (raw[..i].trim().to_string(), raw[i + r.len_utf8()..].trim().to_string());
        }
    }
    for (i, r) in raw.char_indices() {
        if i == 0 {
            continue;
        }
        if !era_parser::expr::is_ident_part(r) {
            return (raw[..i].trim().to_string(), raw[i..].trim().to_string());
        }
    }
    (raw.to_string(), String::new())
}

fn split_dynamic_target_call(raw: &str) -> Option<(String, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut in_str = false;
    let mut escape = false;
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    for (i, r) in raw.char_indices() {
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
            '(' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            ')' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if !raw[i + 1..].trim().is_empty() {
                            return None;
                        }
                        return Some((
                            raw[..s].trim().to_string(),
                            raw[s + 1..i].trim().to_string(),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn html_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_text_clamps() {
        assert_eq!(bar_text(5, 10, 4), "[**..]");
        assert_eq!(bar_text(20, 10, 4), "[****]");
        assert_eq!(bar_text(-5, 10, 4), "[....]");
    }

    #[test]
    fn dynamic_call_split() {
        let (t, a) = split_dynamic_target_call("FN_%A%(1, 2)").unwrap();
        assert_eq!(t, "FN_%A%");
        assert_eq!(a, "1, 2");
        assert!(split_dynamic_target_call("FN(1) trailing").is_none());
        assert!(split_dynamic_target_call("plain").is_none());
    }

    #[test]
    fn unquote_forms() {
        assert_eq!(try_unquote_command_string(r#""ab""#).as_deref(), Some("ab"));
        assert_eq!(try_unquote_command_string(r#"@"a\b""#).as_deref(), Some(r"a\b"));
        assert_eq!(try_unquote_command_string("plain"), None);
    }
}
