//! Builtin methods callable from expressions and as commands. Results land
//! in `RESULT`/`RESULTS` when invoked as statements.

use chrono::Local;
use era_common::{EraError, Result};
use era_parser::split_top_level;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::value::{value_equal, Value};
use crate::vm::{csv_base_from_var_name, is_numeric_like, Vm};

static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]*>").expect("static pattern"));
static BR_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("static pattern"));

const METHOD_NAMES: &[&str] = &[
    "HTMLP", "HTMLFONT", "HTMLNOBR", "HTMLSTYLE", "HTMLCOLOR", "HTMLBUTTON", "HTMLAUTOBUTTON",
    "HTMLNONBUTTON", "HTML_STRINGLEN", "HTML_SUBSTRING", "HTML_STRINGLINES", "SUMARRAY",
    "SUMCARRAY", "MATCH", "CMATCH", "GROUPMATCH", "NOSAMES", "ALLSAMES", "MAXARRAY", "MAXCARRAY",
    "MINARRAY", "MINCARRAY", "GETNUM", "GETNUMB", "FINDELEMENT", "FINDLASTELEMENT",
    "INRANGEARRAY", "INRANGECARRAY", "VARSIZE", "UNICODE", "ENCODETOUNI", "ABS", "SIGN", "MAX",
    "MIN", "POWER", "BARSTR", "SQRT", "CBRT", "LOG", "LOG10", "EXPONENT", "LIMIT", "INRANGE",
    "RAND", "STRLEN", "STRLENU", "STRLENS", "STRLENSU", "STRLENFORM", "STRLENFORMU", "STRFIND",
    "STRFINDU", "LINEISEMPTY", "GETSTYLE", "SUBSTRING", "SUBSTRINGU", "TOINT", "TOSTR",
    "TOUPPER", "TOLOWER", "TOHALF", "TOFULL", "REPLACE", "STRCOUNT", "STRJOIN", "STRFORM",
    "CHARATU", "CONVERT", "ISNUMERIC", "GETTIMES", "MONEYSTR", "EXISTCSV", "GETPALAMLV",
    "GETEXPLV", "REGEXPMATCH", "COLOR_FROMNAME", "COLOR_FROMRGB", "ISDEFINED", "EXISTVAR",
    "GETVAR", "GETVARS", "SETVAR", "EXISTFUNCTION", "ENUMFUNCBEGINSWITH", "ENUMFUNCENDSWITH",
    "ENUMFUNCWITH", "ENUMVARBEGINSWITH", "ENUMVARENDSWITH", "ENUMVARWITH", "ENUMMACROBEGINSWITH",
    "ENUMMACROENDSWITH", "ENUMMACROWITH",
];

impl Vm {
    /// None means the name is not a builtin method and dispatch continues.
    pub(crate) fn exec_method_like(&mut self, name: &str, arg: &str) -> Option<Result<Value>> {
        if !METHOD_NAMES.contains(&name) {
            return None;
        }
        Some(self.exec_method_inner(name, arg))
    }

    fn exec_method_inner(&mut self, name: &str, arg: &str) -> Result<Value> {
        match name {
            // Array scans parse their own variable argument.
            "SUMARRAY" | "SUMCARRAY" => return Ok(self.method_sum_array(arg)),
            "MATCH" | "CMATCH" => return Ok(self.method_match(arg)),
            "MAXARRAY" | "MAXCARRAY" => return Ok(self.method_max_min_array(arg, true)),
            "MINARRAY" | "MINCARRAY" => return Ok(self.method_max_min_array(arg, false)),
            "FINDELEMENT" => return Ok(self.method_find_element(arg, false)),
            "FINDLASTELEMENT" => return Ok(self.method_find_element(arg, true)),
            "INRANGEARRAY" | "INRANGECARRAY" => return Ok(self.method_in_range_array(arg)),
            "GETNUM" => return Ok(self.method_get_num(arg, false)),
            "GETNUMB" => return Ok(self.method_get_num(arg, true)),
            "VARSIZE" => return Ok(Value::Int(self.eval_var_size_raw(arg))),
            "STRLENFORM" | "STRLENFORMU" => {
                let text = self.eval_print_form(arg)?;
                return Ok(Value::Int(text.chars().count() as i64));
            }
            "STRFORM" => {
                let args = self.eval_command_args(arg)?;
                let Some(first) = args.first() else { return Ok(Value::Str(String::new())) };
                let mut out = first.as_str();
                out = self.eval_percent_placeholders(&out)?;
                out = self.eval_brace_placeholders(&out)?;
                return Ok(Value::Str(out));
            }
            _ => {}
        }

        let args = self.eval_command_args(arg)?;
        let arg0_int = || args.first().map(|v| v.as_int()).unwrap_or(0);
        let arg0_str = || args.first().map(|v| v.as_str()).unwrap_or_default();

        match name {
            "HTMLP" => {
                if args.is_empty() {
                    return Ok(Value::Str(String::new()));
                }
                let mut align = self.ui.align.trim().to_lowercase();
                if align.is_empty() {
                    align = "left".to_string();
                }
                if let Some(a) = args.get(1) {
                    match a.as_str().trim().to_lowercase().as_str() {
                        "left" | "center" | "right" => align = a.as_str().trim().to_lowercase(),
                        "왼쪽" => align = "left".to_string(),
                        "중앙" => align = "center".to_string(),
                        "오른쪽" => align = "right".to_string(),
                        _ => {}
                    }
                }
                Ok(Value::Str(format!("<p align='{}'>{}</p>", align, arg0_str())))
            }
            "HTMLFONT" => {
                if args.is_empty() {
                    return Ok(Value::Str(String::new()));
                }
                let text = arg0_str();
                let mut face = args.get(1).map(|v| v.as_str().trim().to_string()).unwrap_or_default();
                let mut color = args
                    .get(2)
                    .map(|v| self.html_color_from_value(v))
                    .unwrap_or_default();
                let mut bcolor = args
                    .get(3)
                    .map(|v| self.html_color_from_value(v))
                    .unwrap_or_default();
                if face.is_empty() && color.is_empty() && bcolor.is_empty() {
                    face = self.ui.font.trim().to_string();
                    color = self.html_color_from_value(&Value::Int(-1));
                    bcolor = String::new();
                }
                let mut b = String::from("<font");
                if !face.is_empty() {
                    b.push_str(&format!(" face='{}'", face));
                }
                if !color.is_empty() {
                    b.push_str(&format!(" color='{}'", color));
                }
                if !bcolor.is_empty() {
                    b.push_str(&format!(" bcolor='{}'", bcolor));
                }
                b.push('>');
                b.push_str(&text);
                b.push_str("</font>");
                Ok(Value::Str(b))
            }
            "HTMLNOBR" => {
                Ok(Value::Str(format!("<nobr>{}</nobr>", arg0_str())))
            }
            "HTMLSTYLE" => {
                if args.is_empty() {
                    return Ok(Value::Str(String::new()));
                }
                let mut style = (self.ui.bold as i64) | ((self.ui.italic as i64) << 1);
                if let Some(s) = args.get(1) {
                    if s.as_int() >= 0 {
                        style = s.as_int();
                    }
                }
                let mut open = String::new();
                let mut close = String::new();
                for (bit, tag) in [(1, "b"), (2, "i"), (4, "s"), (8, "u")] {
                    if style & bit != 0 {
                        open.push_str(&format!("<{}>", tag));
                        close = format!("</{}>{}", tag, close);
                    }
                }
                Ok(Value::Str(format!("{}{}{}", open, arg0_str(), close)))
            }
            "HTMLCOLOR" => {
                let v = args.first().cloned().unwrap_or(Value::Int(-1));
                let c = self.html_color_from_value(&v);
                if c.is_empty() {
                    Ok(Value::Str("FFFFFF".to_string()))
                } else {
                    Ok(Value::Str(c))
                }
            }
            "HTMLBUTTON" | "HTMLAUTOBUTTON" | "HTMLNONBUTTON" => Ok(Value::Str(arg0_str())),
            "HTML_STRINGLEN" => {
                let arg0 = arg0_str();
                let stripped = TAG_PATTERN.replace_all(&arg0, "");
                Ok(Value::Int(stripped.chars().count() as i64))
            }
            "HTML_SUBSTRING" => {
                let stripped = TAG_PATTERN.replace_all(&arg0_str(), "").into_owned();
                let chars: Vec<char> = stripped.chars().collect();
                let start = args.get(1).map(|v| v.as_int()).unwrap_or(0).clamp(0, chars.len() as i64) as usize;
                let end = match args.get(2) {
                    Some(n) => (start + n.as_int().max(0) as usize).min(chars.len()),
                    None => chars.len(),
                };
                Ok(Value::Str(chars[start..end].iter().collect()))
            }
            "HTML_STRINGLINES" => {
                let s = arg0_str();
                Ok(Value::Int(BR_PATTERN.find_iter(&s).count() as i64 + 1))
            }
            "GROUPMATCH" => Ok(method_group_match(&args)),
            "NOSAMES" => Ok(method_no_sames(&args)),
            "ALLSAMES" => Ok(method_all_sames(&args)),
            "UNICODE" => {
                let code = arg0_int();
                let c = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or('\u{FFFD}');
                Ok(Value::Str(c.to_string()))
            }
            "ENCODETOUNI" => Ok(Value::Int(arg0_str().len() as i64)),
            "ABS" => Ok(Value::Int(arg0_int().wrapping_abs())),
            "SIGN" => Ok(Value::Int(arg0_int().signum())),
            "MAX" => Ok(Value::Int(args.iter().map(|v| v.as_int()).max().unwrap_or(0))),
            "MIN" => Ok(Value::Int(args.iter().map(|v| v.as_int()).min().unwrap_or(0))),
            "POWER" => {
                if args.len() < 2 {
                    return Ok(Value::Int(0));
                }
                let base = args[0].as_int();
                let exp = args[1].as_int();
                if exp < 0 {
                    return Ok(Value::Int(0));
                }
                let mut acc = 1i64;
                for _ in 0..exp {
                    acc = acc.wrapping_mul(base);
                }
                Ok(Value::Int(acc))
            }
            "BARSTR" => {
                if args.len() < 3 {
                    return Ok(Value::Str(String::new()));
                }
                let (val, max, length) = (args[0].as_int(), args[1].as_int().max(1), args[2].as_int().max(0));
                let filled = (length * val / max).clamp(0, length);
                Ok(Value::Str(format!(
                    "[{}{}]",
                    "*".repeat(filled as usize),
                    ".".repeat((length - filled) as usize)
                )))
            }
            "SQRT" => {
                let v = arg0_int();
                if v < 0 {
                    return Ok(Value::Int(0));
                }
                Ok(Value::Int((v as f64).sqrt() as i64))
            }
            "CBRT" => Ok(Value::Int((arg0_int() as f64).cbrt() as i64)),
            "LOG" => {
                let v = arg0_int();
                if v <= 0 {
                    return Ok(Value::Int(0));
                }
                Ok(Value::Int((v as f64).ln() as i64))
            }
            "LOG10" => {
                let v = arg0_int();
                if v <= 0 {
                    return Ok(Value::Int(0));
                }
                Ok(Value::Int((v as f64).log10() as i64))
            }
            "EXPONENT" => Ok(Value::Int((arg0_int() as f64).exp() as i64)),
            "LIMIT" => {
                if args.len() < 3 {
                    return Ok(Value::Int(0));
                }
                Ok(Value::Int(args[0].as_int().clamp(args[1].as_int(), args[2].as_int())))
            }
            "INRANGE" => {
                if args.len() < 3 {
                    return Ok(Value::Int(0));
                }
                let (v, lo, hi) = (args[0].as_int(), args[1].as_int(), args[2].as_int());
                Ok(Value::Int((v >= lo && v <= hi) as i64))
            }
            "RAND" => {
                let n = arg0_int();
                if n <= 0 {
                    return Ok(Value::Int(0));
                }
                Ok(Value::Int(self.rng.gen_range(0..n)))
            }
            "STRLEN" | "STRLENU" | "STRLENS" | "STRLENSU" => {
                Ok(Value::Int(arg0_str().chars().count() as i64))
            }
            "STRFIND" => {
                if args.len() < 2 {
                    return Ok(Value::Int(-1));
                }
                Ok(Value::Int(
                    args[0]
                        .as_str()
                        .find(&args[1].as_str())
                        .map(|i| i as i64)
                        .unwrap_or(-1),
                ))
            }
            "STRFINDU" => {
                if args.len() < 2 {
                    return Ok(Value::Int(-1));
                }
                let hay = args[0].as_str();
                match hay.find(&args[1].as_str()) {
                    Some(byte_idx) => Ok(Value::Int(hay[..byte_idx].chars().count() as i64)),
                    None => Ok(Value::Int(-1)),
                }
            }
            "LINEISEMPTY" => {
                let empty = self
                    .outputs
                    .last()
                    .map_or(true, |o| o.text.trim().is_empty());
                Ok(Value::Int(empty as i64))
            }
            "GETSTYLE" => {
                Ok(Value::Int((self.ui.bold as i64) | ((self.ui.italic as i64) << 1)))
            }
            "SUBSTRING" | "SUBSTRINGU" => {
                if args.len() < 2 {
                    return Ok(Value::Str(String::new()));
                }
                let src: Vec<char> = args[0].as_str().chars().collect();
                let start = args[1].as_int().clamp(0, src.len() as i64) as usize;
                let end = match args.get(2) {
                    Some(n) => (start + n.as_int().max(0) as usize).min(src.len()),
                    None => src.len(),
                };
                Ok(Value::Str(src[start..end].iter().collect()))
            }
            "TOINT" => Ok(Value::Int(arg0_int())),
            "TOSTR" => Ok(Value::Str(arg0_str())),
            "TOUPPER" => Ok(Value::Str(arg0_str().to_uppercase())),
            "TOLOWER" => Ok(Value::Str(arg0_str().to_lowercase())),
            "TOHALF" => Ok(Value::Str(to_half_width(&arg0_str()))),
            "TOFULL" => Ok(Value::Str(to_full_width(&arg0_str()))),
            "REPLACE" => {
                if args.len() < 3 {
                    return Ok(Value::Str(String::new()));
                }
                Ok(Value::Str(args[0].as_str().replace(&args[1].as_str(), &args[2].as_str())))
            }
            "STRCOUNT" => {
                if args.len() < 2 {
                    return Ok(Value::Int(0));
                }
                let needle = args[1].as_str();
                if needle.is_empty() {
                    return Ok(Value::Int(0));
                }
                Ok(Value::Int(args[0].as_str().matches(&needle).count() as i64))
            }
            "STRJOIN" => {
                if args.len() < 2 {
                    return Ok(Value::Str(arg0_str()));
                }
                let sep = args[0].as_str();
                let parts: Vec<String> = args[1..].iter().map(|v| v.as_str()).collect();
                Ok(Value::Str(parts.join(&sep)))
            }
            "CHARATU" => {
                if args.len() < 2 {
                    return Ok(Value::Str(String::new()));
                }
                let idx = args[1].as_int();
                let c = if idx < 0 {
                    None
                } else {
                    args[0].as_str().chars().nth(idx as usize)
                };
                Ok(Value::Str(c.map(|c| c.to_string()).unwrap_or_default()))
            }
            "CONVERT" => {
                if args.len() < 2 {
                    return Ok(Value::Str(String::new()));
                }
                let v = args[0].as_int();
                match args[1].as_int() {
                    2 => Ok(Value::Str(format!("{:b}", v))),
                    8 => Ok(Value::Str(format!("{:o}", v))),
                    10 => Ok(Value::Str(format!("{}", v))),
                    16 => Ok(Value::Str(format!("{:x}", v))),
                    _ => Err(EraError("CONVERT base must be one of 2,8,10,16".into())),
                }
            }
            "ISNUMERIC" => Ok(Value::Int(is_numeric_like(&arg0_str()) as i64)),
            "GETTIMES" => Ok(Value::Str(Local::now().format("%Y/%m/%d %H:%M:%S").to_string())),
            "MONEYSTR" => Ok(Value::Str(arg0_int().to_string())),
            "EXISTCSV" => {
                let Some(first) = args.first() else { return Ok(Value::Int(0)) };
                if !first.is_str() {
                    return Ok(Value::Int(self.csv.exists_id(first.as_int()) as i64));
                }
                let s = first.as_str();
                if let Ok(n) = s.trim().parse::<i64>() {
                    return Ok(Value::Int(self.csv.exists_id(n) as i64));
                }
                Ok(Value::Int(self.csv.exists(&s) as i64))
            }
            "GETPALAMLV" | "GETEXPLV" => {
                let v = arg0_int();
                let levels: &[i64] = if name == "GETEXPLV" {
                    &[0, 1, 4, 20, 50, 200]
                } else {
                    &[0, 100, 500, 3000, 10000, 30000, 60000, 100000, 150000, 250000]
                };
                let mut lv = 0i64;
                for (i, &th) in levels.iter().enumerate() {
                    if v >= th {
                        lv = i as i64;
                    }
                }
                Ok(Value::Int(lv))
            }
            "REGEXPMATCH" => {
                if args.len() < 2 {
                    return Ok(Value::Int(0));
                }
                match Regex::new(&args[1].as_str()) {
                    Ok(re) => Ok(Value::Int(re.find_iter(&args[0].as_str()).count() as i64)),
                    Err(_) => Ok(Value::Int(0)),
                }
            }
            "COLOR_FROMNAME" => Ok(Value::Int(color_from_name(&arg0_str()))),
            "COLOR_FROMRGB" => {
                if args.len() < 3 {
                    return Ok(Value::Int(0));
                }
                let r = args[0].as_int().clamp(0, 255);
                let g = args[1].as_int().clamp(0, 255);
                let b = args[2].as_int().clamp(0, 255);
                Ok(Value::Int((r << 16) | (g << 8) | b))
            }
            "ISDEFINED" => {
                let key = arg0_str().trim().to_uppercase();
                Ok(Value::Int(self.program.defines.contains_key(&key) as i64))
            }
            "EXISTVAR" => Ok(Value::Int(self.symbol_exists(&arg0_str()) as i64)),
            "GETVAR" | "GETVARS" => {
                let target = self.parse_var_ref_runtime(&arg0_str())?;
                let v = self.get_var_ref(&target)?;
                if name == "GETVARS" {
                    Ok(Value::Str(v.as_str()))
                } else {
                    Ok(Value::Int(v.as_int()))
                }
            }
            "SETVAR" => {
                if args.len() < 2 {
                    return Ok(Value::Int(0));
                }
                let target = self.parse_var_ref_runtime(&args[0].as_str())?;
                self.set_var_ref(&target, args[1].clone())?;
                Ok(Value::Int(1))
            }
            "EXISTFUNCTION" => {
                let key = arg0_str().trim().to_uppercase();
                Ok(Value::Int(self.program.functions.contains_key(&key) as i64))
            }
            "ENUMFUNCBEGINSWITH" | "ENUMFUNCENDSWITH" | "ENUMFUNCWITH" => {
                let pat = arg0_str().trim().to_uppercase();
                let mut names: Vec<String> = self
                    .program
                    .functions
                    .keys()
                    .filter(|k| !k.contains('#'))
                    .filter(|k| match_enum(name, k, &pat))
                    .cloned()
                    .collect();
                names.sort();
                self.store_enum_results(&names)?;
                Ok(Value::Int(names.len() as i64))
            }
            "ENUMVARBEGINSWITH" | "ENUMVARENDSWITH" | "ENUMVARWITH" => {
                let pat = arg0_str().trim().to_uppercase();
                let mut names: Vec<String> = self
                    .globals
                    .keys()
                    .chain(self.g_arrays.keys())
                    .filter(|k| match_enum(name, k, &pat))
                    .cloned()
                    .collect();
                names.sort();
                names.dedup();
                self.store_enum_results(&names)?;
                Ok(Value::Int(names.len() as i64))
            }
            "ENUMMACROBEGINSWITH" | "ENUMMACROENDSWITH" | "ENUMMACROWITH" => {
                let pat = arg0_str().trim().to_uppercase();
                let mut names: Vec<String> = self
                    .program
                    .defines
                    .keys()
                    .filter(|k| !k.contains(':'))
                    .filter(|k| match_enum(name, k, &pat))
                    .cloned()
                    .collect();
                names.sort();
                self.store_enum_results(&names)?;
                Ok(Value::Int(names.len() as i64))
            }
            _ => Ok(Value::Int(0)),
        }
    }

    fn store_enum_results(&mut self, names: &[String]) -> Result<()> {
        for (i, n) in names.iter().enumerate() {
            let target = era_ast::VarRef {
                name: "RESULTS".to_string(),
                index: vec![era_ast::Expr::Int(i as i64)],
            };
            self.set_var_ref(&target, Value::Str(n.clone()))?;
        }
        Ok(())
    }

    fn html_color_from_value(&self, v: &Value) -> String {
        if v.is_str() {
            let s = v.as_str();
            let s = s.trim().trim_start_matches('#');
            if s.is_empty() {
                return String::new();
            }
            if i64::from_str_radix(s, 16).is_ok() {
                return s.to_uppercase();
            }
            return s.to_string();
        }
        let n = v.as_int();
        if n < 0 {
            let c = self.ui.color.trim().trim_start_matches('#');
            if c.is_empty() {
                return String::new();
            }
            return c.to_uppercase();
        }
        format!("{:06X}", n & 0xFFFFFF)
    }

    // ---- array-scan methods ----

    fn method_array_ref_and_parts(&mut self, arg: &str, min_parts: usize) -> Option<(String, Vec<String>)> {
        let parts = split_top_level(arg, ',');
        if parts.len() < min_parts {
            return None;
        }
        let r = self.parse_var_ref_runtime(&parts[0]).ok()?;
        if !r.index.is_empty() {
            return None;
        }
        Some((r.name.to_uppercase(), parts))
    }

    fn parse_array_range(
        &mut self,
        length: usize,
        parts: &[String],
        start_part: usize,
        end_part: usize,
    ) -> (i64, i64) {
        let n = length as i64;
        let mut start = 0i64;
        let mut end = n;
        if let Some(p) = parts.get(start_part) {
            if !p.trim().is_empty() {
                if let Ok(v) = self.eval_loose_expr(p) {
                    start = v.as_int();
                }
            }
        }
        if let Some(p) = parts.get(end_part) {
            if !p.trim().is_empty() {
                if let Ok(v) = self.eval_loose_expr(p) {
                    end = v.as_int();
                }
            }
        }
        start = start.clamp(0, n);
        end = end.clamp(0, n);
        if end < start {
            end = start;
        }
        (start, end)
    }

    fn array_first_dim(&self, name: &str) -> Option<usize> {
        self.array_dims(name).and_then(|d| d.first().copied())
    }

    fn method_sum_array(&mut self, arg: &str) -> Value {
        let Some((name, parts)) = self.method_array_ref_and_parts(arg, 1) else {
            return Value::Int(0);
        };
        let Some(d0) = self.array_first_dim(&name) else { return Value::Int(0) };
        let (start, end) = self.parse_array_range(d0, &parts, 1, 2);
        let sum = self
            .with_array_mut(&name, |arr| {
                let mut sum = 0i64;
                for i in start..end {
                    sum += arr.get(&[i]).map(|v| v.as_int()).unwrap_or(0);
                }
                sum
            })
            .unwrap_or(0);
        Value::Int(sum)
    }

    fn method_match(&mut self, arg: &str) -> Value {
        let Some((name, parts)) = self.method_array_ref_and_parts(arg, 2) else {
            return Value::Int(0);
        };
        let Some(d0) = self.array_first_dim(&name) else { return Value::Int(0) };
        let Ok(target) = self.eval_loose_expr(&parts[1]) else { return Value::Int(0) };
        let (start, end) = self.parse_array_range(d0, &parts, 2, 3);
        let count = self
            .with_array_mut(&name, |arr| {
                let mut count = 0i64;
                for i in start..end {
                    if let Ok(v) = arr.get(&[i]) {
                        if value_equal(&v, &target) {
                            count += 1;
                        }
                    }
                }
                count
            })
            .unwrap_or(0);
        Value::Int(count)
    }

    fn method_max_min_array(&mut self, arg: &str, is_max: bool) -> Value {
        let Some((name, parts)) = self.method_array_ref_and_parts(arg, 1) else {
            return Value::Int(0);
        };
        let Some(d0) = self.array_first_dim(&name) else { return Value::Int(0) };
        let (start, end) = self.parse_array_range(d0, &parts, 1, 2);
        if start >= end {
            return Value::Int(0);
        }
        let best = self
            .with_array_mut(&name, |arr| {
                let mut best = arr.get(&[start]).map(|v| v.as_int()).unwrap_or(0);
                for i in start + 1..end {
                    let n = arr.get(&[i]).map(|v| v.as_int()).unwrap_or(0);
                    if (is_max && n > best) || (!is_max && n < best) {
                        best = n;
                    }
                }
                best
            })
            .unwrap_or(0);
        Value::Int(best)
    }

    fn method_get_num(&mut self, arg: &str, by_name: bool) -> Value {
        let parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            return Value::Int(-1);
        }
        let var_name = if by_name {
            match self.eval_loose_expr(&parts[0]) {
                Ok(v) => v.as_str().trim().to_uppercase(),
                Err(_) => return Value::Int(-1),
            }
        } else {
            match self.parse_var_ref_runtime(&parts[0]) {
                Ok(r) => r.name.trim().to_uppercase(),
                Err(_) => return Value::Int(-1),
            }
        };
        let Ok(key) = self.eval_loose_expr(&parts[1]) else { return Value::Int(-1) };
        let base = csv_base_from_var_name(&var_name);
        match self.csv.find_id(&base, &key.as_str()) {
            Some(id) => Value::Int(id),
            None => Value::Int(-1),
        }
    }

    fn method_find_element(&mut self, arg: &str, last: bool) -> Value {
        let Some((name, parts)) = self.method_array_ref_and_parts(arg, 2) else {
            return Value::Int(-1);
        };
        let Some(d0) = self.array_first_dim(&name) else { return Value::Int(-1) };
        let Ok(target) = self.eval_loose_expr(&parts[1]) else { return Value::Int(-1) };
        let (start, end) = self.parse_array_range(d0, &parts, 2, 3);
        let mut exact = false;
        if let Some(p) = parts.get(4) {
            if !p.trim().is_empty() {
                if let Ok(v) = self.eval_loose_expr(p) {
                    exact = v.truthy();
                }
            }
        }
        let re = if target.is_str() && !exact {
            Regex::new(&target.as_str()).ok()
        } else {
            None
        };
        let found = self
            .with_array_mut(&name, |arr| {
                let matches = |v: &Value| -> bool {
                    if target.is_str() {
                        if exact {
                            return v.as_str() == target.as_str();
                        }
                        if let Some(re) = &re {
                            return re.is_match(&v.as_str());
                        }
                        return v.as_str() == target.as_str();
                    }
                    v.as_int() == target.as_int()
                };
                let range: Vec<i64> = if last {
                    (start..end).rev().collect()
                } else {
                    (start..end).collect()
                };
                for i in range {
                    if let Ok(v) = arr.get(&[i]) {
                        if matches(&v) {
                            return i;
                        }
                    }
                }
                -1
            })
            .unwrap_or(-1);
        Value::Int(found)
    }

    fn method_in_range_array(&mut self, arg: &str) -> Value {
        let Some((name, parts)) = self.method_array_ref_and_parts(arg, 3) else {
            return Value::Int(0);
        };
        let Some(d0) = self.array_first_dim(&name) else { return Value::Int(0) };
        let Ok(lo) = self.eval_loose_expr(&parts[1]) else { return Value::Int(0) };
        let Ok(hi) = self.eval_loose_expr(&parts[2]) else { return Value::Int(0) };
        let (start, end) = self.parse_array_range(d0, &parts, 3, 4);
        let (lo, hi) = (lo.as_int(), hi.as_int());
        let count = self
            .with_array_mut(&name, |arr| {
                let mut count = 0i64;
                for i in start..end {
                    let n = arr.get(&[i]).map(|v| v.as_int()).unwrap_or(0);
                    if n >= lo && n <= hi {
                        count += 1;
                    }
                }
                count
            })
            .unwrap_or(0);
        Value::Int(count)
    }

    fn eval_var_size_raw(&mut self, raw: &str) -> i64 {
        let parts = split_top_level(raw, ',');
        let Some(first) = parts.first() else { return 0 };
        if first.trim().is_empty() {
            return 0;
        }
        let Ok(r) = self.parse_var_ref_runtime(first) else { return 0 };
        let mut dim_idx = 0i64;
        if let Some(p) = parts.get(1) {
            if !p.trim().is_empty() {
                if let Ok(v) = self.eval_loose_expr(p) {
                    dim_idx = v.as_int();
                }
            }
        }
        if let Some(dims) = self.array_dims(&r.name) {
            if dim_idx < 0 || dim_idx as usize >= dims.len() {
                return 0;
            }
            return dims[dim_idx as usize] as i64;
        }
        if dim_idx == 0 {
            1
        } else {
            0
        }
    }
}

fn match_enum(cmd: &str, name: &str, pat: &str) -> bool {
    if cmd.ends_with("BEGINSWITH") {
        name.starts_with(pat)
    } else if cmd.ends_with("ENDSWITH") {
        name.ends_with(pat)
    } else {
        name.contains(pat)
    }
}

fn method_group_match(args: &[Value]) -> Value {
    if args.len() < 2 {
        return Value::Int(0);
    }
    let base = &args[0];
    Value::Int(args[1..].iter().filter(|v| value_equal(base, v)).count() as i64)
}

fn method_no_sames(args: &[Value]) -> Value {
    if args.len() < 2 {
        return Value::Int(1);
    }
    let base = &args[0];
    Value::Int(args[1..].iter().all(|v| !value_equal(base, v)) as i64)
}

fn method_all_sames(args: &[Value]) -> Value {
    if args.len() < 2 {
        return Value::Int(1);
    }
    let base = &args[0];
    Value::Int(args[1..].iter().all(|v| value_equal(base, v)) as i64)
}

fn to_half_width(s: &str) -> String {
    s.chars()
        .map(|r| match r {
            '\u{3000}' => ' ',
            '！'..='～' => char::from_u32(r as u32 - 0xFEE0).unwrap_or(r),
            _ => r,
        })
        .collect()
}

fn to_full_width(s: &str) -> String {
    s.chars()
        .map(|r| match r {
            ' ' => '\u{3000}',
            '!'..='~' => char::from_u32(r as u32 + 0xFEE0).unwrap_or(r),
            _ => r,
        })
        .collect()
}

fn color_from_name(name: &str) -> i64 {
    match name.trim().to_lowercase().as_str() {
        "black" => 0x000000,
        "white" => 0xFFFFFF,
        "red" => 0xFF0000,
        "lime" => 0x00FF00,
        "green" => 0x008000,
        "blue" => 0x0000FF,
        "yellow" => 0xFFFF00,
        "cyan" | "aqua" => 0x00FFFF,
        "magenta" | "fuchsia" => 0xFF00FF,
        "silver" => 0xC0C0C0,
        "gray" | "grey" => 0x808080,
        "maroon" => 0x800000,
        "olive" => 0x808000,
        "navy" => 0x000080,
        "teal" => 0x008080,
        "purple" => 0x800080,
        "orange" => 0xFFA500,
        "pink" => 0xFFC0CB,
        "brown" => 0xA52A2A,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_conversions_round_trip() {
        assert_eq!(to_full_width("A1!"), "Ａ１！");
        assert_eq!(to_half_width("Ａ１！　"), "A1! ");
    }

    #[test]
    fn color_names() {
        assert_eq!(color_from_name("White"), 0xFFFFFF);
        assert_eq!(color_from_name("nonsense"), -1);
    }

    #[test]
    fn group_match_counts_equal_values() {
        let args = vec![Value::Int(3), Value::Int(3), Value::Int(4), Value::Str("3".into())];
        assert_eq!(method_group_match(&args), Value::Int(2));
        assert_eq!(method_no_sames(&args), Value::Int(0));
        assert_eq!(method_all_sames(&args), Value::Int(0));
    }
}
