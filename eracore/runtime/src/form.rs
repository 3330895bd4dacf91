//! Form-template expansion: `%expr%`, `{expr[,width[,align]]}` and
//! `@cond?t#f@` placeholders, iterated to a fixed point with a hard cap.
//! Placeholder ends are found byte-wise; every delimiter is ASCII, so
//! slicing at those positions stays on char boundaries.

use era_common::Result;
use era_parser::{decode_char_seq, parse_expr, split_top_level};

use crate::value::Value;
use crate::vm::Vm;

const MAX_EXPAND_PASSES: usize = 8;

impl Vm {
    pub(crate) fn eval_print_form(&mut self, arg: &str) -> Result<String> {
        let tmpl = decode_char_seq(arg);
        self.expand_form_template(&tmpl)
    }

    pub(crate) fn expand_decoded_template(&mut self, raw: &str) -> Result<String> {
        self.expand_form_template(&decode_char_seq(raw))
    }

    pub(crate) fn expand_form_template(&mut self, tmpl: &str) -> Result<String> {
        let mut out = tmpl.to_string();
        for _ in 0..MAX_EXPAND_PASSES {
            let prev = out.clone();
            out = self.eval_percent_placeholders(&out)?;
            out = self.eval_brace_placeholders(&out)?;
            out = self.eval_at_placeholders(&out)?;
            if out == prev {
                break;
            }
        }
        Ok(out)
    }

    pub(crate) fn eval_percent_placeholders(&mut self, tmpl: &str) -> Result<String> {
        let bytes = tmpl.as_bytes();
        let mut b = String::with_capacity(tmpl.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'%' {
                let next = next_byte_boundary(tmpl, i);
                b.push_str(&tmpl[i..next]);
                i = next;
                continue;
            }
            let Some(j) = find_percent_placeholder_end(bytes, i + 1) else {
                b.push_str(&tmpl[i..]);
                break;
            };
            let expr_raw = tmpl[i + 1..j].trim();
            if expr_raw.is_empty() {
                b.push_str("%%");
                i = j + 1;
                continue;
            }
            match self.eval_padded_placeholder_expr(expr_raw)? {
                Some(repl) => b.push_str(&repl),
                None => b.push_str(&tmpl[i..=j]),
            }
            i = j + 1;
        }
        Ok(b)
    }

    pub(crate) fn eval_brace_placeholders(&mut self, tmpl: &str) -> Result<String> {
        let bytes = tmpl.as_bytes();
        let mut b = String::with_capacity(tmpl.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'{' {
                let next = next_byte_boundary(tmpl, i);
                b.push_str(&tmpl[i..next]);
                i = next;
                continue;
            }
            let Some(j) = find_brace_placeholder_end(bytes, i + 1) else {
                b.push_str(&tmpl[i..]);
                break;
            };
            let expr_raw = tmpl[i + 1..j].trim();
            if expr_raw.is_empty() {
                b.push_str("{}");
                i = j + 1;
                continue;
            }
            match self.eval_padded_placeholder_expr(expr_raw)? {
                Some(repl) => b.push_str(&repl),
                None => b.push_str(&tmpl[i..=j]),
            }
            i = j + 1;
        }
        Ok(b)
    }

    // `expr` or `base, width[, align]`.
    fn eval_padded_placeholder_expr(&mut self, raw: &str) -> Result<Option<String>> {
        if let Ok(expr) = parse_expr(raw) {
            let v = self.eval_expr(&expr)?;
            return Ok(Some(v.as_str()));
        }
        let parts = split_top_level(raw, ',');
        if parts.len() < 2 {
            return Ok(None);
        }
        let base_raw = parts[0].trim();
        let width_raw = parts[1].trim();
        if base_raw.is_empty() || width_raw.is_empty() {
            return Ok(None);
        }
        let Ok(base_expr) = parse_expr(base_raw) else {
            return Ok(None);
        };
        let base_val = self.eval_expr(&base_expr)?;
        let width = match self.eval_loose_expr(width_raw) {
            Ok(v) => v.as_int(),
            Err(_) => match width_raw.parse::<i64>() {
                Ok(n) => n,
                Err(_) => return Ok(None),
            },
        };
        let mut align = "RIGHT".to_string();
        if parts.len() >= 3 {
            let align_raw = parts[2].trim();
            if !align_raw.is_empty() {
                align = match self.eval_loose_expr(align_raw) {
                    Ok(v) => v.as_str().trim().to_uppercase(),
                    Err(_) => align_raw.trim_matches('"').to_uppercase(),
                };
            }
        }
        Ok(Some(format_print_field(&base_val.as_str(), width, &align)))
    }

    fn eval_at_placeholders(&mut self, tmpl: &str) -> Result<String> {
        let bytes = tmpl.as_bytes();
        let mut b = String::with_capacity(tmpl.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'@' {
                let next = next_byte_boundary(tmpl, i);
                b.push_str(&tmpl[i..next]);
                i = next;
                continue;
            }
            let Some(j) = find_at_placeholder_end(bytes, i + 1) else {
                b.push('@');
                i += 1;
                continue;
            };
            let expr_raw = tmpl[i + 1..j].trim();
            if expr_raw.is_empty() {
                b.push_str(&tmpl[i..=j]);
                i = j + 1;
                continue;
            }
            match self.eval_at_placeholder_expr(expr_raw)? {
                Some(repl) => b.push_str(&repl),
                None => b.push_str(&tmpl[i..=j]),
            }
            i = j + 1;
        }
        Ok(b)
    }

    pub(crate) fn eval_at_placeholder_expr(&mut self, raw: &str) -> Result<Option<String>> {
        if let Ok(expr) = parse_expr(raw) {
            let v = self.eval_expr(&expr)?;
            return Ok(Some(v.as_str()));
        }
        let Some((cond_raw, t_raw, f_raw)) = split_top_level_ternary(raw) else {
            return Ok(None);
        };
        let cond = self.eval_loose_expr(&cond_raw)?;
        let branch = if cond.truthy() { t_raw } else { f_raw };
        let text = self.eval_at_branch(branch.trim())?;
        Ok(Some(text))
    }

    fn eval_at_branch(&mut self, raw: &str) -> Result<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(String::new());
        }
        if let Some(inner) = unwrap_full_percent(raw) {
            let v = self.eval_loose_expr(&inner)?;
            return Ok(v.as_str());
        }
        if let Ok(expr) = parse_expr(raw) {
            let v = self.eval_expr(&expr)?;
            return Ok(v.as_str());
        }
        self.expand_form_template(raw)
    }

    pub(crate) fn eval_loose_expr(&mut self, raw: &str) -> Result<Value> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Value::Str(String::new()));
        }
        if let Ok(e) = parse_expr(raw) {
            return self.eval_expr(&e);
        }
        if let Some(s) = era_parser::expr::unquote_string(raw) {
            return Ok(Value::Str(s));
        }
        Ok(Value::Str(raw.to_string()))
    }
}

fn next_byte_boundary(s: &str, i: usize) -> usize {
    let bytes = s.as_bytes();
    let mut j = i + 1;
    while j < bytes.len() && (bytes[j] & 0xC0) == 0x80 {
        j += 1;
    }
    j
}

/// Width padding in code points; strings at or over the width pass through.
pub(crate) fn format_print_field(text: &str, width: i64, align: &str) -> String {
    let width = width.unsigned_abs() as usize;
    if width == 0 {
        return text.to_string();
    }
    let rlen = text.chars().count();
    if rlen >= width {
        return text.to_string();
    }
    let pad = width - rlen;
    match align {
        "LEFT" => format!("{}{}", text, " ".repeat(pad)),
        "CENTER" | "MIDDLE" => {
            let left = pad / 2;
            format!("{}{}{}", " ".repeat(left), text, " ".repeat(pad - left))
        }
        _ => format!("{}{}", " ".repeat(pad), text),
    }
}

pub(crate) fn unwrap_full_percent(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if raw.len() < 2 || bytes[0] != b'%' {
        return None;
    }
    let end = find_percent_placeholder_end(bytes, 1)?;
    if end != raw.len() - 1 {
        return None;
    }
    Some(raw[1..raw.len() - 1].trim().to_string())
}

pub(crate) fn split_top_level_ternary(raw: &str) -> Option<(String, String, String)> {
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut verbatim = false;
    let mut escape = false;
    let mut q: Option<usize> = None;
    let mut i = 0;
    while i < bytes.len() {
        let ch = bytes[i];
        if in_string {
            if verbatim {
                if ch == b'"' {
                    in_string = false;
                    verbatim = false;
                }
                i += 1;
                continue;
            }
            if escape {
                escape = false;
                i += 1;
                continue;
            }
            match ch {
                b'\\' => escape = true,
                b'"' => in_string = false,
                _ => {}
            }
            i += 1;
            continue;
        }
        if ch == b'@' && i + 1 < bytes.len() && bytes[i + 1] == b'"' {
            in_string = true;
            verbatim = true;
            i += 2;
            continue;
        }
        match ch {
            b'"' => in_string = true,
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'?' if depth == 0 && q.is_none() => q = Some(i),
            b'#' if depth == 0 => {
                if let Some(q) = q {
                    return Some((
                        raw[..q].trim().to_string(),
                        raw[q + 1..i].trim().to_string(),
                        raw[i + 1..].trim().to_string(),
                    ));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Scans for the closing `%`. Inside a verbatim `@"…"` literal, embedded
/// `%…%` spans may contain arbitrary text including nested string literals;
/// a small state machine tracks that nesting.
pub(crate) fn find_percent_placeholder_end(s: &[u8], start: usize) -> Option<usize> {
    let mut st = VerbatimScanner::default();
    let mut i = start;
    while i < s.len() {
        let ch = s[i];
        if st.step(ch, s.get(i + 1).copied(), &mut i) {
            continue;
        }
        if ch == b'%' {
            return Some(i);
        }
        i += 1;
    }
    None
}

pub(crate) fn find_brace_placeholder_end(s: &[u8], start: usize) -> Option<usize> {
    let mut st = VerbatimScanner::default();
    let mut depth = 1usize;
    let mut i = start;
    while i < s.len() {
        let ch = s[i];
        if st.step(ch, s.get(i + 1).copied(), &mut i) {
            continue;
        }
        match ch {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn find_at_placeholder_end(s: &[u8], start: usize) -> Option<usize> {
    let mut in_string = false;
    let mut verbatim = false;
    let mut escape = false;
    let mut i = start;
    while i < s.len() {
        let ch = s[i];
        if in_string {
            if verbatim {
                if ch == b'"' {
                    in_string = false;
                    verbatim = false;
                }
                i += 1;
                continue;
            }
            if escape {
                escape = false;
                i += 1;
                continue;
            }
            match ch {
                b'\\' => escape = true,
                b'"' => in_string = false,
                _ => {}
            }
            i += 1;
            continue;
        }
        if ch == b'@' && i + 1 < s.len() && s[i + 1] == b'"' {
            in_string = true;
            verbatim = true;
            i += 2;
            continue;
        }
        if ch == b'"' {
            in_string = true;
            verbatim = false;
            i += 1;
            continue;
        }
        if ch == b'@' {
            // An `@` glued to the previous character is escaped-form output,
            // not a delimiter.
            if i > start && !(s[i - 1] as char).is_whitespace() {
                i += 1;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

// String/verbatim tracking shared by the % and {} scanners. Returns true
// when the byte was consumed as string content (the caller skips it).
#[derive(Default)]
struct VerbatimScanner {
    in_string: bool,
    verbatim: bool,
    escape: bool,
    verb_in_percent: bool,
    verb_in_expr_string: bool,
    verb_expr_verbatim: bool,
    verb_expr_escape: bool,
}

impl VerbatimScanner {
    fn step(&mut self, ch: u8, next: Option<u8>, i: &mut usize) -> bool {
        if self.in_string {
            if self.verbatim {
                if self.verb_in_percent {
                    if self.verb_in_expr_string {
                        if self.verb_expr_verbatim {
                            if ch == b'"' {
                                self.verb_in_expr_string = false;
                                self.verb_expr_verbatim = false;
                            }
                            *i += 1;
                            return true;
                        }
                        if self.verb_expr_escape {
                            self.verb_expr_escape = false;
                            *i += 1;
                            return true;
                        }
                        match ch {
                            b'\\' => self.verb_expr_escape = true,
                            b'"' => self.verb_in_expr_string = false,
                            _ => {}
                        }
                        *i += 1;
                        return true;
                    }
                    if ch == b'@' && next == Some(b'"') {
                        self.verb_in_expr_string = true;
                        self.verb_expr_verbatim = true;
                        *i += 2;
                        return true;
                    }
                    match ch {
                        b'"' => {
                            self.verb_in_expr_string = true;
                            self.verb_expr_verbatim = false;
                        }
                        b'%' => self.verb_in_percent = false,
                        _ => {}
                    }
                    *i += 1;
                    return true;
                }
                match ch {
                    b'%' => self.verb_in_percent = true,
                    b'"' => {
                        self.in_string = false;
                        self.verbatim = false;
                        self.verb_in_percent = false;
                        self.verb_in_expr_string = false;
                        self.verb_expr_verbatim = false;
                        self.verb_expr_escape = false;
                    }
                    _ => {}
                }
                *i += 1;
                return true;
            }
            if self.escape {
                self.escape = false;
                *i += 1;
                return true;
            }
            match ch {
                b'\\' => self.escape = true,
                b'"' => self.in_string = false,
                _ => {}
            }
            *i += 1;
            return true;
        }
        if ch == b'@' && next == Some(b'"') {
            self.in_string = true;
            self.verbatim = true;
            *i += 2;
            return true;
        }
        if ch == b'"' {
            self.in_string = true;
            self.verbatim = false;
            *i += 1;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_padding_and_alignment() {
        assert_eq!(format_print_field("6", 4, "LEFT"), "6   ");
        assert_eq!(format_print_field("6", 4, "RIGHT"), "   6");
        assert_eq!(format_print_field("ab", 5, "CENTER"), " ab  ");
        assert_eq!(format_print_field("abcdef", 4, "LEFT"), "abcdef");
        assert_eq!(format_print_field("x", -3, "LEFT"), "x  ");
    }

    #[test]
    fn percent_end_skips_string_literals() {
        let s = br#"A + "50%" %"#;
        assert_eq!(find_percent_placeholder_end(s, 0), Some(s.len() - 1));
    }

    #[test]
    fn percent_end_handles_verbatim_nesting() {
        let s = br#"@"x % @"inner" % y" %"#;
        assert_eq!(find_percent_placeholder_end(s, 0), Some(s.len() - 1));
    }

    #[test]
    fn brace_end_is_depth_balanced() {
        let s = b"a { b } c }";
        assert_eq!(find_brace_placeholder_end(s, 0), Some(s.len() - 1));
    }

    #[test]
    fn ternary_split_respects_strings() {
        let (c, t, f) = split_top_level_ternary(r#"A ? "y#es" # no"#).unwrap();
        assert_eq!(c, "A");
        assert_eq!(t, r#""y#es""#);
        assert_eq!(f, "no");
    }
}
