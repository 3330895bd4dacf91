//! Input mediation between suspended execution and the host: queued values
//! first, then the provider, then timed/default semantics.

use era_common::Result;
use era_parser::{decode_char_seq, split_top_level};

use crate::value::Value;
use crate::vm::{ExecResult, Vm};
use crate::Output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputPhase {
    #[default]
    Idle,
    Wait,
    Input,
}

#[derive(Debug, Clone, Default)]
pub struct InputRequest {
    pub command: String,
    pub numeric: bool,
    pub one_input: bool,
    pub timed: bool,
    pub timeout_ms: i64,
    pub countdown: bool,
    pub nullable: bool,
    pub default_value: Option<Value>,
    pub timeout_message: String,
}

#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub phase: InputPhase,
    pub current: Option<InputRequest>,
    pub queue: Vec<String>,
    pub last_value: String,
    pub last_timeout: bool,
}

impl Vm {
    pub fn enqueue_input<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input.queue.extend(values.into_iter().map(Into::into));
    }

    pub fn input_state(&self) -> &InputState {
        &self.input
    }

    fn begin_input_request(&mut self, req: &InputRequest) {
        self.input.phase = if !req.numeric
            && !req.timed
            && !req.nullable
            && !req.one_input
            && req.command == "WAIT"
        {
            InputPhase::Wait
        } else {
            InputPhase::Input
        };
        self.input.current = Some(req.clone());
    }

    fn finish_input_request(&mut self, value: &str, timeout: bool) {
        self.input.last_value = value.to_string();
        self.input.last_timeout = timeout;
        self.input.current = None;
        self.input.phase = InputPhase::Idle;
    }

    fn consume_queued_input(&mut self) -> Option<String> {
        if self.input.queue.is_empty() {
            return None;
        }
        Some(self.input.queue.remove(0))
    }

    fn maybe_echo_input(&mut self, text: &str) {
        if self.ui.skip_disp {
            return;
        }
        self.emit_output(Output::text(text.to_string(), true));
    }

    /// The single suspension point. Resolution order: queued value, then the
    /// attached provider, then timed/default fallbacks.
    pub(crate) fn resolve_input(&mut self, req: InputRequest) -> Result<(String, bool)> {
        // Input boundary: the runaway-script watchdog restarts here.
        self.exec_steps = 0;
        self.begin_input_request(&req);
        if let Some(raw) = self.consume_queued_input() {
            self.finish_input_request(&raw, false);
            return Ok((raw, false));
        }
        if self.input_provider.is_some() {
            let mut provider = self.input_provider.take().expect("provider");
            let res = provider(&req);
            self.input_provider = Some(provider);
            match res {
                Ok((value, timeout)) => {
                    if timeout && !req.timeout_message.is_empty() {
                        let msg = req.timeout_message.clone();
                        self.maybe_echo_input(&msg);
                    }
                    self.finish_input_request(&value, timeout);
                    return Ok((value, timeout));
                }
                Err(e) => {
                    self.finish_input_request("", false);
                    return Err(e);
                }
            }
        }
        if req.timed {
            if !req.timeout_message.is_empty() {
                let msg = req.timeout_message.clone();
                self.maybe_echo_input(&msg);
            }
            if let Some(def) = &req.default_value {
                let value = def.as_str();
                self.finish_input_request(&value, true);
                return Ok((value, true));
            }
            self.finish_input_request("", true);
            return Ok((String::new(), true));
        }
        if let Some(def) = &req.default_value {
            let value = def.as_str();
            self.finish_input_request(&value, false);
            return Ok((value, false));
        }
        self.finish_input_request("", false);
        Ok((String::new(), false))
    }

    /// Implicit one-key wait after a `W`-suffixed print; consumes at most
    /// one queued entry.
    pub(crate) fn implicit_wait(&mut self, command: &str) -> Result<()> {
        let req = InputRequest { command: command.to_string(), ..Default::default() };
        self.resolve_input(req)?;
        Ok(())
    }

    pub(crate) fn exec_wait_like(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let mut req = InputRequest { command: name.to_string(), ..Default::default() };
        if name == "AWAIT" || name == "TWAIT" {
            req.timed = true;
            if !arg.trim().is_empty() {
                let mut parts = split_top_level(arg, ',');
                if parts.iter().all(|p| p.is_empty()) {
                    parts = arg.split_whitespace().map(String::from).collect();
                }
                if let Some(first) = parts.first() {
                    if !first.trim().is_empty() {
                        if let Ok(v) = self.eval_loose_expr(first) {
                            req.timeout_ms = v.as_int();
                        }
                    }
                }
            }
        }
        self.resolve_input(req)?;
        self.globals.insert("RESULT".to_string(), Value::Int(1));
        Ok(ExecResult::None)
    }

    pub(crate) fn exec_input_int_like(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let mut req = InputRequest {
            command: name.to_string(),
            numeric: true,
            one_input: name.starts_with("ONE") || name.starts_with("TONE"),
            timed: name.starts_with('T'),
            ..Default::default()
        };
        if !req.timed {
            if !arg.trim().is_empty() {
                let v = self.eval_loose_expr(arg)?;
                let def = v.as_int();
                if req.one_input {
                    if def >= 0 {
                        req.default_value = Some(Value::Int(normalize_one_digit(def)));
                    }
                } else {
                    req.default_value = Some(Value::Int(def));
                }
            }
        } else {
            self.fill_timed_request(&mut req, arg, true)?;
        }

        let (raw, _) = self.resolve_input(req.clone())?;
        let mut n = if raw.is_empty() {
            req.default_value.as_ref().map_or(0, |d| d.as_int())
        } else {
            match parse_int_input(&raw) {
                Some(v) => v,
                None => req.default_value.as_ref().map_or(0, |d| d.as_int()),
            }
        };
        if req.one_input {
            n = normalize_one_digit(n);
        }
        self.globals.insert("RESULT".to_string(), Value::Int(n));
        self.maybe_echo_input(&n.to_string());
        Ok(ExecResult::None)
    }

    pub(crate) fn exec_input_string_like(&mut self, name: &str, arg: &str) -> Result<ExecResult> {
        let mut req = InputRequest {
            command: name.to_string(),
            one_input: name.starts_with("ONE") || name.starts_with("TONE"),
            timed: name.starts_with('T'),
            ..Default::default()
        };
        if !req.timed {
            if !arg.trim().is_empty() {
                let v = self.eval_loose_expr(arg)?;
                let mut def = v.as_str();
                if req.one_input {
                    def = first_rune(&def);
                }
                req.default_value = Some(Value::Str(def));
            }
        } else {
            self.fill_timed_request(&mut req, arg, false)?;
        }

        let (raw, _) = self.resolve_input(req.clone())?;
        let mut out = if raw.is_empty() {
            req.default_value.as_ref().map_or(String::new(), |d| d.as_str())
        } else {
            raw
        };
        if req.one_input {
            out = first_rune(&out);
        }
        self.globals.insert("RESULTS".to_string(), Value::Str(out.clone()));
        self.maybe_echo_input(&out);
        Ok(ExecResult::None)
    }

    // `T*` variants take `timeout[, default[, countdown[, message]]]`.
    fn fill_timed_request(&mut self, req: &mut InputRequest, arg: &str, numeric: bool) -> Result<()> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() == 1 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if let Some(p) = parts.first() {
            if !p.trim().is_empty() {
                if let Ok(v) = self.eval_loose_expr(p) {
                    req.timeout_ms = v.as_int();
                }
            }
        }
        if let Some(p) = parts.get(1) {
            if !p.trim().is_empty() {
                if let Ok(v) = self.eval_loose_expr(p) {
                    if numeric {
                        let mut def = v.as_int();
                        if req.one_input {
                            def = normalize_one_digit(def);
                        }
                        req.default_value = Some(Value::Int(def));
                    } else {
                        let mut def = v.as_str();
                        if req.one_input {
                            def = first_rune(&def);
                        }
                        req.default_value = Some(Value::Str(def));
                    }
                }
            }
        }
        req.countdown = true;
        if let Some(p) = parts.get(2) {
            if !p.trim().is_empty() {
                if let Ok(v) = self.eval_loose_expr(p) {
                    req.countdown = v.as_int() != 0;
                }
            }
        }
        if let Some(p) = parts.get(3) {
            if !p.trim().is_empty() {
                req.timeout_message = match self.eval_loose_expr(p) {
                    Ok(v) => v.as_str(),
                    Err(_) => decode_char_seq(p.trim()),
                };
            }
        }
        Ok(())
    }
}

pub(crate) fn normalize_one_digit(v: i64) -> i64 {
    let v = v.abs();
    if v < 10 {
        return v;
    }
    let s = v.to_string();
    s[..1].parse().unwrap_or(0)
}

pub(crate) fn first_rune(s: &str) -> String {
    s.chars().next().map(|c| c.to_string()).unwrap_or_default()
}

/// Numeric input parsing with full-width digit and sign normalization
/// (IME users routinely type full-width numerals).
pub(crate) fn parse_int_input(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut b = String::with_capacity(raw.len());
    for r in raw.chars() {
        match r {
            '０'..='９' => b.push((b'0' + (r as u32 - '０' as u32) as u8) as char),
            '＋' => b.push('+'),
            '－' | 'ー' | '―' | '−' => b.push('-'),
            _ => b.push(r),
        }
    }
    b.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullwidth_digits_normalize() {
        assert_eq!(parse_int_input("１２３"), Some(123));
        assert_eq!(parse_int_input("－４"), Some(-4));
        assert_eq!(parse_int_input(" 42 "), Some(42));
        assert_eq!(parse_int_input("x"), None);
    }

    #[test]
    fn one_digit_normalization() {
        assert_eq!(normalize_one_digit(7), 7);
        assert_eq!(normalize_one_digit(-7), 7);
        assert_eq!(normalize_one_digit(1234), 1);
    }

    #[test]
    fn first_rune_is_a_code_point() {
        assert_eq!(first_rune("漢字"), "漢");
        assert_eq!(first_rune(""), "");
    }
}
