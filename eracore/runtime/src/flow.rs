//! Precomputed try/catch and try-list indexes, one map per thunk id.

use std::collections::HashMap;

use era_ast::{Statement, Thunk};
use era_common::Result;

use crate::vm::{ExecResult, Vm};

#[derive(Debug, Default, Clone)]
pub struct ThunkFlow {
    pub try_catch: HashMap<usize, usize>,
    pub catch_end: HashMap<usize, usize>,
    pub try_list_end: HashMap<usize, usize>,
    pub try_list_funcs: HashMap<usize, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlowStackKind {
    TryC,
    Catch,
    TryList,
}

impl Vm {
    pub(crate) fn build_flow_index(&mut self) {
        let program = self.program.clone();
        for func in program.functions.values() {
            self.build_flow_for_thunk(&func.body);
        }
    }

    fn build_flow_for_thunk(&mut self, thunk: &Thunk) {
        if self.flow_map.contains_key(&thunk.id) {
            return;
        }
        let mut flow = ThunkFlow::default();
        let mut stack: Vec<(FlowStackKind, usize)> = Vec::new();
        for (i, stmt) in thunk.statements.iter().enumerate() {
            if let Statement::Command { name, arg } = stmt {
                match name.trim().to_uppercase().as_str() {
                    "TRYCCALL" | "TRYCCALLFORM" | "TRYCJUMP" | "TRYCJUMPFORM" | "TRYCGOTO"
                    | "TRYCGOTOFORM" => {
                        stack.push((FlowStackKind::TryC, i));
                    }
                    "CATCH" => {
                        if let Some(&(FlowStackKind::TryC, idx)) = stack.last() {
                            stack.pop();
                            flow.try_catch.insert(idx, i);
                            stack.push((FlowStackKind::Catch, i));
                        }
                    }
                    "ENDCATCH" => {
                        if let Some(&(FlowStackKind::Catch, idx)) = stack.last() {
                            stack.pop();
                            flow.catch_end.insert(idx, i);
                        }
                    }
                    "TRYCALLLIST" | "TRYJUMPLIST" | "TRYGOTOLIST" => {
                        stack.push((FlowStackKind::TryList, i));
                    }
                    "FUNC" => {
                        if let Some(&(FlowStackKind::TryList, base)) = stack.last() {
                            flow.try_list_funcs.entry(base).or_default().push(arg.trim().to_string());
                        }
                    }
                    "ENDFUNC" => {
                        if let Some(&(FlowStackKind::TryList, base)) = stack.last() {
                            stack.pop();
                            flow.try_list_end.insert(base, i);
                        }
                    }
                    _ => {}
                }
            }
            for child in stmt.child_thunks() {
                self.build_flow_for_thunk(child);
            }
        }
        self.flow_map.insert(thunk.id, flow);
    }

    fn current_flow(&self) -> Option<&ThunkFlow> {
        self.flow_map.get(&self.exec_thunk?)
    }

    pub(crate) fn current_catch_end_index(&self) -> Option<usize> {
        self.current_flow()?.catch_end.get(&self.exec_pc).copied()
    }

    /// On a `TRYC*` failure, jump just past the matching CATCH.
    pub(crate) fn handle_try_failure(&mut self, name: &str) -> Result<ExecResult> {
        if !name.starts_with("TRYC") {
            return Ok(ExecResult::None);
        }
        let Some(flow) = self.current_flow() else {
            return Ok(ExecResult::None);
        };
        let Some(&catch_idx) = flow.try_catch.get(&self.exec_pc) else {
            return Ok(ExecResult::None);
        };
        Ok(ExecResult::JumpIndex(catch_idx + 1))
    }

    pub(crate) fn exec_try_list_block(&mut self, name: &str) -> Result<Option<ExecResult>> {
        let Some(flow) = self.current_flow() else {
            return Ok(None);
        };
        let Some(entries) = flow.try_list_funcs.get(&self.exec_pc).cloned() else {
            return Ok(None);
        };
        let end_idx = flow.try_list_end.get(&self.exec_pc).copied();

        let skip_to_end = |_: &mut Vm| match end_idx {
            Some(idx) => Ok(Some(ExecResult::JumpIndex(idx))),
            None => Ok(Some(ExecResult::None)),
        };

        if name == "TRYGOTOLIST" {
            let Some(fr) = self.current_frame() else {
                return skip_to_end(self);
            };
            let labels = fr.func.body.labels.clone();
            for raw in &entries {
                let Ok(label) = self.eval_command_target(raw, false) else { continue };
                let label = label.trim().to_uppercase();
                if label.is_empty() {
                    continue;
                }
                if labels.contains_key(&label) {
                    return Ok(Some(ExecResult::Goto(label)));
                }
            }
            return skip_to_end(self);
        }

        for raw in &entries {
            let Ok((target, args)) = self.parse_command_call(raw, false) else { continue };
            let target = target.trim().to_uppercase();
            if target.is_empty() || !self.program.functions.contains_key(&target) {
                continue;
            }
            let args = args.into_iter().map(Some).collect();
            let res = self.call_function(&target, args)?;
            if let (Some(idx), ExecResult::None) = (end_idx, &res) {
                return Ok(Some(ExecResult::JumpIndex(idx)));
            }
            return Ok(Some(res));
        }
        skip_to_end(self)
    }
}
