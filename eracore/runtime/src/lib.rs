//! ERA script runtime: typed values, sparse arrays, CSV store, the
//! tree-walking VM with its command surface, template engine, save codecs,
//! and the input mediator. `compile` is the embedding entry point.

use std::collections::HashMap;

use era_common::Result;
use serde::{Deserialize, Serialize};

pub mod array;
pub mod binary;
pub mod chara;
mod cmd;
pub mod csv;
mod expr;
mod flow;
mod form;
pub mod input;
mod methods;
pub mod save;
pub mod value;
pub mod vm;

pub use array::ArrayVar;
pub use binary::{convert_dat_file, is_era_binary_data};
pub use chara::{RuntimeCharacter, UiState};
pub use csv::CsvStore;
pub use input::{InputPhase, InputRequest, InputState};
pub use value::{Value, ValueKind};
pub use vm::{ExecResult, InputProvider, Vm};

/// One emitted text record, in the wire shape shared with host bridges.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Output {
    #[serde(rename = "Text")]
    pub text: String,
    #[serde(rename = "NewLine")]
    pub new_line: bool,
    #[serde(rename = "ClearLines", default)]
    pub clear_lines: i64,
}

impl Output {
    pub fn text(text: impl Into<String>, new_line: bool) -> Self {
        Self { text: text.into(), new_line, clear_lines: 0 }
    }
}

pub type OutputHook = Box<dyn FnMut(&Output)>;

/// Result envelope returned to embedding hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    pub outputs: Vec<Output>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parses ERH/ERB/CSV sources and builds a VM around the compiled program.
/// Map keys are virtual file names (e.g. `MAIN.ERB`).
pub fn compile(files: &HashMap<String, String>) -> Result<Vm> {
    let program = era_parser::parse_program(files)?;
    Vm::new(program)
}

/// Parse-only variant for tooling.
pub fn parse(files: &HashMap<String, String>) -> Result<era_ast::Program> {
    era_parser::parse_program(files)
}
