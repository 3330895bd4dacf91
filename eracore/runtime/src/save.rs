//! Structured (JSON) save documents and file-slot management. The binary
//! codec lives in `binary.rs`; both formats round-trip the same data.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use era_ast::VarRef;
use era_common::{EraError, Result};
use era_parser::split_top_level;
use serde::{Deserialize, Serialize};

use crate::array::ArrayVar;
use crate::chara::RuntimeCharacter;
use crate::value::Value;
use crate::vm::{ExecResult, Vm};

pub(crate) const VAR_FORMAT: &str = "erago.var.v1";
pub(crate) const CHARA_FORMAT: &str = "erago.chara.v1";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaveValue {
    pub kind: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub i: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub s: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaveArraySnapshot {
    pub is_string: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dynamic: bool,
    pub dims: Vec<usize>,
    pub data: HashMap<String, SaveValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VarDataSnapshot {
    pub format: String,
    pub saved_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub save_mes: String,
    #[serde(default)]
    pub globals: HashMap<String, SaveValue>,
    #[serde(default)]
    pub arrays: HashMap<String, SaveArraySnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub var_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub array_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CharaSaveItem {
    pub id: i64,
    #[serde(default)]
    pub vars: HashMap<String, SaveValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CharaDataSnapshot {
    pub format: String,
    pub saved_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub save_mes: String,
    #[serde(default)]
    pub indices: Vec<i64>,
    #[serde(default)]
    pub characters: Vec<CharaSaveItem>,
}

// Whole-session slot snapshot used by SAVEGAME/SAVEDATA.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SlotSnapshot {
    globals: HashMap<String, SaveValue>,
    #[serde(default)]
    g_arrays: HashMap<String, SaveArraySnapshot>,
}

pub(crate) fn value_to_save_value(v: &Value) -> SaveValue {
    match v {
        Value::Str(s) => SaveValue { kind: "string".to_string(), i: 0, s: s.clone() },
        Value::Int(i) => SaveValue { kind: "int".to_string(), i: *i, s: String::new() },
    }
}

pub(crate) fn save_value_to_value(v: &SaveValue) -> Value {
    if v.kind.eq_ignore_ascii_case("string") {
        Value::Str(v.s.clone())
    } else {
        Value::Int(v.i)
    }
}

pub(crate) fn array_to_snapshot(arr: &ArrayVar) -> SaveArraySnapshot {
    SaveArraySnapshot {
        is_string: arr.is_string,
        is_dynamic: arr.is_dynamic,
        dims: arr.dims.clone(),
        data: arr
            .data
            .iter()
            .map(|(k, v)| (k.clone(), value_to_save_value(v)))
            .collect(),
    }
}

pub(crate) fn snapshot_to_array(snap: &SaveArraySnapshot) -> ArrayVar {
    let mut arr = ArrayVar::new(snap.is_string, snap.is_dynamic, &snap.dims);
    for (k, v) in &snap.data {
        arr.data.insert(k.clone(), save_value_to_value(v));
    }
    arr
}

pub(crate) fn build_var_snapshot(
    save_mes: &str,
    globals: &HashMap<String, Value>,
    arrays: &HashMap<String, ArrayVar>,
) -> VarDataSnapshot {
    let mut snap = VarDataSnapshot {
        format: VAR_FORMAT.to_string(),
        saved_at: Utc::now().to_rfc3339(),
        save_mes: save_mes.to_string(),
        ..Default::default()
    };
    let mut keys: Vec<&String> = globals.keys().collect();
    keys.sort();
    for k in keys {
        snap.globals.insert(k.clone(), value_to_save_value(&globals[k]));
        snap.var_order.push(k.clone());
    }
    let mut names: Vec<&String> = arrays.keys().collect();
    names.sort();
    for name in names {
        snap.arrays.insert(name.clone(), array_to_snapshot(&arrays[name]));
        snap.array_list.push(name.clone());
    }
    snap
}

pub(crate) fn build_chara_snapshot(
    save_mes: &str,
    indices: &[i64],
    chars: &[RuntimeCharacter],
) -> CharaDataSnapshot {
    CharaDataSnapshot {
        format: CHARA_FORMAT.to_string(),
        saved_at: Utc::now().to_rfc3339(),
        save_mes: save_mes.to_string(),
        indices: indices.to_vec(),
        characters: chars
            .iter()
            .map(|ch| CharaSaveItem {
                id: ch.id,
                vars: ch.vars.iter().map(|(k, v)| (k.clone(), value_to_save_value(v))).collect(),
            })
            .collect(),
    }
}

pub(crate) fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let b = serde_json::to_vec_pretty(value)
        .map_err(|e| EraError(format!("marshal save: {}", e)))?;
    fs::write(path, b).map_err(|e| EraError(format!("write save: {}", e)))
}

pub(crate) fn read_var_snapshot_json(data: &[u8]) -> Result<VarDataSnapshot> {
    serde_json::from_slice(data).map_err(|e| EraError(format!("parse save: {}", e)))
}

pub(crate) fn read_chara_snapshot_json(data: &[u8]) -> Result<CharaDataSnapshot> {
    serde_json::from_slice(data).map_err(|e| EraError(format!("parse save: {}", e)))
}

fn invalid_dat_name(name: &str) -> bool {
    name.trim().is_empty()
        || name.contains(['/', '\\', '\0'])
        || name.contains(['<', '>', ':', '"', '|', '?', '*'])
}

pub(crate) fn sanitize_slot(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|r| if r.is_ascii_alphanumeric() || r == '_' || r == '-' { r } else { '_' })
        .collect()
}

impl Vm {
    fn ensure_save_dir(&mut self) -> Result<PathBuf> {
        if self.save_dir.is_empty() {
            self.save_dir = Path::new(".").join(".era_saves").to_string_lossy().into_owned();
        }
        let dir = PathBuf::from(&self.save_dir);
        fs::create_dir_all(&dir).map_err(|e| EraError(format!("create save dir: {}", e)))?;
        Ok(dir)
    }

    fn slot_path(&mut self, slot: &str) -> Result<PathBuf> {
        let dir = self.ensure_save_dir()?;
        let slot = if slot.is_empty() { "default" } else { slot };
        Ok(dir.join(format!("{}.json", slot)))
    }

    fn var_dat_path(&mut self, name: &str) -> Result<PathBuf> {
        Ok(self.ensure_save_dir()?.join(format!("var_{}.dat", name)))
    }

    fn var_dat_json_path(&mut self, name: &str) -> Result<PathBuf> {
        Ok(self.ensure_save_dir()?.join(format!("var_{}.json", name)))
    }

    fn chara_dat_path(&mut self, name: &str) -> Result<PathBuf> {
        Ok(self.ensure_save_dir()?.join(format!("chara_{}.dat", name)))
    }

    fn chara_dat_json_path(&mut self, name: &str) -> Result<PathBuf> {
        Ok(self.ensure_save_dir()?.join(format!("chara_{}.json", name)))
    }

    pub(crate) fn save_globals(&mut self, slot: &str) -> Result<()> {
        let path = self.slot_path(slot)?;
        let snap = SlotSnapshot {
            globals: self
                .globals
                .iter()
                .map(|(k, v)| (k.clone(), value_to_save_value(v)))
                .collect(),
            g_arrays: self
                .g_arrays
                .iter()
                .map(|(k, arr)| (k.clone(), array_to_snapshot(arr)))
                .collect(),
        };
        write_json_file(&path, &snap)
    }

    pub(crate) fn load_globals(&mut self, slot: &str) -> Result<bool> {
        let path = self.slot_path(slot)?;
        let data = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(EraError(format!("read save: {}", e))),
        };
        let snap: SlotSnapshot =
            serde_json::from_slice(&data).map_err(|e| EraError(format!("parse save: {}", e)))?;
        for (k, sv) in &snap.globals {
            self.globals.insert(k.clone(), save_value_to_value(sv));
        }
        for (name, saved) in &snap.g_arrays {
            self.g_arrays.insert(name.clone(), snapshot_to_array(saved));
        }
        Ok(true)
    }

    fn delete_save(&mut self, slot: &str) -> Result<()> {
        let path = self.slot_path(slot)?;
        match fs::remove_file(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EraError(format!("delete save: {}", e))),
        }
    }

    fn has_save(&mut self, slot: &str) -> Result<bool> {
        let path = self.slot_path(slot)?;
        Ok(path.exists())
    }

    fn eval_save_slot(&mut self, arg: &str) -> String {
        match self.eval_slot_expr(arg) {
            Ok(slot) if !slot.is_empty() => slot,
            _ => "default".to_string(),
        }
    }

    fn eval_slot_expr(&mut self, raw: &str) -> Result<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(String::new());
        }
        match self.eval_loose_expr(raw) {
            Ok(v) => Ok(sanitize_slot(&v.as_str())),
            Err(_) => Ok(sanitize_slot(raw)),
        }
    }

    fn eval_dat_filename(&mut self, raw: &str) -> Result<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EraError("missing filename".into()));
        }
        let name = match self.eval_loose_expr(raw) {
            Ok(v) => v.as_str().trim().to_string(),
            Err(_) => raw.to_string(),
        };
        if invalid_dat_name(&name) {
            return Err(EraError(format!("invalid filename {:?}", name)));
        }
        Ok(name)
    }

    // ---- slot commands ----

    pub(crate) fn exec_save_game(&mut self, arg: &str) -> Result<ExecResult> {
        let slot = self.eval_save_slot(arg);
        self.save_globals(&slot)?;
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    pub(crate) fn exec_load_game(&mut self, arg: &str) -> Result<ExecResult> {
        let slot = self.eval_save_slot(arg);
        let ok = self.load_globals(&slot)?;
        self.set_result_int(ok as i64);
        Ok(ExecResult::None)
    }

    pub(crate) fn exec_save_data(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() == 1 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() || parts[0].trim().is_empty() {
            return Err(EraError("SAVEDATA needs slot".into()));
        }
        let slot = self.eval_slot_expr(&parts[0])?;
        if let Some(p) = parts.get(1) {
            if !p.trim().is_empty() {
                let v = self.eval_loose_expr(p)?;
                self.globals
                    .insert("SAVEDATA_TEXT".to_string(), Value::Str(v.as_str()));
            }
        }
        self.save_globals(&slot)?;
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    pub(crate) fn exec_load_data(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() == 1 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() || parts[0].trim().is_empty() {
            return Err(EraError("LOADDATA needs slot".into()));
        }
        let slot = self.eval_slot_expr(&parts[0])?;
        let ok = self.load_globals(&slot)?;
        self.set_result_int(ok as i64);
        Ok(ExecResult::None)
    }

    pub(crate) fn exec_delete_data(&mut self, arg: &str) -> Result<ExecResult> {
        let slot = self.eval_slot_expr(arg)?;
        self.delete_save(&slot)?;
        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    pub(crate) fn exec_check_data(&mut self, arg: &str) -> Result<ExecResult> {
        let slot = self.eval_slot_expr(arg)?;
        let ok = self.has_save(&slot)?;
        self.set_result_int(ok as i64);
        Ok(ExecResult::None)
    }

    // ---- var dat files ----

    fn collect_var_selection(
        &mut self,
        selectors: &[String],
    ) -> (HashMap<String, Value>, HashMap<String, ArrayVar>) {
        let mut globals = HashMap::new();
        let mut arrays = HashMap::new();
        if selectors.is_empty() {
            globals.extend(self.globals.clone());
            arrays.extend(self.g_arrays.clone());
            return (globals, arrays);
        }

        for raw in selectors {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let Ok(target) = self.parse_var_ref_runtime(raw) else {
                // Selector may be an expression naming the variable.
                if let Ok(v) = self.eval_loose_expr(raw) {
                    let name = v.as_str().trim().to_uppercase();
                    if name.is_empty() {
                        continue;
                    }
                    if self.has_array(&name) {
                        if let Some(arr) = self.with_array_mut(&name, |arr| arr.clone()) {
                            arrays.insert(name, arr);
                        }
                    } else {
                        let value = self.get_var(&name);
                        globals.insert(name, value);
                    }
                }
                continue;
            };

            let base = target.name.trim().to_uppercase();
            if base.is_empty() {
                continue;
            }
            if target.index.is_empty() {
                if self.has_array(&base) {
                    if let Some(arr) = self.with_array_mut(&base, |arr| arr.clone()) {
                        arrays.insert(base, arr);
                    }
                } else {
                    let value = self.get_var(&base);
                    globals.insert(base, value);
                }
                continue;
            }

            let Ok(idx) = self.eval_index_exprs(&target.index) else { continue };
            let Ok(v) = self.get_var_ref(&VarRef { name: base.clone(), index: target.index.clone() })
            else {
                continue;
            };
            let Some((is_string, is_dynamic, dims)) = self
                .with_array_mut(&base, |arr| (arr.is_string, arr.is_dynamic, arr.dims.clone()))
            else {
                continue;
            };
            let arr = arrays
                .entry(base)
                .or_insert_with(|| ArrayVar::new(is_string, is_dynamic, &dims));
            let _ = arr.set(&idx, v);
        }

        (globals, arrays)
    }

    fn parse_save_var_args(&mut self, arg: &str) -> Result<(String, String, Vec<String>)> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() == 1 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() || parts[0].trim().is_empty() {
            return Err(EraError("SAVEVAR requires filename".into()));
        }
        let name = self.eval_dat_filename(&parts[0])?;
        let mut save_mes = String::new();
        let mut start = 1;
        if let Some(p) = parts.get(1) {
            if let Ok(v) = self.eval_loose_expr(p) {
                save_mes = v.as_str();
                start = 2;
            }
        }
        let selectors = parts.get(start..).unwrap_or(&[]).to_vec();
        Ok((name, save_mes, selectors))
    }

    pub(crate) fn exec_save_var(&mut self, arg: &str) -> Result<ExecResult> {
        let (name, save_mes, selectors) = self.parse_save_var_args(arg)?;
        let (globals, arrays) = self.collect_var_selection(&selectors);
        let dat_path = self.var_dat_path(&name)?;
        let json_path = self.var_dat_json_path(&name)?;

        match self.dat_save_format.as_str() {
            "binary" => {
                self.write_var_binary_file(&dat_path, &save_mes, &globals, &arrays)?;
            }
            "both" => {
                self.write_var_binary_file(&dat_path, &save_mes, &globals, &arrays)?;
                let snap = build_var_snapshot(&save_mes, &globals, &arrays);
                write_json_file(&json_path, &snap)?;
            }
            _ => {
                let snap = build_var_snapshot(&save_mes, &globals, &arrays);
                write_json_file(&dat_path, &snap)?;
            }
        }

        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn apply_var_snapshot(&mut self, snap: &VarDataSnapshot) {
        for (k, sv) in &snap.globals {
            self.set_var(&k.to_uppercase(), save_value_to_value(sv));
        }
        for (name, saved) in &snap.arrays {
            self.g_arrays.insert(name.to_uppercase(), snapshot_to_array(saved));
        }
    }

    pub(crate) fn exec_load_var(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() == 1 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() || parts[0].trim().is_empty() {
            return Err(EraError("LOADVAR requires filename".into()));
        }
        let name = self.eval_dat_filename(&parts[0])?;
        let dat_path = self.var_dat_path(&name)?;
        let json_path = self.var_dat_json_path(&name)?;

        match fs::read(&dat_path) {
            Ok(data) => {
                self.load_var_data(&data)?;
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(EraError(format!("read {}: {}", dat_path.display(), e)));
            }
            _ => {}
        }

        match fs::read(&json_path) {
            Ok(data) => {
                let snap = read_var_snapshot_json(&data)?;
                self.apply_var_snapshot(&snap);
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(EraError(format!("read {}: {}", json_path.display(), e)));
            }
            _ => {}
        }

        self.set_result_int(0);
        Ok(ExecResult::None)
    }

    fn load_var_data(&mut self, data: &[u8]) -> Result<()> {
        if let Ok((unique, version, _mes, globals, arrays)) = self.read_var_binary_data(data) {
            // Saves from another program (or version) must not load.
            if unique != self.save_unique_code {
                return Err(EraError("SAVEVAR incompatible unique code".into()));
            }
            if version != self.save_version {
                return Err(EraError("SAVEVAR incompatible version".into()));
            }
            for (k, v) in globals {
                self.set_var(&k.to_uppercase(), v);
            }
            for (name, arr) in arrays {
                self.g_arrays.insert(name.to_uppercase(), arr);
            }
            return Ok(());
        }
        let snap = read_var_snapshot_json(data)?;
        self.apply_var_snapshot(&snap);
        Ok(())
    }

    // ---- chara dat files ----

    fn parse_save_chara_args(&mut self, arg: &str) -> Result<(String, String, Vec<i64>)> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() < 2 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() || parts[0].trim().is_empty() {
            return Err(EraError("SAVECHARA requires filename".into()));
        }
        let name = self.eval_dat_filename(&parts[0])?;
        let mut save_mes = String::new();
        let mut start = 1;
        if let Some(p) = parts.get(1) {
            if let Ok(v) = self.eval_loose_expr(p) {
                save_mes = v.as_str();
                start = 2;
            }
        }
        if start >= parts.len() {
            let indices = (0..self.characters.len() as i64).collect();
            return Ok((name, save_mes, indices));
        }
        let mut indices = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for raw in &parts[start..] {
            if raw.trim().is_empty() {
                continue;
            }
            let idx = self.eval_loose_expr(raw)?.as_int();
            if idx < 0 || idx as usize >= self.characters.len() {
                return Err(EraError(format!("SAVECHARA index out of range: {}", idx)));
            }
            if !seen.insert(idx) {
                return Err(EraError(format!("SAVECHARA duplicate index: {}", idx)));
            }
            indices.push(idx);
        }
        Ok((name, save_mes, indices))
    }

    pub(crate) fn exec_save_chara(&mut self, arg: &str) -> Result<ExecResult> {
        let (name, save_mes, indices) = self.parse_save_chara_args(arg)?;
        let selected: Vec<RuntimeCharacter> = indices
            .iter()
            .filter_map(|&idx| self.characters.get(idx as usize).cloned())
            .collect();

        let dat_path = self.chara_dat_path(&name)?;
        let json_path = self.chara_dat_json_path(&name)?;

        match self.dat_save_format.as_str() {
            "binary" => {
                self.write_chara_binary_file(&dat_path, &save_mes, &selected)?;
            }
            "both" => {
                self.write_chara_binary_file(&dat_path, &save_mes, &selected)?;
                let snap = build_chara_snapshot(&save_mes, &indices, &selected);
                write_json_file(&json_path, &snap)?;
            }
            _ => {
                let snap = build_chara_snapshot(&save_mes, &indices, &selected);
                write_json_file(&dat_path, &snap)?;
            }
        }

        self.set_result_int(1);
        Ok(ExecResult::None)
    }

    fn append_loaded_characters(&mut self, chars: Vec<RuntimeCharacter>) {
        for ch in chars {
            if ch.id >= self.next_char_id {
                self.next_char_id = ch.id + 1;
            }
            self.characters.push(ch);
        }
        self.refresh_character_globals();
    }

    pub(crate) fn exec_load_chara(&mut self, arg: &str) -> Result<ExecResult> {
        let mut parts = split_top_level(arg, ',');
        if parts.len() == 1 {
            parts = arg.split_whitespace().map(String::from).collect();
        }
        if parts.is_empty() || parts[0].trim().is_empty() {
            return Err(EraError("LOADCHARA requires filename".into()));
        }
        let name = self.eval_dat_filename(&parts[0])?;
        let dat_path = self.chara_dat_path(&name)?;
        let json_path = self.chara_dat_json_path(&name)?;

        match fs::read(&dat_path) {
            Ok(data) => {
                self.load_chara_data(&data)?;
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(EraError(format!("read {}: {}", dat_path.display(), e)));
            }
            _ => {}
        }

        match fs::read(&json_path) {
            Ok(data) => {
                let snap = read_chara_snapshot_json(&data)?;
                self.apply_chara_snapshot(&snap);
                self.set_result_int(1);
                return Ok(ExecResult::None);
            }
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(EraError(format!("read {}: {}", json_path.display(), e)));
            }
            _ => {}
        }

        self.set_result_int(0);
        Ok(ExecResult::None)
    }

    fn apply_chara_snapshot(&mut self, snap: &CharaDataSnapshot) {
        let chars: Vec<RuntimeCharacter> = snap
            .characters
            .iter()
            .map(|item| RuntimeCharacter {
                id: item.id,
                vars: item
                    .vars
                    .iter()
                    .map(|(k, v)| (k.clone(), save_value_to_value(v)))
                    .collect(),
            })
            .collect();
        self.append_loaded_characters(chars);
    }

    fn load_chara_data(&mut self, data: &[u8]) -> Result<()> {
        if let Ok((unique, version, _mes, chars)) = self.read_chara_binary_data(data) {
            if unique != self.save_unique_code {
                return Err(EraError("SAVECHARA incompatible unique code".into()));
            }
            if version != self.save_version {
                return Err(EraError("SAVECHARA incompatible version".into()));
            }
            self.append_loaded_characters(chars);
            return Ok(());
        }
        let snap = read_chara_snapshot_json(data)?;
        self.apply_chara_snapshot(&snap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_sanitization() {
        assert_eq!(sanitize_slot("save 01/../x"), "save_01____x");
        assert_eq!(sanitize_slot("plain-slot_9"), "plain-slot_9");
    }

    #[test]
    fn dat_name_validation() {
        assert!(invalid_dat_name(""));
        assert!(invalid_dat_name("a/b"));
        assert!(invalid_dat_name("a|b"));
        assert!(!invalid_dat_name("bin1"));
    }

    #[test]
    fn save_value_round_trip() {
        let v = Value::Str("x".into());
        assert_eq!(save_value_to_value(&value_to_save_value(&v)), v);
        let v = Value::Int(-3);
        assert_eq!(save_value_to_value(&value_to_save_value(&v)), v);
    }
}
