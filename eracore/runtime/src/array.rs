//! Sparse multi-dimensional arrays keyed by colon-joined decimal indices.

use std::collections::HashMap;

use era_common::{EraError, Result};

use crate::value::Value;

#[derive(Debug, Clone)]
pub struct ArrayVar {
    pub is_string: bool,
    pub is_dynamic: bool,
    pub dims: Vec<usize>,
    pub data: HashMap<String, Value>,
}

impl ArrayVar {
    pub fn new(is_string: bool, is_dynamic: bool, dims: &[usize]) -> Self {
        let dims = if dims.is_empty() { vec![1] } else { dims.to_vec() };
        Self { is_string, is_dynamic, dims, data: HashMap::new() }
    }

    pub fn default_value(&self) -> Value {
        if self.is_string {
            Value::Str(String::new())
        } else {
            Value::Int(0)
        }
    }

    /// Canonical storage key; dynamic arrays grow any dimension touched by
    /// the index, non-dynamic arrays reject out-of-range access.
    pub fn key(&mut self, index: &[i64]) -> Result<String> {
        if index.is_empty() {
            return Ok("0".to_string());
        }
        if !self.is_dynamic && index.len() > self.dims.len() {
            return Err(EraError(format!(
                "too many indices: got {}, max {}",
                index.len(),
                self.dims.len()
            )));
        }
        let mut parts = Vec::with_capacity(index.len());
        for (i, &v) in index.iter().enumerate() {
            if v < 0 {
                return Err(EraError(format!("index {} out of range: {}", i, v)));
            }
            if self.is_dynamic {
                if i >= self.dims.len() {
                    self.dims.push(v as usize + 1);
                }
                if v as usize >= self.dims[i] {
                    self.dims[i] = v as usize + 1;
                }
            } else if i < self.dims.len() && v as usize >= self.dims[i] {
                return Err(EraError(format!(
                    "index {} out of range: {} >= {}",
                    i, v, self.dims[i]
                )));
            }
            parts.push(v.to_string());
        }
        Ok(parts.join(":"))
    }

    pub fn get(&mut self, index: &[i64]) -> Result<Value> {
        let k = self.key(index)?;
        Ok(self.data.get(&k).cloned().unwrap_or_else(|| self.default_value()))
    }

    /// Values are coerced to the array's element kind on store.
    pub fn set(&mut self, index: &[i64], v: Value) -> Result<()> {
        let k = self.key(index)?;
        let stored = if self.is_string {
            Value::Str(v.as_str())
        } else {
            Value::Int(v.as_int())
        };
        self.data.insert(k, stored);
        Ok(())
    }

    pub fn has_explicit_value(&mut self, index: &[i64]) -> bool {
        match self.key(index) {
            Ok(k) => self.data.contains_key(&k),
            Err(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn clear_by_prefix(&mut self, prefix: &[i64]) {
        if prefix.is_empty() {
            self.data.clear();
            return;
        }
        self.data.retain(|k, _| !key_has_prefix(k, prefix));
    }
}

pub fn key_has_prefix(key: &str, prefix: &[i64]) -> bool {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() < prefix.len() {
        return false;
    }
    prefix
        .iter()
        .zip(parts.iter())
        .all(|(want, got)| got.parse::<i64>().map_or(false, |g| g == *want))
}

pub fn parse_index_key(key: &str) -> Option<Vec<i64>> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    key.split(':')
        .map(|p| p.trim().parse::<i64>().ok())
        .collect()
}

/// Smallest dims that fit the given index.
pub fn dims_for_index(index: &[i64]) -> Vec<usize> {
    index.iter().map(|&v| ((v + 1).max(1)) as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips_with_coercion() {
        let mut a = ArrayVar::new(false, false, &[4]);
        a.set(&[2], Value::Str("7".into())).unwrap();
        assert_eq!(a.get(&[2]).unwrap(), Value::Int(7));
        assert_eq!(a.get(&[0]).unwrap(), Value::Int(0));
    }

    #[test]
    fn static_array_rejects_out_of_range() {
        let mut a = ArrayVar::new(false, false, &[3]);
        assert!(a.set(&[3], Value::Int(1)).is_err());
        assert!(a.get(&[-1]).is_err());
    }

    #[test]
    fn dynamic_array_grows() {
        let mut a = ArrayVar::new(false, true, &[1]);
        a.set(&[5, 2], Value::Int(9)).unwrap();
        assert_eq!(a.dims, vec![6, 3]);
        assert_eq!(a.get(&[5, 2]).unwrap(), Value::Int(9));
    }

    #[test]
    fn prefix_clear_only_touches_matching_rows() {
        let mut a = ArrayVar::new(false, true, &[2, 2]);
        a.set(&[0, 0], Value::Int(1)).unwrap();
        a.set(&[1, 0], Value::Int(2)).unwrap();
        a.clear_by_prefix(&[1]);
        assert_eq!(a.get(&[0, 0]).unwrap(), Value::Int(1));
        assert_eq!(a.get(&[1, 0]).unwrap(), Value::Int(0));
    }

    #[test]
    fn key_canonicalization() {
        let mut a = ArrayVar::new(false, true, &[1]);
        assert_eq!(a.key(&[]).unwrap(), "0");
        assert_eq!(a.key(&[1, 2, 3]).unwrap(), "1:2:3");
        assert_eq!(parse_index_key("1:2:3").unwrap(), vec![1, 2, 3]);
        assert!(parse_index_key("a:b").is_none());
    }
}
