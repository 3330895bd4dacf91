//! `#DIM` / `#DIMS` declaration parsing.

use era_ast::{DeclScope, Expr, VarDecl};

use crate::expr::{parse_expr, split_top_level, unquote_string};

pub struct DimDecl {
    pub decl: VarDecl,
    // Explicit initializer values, one defines entry `NAME:i` each.
    pub inits: Vec<Expr>,
}

pub fn parse_dim_decl(raw: &str, is_string: bool, default_scope: DeclScope) -> Option<DimDecl> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (head_raw, init_raw) = split_initializer(raw);
    let parts = split_top_level(&head_raw, ',');
    let head_fields: Vec<&str> = parts.first()?.split_whitespace().collect();
    if head_fields.is_empty() {
        return None;
    }

    let mut scope = default_scope;
    let mut is_ref = false;
    let mut is_dynamic = false;
    for f in &head_fields[..head_fields.len() - 1] {
        match f.to_uppercase().as_str() {
            "GLOBAL" | "SAVEDATA" | "CHARADATA" => scope = DeclScope::Global,
            "LOCAL" => scope = DeclScope::Local,
            "DYNAMIC" => is_dynamic = true,
            "REF" => is_ref = true,
            "CONST" => {} // accepted, no enforced effect
            _ => {}
        }
    }

    let name = head_fields.last()?.trim().to_uppercase();
    if name.is_empty() {
        return None;
    }

    let mut dims = Vec::with_capacity(parts.len().saturating_sub(1));
    for p in &parts[1..] {
        if p.is_empty() {
            continue;
        }
        let n = p.parse::<i64>().unwrap_or(1).max(1) as usize;
        dims.push(n);
    }
    if dims.is_empty() {
        dims.push(1);
    }

    let mut inits = Vec::new();
    if let Some(init_raw) = init_raw {
        for piece in split_top_level(&init_raw, ',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            inits.push(parse_init_value(piece, is_string));
        }
    }

    Some(DimDecl {
        decl: VarDecl { name, is_string, dims, scope, is_ref, is_dynamic },
        inits,
    })
}

fn parse_init_value(piece: &str, is_string: bool) -> Expr {
    if let Ok(n) = piece.parse::<i64>() {
        return Expr::Int(n);
    }
    if let Some(s) = unquote_string(piece) {
        return Expr::Str(s);
    }
    match parse_expr(piece) {
        Ok(e) => e,
        Err(_) if is_string => Expr::Str(piece.to_string()),
        Err(_) => Expr::Int(0),
    }
}

// `NAME, 3 = 1, 2, 3` — the initializer list sits after a top-level `=`.
fn split_initializer(raw: &str) -> (String, Option<String>) {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escape = false;
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
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '=' if depth == 0 => {
                return (
                    raw[..i].trim().to_string(),
                    Some(raw[i + r.len_utf8()..].trim().to_string()),
                );
            }
            _ => {}
        }
    }
    (raw.trim().to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modifiers_and_dims() {
        let d = parse_dim_decl(" DYNAMIC REF FLAG , 10, 20", false, DeclScope::Global).unwrap();
        assert_eq!(d.decl.name, "FLAG");
        assert!(d.decl.is_dynamic);
        assert!(d.decl.is_ref);
        assert_eq!(d.decl.dims, vec![10, 20]);
        assert!(d.inits.is_empty());
    }

    #[test]
    fn local_scope_modifier() {
        let d = parse_dim_decl("LOCAL X", false, DeclScope::Global).unwrap();
        assert_eq!(d.decl.scope, DeclScope::Local);
        assert_eq!(d.decl.dims, vec![1]);
    }

    #[test]
    fn initializers_become_values() {
        let d = parse_dim_decl(r#"NAMES, 3 = "a", "b", 1+2"#, true, DeclScope::Global).unwrap();
        assert_eq!(d.decl.dims, vec![3]);
        assert_eq!(d.inits.len(), 3);
        assert!(matches!(d.inits[0], Expr::Str(_)));
        assert!(matches!(d.inits[2], Expr::Binary { .. }));
    }

    #[test]
    fn dims_clamp_to_one() {
        let d = parse_dim_decl("X, 0", false, DeclScope::Global).unwrap();
        assert_eq!(d.decl.dims, vec![1]);
    }
}
