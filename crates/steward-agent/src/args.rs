use std::{borrow::Cow, collections::BTreeMap};

use serde_json::Value;

/// Placeholder values keyed by name; `#name#` inside a string is replaced by the value.
pub type Args = BTreeMap<String, String>;

const MARKER: char = '#';
const ARGS_KEY: &str = "args";

/// Reads an `args` object. Numbers and booleans are accepted and stringified.
pub fn args_from_value(value: &Value) -> Option<Args> {
    let obj = value.as_object()?;
    let mut out = Args::new();
    for (k, v) in obj {
        let s = match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        out.insert(k.clone(), s);
    }
    Some(out)
}

/// Substitutes every `#key#` token whose key is present in `args`.
///
/// Single left-to-right pass: replacement text is never rescanned, and a token with an
/// unknown key is copied verbatim.
pub fn resolve(value: &str, args: &Args) -> String {
    if args.is_empty() || !value.contains(MARKER) {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(open) = rest.find(MARKER) {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find(MARKER) else {
            out.push(MARKER);
            rest = after;
            break;
        };
        match args.get(&after[..close]) {
            Some(v) => {
                out.push_str(v);
                rest = &after[close + 1..];
            }
            None => {
                // The closing marker may open the next token.
                out.push(MARKER);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolves placeholders throughout a parsed document.
///
/// An object carrying an `args` key opens a scope: every string below it (through nested
/// objects and arrays) is resolved against those args, with inner scopes shadowing outer
/// ones. The `args` objects themselves and all object keys are left untouched.
pub fn resolve_document(doc: &mut Value) {
    resolve_in(doc, &Args::new());
}

fn resolve_in(value: &mut Value, inherited: &Args) {
    match value {
        Value::String(s) => {
            if !inherited.is_empty() {
                *s = resolve(s, inherited);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_in(item, inherited);
            }
        }
        Value::Object(map) => {
            let scope: Cow<'_, Args> = match map.get(ARGS_KEY).and_then(args_from_value) {
                Some(local) if !local.is_empty() => {
                    let mut merged = inherited.clone();
                    merged.extend(local);
                    Cow::Owned(merged)
                }
                _ => Cow::Borrowed(inherited),
            };
            for (key, v) in map.iter_mut() {
                if key == ARGS_KEY {
                    continue;
                }
                resolve_in(v, &scope);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, &str)]) -> Args {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_known_tokens() {
        let a = args(&[("mem", "2048"), ("jar", "server.jar")]);
        assert_eq!(
            resolve("java -Xmx#mem#M -jar #jar#", &a),
            "java -Xmx2048M -jar server.jar"
        );
    }

    #[test]
    fn leaves_unknown_tokens_verbatim() {
        let a = args(&[("port", "25565")]);
        assert_eq!(resolve("#nope# on #port#", &a), "#nope# on 25565");
        assert_eq!(resolve("say #1 #port#", &a), "say #1 25565");
        assert_eq!(resolve("dangling #", &a), "dangling #");
    }

    #[test]
    fn replacement_text_is_not_rescanned() {
        let a = args(&[("a", "#b#"), ("b", "x")]);
        assert_eq!(resolve("#a#", &a), "#b#");
    }

    #[test]
    fn resolves_nested_objects_and_arrays_under_args_scope() {
        let mut doc = json!({
            "args": {"mem": "1024", "port": 25565},
            "commands": {
                "start": [
                    {"shell": "java -Xmx#mem#M"},
                    {"shell": ["echo", "#port#"]},
                    {"console": 7}
                ]
            }
        });
        resolve_document(&mut doc);
        assert_eq!(doc["commands"]["start"][0]["shell"], "java -Xmx1024M");
        assert_eq!(doc["commands"]["start"][1]["shell"][1], "25565");
        assert_eq!(doc["commands"]["start"][2]["console"], 7);
        assert_eq!(doc["args"]["mem"], "1024");
    }

    #[test]
    fn inner_args_shadow_outer_args() {
        let mut doc = json!({
            "args": {"who": "outer"},
            "meta": {"args": {"who": "inner"}, "name": "#who#"},
            "desc": "#who#"
        });
        resolve_document(&mut doc);
        assert_eq!(doc["meta"]["name"], "inner");
        assert_eq!(doc["desc"], "outer");
    }

    #[test]
    fn strings_outside_any_scope_are_untouched() {
        let mut doc = json!({"meta": {"name": "#who#"}, "other": {"args": {"who": "x"}}});
        resolve_document(&mut doc);
        assert_eq!(doc["meta"]["name"], "#who#");
    }

    #[test]
    fn resolving_twice_is_a_no_op() {
        let mut doc = json!({
            "args": {"mem": "512", "name": "lobby"},
            "commands": {"start": [{"shell": "run #name# #mem# #missing#"}]}
        });
        resolve_document(&mut doc);
        let once = doc.clone();
        resolve_document(&mut doc);
        assert_eq!(doc, once);
    }
}
