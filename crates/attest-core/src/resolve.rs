//! Path-expression resolver used by the content, embedding, judge and
//! constraint evaluators to pull values out of a trace.

use serde_json::Value;

use crate::trace::Trace;

/// A resolved target: the raw JSON value plus its best-effort string
/// projection (decoded content for JSON strings, literal JSON otherwise).
#[derive(Debug, Clone)]
pub struct Resolved {
    pub value: Value,
    pub text: String,
}

fn project(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

struct StepFilter<'a> {
    key: &'a str,
    needle: &'a str,
    rest: &'a str,
}

fn parse_step_filter(path: &str) -> Option<StepFilter<'_>> {
    let inner = path.strip_prefix("steps[?")?;
    let (key, inner) = if let Some(r) = inner.strip_prefix("name=='") {
        ("name", r)
    } else if let Some(r) = inner.strip_prefix("type=='") {
        ("type", r)
    } else {
        return None;
    };
    let end = inner.find("']")?;
    Some(StepFilter {
        key,
        needle: &inner[..end],
        rest: &inner[end + 2..],
    })
}

fn navigate<'a>(root: &'a Value, dotted: &str, path: &str, ctx: &str) -> Result<&'a Value, String> {
    let mut current = root;
    let mut where_am_i = ctx.to_string();
    for field in dotted.split('.') {
        match current.get(field) {
            Some(next) => {
                current = next;
                where_am_i = format!("{}.{}", where_am_i, field);
            }
            None => {
                return Err(format!(
                    "path '{}': key '{}' not found in '{}'",
                    path, field, where_am_i
                ))
            }
        }
    }
    Ok(current)
}

/// Resolves a value-producing path expression against a trace. The count
/// forms (`steps.length`, `steps[?type=='t'].length`) are reserved for
/// constraint assertions and are rejected here.
pub fn resolve(trace: &Trace, path: &str) -> Result<Resolved, String> {
    let path = path.trim();
    if path.is_empty() {
        return Err("path is empty".to_string());
    }

    if path == "output" {
        return Ok(Resolved {
            value: trace.output.clone(),
            text: project(&trace.output),
        });
    }
    if let Some(rest) = path.strip_prefix("output.") {
        let v = navigate(&trace.output, rest, path, "output")?;
        return Ok(Resolved {
            value: v.clone(),
            text: project(v),
        });
    }

    if path == "input" || path.starts_with("input.") {
        let Some(input) = &trace.input else {
            return Err(format!("path '{}': trace has no input", path));
        };
        let v = match path.strip_prefix("input.") {
            Some(rest) => navigate(input, rest, path, "input")?,
            None => input,
        };
        return Ok(Resolved {
            value: v.clone(),
            text: project(v),
        });
    }

    if let Some(rest) = path.strip_prefix("metadata.") {
        let meta = trace
            .metadata
            .as_ref()
            .ok_or_else(|| format!("path '{}': trace has no metadata", path))?;
        let root = serde_json::to_value(meta).unwrap_or(Value::Null);
        let v = navigate(&root, rest, path, "metadata")?;
        return Ok(Resolved {
            value: v.clone(),
            text: project(v),
        });
    }

    if let Some(filter) = parse_step_filter(path) {
        if filter.rest == ".length" || filter.key == "type" {
            return Err(format!(
                "path '{}': count expressions are only valid in constraint assertions",
                path
            ));
        }
        let step = trace
            .steps
            .iter()
            .find(|s| s.common().name == filter.needle)
            .ok_or_else(|| format!("path '{}': no step named '{}'", path, filter.needle))?;

        let (root, root_name, rest) = if let Some(r) = filter.rest.strip_prefix(".args") {
            (step.common().args.as_ref(), "args", r)
        } else if let Some(r) = filter.rest.strip_prefix(".result") {
            (step.common().result.as_ref(), "result", r)
        } else {
            return Err(format!(
                "path '{}': step selector must be followed by .args or .result",
                path
            ));
        };
        let root = root.ok_or_else(|| {
            format!(
                "path '{}': step '{}' has no {}",
                path, filter.needle, root_name
            )
        })?;
        let ctx = format!("steps[?name=='{}'].{}", filter.needle, root_name);
        let v = match rest.strip_prefix('.') {
            Some(fields) => navigate(root, fields, path, &ctx)?,
            None if rest.is_empty() => root,
            None => return Err(format!("path '{}': malformed step selector suffix", path)),
        };
        return Ok(Resolved {
            value: v.clone(),
            text: project(v),
        });
    }

    if path == "steps.length" {
        return Err(format!(
            "path '{}': count expressions are only valid in constraint assertions",
            path
        ));
    }

    Err(format!("path '{}': unrecognized path expression", path))
}

/// Resolves a constraint field to a numeric scalar. Supports the count
/// forms on top of the regular grammar.
pub fn resolve_numeric(trace: &Trace, path: &str) -> Result<f64, String> {
    let path = path.trim();

    if path == "steps.length" {
        return Ok(trace.steps.len() as f64);
    }
    if let Some(filter) = parse_step_filter(path) {
        if filter.key == "type" && filter.rest == ".length" {
            let n = trace.steps.iter().filter(|s| s.kind() == filter.needle).count();
            return Ok(n as f64);
        }
    }

    let resolved = resolve(trace, path)?;
    match &resolved.value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("path '{}': number out of range", path)),
        Value::String(s) => s.parse::<f64>().map_err(|_| {
            format!(
                "path '{}': resolved to non-numeric string \"{}\"",
                path, s
            )
        }),
        other => Err(format!(
            "path '{}': resolved to non-numeric value {}",
            path,
            project(other)
        )),
    }
}
