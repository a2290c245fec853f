//! Handlebars-backed template evaluator
//!
//! Accepts Go-style dotted paths (`{{.Vars.Body.id}}`, `{{eq .Vars.Vars.flag true}}`)
//! by dropping the leading dot before handing the template to handlebars.
//! A template that is a single path expression is resolved directly against
//! the scope so that JSON output keeps its type and a missing value can be
//! reported as "no value".

use super::{OutputKind, TemplateError, TemplateEvaluator};
use bytes::Bytes;
use handlebars::{handlebars_helper, Handlebars};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

handlebars_helper!(to_json: |v: Json| v.to_string());

fn mustache_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("static regex"))
}

fn leading_dot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|[\s(~#])\.([A-Za-z_])").expect("static regex"))
}

fn single_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\{\{\s*\.?([A-Za-z_][\w-]*(?:\.[\w-]+)*)\s*\}\}$").expect("static regex")
    })
}

/// Rewrite Go-style paths into handlebars paths
pub fn normalize(template: &str) -> String {
    mustache_re()
        .replace_all(template, |caps: &regex::Captures| {
            let inner = caps[1].trim();
            if inner == "." {
                return "{{this}}".to_string();
            }
            format!("{{{{{}}}}}", leading_dot_re().replace_all(&caps[1], "${1}${2}"))
        })
        .into_owned()
}

/// Walk a dotted path through objects and arrays
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn value_bytes(value: &Value, kind: OutputKind) -> Bytes {
    match (kind, value) {
        (OutputKind::String, Value::String(s)) => Bytes::copy_from_slice(s.as_bytes()),
        _ => Bytes::from(value.to_string()),
    }
}

/// Templates are registered once under a content hash; rendering only
/// takes the read lock.
pub struct HandlebarsEvaluator {
    handlebars: RwLock<Handlebars<'static>>,
}

impl Default for HandlebarsEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlebarsEvaluator {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("json", Box::new(to_json));
        Self {
            handlebars: RwLock::new(handlebars),
        }
    }

    fn render(&self, name: &str, template: &str, scope: &Value) -> Result<String, TemplateError> {
        let template = normalize(template);
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        template.hash(&mut hasher);
        let id = format!("tpl_{:x}", hasher.finish());

        if !self.handlebars.read().has_template(&id) {
            let mut handlebars = self.handlebars.write();
            if !handlebars.has_template(&id) {
                handlebars
                    .register_template_string(&id, &template)
                    .map_err(|e| TemplateError::Compile {
                        name: name.to_string(),
                        message: e.to_string(),
                    })?;
            }
        }

        self.handlebars
            .read()
            .render(&id, scope)
            .map_err(|e| TemplateError::Render {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}

impl TemplateEvaluator for HandlebarsEvaluator {
    fn evaluate(
        &self,
        name: &str,
        template: &str,
        scope: &Value,
        kind: OutputKind,
    ) -> Result<Bytes, TemplateError> {
        if let Some(caps) = single_path_re().captures(template.trim()) {
            return match lookup(scope, &caps[1]) {
                None | Some(Value::Null) => Err(TemplateError::NoValue {
                    name: name.to_string(),
                }),
                Some(value) => Ok(value_bytes(value, kind)),
            };
        }

        let rendered = self.render(name, template, scope)?;
        if kind == OutputKind::Json && serde_json::from_str::<Value>(&rendered).is_err() {
            return Err(TemplateError::Render {
                name: name.to_string(),
                message: format!("output is not JSON: {}", rendered),
            });
        }
        Ok(Bytes::from(rendered))
    }
}
