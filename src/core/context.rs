//! Variable scopes threaded through a pipeline invocation

use crate::http::{form, headers_to_map, ContentKind, HttpRequest};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Decode a body as JSON, wrapping undecodable bytes under `key`
pub fn decode_body(bytes: &[u8], key: &str) -> Value {
    if bytes.is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| {
        let mut wrapper = Map::new();
        wrapper.insert(
            key.to_string(),
            Value::String(String::from_utf8_lossy(bytes).to_string()),
        );
        Value::Object(wrapper)
    })
}

/// Claims of a bearer JWT, read without signature verification
pub fn decode_token_claims(header_value: &str) -> Option<Value> {
    let token = header_value
        .strip_prefix("Bearer ")
        .or_else(|| header_value.strip_prefix("bearer "))
        .unwrap_or(header_value)
        .trim();
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// The data bag of one step invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TemplateVars {
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub form_data: BTreeMap<String, String>,
    pub form_data_key_array: Vec<String>,
    pub body: Value,
    pub org_body: Value,
    pub token: Value,
    pub cookies: BTreeMap<String, String>,
    /// Current loop element, only set inside an iteration
    pub loop_var: Value,
    /// Whole loop array, only set on the owning step
    pub loop_vars: Value,
    /// Free-form bag; seeded with the fields of a JSON object body
    pub vars: Map<String, Value>,
}

impl TemplateVars {
    /// Populate a fresh scope from the live inbound request
    pub fn from_request(request: &HttpRequest, token_header: &str) -> Self {
        let mut vars = TemplateVars {
            headers: headers_to_map(&request.headers),
            params: request.query_map(),
            cookies: request.cookies(),
            ..Default::default()
        };

        match request.content_kind() {
            ContentKind::UrlEncoded => {
                vars.set_form_data(form::parse_urlencoded(&request.body));
                vars.body = Value::Object(Map::new());
            }
            ContentKind::Multipart => {
                let parts = request
                    .content_type()
                    .and_then(form::boundary_from_content_type)
                    .map(|boundary| form::parse_multipart(&request.body, &boundary))
                    .unwrap_or_default();
                vars.set_form_data(
                    parts
                        .iter()
                        .filter(|p| !p.is_file())
                        .map(|p| (p.name.clone(), p.text_value())),
                );
                vars.body = Value::Object(Map::new());
            }
            _ => vars.body = decode_body(&request.body, "msg"),
        }

        if let Value::Object(fields) = &vars.body {
            vars.vars = fields.clone();
        }
        vars.org_body = vars.body.clone();

        if let Some(claims) = request.header(token_header).and_then(decode_token_claims) {
            vars.token = claims;
        }

        vars
    }

    /// Replace the form data, keeping key order
    pub fn set_form_data(&mut self, pairs: impl IntoIterator<Item = (String, String)>) {
        self.form_data.clear();
        self.form_data_key_array.clear();
        for (key, value) in pairs {
            if !self.form_data.contains_key(&key) {
                self.form_data_key_array.push(key.clone());
            }
            self.form_data.insert(key, value);
        }
    }

    /// Clone for one loop iteration
    pub fn for_iteration(&self, element: Value) -> Self {
        let mut vars = self.clone();
        vars.loop_var = element;
        vars
    }
}

/// Cross-step request and response scopes, keyed by step key or route name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeMaps {
    pub req_vars: BTreeMap<String, TemplateVars>,
    pub res_vars: BTreeMap<String, TemplateVars>,
}

impl ScopeMaps {
    /// Cookies captured by every earlier step
    pub fn captured_cookies(&self) -> BTreeMap<String, String> {
        self.res_vars
            .values()
            .flat_map(|vars| vars.cookies.clone())
            .collect()
    }
}

/// The scope handed to the template evaluator
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FuncTemplateVars<'a> {
    pub vars: &'a TemplateVars,
    pub req_vars: &'a BTreeMap<String, TemplateVars>,
    pub res_vars: &'a BTreeMap<String, TemplateVars>,
}

impl<'a> FuncTemplateVars<'a> {
    pub fn new(vars: &'a TemplateVars, maps: &'a ScopeMaps) -> Self {
        Self {
            vars,
            req_vars: &maps.req_vars,
            res_vars: &maps.res_vars,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The shared, invocation-wide `ScopeMaps`.
///
/// Each step publishes only its own entries, from the task that owns it.
#[derive(Debug, Clone, Default)]
pub struct StepScopes {
    inner: Arc<RwLock<ScopeMaps>>,
}

impl StepScopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_maps(maps: ScopeMaps) -> Self {
        Self {
            inner: Arc::new(RwLock::new(maps)),
        }
    }

    pub fn snapshot(&self) -> ScopeMaps {
        self.inner.read().clone()
    }

    pub fn publish_request(&self, keys: &[&str], vars: &TemplateVars) {
        let mut maps = self.inner.write();
        for key in keys {
            maps.req_vars.insert(key.to_string(), vars.clone());
        }
    }

    pub fn publish_response(&self, keys: &[&str], vars: &TemplateVars) {
        let mut maps = self.inner.write();
        for key in keys {
            maps.res_vars.insert(key.to_string(), vars.clone());
        }
    }
}

/// Everything needed to resume a deferred step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    /// Scope of the deferred step's parent, if it had one
    pub parent: Option<TemplateVars>,
    pub maps: ScopeMaps,
}
