//! Outbound request building and backend response reshaping

use crate::backend::ResolvedTarget;
use crate::core::config::{EngineSettings, KeyValue};
use crate::core::context::{decode_body, FuncTemplateVars, ScopeMaps, TemplateVars};
use crate::core::error::ExecutionError;
use crate::core::step::Step;
use crate::http::form::{self, FormPart};
use crate::http::{set_header, ContentKind, HttpRequest, HttpResponse};
use crate::template::{is_template, OutputKind, TemplateError, TemplateErrors, TemplateEvaluator};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

pub struct Transformer<'a> {
    evaluator: &'a dyn TemplateEvaluator,
    settings: &'a EngineSettings,
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl<'a> Transformer<'a> {
    pub fn new(evaluator: &'a dyn TemplateEvaluator, settings: &'a EngineSettings) -> Self {
        Self {
            evaluator,
            settings,
        }
    }

    pub fn render(
        &self,
        name: &str,
        template: &str,
        vars: &TemplateVars,
        maps: &ScopeMaps,
        kind: OutputKind,
    ) -> Result<Bytes, TemplateError> {
        let scope = FuncTemplateVars::new(vars, maps).to_value();
        self.evaluator.evaluate(name, template, &scope, kind)
    }

    /// Render a value that may or may not be a template
    fn value_of(
        &self,
        errors: &mut TemplateErrors,
        name: &str,
        entry: &KeyValue,
        vars: &TemplateVars,
        maps: &ScopeMaps,
    ) -> Option<String> {
        if entry.is_template || is_template(&entry.value) {
            errors
                .take(self.render(name, &entry.value, vars, maps, OutputKind::String))
                .map(|b| text(&b))
        } else {
            Some(entry.value.clone())
        }
    }

    /// Render a step's condition; "no value" renders as empty
    pub fn render_condition(
        &self,
        step: &Step,
        expression: &str,
        vars: &TemplateVars,
        maps: &ScopeMaps,
    ) -> Result<String, ExecutionError> {
        let mut errors = TemplateErrors::new();
        let rendered = errors.take(self.render(
            &format!("{}.condition", step.key),
            expression,
            vars,
            maps,
            OutputKind::String,
        ));
        errors.finish(true)?;
        Ok(rendered.map(|b| text(&b)).unwrap_or_default())
    }

    /// Render an optional message template into a JSON-ish body
    pub fn render_message(
        &self,
        name: &str,
        template: &str,
        vars: &TemplateVars,
        maps: &ScopeMaps,
    ) -> Result<Option<Bytes>, ExecutionError> {
        let mut errors = TemplateErrors::new();
        let rendered = errors.take(self.render(name, template, vars, maps, OutputKind::String));
        errors.finish(self.settings.supress_template_errors)?;
        Ok(rendered)
    }

    /// Scope for a step: from the live request at the entry step, else a
    /// deep copy of the parent's
    pub fn load_scope(&self, request: &HttpRequest, parent: Option<&TemplateVars>) -> TemplateVars {
        match parent {
            Some(parent) => parent.clone(),
            None => TemplateVars::from_request(request, &self.settings.token_header),
        }
    }

    /// Evaluate the loop variable; it must render a JSON array
    pub fn loop_values(
        &self,
        step: &Step,
        vars: &TemplateVars,
        maps: &ScopeMaps,
    ) -> Result<Option<Vec<Value>>, ExecutionError> {
        let Some(spec) = &step.loop_spec else {
            return Ok(None);
        };

        let name = format!("{}.loop_variable", step.key);
        let rendered = match self.render(&name, &spec.variable, vars, maps, OutputKind::String) {
            Ok(bytes) => text(&bytes),
            Err(e) if e.is_no_value() => {
                return Err(ExecutionError::LoopNotArray(format!("{}: no value", step.key)))
            }
            Err(e) => return Err(ExecutionError::Template(e.to_string())),
        };

        match serde_json::from_str::<Value>(&rendered) {
            Ok(Value::Array(items)) => Ok(Some(items)),
            _ => Err(ExecutionError::LoopNotArray(format!("{}: {}", step.key, rendered))),
        }
    }

    /// Build the outbound request for one execution unit.
    ///
    /// Mutates `vars` to reflect what is sent and `target` for templated
    /// host or path. Nested-pipeline steps pass no target; their host and
    /// path rewrites are ignored.
    pub fn build_request(
        &self,
        step: &Step,
        inbound: &HttpRequest,
        vars: &mut TemplateVars,
        maps: &ScopeMaps,
        mut target: Option<&mut ResolvedTarget>,
    ) -> Result<HttpRequest, ExecutionError> {
        let shaping = &step.request;
        let mut errors = TemplateErrors::new();
        let mut request = inbound.clone();

        // Literal headers first
        for entry in shaping.headers.iter().filter(|h| !h.is_template) {
            if set_header(&mut request.headers, &entry.key, &entry.value) {
                vars.headers
                    .insert(entry.key.to_ascii_lowercase(), entry.value.clone());
            }
        }

        // Form bodies
        let source_kind = inbound.content_kind();
        let target_kind = ContentKind::from_content_type(shaping.content_type.as_deref());
        let mut body_written = false;
        if shaping.content_type.is_some() && target_kind != source_kind && target_kind.is_form() {
            let pairs = self.form_pairs(step, &mut errors, vars, maps, Vec::new());
            self.write_form(step, &mut errors, &mut request, vars, maps, target_kind, pairs, Vec::new());
            body_written = true;
        } else if source_kind.is_form() {
            let (existing, files) = match source_kind {
                ContentKind::Multipart => {
                    let parts = inbound
                        .content_type()
                        .and_then(form::boundary_from_content_type)
                        .map(|boundary| form::parse_multipart(&inbound.body, &boundary))
                        .unwrap_or_default();
                    let (files, fields): (Vec<FormPart>, Vec<FormPart>) =
                        parts.into_iter().partition(FormPart::is_file);
                    let fields: Vec<(String, String)> = fields
                        .iter()
                        .map(|p| (p.name.clone(), p.text_value()))
                        .collect();
                    (fields, files)
                }
                _ => (form::parse_urlencoded(&inbound.body), Vec::new()),
            };
            let pairs = self.form_pairs(step, &mut errors, vars, maps, existing);
            self.write_form(step, &mut errors, &mut request, vars, maps, source_kind, pairs, files);
            body_written = true;
        }

        // Query parameters
        let mut params = request.query_map();
        for entry in &shaping.params {
            let name = format!("{}.query_params.{}", step.key, entry.key);
            if let Some(value) = self.value_of(&mut errors, &name, entry, vars, maps) {
                params.insert(entry.key.clone(), value);
            }
        }
        for key in &shaping.remove_params {
            params.remove(key);
        }
        request.set_query(&params);
        vars.params = params;

        // Body
        if let Some(template) = &shaping.body_template {
            let name = format!("{}.request_transformation", step.key);
            if let Some(body) = errors.take(self.render(&name, template, vars, maps, OutputKind::String)) {
                vars.body = decode_body(&body, "msg");
                request.set_body(body);
            }
        } else if !body_written && source_kind == ContentKind::Json {
            request.set_body(vars.body.to_string());
        }

        // Host, path and method
        if let Some(host) = &shaping.target_host {
            let name = format!("{}.target_host", step.key);
            let host = if is_template(host) {
                errors
                    .take(self.render(&name, host, vars, maps, OutputKind::String))
                    .map(|b| text(&b))
            } else {
                Some(host.clone())
            };
            if let (Some(host), Some(target)) = (host, target.as_deref_mut()) {
                apply_host(target, host.trim());
            }
        }
        if let Some(path) = &shaping.target_path {
            let name = format!("{}.target_path", step.key);
            let path = if is_template(path) {
                errors
                    .take(self.render(&name, path, vars, maps, OutputKind::String))
                    .map(|b| text(&b))
            } else {
                Some(path.clone())
            };
            if let (Some(path), Some(target)) = (path, target.as_deref_mut()) {
                target.path = path.trim().to_string();
            }
        }
        if let Some(method) = shaping.method.as_deref().filter(|m| !m.is_empty()) {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
                ExecutionError::Validation(format!("{}: invalid method '{}'", step.key, method))
            })?;
            request.method = method.clone();
            if let Some(target) = target.as_deref_mut() {
                target.method = Some(method);
            }
        }

        // Templated headers last, then removals
        for entry in shaping.headers.iter().filter(|h| h.is_template) {
            let name = format!("{}.request_headers.{}", step.key, entry.key);
            if let Some(value) = self.value_of(&mut errors, &name, entry, vars, maps) {
                if set_header(&mut request.headers, &entry.key, &value) {
                    vars.headers.insert(entry.key.to_ascii_lowercase(), value);
                }
            }
        }
        for name in &shaping.remove_headers {
            request.headers.remove(name.as_str());
            vars.headers.remove(&name.to_ascii_lowercase());
        }

        // Cookies captured from earlier steps
        let captured = maps.captured_cookies();
        if !captured.is_empty() {
            let mut cookies = request.cookies();
            cookies.extend(captured);
            let header = cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = HeaderValue::from_str(&header) {
                request.headers.insert(COOKIE, value);
            }
            vars.cookies.extend(cookies);
        }

        errors.finish(self.settings.supress_template_errors)?;
        debug!("{}: built {} {}", step.key, request.method, request.url);
        Ok(request)
    }

    /// Existing form fields overlaid with the step's form data, minus removals
    fn form_pairs(
        &self,
        step: &Step,
        errors: &mut TemplateErrors,
        vars: &TemplateVars,
        maps: &ScopeMaps,
        mut pairs: Vec<(String, String)>,
    ) -> Vec<(String, String)> {
        for entry in &step.request.form_data {
            let name = format!("{}.form_data.{}", step.key, entry.key);
            if let Some(value) = self.value_of(errors, &name, entry, vars, maps) {
                match pairs.iter_mut().find(|(k, _)| *k == entry.key) {
                    Some(pair) => pair.1 = value,
                    None => pairs.push((entry.key.clone(), value)),
                }
            }
        }
        pairs.retain(|(k, _)| !step.request.remove_form_data.contains(k));
        pairs
    }

    #[allow(clippy::too_many_arguments)]
    fn write_form(
        &self,
        step: &Step,
        errors: &mut TemplateErrors,
        request: &mut HttpRequest,
        vars: &mut TemplateVars,
        maps: &ScopeMaps,
        kind: ContentKind,
        pairs: Vec<(String, String)>,
        mut files: Vec<FormPart>,
    ) {
        vars.set_form_data(pairs.clone());

        let content_type = match kind {
            ContentKind::Multipart => {
                for entry in &step.request.file_data {
                    let name = format!("{}.file_data.{}", step.key, entry.key);
                    if let Some(data) = self.value_of(errors, &name, entry, vars, maps) {
                        files.retain(|f| f.name != entry.key);
                        files.push(FormPart::file(&entry.key, &entry.key, data.into_bytes()));
                    }
                }
                files.retain(|f| !step.request.remove_form_data.contains(&f.name));

                let mut parts: Vec<FormPart> =
                    pairs.iter().map(|(k, v)| FormPart::text(k, v)).collect();
                parts.extend(files);
                let (boundary, body) = form::build_multipart(&parts);
                request.set_body(body);
                format!("multipart/form-data; boundary={}", boundary)
            }
            _ => {
                let body = form::encode_urlencoded(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                request.set_body(body);
                "application/x-www-form-urlencoded".to_string()
            }
        };

        if let Ok(value) = HeaderValue::from_str(&content_type) {
            request.headers.insert(CONTENT_TYPE, value);
        }
        vars.headers.insert(CONTENT_TYPE.as_str().to_string(), content_type);
    }

    /// Reshape a backend response and fold it into `vars`
    pub fn transform_response(
        &self,
        step: &Step,
        mut response: HttpResponse,
        vars: &mut TemplateVars,
        maps: &ScopeMaps,
    ) -> Result<HttpResponse, ExecutionError> {
        let shaping = &step.response;
        let mut errors = TemplateErrors::new();

        vars.headers.extend(crate::http::headers_to_map(&response.headers));
        vars.body = decode_body(&response.body, "data");
        vars.org_body = vars.body.clone();

        if let Some(template) = &shaping.body_template {
            let name = format!("{}.response_transformation", step.key);
            if let Some(body) = errors.take(self.render(&name, template, vars, maps, OutputKind::String)) {
                vars.body = decode_body(&body, "data");
                response.set_body(body);
            }
        } else if response.is_json() {
            response.set_body(vars.body.to_string());
        }

        for entry in &shaping.headers {
            let name = format!("{}.response_headers.{}", step.key, entry.key);
            if let Some(value) = self.value_of(&mut errors, &name, entry, vars, maps) {
                if set_header(&mut response.headers, &entry.key, &value) {
                    vars.headers.insert(entry.key.to_ascii_lowercase(), value);
                }
            }
        }
        for name in &shaping.remove_headers {
            response.headers.remove(name.as_str());
            vars.headers.remove(&name.to_ascii_lowercase());
        }

        for cookie in response.headers.get_all(SET_COOKIE) {
            let Ok(cookie) = cookie.to_str() else { continue };
            let pair = cookie.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                vars.cookies
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }

        errors.finish(self.settings.supress_template_errors)?;
        Ok(response)
    }
}

/// Point a target at a rendered host, which may carry a path
fn apply_host(target: &mut ResolvedTarget, host: &str) {
    match Url::parse(host) {
        Ok(url) if url.has_host() => {
            target.set_host(&url[..url::Position::BeforePath]);
            if url.path() != "/" && !url.path().is_empty() {
                target.path = url.path().to_string();
            }
            let params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
            target.params.extend(params);
        }
        _ => target.set_host(host),
    }
}
