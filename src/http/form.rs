//! url-encoded and multipart/form-data codecs

use bytes::{BufMut, Bytes, BytesMut};
use url::form_urlencoded;

/// One field of a form body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormPart {
    pub fn text(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            filename: None,
            content_type: None,
            data: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    pub fn file(name: &str, filename: &str, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.to_string(),
            filename: Some(filename.to_string()),
            content_type: Some("application/octet-stream".to_string()),
            data: data.into(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    pub fn text_value(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

pub fn parse_urlencoded(body: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

pub fn encode_urlencoded<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

/// Extract the `boundary=` parameter of a multipart content type
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("boundary")
            .then(|| value.trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn disposition_param(disposition: &str, key: &str) -> Option<String> {
    disposition.split(';').find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

/// Split a multipart body into its parts; malformed parts are dropped
pub fn parse_multipart(body: &[u8], boundary: &str) -> Vec<FormPart> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();

    let Some(mut cursor) = find(body, &delimiter, 0) else {
        return parts;
    };

    loop {
        let start = cursor + delimiter.len();
        if body[start..].starts_with(b"--") {
            break;
        }
        let Some(next) = find(body, &delimiter, start) else {
            break;
        };

        let section = &body[start..next];
        let section = section.strip_prefix(b"\r\n").unwrap_or(section);
        let section = section.strip_suffix(b"\r\n").unwrap_or(section);

        if let Some(split) = find(section, b"\r\n\r\n", 0) {
            let head = String::from_utf8_lossy(&section[..split]);
            let data = Bytes::copy_from_slice(&section[split + 4..]);

            let mut name = None;
            let mut filename = None;
            let mut content_type = None;
            for line in head.split("\r\n") {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                if key.trim().eq_ignore_ascii_case("content-disposition") {
                    name = disposition_param(value, "name");
                    filename = disposition_param(value, "filename");
                } else if key.trim().eq_ignore_ascii_case("content-type") {
                    content_type = Some(value.trim().to_string());
                }
            }

            if let Some(name) = name {
                parts.push(FormPart {
                    name,
                    filename,
                    content_type,
                    data,
                });
            }
        }

        cursor = next;
    }

    parts
}

/// Encode parts as multipart/form-data, returning (boundary, body)
pub fn build_multipart(parts: &[FormPart]) -> (String, Bytes) {
    let boundary = format!("funcflow-{}", uuid::Uuid::new_v4().simple());
    let mut body = BytesMut::new();

    for part in parts {
        body.put_slice(format!("--{}\r\n", boundary).as_bytes());
        match &part.filename {
            Some(filename) => body.put_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    part.name, filename
                )
                .as_bytes(),
            ),
            None => body.put_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name).as_bytes(),
            ),
        }
        if let Some(content_type) = &part.content_type {
            body.put_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.put_slice(b"\r\n");
        body.put_slice(&part.data);
        body.put_slice(b"\r\n");
    }
    body.put_slice(format!("--{}--\r\n", boundary).as_bytes());

    (boundary, body.freeze())
}
