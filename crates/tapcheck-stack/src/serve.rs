// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Static directory serving for HTTP requests.
// Author: Lukas Bower

//! Static file responses rooted at a directory.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::http::{render_reply, HttpMessage};

/// Options for [`respond`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeOpts {
    /// Directory requests are resolved against.
    pub root_dir: PathBuf,
    /// Extra header lines added to every reply, each ending in `\r\n`.
    pub extra_headers: String,
}

impl ServeOpts {
    /// Serve from `root_dir` with no extra headers.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            extra_headers: String::new(),
        }
    }
}

/// Build the full response for `request` against the directory in `opts`.
#[must_use]
pub fn respond(request: &HttpMessage, opts: &ServeOpts) -> Vec<u8> {
    let head_only = request.method.eq_ignore_ascii_case("HEAD");
    if !head_only && !request.method.eq_ignore_ascii_case("GET") {
        return reply(opts, 405, "", b"Method not allowed\n", false);
    }
    let Some(relative) = decode_path(&request.uri) else {
        return reply(opts, 400, "", b"Invalid path\n", false);
    };
    let mut path = opts.root_dir.join(&relative);
    if path.is_dir() {
        let index = path.join("index.html");
        if !index.is_file() {
            let listing = directory_listing(&path, &request.uri);
            return reply(
                opts,
                200,
                "Content-Type: text/html; charset=utf-8\r\n",
                listing.as_bytes(),
                head_only,
            );
        }
        path = index;
    }
    match fs::read(&path) {
        Ok(body) => {
            debug!("serving {} ({} bytes)", path.display(), body.len());
            let content_type = format!("Content-Type: {}\r\n", mime_type(&path));
            reply(opts, 200, &content_type, &body, head_only)
        }
        Err(err) => {
            debug!("cannot serve {}: {err}", path.display());
            reply(opts, 404, "", b"Not found\n", false)
        }
    }
}

fn reply(opts: &ServeOpts, status: u16, headers: &str, body: &[u8], head_only: bool) -> Vec<u8> {
    let headers = format!("{headers}{}", opts.extra_headers);
    let mut out = render_reply(status, &headers, body);
    if head_only {
        out.truncate(out.len() - body.len());
    }
    out
}

/// Percent-decode `uri` into a relative path, refusing any `..` segment.
fn decode_path(uri: &str) -> Option<PathBuf> {
    let bytes = uri.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'%' => {
                let hex = bytes.get(idx + 1..idx + 3)?;
                let text = std::str::from_utf8(hex).ok()?;
                decoded.push(u8::from_str_radix(text, 16).ok()?);
                idx += 3;
            }
            b'+' => {
                decoded.push(b' ');
                idx += 1;
            }
            byte => {
                decoded.push(byte);
                idx += 1;
            }
        }
    }
    let text = String::from_utf8(decoded).ok()?;
    let mut relative = PathBuf::new();
    for segment in text.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            segment if segment.contains('\\') || segment.contains('\0') => return None,
            segment => relative.push(segment),
        }
    }
    Some(relative)
}

fn directory_listing(dir: &Path, uri: &str) -> String {
    let base = if uri.ends_with('/') {
        uri.to_owned()
    } else {
        format!("{uri}/")
    };
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.path().is_dir() {
                        name.push('/');
                    }
                    name
                })
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    let mut html = format!("<!DOCTYPE html>\n<html><head><title>Index of {base}</title></head><body>\n<h1>Index of {base}</h1>\n<ul>\n");
    for name in names {
        html.push_str(&format!("<li><a href=\"{base}{name}\">{name}</a></li>\n"));
    }
    html.push_str("</ul>\n</body></html>\n");
    html
}

/// Content type guessed from the file extension.
#[must_use]
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" | "shtml" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "pem" | "crt" => "application/x-pem-file",
        _ => "application/octet-stream",
    }
}
