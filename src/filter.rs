use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use regex::bytes::Regex;
use tracing::{debug, trace};

use crate::curl::{request_path, to_curl_command};
use crate::redirect::RedirectTrace;

/// Inspection stops for a buffer once it holds more than this many bytes
pub const INSPECT_CEILING: usize = 4096 * 3;

fn request_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?-u)GET /[^ \r\n]* +HTTP/\d\.\d\r\n(?:[^\r\n]*\r\n)*?\r\n")
            .expect("valid request pattern")
    })
}

fn redirect_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?s-u)HTTP/\d\.\d +302\b.*?\r\n(?i:location): *(?:https?://[^/\r\n ]+)?(/[^ \r\n]*) *\r\n",
        )
        .expect("valid redirect pattern")
    })
}

fn attachment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i-u)Content-Disposition: *attachment; *filename=").expect("valid attachment pattern")
    })
}

/// Inline HTTP scanner attached to one relay.
///
/// Observes request bytes (near -> far) and response bytes (far -> near)
/// without touching them, tracking at most one pending GET request. A
/// `302` response records the pending request in the [`RedirectTrace`];
/// an attachment response turns the originating request into a curl
/// command.
#[derive(Debug)]
pub struct TrafficFilter {
    request_buf: BytesMut,
    response_buf: BytesMut,
    pending: Option<String>,
    trace: Arc<RedirectTrace>,
}

impl TrafficFilter {
    pub fn new(trace: Arc<RedirectTrace>) -> Self {
        Self {
            request_buf: BytesMut::new(),
            response_buf: BytesMut::new(),
            pending: None,
            trace,
        }
    }

    /// Feed bytes travelling from the client towards the destination
    pub fn observe_request(&mut self, chunk: &[u8]) {
        if self.request_buf.len() > INSPECT_CEILING {
            return;
        }
        self.request_buf.extend_from_slice(chunk);

        let matched = request_pattern()
            .find(&self.request_buf)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned());
        if let Some(request) = matched {
            trace!(path = request_path(&request).unwrap_or_default(), "captured GET request");
            self.pending = Some(request);
            self.request_buf.clear();
        }
    }

    /// Feed bytes travelling from the destination back to the client.
    ///
    /// Returns the reconstructed command when this chunk completes a
    /// download response.
    pub fn observe_response(&mut self, chunk: &[u8]) -> Option<String> {
        if self.response_buf.len() > INSPECT_CEILING {
            return None;
        }
        self.response_buf.extend_from_slice(chunk);

        let location = redirect_pattern()
            .captures(&self.response_buf)
            .and_then(|caps| caps.get(1))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned());
        if let Some(location) = location {
            if let Some(request) = self.pending.take() {
                debug!(location = %location, "recording redirect origin");
                self.trace.set(location, request);
            }
            self.clear_buffers();
            return None;
        }

        if !attachment_pattern().is_match(&self.response_buf) {
            return None;
        }

        let command = self.pending.take().map(|request| {
            let origin = request_path(&request).and_then(|path| self.trace.get(path));
            to_curl_command(origin.as_deref().unwrap_or(&request))
        });
        self.clear_buffers();
        command
    }

    #[cfg(test)]
    pub fn pending_request(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    fn clear_buffers(&mut self) {
        self.request_buf.clear();
        self.response_buf.clear();
    }
}
