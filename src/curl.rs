use std::io::{self, Write};
use std::sync::OnceLock;

use regex::Regex;

/// Destination for reconstructed download commands
pub trait CommandSink: Send + Sync {
    fn emit(&self, command: &str);
}

/// Writes each command to standard output followed by a blank line
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl CommandSink for StdoutSink {
    fn emit(&self, command: &str) {
        // hold the lock so commands from concurrent connections never interleave
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}\n", command);
        let _ = out.flush();
    }
}

fn request_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^GET +(/[^ \r\n]*)").expect("valid request path pattern"))
}

fn host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?im)^Host: *([^ \r\n]+)").expect("valid host pattern")
    })
}

/// Quote `value` for a POSIX shell
///
/// The value is wrapped in single quotes; embedded single quotes become `'"'"'`.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    quoted.push_str(&value.replace('\'', r#"'"'"'"#));
    quoted.push('\'');
    quoted
}

/// Path of a raw GET request: everything after `GET ` up to the next space
pub fn request_path(request: &str) -> Option<&str> {
    request_path_pattern()
        .captures(request)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Value of the `Host` header of a raw request
pub fn request_host(request: &str) -> Option<&str> {
    host_pattern()
        .captures(request)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Header lines of a raw request, in order, excluding the request line
fn header_lines(request: &str) -> impl Iterator<Item = &str> {
    request
        .split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter(|line| match line.split_once(':') {
            Some((name, value)) => !name.is_empty() && !value.trim().is_empty(),
            None => false,
        })
}

/// Rebuild a curl command line equivalent to a raw GET request.
///
/// The URL is `http://<Host><path>`; every other header line becomes one
/// `-H` flag in its original order.
pub fn to_curl_command(request: &str) -> String {
    let path = request_path(request).unwrap_or("/");
    let host = request_host(request).unwrap_or_default();
    let url = format!("http://{}{}", host, path);

    let mut command = String::with_capacity(request.len() + 32);
    command.push_str("curl ");
    command.push_str(&shell_quote(&url));
    for line in header_lines(request) {
        let name = line.split_once(':').map(|(name, _)| name.trim()).unwrap_or_default();
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        command.push_str(" -H ");
        command.push_str(&shell_quote(line));
    }
    command.push_str(" --compressed");
    command
}
