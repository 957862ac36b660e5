//! Client for the device's application installer.
//!
//! The installer is a small HTTP service with digest authentication and
//! a strict upload choreography:
//!
//! 1. POST with `Expect: 100-continue`, headers only.
//! 2. The service answers `401 Unauthorized` with a one-time
//!    `WWW-Authenticate` challenge; crucially, the body must NOT be sent
//!    on this connection.
//! 3. Re-send the POST with a digest `Authorization` header, again
//!    headers-first.
//! 4. On `100 Continue`, send the multipart body and read the final
//!    status.
//!
//! Platform HTTP clients tend to either send the body eagerly or refuse
//! to combine digest auth with `100-continue`, so the exchange is done
//! directly over a TCP stream.

use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;

use anyhow::{bail, Context};

const INSTALLER_PORT: u16 = 80;
const USER_NAME: &str = "rokudev";

/// Client for one device's installer service.
pub struct AppInstallerClient {
    device_ip: String,
    password: String,
}

impl AppInstallerClient {
    pub fn new(device_ip: impl Into<String>, password: impl Into<String>) -> Self {
        Self { device_ip: device_ip.into(), password: password.into() }
    }

    /// Remove the sideloaded channel, if any.
    pub fn remove(&self) -> anyhow::Result<()> {
        tracing::info!("removing dev channel, if installed");
        let body = MultipartBody::new()
            .text_field("mysubmit", "Delete")
            .text_field("archive", "");
        self.do_post(&body)
    }

    /// Sideload a channel archive. `remote_debug` asks the device to
    /// open its debug control port when the channel starts.
    pub fn install(&self, archive_path: &Path, remote_debug: bool) -> anyhow::Result<()> {
        let file_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "channel.zip".to_string());
        tracing::info!(archive = %file_name, "installing dev channel");
        let contents = std::fs::read(archive_path)
            .with_context(|| format!("could not read {}", archive_path.display()))?;

        let mut body = MultipartBody::new()
            .text_field("mysubmit", "Install")
            .file_field("archive", &file_name, &contents);
        if remote_debug {
            body = body
                .text_field("remotedebug", "1")
                .text_field("remotedebug_connect_early", "1");
        }
        self.do_post(&body)
    }

    fn do_post(&self, body: &MultipartBody) -> anyhow::Result<()> {
        let path = "/plugin_install";
        let payload = body.encode();

        // First exchange: expect the digest challenge.
        let mut stream = self.connect()?;
        self.write_headers(&mut stream, path, &body.boundary, payload.len(), None)?;
        let challenge = HttpResponse::read(&mut stream)?;
        if challenge.status != 401 {
            bail!("bad response from app installer: {} {}", challenge.status, challenge.reason);
        }
        // A challenge carrying a body would desynchronize the stream.
        if challenge.header("Content-Length").is_some_and(|v| v != "0") {
            bail!("bad Content-Length in 401 auth response from installer");
        }
        let authenticate = challenge
            .header("WWW-Authenticate")
            .context("401 without WWW-Authenticate challenge")?;
        let authorization =
            digest_authorization(authenticate, path, USER_NAME, &self.password, client_nonce())?;
        drop(stream);

        // Second exchange: authorized headers, then the body after the
        // service says 100 Continue.
        let mut stream = self.connect()?;
        self.write_headers(
            &mut stream,
            path,
            &body.boundary,
            payload.len(),
            Some(&authorization),
        )?;
        let go_ahead = HttpResponse::read(&mut stream)?;
        if go_ahead.status != 100 {
            bail!("bad response from app installer: {} {}", go_ahead.status, go_ahead.reason);
        }
        stream.write_all(&payload)?;
        stream.flush()?;

        let outcome = HttpResponse::read(&mut stream)?;
        tracing::info!(status = outcome.status, reason = %outcome.reason,
            "final response from device");
        if outcome.status != 200 {
            bail!("app installer failed: {} {}", outcome.status, outcome.reason);
        }
        Ok(())
    }

    fn connect(&self) -> anyhow::Result<TcpStream> {
        TcpStream::connect((self.device_ip.as_str(), INSTALLER_PORT)).with_context(|| {
            format!("could not reach app installer at {}:{INSTALLER_PORT}", self.device_ip)
        })
    }

    fn write_headers(
        &self,
        stream: &mut TcpStream,
        path: &str,
        boundary: &str,
        content_length: usize,
        authorization: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut request = String::new();
        let _ = write!(request, "POST {path} HTTP/1.1\r\n");
        let _ = write!(request, "Host: {}\r\n", self.device_ip);
        let _ = write!(request, "Accept: */*\r\n");
        let _ = write!(request, "User-Agent: rokudebug/{}\r\n", env!("CARGO_PKG_VERSION"));
        let _ = write!(request, "Content-Length: {content_length}\r\n");
        let _ = write!(request, "Content-Type: multipart/form-data; boundary={boundary}\r\n");
        let _ = write!(request, "Expect: 100-continue\r\n");
        if let Some(authorization) = authorization {
            let _ = write!(request, "Authorization: {authorization}\r\n");
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes())?;
        stream.flush()?;
        Ok(())
    }
}

/// A parsed HTTP response head (status line and headers; bodies are not
/// consumed; the installer exchange never needs one).
struct HttpResponse {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

impl HttpResponse {
    fn read(stream: &mut TcpStream) -> anyhow::Result<Self> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let mut parts = line.trim_end().splitn(3, ' ');
        let _version = parts.next().unwrap_or_default();
        let status: u16 = parts
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("bad status line from installer: {line:?}"))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        loop {
            line.clear();
            reader.read_line(&mut line)?;
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some((name, value)) = trimmed.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Ok(Self { status, reason, headers })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// multipart/form-data body under construction.
pub struct MultipartBody {
    boundary: String,
    parts: Vec<Vec<u8>>,
}

impl Default for MultipartBody {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartBody {
    pub fn new() -> Self {
        Self { boundary: format!("----RokuDebugForm{:016x}", rand::random::<u64>()), parts: Vec::new() }
    }

    pub fn text_field(mut self, name: &str, value: &str) -> Self {
        let mut part = Vec::new();
        let _ = write!(
            part,
            "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}"
        );
        self.parts.push(part);
        self
    }

    pub fn file_field(mut self, name: &str, file_name: &str, contents: &[u8]) -> Self {
        let mut part = Vec::new();
        let _ = write!(
            part,
            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        );
        part.extend_from_slice(contents);
        self.parts.push(part);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for part in &self.parts {
            body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        body
    }
}

fn client_nonce() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Build the digest `Authorization` header from a `WWW-Authenticate`
/// challenge, per RFC 2617 with qop.
fn digest_authorization(
    challenge: &str,
    path: &str,
    user: &str,
    password: &str,
    client_nonce: String,
) -> anyhow::Result<String> {
    let server_nonce =
        quoted_param(challenge, "nonce").context("challenge without nonce")?;
    let realm = quoted_param(challenge, "realm").context("challenge without realm")?;
    let qop = quoted_param(challenge, "qop").context("challenge without qop")?;

    // One request per nonce, so the count never advances.
    let nonce_count = "00000001";
    let ha1 = md5_hex(&format!("{user}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("POST:{path}"));
    let response =
        md5_hex(&format!("{ha1}:{server_nonce}:{nonce_count}:{client_nonce}:{qop}:{ha2}"));

    Ok(format!(
        "Digest username=\"{user}\", realm=\"{realm}\", nonce=\"{server_nonce}\", \
         uri=\"{path}\", algorithm=MD5, response=\"{response}\", qop={qop}, \
         nc={nonce_count}, cnonce=\"{client_nonce}\""
    ))
}

/// Extract `key="value"` from a challenge header.
fn quoted_param<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let mut rest = header;
    while let Some(start) = rest.find(key) {
        let after = &rest[start + key.len()..];
        if let Some(quoted) = after.strip_prefix("=\"") {
            let end = quoted.find('"')?;
            return Some(&quoted[..end]);
        }
        rest = after;
    }
    None
}
