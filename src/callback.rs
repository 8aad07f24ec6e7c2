/// Single-shot local HTTP listener for the OAuth redirect
use crate::error::{AuthError, Result};
use crate::shutdown::Shutdown;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEADER_LINES: usize = 100;
const MAX_REQUEST_BYTES: u64 = 8192;

/// Local callback server for the OAuth redirect
///
/// Binds immediately so the redirect target exists before the authorization
/// URL is shown, then answers requests until one carries a usable `code`.
pub struct CallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
    expected_state: Option<String>,
}

impl CallbackServer {
    /// Bind the callback listener
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;

        // Accept is polled so the deadline and shutdown flag are honoured
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            addr,
            expected_state: None,
        })
    }

    /// Require the redirect to echo this anti-forgery `state` value
    pub fn with_expected_state(mut self, state: impl Into<String>) -> Self {
        self.expected_state = Some(state.into());
        self
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the authorization code
    ///
    /// Returns [`AuthError::CallbackTimeout`] once `timeout` elapses and
    /// [`AuthError::Cancelled`] if shutdown is requested first. Malformed
    /// requests are answered with an error page and do not end the wait.
    pub fn wait_for_code(self, timeout: Duration, shutdown: &Shutdown) -> Result<String> {
        let deadline = Instant::now() + timeout;
        info!(addr = %self.addr, "waiting for authorization callback");

        loop {
            if shutdown.is_requested() {
                return Err(AuthError::Cancelled);
            }
            if Instant::now() > deadline {
                return Err(AuthError::CallbackTimeout);
            }

            match self.listener.accept() {
                Ok((stream, peer)) => match self.handle_request(stream, deadline) {
                    Ok(Some(code)) => {
                        info!(%peer, "received authorization code");
                        return Ok(code);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%peer, error = %e, "callback connection failed"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle_request(
        &self,
        stream: TcpStream,
        deadline: Instant,
    ) -> std::io::Result<Option<String>> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(CONNECTION_TIMEOUT))?;

        // One budget for the whole request, never past the authorization deadline
        let source = DeadlineReader {
            stream: stream.try_clone()?,
            deadline: (Instant::now() + CONNECTION_TIMEOUT).min(deadline),
        };
        let mut reader = BufReader::new(source.take(MAX_REQUEST_BYTES));
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        if !request_line.is_empty() && !request_line.ends_with('\n') {
            warn!(bytes = request_line.len(), "callback request line too long");
            send_error_response(stream, 400, "Request too large")?;
            return Ok(None);
        }
        drain_headers(&mut reader)?;

        // GET /?code=...&state=... HTTP/1.1
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            warn!(request = %request_line.trim(), "unparsable callback request");
            send_error_response(stream, 400, "Invalid request")?;
            return Ok(None);
        };

        if method != "GET" {
            send_error_response(stream, 405, "Only GET is supported")?;
            return Ok(None);
        }

        let params = match parse_query_params(target) {
            Some(params) => params,
            None => {
                warn!(request_target = %target, "unparsable callback target");
                send_error_response(stream, 400, "Invalid request")?;
                return Ok(None);
            }
        };

        if let Some(error) = params.get("error") {
            let description = params.get("error_description").map(String::as_str);
            warn!(%error, ?description, "provider redirected with an error");
            send_error_response(stream, 400, &format!("Authorization failed: {}", error))?;
            return Ok(None);
        }

        let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
            warn!(request_target = %target, "callback request without an authorization code");
            send_error_response(stream, 400, "Missing authorization code")?;
            return Ok(None);
        };

        if let Some(expected) = &self.expected_state {
            if params.get("state") != Some(expected) {
                warn!("callback state does not match the issued value, ignoring");
                send_error_response(stream, 400, "State mismatch")?;
                return Ok(None);
            }
        }

        send_success_response(stream)?;
        debug!("callback answered");
        Ok(Some(code.clone()))
    }
}

/// Socket reader that fails once `deadline` passes, however the bytes trickle in
struct DeadlineReader {
    stream: TcpStream,
    deadline: Instant,
}

impl Read for DeadlineReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self
            .deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| std::io::Error::new(ErrorKind::TimedOut, "callback request too slow"))?;
        self.stream.set_read_timeout(Some(remaining))?;
        self.stream.read(buf)
    }
}

fn drain_headers(reader: &mut impl BufRead) -> std::io::Result<()> {
    let mut line = String::new();
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }
    }
    Ok(())
}

/// Decode the query string of a request target such as `/?code=a%20b`.
fn parse_query_params(target: &str) -> Option<HashMap<String, String>> {
    let url = Url::parse("http://callback.invalid")
        .ok()?
        .join(target)
        .ok()?;
    Some(url.query_pairs().into_owned().collect())
}

fn escape_html(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            _ => c.to_string(),
        })
        .collect()
}

fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Arial, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
        }}
        .container {{
            padding: 2rem;
            text-align: center;
            max-width: 400px;
        }}
    </style>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
        <p>{message}</p>
    </div>
</body>
</html>"#,
        title = escape_html(title),
        message = escape_html(message),
    )
}

fn write_response(mut stream: TcpStream, status: &str, html: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        html.len(),
        html
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()
}

fn send_success_response(stream: TcpStream) -> std::io::Result<()> {
    write_response(
        stream,
        "200 OK",
        &page(
            "Authorization received",
            "Ok, you may now close this browser tab.",
        ),
    )
}

fn send_error_response(stream: TcpStream, status: u16, error: &str) -> std::io::Result<()> {
    let status_line = match status {
        405 => "405 Method Not Allowed",
        _ => "400 Bad Request",
    };
    write_response(stream, status_line, &page("Authorization failed", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn request(addr: SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "GET {} HTTP/1.1\r\nHost: localhost\r\nUser-Agent: test\r\n\r\n",
            target
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_query_param_parsing() {
        let params = parse_query_params("/?code=abc123&state=xyz789").unwrap();
        assert_eq!(params.get("code"), Some(&"abc123".to_string()));
        assert_eq!(params.get("state"), Some(&"xyz789".to_string()));
    }

    #[test]
    fn test_query_param_url_decoding() {
        let params = parse_query_params("/callback?code=abc%20123&state=xyz%2F789").unwrap();
        assert_eq!(params.get("code"), Some(&"abc 123".to_string()));
        assert_eq!(params.get("state"), Some(&"xyz/789".to_string()));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }

    #[test]
    fn test_receives_code() {
        let server = CallbackServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || request(addr, "/?code=the-code"));
        let code = server
            .wait_for_code(Duration::from_secs(10), &Shutdown::new())
            .unwrap();

        assert_eq!(code, "the-code");
        let response = client.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("close this browser tab"));
    }

    #[test]
    fn test_missing_code_keeps_waiting() {
        let server = CallbackServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let first = request(addr, "/favicon.ico");
            let second = request(addr, "/?state=only");
            let third = request(addr, "/?code=good");
            (first, second, third)
        });
        let code = server
            .wait_for_code(Duration::from_secs(10), &Shutdown::new())
            .unwrap();

        assert_eq!(code, "good");
        let (first, second, third) = client.join().unwrap();
        assert!(first.starts_with("HTTP/1.1 400"));
        assert!(second.contains("Missing authorization code"));
        assert!(third.starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn test_provider_error_keeps_waiting() {
        let server = CallbackServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let denied = request(addr, "/?error=access_denied");
            let ok = request(addr, "/?code=retry");
            (denied, ok)
        });
        let code = server
            .wait_for_code(Duration::from_secs(10), &Shutdown::new())
            .unwrap();

        assert_eq!(code, "retry");
        let (denied, _) = client.join().unwrap();
        assert!(denied.contains("access_denied"));
    }

    #[test]
    fn test_state_mismatch_is_ignored() {
        let server = CallbackServer::bind("127.0.0.1:0")
            .unwrap()
            .with_expected_state("s1");
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let forged = request(addr, "/?code=evil&state=other");
            let genuine = request(addr, "/?code=real&state=s1");
            (forged, genuine)
        });
        let code = server
            .wait_for_code(Duration::from_secs(10), &Shutdown::new())
            .unwrap();

        assert_eq!(code, "real");
        let (forged, genuine) = client.join().unwrap();
        assert!(forged.contains("State mismatch"));
        assert!(genuine.starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn test_slow_client_cannot_outlast_deadline() {
        let server = CallbackServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let _ = stream.write_all(b"GET /?code=slow HTTP/1.1\r\n");
            for _ in 0..20 {
                thread::sleep(Duration::from_millis(300));
                if stream.write_all(b"X-Trickle: 1\r\n").is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let result = server.wait_for_code(Duration::from_secs(1), &Shutdown::new());
        assert!(matches!(result, Err(AuthError::CallbackTimeout)));
        assert!(started.elapsed() < Duration::from_secs(3));
        client.join().unwrap();
    }

    #[test]
    fn test_oversized_request_is_refused() {
        let server = CallbackServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let target = format!("/?code={}", "a".repeat(10_000));
            let _ = write!(stream, "GET {} HTTP/1.1\r\n\r\n", target);
            let mut response = String::new();
            let _ = stream.read_to_string(&mut response);
        });

        let result = server.wait_for_code(Duration::from_secs(1), &Shutdown::new());
        assert!(matches!(result, Err(AuthError::CallbackTimeout)));
        client.join().unwrap();
    }

    #[test]
    fn test_times_out() {
        let server = CallbackServer::bind("127.0.0.1:0").unwrap();
        let result = server.wait_for_code(Duration::from_millis(200), &Shutdown::new());
        assert!(matches!(result, Err(AuthError::CallbackTimeout)));
    }

    #[test]
    fn test_cancelled_by_shutdown() {
        let server = CallbackServer::bind("127.0.0.1:0").unwrap();
        let shutdown = Shutdown::new();
        shutdown.request();
        let result = server.wait_for_code(Duration::from_secs(30), &shutdown);
        assert!(matches!(result, Err(AuthError::Cancelled)));
    }
}
