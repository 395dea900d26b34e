use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use super::manual::parse_verifier_input;
use super::AuthError;

pub const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const MAX_REQUEST_BYTES: usize = 16 * 1024;
/// Connections that send no complete request within this window are dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const SUCCESS_HTML: &str = r#"<html><body><h1>Authorization complete</h1><p>You may close this window and return to the terminal.</p></body></html>"#;
const EXHAUSTED_HTML: &str = r#"<html><body><h1>Authorization failed</h1><p>Too many invalid codes. Return to the terminal and start again.</p></body></html>"#;
const NOT_FOUND_HTML: &str = r#"<html><body><h1>Not found</h1></body></html>"#;

/// Settings for a single verification page session.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub bind_addr: IpAddr,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout: DEFAULT_VERIFICATION_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Loopback page where the user pastes the verification code shown by E*TRADE.
///
/// The listener accepts exactly one valid code. It is shut down as soon as a code
/// arrives, the timeout elapses, or the channel is closed or dropped.
#[derive(Debug)]
pub struct VerificationChannel {
    local_url: Url,
    timeout: Duration,
    code_rx: Option<oneshot::Receiver<Result<String, AuthError>>>,
    server: Option<JoinHandle<()>>,
}

impl VerificationChannel {
    /// Bind the local page for `authorization_url`.
    pub async fn open(
        authorization_url: &Url,
        options: ChannelOptions,
    ) -> Result<Self, AuthError> {
        let listener = TcpListener::bind((options.bind_addr, 0))
            .await
            .map_err(AuthError::ChannelUnavailable)?;
        let addr = listener
            .local_addr()
            .map_err(AuthError::ChannelUnavailable)?;
        let local_url = Url::parse(&format!("http://{addr}/"))?;

        let page = CapturePage {
            authorization_url: authorization_url.to_string(),
            max_attempts: options.max_attempts.max(1),
        };
        let (tx, rx) = oneshot::channel();
        let server = tokio::spawn(serve(listener, page, tx));
        tracing::debug!(url = %local_url, "verification page listening");

        Ok(Self {
            local_url,
            timeout: options.timeout,
            code_rx: Some(rx),
            server: Some(server),
        })
    }

    pub fn local_url(&self) -> &Url {
        &self.local_url
    }

    pub fn is_closed(&self) -> bool {
        self.server.is_none()
    }

    /// Wait for a submitted code. The channel is closed when this returns.
    pub async fn wait_for_code(&mut self) -> Result<String, AuthError> {
        let rx = self.code_rx.take().ok_or(AuthError::ListenerClosed)?;
        let outcome = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuthError::ListenerClosed),
            Err(_) => Err(AuthError::VerificationTimeout(self.timeout)),
        };
        self.close().await;
        outcome
    }

    /// Stop listening and release the port.
    pub async fn close(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
            let _ = server.await;
            tracing::debug!(url = %self.local_url, "verification page closed");
        }
    }
}

impl Drop for VerificationChannel {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

struct CapturePage {
    authorization_url: String,
    max_attempts: u32,
}

impl CapturePage {
    fn render(&self, notice: Option<&str>) -> String {
        let link = escape_html(&self.authorization_url);
        let notice = notice
            .map(|text| format!(r#"<p style="color:#b00020">{}</p>"#, escape_html(text)))
            .unwrap_or_default();
        format!(
            r#"<html><head><title>E*TRADE authorization</title></head><body>
<h1>Authorize access to your E*TRADE account</h1>
<ol>
<li><a href="{link}" target="_blank" rel="noopener">Open the E*TRADE authorization page</a> and sign in.</li>
<li>Accept the request and copy the verification code shown.</li>
<li>Paste the code below and submit.</li>
</ol>
{notice}
<form method="post" action="/">
<input type="text" name="code" autocomplete="off" autofocus>
<button type="submit">Submit</button>
</form>
</body></html>"#
        )
    }
}

struct CaptureState {
    tx: Option<oneshot::Sender<Result<String, AuthError>>>,
    attempts: u32,
}

impl CaptureState {
    /// Count a bad submission; hands back the sender once attempts run out.
    fn reject(&mut self, max_attempts: u32) -> Option<(oneshot::Sender<Result<String, AuthError>>, u32)> {
        self.tx.as_ref()?;
        self.attempts += 1;
        tracing::debug!(attempts = self.attempts, "rejected verification code submission");
        if self.attempts < max_attempts {
            return None;
        }
        let attempts = self.attempts;
        self.tx.take().map(|tx| (tx, attempts))
    }
}

type SharedState = Arc<StdMutex<CaptureState>>;

async fn serve(
    listener: TcpListener,
    page: CapturePage,
    tx: oneshot::Sender<Result<String, AuthError>>,
) {
    let page = Arc::new(page);
    let state = Arc::new(StdMutex::new(CaptureState {
        tx: Some(tx),
        attempts: 0,
    }));
    // Dropped with the server task, which aborts any connection still in flight.
    let mut connections = JoinSet::new();
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(err) => {
                tracing::debug!(error = %err, "verification page accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        while connections.try_join_next().is_some() {}
        connections.spawn(handle_connection(
            stream,
            Arc::clone(&page),
            Arc::clone(&state),
        ));
    }
}

async fn handle_connection(mut stream: TcpStream, page: Arc<CapturePage>, state: SharedState) {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "discarding malformed request on verification page");
            let _ = respond(&mut stream, 400, &page.render(None)).await;
            return;
        }
        Err(_) => {
            tracing::debug!("dropping idle connection to verification page");
            return;
        }
    };

    match (request.method.as_str(), request.path()) {
        ("GET", "/") => {
            let _ = respond(&mut stream, 200, &page.render(None)).await;
        }
        ("POST", "/") => match request
            .form_value("code")
            .and_then(|raw| parse_verifier_input(&raw))
        {
            Some(code) => {
                let _ = respond(&mut stream, 200, SUCCESS_HTML).await;
                let _ = stream.shutdown().await;
                let tx = lock(&state).tx.take();
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(code));
                }
            }
            None => {
                let exhausted = lock(&state).reject(page.max_attempts);
                match exhausted {
                    Some((tx, attempts)) => {
                        let _ = respond(&mut stream, 400, EXHAUSTED_HTML).await;
                        let _ = tx.send(Err(AuthError::InvalidVerificationCode { attempts }));
                    }
                    None => {
                        let notice = "Enter the verification code shown by E*TRADE.";
                        let _ = respond(&mut stream, 400, &page.render(Some(notice))).await;
                    }
                }
            }
        },
        _ => {
            let _ = respond(&mut stream, 404, NOT_FOUND_HTML).await;
        }
    }
}

fn lock(state: &SharedState) -> MutexGuard<'_, CaptureState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CaptureRequest {
    method: String,
    target: String,
    body: Vec<u8>,
}

impl CaptureRequest {
    fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    fn form_value(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(&self.body)
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<CaptureRequest, AuthError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(AuthError::InvalidCaptureRequest("headers too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(AuthError::InvalidCaptureRequest(
                "connection closed mid-request".into(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| AuthError::InvalidCaptureRequest("missing request line".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidCaptureRequest("missing method".into()))?
        .to_ascii_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| AuthError::InvalidCaptureRequest("missing path".into()))?
        .to_owned();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| {
                    AuthError::InvalidCaptureRequest("invalid content-length".into())
                })?;
            }
        }
    }
    if content_length > MAX_REQUEST_BYTES {
        return Err(AuthError::InvalidCaptureRequest("body too large".into()));
    }

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(AuthError::InvalidCaptureRequest("truncated body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(CaptureRequest {
        method,
        target,
        body,
    })
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Submit a code to a running verification page and return the raw HTTP response.
#[cfg(test)]
pub(crate) async fn submit_code(local_url: &Url, code: &str) -> std::io::Result<String> {
    let body: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("code", code)
        .finish();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        host = host_port(local_url),
        len = body.len(),
    );
    exchange(local_url, &request).await
}

#[cfg(test)]
async fn exchange(local_url: &Url, request: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(host_port(local_url)).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

#[cfg(test)]
fn host_port(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or("127.0.0.1"),
        url.port().unwrap_or(80)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorization_url() -> Url {
        Url::parse("https://us.etrade.com/e/t/etws/authorize?key=ck&token=req").unwrap()
    }

    fn options(timeout: Duration, max_attempts: u32) -> ChannelOptions {
        ChannelOptions {
            timeout,
            max_attempts,
            ..ChannelOptions::default()
        }
    }

    #[tokio::test]
    async fn page_links_to_authorization_url() {
        let channel = VerificationChannel::open(&authorization_url(), ChannelOptions::default())
            .await
            .unwrap();
        assert_eq!(channel.local_url().host_str(), Some("127.0.0.1"));

        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            host_port(channel.local_url())
        );
        let response = exchange(channel.local_url(), &request).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response
            .contains("https://us.etrade.com/e/t/etws/authorize?key=ck&amp;token=req"));
        assert!(response.contains(r#"name="code""#));
    }

    #[tokio::test]
    async fn submitted_code_is_delivered_once() {
        let mut channel = VerificationChannel::open(&authorization_url(), ChannelOptions::default())
            .await
            .unwrap();
        let url = channel.local_url().clone();

        let submitter = tokio::spawn(async move { submit_code(&url, " 123456 ").await });
        let code = channel.wait_for_code().await.unwrap();
        assert_eq!(code, "123456");
        assert!(channel.is_closed());

        let response = submitter.await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));

        // A second submission finds nobody listening.
        assert!(submit_code(channel.local_url(), "654321").await.is_err());
        assert!(matches!(
            channel.wait_for_code().await,
            Err(AuthError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn idle_connection_does_not_block_submission() {
        let mut channel = VerificationChannel::open(
            &authorization_url(),
            options(Duration::from_secs(3), DEFAULT_MAX_ATTEMPTS),
        )
        .await
        .unwrap();
        let url = channel.local_url().clone();

        // A preconnected socket that never sends a request.
        let _idle = TcpStream::connect(host_port(&url)).await.unwrap();
        let submitter = tokio::spawn(async move { submit_code(&url, "123456").await });

        let code = channel.wait_for_code().await.unwrap();
        assert_eq!(code, "123456");
        let response = submitter.await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn empty_submission_keeps_channel_open() {
        let mut channel = VerificationChannel::open(&authorization_url(), ChannelOptions::default())
            .await
            .unwrap();
        let url = channel.local_url().clone();

        let submitter = tokio::spawn(async move {
            let rejected = submit_code(&url, "   ").await.unwrap();
            let accepted = submit_code(&url, "A1B2C").await.unwrap();
            (rejected, accepted)
        });

        let code = channel.wait_for_code().await.unwrap();
        assert_eq!(code, "A1B2C");
        let (rejected, accepted) = submitter.await.unwrap();
        assert!(rejected.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(rejected.contains("Enter the verification code"));
        assert!(accepted.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let mut channel = VerificationChannel::open(
            &authorization_url(),
            options(DEFAULT_VERIFICATION_TIMEOUT, 2),
        )
        .await
        .unwrap();
        let url = channel.local_url().clone();

        let submitter = tokio::spawn(async move {
            let _ = submit_code(&url, "").await;
            let _ = submit_code(&url, "not a code!").await;
        });

        let err = channel.wait_for_code().await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidVerificationCode { attempts: 2 }
        ));
        submitter.await.unwrap();
    }

    #[tokio::test]
    async fn times_out_and_releases_port() {
        let mut channel = VerificationChannel::open(
            &authorization_url(),
            options(Duration::from_millis(50), DEFAULT_MAX_ATTEMPTS),
        )
        .await
        .unwrap();

        let err = channel.wait_for_code().await.unwrap_err();
        assert!(matches!(err, AuthError::VerificationTimeout(_)));
        assert!(channel.is_closed());
        assert!(TcpStream::connect(host_port(channel.local_url()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let channel = VerificationChannel::open(&authorization_url(), ChannelOptions::default())
            .await
            .unwrap();
        let request = format!(
            "GET /favicon.ico HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            host_port(channel.local_url())
        );
        let response = exchange(channel.local_url(), &request).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape_html(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }
}
