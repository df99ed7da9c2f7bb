use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::push::PushNotifier;
use crate::session::events::ServerEvent;
use crate::session::history::HistoryStore;
use crate::session::network::NetworkState;
use crate::session::user_session::UserSession;

use super::handler::IrcEventHandler;
use super::proto::IrcMessage;

/// Hard deadline for dial + registration + welcome.
const WELCOME_DEADLINE: Duration = Duration::from_secs(40);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Spacing between perform commands and between initial JOINs, to stay
/// under server flood limits.
const PERFORM_GAP: Duration = Duration::from_millis(100);
const JOIN_GAP: Duration = Duration::from_millis(150);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connection attempt already in progress")]
    AlreadyInProgress,
    #[error("failed to reach {addr}: {reason}")]
    Dial { addr: String, reason: String },
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("SASL authentication failed: {0}")]
    Auth(String),
    #[error("no welcome from server within the deadline")]
    Timeout,
    #[error("connection closed during registration")]
    Closed,
}

impl ConnectError {
    /// Authentication failures must not be retried automatically; that
    /// would loop on bad credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectError::Auth(_))
    }
}

/// Cloneable handle to a live IRC connection's write side. Lines are queued
/// onto the connection's single writer task, which appends CRLF.
#[derive(Clone)]
pub struct IrcHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl IrcHandle {
    /// A handle plus the receiving end of its line queue. The caller owns
    /// draining the receiver (the writer task in production, the test
    /// otherwise).
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_raw(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }

    pub fn privmsg(&self, target: &str, text: &str) {
        self.send_raw(format!("PRIVMSG {target} :{text}"));
    }

    pub fn join(&self, channel: &str) {
        self.send_raw(format!("JOIN {channel}"));
    }

    pub fn names(&self, channel: &str) {
        self.send_raw(format!("NAMES {channel}"));
    }

    pub fn request_topic(&self, channel: &str) {
        self.send_raw(format!("TOPIC {channel}"));
    }

    pub fn set_topic(&self, channel: &str, topic: &str) {
        self.send_raw(format!("TOPIC {channel} :{topic}"));
    }

    pub fn quit(&self, message: &str) {
        if message.is_empty() {
            self.send_raw("QUIT");
        } else {
            self.send_raw(format!("QUIT :{message}"));
        }
    }
}

/// Everything a connection needs to mutate state, fan events out, and
/// schedule its own successor after a drop.
#[derive(Clone)]
pub struct ConnectContext {
    pub session: Arc<UserSession>,
    pub network: Arc<NetworkState>,
    pub history: Arc<HistoryStore>,
    pub push: Arc<dyn PushNotifier>,
    /// End-client address, relayed upstream via a PROXY protocol preface
    /// where the IRC server honors it.
    pub client_ip: Option<IpAddr>,
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Establish the network's IRC connection: gatekeeper, dial, TLS, PROXY
/// preface, registration (CAP/SASL/NICK/USER), welcome wait, perform
/// commands, initial joins. On a non-auth failure of an auto-reconnect
/// network, the next backoff attempt is scheduled before returning.
pub async fn connect(ctx: ConnectContext) -> Result<IrcHandle, ConnectError> {
    let Some(_attempt) = ctx.network.begin_connect() else {
        return Err(ConnectError::AlreadyInProgress);
    };

    let config = ctx.network.config();
    let addr = format!("{}:{}", config.hostname, config.port);
    info!(network = %config.network_name, %addr, "connecting");

    let result = establish(&ctx, &addr).await;
    if let Err(e) = &result {
        warn!(network = %config.network_name, error = %e, "connect failed");
        if !e.is_auth() && config.auto_reconnect {
            schedule_reconnect(&ctx);
        }
    }
    result
}

async fn establish(ctx: &ConnectContext, addr: &str) -> Result<IrcHandle, ConnectError> {
    let config = ctx.network.config();

    let mut tcp = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(ConnectError::Dial {
                addr: addr.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(ConnectError::Dial {
                addr: addr.to_string(),
                reason: "dial timed out".into(),
            })
        }
    };

    // The preface goes out on the raw socket, before TLS and before any
    // IRC bytes.
    if let Some(client_ip) = ctx.client_ip {
        write_proxy_preface(&mut tcp, client_ip)
            .await
            .map_err(|e| ConnectError::Dial {
                addr: addr.to_string(),
                reason: format!("PROXY preface failed: {e}"),
            })?;
    }

    let stream: Box<dyn Transport> = if config.use_ssl {
        Box::new(wrap_tls(tcp, &config.hostname).await?)
    } else {
        Box::new(tcp)
    };

    let (reader, mut writer) = tokio::io::split(stream);
    let (handle, mut out_rx) = IrcHandle::channel();

    // Single writer task per connection; everything funnels through it.
    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            let data = format!("{line}\r\n");
            if writer.write_all(data.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let (outcome_tx, mut outcome_rx) = mpsc::channel(1);
    let handler = Arc::new(IrcEventHandler::new(ctx.clone(), handle.clone(), outcome_tx));

    let read_handler = handler.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            match IrcMessage::parse(&line) {
                Ok(msg) => read_handler.handle(msg),
                Err(e) => debug!(error = %e, raw = %line.trim_end(), "skipping unparseable line"),
            }
        }
        read_handler.on_disconnect();
    });

    // Registration. The handler drives CAP/SASL from the replies; PASS only
    // goes out when the password is not consumed by SASL.
    if !config.server_password.is_empty() && !config.wants_sasl() {
        handle.send_raw(format!("PASS {}", config.server_password));
    }
    handle.send_raw("CAP LS 302");
    handle.send_raw(format!("NICK {}", config.nickname));
    handle.send_raw(format!(
        "USER {} 0 * :{}",
        config.effective_ident(),
        config.realname
    ));

    match timeout(WELCOME_DEADLINE, outcome_rx.recv()).await {
        Ok(Some(Ok(()))) => {}
        Ok(Some(Err(e))) => {
            handle.quit(&config.quit_message);
            return Err(e);
        }
        Ok(None) => return Err(ConnectError::Closed),
        Err(_) => {
            handle.quit(&config.quit_message);
            return Err(ConnectError::Timeout);
        }
    }

    for command in &config.perform_commands {
        debug!(network = %config.network_name, %command, "perform");
        handle.send_raw(command.clone());
        tokio::time::sleep(PERFORM_GAP).await;
    }

    for channel in &config.initial_channels {
        handle.join(channel);
        tokio::time::sleep(JOIN_GAP).await;
    }

    Ok(handle)
}

/// One-shot backoff timer: `min(120, 2^attempts)` seconds, attempts bumped
/// before scheduling and reset by the next welcome.
pub fn schedule_reconnect(ctx: &ConnectContext) {
    if ctx.network.reconnect_pending() {
        debug!(network_id = ctx.network.id, "reconnect already scheduled");
        return;
    }

    let delay = ctx.network.next_backoff_secs();
    let config = ctx.network.config();
    info!(
        network = %config.network_name,
        attempt = ctx.network.reconnect_attempts(),
        delay_secs = delay,
        "scheduling reconnect"
    );

    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(delay)).await;
        task_ctx.network.clear_reconnect_task();

        match connect(task_ctx.clone()).await {
            Ok(_) => {}
            Err(ConnectError::AlreadyInProgress) => {}
            Err(e) => {
                let config = task_ctx.network.config();
                task_ctx.session.broadcast(&ServerEvent::NetworkDisconnect {
                    network_id: task_ctx.network.id,
                    network_name: config.network_name.clone(),
                    status: "failed".into(),
                    reason: e.to_string(),
                });
            }
        }
    });
    ctx.network.set_reconnect_task(task);
}

async fn write_proxy_preface(tcp: &mut TcpStream, client_ip: IpAddr) -> std::io::Result<()> {
    let local = tcp.local_addr()?;
    let family = if client_ip.is_ipv4() { "TCP4" } else { "TCP6" };
    let preface = format!(
        "PROXY {family} {client_ip} {} 0 {}\r\n",
        local.ip(),
        local.port()
    );
    tcp.write_all(preface.as_bytes()).await
}

async fn wrap_tls(
    tcp: TcpStream,
    hostname: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|e| ConnectError::Tls(e.to_string()))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ConnectError::Tls(e.to_string()))
}
