use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{ProviderConfig, ProviderId};
use altmount_core::traits::BodySink;
use altmount_yenc::YencDecoder;

use crate::error::{
    self, article_not_found, auth_failed, map_io_error, unexpected_response,
};

/// 行长度上限：yEnc 正文行在 128 字节左右，超长行视为协议破坏。
const MAX_LINE_BYTES: usize = 64 * 1024;

/// 明文或 TLS 之上的统一字节流。
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// 一行协议响应。
#[derive(Debug)]
pub(crate) struct Response {
    pub code: u16,
    pub text: String,
}

/// 单条 NNTP 连接：握手、认证、组选择与命令收发。
///
/// # 契约说明（What）
/// - 连接在任意时刻处于 {空闲、被租借、排空、已关闭} 之一，状态由池侧管理，
///   本类型只保证协议交互的正确性；
/// - 返回非预期响应或发生 I/O 故障后，连接不可复用，调用方必须丢弃；
/// - `idle_since`/`established_at` 供清扫判定超时与超龄。
pub(crate) struct NntpConnection {
    stream: BufReader<Transport>,
    provider: ProviderId,
    pub(crate) established_at: Instant,
    pub(crate) idle_since: Instant,
    current_group: Option<String>,
    scratch: Vec<u8>,
}

impl NntpConnection {
    /// 建立连接：TCP（可选 TLS 握手）→ 问候 → 认证。
    pub(crate) async fn connect(config: &ProviderConfig) -> Result<Self> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|err| map_io_error(error::CONNECT, err))?;

        let transport = if config.tls {
            let connector = TlsConnector::from(client_tls_config(config.insecure_tls));
            let server_name = ServerName::try_from(config.host.clone()).map_err(|_| {
                CoreError::new(
                    codes::CONFIG_INVALID,
                    format!("{} is not a valid TLS server name", config.host),
                )
            })?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|err| map_io_error(error::TLS, err))?;
            Transport::Tls(Box::new(tls))
        } else {
            Transport::Plain(tcp)
        };

        let now = Instant::now();
        let mut conn = Self {
            stream: BufReader::new(transport),
            provider: config.id(),
            established_at: now,
            idle_since: now,
            current_group: None,
            scratch: Vec::with_capacity(512),
        };

        let greeting = conn.read_response(error::GREETING).await?;
        if !matches!(greeting.code, 200 | 201) {
            return Err(unexpected_response(
                error::GREETING,
                greeting.code,
                &greeting.text,
            ));
        }
        if !config.username.is_empty() {
            conn.authenticate(&config.username, &config.password).await?;
        }
        debug!(provider = %conn.provider, host = %config.host, "nntp connection established");
        Ok(conn)
    }

    pub(crate) fn provider(&self) -> &ProviderId {
        &self.provider
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let response = self
            .command(&format!("AUTHINFO USER {username}"), error::AUTH)
            .await?;
        match response.code {
            281 => return Ok(()),
            381 => {}
            code => return Err(auth_failed(code, &response.text)),
        }
        let response = self
            .command(&format!("AUTHINFO PASS {password}"), error::AUTH)
            .await?;
        match response.code {
            281 => Ok(()),
            code @ (481 | 482 | 502) => Err(auth_failed(code, &response.text)),
            code => Err(unexpected_response(error::AUTH, code, &response.text)),
        }
    }

    /// 惰性组选择：仅当提示的首选组与当前组不同才重新 `GROUP`。
    ///
    /// 组选择失败不致命：多数服务器允许直接按报文标识取正文。
    pub(crate) async fn select_group(&mut self, hints: &[String]) -> Result<()> {
        let Some(preferred) = hints.first() else {
            return Ok(());
        };
        if self.current_group.as_deref() == Some(preferred.as_str()) {
            return Ok(());
        }
        for hint in hints {
            let response = self.command(&format!("GROUP {hint}"), error::GROUP).await?;
            if response.code == 211 {
                self.current_group = Some(hint.clone());
                return Ok(());
            }
            trace!(group = %hint, code = response.code, "group selection declined");
        }
        Ok(())
    }

    /// 取正文：`BODY <id>`，点阵终止、去点填充，逐行送入 yEnc 解码器。
    ///
    /// 返回解码摘要（含写入 sink 的载荷字节数与编码头信息）。解码中途失败
    /// 时正文尚未读尽，连接不可复用。
    pub(crate) async fn body_into(
        &mut self,
        article: &str,
        sink: &mut dyn BodySink,
    ) -> Result<altmount_yenc::DecodeSummary> {
        let response = self
            .command(&format!("BODY <{article}>"), error::BODY)
            .await?;
        match response.code {
            222 => {}
            430 => return Err(article_not_found(article)),
            code => return Err(unexpected_response(error::BODY, code, &response.text)),
        }

        let mut decoder = YencDecoder::new(sink);
        loop {
            self.scratch.clear();
            let taken = self
                .stream
                .read_until(b'\n', &mut self.scratch)
                .await
                .map_err(|err| map_io_error(error::BODY, err))?;
            if taken == 0 {
                return Err(unexpected_response(error::BODY, 0, "peer closed mid-body"));
            }
            if self.scratch.len() > MAX_LINE_BYTES {
                return Err(unexpected_response(error::BODY, 222, "body line too long"));
            }
            let mut line = self.scratch.as_slice();
            if let Some(stripped) = line.strip_suffix(b"\n") {
                line = stripped;
            }
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line == b"." {
                break;
            }
            // 点填充：传输层在行首多垫一个点，解码前去掉。
            let data = if line.starts_with(b"..") { &line[1..] } else { line };
            decoder.push_line(data)?;
        }
        decoder.finish()
    }

    /// 探活：`STAT <id>`，223 为在库，430 为确定性缺失。
    pub(crate) async fn stat(&mut self, article: &str) -> Result<bool> {
        let response = self
            .command(&format!("STAT <{article}>"), error::STAT)
            .await?;
        match response.code {
            223 => Ok(true),
            430 => Ok(false),
            code => Err(unexpected_response(error::STAT, code, &response.text)),
        }
    }

    /// 连接活性探测：`DATE` 只走一次往返，任何非 111 响应视为连接失活。
    pub(crate) async fn probe(&mut self) -> Result<()> {
        let response = self.command("DATE", error::DATE).await?;
        if response.code == 111 {
            Ok(())
        } else {
            Err(unexpected_response(error::DATE, response.code, &response.text))
        }
    }

    async fn command(&mut self, line: &str, operation: &'static str) -> Result<Response> {
        let writer = self.stream.get_mut();
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| map_io_error(operation, err))?;
        writer
            .write_all(b"\r\n")
            .await
            .map_err(|err| map_io_error(operation, err))?;
        writer
            .flush()
            .await
            .map_err(|err| map_io_error(operation, err))?;
        self.read_response(operation).await
    }

    async fn read_response(&mut self, operation: &'static str) -> Result<Response> {
        self.scratch.clear();
        let taken = self
            .stream
            .read_until(b'\n', &mut self.scratch)
            .await
            .map_err(|err| map_io_error(operation, err))?;
        if taken == 0 {
            return Err(unexpected_response(operation, 0, "peer closed connection"));
        }
        let text = String::from_utf8_lossy(&self.scratch);
        let text = text.trim_end_matches(['\r', '\n']);
        let code: u16 = text
            .get(..3)
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| unexpected_response(operation, 0, text))?;
        Ok(Response {
            code,
            text: text.get(4..).unwrap_or("").to_string(),
        })
    }
}

/// 客户端 TLS 配置：默认走 webpki 根证书，`insecure` 模式跳过证书校验。
fn client_tls_config(insecure: bool) -> Arc<rustls::ClientConfig> {
    if insecure {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .expect("ring provider supports default protocol versions")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
            .with_no_client_auth();
        Arc::new(config)
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}

/// 跳过证书校验的验证器；签名校验仍然执行，仅信任链被放行。
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
