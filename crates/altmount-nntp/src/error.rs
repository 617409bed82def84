use altmount_core::CoreError;
use altmount_core::error::codes;

/// 操作名常量：错误消息里标注故障发生的协议阶段。
pub(crate) const CONNECT: &str = "connect";
pub(crate) const GREETING: &str = "greeting";
pub(crate) const AUTH: &str = "authinfo";
pub(crate) const GROUP: &str = "group";
pub(crate) const BODY: &str = "body";
pub(crate) const STAT: &str = "stat";
pub(crate) const DATE: &str = "date";
pub(crate) const TLS: &str = "tls_handshake";

/// I/O 故障统一映射为瞬态错误，保留根因链。
pub(crate) fn map_io_error(operation: &'static str, err: std::io::Error) -> CoreError {
    CoreError::new(
        codes::TRANSIENT,
        format!("i/o failure during {operation}"),
    )
    .with_cause(err)
}

/// 非预期协议响应映射为瞬态错误；连接随后必须关闭而不是复用。
pub(crate) fn unexpected_response(operation: &'static str, code: u16, text: &str) -> CoreError {
    CoreError::new(
        codes::TRANSIENT,
        format!("unexpected {code} during {operation}: {text}"),
    )
}

/// 430 族：报文在该提供方上确定性缺失。
pub(crate) fn article_not_found(article: &str) -> CoreError {
    CoreError::new(
        codes::ARTICLE_NOT_FOUND,
        format!("article <{article}> not found on provider"),
    )
}

/// 凭据被拒绝。
pub(crate) fn auth_failed(code: u16, text: &str) -> CoreError {
    CoreError::new(
        codes::AUTH_FAILED,
        format!("provider rejected credentials ({code}): {text}"),
    )
}
