use core::fmt;
use core::time::Duration;
use std::borrow::Cow;
use std::error::Error as StdError;

/// `CoreError` 是 AltMount 全部子系统共享的稳定错误域，也是所有可观察错误的最终形态。
///
/// # 设计背景（Why）
/// - 连接池、解码器、存储与调度器在不同层次产生的故障需要合流为统一的错误码，
///   日志、重试策略与运维面板才能做精确的自动化处置；
/// - 错误码 `code` 始终为 `'static` 字符串并遵循 `<域>.<语义>` 约定，`message`
///   面向排障人员，`cause` 保留底层根因链。
///
/// # 契约说明（What）
/// - **前置条件**：调用方必须使用 [`codes`] 模块中的常量，或登记过的自定义码值；
/// - **后置条件**：返回的 `CoreError` 拥有独立所有权，`Send + Sync + 'static`，
///   可安全跨任务传递；除非显式调用 `with_*`，不会附带额外上下文。
///
/// # 设计取舍（Trade-offs）
/// - 使用 `Cow<'static, str>` 保存消息：静态文案零分配，动态描述仅一次堆分配；
/// - 分类信息可被显式覆盖，否则按错误码查内置矩阵，查不到回退为 `NonRetryable`。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

/// 底层根因的统一封装，保持 `Send + Sync` 以便跨线程传递。
pub type ErrorCause = Box<dyn StdError + Send + Sync + 'static>;

/// 框架统一的返回值别名，默认错误类型为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

impl CoreError {
    /// 构造核心错误。`code` 必须是稳定错误码，`message` 不应包含敏感信息。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 显式覆盖错误分类，优先于内置矩阵。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：分类需与错误码语义一致，不可把终态错误标记为 `Retryable`；
    /// - **后置条件**：返回新的 `CoreError`，内部分类信息被覆盖。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 获取结构化错误分类，驱动重试、终态与取消策略。
    ///
    /// # 执行逻辑（How）
    /// 1. 优先返回实例上显式设置的分类（业务覆盖默认策略的出口）；
    /// 2. 否则按错误码查 [`default_category`] 矩阵；
    /// 3. 查表失败回退为 [`ErrorCategory::NonRetryable`]，提示调用方补充矩阵。
    pub fn category(&self) -> ErrorCategory {
        self.category
            .clone()
            .or_else(|| default_category(self.code))
            .unwrap_or(ErrorCategory::NonRetryable)
    }

    /// 判断错误是否建议重试（含超时与瞬态故障）。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Retryable(_) | ErrorCategory::Timeout
        )
    }

    /// 判断错误是否由取消触发。
    pub fn is_cancelled(&self) -> bool {
        matches!(self.category(), ErrorCategory::Cancelled)
    }

    /// 判断错误是否属于“目标不存在”族（路径、描述符或报文缺失）。
    pub fn is_not_found(&self) -> bool {
        matches!(self.category(), ErrorCategory::NotFound)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn StdError + 'static))
    }
}

/// 重试建议：分类矩阵随 `Retryable` 一同给出的基础退避窗口。
///
/// # 契约说明（What）
/// - `after`：建议的最小等待时长，调用方可在其上叠加指数或抖动；
/// - 建议仅是节律提示，不携带“必须成功”的语义。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAdvice {
    after: Duration,
}

impl RetryAdvice {
    /// 构造带基础等待时长的重试建议。
    pub const fn after(after: Duration) -> Self {
        Self { after }
    }

    /// 读取建议等待时长。
    pub const fn wait(&self) -> Duration {
        self.after
    }
}

/// 错误分类枚举，驱动自动化容错策略。
///
/// # 设计背景（Why）
/// - 统一表达“可重试”“已取消”“目标缺失”等关键信号，避免上层解析字符串；
/// - 连接池据此决定同通道重试还是滚动到下一提供方，调度器据此决定退避还是终态。
///
/// # 契约说明（What）
/// - `Retryable`：携带退避建议 [`RetryAdvice`]，典型如网络瞬态故障；
/// - `NotFound`：目标（路径/描述符/报文）确定性缺失，重试无意义；
/// - `Exhausted`：资源或候选集合耗尽（所有提供方都已尝试）；
/// - `ProtocolViolation`：输入或持久化数据损坏，应作为缺陷暴露而非吞掉；
/// - `Conflict`：乐观更新输掉竞争，调用方可重新读取后再决策。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable(RetryAdvice),
    NonRetryable,
    NotFound,
    Exhausted,
    ProtocolViolation,
    Conflict,
    Cancelled,
    Timeout,
}

/// 稳定错误码清单。新增码值时必须同步登记 [`default_category`] 矩阵。
pub mod codes {
    /// 请求被调用方的取消令牌打断。
    pub const CANCELLED: &str = "core.cancelled";
    /// 截止时间先于操作完成到达。
    pub const DEADLINE_EXCEEDED: &str = "core.deadline_exceeded";

    /// 提供方以 430 族响应声明报文不存在。
    pub const ARTICLE_NOT_FOUND: &str = "nntp.article_not_found";
    /// 全部提供方都已尝试且无人可服务该报文。
    pub const PROVIDER_EXHAUSTED: &str = "nntp.provider_exhausted";
    /// 网络或协议层的瞬态故障，可在同一提供方上有限重试。
    pub const TRANSIENT: &str = "nntp.transient";
    /// 提供方拒绝当前凭据。
    pub const AUTH_FAILED: &str = "nntp.auth_failed";
    /// 连接租借等待被配置上限或关闭流程终止。
    pub const POOL_CLOSED: &str = "nntp.pool_closed";

    /// yEnc 帧破损或 CRC 校验失败。
    pub const DECODE_FAILED: &str = "yenc.decode_failed";
    /// 解密失败（认证标签不匹配或布局非法）。
    pub const DECRYPT_FAILED: &str = "yenc.decrypt_failed";

    /// 描述符文件缺失。
    pub const DESCRIPTOR_NOT_FOUND: &str = "meta.not_found";
    /// 描述符字节流与磁盘格式约定不符。
    pub const MALFORMED_DESCRIPTOR: &str = "meta.malformed_descriptor";
    /// 元数据目录 I/O 失败。
    pub const META_IO: &str = "meta.io";

    /// 虚拟路径不存在。
    pub const PATH_NOT_FOUND: &str = "vfs.not_found";
    /// 因分段缺失而提前终止的读取。
    pub const SHORT_READ: &str = "vfs.short_read";
    /// 虚拟文件树拒绝一切写操作。
    pub const READ_ONLY: &str = "vfs.read_only";

    /// NZB 文档不是合法的 XML 或缺少必需元素。
    pub const MALFORMED_NZB: &str = "import.malformed_nzb";
    /// 队列或健康存储的 SQL 操作失败。
    pub const STORE_IO: &str = "store.io";
    /// 条件更新输掉竞争（行已被其他工作者占有）。
    pub const CONFLICT: &str = "store.conflict";

    /// 修复目标不属于任何已配置的媒体管理实例。
    pub const PATH_MATCH_FAILED: &str = "repair.path_match_failed";
    /// 媒体管理实例的 HTTP 调用失败。
    pub const REPAIR_UPSTREAM: &str = "repair.upstream";

    /// 配置文件无法解析或字段非法。
    pub const CONFIG_INVALID: &str = "config.invalid";
}

/// 按错误码返回默认分类。
///
/// # 设计背景（Why）
/// - 把“码值 → 处置策略”的映射集中到单点，避免各调用方自行匹配导致语义漂移；
/// - 矩阵即文档：新错误码未登记时回退 `NonRetryable`，宁可保守也不误重试。
pub fn default_category(code: &str) -> Option<ErrorCategory> {
    use ErrorCategory as C;
    const SHORT_WAIT: Duration = Duration::from_millis(250);
    Some(match code {
        codes::CANCELLED => C::Cancelled,
        codes::DEADLINE_EXCEEDED => C::Timeout,
        codes::ARTICLE_NOT_FOUND => C::NotFound,
        codes::PROVIDER_EXHAUSTED => C::Exhausted,
        codes::TRANSIENT => C::Retryable(RetryAdvice::after(SHORT_WAIT)),
        codes::AUTH_FAILED => C::NonRetryable,
        codes::POOL_CLOSED => C::NonRetryable,
        codes::DECODE_FAILED => C::NonRetryable,
        codes::DECRYPT_FAILED => C::NonRetryable,
        codes::DESCRIPTOR_NOT_FOUND => C::NotFound,
        codes::MALFORMED_DESCRIPTOR => C::ProtocolViolation,
        codes::META_IO => C::Retryable(RetryAdvice::after(SHORT_WAIT)),
        codes::PATH_NOT_FOUND => C::NotFound,
        codes::SHORT_READ => C::NonRetryable,
        codes::READ_ONLY => C::NonRetryable,
        codes::MALFORMED_NZB => C::ProtocolViolation,
        codes::STORE_IO => C::Retryable(RetryAdvice::after(SHORT_WAIT)),
        codes::CONFLICT => C::Conflict,
        codes::PATH_MATCH_FAILED => C::NonRetryable,
        codes::REPAIR_UPSTREAM => C::Retryable(RetryAdvice::after(Duration::from_secs(1))),
        codes::CONFIG_INVALID => C::NonRetryable,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_falls_back_to_non_retryable_for_unknown_code() {
        let err = CoreError::new("future.unknown", "not in matrix");
        assert_eq!(err.category(), ErrorCategory::NonRetryable);
    }

    #[test]
    fn explicit_category_wins_over_matrix() {
        let err = CoreError::new(codes::TRANSIENT, "forced terminal")
            .with_category(ErrorCategory::NonRetryable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn cause_chain_is_reachable_via_std_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = CoreError::new(codes::TRANSIENT, "read failed").with_cause(io);
        let source = StdError::source(&err).expect("source present");
        assert!(source.to_string().contains("peer reset"));
    }

    #[test]
    fn not_found_family_is_recognised() {
        assert!(CoreError::new(codes::ARTICLE_NOT_FOUND, "430").is_not_found());
        assert!(CoreError::new(codes::PATH_NOT_FOUND, "no entry").is_not_found());
        assert!(!CoreError::new(codes::SHORT_READ, "hole").is_not_found());
    }
}
