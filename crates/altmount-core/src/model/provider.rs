use core::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 提供方身份：`host:port@username` 的短稳定哈希。
///
/// # 设计背景（Why）
/// - 配置热更新时需要判断“同一提供方”以保留健康连接；主机、端口与账号共同
///   决定身份，其余字段（连接数、TLS 开关）变化不应导致连接集被推倒重建；
/// - 短哈希便于出现在日志与统计里，又不泄露账号原文。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(String);

impl ProviderId {
    /// 由身份三元组派生稳定短哈希（SHA-256 前 8 个十六进制字符）。
    pub fn derive(host: &str, port: u16, username: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(host.as_bytes());
        hasher.update(b":");
        hasher.update(port.to_string().as_bytes());
        hasher.update(b"@");
        hasher.update(username.as_bytes());
        let digest = hasher.finalize();
        let mut short = String::with_capacity(8);
        for byte in digest.iter().take(4) {
            short.push_str(&format!("{byte:02x}"));
        }
        Self(short)
    }

    /// 以字符串视图读取短哈希。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单个 NNTP 提供方的配置。
///
/// # 契约说明（What）
/// - 生命周期：随配置快照整体替换；被移除的提供方由连接池排空后销毁；
/// - `backup = true` 的提供方仅在全部主提供方失败后参与调度；
/// - `insecure_tls` 仅跳过证书校验，不影响握手本身。
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub max_connections: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub backup: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    /// 派生该配置的稳定身份。
    pub fn id(&self) -> ProviderId {
        ProviderId::derive(&self.host, self.port, &self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_for_identity_fields_only() {
        let mut config = ProviderConfig {
            host: "news.example.com".into(),
            port: 563,
            tls: true,
            insecure_tls: false,
            username: "alice".into(),
            password: "one".into(),
            max_connections: 10,
            enabled: true,
            backup: false,
        };
        let original = config.id();

        config.password = "rotated".into();
        config.max_connections = 50;
        config.tls = false;
        assert_eq!(config.id(), original);

        config.port = 119;
        assert_ne!(config.id(), original);
    }

    #[test]
    fn id_is_short_hex() {
        let id = ProviderId::derive("h", 119, "u");
        assert_eq!(id.as_str().len(), 8);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
