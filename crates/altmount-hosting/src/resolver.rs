use async_trait::async_trait;
use tracing::debug;

use altmount_core::configuration::IndexerSettings;
use altmount_core::contract::CallContext;
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::traits::NzbResolver;

/// Newznab 风格索引站的 NZBLNK 解析器。
///
/// # 执行逻辑（How）
/// 1. 先按 `h=`（发布头）搜索，空结果退回按 `t=`（标题）搜索；
/// 2. 取第一个结果的下载链接并拉回 NZB 字节；
/// 3. 网络故障映射为可重试的 `nntp.transient`，搜索无结果映射为
///    `vfs.not_found`（导入器据此直接终态，不做无谓重试）。
pub struct NewznabResolver {
    http: reqwest::Client,
    settings: IndexerSettings,
}

impl NewznabResolver {
    pub fn new(settings: IndexerSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    async fn search(&self, query: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/api?t=search&o=json&apikey={}&q={}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.api_key,
            urlencode(query),
        );
        debug!(%url, "indexer search");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transient)?
            .error_for_status()
            .map_err(transient)?;
        let body: serde_json::Value = response.json().await.map_err(transient)?;

        // Newznab 的 JSON 输出：channel.item 是数组（多结果）或对象（单结果）。
        let items = &body["channel"]["item"];
        let first = if items.is_array() {
            items.get(0)
        } else if items.is_object() {
            Some(items)
        } else {
            None
        };
        Ok(first.and_then(item_link))
    }
}

fn item_link(item: &serde_json::Value) -> Option<String> {
    item["link"]
        .as_str()
        .or_else(|| item["enclosure"]["@attributes"]["url"].as_str())
        .map(str::to_string)
}

#[async_trait]
impl NzbResolver for NewznabResolver {
    async fn resolve(
        &self,
        ctx: &CallContext,
        title: &str,
        header: &str,
        _group: Option<&str>,
    ) -> Result<Vec<u8>> {
        ctx.ensure_active(std::time::Instant::now())?;
        let link = match self.search(header).await? {
            Some(link) => Some(link),
            None => self.search(title).await?,
        };
        let Some(link) = link else {
            return Err(CoreError::new(
                codes::PATH_NOT_FOUND,
                format!("indexer returned no result for {title:?}"),
            ));
        };

        ctx.ensure_active(std::time::Instant::now())?;
        let response = self
            .http
            .get(&link)
            .send()
            .await
            .map_err(transient)?
            .error_for_status()
            .map_err(transient)?;
        let bytes = response.bytes().await.map_err(transient)?;
        Ok(bytes.to_vec())
    }
}

fn transient(err: reqwest::Error) -> CoreError {
    CoreError::new(codes::TRANSIENT, "indexer request failed").with_cause(err)
}

/// 查询参数的最小百分号编码。
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_handles_reserved_bytes() {
        assert_eq!(urlencode("Some Release 2024"), "Some+Release+2024");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
        assert_eq!(urlencode("safe-._~"), "safe-._~");
    }

    #[test]
    fn item_link_prefers_plain_link() {
        let item = serde_json::json!({"link": "https://x/nzb/1"});
        assert_eq!(item_link(&item).as_deref(), Some("https://x/nzb/1"));

        let item = serde_json::json!({
            "enclosure": {"@attributes": {"url": "https://x/nzb/2"}}
        });
        assert_eq!(item_link(&item).as_deref(), Some("https://x/nzb/2"));
    }
}
