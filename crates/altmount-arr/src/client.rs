use serde::Deserialize;
use tracing::debug;

use altmount_core::configuration::{MediaInstance, MediaKind};
use altmount_core::error::{CoreError, Result, codes};

/// 单个媒体管理实例的 HTTP 客户端（v3 风格 API）。
///
/// # 契约说明（What）
/// - 所有请求带 `X-Api-Key` 头；非 2xx 响应映射为 `repair.upstream`；
/// - 只封装修复链路需要的四个端点：根目录、按路径找条目、剧集清单、
///   重扫命令。
pub struct ArrClient {
    http: reqwest::Client,
    instance: MediaInstance,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootFolder {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: i64,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: i64,
    pub season_number: u32,
    pub episode_number: u32,
}

impl ArrClient {
    pub fn new(http: reqwest::Client, instance: MediaInstance) -> Self {
        Self { http, instance }
    }

    pub fn kind(&self) -> MediaKind {
        self.instance.kind
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }

    /// 实例声明的根目录集合。
    pub async fn root_folders(&self) -> Result<Vec<RootFolder>> {
        self.get_json("/api/v3/rootfolder").await
    }

    /// 电影清单（带磁盘路径）。
    pub async fn movies(&self) -> Result<Vec<MediaItem>> {
        self.get_json("/api/v3/movie").await
    }

    /// 剧集清单（带磁盘路径）。
    pub async fn series(&self) -> Result<Vec<MediaItem>> {
        self.get_json("/api/v3/series").await
    }

    /// 指定剧集的分集列表。
    pub async fn episodes(&self, series_id: i64) -> Result<Vec<Episode>> {
        self.get_json(&format!("/api/v3/episode?seriesId={series_id}"))
            .await
    }

    /// 请求重扫电影并重新获取。
    pub async fn rescan_movie(&self, movie_id: i64) -> Result<()> {
        self.post_command(serde_json::json!({
            "name": "RescanMovie",
            "movieId": movie_id,
        }))
        .await
    }

    /// 请求重扫整部剧集。
    pub async fn rescan_series(&self, series_id: i64) -> Result<()> {
        self.post_command(serde_json::json!({
            "name": "RescanSeries",
            "seriesId": series_id,
        }))
        .await
    }

    /// 请求搜索指定分集（按集修复）。
    pub async fn search_episode(&self, episode_id: i64) -> Result<()> {
        self.post_command(serde_json::json!({
            "name": "EpisodeSearch",
            "episodeIds": [episode_id],
        }))
        .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.instance.base_url.trim_end_matches('/'), path);
        debug!(instance = %self.instance.name, %url, "media manager GET");
        let response = self
            .http
            .get(&url)
            .header("X-Api-Key", &self.instance.api_key)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_status(response)?;
        response.json().await.map_err(upstream_error)
    }

    async fn post_command(&self, body: serde_json::Value) -> Result<()> {
        let url = format!(
            "{}/api/v3/command",
            self.instance.base_url.trim_end_matches('/')
        );
        debug!(instance = %self.instance.name, %url, command = %body["name"], "media manager command");
        let response = self
            .http
            .post(&url)
            .header("X-Api-Key", &self.instance.api_key)
            .json(&body)
            .send()
            .await
            .map_err(upstream_error)?;
        check_status(response)?;
        Ok(())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(CoreError::new(
            codes::REPAIR_UPSTREAM,
            format!("media manager replied {status}"),
        ))
    }
}

fn upstream_error(err: reqwest::Error) -> CoreError {
    CoreError::new(codes::REPAIR_UPSTREAM, "media manager request failed").with_cause(err)
}
