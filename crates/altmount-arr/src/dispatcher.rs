use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use altmount_core::configuration::{ConfigHandle, MediaKind};
use altmount_core::contract::CallContext;
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::traits::RescanDispatcher;

use crate::client::ArrClient;

/// 修复分发器：把虚拟路径映射到认领它的媒体管理实例并发起重扫。
///
/// # 设计背景（Why）
/// - 每个实例以根目录集合声明自己的管辖范围：路径的最长前缀匹配即归属；
/// - 剧集类实例按路径找不到条目时，从相对路径解析 `SxxEyy` 再按季/集
///   匹配：路径布局经常被整理工具改写，集号不变。
///
/// # 契约说明（What）
/// - 没有任何实例的根目录覆盖目标路径、或覆盖的实例里找不到条目时，
///   返回 `repair.path_match_failed` 哨兵；调用方据此做孤儿清理；
/// - 实例 API 的网络故障映射为 `repair.upstream`（可重试）。
pub struct ArrDispatcher {
    config: Arc<ConfigHandle>,
    http: reqwest::Client,
}

impl ArrDispatcher {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn clients(&self) -> Vec<ArrClient> {
        self.config
            .current()
            .repair
            .instances
            .iter()
            .filter(|instance| instance.enabled)
            .map(|instance| ArrClient::new(self.http.clone(), instance.clone()))
            .collect()
    }
}

#[async_trait]
impl RescanDispatcher for ArrDispatcher {
    async fn trigger_rescan(
        &self,
        ctx: &CallContext,
        path_for_rescan: &str,
        relative_path: &str,
    ) -> Result<()> {
        ctx.ensure_active(std::time::Instant::now())?;
        let clients = self.clients();
        if clients.is_empty() {
            return Err(path_match_failed("no media manager instances configured"));
        }

        // 选择根目录前缀覆盖目标路径的实例（最长前缀优先）。
        let mut owner: Option<(ArrClient, String)> = None;
        for client in clients {
            let folders = match client.root_folders().await {
                Ok(folders) => folders,
                Err(err) => {
                    warn!(instance = client.name(), error = %err, "root folder query failed");
                    continue;
                }
            };
            for folder in folders {
                if path_has_prefix(path_for_rescan, &folder.path) {
                    let better = owner
                        .as_ref()
                        .map(|(_, current)| folder.path.len() > current.len())
                        .unwrap_or(true);
                    if better {
                        owner = Some((client, folder.path));
                        break;
                    }
                }
            }
        }
        let Some((client, root)) = owner else {
            return Err(path_match_failed(path_for_rescan));
        };
        debug!(instance = client.name(), root, "instance claims rescan target");

        match client.kind() {
            MediaKind::Movies => {
                let movies = client.movies().await?;
                let found = movies.iter().find(|item| {
                    item.path
                        .as_deref()
                        .is_some_and(|p| path_has_prefix(path_for_rescan, p))
                });
                match found {
                    Some(item) => {
                        info!(instance = client.name(), movie = item.id, "rescan requested");
                        client.rescan_movie(item.id).await
                    }
                    None => Err(path_match_failed(path_for_rescan)),
                }
            }
            MediaKind::Series => {
                let series = client.series().await?;
                let found = series.iter().find(|item| {
                    item.path
                        .as_deref()
                        .is_some_and(|p| path_has_prefix(path_for_rescan, p))
                });
                if let Some(item) = found {
                    // 先尝试按集修复，失败退回整剧重扫。
                    if let Some((season, episode)) = parse_season_episode(relative_path) {
                        if let Ok(episodes) = client.episodes(item.id).await {
                            if let Some(target) = episodes
                                .iter()
                                .find(|e| e.season_number == season && e.episode_number == episode)
                            {
                                info!(
                                    instance = client.name(),
                                    series = item.id,
                                    episode = target.id,
                                    "episode search requested"
                                );
                                return client.search_episode(target.id).await;
                            }
                        }
                    }
                    info!(instance = client.name(), series = item.id, "series rescan requested");
                    client.rescan_series(item.id).await
                } else {
                    Err(path_match_failed(path_for_rescan))
                }
            }
        }
    }
}

/// 在路径分量边界上做前缀判断。
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// 从相对路径里解析 `SxxEyy` 季/集编号（大小写不敏感）。
pub fn parse_season_episode(relative_path: &str) -> Option<(u32, u32)> {
    let bytes = relative_path.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if !byte.eq_ignore_ascii_case(&b's') {
            continue;
        }
        let rest = &relative_path[idx + 1..];
        let season_digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if season_digits.is_empty() {
            continue;
        }
        let after_season = &rest[season_digits.len()..];
        let Some(after_e) = after_season
            .strip_prefix('e')
            .or_else(|| after_season.strip_prefix('E'))
        else {
            continue;
        };
        let episode_digits: String = after_e.chars().take_while(|c| c.is_ascii_digit()).collect();
        if episode_digits.is_empty() {
            continue;
        }
        let season = season_digits.parse().ok()?;
        let episode = episode_digits.parse().ok()?;
        return Some((season, episode));
    }
    None
}

fn path_match_failed(detail: &str) -> CoreError {
    CoreError::new(
        codes::PATH_MATCH_FAILED,
        format!("path not managed by any instance: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn season_episode_parsing() {
        assert_eq!(parse_season_episode("Show.S01E05.mkv"), Some((1, 5)));
        assert_eq!(parse_season_episode("show.s2024e112.mkv"), Some((2024, 112)));
        assert_eq!(
            parse_season_episode("Season.Pack/s03/Show.S03E11.1080p.mkv"),
            Some((3, 11))
        );
        assert_eq!(parse_season_episode("Movie.2024.mkv"), None);
        assert_eq!(parse_season_episode("sXeY"), None);
    }

    #[test]
    fn season_marker_without_episode_is_skipped() {
        // 首个 `s03` 后面没有集号，应继续扫描后面的 `S03E11`。
        assert_eq!(
            parse_season_episode("s03.pack.S03E11.mkv"),
            Some((3, 11))
        );
    }

    #[test]
    fn prefix_matching_respects_component_boundaries() {
        assert!(path_has_prefix("/data/movies/film.mkv", "/data/movies"));
        assert!(path_has_prefix("/data/movies", "/data/movies/"));
        assert!(!path_has_prefix("/data/movies-extra/f.mkv", "/data/movies"));
        assert!(!path_has_prefix("/data", ""));
    }
}
