/// 从报文主题中恢复规范文件名。
///
/// # 执行逻辑（How）
/// 1. 优先取第一个带点号的引号包裹串（Usenet 惯例：`[1/3] "movie.mkv" yEnc`）；
/// 2. 退而扫描空白分隔的词元，取第一个形如 `name.ext` 的候选；
/// 3. 都找不到时返回 `None`，调用方改用 yEnc 头探测。
pub fn filename_from_subject(subject: &str) -> Option<String> {
    let mut rest = subject;
    while let Some(open) = rest.find('"') {
        let tail = &rest[open + 1..];
        let Some(close) = tail.find('"') else { break };
        let candidate = tail[..close].trim();
        if looks_like_filename(candidate) {
            return Some(candidate.to_string());
        }
        rest = &tail[close + 1..];
    }

    subject
        .split_whitespace()
        .find(|token| looks_like_filename(token))
        .map(|token| token.trim_matches(['(', ')', '[', ']']).to_string())
        .filter(|token| looks_like_filename(token))
}

fn looks_like_filename(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.contains('/') || candidate.contains('\\') {
        return false;
    }
    let Some((stem, ext)) = candidate.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty()
        && (2..=4).contains(&ext.len())
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 把任意名字整形为安全的路径分量：剔除分隔符与控制字符，压掉前导点。
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// RAR 分卷的规范排序键：`(集合名, 卷序)`。
///
/// # 契约说明（What）
/// - `name.rar` → 卷序 0；`name.r00` → 1、`name.r01` → 2、……；
/// - `name.part01.rar` → 1、`name.part02.rar` → 2、……；
/// - 非 RAR 命名返回 `None`。
pub fn rar_sort_key(name: &str) -> Option<(String, u32)> {
    let lower = name.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix(".rar") {
        // part 卷样式：`<set>.partNN.rar`。
        if let Some((set, part)) = stem.rsplit_once(".part") {
            if !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()) {
                return Some((set.to_string(), part.parse().unwrap_or(u32::MAX)));
            }
        }
        return Some((stem.to_string(), 0));
    }
    // 老式分卷：`<set>.rNN`。
    if let Some((set, ext)) = lower.rsplit_once('.') {
        if let Some(digits) = ext.strip_prefix('r') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                let index: u32 = digits.parse().unwrap_or(u32::MAX - 1);
                return Some((set.to_string(), index + 1));
            }
        }
    }
    None
}

/// 在一组文件名里找 RAR 集合的首卷（按规范排序）。
pub fn rar_first(names: &[String]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| rar_sort_key(name).map(|key| (key, name)))
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, name)| name.clone())
}

/// 从来源路径推导释出名（去扩展名的文件主干）。
pub fn release_name_from_path(path: &str) -> Option<String> {
    let stem = std::path::Path::new(path).file_stem()?.to_str()?;
    let trimmed = stem.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_filename_wins() {
        assert_eq!(
            filename_from_subject(r#"[01/34] - "Some.Release.2024.mkv" yEnc (1/89)"#).as_deref(),
            Some("Some.Release.2024.mkv")
        );
    }

    #[test]
    fn bare_token_fallback() {
        assert_eq!(
            filename_from_subject("Some.Release.2024.mkv yEnc (1/89)").as_deref(),
            Some("Some.Release.2024.mkv")
        );
        assert_eq!(filename_from_subject("obfuscated yEnc post"), None);
    }

    #[test]
    fn quoted_garbage_does_not_block_fallback() {
        assert_eq!(
            filename_from_subject(r#""no-extension-here" real.file.avi yEnc"#).as_deref(),
            Some("real.file.avi")
        );
    }

    #[test]
    fn component_sanitisation() {
        assert_eq!(sanitize_component("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_component(".hidden"), "hidden");
        assert_eq!(sanitize_component("   "), "unnamed");
        assert_eq!(sanitize_component("name\twith\nctrl"), "name_with_ctrl");
    }

    #[test]
    fn rar_ordering_new_style() {
        let names: Vec<String> = vec![
            "set.part03.rar".into(),
            "set.part01.rar".into(),
            "set.part02.rar".into(),
        ];
        assert_eq!(rar_first(&names).as_deref(), Some("set.part01.rar"));
    }

    #[test]
    fn rar_ordering_old_style() {
        let names: Vec<String> = vec![
            "set.r01".into(),
            "set.rar".into(),
            "set.r00".into(),
        ];
        // `.rar < .r00 < .r01`。
        assert_eq!(rar_first(&names).as_deref(), Some("set.rar"));
        assert_eq!(rar_sort_key("set.rar"), Some(("set".into(), 0)));
        assert_eq!(rar_sort_key("set.r00"), Some(("set".into(), 1)));
        assert_eq!(rar_sort_key("set.r01"), Some(("set".into(), 2)));
    }

    #[test]
    fn non_rar_names_are_ignored() {
        assert_eq!(rar_sort_key("movie.mkv"), None);
        assert_eq!(rar_sort_key("notes.rtf"), None);
        assert_eq!(rar_first(&["a.mkv".into(), "b.nfo".into()]), None);
    }

    #[test]
    fn release_name_from_nzb_path() {
        assert_eq!(
            release_name_from_path("/watch/Some.Release.2024.nzb").as_deref(),
            Some("Some.Release.2024")
        );
    }
}
