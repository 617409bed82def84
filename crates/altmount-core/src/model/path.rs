use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result, codes};

/// 虚拟路径：挂载根下以 `/` 分隔的规范化路径。
///
/// # 设计背景（Why）
/// - 目录在 AltMount 中是隐式的：凡是某描述符路径的前缀且自身不挂描述符的，
///   都是目录。路径因此必须规范化，否则前缀判断与列目录都会出现歧义；
/// - 统一在构造点拒绝 `..`、空分量与反斜杠，后续所有层都可以信任该不变式。
///
/// # 契约说明（What）
/// - 内部表示始终以 `/` 开头、不以 `/` 结尾（根路径 `/` 除外）、无重复分隔符；
/// - `parse` 是唯一的失败入口；其余方法在合法实例上不会产生非法路径。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath(String);

impl VirtualPath {
    /// 挂载根。
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// 解析并规范化一条虚拟路径。
    ///
    /// # 契约说明（What）
    /// - 接受带或不带前导 `/` 的输入；
    /// - 拒绝 `..`、`.`、空分量、反斜杠与 NUL，防止逃逸到描述符树之外。
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.contains('\\') || raw.contains('\0') {
            return Err(CoreError::new(
                codes::PATH_NOT_FOUND,
                format!("illegal character in virtual path: {raw:?}"),
            ));
        }
        let mut parts: Vec<&str> = Vec::new();
        for part in raw.split('/') {
            match part {
                "" => continue,
                "." | ".." => {
                    return Err(CoreError::new(
                        codes::PATH_NOT_FOUND,
                        format!("relative component in virtual path: {raw:?}"),
                    ));
                }
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(format!("/{}", parts.join("/"))))
    }

    /// 以字符串视图读取规范化路径。
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 是否为挂载根。
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// 返回父目录；根路径的父目录仍是根。
    pub fn parent(&self) -> Self {
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self(self.0[..idx].to_string()),
        }
    }

    /// 返回最后一个分量；根路径返回空串。
    pub fn file_name(&self) -> &str {
        if self.is_root() {
            ""
        } else {
            self.0.rsplit('/').next().unwrap_or("")
        }
    }

    /// 追加一个分量；分量自身会被再次规范化校验。
    pub fn join(&self, component: &str) -> Result<Self> {
        if self.is_root() {
            Self::parse(component)
        } else {
            Self::parse(&format!("{}/{}", self.0, component))
        }
    }

    /// 判断 `self` 是否位于 `prefix` 之下（含相等）。
    pub fn starts_with(&self, prefix: &VirtualPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// 返回去掉前缀后的首个分量；`self` 不在前缀下时返回 `None`。
    pub fn child_component_under(&self, prefix: &VirtualPath) -> Option<&str> {
        if !self.starts_with(prefix) || self.0 == prefix.0 {
            return None;
        }
        let rest = if prefix.is_root() {
            &self.0[1..]
        } else {
            &self.0[prefix.0.len() + 1..]
        };
        rest.split('/').next().filter(|part| !part.is_empty())
    }

    /// 迭代全部分量。
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VirtualPath> for String {
    fn from(path: VirtualPath) -> Self {
        path.0
    }
}
