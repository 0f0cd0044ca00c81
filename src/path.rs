/// 规范化虚拟路径：统一分隔符，折叠重复的 `/`，去掉 `.`，保证以 `/` 开头且
/// 除根目录外不以 `/` 结尾。`..` 不在这里处理，调用方需先用
/// [`has_parent_segment`] 拒绝。
pub fn standardize_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    for segment in raw.split(['/', '\\']) {
        if segment.is_empty() || segment == "." {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// 任意一段等于 `..` 即视为越界访问（`a..b` 这样的文件名是合法的）
pub fn has_parent_segment(raw: &str) -> bool {
    raw.split(['/', '\\']).any(|segment| segment == "..")
}

/// 拼接两个路径并重新规范化
pub fn join_path(base: &str, rest: &str) -> String {
    standardize_path(&format!("{}/{}", base, rest))
}

/// 判断规范化后的 `path` 是否位于挂载点 `mount` 之下（含挂载点本身）
pub fn is_under(path: &str, mount: &str) -> bool {
    if mount == "/" {
        return true;
    }
    path == mount
        || (path.starts_with(mount) && path.as_bytes().get(mount.len()) == Some(&b'/'))
}

/// 去掉挂载点前缀，返回挂载点内部的路径（始终以 `/` 开头）
pub fn strip_mount(path: &str, mount: &str) -> String {
    if mount == "/" {
        return path.to_string();
    }
    match path.strip_prefix(mount) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    }
}

/// 从自身开始依次返回所有祖先路径，最后一个是 `/`
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = match current.rfind('/') {
            _ if current == "/" => None,
            Some(0) => Some("/"),
            Some(idx) => Some(&current[..idx]),
            None => None,
        };
        Some(current)
    })
}
