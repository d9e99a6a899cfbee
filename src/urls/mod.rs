//! URL 知识仓库：规范化、去重合并、打分排序与多样性截断
//!
//! 所有发现的 URL 在入库前统一规范化（小写 host、去默认端口、去 fragment、
//! 去跟踪参数、折叠重复斜杠、去尾斜杠、解码非保留百分号转义），同一 URL
//! 重复出现只累加 occurrences 与 weight。排序分 = 频次 + 主机名奖惩 +
//! 路径深度 + 可选的外部重排分。

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use url::Url;

/// 主机名命中 boost-list 时的加分
pub const HOSTNAME_BOOST: f32 = 2.0;
/// 主机名命中 bad-list 时的减分
pub const HOSTNAME_PENALTY: f32 = 4.0;
/// 路径深度 0 / 1 / 2 的加分（导航型短路径优先）
pub const PATH_BOOSTS: [f32; 3] = [0.5, 0.3, 0.1];
/// 多样性截断：每个主机名最多保留的 URL 数
pub const MAX_URLS_PER_HOST: usize = 2;
/// 进入 prompt 的排序 URL 上限
pub const TOP_URLS_IN_PROMPT: usize = 20;
/// 响应体返回 URL 数的默认值与硬上限
pub const DEFAULT_MAX_RETURNED_URLS: usize = 100;
pub const HARD_MAX_RETURNED_URLS: usize = 300;

/// 跟踪类查询参数（丢弃）
fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_")
        || matches!(
            key,
            "fbclid" | "gclid" | "gclsrc" | "dclid" | "msclkid" | "igshid" | "mc_cid" | "mc_eid"
        )
}

/// 解码路径中的非保留字符百分号转义（%41 → A 等），其余转义原样保留
fn decode_unreserved(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &path[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                let c = byte as char;
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                    out.push(c);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// 规范化 URL；非法或非 http(s) 返回 None
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;

    url.set_fragment(None);

    // 丢弃跟踪参数；全部丢弃后连 ? 一起去掉
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    // 路径：折叠重复斜杠、去尾斜杠（根路径除外）、解码非保留转义
    let mut path = url.path().to_string();
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    let path = decode_unreserved(&path);
    url.set_path(&path);

    Some(url.to_string())
}

/// 提取规范化 URL 的主机名
pub fn hostname_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|h| h.to_string())
}

/// 主机名匹配：与 pattern 相等，或是其子域名
pub fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

/// 一条已发现的 URL
#[derive(Clone, Debug, Serialize)]
pub struct UrlRecord {
    pub url: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub weight: f32,
    pub occurrences: u32,
}

/// 打分后的 URL（排序与 prompt 展示用）
#[derive(Clone, Debug, Serialize)]
pub struct BoostedUrl {
    #[serde(flatten)]
    pub record: UrlRecord,
    pub freq_boost: f32,
    pub hostname_boost: f32,
    pub path_boost: f32,
    pub rerank_boost: f32,
    pub final_score: f32,
}

/// 主机名策略：allow / deny / boost 三个清单
#[derive(Clone, Debug, Default)]
pub struct HostPolicy {
    pub boost_hostnames: Vec<String>,
    pub bad_hostnames: Vec<String>,
    pub only_hostnames: Vec<String>,
}

impl HostPolicy {
    fn is_bad(&self, host: &str) -> bool {
        self.bad_hostnames.iter().any(|p| host_matches(host, p))
    }

    fn is_boosted(&self, host: &str) -> bool {
        self.boost_hostnames.iter().any(|p| host_matches(host, p))
    }

    fn allowed_by_only_list(&self, host: &str) -> bool {
        self.only_hostnames.is_empty() || self.only_hostnames.iter().any(|p| host_matches(host, p))
    }
}

/// 去重合并的 URL 仓库（key 为规范化 URL）
#[derive(Clone, Debug, Default)]
pub struct UrlStore {
    records: HashMap<String, UrlRecord>,
}

impl UrlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入库：规范化后新增或合并；返回规范化后的 key（非法 URL 返回 None）
    pub fn add(
        &mut self,
        raw_url: &str,
        title: &str,
        description: &str,
        date: Option<String>,
        weight: f32,
    ) -> Option<String> {
        let url = normalize_url(raw_url)?;
        match self.records.get_mut(&url) {
            Some(existing) => {
                existing.occurrences += 1;
                existing.weight += weight;
                if title.len() > existing.title.len() {
                    existing.title = title.to_string();
                }
                if description.len() > existing.description.len() {
                    existing.description = description.to_string();
                }
                if existing.date.is_none() {
                    existing.date = date;
                }
            }
            None => {
                self.records.insert(
                    url.clone(),
                    UrlRecord {
                        url: url.clone(),
                        title: title.to_string(),
                        description: description.to_string(),
                        date,
                        weight,
                        occurrences: 1,
                    },
                );
            }
        }
        Some(url)
    }

    pub fn get(&self, url: &str) -> Option<&UrlRecord> {
        self.records.get(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.records.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all_urls(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// 过滤管线：剔除已访问、bad-list 主机；only-list 非空时仅保留其中主机
    pub fn candidates(&self, visited: &HashSet<String>, policy: &HostPolicy) -> Vec<&UrlRecord> {
        self.records
            .values()
            .filter(|r| !visited.contains(&r.url))
            .filter(|r| {
                let Some(host) = hostname_of(&r.url) else {
                    return false;
                };
                !policy.is_bad(&host) && policy.allowed_by_only_list(&host)
            })
            .collect()
    }
}

/// 打分：freq + hostname + path + rerank 四项合成 final_score，降序排序
pub fn rank_candidates(
    candidates: Vec<&UrlRecord>,
    policy: &HostPolicy,
    rerank_scores: &HashMap<String, f32>,
) -> Vec<BoostedUrl> {
    let mut ranked: Vec<BoostedUrl> = candidates
        .into_iter()
        .map(|r| {
            let host = hostname_of(&r.url).unwrap_or_default();
            let freq_boost = (1.0 + r.occurrences as f32).ln();
            let hostname_boost = if policy.is_boosted(&host) {
                HOSTNAME_BOOST
            } else if policy.is_bad(&host) {
                -HOSTNAME_PENALTY
            } else {
                0.0
            };
            let depth = Url::parse(&r.url)
                .ok()
                .map(|u| u.path().trim_matches('/').split('/').filter(|s| !s.is_empty()).count())
                .unwrap_or(usize::MAX);
            let path_boost = PATH_BOOSTS.get(depth).copied().unwrap_or(0.0);
            let rerank_boost = rerank_scores.get(&r.url).copied().unwrap_or(0.0);
            BoostedUrl {
                record: r.clone(),
                freq_boost,
                hostname_boost,
                path_boost,
                rerank_boost,
                final_score: freq_boost + hostname_boost + path_boost + rerank_boost,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.url.cmp(&b.record.url))
    });
    ranked
}

/// 多样性截断：每个主机名最多保留 MAX_URLS_PER_HOST 条（按分数先到先得）
pub fn diversity_cap(ranked: Vec<BoostedUrl>) -> Vec<BoostedUrl> {
    let mut per_host: HashMap<String, usize> = HashMap::new();
    ranked
        .into_iter()
        .filter(|b| {
            let host = hostname_of(&b.record.url).unwrap_or_default();
            let seen = per_host.entry(host).or_insert(0);
            *seen += 1;
            *seen <= MAX_URLS_PER_HOST
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_capitalization_port_fragment_tracking() {
        let a = normalize_url("HTTP://Example.com:80/a/?utm_source=x#frag").unwrap();
        let b = normalize_url("http://example.com/a/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "http://example.com/a");
    }

    #[test]
    fn test_normalize_root_keeps_slash() {
        assert_eq!(normalize_url("https://example.com").unwrap(), "https://example.com/");
        assert_eq!(normalize_url("https://example.com/").unwrap(), "https://example.com/");
    }

    #[test]
    fn test_normalize_collapses_duplicate_slashes() {
        assert_eq!(
            normalize_url("https://example.com/a//b///c").unwrap(),
            "https://example.com/a/b/c"
        );
    }

    #[test]
    fn test_normalize_decodes_unreserved_escapes() {
        assert_eq!(
            normalize_url("https://example.com/%41bc/%7Euser").unwrap(),
            "https://example.com/Abc/~user"
        );
    }

    #[test]
    fn test_normalize_keeps_meaningful_query() {
        assert_eq!(
            normalize_url("https://example.com/s?q=rust&utm_medium=mail").unwrap(),
            "https://example.com/s?q=rust"
        );
    }

    #[test]
    fn test_normalize_rejects_invalid() {
        assert!(normalize_url("not a url").is_none());
        assert!(normalize_url("ftp://example.com/x").is_none());
        assert!(normalize_url("").is_none());
    }

    #[test]
    fn test_store_merges_same_url() {
        let mut store = UrlStore::new();
        store.add("HTTP://Example.com:80/a/?utm_source=x#frag", "t", "", None, 1.0);
        store.add("http://example.com/a/", "a longer title", "", None, 1.0);

        assert_eq!(store.len(), 1);
        let rec = store.get("http://example.com/a").unwrap();
        assert_eq!(rec.occurrences, 2);
        assert_eq!(rec.weight, 2.0);
        assert_eq!(rec.title, "a longer title");
    }

    #[test]
    fn test_bad_hostname_never_increases_candidates() {
        let mut store = UrlStore::new();
        store.add("https://good.com/a", "", "", None, 1.0);
        store.add("https://spam.com/b", "", "", None, 1.0);

        let visited = HashSet::new();
        let open = store.candidates(&visited, &HostPolicy::default());
        let restricted = store.candidates(
            &visited,
            &HostPolicy {
                bad_hostnames: vec!["spam.com".to_string()],
                ..Default::default()
            },
        );
        assert!(restricted.len() < open.len());
        assert!(restricted.iter().all(|r| !r.url.contains("spam.com")));
    }

    #[test]
    fn test_only_list_restricts_hosts() {
        let mut store = UrlStore::new();
        store.add("https://a.com/x", "", "", None, 1.0);
        store.add("https://sub.b.com/y", "", "", None, 1.0);

        let visited = HashSet::new();
        let policy = HostPolicy {
            only_hostnames: vec!["b.com".to_string()],
            ..Default::default()
        };
        let candidates = store.candidates(&visited, &policy);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].url.contains("sub.b.com"));
    }

    #[test]
    fn test_boosted_host_outranks_equal_frequency() {
        let mut store = UrlStore::new();
        store.add("https://example.com/news", "", "", None, 1.0);
        store.add("https://other.com/news", "", "", None, 1.0);

        let visited = HashSet::new();
        let policy = HostPolicy {
            boost_hostnames: vec!["example.com".to_string()],
            ..Default::default()
        };
        let ranked = rank_candidates(store.candidates(&visited, &policy), &policy, &HashMap::new());
        assert!(ranked[0].record.url.contains("example.com"));
        assert!(ranked[0].final_score > ranked[1].final_score);
    }

    #[test]
    fn test_frequency_boost_orders_repeats_first() {
        let mut store = UrlStore::new();
        for _ in 0..3 {
            store.add("https://a.com/popular", "", "", None, 1.0);
        }
        store.add("https://b.com/rare", "", "", None, 1.0);

        let visited = HashSet::new();
        let policy = HostPolicy::default();
        let ranked = rank_candidates(store.candidates(&visited, &policy), &policy, &HashMap::new());
        assert!(ranked[0].record.url.contains("popular"));
    }

    #[test]
    fn test_diversity_cap_two_per_host() {
        let mut store = UrlStore::new();
        for i in 0..5 {
            store.add(&format!("https://big.com/p{i}"), "", "", None, 1.0);
        }
        store.add("https://small.com/only", "", "", None, 1.0);

        let visited = HashSet::new();
        let policy = HostPolicy::default();
        let capped = diversity_cap(rank_candidates(
            store.candidates(&visited, &policy),
            &policy,
            &HashMap::new(),
        ));
        let big_count = capped.iter().filter(|b| b.record.url.contains("big.com")).count();
        assert_eq!(big_count, MAX_URLS_PER_HOST);
        assert_eq!(capped.len(), MAX_URLS_PER_HOST + 1);
    }

    #[test]
    fn test_rerank_scores_feed_final_score() {
        let mut store = UrlStore::new();
        store.add("https://a.com/x", "", "", None, 1.0);
        store.add("https://b.com/y", "", "", None, 1.0);

        let mut scores = HashMap::new();
        scores.insert("https://b.com/y".to_string(), 5.0f32);
        let visited = HashSet::new();
        let policy = HostPolicy::default();
        let ranked = rank_candidates(store.candidates(&visited, &policy), &policy, &scores);
        assert!(ranked[0].record.url.contains("b.com"));
        assert_eq!(ranked[0].rerank_boost, 5.0);
    }
}
