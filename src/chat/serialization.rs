//! 序列化与消息 ID 工具
//!
//! 服务器下发的 ID 可能是数字也可能是字符串，这里在反序列化边界统一转成字符串，
//! 下游只做字符串比较。

use flate2::read::GzDecoder;
use serde::Deserialize;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

/// 临时消息 ID 前缀（乐观发送时由客户端生成）
pub const TEMP_ID_PREFIX: &str = "temp-";

/// 仅存在于本地的消息 ID 前缀（例如情绪变化附带的系统提示），不参与分页计数
pub const LOCAL_ID_PREFIX: &str = "local-";

/// 分段消息 ID 分隔符：`<baseId>-part-<n>`
pub const PART_SEPARATOR: &str = "-part-";

static TEMP_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Int(i64),
    Uint(u64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Str(s) => s,
            RawId::Int(n) => n.to_string(),
            RawId::Uint(n) => n.to_string(),
        }
    }
}

/// ID 反序列化函数（数字或字符串均转为字符串）
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: RawId = Deserialize::deserialize(deserializer)?;
    Ok(raw.into())
}

/// 可选 ID 反序列化函数（支持 null 值）
pub fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<RawId> = Deserialize::deserialize(deserializer)?;
    Ok(raw.map(Into::into))
}

/// 生成临时消息 ID（同一毫秒内也保证唯一）
pub fn generate_temp_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = TEMP_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}{}-{}", TEMP_ID_PREFIX, millis, seq)
}

/// 是否为客户端临时 ID
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// 生成本地消息 ID
pub fn generate_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// 构造分段 ID
pub fn part_id(base_id: &str, index: usize) -> String {
    format!("{}{}{}", base_id, PART_SEPARATOR, index)
}

/// 去掉末尾的 `-part-<n>` 后缀；多层后缀全部去掉，因此 `base_id` 是幂等的
pub fn base_id(id: &str) -> &str {
    let mut current = id;
    while let Some((head, _)) = split_part_suffix(current) {
        current = head;
    }
    current
}

/// 分段序号（非分段 ID 返回 None）
pub fn part_index(id: &str) -> Option<usize> {
    split_part_suffix(id).map(|(_, n)| n)
}

fn split_part_suffix(id: &str) -> Option<(&str, usize)> {
    let pos = id.rfind(PART_SEPARATOR)?;
    let (head, tail) = id.split_at(pos);
    let digits = &tail[PART_SEPARATOR.len()..];
    if head.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|n| (head, n))
}

/// 解压 gzip 数据
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// 是否带 gzip 魔数
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn base_id_is_idempotent() {
        for id in [
            "42",
            "temp-1700000000000-3",
            "abc-part-2",
            "abc-part-1-part-0",
            "x-part-",
            "-part-3",
            "a-part-b",
        ] {
            let once = base_id(id);
            assert_eq!(once, base_id(once), "id={}", id);
        }
        assert_eq!(base_id("abc-part-2"), "abc");
        assert_eq!(base_id("abc-part-1-part-0"), "abc");
        assert_eq!(base_id("x-part-"), "x-part-");
        assert_eq!(base_id("-part-3"), "-part-3");
        assert_eq!(base_id("a-part-b"), "a-part-b");
    }

    #[test]
    fn part_helpers() {
        let id = part_id("99", 3);
        assert_eq!(id, "99-part-3");
        assert_eq!(part_index(&id), Some(3));
        assert_eq!(part_index("99"), None);
    }

    #[test]
    fn temp_ids_are_unique() {
        let a = generate_temp_id();
        let b = generate_temp_id();
        assert_ne!(a, b);
        assert!(is_temp_id(&a));
        assert!(!is_temp_id("42"));
        assert!(is_local_id(&generate_local_id()));
    }

    #[test]
    fn ids_normalize_to_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_id")]
            id: String,
        }
        let n: Wrapper = serde_json::from_str(r#"{"id": 42}"#).unwrap();
        let s: Wrapper = serde_json::from_str(r#"{"id": "42"}"#).unwrap();
        assert_eq!(n.id, "42");
        assert_eq!(n.id, s.id);
    }

    #[test]
    fn gzip_frames_decompress() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"type\":\"x\"}").unwrap();
        let data = encoder.finish().unwrap();
        assert!(is_gzip(&data));
        assert_eq!(decompress_gzip(&data).unwrap(), b"{\"type\":\"x\"}");
    }
}
