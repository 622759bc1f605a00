use sha2::{Digest, Sha256};

pub const DURABLE_PREFIX: &str = "ws";
pub const MAX_DURABLE_LEN: usize = 200;
const PART_LEN: usize = 20;
const HASH_LEN: usize = 16;
const ANONYMOUS_PART: &str = "anon";

/// Stable consumer name for one (identity, stream, filter) triple. The same
/// triple always yields the same name so a reconnecting client resumes where
/// it left off.
pub fn durable_name(identity: &str, stream: &str, filter: &str) -> String {
    let hash = sha256_hex(format!("{identity}:{stream}:{filter}").as_bytes());
    let identity_part = match shorten(&sanitize_name(identity)) {
        part if part.is_empty() => ANONYMOUS_PART.to_string(),
        part => part,
    };
    let stream_part = shorten(&sanitize_name(stream));
    let mut name = format!(
        "{DURABLE_PREFIX}_{identity_part}_{stream_part}_{}",
        &hash[..HASH_LEN]
    );
    name.truncate(MAX_DURABLE_LEN);
    name
}

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn shorten(part: &str) -> String {
    part.chars().take(PART_LEN).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
