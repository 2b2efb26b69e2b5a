//! Maps business identifiers onto resource keys.
//!
//! The mapping decides which lock protects which shard, so it must give the same answer in
//! every implementation: identifiers ending in two digits use that number, everything else a
//! 32-bit string hash over UTF-16 code units (`h = h * 31 + unit`, wrapping).

/// Index used whenever no meaningful partition can be derived.
pub const DEFAULT_INDEX: usize = 0;

/// Partition index of `id` in `[0, partitions)`. Total: zero partitions yield [`DEFAULT_INDEX`].
pub fn derive_key(id: &str, partitions: usize) -> usize {
    if partitions == 0 {
        return DEFAULT_INDEX;
    }
    let chars: Vec<char> = id.chars().collect();
    let tail = &chars[chars.len().saturating_sub(2)..];
    if !tail.is_empty() && tail.iter().all(char::is_ascii_digit) {
        let n = tail
            .iter()
            .filter_map(|c| c.to_digit(10))
            .fold(0usize, |acc, d| acc * 10 + d as usize);
        return n % partitions;
    }
    string_hash(id).unsigned_abs() as usize % partitions
}

/// 32-bit string hash, identical to Java's `String::hashCode`.
pub fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Turns identifiers into resource key strings, `"{prefix}-{index}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitioner {
    partitions: usize,
    prefix: String,
}

impl Partitioner {
    pub fn new(partitions: usize, prefix: impl Into<String>) -> Self {
        Self {
            partitions,
            prefix: prefix.into(),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn index(&self, id: &str) -> usize {
        derive_key(id, self.partitions)
    }

    pub fn resource_key(&self, id: &str) -> String {
        format!("{}-{}", self.prefix, self.index(id))
    }
}
