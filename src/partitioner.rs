//! Partitioners and ring tokens
//!
//! A partitioner maps keys to ring positions. The cluster manager never hashes
//! keys itself; it only needs each partitioner's ring shape to hand out
//! balanced `initial_token`s when vnodes are disabled.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

const MURMUR3_CLASS: &str = "org.apache.cassandra.dht.Murmur3Partitioner";
const RANDOM_CLASS: &str = "org.apache.cassandra.dht.RandomPartitioner";
const BYTE_ORDERED_CLASS: &str = "org.apache.cassandra.dht.ByteOrderedPartitioner";
const ORDER_PRESERVING_CLASS: &str = "org.apache.cassandra.dht.OrderPreservingPartitioner";

/// Offset added to every token of the n-th datacenter so that balanced
/// per-datacenter rings never collide
pub const DATACENTER_TOKEN_OFFSET: i128 = 100;

/// Supported Cassandra partitioners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Partitioner {
    /// Murmur3 hash, signed 64-bit ring
    Murmur3,
    /// MD5 hash, ring of size 2^127
    Random,
    /// Raw key bytes
    ByteOrdered,
    /// Raw key strings (legacy)
    OrderPreserving,
}

impl Partitioner {
    /// Fully qualified Java class name written to cassandra.yaml
    pub fn class_name(&self) -> &'static str {
        match self {
            Partitioner::Murmur3 => MURMUR3_CLASS,
            Partitioner::Random => RANDOM_CLASS,
            Partitioner::ByteOrdered => BYTE_ORDERED_CLASS,
            Partitioner::OrderPreserving => ORDER_PRESERVING_CLASS,
        }
    }

    /// Short name of the partitioner
    pub fn name(&self) -> &'static str {
        match self {
            Partitioner::Murmur3 => "Murmur3Partitioner",
            Partitioner::Random => "RandomPartitioner",
            Partitioner::ByteOrdered => "ByteOrderedPartitioner",
            Partitioner::OrderPreserving => "OrderPreservingPartitioner",
        }
    }

    /// Size of the ring for hashing partitioners
    pub fn ring_modulus(&self) -> Option<u128> {
        match self {
            Partitioner::Murmur3 => Some(1u128 << 64),
            Partitioner::Random => Some(1u128 << 127),
            Partitioner::ByteOrdered => Some(1u128 << 64),
            Partitioner::OrderPreserving => None,
        }
    }

    /// Evenly spaced tokens for `count` nodes in a single ring.
    ///
    /// Token `i` is `i * (ring / count)`; Murmur3 tokens are shifted into the
    /// signed range. Returns `None` for partitioners without a numeric ring.
    pub fn balanced_tokens(&self, count: usize) -> Option<Vec<Token>> {
        let modulus = self.ring_modulus()?;
        if count == 0 {
            return Some(Vec::new());
        }
        let step = modulus / count as u128;
        let tokens = (0..count as u128)
            .map(|i| {
                let position = i * step;
                match self {
                    Partitioner::Murmur3 => Token::Numeric(position as i128 - (1i128 << 63)),
                    Partitioner::ByteOrdered => {
                        Token::Bytes((position as u64).to_be_bytes().to_vec())
                    }
                    _ => Token::Numeric(position as i128),
                }
            })
            .collect();
        Some(tokens)
    }

    /// Balanced tokens for nodes laid out datacenter by datacenter.
    ///
    /// Each datacenter gets its own balanced ring, offset by
    /// [`DATACENTER_TOKEN_OFFSET`] per datacenter index.
    pub fn balanced_tokens_across_dcs(&self, counts: &[usize]) -> Option<Vec<Token>> {
        let mut tokens = Vec::with_capacity(counts.iter().sum());
        for (dc_index, &count) in counts.iter().enumerate() {
            let offset = DATACENTER_TOKEN_OFFSET * dc_index as i128;
            tokens.extend(
                self.balanced_tokens(count)?
                    .into_iter()
                    .map(|t| t.offset(offset)),
            );
        }
        Some(tokens)
    }
}

impl fmt::Display for Partitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_name())
    }
}

impl FromStr for Partitioner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.rsplit('.').next().unwrap_or(s).to_ascii_lowercase();
        match short.as_str() {
            "murmur3partitioner" | "murmur3" => Ok(Partitioner::Murmur3),
            "randompartitioner" | "random" => Ok(Partitioner::Random),
            "byteorderedpartitioner" | "byteordered" => Ok(Partitioner::ByteOrdered),
            "orderpreservingpartitioner" | "orderpreserving" => Ok(Partitioner::OrderPreserving),
            _ => Err(Error::Argument(format!("unknown partitioner {}", s))),
        }
    }
}

impl TryFrom<String> for Partitioner {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Partitioner> for String {
    fn from(p: Partitioner) -> Self {
        p.class_name().to_string()
    }
}

/// Prefix marking byte tokens in persisted documents, where bare hex made of
/// digits only would read back as a numeric token
const BYTES_PREFIX: &str = "0x";

/// A position on the ring, as written to `initial_token`.
///
/// `Display` gives the form Cassandra expects; the serde form prefixes byte
/// tokens with `0x` so every token reloads as the same variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Token {
    /// Murmur3 / Random tokens
    Numeric(i128),
    /// ByteOrdered tokens, rendered as hex
    Bytes(Vec<u8>),
}

impl Token {
    /// Shift a token by `delta`; byte tokens are treated as big-endian integers
    pub fn offset(self, delta: i128) -> Token {
        match self {
            Token::Numeric(v) => Token::Numeric(v + delta),
            Token::Bytes(bytes) => {
                let mut padded = [0u8; 16];
                let len = bytes.len().min(16);
                padded[16 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
                let shifted = u128::from_be_bytes(padded).wrapping_add(delta as u128);
                let width = bytes.len().clamp(1, 16);
                Token::Bytes(shifted.to_be_bytes()[16 - width..].to_vec())
            }
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Numeric(v) => write!(f, "{}", v),
            Token::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Token {
    type Err = Error;

    /// `0x`-prefixed strings and non-decimal strings are even-length hex byte
    /// tokens; canonical decimal strings are numeric tokens
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix(BYTES_PREFIX) {
            return parse_hex(hex);
        }
        if let Ok(v) = s.parse::<i128>() {
            if v.to_string() == s {
                return Ok(Token::Numeric(v));
            }
        }
        parse_hex(s)
    }
}

fn parse_hex(s: &str) -> Result<Token, Error> {
    if s.is_empty() || s.len() % 2 != 0 || !s.is_ascii() {
        return Err(Error::Argument(format!("invalid token {}", s)));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .map(Token::Bytes)
        .map_err(|_| Error::Argument(format!("invalid token {}", s)))
}

impl TryFrom<String> for Token {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Token> for String {
    fn from(t: Token) -> Self {
        match t {
            Token::Numeric(_) => t.to_string(),
            Token::Bytes(_) => format!("{}{}", BYTES_PREFIX, t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn numeric(tokens: &[Token]) -> Vec<i128> {
        tokens
            .iter()
            .map(|t| match t {
                Token::Numeric(v) => *v,
                other => panic!("unexpected token {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_parse_partitioner_names() {
        let murmur3 = "org.apache.cassandra.dht.Murmur3Partitioner";
        assert_eq!(murmur3.parse::<Partitioner>().unwrap(), Partitioner::Murmur3);
        assert_eq!("RandomPartitioner".parse::<Partitioner>().unwrap(), Partitioner::Random);
        assert_eq!("byteordered".parse::<Partitioner>().unwrap(), Partitioner::ByteOrdered);
        assert!("Md5".parse::<Partitioner>().is_err());
    }

    #[test]
    fn test_murmur3_tokens_are_balanced() {
        for n in 1..=12usize {
            let tokens = numeric(&Partitioner::Murmur3.balanced_tokens(n).unwrap());
            assert_eq!(tokens.len(), n);
            assert_eq!(tokens[0], i64::MIN as i128);

            let distinct: HashSet<_> = tokens.iter().collect();
            assert_eq!(distinct.len(), n);

            let mut sorted = tokens.clone();
            sorted.sort();
            let arc = (1i128 << 64) / n as i128;
            for pair in sorted.windows(2) {
                assert_eq!(pair[1] - pair[0], arc);
            }
            // Closing arc differs from the others only by the division remainder
            let closing = (1i128 << 63) - sorted[n - 1];
            assert!((closing - arc).abs() < n as i128);
            assert!(sorted.iter().all(|t| *t >= i64::MIN as i128 && *t <= i64::MAX as i128));
        }
    }

    #[test]
    fn test_random_tokens_are_balanced() {
        let tokens = numeric(&Partitioner::Random.balanced_tokens(3).unwrap());
        let step = (1i128 << 127) / 3;
        assert_eq!(tokens, vec![0, step, 2 * step]);
    }

    #[test]
    fn test_byte_ordered_tokens_sort_like_the_ring() {
        let tokens = Partitioner::ByteOrdered.balanced_tokens(4).unwrap();
        let rendered: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["0000000000000000", "4000000000000000", "8000000000000000", "c000000000000000"]
        );
        let mut sorted = tokens.clone();
        sorted.sort();
        assert_eq!(sorted, tokens);
    }

    #[test]
    fn test_order_preserving_has_no_numeric_ring() {
        assert!(Partitioner::OrderPreserving.balanced_tokens(3).is_none());
    }

    #[test]
    fn test_tokens_across_dcs_are_offset() {
        let tokens = numeric(&Partitioner::Murmur3.balanced_tokens_across_dcs(&[2, 2]).unwrap());
        let single = numeric(&Partitioner::Murmur3.balanced_tokens(2).unwrap());
        assert_eq!(tokens[..2], single[..]);
        assert_eq!(tokens[2], single[0] + 100);
        assert_eq!(tokens[3], single[1] + 100);

        let distinct: HashSet<_> = tokens.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_token_string_forms() {
        let min = "-9223372036854775808".parse::<Token>().unwrap();
        assert_eq!(min, Token::Numeric(i64::MIN as i128));
        assert_eq!("00ff".parse::<Token>().unwrap(), Token::Bytes(vec![0, 255]));
        assert!("abc".parse::<Token>().is_err());
        assert_eq!("0000".parse::<Token>().unwrap().to_string(), "0000");
        assert_eq!(Token::Bytes(vec![0x00, 0xff]).offset(1).to_string(), "0100");
        assert_eq!("0x10".parse::<Token>().unwrap(), Token::Bytes(vec![0x10]));
        assert!("0x1".parse::<Token>().is_err());
    }

    #[test]
    fn test_byte_tokens_persist_as_bytes() {
        let tokens = Partitioner::ByteOrdered.balanced_tokens(4).unwrap();
        let text = serde_yaml::to_string(&tokens).unwrap();
        assert!(text.contains("0x4000000000000000"));
        let back: Vec<Token> = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, tokens);

        let short = Token::Bytes(vec![0x10]);
        let back: Token = serde_yaml::from_str(&serde_yaml::to_string(&short).unwrap()).unwrap();
        assert_eq!(back, short);
        assert_eq!(short.to_string(), "10");

        let numeric = Token::Numeric(-42);
        assert_eq!(String::from(numeric), "-42");
    }
}
