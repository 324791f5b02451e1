//! The slice of the Solidity ABI the oracle contract needs: addresses,
//! uint256, strings, bytes and tuples of those.

use alloy_primitives::{Address, U256, keccak256};

use crate::core::error::OracleError;

pub const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::String(_) | Token::Bytes(_) => true,
            Token::Tuple(items) => items.iter().any(Token::is_dynamic),
            Token::Address(_) | Token::Uint(_) => false,
        }
    }

    fn head_len(&self) -> usize {
        match self {
            Token::Tuple(items) if !self.is_dynamic() => items.iter().map(Token::head_len).sum(),
            _ => WORD,
        }
    }

    fn encode_static(&self, out: &mut Vec<u8>) {
        match self {
            Token::Address(address) => {
                out.extend_from_slice(&[0u8; 12]);
                out.extend_from_slice(address.as_slice());
            }
            Token::Uint(value) => out.extend_from_slice(&value.to_be_bytes::<32>()),
            Token::Tuple(items) => items.iter().for_each(|item| item.encode_static(out)),
            Token::String(_) | Token::Bytes(_) => unreachable!("dynamic token in static position"),
        }
    }

    fn encode_dynamic(&self, out: &mut Vec<u8>) {
        match self {
            Token::String(s) => encode_packed_bytes(s.as_bytes(), out),
            Token::Bytes(b) => encode_packed_bytes(b, out),
            Token::Tuple(items) => out.extend(encode(items)),
            Token::Address(_) | Token::Uint(_) => self.encode_static(out),
        }
    }
}

fn usize_word(value: usize) -> [u8; WORD] {
    U256::from(value).to_be_bytes::<32>()
}

fn encode_packed_bytes(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&usize_word(data.len()));
    out.extend_from_slice(data);
    let padding = (WORD - data.len() % WORD) % WORD;
    out.extend(std::iter::repeat_n(0u8, padding));
}

/// Head/tail encode a parameter list.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_size: usize = tokens.iter().map(Token::head_len).sum();
    let mut head = Vec::with_capacity(head_size);
    let mut tail = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&usize_word(head_size + tail.len()));
            token.encode_dynamic(&mut tail);
        } else {
            token.encode_static(&mut head);
        }
    }
    head.extend(tail);
    head
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut out = selector(signature).to_vec();
    out.extend(encode(tokens));
    out
}

fn malformed(what: &str) -> OracleError {
    OracleError::Malformed(format!("abi: {}", what))
}

pub fn word_at(data: &[u8], offset: usize) -> Result<&[u8], OracleError> {
    offset
        .checked_add(WORD)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| malformed("data shorter than expected"))
}

pub fn decode_address(word: &[u8]) -> Result<Address, OracleError> {
    if word.len() != WORD || word[..12].iter().any(|b| *b != 0) {
        return Err(malformed("invalid address word"));
    }
    Ok(Address::from_slice(&word[12..]))
}

pub fn decode_uint(word: &[u8]) -> Result<U256, OracleError> {
    if word.len() != WORD {
        return Err(malformed("invalid uint word"));
    }
    Ok(U256::from_be_slice(word))
}

fn decode_usize(word: &[u8]) -> Result<usize, OracleError> {
    let value = decode_uint(word)?;
    usize::try_from(value).map_err(|_| malformed("offset or length out of range"))
}

/// Decode a `bytes` parameter whose head word sits at `head_offset` within
/// `data`. Offsets are relative to `base`, the start of the enclosing tuple.
pub fn decode_bytes_at(data: &[u8], base: usize, head_offset: usize) -> Result<Vec<u8>, OracleError> {
    let head = base
        .checked_add(head_offset)
        .ok_or_else(|| malformed("offset overflow"))?;
    let start = base
        .checked_add(decode_usize(word_at(data, head)?)?)
        .ok_or_else(|| malformed("offset overflow"))?;
    let len = decode_usize(word_at(data, start)?)?;
    let body_start = start
        .checked_add(WORD)
        .ok_or_else(|| malformed("offset overflow"))?;
    data.get(body_start..body_start.saturating_add(len))
        .map(<[u8]>::to_vec)
        .ok_or_else(|| malformed("bytes body out of range"))
}

pub fn decode_string_at(data: &[u8], base: usize, head_offset: usize) -> Result<String, OracleError> {
    String::from_utf8(decode_bytes_at(data, base, head_offset)?)
        .map_err(|_| malformed("string is not UTF-8"))
}

/// Decode a dynamic tuple of `n` strings whose head word sits at `head_offset`.
pub fn decode_string_tuple_at(
    data: &[u8],
    head_offset: usize,
    n: usize,
) -> Result<Vec<String>, OracleError> {
    let base = decode_usize(word_at(data, head_offset)?)?;
    (0..n)
        .map(|i| decode_string_at(data, base, i * WORD))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_selectors() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
    }

    #[test]
    fn static_params_are_inline() {
        let encoded = encode(&[Token::Uint(U256::from(7u64)), Token::Address(Address::ZERO)]);
        assert_eq!(encoded.len(), 64);
        assert_eq!(encoded[31], 7);
    }

    #[test]
    fn string_layout_matches_solidity() {
        // abi.encode(uint256(1), "abc")
        let encoded = encode(&[Token::Uint(U256::from(1u64)), Token::String("abc".into())]);
        assert_eq!(encoded.len(), 4 * WORD);
        assert_eq!(decode_uint(word_at(&encoded, 32).unwrap()).unwrap(), U256::from(64u64));
        assert_eq!(decode_uint(word_at(&encoded, 64).unwrap()).unwrap(), U256::from(3u64));
        assert_eq!(&encoded[96..99], b"abc");
        assert_eq!(decode_string_at(&encoded, 0, 32).unwrap(), "abc");
    }

    #[test]
    fn tuple_of_strings_decodes_back() {
        let fields = ["a", "", "ccc", "", "e".repeat(40).as_str()].map(|s| s.to_string());
        let tuple = Token::Tuple(fields.iter().cloned().map(Token::String).collect());
        let encoded = encode(&[Token::Uint(U256::from(9u64)), tuple]);
        let decoded = decode_string_tuple_at(&encoded, WORD, 5).unwrap();
        assert_eq!(decoded, fields.to_vec());
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let mut encoded = encode(&[Token::Bytes(vec![1, 2, 3, 4])]);
        encoded.truncate(WORD * 2 + 2);
        assert!(decode_bytes_at(&encoded, 0, 0).is_err());
    }

    #[test]
    fn huge_offset_is_rejected_not_overflowed() {
        let mut data = usize_word(usize::MAX - 8).to_vec();
        data.extend_from_slice(&[0u8; WORD]);
        assert!(matches!(
            decode_bytes_at(&data, 0, 0),
            Err(OracleError::Malformed(_))
        ));
        assert!(word_at(&data, usize::MAX - 4).is_err());
        assert!(decode_bytes_at(&data, usize::MAX - 40, 0).is_err());
        assert!(decode_bytes_at(&data, usize::MAX, WORD).is_err());
    }

    #[test]
    fn dirty_address_word_is_rejected() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert!(decode_address(&word).is_err());
    }
}
