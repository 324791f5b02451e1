//! Calldata for the oracle contract's methods.

use alloy_primitives::{Address, U256};

use crate::core::abi::{self, Token};
use crate::core::error::OracleError;
use crate::core::model::CidBundle;

pub const ORACLE: &str = "oracle()";
pub const SET_ORACLE: &str = "setOracle(address)";
pub const SUBMIT_ANSWER: &str = "submitAnswer(uint256,(string,string,string,string,string))";
pub const SUBMIT_BRANCH: &str = "submitBranch(uint256,(string,string,string,string,string))";
pub const SUBMIT_METADATA: &str = "submitMetadata(uint256,string)";

fn bundle_token(bundle: &CidBundle) -> Token {
    Token::Tuple(
        bundle
            .fields()
            .iter()
            .map(|cid| Token::String(cid.to_string()))
            .collect(),
    )
}

pub fn oracle() -> Vec<u8> {
    abi::encode_call(ORACLE, &[])
}

pub fn set_oracle(oracle: Address) -> Vec<u8> {
    abi::encode_call(SET_ORACLE, &[Token::Address(oracle)])
}

pub fn submit_answer(job_id: U256, bundle: &CidBundle) -> Vec<u8> {
    abi::encode_call(SUBMIT_ANSWER, &[Token::Uint(job_id), bundle_token(bundle)])
}

pub fn submit_branch(conversation_id: U256, bundle: &CidBundle) -> Vec<u8> {
    abi::encode_call(
        SUBMIT_BRANCH,
        &[Token::Uint(conversation_id), bundle_token(bundle)],
    )
}

pub fn submit_metadata(conversation_id: U256, metadata_cid: &str) -> Vec<u8> {
    abi::encode_call(
        SUBMIT_METADATA,
        &[
            Token::Uint(conversation_id),
            Token::String(metadata_cid.to_string()),
        ],
    )
}

pub fn decode_oracle(returned: &[u8]) -> Result<Address, OracleError> {
    abi::decode_address(abi::word_at(returned, 0)?)
}

/// Inverse of [`submit_answer`] / [`submit_branch`] arguments, for callers
/// that inspect submitted calldata.
pub fn decode_bundle_call(calldata: &[u8]) -> Result<(U256, CidBundle), OracleError> {
    let params = calldata
        .get(4..)
        .ok_or_else(|| OracleError::Malformed("calldata shorter than a selector".to_string()))?;
    let id = abi::decode_uint(abi::word_at(params, 0)?)?;
    let fields = abi::decode_string_tuple_at(params, abi::WORD, 5)?;
    let [conversation_cid, metadata_cid, prompt_message_cid, answer_message_cid, search_delta_cid]: [String; 5] =
        fields
            .try_into()
            .map_err(|_| OracleError::Malformed("bundle must have 5 fields".to_string()))?;
    Ok((
        id,
        CidBundle {
            conversation_cid,
            metadata_cid,
            prompt_message_cid,
            answer_message_cid,
            search_delta_cid,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_answer_calldata_decodes_back() {
        let bundle = CidBundle {
            conversation_cid: "bafy-conv".into(),
            answer_message_cid: "bafy-answer".into(),
            ..Default::default()
        };
        let calldata = submit_answer(U256::from(77u64), &bundle);
        assert_eq!(&calldata[..4], &abi::selector(SUBMIT_ANSWER));
        let (job, back) = decode_bundle_call(&calldata).unwrap();
        assert_eq!(job, U256::from(77u64));
        assert_eq!(back, bundle);
    }

    #[test]
    fn set_oracle_is_selector_plus_one_word() {
        let calldata = set_oracle(Address::repeat_byte(0xab));
        assert_eq!(calldata.len(), 4 + 32);
        assert_eq!(decode_oracle(&calldata[4..]).unwrap(), Address::repeat_byte(0xab));
    }

    #[test]
    fn submit_metadata_carries_cid_string() {
        let calldata = submit_metadata(U256::from(5u64), "bafy-meta");
        assert_eq!(
            abi::decode_string_at(&calldata[4..], 0, abi::WORD).unwrap(),
            "bafy-meta"
        );
    }
}
