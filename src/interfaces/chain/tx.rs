//! EIP-1559 (type 2) transaction encoding and signing.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_rlp::{BufMut, Encodable, Header, length_of_length};

use crate::core::crypto::{OracleKeypair, RecoverableSignature};
use crate::core::error::OracleError;

const EIP1559_TX_TYPE: u8 = 0x02;
const EMPTY_ACCESS_LIST_RLP_LEN: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eip1559Tx {
    pub chain_id: U256,
    pub nonce: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas_limit: U256,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Eip1559Tx {
    fn fields_length(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.max_priority_fee_per_gas.length()
            + self.max_fee_per_gas.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + EMPTY_ACCESS_LIST_RLP_LEN
    }

    fn encode_fields(&self, out: &mut dyn BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(out);
    }

    /// Hash the signer commits to: `keccak256(0x02 || rlp(fields))`.
    pub fn signing_hash(&self) -> B256 {
        keccak256(typed(alloy_rlp::encode(self)))
    }

    pub fn sign(&self, keypair: &OracleKeypair) -> Result<SignedTx, OracleError> {
        let signature = keypair.sign_prehash(&self.signing_hash())?;
        let raw = typed(alloy_rlp::encode(SignedFields {
            tx: self,
            signature: &signature,
        }));
        Ok(SignedTx {
            hash: keccak256(&raw),
            raw,
        })
    }
}

impl Encodable for Eip1559Tx {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.fields_length(),
        }
        .encode(out);
        self.encode_fields(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.fields_length();
        payload_length + length_of_length(payload_length)
    }
}

struct SignedFields<'a> {
    tx: &'a Eip1559Tx,
    signature: &'a RecoverableSignature,
}

impl SignedFields<'_> {
    fn payload_length(&self) -> usize {
        self.tx.fields_length()
            + self.signature.y_parity.length()
            + self.signature.r.length()
            + self.signature.s.length()
    }
}

impl Encodable for SignedFields<'_> {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.tx.encode_fields(out);
        self.signature.y_parity.encode(out);
        self.signature.r.encode(out);
        self.signature.s.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + length_of_length(payload_length)
    }
}

fn typed(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(EIP1559_TX_TYPE);
    out.extend_from_slice(&payload);
    out
}

#[derive(Debug, Clone)]
pub struct SignedTx {
    pub hash: B256,
    pub raw: Vec<u8>,
}
