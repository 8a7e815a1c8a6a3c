//! Address keys derived from output scripts.

use bitcoin::Script;
use bitcoin::hashes::{Hash, hash160};

const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

/// Output script classification, tagged with the numeric code stored as the
/// first byte of every address key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScriptType {
    P2pkh = 0,
    P2sh = 1,
    PubKey = 2,
    NullData = 3,
    Multisig = 4,
    P2wpkh = 5,
    P2wsh = 6,
    NonStandard = 7,
    P2tr = 9,
}

impl ScriptType {
    pub fn classify(script: &Script) -> Self {
        if script.is_p2pkh() {
            Self::P2pkh
        } else if script.is_p2sh() {
            Self::P2sh
        } else if script.is_p2pk() {
            Self::PubKey
        } else if script.is_op_return() {
            Self::NullData
        } else if script.is_p2wpkh() {
            Self::P2wpkh
        } else if script.is_p2wsh() {
            Self::P2wsh
        } else if script.is_p2tr() {
            Self::P2tr
        } else if is_bare_multisig(script.as_bytes()) {
            Self::Multisig
        } else {
            Self::NonStandard
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

fn is_bare_multisig(bytes: &[u8]) -> bool {
    matches!(
        (bytes.first(), bytes.last()),
        (Some(m), Some(&OP_CHECKMULTISIG)) if (OP_1..=OP_16).contains(m)
    ) && bytes.len() > 3
}

/// Address key: the script type tag followed by the address hash, or by the
/// raw script when the script carries no hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    script_type: ScriptType,
    key: Vec<u8>,
    p2pk_script: Option<Vec<u8>>,
}

impl AddressKey {
    pub fn from_script(script: &Script) -> Self {
        let script_type = ScriptType::classify(script);
        let bytes = script.as_bytes();

        let hash: Option<&[u8]> = match script_type {
            ScriptType::P2pkh => Some(&bytes[3..23]),
            ScriptType::P2sh | ScriptType::P2wpkh => Some(&bytes[2..22]),
            ScriptType::P2wsh | ScriptType::P2tr => Some(&bytes[2..34]),
            _ => None,
        };

        let mut key = Vec::with_capacity(1 + hash.map_or(bytes.len(), <[u8]>::len));
        key.push(script_type.tag());

        let mut p2pk_script = None;
        match (script_type, hash) {
            (_, Some(hash)) => key.extend_from_slice(hash),
            (ScriptType::PubKey, None) => {
                // <pubkey> OP_CHECKSIG, with a one byte push prefix.
                let pubkey = &bytes[1..bytes.len() - 1];
                key.extend_from_slice(hash160::Hash::hash(pubkey).as_byte_array());
                p2pk_script = Some(bytes.to_vec());
            }
            (_, None) => key.extend_from_slice(bytes),
        }

        Self {
            script_type,
            key,
            p2pk_script,
        }
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Raw pay-to-pubkey script for the address → script map, if any.
    pub fn p2pk_script(&self) -> Option<&[u8]> {
        self.p2pk_script.as_deref()
    }

    pub fn into_parts(self) -> (Vec<u8>, Option<Vec<u8>>) {
        (self.key, self.p2pk_script)
    }
}
