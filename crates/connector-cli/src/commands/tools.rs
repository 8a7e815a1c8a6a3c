use crate::cli::{Error, Result};
use crate::commands::parse_outpoint;
use bitcoin::ScriptBuf;
use connector_primitives::{AddressKey, Pointer, key_to_outpoint, outpoint_to_key};

/// Utilities
#[derive(Debug, clap::Subcommand)]
pub enum Tools {
    /// Print the store key of an outpoint given as `txid:vout`, or the
    /// outpoint of a hex encoded key.
    #[command(name = "outpoint-key")]
    OutpointKey {
        #[arg(index = 1)]
        input: String,
    },

    /// Split a stored pointer into height, transaction index and output index.
    #[command(name = "decode-pointer")]
    DecodePointer {
        #[arg(index = 1)]
        pointer: i64,
    },

    /// Print the address key of a hex encoded scriptPubkey.
    #[command(name = "address-key")]
    AddressKey {
        #[arg(index = 1)]
        script: String,
    },
}

fn decode_hex(input: &str) -> Result<Vec<u8>> {
    let input = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(input).map_err(|err| Error::Input(format!("Invalid hex: {err}")))
}

fn describe_pointer(raw: i64) -> Result<String> {
    let pointer =
        Pointer::try_from(raw).map_err(|err| Error::Input(format!("Invalid pointer: {err}")))?;
    Ok(format!(
        "height={} tx_index={} index={} {}",
        pointer.height(),
        pointer.tx_index(),
        pointer.index(),
        if pointer.is_output() { "output" } else { "input" },
    ))
}

impl Tools {
    pub fn run(self) -> Result<()> {
        match self {
            Self::OutpointKey { input } => {
                if input.contains(':') {
                    let outpoint = parse_outpoint(&input)?;
                    println!("{}", hex::encode(outpoint_to_key(&outpoint)));
                } else {
                    let outpoint = key_to_outpoint(&decode_hex(&input)?)
                        .map_err(|err| Error::Input(format!("Invalid key: {err}")))?;
                    println!("{outpoint}");
                }
            }
            Self::DecodePointer { pointer } => {
                println!("{}", describe_pointer(pointer)?);
            }
            Self::AddressKey { script } => {
                let script = ScriptBuf::from_bytes(decode_hex(&script)?);
                let key = AddressKey::from_script(&script);
                println!("{:?} {}", key.script_type(), hex::encode(key.as_bytes()));
            }
        }
        Ok(())
    }
}
