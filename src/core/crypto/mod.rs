pub mod cipher;
pub mod keypair;
pub mod sealed;

pub use cipher::{SessionKey, decrypt, decrypt_text, encrypt, open_json, seal_json};
pub use keypair::{OracleKeypair, RecoverableSignature};
pub use sealed::seal_session_key;
