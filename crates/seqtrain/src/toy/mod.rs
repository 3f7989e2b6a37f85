//! Small reference collaborators.
//!
//! Enough to run the training loop end to end without an external tensor
//! runtime:
//! - `SyntheticCorpus` - Deterministic copy-task batches
//! - `BigramDecoder` - One-hot decoder states feeding a trainable generator
//! - `GeneratorLoss` - Scaled cross entropy with analytic gradients
//! - `Sgd` - Plain gradient descent with optional clipping
//! - `TokenF1` - Token-overlap F1 reward

mod corpus;
mod decoder;
mod loss;
mod reward;
mod sgd;

pub use corpus::{CorpusConfig, SyntheticCorpus};
pub use decoder::BigramDecoder;
pub use loss::GeneratorLoss;
pub use reward::TokenF1;
pub use sgd::Sgd;

use crate::batch::TokenId;

pub const UNK: TokenId = 0;
pub const PAD: TokenId = 1;
pub const BOS: TokenId = 2;
pub const EOS: TokenId = 3;
/// First id of the ordinary vocabulary.
pub const FIRST_WORD: TokenId = 4;

/// Surface form of `id`.
pub fn token_text(id: TokenId) -> String {
    match id {
        UNK => "<unk>".to_string(),
        PAD => "<blank>".to_string(),
        BOS => "<s>".to_string(),
        EOS => "</s>".to_string(),
        id => format!("w{}", id),
    }
}

/// Surface forms of the ordinary words in `ids`, stopping at the end token.
pub fn words(ids: impl IntoIterator<Item = TokenId>) -> Vec<String> {
    ids.into_iter()
        .take_while(|&id| id != EOS)
        .filter(|&id| id >= FIRST_WORD)
        .map(token_text)
        .collect()
}
