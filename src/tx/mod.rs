//! Transaction submission: nonce coordination, gas pricing and orchestration

pub mod context;
pub mod gas;
pub mod nonce;
pub mod sender;
pub mod signer;

pub use context::{
    CallRequest, StaticWalletDirectory, StepOutcome, TransactionContext, TransactionOutcome,
    TriggerType, WalletDirectory,
};
pub use gas::{GasConfig, GasStrategy, GasStrategyConfig, PricingStrategy};
pub use nonce::{NonceConfig, NonceCoordinator, NonceSession, ValidationReport};
pub use sender::{wait_for_inclusion, SessionBody, SubmissionConfig, TransactionOrchestrator};
pub use signer::{broadcast, signed_tx_hash, LocalWalletSigner, TransactionSigner};
