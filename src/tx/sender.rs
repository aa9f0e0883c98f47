//! Transaction orchestration for workflow steps
//!
//! Every nonce-consuming action runs inside `with_nonce_session`, which pairs
//! session start with `end_session` on every exit path, panics included.
//! Submissions are never retried as a whole above this layer: once a nonce
//! may have been broadcast, replaying the step risks a double spend.

use super::context::{
    CallRequest, StepOutcome, TransactionContext, TransactionOutcome, WalletDirectory,
};
use super::gas::GasStrategy;
use super::nonce::{NonceSession, ValidationReport};
use super::signer::{broadcast, signed_tx_hash, TransactionSigner};
use crate::chain::ChainRpc;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::registry::CoordinatorRegistry;

use async_trait::async_trait;
use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{AbiParser, Function, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, H256, U256, U64};
use futures::FutureExt;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Upper bound on waiting for a receipt after broadcast
    pub inclusion_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            inclusion_timeout_secs: 300,
            receipt_poll_interval_ms: 2_000,
        }
    }
}

/// Work performed while holding a nonce session
#[async_trait]
pub trait SessionBody<T>: Send {
    async fn run(
        self,
        session: &mut NonceSession,
        report: &ValidationReport,
    ) -> CoordinatorResult<T>;
}

/// Standard body: price, sign, record, send and await one call
struct SubmitTransaction<'a> {
    orchestrator: &'a TransactionOrchestrator,
    signer: &'a dyn TransactionSigner,
    provider: &'a dyn ChainRpc,
    context: &'a TransactionContext,
    request: CallRequest,
}

#[async_trait]
impl<'a> SessionBody<TransactionOutcome> for SubmitTransaction<'a> {
    async fn run(
        self,
        session: &mut NonceSession,
        report: &ValidationReport,
    ) -> CoordinatorResult<TransactionOutcome> {
        self.orchestrator
            .submit_transaction(
                session,
                report,
                self.signer,
                self.provider,
                self.request,
                self.context,
            )
            .await
    }
}

/// Façade used by workflow steps to submit transactions
pub struct TransactionOrchestrator {
    registry: Arc<CoordinatorRegistry>,
    directory: Arc<dyn WalletDirectory>,
    gas: Arc<GasStrategy>,
    config: SubmissionConfig,
}

impl TransactionOrchestrator {
    pub fn new(
        registry: Arc<CoordinatorRegistry>,
        directory: Arc<dyn WalletDirectory>,
        gas: Arc<GasStrategy>,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            gas,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<CoordinatorRegistry> {
        &self.registry
    }

    /// Send native currency
    pub async fn transfer_native(
        &self,
        context: &TransactionContext,
        to: &str,
        amount_wei: &str,
    ) -> StepOutcome<TransactionOutcome> {
        let result = async {
            let request = CallRequest {
                to: parse_address("recipient", to)?,
                value: parse_amount(amount_wei)?,
                ..CallRequest::default()
            };
            self.submit(context, request).await
        }
        .await;

        self.finish("transfer_native", context, result)
    }

    /// ERC-20 `transfer(address,uint256)`
    pub async fn transfer_token(
        &self,
        context: &TransactionContext,
        token: &str,
        to: &str,
        amount: &str,
    ) -> StepOutcome<TransactionOutcome> {
        let result = async {
            let token = parse_address("token", token)?;
            let to = parse_address("recipient", to)?;
            let amount = parse_amount(amount)?;

            let function = parse_function("transfer(address,uint256)")?;
            let data = function
                .encode_input(&[Token::Address(to), Token::Uint(amount)])
                .map_err(|e| CoordinatorError::Validation(e.to_string()))?;

            let request = CallRequest {
                to: token,
                data: Bytes::from(data),
                ..CallRequest::default()
            };
            self.submit(context, request).await
        }
        .await;

        self.finish("transfer_token", context, result)
    }

    /// Call an arbitrary contract function given its human-readable signature
    pub async fn call_contract(
        &self,
        context: &TransactionContext,
        contract: &str,
        function_signature: &str,
        args: &[String],
        value_wei: Option<&str>,
    ) -> StepOutcome<TransactionOutcome> {
        let result = async {
            let contract = parse_address("contract", contract)?;
            let function = parse_function(function_signature)?;
            let data = encode_call(&function, args)?;
            let value = match value_wei {
                Some(v) if !v.trim().is_empty() => parse_value(v)?,
                _ => U256::zero(),
            };

            let request = CallRequest {
                to: contract,
                data,
                value,
                ..CallRequest::default()
            };
            self.submit(context, request).await
        }
        .await;

        self.finish("call_contract", context, result)
    }

    /// Run `body` with an exclusive nonce session for (wallet, chain)
    ///
    /// `end_session` runs exactly once whether `body` succeeds, fails or
    /// panics; a panic resumes after the session has ended.
    pub async fn with_nonce_session<T, B>(
        &self,
        context: &TransactionContext,
        wallet_address: &str,
        body: B,
    ) -> CoordinatorResult<T>
    where
        B: SessionBody<T>,
        T: Send,
    {
        let provider = self.registry.provider_for(context)?;
        let coordinator = self.registry.nonce_coordinator();

        let (mut session, report) = coordinator
            .start_session(
                wallet_address,
                context.chain_id,
                &context.execution_id,
                provider.as_ref(),
            )
            .await?;

        let outcome = AssertUnwindSafe(body.run(&mut session, &report))
            .catch_unwind()
            .await;

        let ended = coordinator.end_session(session).await;

        match outcome {
            Ok(result) => {
                if let Err(e) = ended {
                    error!(
                        "Failed to end nonce session for execution {}: {}",
                        context.execution_id, e
                    );
                }
                result
            }
            Err(panic) => {
                if let Err(e) = ended {
                    error!("Failed to end nonce session after panic: {}", e);
                }
                error!(
                    "Session body panicked for execution {}",
                    context.execution_id
                );
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Nonce, price, sign, record, send and wait for one call
    pub async fn submit_transaction(
        &self,
        session: &mut NonceSession,
        report: &ValidationReport,
        signer: &dyn TransactionSigner,
        provider: &dyn ChainRpc,
        request: CallRequest,
        context: &TransactionContext,
    ) -> CoordinatorResult<TransactionOutcome> {
        let coordinator = self.registry.nonce_coordinator();
        let chain_id = context.chain_id;
        let nonce = coordinator.get_next_nonce(session);

        let mut tx = Eip1559TransactionRequest::new()
            .from(session.address())
            .to(request.to)
            .value(request.value)
            .data(request.data.clone())
            .nonce(nonce)
            .chain_id(chain_id);

        let estimated_gas = provider
            .estimate_gas(&TypedTransaction::Eip1559(tx.clone()))
            .await?;

        let gas = self
            .gas
            .get_gas_config(
                provider,
                context.trigger_type,
                estimated_gas,
                chain_id,
                request.gas_multiplier_override,
                request.gas_limit_override,
            )
            .await?;

        tx = tx
            .gas(gas.gas_limit)
            .max_fee_per_gas(gas.max_fee_per_gas)
            .max_priority_fee_per_gas(gas.max_priority_fee_per_gas);

        let raw = signer.sign_transaction(tx.into()).await?;
        let tx_hash = signed_tx_hash(&raw);

        // Recorded before the broadcast: if the send outcome is lost, the next
        // session still reconciles this nonce against the chain.
        coordinator
            .record_transaction(
                session,
                nonce,
                tx_hash,
                context.workflow_id.as_deref(),
                Some(gas.max_fee_per_gas),
            )
            .await?;

        if let Err(e) = broadcast(provider, raw).await {
            crate::metrics::record_tx_failed(chain_id, "broadcast");
            return Err(e);
        }
        info!(
            "Submitted {:?} from {} at nonce {} on chain {} ({:?})",
            tx_hash,
            session.wallet_address(),
            nonce,
            chain_id,
            gas.strategy
        );
        crate::metrics::record_tx_submitted(chain_id);

        let receipt = wait_for_inclusion(provider, tx_hash, &self.config).await?;
        coordinator.confirm_transaction(tx_hash).await?;

        if receipt.status == Some(U64::zero()) {
            crate::metrics::record_tx_failed(chain_id, "reverted");
            return Err(CoordinatorError::Reverted {
                chain_id,
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        crate::metrics::record_tx_confirmed(chain_id);
        Ok(TransactionOutcome {
            tx_hash: format!("{:?}", tx_hash),
            nonce,
            chain_id,
            block_number: receipt.block_number.map(|n| n.as_u64()),
            gas_used: receipt.gas_used.map(|g| g.to_string()),
            strategy: gas.strategy,
            volatility_warning: gas.volatility_warning,
            warnings: report.warnings.clone(),
        })
    }

    async fn submit(
        &self,
        context: &TransactionContext,
        request: CallRequest,
    ) -> CoordinatorResult<TransactionOutcome> {
        let signer = self.resolve_signer(context).await?;
        let provider = self.registry.provider_for(context)?;
        let wallet_address = format!("{:?}", signer.address());

        let body = SubmitTransaction {
            orchestrator: self,
            signer: signer.as_ref(),
            provider: provider.as_ref(),
            context,
            request,
        };

        self.with_nonce_session(context, &wallet_address, body).await
    }

    async fn resolve_signer(
        &self,
        context: &TransactionContext,
    ) -> CoordinatorResult<Arc<dyn TransactionSigner>> {
        self.directory
            .signer_for(&context.organization_id)
            .await?
            .ok_or_else(|| {
                CoordinatorError::ContextResolution(format!(
                    "No wallet configured for organization {}",
                    context.organization_id
                ))
            })
    }

    fn finish(
        &self,
        action: &str,
        context: &TransactionContext,
        result: CoordinatorResult<TransactionOutcome>,
    ) -> StepOutcome<TransactionOutcome> {
        match &result {
            Ok(outcome) => debug!(
                "{} for execution {} confirmed as {}",
                action, context.execution_id, outcome.tx_hash
            ),
            Err(e) if e.is_system_error() => error!(
                "{} failed for execution {} on chain {}: {}",
                action, context.execution_id, context.chain_id, e
            ),
            Err(e) => warn!(
                "{} rejected for execution {}: {}",
                action, context.execution_id, e
            ),
        }

        result.into()
    }
}

/// Poll for a receipt until one exists or the inclusion timeout passes
pub async fn wait_for_inclusion(
    provider: &dyn ChainRpc,
    tx_hash: H256,
    config: &SubmissionConfig,
) -> CoordinatorResult<TransactionReceipt> {
    let limit = Duration::from_secs(config.inclusion_timeout_secs);
    let poll_interval = Duration::from_millis(config.receipt_poll_interval_ms);

    match tokio::time::timeout(limit, poll_receipt(provider, tx_hash, poll_interval)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "{:?} not included after {}s; leaving it pending for reconciliation",
                tx_hash, config.inclusion_timeout_secs
            );
            Err(CoordinatorError::Timeout {
                operation: format!("inclusion of {:?}", tx_hash),
            })
        }
    }
}

async fn poll_receipt(
    provider: &dyn ChainRpc,
    tx_hash: H256,
    poll_interval: Duration,
) -> CoordinatorResult<TransactionReceipt> {
    loop {
        if let Some(receipt) = provider.get_transaction_receipt(tx_hash).await? {
            return Ok(receipt);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

fn parse_address(field: &str, value: &str) -> CoordinatorResult<Address> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|_| CoordinatorError::Validation(format!("Invalid {} address: {}", field, value)))
}

/// Strictly positive decimal amount
fn parse_amount(value: &str) -> CoordinatorResult<U256> {
    let amount = parse_value(value)?;
    if amount.is_zero() {
        return Err(CoordinatorError::Validation(
            "Amount must be greater than zero".to_string(),
        ));
    }
    Ok(amount)
}

fn parse_value(value: &str) -> CoordinatorResult<U256> {
    U256::from_dec_str(value.trim())
        .map_err(|_| CoordinatorError::Validation(format!("Invalid amount: {}", value)))
}

fn parse_function(signature: &str) -> CoordinatorResult<Function> {
    let signature = signature.trim();
    let declaration = if signature.starts_with("function ") {
        signature.to_string()
    } else {
        format!("function {}", signature)
    };

    AbiParser::default()
        .parse_function(&declaration)
        .map_err(|e| {
            CoordinatorError::Validation(format!("Invalid function signature {}: {}", signature, e))
        })
}

fn encode_call(function: &Function, args: &[String]) -> CoordinatorResult<Bytes> {
    if args.len() != function.inputs.len() {
        return Err(CoordinatorError::Validation(format!(
            "{} expects {} arguments, got {}",
            function.name,
            function.inputs.len(),
            args.len()
        )));
    }

    let tokens = function
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            LenientTokenizer::tokenize(&param.kind, arg).map_err(|e| {
                CoordinatorError::Validation(format!(
                    "Invalid value for {} ({}): {}",
                    param.name, param.kind, e
                ))
            })
        })
        .collect::<CoordinatorResult<Vec<_>>>()?;

    function
        .encode_input(&tokens)
        .map(Bytes::from)
        .map_err(|e| CoordinatorError::Validation(e.to_string()))
}
