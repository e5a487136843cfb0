//! Fee bidding per chain and attempt.
//!
//! All fees are gwei. Every priority-fee computation is rounded to 2 dp,
//! half away from zero, before the next step builds on it.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::chain::FeeData;
use crate::config::GasConfig;
use crate::types::{ChainId, ErrorKind, ExecError, GasQuote, Urgency};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GasError {
    #[error("Cumulative escalation {cumulative_pct}% would exceed cap of {max_pct}%")]
    EscalationCapExceeded {
        cumulative_pct: Decimal,
        max_pct: Decimal,
    },

    #[error("Max fee {max_fee} gwei exceeds chain {chain_id} ceiling of {ceiling} gwei")]
    CeilingExceeded {
        chain_id: ChainId,
        max_fee: Decimal,
        ceiling: Decimal,
    },

    #[error("Invalid fee data for chain {chain_id}: {reason}")]
    InvalidFeeData { chain_id: ChainId, reason: String },
}

impl From<GasError> for ExecError {
    fn from(e: GasError) -> Self {
        match e {
            GasError::InvalidFeeData { .. } => ExecError::Transient(e.to_string()),
            _ => ExecError::GasCeilingExceeded(e.to_string()),
        }
    }
}

fn round_fee(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub struct GasOptimizer {
    config: GasConfig,
}

impl GasOptimizer {
    pub fn new(config: GasConfig) -> Self {
        Self { config }
    }

    /// Initial bid from live fee data.
    pub fn quote(
        &self,
        chain_id: ChainId,
        urgency: Urgency,
        fees: &FeeData,
    ) -> Result<GasQuote, GasError> {
        if fees.base_fee.is_sign_negative() || fees.suggested_priority.is_sign_negative() {
            return Err(GasError::InvalidFeeData {
                chain_id,
                reason: format!(
                    "negative fee (base {}, priority {})",
                    fees.base_fee, fees.suggested_priority
                ),
            });
        }

        let chain = self.config.chain(chain_id);
        let scaled = fees.suggested_priority * self.config.urgency.for_urgency(urgency);
        let priority_fee = round_fee(scaled.max(chain.min_priority_fee));
        let max_fee_per_gas = fees.base_fee * chain.base_fee_multiplier + priority_fee;

        if max_fee_per_gas > chain.max_fee_per_gas {
            warn!(
                chain = chain_id,
                max_fee = %max_fee_per_gas,
                ceiling = %chain.max_fee_per_gas,
                "Initial gas quote above chain ceiling"
            );
            return Err(GasError::CeilingExceeded {
                chain_id,
                max_fee: max_fee_per_gas,
                ceiling: chain.max_fee_per_gas,
            });
        }

        let quote = GasQuote {
            chain_id,
            urgency,
            base_fee: fees.base_fee,
            priority_fee,
            escalation_step: 0,
            cumulative_escalation_pct: Decimal::ZERO,
            ceiling: chain.max_fee_per_gas,
            max_fee_per_gas,
        };
        debug!(quote = %quote, "Gas quoted");
        Ok(quote)
    }

    /// Step percentage applied for a failure of the given kind.
    pub fn escalation_pct(&self, reason: ErrorKind) -> Decimal {
        match reason {
            ErrorKind::MempoolDrop => self.config.mempool_drop_escalation_pct,
            _ => self.config.standard_escalation_pct,
        }
    }

    /// Raise the previous bid for the next attempt.
    pub fn escalate(
        &self,
        previous: &GasQuote,
        attempt_number: u32,
        reason: ErrorKind,
    ) -> Result<GasQuote, GasError> {
        let step = self.escalation_pct(reason);
        let hundred = dec!(100);

        let factor = (hundred + previous.cumulative_escalation_pct) / hundred
            * (hundred + step)
            / hundred;
        let cumulative_pct = (factor - Decimal::ONE) * hundred;
        if cumulative_pct > self.config.max_escalation_pct {
            warn!(
                chain = previous.chain_id,
                cumulative_pct = %cumulative_pct,
                max_pct = %self.config.max_escalation_pct,
                "Gas escalation cap reached"
            );
            return Err(GasError::EscalationCapExceeded {
                cumulative_pct,
                max_pct: self.config.max_escalation_pct,
            });
        }

        let chain = self.config.chain(previous.chain_id);
        let priority_fee = round_fee(previous.priority_fee * (hundred + step) / hundred);
        let max_fee_per_gas = previous.base_fee * chain.base_fee_multiplier + priority_fee;
        if max_fee_per_gas > previous.ceiling {
            warn!(
                chain = previous.chain_id,
                max_fee = %max_fee_per_gas,
                ceiling = %previous.ceiling,
                "Escalated gas bid above chain ceiling"
            );
            return Err(GasError::CeilingExceeded {
                chain_id: previous.chain_id,
                max_fee: max_fee_per_gas,
                ceiling: previous.ceiling,
            });
        }

        let quote = GasQuote {
            priority_fee,
            max_fee_per_gas,
            escalation_step: attempt_number,
            cumulative_escalation_pct: cumulative_pct,
            ..previous.clone()
        };
        debug!(quote = %quote, reason = %reason, "Gas escalated");
        Ok(quote)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
