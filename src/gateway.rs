//! Execution gateway seam
//!
//! The core only ever hands `OrderIntent`s to the gateway and learns about
//! fills from the reports it drains at the start of the next bar.

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::{ExecutionReport, ExecutionStatus, OrderId, OrderIntent};

pub trait ExecutionGateway {
    /// Accept an intent for execution. Errors map to `OrderRejected`.
    fn submit(&mut self, intent: &OrderIntent) -> CoreResult<OrderId>;

    /// Reports that arrived since the last drain
    fn drain_reports(&mut self) -> Vec<ExecutionReport>;
}

/// Simulated venue: every accepted intent fills in full at its limit price
/// on the next drain.
#[derive(Debug, Default)]
pub struct PaperGateway {
    next_id: OrderId,
    queued: Vec<(OrderId, OrderIntent)>,
    reject_reason: Option<String>,
    submitted: usize,
    filled: usize,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway that accepts intents but rejects each one on drain
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted
    }

    pub fn filled_count(&self) -> usize {
        self.filled
    }
}

impl ExecutionGateway for PaperGateway {
    fn submit(&mut self, intent: &OrderIntent) -> CoreResult<OrderId> {
        if intent.limit_price.is_none() {
            return Err(CoreError::OrderRejected {
                symbol: intent.symbol.to_string(),
                reason: "paper gateway requires a limit price".into(),
            });
        }
        self.next_id += 1;
        self.submitted += 1;
        self.queued.push((self.next_id, intent.clone()));
        debug!(order_id = self.next_id, symbol = %intent.symbol, quantity = intent.quantity, "paper order queued");
        Ok(self.next_id)
    }

    fn drain_reports(&mut self) -> Vec<ExecutionReport> {
        let queued = std::mem::take(&mut self.queued);
        queued
            .into_iter()
            .map(|(order_id, intent)| match &self.reject_reason {
                Some(reason) => ExecutionReport {
                    order_id,
                    instrument: intent.instrument,
                    status: ExecutionStatus::Rejected,
                    filled_quantity: 0.0,
                    fill_price: 0.0,
                    message: Some(reason.clone()),
                },
                None => {
                    self.filled += 1;
                    ExecutionReport {
                        order_id,
                        instrument: intent.instrument,
                        status: ExecutionStatus::Filled,
                        filled_quantity: intent.quantity,
                        fill_price: intent.limit_price.unwrap_or_default(),
                        message: None,
                    }
                }
            })
            .collect()
    }
}
