//! Sample order saga driven by the host.
//!
//! An order is submitted, a payment is requested, and the saga completes
//! once the payment gateway accepts it:
//!
//! ```text
//! Initial --OrderSubmitted--> AwaitingPayment --PaymentAccepted--> Confirmed --> Final
//! ```
//!
//! `PaymentAccepted` only carries the order number, so it is correlated by
//! querying stored instances instead of by id.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{ConsumeContext, Message};
use saga::{
    Activity, ActivityError, BehaviorContext, Correlation, SagaInstance, State, StateMachine, When,
};
use saga_store::{CorrelationId, SagaQuery};
use serde::{Deserialize, Serialize};

pub const AWAITING_PAYMENT: State = State::named("AwaitingPayment");
pub const CONFIRMED: State = State::named("Confirmed");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub correlation_id: CorrelationId,
    pub current_state: String,
    pub order_number: String,
    pub amount_cents: u64,
    pub transaction_id: Option<String>,
}

impl SagaInstance for OrderState {
    fn with_correlation_id(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            current_state: State::INITIAL.to_string(),
            order_number: String::new(),
            amount_cents: 0,
            transaction_id: None,
        }
    }

    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    fn current_state(&self) -> &str {
        &self.current_state
    }

    fn set_current_state(&mut self, state: &State) {
        self.current_state = state.to_string();
    }
}

#[derive(Debug, Clone)]
pub struct OrderSubmitted {
    pub order_id: CorrelationId,
    pub order_number: String,
    pub amount_cents: u64,
}
impl Message for OrderSubmitted {}

#[derive(Debug, Clone)]
pub struct PaymentRequested {
    pub order_id: CorrelationId,
    pub order_number: String,
    pub amount_cents: u64,
}
impl Message for PaymentRequested {}

#[derive(Debug, Clone)]
pub struct PaymentAccepted {
    pub order_number: String,
    pub transaction_id: String,
}
impl Message for PaymentAccepted {}

#[derive(Debug, Clone)]
pub struct OrderConfirmed {
    pub order_id: CorrelationId,
    pub order_number: String,
    pub transaction_id: String,
}
impl Message for OrderConfirmed {}

/// Rejects orders that cannot be charged.
struct ValidateOrder;

#[async_trait]
impl Activity<OrderState, OrderSubmitted> for ValidateOrder {
    fn name(&self) -> &str {
        "validate-order"
    }

    async fn execute(
        &self,
        context: &mut BehaviorContext<'_, OrderState, OrderSubmitted>,
    ) -> Result<(), ActivityError> {
        let order = context.message();
        if order.order_number.trim().is_empty() {
            return Err(ActivityError::new("order number is required"));
        }
        if order.amount_cents == 0 {
            return Err(ActivityError::new(format!(
                "order {} has no amount to charge",
                order.order_number
            )));
        }
        Ok(())
    }
}

/// Builds the order state machine.
pub fn order_machine() -> saga::Result<StateMachine<OrderState>> {
    StateMachine::builder("OrderSaga")
        .state(AWAITING_PAYMENT)
        .state(CONFIRMED)
        .event(
            "OrderSubmitted",
            Correlation::by_id(|m: &OrderSubmitted| Some(m.order_id)),
        )
        .event(
            "PaymentAccepted",
            Correlation::by_query(
                |m: &PaymentAccepted| {
                    Some(
                        SagaQuery::field_eq("order_number", m.order_number.clone())
                            .in_state(AWAITING_PAYMENT.as_str()),
                    )
                },
                |_| CorrelationId::new(),
            ),
        )
        .initially(
            When::<OrderState, OrderSubmitted>::new()
                .activity(Arc::new(ValidateOrder))
                .then(|order: &mut OrderState, m: &OrderSubmitted| {
                    order.order_number = m.order_number.clone();
                    order.amount_cents = m.amount_cents;
                })
                .publish(|order: &OrderState, _m: &OrderSubmitted| PaymentRequested {
                    order_id: order.correlation_id,
                    order_number: order.order_number.clone(),
                    amount_cents: order.amount_cents,
                })
                .transition_to(AWAITING_PAYMENT),
        )
        .during(
            AWAITING_PAYMENT,
            When::new()
                .then(|order: &mut OrderState, m: &PaymentAccepted| {
                    order.transaction_id = Some(m.transaction_id.clone());
                })
                .publish(|order: &OrderState, m: &PaymentAccepted| OrderConfirmed {
                    order_id: order.correlation_id,
                    order_number: order.order_number.clone(),
                    transaction_id: m.transaction_id.clone(),
                })
                .transition_to(CONFIRMED)
                .finalize(),
        )
        .set_completed_when_finalized()
        .build()
}

/// Stand-in payment gateway: accepts every requested payment.
pub async fn accept_payment(
    context: ConsumeContext<PaymentRequested>,
) -> Result<(), pipeline::BoxError> {
    let request = context.message();
    let transaction_id = format!("txn-{}", request.order_id);
    tracing::debug!(
        order_number = %request.order_number,
        amount_cents = request.amount_cents,
        %transaction_id,
        "payment accepted"
    );
    context
        .publish(PaymentAccepted {
            order_number: request.order_number.clone(),
            transaction_id,
        })
        .await?;
    Ok(())
}
