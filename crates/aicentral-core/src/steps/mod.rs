mod bulkhead;
mod request_rate;
mod token_rate;

pub use bulkhead::BulkHeadStep;
pub use request_rate::RequestRateStep;
pub use token_rate::{TokenRateStep, TokenReservation};

use tokio::sync::OwnedSemaphorePermit;

use aicentral_endpoint_core::{CallDetails, GatewayError, UsageInformation};

/// How limiter state is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionMode {
    /// One counter/bucket per pipeline.
    #[default]
    PerPipeline,
    /// One per authenticated consumer; anonymous requests share the
    /// pipeline-wide partition.
    PerConsumer,
}

pub(crate) fn partition_key(mode: PartitionMode, details: &CallDetails) -> String {
    match mode {
        PartitionMode::PerPipeline => String::new(),
        PartitionMode::PerConsumer => details.consumer_id.clone().unwrap_or_default(),
    }
}

/// What a successful `admit` hands back, returned to the step at settle
/// time. Dropping a ticket releases bulk-head permits, so cancellation
/// between admit and settle can never leak capacity.
pub enum StepTicket {
    None,
    Permit(OwnedSemaphorePermit),
    Reservation(TokenReservation),
}

/// One pipeline limiter. Steps run `admit` in configured order on the way
/// down and `settle` in reverse order on the way back; a rejection from
/// `admit` short-circuits the chain with a 429.
pub enum Step {
    BulkHead(BulkHeadStep),
    RequestRate(RequestRateStep),
    TokenRate(TokenRateStep),
}

impl Step {
    pub async fn admit(&self, details: &CallDetails) -> Result<StepTicket, GatewayError> {
        match self {
            Step::BulkHead(step) => step.admit(details).await.map(StepTicket::Permit),
            Step::RequestRate(step) => step.admit(details).map(|_| StepTicket::None),
            Step::TokenRate(step) => step.admit(details).map(StepTicket::Reservation),
        }
    }

    /// Return-path hook with the request's usage. Bulk-head permits release
    /// on ticket drop; the token-rate step reconciles its reservation
    /// against the observed counts.
    pub fn settle(&self, ticket: StepTicket, usage: &UsageInformation) {
        if let (Step::TokenRate(step), StepTicket::Reservation(reservation)) = (self, ticket) {
            step.settle(reservation, usage);
        }
    }

    /// Undo an admission for a request that never dispatched (a later step
    /// rejected it). Reserved tokens are refunded; request-rate tokens stay
    /// consumed by design.
    pub fn abort(&self, ticket: StepTicket) {
        if let (Step::TokenRate(step), StepTicket::Reservation(reservation)) = (self, ticket) {
            step.refund(reservation);
        }
    }
}
