use crate::exchange::ProcessingError;
use crate::status::ExchangeState;
use uuid::Uuid;

/// Typed, process-scoped properties of an exchange.
///
/// These are the keys the engine itself reads and writes. Anything else goes
/// into [`Exchange::extensions`](crate::exchange::Exchange::extensions).
#[derive(Debug, Clone, Default)]
pub struct ExchangeProperties {
    state: ExchangeState,
    redelivery_counter: u32,
    split_index: Option<usize>,
    split_size: Option<usize>,
    split_complete: bool,
    correlation_id: Option<Uuid>,
    caught_exception: Option<ProcessingError>,
}

impl ExchangeProperties {
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut ExchangeState {
        &mut self.state
    }

    pub fn redelivery_counter(&self) -> u32 {
        self.redelivery_counter
    }

    pub fn set_redelivery_counter(&mut self, counter: u32) {
        self.redelivery_counter = counter;
    }

    pub fn split_index(&self) -> Option<usize> {
        self.split_index
    }

    pub fn set_split_index(&mut self, index: Option<usize>) {
        self.split_index = index;
    }

    pub fn split_size(&self) -> Option<usize> {
        self.split_size
    }

    pub fn set_split_size(&mut self, size: Option<usize>) {
        self.split_size = size;
    }

    pub fn split_complete(&self) -> bool {
        self.split_complete
    }

    pub fn set_split_complete(&mut self, complete: bool) {
        self.split_complete = complete;
    }

    /// Id of the exchange this one was derived from.
    pub fn correlation_id(&self) -> Option<&Uuid> {
        self.correlation_id.as_ref()
    }

    pub fn set_correlation_id(&mut self, id: Uuid) {
        self.correlation_id = Some(id);
    }

    /// The exception an error handler took off the exchange before handing it
    /// to a failure processor.
    pub fn caught_exception(&self) -> Option<&ProcessingError> {
        self.caught_exception.as_ref()
    }

    pub fn set_caught_exception(&mut self, exception: Option<ProcessingError>) {
        self.caught_exception = exception;
    }
}
