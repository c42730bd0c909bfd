//! Run bookkeeping and the admission loop that drives items through a worker.

pub mod dispatcher;
pub mod state;
