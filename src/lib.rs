#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating most pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts around timestamps, counters and batch sizes
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod errors;
pub mod limiter;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod senders;
pub mod store;
pub(crate) mod utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
