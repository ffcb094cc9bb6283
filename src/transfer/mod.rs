pub mod driver;
pub mod parser;
pub mod progress;

pub use driver::{classify_exit, exit_code_meaning, ExitClass, RsyncDriver, TransferPlan};
pub use progress::ProgressHandle;
