pub mod near_chain;
pub mod near_ft;
pub mod paper;
pub mod traits;

pub use near_chain::{FunctionCall, NearChain, TxSigner};
pub use near_ft::{view_function, FtBalanceReader};
pub use paper::{PaperChain, PaperOp};
pub use traits::{
    AdapterResult, ChainAdapter, PostActionExecutor, PostActionRequest, PostActionResult, Quote,
    QuoteSource, TxResult,
};

#[cfg(test)]
pub use near_chain::MockTxSigner;
#[cfg(test)]
pub use traits::MockPostActionExecutor;
