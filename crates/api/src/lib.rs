//! External API clients for the liquidation bot.
//!
//! Currently a single client: the 1inch-style swap API used to turn seized
//! collateral into the repayment asset.

mod oneinch;

pub use oneinch::{
    decode_min_return, ApproveTransaction, SwapError, SwapQuote, SwapQuoteClient, SwapTransaction,
    MIN_RETURN_RANGE, SWAP_API_VERSION,
};
