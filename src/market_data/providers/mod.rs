pub mod binance;
pub mod coincap;
pub mod coingecko;
pub mod cryptocompare;
pub mod mempool;

pub use binance::BinancePriceSource;
pub use coincap::CoinCapPriceSource;
pub use coingecko::CoinGeckoPriceSource;
pub use cryptocompare::CryptoComparePriceSource;
pub use mempool::MempoolPriceSource;
