mod fetcher_impls;
mod fetcher_traits;
mod maintenance;
mod scan_jobs;
mod tracker;

pub use fetcher_traits::{ChainData, PositionsPager, TradeFetch};
pub use maintenance::*;
pub use scan_jobs::*;
pub use tracker::JobTracker;
