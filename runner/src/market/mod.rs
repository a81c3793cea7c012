pub mod interval;
pub mod manager;
pub mod series;
pub mod venue;

pub use interval::Interval;
pub use manager::{ActiveSymbolProvider, KlineManager};
pub use series::{Series, SeriesCache};
pub use venue::{BinanceVenueAdapter, FetchCandlesParams, VenueAdapter, VenueError};
